//! # Types, Metadata and Items
//!
//! Everything that flows through the engine is an [`Item`]: a shared, immutable
//! domain object that can be asked for its runtime type ([`TypeTag`]) and for
//! named attributes. Lists, filters, the router and the tree engine only ever
//! see items through the [`ListItem`] trait.
//!
//! Runtime class relationships are resolved once, when the [`TypeRegistry`] is
//! built from configuration: each type's ancestor chain is precomputed so that
//! routing never walks a parent chain while events are being dispatched.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Separator used when a key is composed from several attributes.
pub const KEY_SEPARATOR: &str = "|";

/// Class tag of the once-per-second clock pulse.
pub const CLOCK_PULSE: &str = "ClockPulse";

/// Class tag of flattened tree rows.
pub const TREE_NODE: &str = "TreeNode";

/// An interned type name. Cloning is a reference-count bump.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(Arc<str>);

impl TypeTag {
    /// Creates a tag for the given type name.
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// The type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TypeTag {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl Serialize for TypeTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TypeTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(TypeTag::from)
    }
}

/// # Type Metadata
///
/// What the engine needs to know about a class: where it sits in the
/// hierarchy, which attributes form its key, and which attribute is shown as
/// its display text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// The type name.
    pub name: TypeTag,
    /// Optional parent type.
    #[serde(default)]
    pub parent: Option<TypeTag>,
    /// Attributes concatenated (with [`KEY_SEPARATOR`]) to form the item key.
    #[serde(default)]
    pub key_attributes: Vec<String>,
    /// Attribute used as display text.
    #[serde(default)]
    pub text_attribute: Option<String>,
    /// Map-keyed (non reference data) types never take part in superclass
    /// propagation.
    #[serde(default)]
    pub map_keyed: bool,
}

impl TypeMeta {
    /// Metadata for a root type keyed by a single attribute.
    pub fn new(name: &str, key_attribute: &str) -> Self {
        Self {
            name: TypeTag::new(name),
            parent: None,
            key_attributes: vec![key_attribute.to_string()],
            text_attribute: None,
            map_keyed: false,
        }
    }

    /// Sets the parent type.
    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(TypeTag::new(parent));
        self
    }

    /// Sets the display text attribute.
    pub fn with_text(mut self, attribute: &str) -> Self {
        self.text_attribute = Some(attribute.to_string());
        self
    }
}

/// Errors raised while building the [`TypeRegistry`].
#[derive(Debug, Error, PartialEq)]
pub enum TypeError {
    /// The same type name was declared twice.
    #[error("type {0} declared more than once")]
    Duplicate(TypeTag),
    /// A type names a parent that is not declared.
    #[error("type {child} names unknown parent {parent}")]
    UnknownParent {
        /// The declaring type.
        child: TypeTag,
        /// The missing parent.
        parent: TypeTag,
    },
    /// The parent chain loops back on itself.
    #[error("type hierarchy cycle through {0}")]
    Cycle(TypeTag),
}

/// # Type Registry
///
/// Immutable table of [`TypeMeta`] with every type's ancestor chain computed
/// at construction (nearest ancestor first).
#[derive(Debug, Default)]
pub struct TypeRegistry {
    metas: HashMap<TypeTag, TypeMeta>,
    ancestors: HashMap<TypeTag, Vec<TypeTag>>,
}

impl TypeRegistry {
    /// Builds the registry, validating parents and rejecting cycles.
    pub fn new(metas: Vec<TypeMeta>) -> Result<Self, TypeError> {
        let mut by_name: HashMap<TypeTag, TypeMeta> = HashMap::with_capacity(metas.len());
        for meta in metas {
            let name = meta.name.clone();
            if by_name.insert(name.clone(), meta).is_some() {
                return Err(TypeError::Duplicate(name));
            }
        }

        let mut ancestors = HashMap::with_capacity(by_name.len());
        for (name, meta) in &by_name {
            let mut chain = Vec::new();
            let mut seen = HashSet::new();
            seen.insert(name.clone());
            let mut next = meta.parent.clone();
            while let Some(parent) = next {
                let parent_meta = by_name.get(&parent).ok_or_else(|| TypeError::UnknownParent {
                    child: name.clone(),
                    parent: parent.clone(),
                })?;
                if !seen.insert(parent.clone()) {
                    return Err(TypeError::Cycle(name.clone()));
                }
                chain.push(parent);
                next = parent_meta.parent.clone();
            }
            ancestors.insert(name.clone(), chain);
        }

        Ok(Self {
            metas: by_name,
            ancestors,
        })
    }

    /// Metadata for a type, if declared.
    pub fn meta(&self, tag: &TypeTag) -> Option<&TypeMeta> {
        self.metas.get(tag)
    }

    /// Whether the type is declared.
    pub fn contains(&self, tag: &TypeTag) -> bool {
        self.metas.contains_key(tag)
    }

    /// Ancestors of `tag`, nearest first. Unknown types have none.
    pub fn ancestors(&self, tag: &TypeTag) -> &[TypeTag] {
        self.ancestors.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `tag` is `ancestor` or one of its descendants.
    pub fn is_a(&self, tag: &TypeTag, ancestor: &TypeTag) -> bool {
        tag == ancestor || self.ancestors(tag).contains(ancestor)
    }

    /// All declared types.
    pub fn types(&self) -> impl Iterator<Item = &TypeMeta> {
        self.metas.values()
    }
}

/// Anything that can live in a [`crate::core::list::DataList`].
pub trait ListItem: Send + Sync + fmt::Debug {
    /// Runtime class of the item.
    fn type_tag(&self) -> &TypeTag;
    /// Named attribute lookup. `None` when absent.
    fn attribute(&self, name: &str) -> Option<Value>;
}

/// Shared handle to a list item.
pub type Item = Arc<dyn ListItem>;

/// # Record
///
/// The stock domain object: a type tag plus a JSON object of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Runtime class.
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    /// Attribute values.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// An empty record of the given type.
    pub fn new(type_name: &str) -> Self {
        Self {
            type_tag: TypeTag::new(type_name),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Wraps the record into a shared [`Item`].
    pub fn into_item(self) -> Item {
        Arc::new(self)
    }
}

impl ListItem for Record {
    fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }
}

/// Renders an attribute value the way keys and indexes see it.
/// `null` has no string form and is never indexed.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// The item's attribute rendered as a string, if present and non-null.
pub fn attribute_string(item: &dyn ListItem, name: &str) -> Option<String> {
    item.attribute(name).as_ref().and_then(value_to_string)
}

/// Composes the key of `item` from `key_attributes`. Any missing attribute
/// makes the item un-keyable.
pub fn key_of(item: &dyn ListItem, key_attributes: &[String]) -> Option<String> {
    if key_attributes.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(key_attributes.len());
    for attribute in key_attributes {
        parts.push(attribute_string(item, attribute)?);
    }
    Some(parts.join(KEY_SEPARATOR))
}
