//! Declarative tree shapes.
//!
//! A tree is a list of root mappings. Each mapping is either a folder (a fixed
//! pseudo-item with its own child mappings) or a source (one node per item of
//! a data source, optionally filtered with `../attr` references to the parent
//! node's item). A source may recurse into itself through a second filter,
//! which is how single-list parent/child hierarchies are expressed.

use serde::{Deserialize, Serialize};

use crate::core::tree::TreeError;
use crate::core::types::TypeTag;

/// Substitutes a node's displayed item with one looked up by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDef {
    /// Attribute of the source item holding the target key.
    pub key_attribute: String,
    /// Data source the target is looked up in.
    pub data_source: String,
    /// Required type of the target.
    #[serde(default)]
    pub expected_type: Option<TypeTag>,
}

/// One child mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "camelCase")]
pub enum NodeDef {
    /// A fixed folder node.
    Folder {
        /// Folder key.
        name: String,
        /// Display text; the name when absent.
        #[serde(default)]
        text: Option<String>,
        /// Mappings shown when the folder is expanded.
        #[serde(default)]
        children: Vec<NodeDef>,
    },
    /// One node per item of a data source.
    #[serde(rename_all = "camelCase")]
    Source {
        /// Data source id.
        data_source: String,
        /// Filter expression, may use `../attr`.
        #[serde(default)]
        filter: Option<String>,
        /// Sort expression.
        #[serde(default)]
        sort: Option<String>,
        /// Displayed item substitution.
        #[serde(default)]
        link: Option<LinkDef>,
        /// Filter under which the same source repeats below each node.
        #[serde(default)]
        recursive: Option<String>,
        /// Mappings shown when a node is expanded.
        #[serde(default)]
        children: Vec<NodeDef>,
    },
}

impl NodeDef {
    /// A folder without children.
    pub fn folder(name: &str) -> Self {
        NodeDef::Folder {
            name: name.to_string(),
            text: None,
            children: Vec::new(),
        }
    }

    /// An unfiltered source mapping.
    pub fn source(data_source: &str) -> Self {
        NodeDef::Source {
            data_source: data_source.to_string(),
            filter: None,
            sort: None,
            link: None,
            recursive: None,
            children: Vec::new(),
        }
    }

    /// Replaces the child mappings.
    pub fn with_children(mut self, mappings: Vec<NodeDef>) -> Self {
        match &mut self {
            NodeDef::Folder { children, .. } | NodeDef::Source { children, .. } => *children = mappings,
        }
        self
    }

    /// Sets the filter of a source mapping.
    pub fn filtered(mut self, expr: &str) -> Self {
        if let NodeDef::Source { filter, .. } = &mut self {
            *filter = Some(expr.to_string());
        }
        self
    }

    /// Sets the sort of a source mapping.
    pub fn sorted(mut self, expr: &str) -> Self {
        if let NodeDef::Source { sort, .. } = &mut self {
            *sort = Some(expr.to_string());
        }
        self
    }

    /// Sets the link of a source mapping.
    pub fn linked(mut self, def: LinkDef) -> Self {
        if let NodeDef::Source { link, .. } = &mut self {
            *link = Some(def);
        }
        self
    }

    /// Makes a source mapping repeat below its own nodes under `expr`.
    pub fn recursive(mut self, expr: &str) -> Self {
        if let NodeDef::Source { recursive, .. } = &mut self {
            *recursive = Some(expr.to_string());
        }
        self
    }

    /// The link of a source mapping.
    pub fn link(&self) -> Option<&LinkDef> {
        match self {
            NodeDef::Source { link, .. } => link.as_ref(),
            NodeDef::Folder { .. } => None,
        }
    }

    /// Mappings attached when a node of this mapping expands. A recursive
    /// source contributes itself last, filtered by its recursion filter.
    pub fn child_mappings(&self) -> Vec<NodeDef> {
        match self {
            NodeDef::Folder { children, .. } => children.clone(),
            NodeDef::Source {
                children, recursive, ..
            } => {
                let mut mappings = children.clone();
                if let Some(expr) = recursive {
                    let mut again = self.clone();
                    if let NodeDef::Source { filter, .. } = &mut again {
                        *filter = Some(expr.clone());
                    }
                    mappings.push(again);
                }
                mappings
            }
        }
    }

    /// Whether nodes of this mapping can have children.
    pub fn is_expandable(&self) -> bool {
        match self {
            NodeDef::Folder { children, .. } => !children.is_empty(),
            NodeDef::Source {
                children, recursive, ..
            } => !children.is_empty() || recursive.is_some(),
        }
    }

    /// Whether any child mapping filters on the parent item.
    pub fn has_parent_refs(&self) -> bool {
        self.child_mappings().iter().any(|m| match m {
            NodeDef::Source { filter, .. } => filter.as_deref().is_some_and(|f| f.contains("../")),
            NodeDef::Folder { .. } => false,
        })
    }

    fn validate(&self) -> Result<(), TreeError> {
        match self {
            NodeDef::Folder { name, children, .. } => {
                if name.is_empty() {
                    return Err(TreeError::InvalidDefinition("folder without a name".into()));
                }
                children.iter().try_for_each(NodeDef::validate)
            }
            NodeDef::Source {
                data_source, children, ..
            } => {
                if data_source.is_empty() {
                    return Err(TreeError::InvalidDefinition("source without a data source".into()));
                }
                children.iter().try_for_each(NodeDef::validate)
            }
        }
    }
}

/// # Tree Definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDefinition {
    /// Id of the tree (and of its flattened list).
    pub id: String,
    /// Root mappings, instantiated eagerly.
    pub roots: Vec<NodeDef>,
}

impl TreeDefinition {
    /// Checks ids and names.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.id.is_empty() {
            return Err(TreeError::InvalidDefinition("tree without an id".into()));
        }
        self.roots.iter().try_for_each(NodeDef::validate)
    }
}

/// # List Tree Definition
///
/// A hierarchy stored in one self-referencing list: every item names its
/// parent's key in `parent_attribute`. Root items have no parent (or
/// `root_value`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTreeDefinition {
    /// Id of the tree.
    pub id: String,
    /// The self-referencing data source.
    pub data_source: String,
    /// Attribute holding an item's own key.
    pub key_attribute: String,
    /// Attribute holding the parent's key.
    pub parent_attribute: String,
    /// Parent value of root items; missing or empty when absent.
    #[serde(default)]
    pub root_value: Option<String>,
    /// Sort applied on every level.
    #[serde(default)]
    pub sort: Option<String>,
}

impl ListTreeDefinition {
    /// The equivalent recursive tree definition.
    pub fn to_tree_definition(&self) -> TreeDefinition {
        let mut root = NodeDef::source(&self.data_source)
            .filtered(&format!(
                "{}={}",
                self.parent_attribute,
                self.root_value.as_deref().unwrap_or_default()
            ))
            .recursive(&format!("{}=../{}", self.parent_attribute, self.key_attribute));
        if let Some(sort) = &self.sort {
            root = root.sorted(sort);
        }
        TreeDefinition {
            id: self.id.clone(),
            roots: vec![root],
        }
    }
}
