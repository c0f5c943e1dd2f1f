//! # Filters and Sorts
//!
//! Configured views name their filter and sort as short expressions:
//!
//! - `issuerId=X,active=true` is a conjunction of attribute equalities. An
//!   empty right-hand side (`parentId=`) matches missing, null or empty values.
//! - `class:Name(arg,arg)` builds a filter through a constructor registered
//!   under `Name` in the [`FilterRegistry`].
//! - Inside a tree, a value of the form `../attr` refers to the parent node's
//!   item and is substituted with [`FilterExpr::expand_parent`] before the
//!   filter is built.
//! - Sorts are `attr` (ascending) or `-attr` (descending).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;

use crate::core::list::{Filter, Sort};
use crate::core::types::{attribute_string, ListItem};

const PARENT_REF: &str = "../";
const CLASS_PREFIX: &str = "class:";

/// Errors raised while parsing or building a filter.
#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    /// The expression is malformed.
    #[error("malformed filter expression '{0}'")]
    Syntax(String),
    /// `class:Name` names no registered constructor.
    #[error("no filter class registered as '{0}'")]
    UnknownClass(String),
    /// A registered constructor refused its arguments.
    #[error("filter class '{class}' rejected arguments '{args}': {reason}")]
    BadArguments {
        /// Constructor name.
        class: String,
        /// Raw arguments.
        args: String,
        /// Why they were rejected.
        reason: String,
    },
}

/// Builds a filter from its (already expanded) argument list.
pub type FilterConstructor = Arc<dyn Fn(&[String]) -> Result<Arc<dyn Filter>, FilterError> + Send + Sync>;

/// Named filter constructors, standing in for reflective instantiation.
#[derive(Default)]
pub struct FilterRegistry {
    constructors: RwLock<HashMap<String, FilterConstructor>>,
}

impl FilterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a constructor.
    pub fn register(&self, name: &str, constructor: FilterConstructor) {
        self.constructors
            .write()
            .expect("Filter registry lock poisoned")
            .insert(name.to_string(), constructor);
    }

    /// Builds the filter registered as `name`.
    pub fn construct(&self, name: &str, args: &[String]) -> Result<Arc<dyn Filter>, FilterError> {
        let constructor = self
            .constructors
            .read()
            .expect("Filter registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| FilterError::UnknownClass(name.to_string()))?;
        constructor(args)
    }
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// Conjunction of `attribute=value` clauses.
    Attributes(Vec<(String, String)>),
    /// `class:Name(args)`.
    Class {
        /// Constructor name.
        name: String,
        /// Raw comma separated arguments.
        args: Vec<String>,
    },
}

impl FilterExpr {
    /// Parses an expression.
    pub fn parse(expr: &str) -> Result<Self, FilterError> {
        let expr = expr.trim();
        if let Some(rest) = expr.strip_prefix(CLASS_PREFIX) {
            let (name, args) = match rest.find('(') {
                Some(open) => {
                    let inner = rest[open + 1..]
                        .strip_suffix(')')
                        .ok_or_else(|| FilterError::Syntax(expr.to_string()))?;
                    (&rest[..open], split_args(inner))
                }
                None => (rest, Vec::new()),
            };
            if name.is_empty() {
                return Err(FilterError::Syntax(expr.to_string()));
            }
            return Ok(FilterExpr::Class {
                name: name.to_string(),
                args,
            });
        }

        let mut clauses = Vec::new();
        for clause in expr.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let (attribute, value) = clause
                .split_once('=')
                .ok_or_else(|| FilterError::Syntax(expr.to_string()))?;
            let attribute = attribute.trim();
            if attribute.is_empty() {
                return Err(FilterError::Syntax(expr.to_string()));
            }
            clauses.push((attribute.to_string(), value.trim().to_string()));
        }
        if clauses.is_empty() {
            return Err(FilterError::Syntax(expr.to_string()));
        }
        Ok(FilterExpr::Attributes(clauses))
    }

    /// Whether any value refers to the parent item.
    pub fn has_parent_refs(&self) -> bool {
        match self {
            FilterExpr::Attributes(clauses) => clauses.iter().any(|(_, v)| v.starts_with(PARENT_REF)),
            FilterExpr::Class { args, .. } => args.iter().any(|a| a.starts_with(PARENT_REF)),
        }
    }

    /// Substitutes every `../attr` value with `parent`'s attribute (empty when
    /// the parent lacks it).
    pub fn expand_parent(&self, parent: &dyn ListItem) -> FilterExpr {
        let expand = |value: &String| match value.strip_prefix(PARENT_REF) {
            Some(attribute) => attribute_string(parent, attribute).unwrap_or_default(),
            None => value.clone(),
        };
        match self {
            FilterExpr::Attributes(clauses) => {
                FilterExpr::Attributes(clauses.iter().map(|(a, v)| (a.clone(), expand(v))).collect())
            }
            FilterExpr::Class { name, args } => FilterExpr::Class {
                name: name.clone(),
                args: args.iter().map(expand).collect(),
            },
        }
    }

    /// Builds the filter.
    pub fn build(&self, registry: &FilterRegistry) -> Result<Arc<dyn Filter>, FilterError> {
        match self {
            FilterExpr::Attributes(clauses) => Ok(Arc::new(AttributeFilter {
                clauses: clauses.clone(),
            })),
            FilterExpr::Class { name, args } => registry.construct(name, args),
        }
    }
}

fn split_args(inner: &str) -> Vec<String> {
    inner
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// Conjunction of attribute equalities.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeFilter {
    clauses: Vec<(String, String)>,
}

impl AttributeFilter {
    /// Filter on a single attribute.
    pub fn equals(attribute: &str, value: &str) -> Self {
        Self {
            clauses: vec![(attribute.to_string(), value.to_string())],
        }
    }
}

impl Filter for AttributeFilter {
    fn id(&self) -> String {
        self.clauses
            .iter()
            .map(|(a, v)| format!("{}={}", a, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn include(&self, item: &dyn ListItem) -> bool {
        self.clauses.iter().all(|(attribute, expected)| {
            let actual = attribute_string(item, attribute);
            if expected.is_empty() {
                actual.map_or(true, |a| a.is_empty())
            } else {
                actual.as_deref() == Some(expected.as_str())
            }
        })
    }
}

/// Single-attribute ordering. Missing values sort last in either direction.
#[derive(Clone, PartialEq)]
pub struct AttributeSort {
    attribute: String,
    descending: bool,
}

impl fmt::Debug for AttributeSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeSort({})", self.id())
    }
}

impl AttributeSort {
    /// Parses `attr` or `-attr`. Blank expressions mean "unsorted".
    pub fn parse(expr: &str) -> Option<Self> {
        let expr = expr.trim();
        let (attribute, descending) = match expr.strip_prefix('-') {
            Some(rest) => (rest.trim(), true),
            None => (expr, false),
        };
        if attribute.is_empty() {
            return None;
        }
        Some(Self {
            attribute: attribute.to_string(),
            descending,
        })
    }
}

impl Sort for AttributeSort {
    fn id(&self) -> String {
        if self.descending {
            format!("-{}", self.attribute)
        } else {
            self.attribute.clone()
        }
    }

    fn compare(&self, a: &dyn ListItem, b: &dyn ListItem) -> Ordering {
        let va = a.attribute(&self.attribute).filter(|v| !v.is_null());
        let vb = b.attribute(&self.attribute).filter(|v| !v.is_null());
        match (va, vb) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = compare_values(&x, &y);
                if self.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Record;

    #[test]
    fn attribute_expressions() {
        let expr = FilterExpr::parse("issuerId=X, active=true").unwrap();
        let filter = expr.build(&FilterRegistry::new()).unwrap();
        assert_eq!(filter.id(), "issuerId=X,active=true");

        let yes = Record::new("I").with("issuerId", "X").with("active", true);
        let no = Record::new("I").with("issuerId", "X").with("active", false);
        assert!(filter.include(&yes));
        assert!(!filter.include(&no));

        assert!(FilterExpr::parse("nonsense").is_err());
        assert!(FilterExpr::parse("").is_err());
    }

    #[test]
    fn empty_value_matches_missing() {
        let filter = AttributeFilter::equals("parentId", "");
        assert!(filter.include(&Record::new("Node").with("id", "root")));
        assert!(filter.include(&Record::new("Node").with("parentId", Value::Null)));
        assert!(!filter.include(&Record::new("Node").with("parentId", "root")));
    }

    #[test]
    fn parent_references_expand() {
        let expr = FilterExpr::parse("issuerId=../id").unwrap();
        assert!(expr.has_parent_refs());
        let parent = Record::new("Issuer").with("id", "X");
        assert_eq!(
            expr.expand_parent(&parent),
            FilterExpr::Attributes(vec![("issuerId".into(), "X".into())])
        );
    }

    #[test]
    fn class_expressions_use_registry() {
        let registry = FilterRegistry::new();
        registry.register(
            "IssuerIs",
            Arc::new(|args: &[String]| -> Result<Arc<dyn Filter>, FilterError> {
                let issuer = args.first().ok_or_else(|| FilterError::BadArguments {
                    class: "IssuerIs".into(),
                    args: String::new(),
                    reason: "missing issuer".into(),
                })?;
                Ok(Arc::new(AttributeFilter::equals("issuerId", issuer)))
            }),
        );

        let expr = FilterExpr::parse("class:IssuerIs(../id)").unwrap();
        let expanded = expr.expand_parent(&Record::new("Issuer").with("id", "Y"));
        let filter = expanded.build(&registry).unwrap();
        assert!(filter.include(&Record::new("I").with("issuerId", "Y")));

        let unknown = FilterExpr::parse("class:Nope").unwrap().build(&registry);
        assert!(matches!(unknown, Err(FilterError::UnknownClass(_))));
    }

    #[test]
    fn sorts_numbers_and_puts_missing_last() {
        let sort = AttributeSort::parse("-price").unwrap();
        let cheap = Record::new("I").with("price", 2);
        let dear = Record::new("I").with("price", 10);
        let none = Record::new("I");
        assert_eq!(sort.compare(&dear, &cheap), Ordering::Less);
        assert_eq!(sort.compare(&none, &cheap), Ordering::Greater);
        assert!(AttributeSort::parse("  ").is_none());
    }
}
