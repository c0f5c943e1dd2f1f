//! # Tree Engine
//!
//! On-demand hierarchical views over lists.
//!
//! - **`path`**: the `/index:key/...` node path codec.
//! - **`definition`**: tree, node mapping and list-tree definitions.
//! - **`engine`**: the [`TreeModel`] that materializes visible nodes.
//!
//! Trees are registered as Global data sources under their id, either from
//! configuration at startup or from `tree` / `listTree` definitions broadcast
//! at runtime (see [`TreeInstaller`]).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::core::dispatcher::{DispatchError, TaggedDefinition};
use crate::core::filters::{FilterError, FilterRegistry};
use crate::core::registry::{DataSourceOwner, RegistryError};
use crate::core::router::{DefinitionInstaller, DefinitionTag};

pub mod definition;
pub mod engine;
pub mod path;

pub use definition::{LinkDef, ListTreeDefinition, NodeDef, TreeDefinition};
pub use engine::{ExpandState, NodeContent, TreeModel, TreeNode};
pub use path::{NodePath, PathSegment};

/// Errors raised by the tree engine.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A path string is malformed.
    #[error("malformed node path '{0}'")]
    BadPath(String),
    /// No visible node has this path.
    #[error("no node at {0}")]
    UnknownNode(String),
    /// The tree has been destroyed.
    #[error("tree {0} is destroyed")]
    Destroyed(String),
    /// A tree with this id already exists.
    #[error("tree {0} already registered")]
    Duplicate(String),
    /// The definition is inconsistent.
    #[error("invalid tree definition: {0}")]
    InvalidDefinition(String),
    /// A definition body could not be decoded.
    #[error("undecodable tree definition: {0}")]
    Decode(#[from] serde_json::Error),
    /// A mapped data source could not be resolved.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A mapping filter could not be built.
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Registered trees by id.
#[derive(Default)]
pub struct TreeRegistry {
    trees: Mutex<HashMap<String, Arc<TreeModel>>>,
}

impl TreeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The tree registered as `id`.
    pub fn get(&self, id: &str) -> Option<Arc<TreeModel>> {
        self.trees.lock().expect("Tree registry lock poisoned").get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .trees
            .lock()
            .expect("Tree registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Number of trees.
    pub fn len(&self) -> usize {
        self.trees.lock().expect("Tree registry lock poisoned").len()
    }

    /// Whether no tree is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, tree: Arc<TreeModel>) -> Result<(), TreeError> {
        let mut trees = self.trees.lock().expect("Tree registry lock poisoned");
        if trees.contains_key(tree.id()) {
            return Err(TreeError::Duplicate(tree.id().to_string()));
        }
        trees.insert(tree.id().to_string(), tree);
        Ok(())
    }

    /// Destroys every tree.
    pub fn destroy_all(&self) {
        let trees: Vec<Arc<TreeModel>> = self
            .trees
            .lock()
            .expect("Tree registry lock poisoned")
            .drain()
            .map(|(_, t)| t)
            .collect();
        for tree in trees {
            tree.destroy();
        }
    }
}

/// # Tree Installer
///
/// Builds trees and registers their flattened lists in the Global owner.
pub struct TreeInstaller {
    owner: Arc<DataSourceOwner>,
    filters: Arc<FilterRegistry>,
    trees: Arc<TreeRegistry>,
}

impl TreeInstaller {
    /// An installer registering into `owner` and `trees`.
    pub fn new(owner: Arc<DataSourceOwner>, filters: Arc<FilterRegistry>, trees: Arc<TreeRegistry>) -> Self {
        Self { owner, filters, trees }
    }

    /// Builds and registers one tree.
    pub fn install_tree(&self, def: TreeDefinition) -> Result<Arc<TreeModel>, TreeError> {
        if self.trees.get(&def.id).is_some() {
            return Err(TreeError::Duplicate(def.id));
        }
        let tree = TreeModel::new(def, Arc::clone(&self.owner), Arc::clone(&self.filters))?;
        let registered = self
            .owner
            .put_unindexed_data_source(Arc::clone(tree.list()))
            .map_err(TreeError::from)
            .and_then(|_| self.trees.insert(Arc::clone(&tree)));
        if let Err(e) = registered {
            tree.destroy();
            return Err(e);
        }
        Ok(tree)
    }
}

impl DefinitionInstaller for TreeInstaller {
    fn install(&self, tag: DefinitionTag, definition: &TaggedDefinition) -> Result<(), DispatchError> {
        let decoded = match tag {
            DefinitionTag::Tree => serde_json::from_value::<TreeDefinition>(definition.body.clone()),
            DefinitionTag::ListTree => serde_json::from_value::<ListTreeDefinition>(definition.body.clone())
                .map(|list_tree| list_tree.to_tree_definition()),
        };
        decoded
            .map_err(TreeError::from)
            .and_then(|def| self.install_tree(def))
            .map(|_| ())
            .map_err(|e| DispatchError::Listener(format!("{} definition rejected: {}", definition.tag, e)))
    }
}
