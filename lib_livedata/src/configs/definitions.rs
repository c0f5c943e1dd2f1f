//! # Definitions File
//!
//! JSON description of everything the engine is built from:
//!
//! ```json
//! {
//!   "types": [{"name": "Instrument", "keyAttributes": ["id"], "textAttribute": "name"}],
//!   "dataSources": [{"id": "INSTR", "itemType": "Instrument", "kind": "reference"}],
//!   "references": [{"type": "Instrument", "field": "issuerId"}],
//!   "trees": [{"id": "instruments", "roots": [{"node": "source", "dataSource": "INSTR"}]}],
//!   "listTrees": []
//! }
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::configs::ConfigError;
use crate::core::tree::{ListTreeDefinition, TreeDefinition};
use crate::core::{ContextSettings, DataSourceDefinition, LiveContext, LiveContextBuilder, ReferenceSpec, TypeMeta};

/// The parsed definitions file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefinitionsFile {
    /// Class metadata.
    pub types: Vec<TypeMeta>,
    /// Data source definitions, any scope level.
    pub data_sources: Vec<DataSourceDefinition>,
    /// Cache references built at startup.
    pub references: Vec<ReferenceSpec>,
    /// Trees installed at startup.
    pub trees: Vec<TreeDefinition>,
    /// List trees installed at startup.
    pub list_trees: Vec<ListTreeDefinition>,
}

impl DefinitionsFile {
    /// Reads and parses `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: DefinitionsFile = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!(
            "Loaded {} types, {} data sources, {} references, {} trees from {}",
            file.types.len(),
            file.data_sources.len(),
            file.references.len(),
            file.trees.len() + file.list_trees.len(),
            path.display()
        );
        Ok(file)
    }

    /// Metadata configured for the class `name`.
    pub fn type_meta(&self, name: &str) -> Option<&TypeMeta> {
        self.types.iter().find(|t| t.name.as_str() == name)
    }

    /// Configured filter and sort of the data source `id`.
    pub fn data_source(&self, id: &str) -> Option<&DataSourceDefinition> {
        self.data_sources.iter().find(|d| d.id == id)
    }

    /// A context builder carrying every definition.
    pub fn into_builder(self) -> LiveContextBuilder {
        let mut builder = LiveContext::builder()
            .types(self.types)
            .data_sources(self.data_sources)
            .references(self.references);
        for tree in self.trees {
            builder = builder.tree(tree);
        }
        for list_tree in &self.list_trees {
            builder = builder.list_tree(list_tree);
        }
        builder
    }

    /// Builds the engine.
    pub fn build_context(self, settings: ContextSettings) -> Result<Arc<LiveContext>, ConfigError> {
        Ok(self.into_builder().settings(settings).build()?)
    }
}
