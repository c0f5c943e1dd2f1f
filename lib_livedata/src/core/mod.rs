//! # Core Engine Module
//!
//! The live data distribution engine. Updates enter through the
//! [`Dispatcher`] queue, are routed by item class into materialized
//! [`DataList`]s owned by Global, Member or User [`DataSourceOwner`]s, and
//! surface to consumers as lists, derived views, reverse reference indexes and
//! hierarchical trees.
//!
//! ## Core Components:
//!
//! - **`dispatcher`**: The FIFO broadcast queue and its single consumer thread.
//!   Also emits the periodic clock pulse.
//!
//! - **`router`**: Maps item classes to the lists holding them and propagates
//!   updates up the class hierarchy.
//!
//! - **`registry`**: The owner hierarchy. Lists are looked up and memoized
//!   per owner, and Member/User lists are evicted once idle.
//!
//! - **`cache_ref`**: Reverse indexes answering "which items point at X".
//!
//! - **`tree`**: Expand/collapse tree models built from tree definitions and
//!   materialized into flat lists.
//!
//! - **`context`**: Wires all of the above into one explicit [`LiveContext`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Item model, type metadata and key construction.
pub mod types;
/// Queue length accounting.
pub mod queue_guard;
/// Keyed, ordered, observable item lists and derived views.
pub mod list;
/// Filter and sort expressions.
pub mod filters;
/// The broadcast queue and dispatcher thread.
pub mod dispatcher;
/// Class-to-list routing.
pub mod router;
/// Data source owners and idle eviction.
pub mod registry;
/// Data source definitions and factories.
pub mod definitions;
/// Reverse reference indexes.
pub mod cache_ref;
/// Tree models.
pub mod tree;
/// The process context.
pub mod context;

// --- Public API Re-exports ---
pub use cache_ref::{CacheReference, CacheReferences, ReferenceSpec};
pub use context::{ContextError, ContextSettings, LiveContext, LiveContextBuilder};
pub use definitions::{DataSourceDefinition, DataSourceFactory, DataSourceKind};
pub use dispatcher::{BdxListener, Broadcast, ClockPulse, DispatchError, Dispatcher, Envelope, TaggedDefinition};
pub use filters::{AttributeFilter, AttributeSort, FilterError, FilterExpr, FilterRegistry};
pub use list::{DataList, Filter, ListEvent, ListListener, Sort};
pub use registry::{DataSourceOwner, OwnerRegistry, OwnerSettings, RegistryError, Scope, ScopeLevel};
pub use router::ClassRouter;
pub use tree::{ListTreeDefinition, NodeDef, TreeDefinition, TreeError, TreeModel};
pub use types::{Item, ListItem, Record, TypeMeta, TypeRegistry, TypeTag};
