//! # Live Context
//!
//! The explicit process context. Owns every registry of the engine and
//! exposes the operations collaborators call: broadcasting, listener
//! registration, data source lookup, reverse references and trees.
//!
//! Built once at startup through [`LiveContext::builder`]; any configuration
//! error (duplicate data source, unresolved forward reference, unknown type)
//! is returned from [`LiveContextBuilder::build`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;

use crate::core::cache_ref::{CacheReference, CacheReferences, ReferenceSpec};
use crate::core::definitions::{DataSourceDefinition, DataSourceFactory, FactoryRegistry, StandardFactory};
use crate::core::dispatcher::{BdxListener, Broadcast, DispatchError, Dispatcher};
use crate::core::filters::{AttributeSort, FilterConstructor, FilterExpr, FilterRegistry};
use crate::core::list::{DataList, Sort};
use crate::core::registry::{OwnerRegistry, OwnerSettings, RegistryError, Scope};
use crate::core::router::ClassRouter;
use crate::core::tree::{ListTreeDefinition, TreeDefinition, TreeError, TreeInstaller, TreeModel, TreeRegistry};
use crate::core::types::{Item, TypeError, TypeMeta, TypeRegistry, TypeTag};

/// Errors raised while building the context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Bad type metadata.
    #[error(transparent)]
    Types(#[from] TypeError),
    /// Bad data source or reference configuration.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Bad tree configuration.
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// The dispatcher could not start.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Runtime knobs of the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextSettings {
    /// Queue length above which a warning is logged.
    pub high_water: usize,
    /// Clock pulse period.
    pub pulse_period: Duration,
    /// Idle eviction of Member and User owners.
    pub owners: OwnerSettings,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            high_water: 100_000,
            pulse_period: Duration::from_secs(1),
            owners: OwnerSettings::default(),
        }
    }
}

/// # Live Context
pub struct LiveContext {
    settings: ContextSettings,
    types: Arc<TypeRegistry>,
    filters: Arc<FilterRegistry>,
    dispatcher: Arc<Dispatcher>,
    router: Arc<ClassRouter>,
    owners: OwnerRegistry,
    references: CacheReferences,
    trees: Arc<TreeRegistry>,
    installer: Arc<TreeInstaller>,
}

impl fmt::Debug for LiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveContext")
            .field("settings", &self.settings)
            .field("global_data_sources", &self.owners.global().len())
            .field("queue_length", &self.dispatcher.queue_length())
            .finish()
    }
}

impl LiveContext {
    /// Starts a builder.
    pub fn builder() -> LiveContextBuilder {
        LiveContextBuilder::default()
    }

    /// Type metadata.
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The class router.
    pub fn router(&self) -> &Arc<ClassRouter> {
        &self.router
    }

    /// The owner hierarchy.
    pub fn owners(&self) -> &OwnerRegistry {
        &self.owners
    }

    /// Registered trees.
    pub fn trees(&self) -> &Arc<TreeRegistry> {
        &self.trees
    }

    /// Filter constructors.
    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    /// Effective settings.
    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Enqueues an event. Never blocks.
    pub fn broadcast(&self, event: Broadcast) -> Result<(), DispatchError> {
        self.dispatcher.broadcast(event)
    }

    /// Events waiting for the dispatcher thread.
    pub fn queue_length(&self) -> usize {
        self.dispatcher.queue_length()
    }

    /// Registers a broadcast listener for `classes` (all events when empty).
    pub fn add_bdx_listener(&self, listener: Arc<dyn BdxListener>, classes: &[TypeTag]) {
        self.dispatcher.add_listener(listener, classes);
    }

    /// Removes the broadcast listener called `name`.
    pub fn remove_bdx_listener(&self, name: &str) -> bool {
        self.dispatcher.remove_listener(name)
    }

    /// # Get Data Source
    ///
    /// Resolves `id` in the owner for `scope`, optionally filtered by a filter
    /// expression and sorted by a sort expression.
    pub fn get_data_source(
        &self,
        scope: &Scope,
        id: &str,
        filter: Option<&str>,
        sort: Option<&str>,
    ) -> Result<Arc<DataList>, RegistryError> {
        let filter = filter
            .filter(|f| !f.trim().is_empty())
            .map(|f| FilterExpr::parse(f)?.build(&self.filters))
            .transpose()?;
        let sort = sort
            .and_then(AttributeSort::parse)
            .map(|s| Arc::new(s) as Arc<dyn Sort>);
        self.owners.owner(scope)?.get_data_source(id, filter, sort)
    }

    /// The Global list holding items of `tag`.
    pub fn get_data_source_for_type(&self, tag: &TypeTag) -> Option<Arc<DataList>> {
        self.owners.global().get_data_source_for_type(tag)
    }

    /// Items of `tag` whose `field` equals `key`, as a snapshot. The
    /// reference index is created on first use.
    pub fn get_referencing_objects(&self, tag: &TypeTag, field: &str, key: &str) -> Result<Vec<Item>, RegistryError> {
        self.references
            .get_referencing_objects(tag, field, key, self.owners.global())
    }

    /// The cache reference on (`tag`, `field`), if one exists.
    pub fn cache_reference(&self, tag: &TypeTag, field: &str) -> Option<Arc<CacheReference>> {
        self.references.get(tag, field)
    }

    /// Replaces every cache reference.
    pub fn reload_references(&self, specs: &[ReferenceSpec]) -> Result<(), RegistryError> {
        self.references.rebuild(specs, self.owners.global())
    }

    /// The tree registered as `id`.
    pub fn tree(&self, id: &str) -> Option<Arc<TreeModel>> {
        self.trees.get(id)
    }

    /// Builds and registers a tree immediately.
    pub fn install_tree(&self, def: TreeDefinition) -> Result<Arc<TreeModel>, TreeError> {
        self.installer.install_tree(def)
    }

    /// # Start
    ///
    /// Starts the dispatcher thread, the clock pulse and the owner cleanup
    /// tasks on `handle`.
    pub fn start(&self, handle: &Handle) -> Result<(), DispatchError> {
        self.dispatcher.start()?;
        self.dispatcher.start_clock(handle, self.settings.pulse_period);
        self.owners.set_runtime(handle.clone());
        log::info!(
            "Live context started: {} types, {} global data sources, {} trees",
            self.types.types().count(),
            self.owners.global().len(),
            self.trees.len()
        );
        Ok(())
    }

    /// Stops dispatching and releases every owner, tree and reference.
    pub fn shutdown(&self) {
        self.dispatcher.stop();
        self.trees.destroy_all();
        self.references.clear();
        self.owners.shutdown();
        log::info!("Live context shut down.");
    }
}

/// # Live Context Builder
#[derive(Default)]
pub struct LiveContextBuilder {
    settings: ContextSettings,
    types: Vec<TypeMeta>,
    data_sources: Vec<DataSourceDefinition>,
    references: Vec<ReferenceSpec>,
    trees: Vec<TreeDefinition>,
    filters: Vec<(String, FilterConstructor)>,
    factories: Vec<(String, Arc<dyn DataSourceFactory>)>,
}

impl LiveContextBuilder {
    /// Runtime settings.
    pub fn settings(mut self, settings: ContextSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Adds type metadata.
    pub fn types(mut self, types: impl IntoIterator<Item = TypeMeta>) -> Self {
        self.types.extend(types);
        self
    }

    /// Adds data source definitions.
    pub fn data_sources(mut self, defs: impl IntoIterator<Item = DataSourceDefinition>) -> Self {
        self.data_sources.extend(defs);
        self
    }

    /// Adds cache references built at startup.
    pub fn references(mut self, specs: impl IntoIterator<Item = ReferenceSpec>) -> Self {
        self.references.extend(specs);
        self
    }

    /// Adds a tree installed at startup.
    pub fn tree(mut self, def: TreeDefinition) -> Self {
        self.trees.push(def);
        self
    }

    /// Adds a list tree installed at startup.
    pub fn list_tree(mut self, def: &ListTreeDefinition) -> Self {
        self.trees.push(def.to_tree_definition());
        self
    }

    /// Registers a `class:` filter constructor.
    pub fn filter(mut self, name: &str, constructor: FilterConstructor) -> Self {
        self.filters.push((name.to_string(), constructor));
        self
    }

    /// Registers a named data source factory.
    pub fn factory(mut self, name: &str, factory: Arc<dyn DataSourceFactory>) -> Self {
        self.factories.push((name.to_string(), factory));
        self
    }

    /// # Build
    ///
    /// Validates the configuration and wires the engine. The dispatcher is
    /// not started.
    pub fn build(self) -> Result<Arc<LiveContext>, ContextError> {
        let types = Arc::new(TypeRegistry::new(self.types)?);

        let filters = Arc::new(FilterRegistry::new());
        for (name, constructor) in self.filters {
            filters.register(&name, constructor);
        }

        let factories = Arc::new(FactoryRegistry::new(Arc::new(StandardFactory::new(
            Arc::clone(&types),
            Arc::clone(&filters),
        ))));
        for (name, factory) in self.factories {
            factories.register(&name, factory);
        }

        let router = Arc::new(ClassRouter::new(Arc::clone(&types)));
        let owners = OwnerRegistry::new(self.settings.owners, self.data_sources, factories, Arc::clone(&router));
        owners.populate_global()?;

        let trees = Arc::new(TreeRegistry::new());
        let installer = Arc::new(TreeInstaller::new(
            Arc::clone(owners.global()),
            Arc::clone(&filters),
            Arc::clone(&trees),
        ));
        router.set_installer(installer.clone());
        for def in self.trees {
            installer.install_tree(def)?;
        }

        let references = CacheReferences::new();
        references.rebuild(&self.references, owners.global())?;

        let dispatcher = Dispatcher::new(self.settings.high_water);
        dispatcher.add_listener(router.clone(), &[]);

        Ok(Arc::new(LiveContext {
            settings: self.settings,
            types,
            filters,
            dispatcher,
            router,
            owners,
            references,
            trees,
            installer,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::TaggedDefinition;
    use crate::core::types::{attribute_string, Record};
    use serde_json::json;

    fn context() -> Arc<LiveContext> {
        LiveContext::builder()
            .types([
                TypeMeta::new("Issuer", "id").with_text("name"),
                TypeMeta::new("Instrument", "id").with_text("name"),
            ])
            .data_sources([
                DataSourceDefinition::reference("ISSUERS", "Issuer"),
                DataSourceDefinition::reference("INSTR", "Instrument"),
            ])
            .build()
            .unwrap()
    }

    fn send(ctx: &LiveContext, record: Record) {
        ctx.dispatcher().notify(Broadcast::Item(record.into_item()));
    }

    #[test]
    fn instrument_scenario() {
        let ctx = context();
        let instr = ctx.get_data_source(&Scope::Global, "INSTR", None, None).unwrap();

        send(&ctx, Record::new("Instrument").with("id", "A"));
        assert!(instr.get("A").is_some());
        assert_eq!(instr.values().len(), 1);

        send(&ctx, Record::new("Instrument").with("id", "A").with("price", 2));
        assert_eq!(instr.get("A").unwrap().attribute("price"), Some(json!(2)));
        assert_eq!(instr.len(), 1);

        let tag = TypeTag::new("Instrument");
        assert!(ctx.get_referencing_objects(&tag, "issuerId", "X").unwrap().is_empty());
        send(&ctx, Record::new("Instrument").with("id", "B").with("issuerId", "X"));
        send(&ctx, Record::new("Instrument").with("id", "C").with("issuerId", "X"));
        send(&ctx, Record::new("Instrument").with("id", "D").with("issuerId", "Y"));
        let found: Vec<String> = ctx
            .get_referencing_objects(&tag, "issuerId", "X")
            .unwrap()
            .iter()
            .filter_map(|i| attribute_string(&**i, "id"))
            .collect();
        assert_eq!(found, vec!["B", "C"]);
    }

    #[test]
    fn scoped_views_are_shared_per_owner() {
        let ctx = context();
        send(&ctx, Record::new("Instrument").with("id", "A").with("issuerId", "X").with("price", 5));
        send(&ctx, Record::new("Instrument").with("id", "B").with("issuerId", "X").with("price", 1));

        let member = Scope::member("M1");
        let view = ctx
            .get_data_source(&member, "INSTR", Some("issuerId=X"), Some("price"))
            .unwrap();
        assert_eq!(view.keys(), vec!["B", "A"]);
        assert!(Arc::ptr_eq(
            &view,
            &ctx.get_data_source(&member, "INSTR", Some("issuerId=X"), Some("price")).unwrap()
        ));
        assert_eq!(ctx.owners().member_count(), 1);

        assert!(matches!(
            ctx.get_data_source(&member, "INSTR", Some("issuerId"), None),
            Err(RegistryError::Filter(_))
        ));
        assert!(ctx.owners().destroy_member("M1"));
        assert!(view.is_destroyed());
    }

    #[test]
    fn tree_definitions_arrive_through_the_queue() {
        let ctx = context();
        send(&ctx, Record::new("Issuer").with("id", "X").with("name", "X Corp"));
        ctx.dispatcher().notify(Broadcast::Definition(TaggedDefinition {
            tag: "tree".into(),
            body: json!({"id": "issuers", "roots": [{"node": "source", "dataSource": "ISSUERS"}]}),
        }));

        let tree = ctx.tree("issuers").unwrap();
        assert_eq!(tree.paths(), vec!["/0:X"]);
        let registered = ctx.get_data_source(&Scope::Global, "issuers", None, None).unwrap();
        assert!(Arc::ptr_eq(&registered, tree.list()));

        send(&ctx, Record::new("Issuer").with("id", "Y"));
        assert_eq!(tree.paths(), vec!["/0:X", "/0:Y"]);

        assert!(ctx
            .install_tree(TreeDefinition {
                id: "issuers".into(),
                roots: Vec::new()
            })
            .is_err());
    }

    #[test]
    fn configuration_errors_surface_from_build() {
        let duplicate = LiveContext::builder()
            .types([TypeMeta::new("Instrument", "id")])
            .data_sources([
                DataSourceDefinition::reference("INSTR", "Instrument"),
                DataSourceDefinition::reference("INSTR", "Instrument"),
            ])
            .build();
        assert!(matches!(
            duplicate,
            Err(ContextError::Registry(RegistryError::Duplicate { .. }))
        ));

        let unknown = LiveContext::builder()
            .data_sources([DataSourceDefinition::reference("INSTR", "Instrument")])
            .build();
        assert!(matches!(
            unknown,
            Err(ContextError::Registry(RegistryError::UnknownType(_)))
        ));
    }
}
