//! # Data Source Definitions
//!
//! Declarative description of the lists each scope level carries, and the
//! factories that turn a definition into a [`DataList`].
//!
//! A query definition may name a source that is declared later (or at a
//! parent level that has not finished loading). Factories report that case
//! as [`Pending`] instead of failing, and [`instantiate`] retries the pending
//! set until it stops shrinking or the pass limit is reached.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::core::filters::{AttributeSort, FilterError, FilterExpr, FilterRegistry};
use crate::core::list::{DataList, Sort};
use crate::core::registry::{DataSourceOwner, RegistryError, ScopeLevel};
use crate::core::types::{TypeRegistry, TypeTag};

/// Maximum number of passes over the pending definitions.
pub const MAX_PASSES: usize = 3;

/// How a definition's list is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataSourceKind {
    /// Fed directly by broadcasts of its item type.
    Reference,
    /// A filtered and/or sorted view of another data source.
    Query {
        /// Id of the source data source.
        source: String,
        /// Filter expression.
        #[serde(default)]
        filter: Option<String>,
        /// Sort expression.
        #[serde(default)]
        sort: Option<String>,
    },
}

/// # Data Source Definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceDefinition {
    /// Data source id.
    pub id: String,
    /// Type of the items held.
    pub item_type: TypeTag,
    /// Key attributes; the type's metadata is used when empty.
    #[serde(default)]
    pub key_attributes: Vec<String>,
    /// Display text attribute; the type's metadata is used when absent.
    #[serde(default)]
    pub text_attribute: Option<String>,
    /// Scope level the definition is instantiated at.
    #[serde(default)]
    pub scope: ScopeLevel,
    /// Reference or query.
    #[serde(flatten)]
    pub kind: DataSourceKind,
    /// Named custom factory.
    #[serde(default)]
    pub factory: Option<String>,
}

impl DataSourceDefinition {
    /// A Global reference list.
    pub fn reference(id: &str, item_type: &str) -> Self {
        Self {
            id: id.to_string(),
            item_type: TypeTag::new(item_type),
            key_attributes: Vec::new(),
            text_attribute: None,
            scope: ScopeLevel::Global,
            kind: DataSourceKind::Reference,
            factory: None,
        }
    }

    /// A Global query over `source`.
    pub fn query(id: &str, item_type: &str, source: &str) -> Self {
        Self {
            kind: DataSourceKind::Query {
                source: source.to_string(),
                filter: None,
                sort: None,
            },
            ..Self::reference(id, item_type)
        }
    }

    /// Sets the query filter. No effect on reference definitions.
    pub fn filtered(mut self, expr: &str) -> Self {
        if let DataSourceKind::Query { filter, .. } = &mut self.kind {
            *filter = Some(expr.to_string());
        }
        self
    }

    /// Sets the query sort. No effect on reference definitions.
    pub fn sorted(mut self, expr: &str) -> Self {
        if let DataSourceKind::Query { sort, .. } = &mut self.kind {
            *sort = Some(expr.to_string());
        }
        self
    }

    /// Instantiates the definition at `scope` instead.
    pub fn at(mut self, scope: ScopeLevel) -> Self {
        self.scope = scope;
        self
    }

    /// Uses the factory registered as `name`.
    pub fn with_factory(mut self, name: &str) -> Self {
        self.factory = Some(name.to_string());
        self
    }
}

/// A referenced data source is not registered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    /// Id of the missing data source.
    pub missing: String,
}

/// Outcome of a failed [`DataSourceFactory::create`].
#[derive(Debug)]
pub enum FactoryError {
    /// Retry once more definitions are registered.
    Pending(Pending),
    /// Permanent failure.
    Failed(RegistryError),
}

impl From<RegistryError> for FactoryError {
    fn from(e: RegistryError) -> Self {
        FactoryError::Failed(e)
    }
}

impl From<FilterError> for FactoryError {
    fn from(e: FilterError) -> Self {
        FactoryError::Failed(RegistryError::Filter(e))
    }
}

impl From<Pending> for FactoryError {
    fn from(p: Pending) -> Self {
        FactoryError::Pending(p)
    }
}

/// Builds the list for one definition in one owner.
pub trait DataSourceFactory: Send + Sync {
    /// Creates (but does not register) the list.
    fn create(&self, owner: &DataSourceOwner, def: &DataSourceDefinition) -> Result<Arc<DataList>, FactoryError>;
}

/// # Standard Factory
///
/// Reference lists take their key and text attributes from the type metadata
/// unless the definition overrides them. Query lists derive a view of their
/// source as resolved through the owner.
pub struct StandardFactory {
    types: Arc<TypeRegistry>,
    filters: Arc<FilterRegistry>,
}

impl StandardFactory {
    /// A factory validating against `types` and building filters from `filters`.
    pub fn new(types: Arc<TypeRegistry>, filters: Arc<FilterRegistry>) -> Self {
        Self { types, filters }
    }
}

impl DataSourceFactory for StandardFactory {
    fn create(&self, owner: &DataSourceOwner, def: &DataSourceDefinition) -> Result<Arc<DataList>, FactoryError> {
        let meta = self
            .types
            .meta(&def.item_type)
            .ok_or_else(|| RegistryError::UnknownType(def.item_type.clone()))?;

        match &def.kind {
            DataSourceKind::Reference => {
                let key_attributes = if def.key_attributes.is_empty() {
                    meta.key_attributes.clone()
                } else {
                    def.key_attributes.clone()
                };
                if key_attributes.is_empty() {
                    return Err(RegistryError::InvalidDefinition {
                        id: def.id.clone(),
                        reason: format!("type {} declares no key attributes", def.item_type),
                    }
                    .into());
                }
                let list = DataList::new(def.id.clone(), def.item_type.clone(), key_attributes)
                    .with_text_attribute(def.text_attribute.clone().or_else(|| meta.text_attribute.clone()))
                    .with_origin(owner.scope().clone());
                Ok(Arc::new(list))
            }
            DataSourceKind::Query { source, filter, sort } => {
                let parent = match owner.get_data_source(source, None, None) {
                    Ok(list) => list,
                    Err(RegistryError::NotFound(_)) => {
                        return Err(Pending {
                            missing: source.clone(),
                        }
                        .into())
                    }
                    Err(e) => return Err(e.into()),
                };
                let filter = filter
                    .as_deref()
                    .map(|expr| FilterExpr::parse(expr)?.build(&self.filters))
                    .transpose()?;
                let sort = sort
                    .as_deref()
                    .and_then(AttributeSort::parse)
                    .map(|s| Arc::new(s) as Arc<dyn Sort>);
                Ok(DataList::derive(&parent, def.id.clone(), filter, sort, owner.scope().clone()))
            }
        }
    }
}

/// The standard factory plus named custom factories.
pub struct FactoryRegistry {
    standard: Arc<dyn DataSourceFactory>,
    named: RwLock<HashMap<String, Arc<dyn DataSourceFactory>>>,
}

impl FactoryRegistry {
    /// A registry falling back to `standard`.
    pub fn new(standard: Arc<dyn DataSourceFactory>) -> Self {
        Self {
            standard,
            named: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) a named factory.
    pub fn register(&self, name: &str, factory: Arc<dyn DataSourceFactory>) {
        self.named
            .write()
            .expect("Factory registry lock poisoned")
            .insert(name.to_string(), factory);
    }

    /// The factory responsible for `def`.
    pub fn factory_for(&self, def: &DataSourceDefinition) -> Result<Arc<dyn DataSourceFactory>, RegistryError> {
        match &def.factory {
            None => Ok(Arc::clone(&self.standard)),
            Some(name) => self
                .named
                .read()
                .expect("Factory registry lock poisoned")
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownFactory(name.clone())),
        }
    }
}

/// # Instantiate
///
/// Creates and registers every definition of `owner`'s scope level. Pending
/// definitions are retried on the next pass, up to [`MAX_PASSES`] passes;
/// whatever is still pending afterwards is reported as
/// [`RegistryError::Unresolved`]. Configured lists are permanent, so idle
/// cleanup only ever evicts the views derived from them.
pub fn instantiate(
    owner: &DataSourceOwner,
    definitions: &[DataSourceDefinition],
    factories: &FactoryRegistry,
) -> Result<Vec<(DataSourceDefinition, Arc<DataList>)>, RegistryError> {
    let level = owner.scope().level();
    let mut pending: Vec<&DataSourceDefinition> = definitions.iter().filter(|d| d.scope == level).collect();
    let mut created = Vec::with_capacity(pending.len());

    for pass in 1..=MAX_PASSES {
        if pending.is_empty() {
            break;
        }
        let mut retry = Vec::new();
        for def in pending {
            match factories.factory_for(def)?.create(owner, def) {
                Ok(list) => {
                    list.set_permanent(true);
                    owner.put_data_source_as(&def.id, Arc::clone(&list))?;
                    created.push((def.clone(), list));
                }
                Err(FactoryError::Pending(p)) => {
                    log::trace!(
                        "Data source {} in {} waits for {} (pass {})",
                        def.id,
                        owner.scope(),
                        p.missing,
                        pass
                    );
                    retry.push(def);
                }
                Err(FactoryError::Failed(e)) => return Err(e),
            }
        }
        pending = retry;
    }

    if !pending.is_empty() {
        return Err(RegistryError::Unresolved(pending.iter().map(|d| d.id.clone()).collect()));
    }
    if !created.is_empty() {
        log::info!("Instantiated {} data sources in {}", created.len(), owner.scope());
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::Scope;
    use crate::core::types::{Record, TypeMeta};
    use std::time::Duration;

    fn factories() -> FactoryRegistry {
        let types = Arc::new(
            TypeRegistry::new(vec![TypeMeta::new("Instrument", "id").with_text("name")]).unwrap(),
        );
        FactoryRegistry::new(Arc::new(StandardFactory::new(types, Arc::new(FilterRegistry::new()))))
    }

    #[test]
    fn forward_references_resolve_within_the_pass_limit() {
        let defs = vec![
            DataSourceDefinition::query("CHEAP_X", "Instrument", "X_ONLY").sorted("price"),
            DataSourceDefinition::query("X_ONLY", "Instrument", "INSTR").filtered("issuerId=X"),
            DataSourceDefinition::reference("INSTR", "Instrument"),
        ];
        let owner = DataSourceOwner::global();
        let created = instantiate(&owner, &defs, &factories()).unwrap();
        assert_eq!(created.len(), 3);

        let instr = owner.get_data_source("INSTR", None, None).unwrap();
        instr
            .upsert(Record::new("Instrument").with("id", "A").with("issuerId", "X").into_item())
            .unwrap();
        instr
            .upsert(Record::new("Instrument").with("id", "B").with("issuerId", "Y").into_item())
            .unwrap();
        assert_eq!(owner.get_data_source("CHEAP_X", None, None).unwrap().keys(), vec!["A"]);
        assert_eq!(instr.text_of(&*instr.get("A").unwrap()), "A");
    }

    #[test]
    fn chains_longer_than_the_pass_limit_are_unresolved() {
        let defs = vec![
            DataSourceDefinition::query("Q3", "Instrument", "Q2"),
            DataSourceDefinition::query("Q2", "Instrument", "Q1"),
            DataSourceDefinition::query("Q1", "Instrument", "INSTR"),
            DataSourceDefinition::reference("INSTR", "Instrument"),
        ];
        let owner = DataSourceOwner::global();
        match instantiate(&owner, &defs, &factories()) {
            Err(RegistryError::Unresolved(ids)) => assert_eq!(ids, vec!["Q3"]),
            other => panic!("expected unresolved, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn only_the_owner_level_is_instantiated() {
        let defs = vec![
            DataSourceDefinition::reference("INSTR", "Instrument"),
            DataSourceDefinition::query("MINE", "Instrument", "INSTR").at(ScopeLevel::Member),
        ];
        let factories = factories();
        let global = Arc::new(DataSourceOwner::global());
        instantiate(&global, &defs, &factories).unwrap();
        assert_eq!(global.data_source_ids(), vec!["INSTR"]);

        let member = DataSourceOwner::with_parent(Scope::member("M"), global, Duration::from_secs(60));
        instantiate(&member, &defs, &factories).unwrap();
        assert_eq!(member.data_source_ids(), vec!["MINE"]);
        assert_eq!(
            member.get_data_source("MINE", None, None).unwrap().origin(),
            &Scope::member("M")
        );
    }

    #[test]
    fn unknown_types_and_factories_are_fatal() {
        let owner = DataSourceOwner::global();
        let factories = factories();
        let err = instantiate(&owner, &[DataSourceDefinition::reference("BONDS", "Bond")], &factories).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType(_)));

        let def = DataSourceDefinition::reference("INSTR", "Instrument").with_factory("custom");
        let err = instantiate(&owner, &[def], &factories).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownFactory(_)));
    }

    #[test]
    fn named_factories_take_over() {
        struct Fixed;
        impl DataSourceFactory for Fixed {
            fn create(&self, owner: &DataSourceOwner, def: &DataSourceDefinition) -> Result<Arc<DataList>, FactoryError> {
                let list = DataList::new(def.id.clone(), def.item_type.clone(), vec!["code".into()])
                    .with_origin(owner.scope().clone());
                Ok(Arc::new(list))
            }
        }

        let factories = factories();
        factories.register("fixed", Arc::new(Fixed));
        let owner = DataSourceOwner::global();
        let def = DataSourceDefinition::reference("CODES", "Instrument").with_factory("fixed");
        instantiate(&owner, &[def], &factories).unwrap();
        let list = owner.get_data_source("CODES", None, None).unwrap();
        assert_eq!(list.key_attributes(), &["code".to_string()]);
    }

    #[test]
    fn definitions_deserialize_from_json() {
        let def: DataSourceDefinition = serde_json::from_str(
            r#"{"id":"X_ONLY","itemType":"Instrument","scope":"member",
                "kind":"query","source":"INSTR","filter":"issuerId=X"}"#,
        )
        .unwrap();
        assert_eq!(def.scope, ScopeLevel::Member);
        assert_eq!(
            def.kind,
            DataSourceKind::Query {
                source: "INSTR".into(),
                filter: Some("issuerId=X".into()),
                sort: None
            }
        );
    }
}
