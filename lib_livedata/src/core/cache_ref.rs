//! # Cache References
//!
//! A [`CacheReference`] is a reverse index over one field of a Global list:
//! for every distinct (stringified) field value it keeps the items carrying
//! it. The index is a listener on the list, so it follows every add, update,
//! removal and snapshot without being asked. Null values are never indexed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::list::{DataList, ListEvent, ListListener, ListenerId};
use crate::core::registry::{DataSourceOwner, RegistryError};
use crate::core::types::{attribute_string, Item, TypeTag};

/// A configured (type, field) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSpec {
    /// Referencing type.
    #[serde(rename = "type")]
    pub item_type: TypeTag,
    /// Foreign-key field.
    pub field: String,
}

impl ReferenceSpec {
    /// Builds a spec.
    pub fn new(item_type: &str, field: &str) -> Self {
        Self {
            item_type: TypeTag::new(item_type),
            field: field.to_string(),
        }
    }

    /// Table name, `Type.field`.
    pub fn name(&self) -> String {
        reference_name(&self.item_type, &self.field)
    }
}

fn reference_name(tag: &TypeTag, field: &str) -> String {
    format!("{}.{}", tag, field)
}

#[derive(Default)]
struct ReferenceIndex {
    buckets: HashMap<String, BTreeMap<String, Item>>,
    values: HashMap<String, String>,
}

impl ReferenceIndex {
    fn insert(&mut self, key: String, item: &Item, field: &str) {
        self.remove(&key);
        let Some(value) = attribute_string(&**item, field) else {
            return;
        };
        self.buckets
            .entry(value.clone())
            .or_default()
            .insert(key.clone(), Arc::clone(item));
        self.values.insert(key, value);
    }

    fn remove(&mut self, key: &str) {
        let Some(value) = self.values.remove(key) else {
            return;
        };
        if let Some(bucket) = self.buckets.get_mut(&value) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.buckets.remove(&value);
            }
        }
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.values.clear();
    }
}

struct Indexer {
    name: String,
    field: String,
    index: Arc<Mutex<ReferenceIndex>>,
}

impl ListListener for Indexer {
    fn name(&self) -> String {
        format!("reference:{}", self.name)
    }

    fn on_list_event(&self, list: &DataList, event: &ListEvent) {
        let mut index = self.index.lock().expect("Reference lock poisoned");
        match event {
            ListEvent::Snapshot(items) => {
                index.clear();
                for item in items {
                    if let Ok(key) = list.key_for(&**item) {
                        index.insert(key, item, &self.field);
                    }
                }
            }
            ListEvent::Add(item) | ListEvent::Update { new: item, .. } => {
                if let Ok(key) = list.key_for(&**item) {
                    index.insert(key, item, &self.field);
                }
            }
            ListEvent::Remove(item) => {
                if let Ok(key) = list.key_for(&**item) {
                    index.remove(&key);
                }
            }
            ListEvent::Clear => index.clear(),
        }
    }
}

/// # Cache Reference
///
/// Reverse index of one field of the Global list holding a type.
pub struct CacheReference {
    name: String,
    list: Arc<DataList>,
    listener: Mutex<Option<ListenerId>>,
    index: Arc<Mutex<ReferenceIndex>>,
}

impl CacheReference {
    /// Resolves the Global list for `tag` through `owner` and indexes `field`.
    pub fn new(tag: &TypeTag, field: &str, owner: &DataSourceOwner) -> Result<Self, RegistryError> {
        let list = owner
            .get_data_source_for_type(tag)
            .ok_or_else(|| RegistryError::NoListForType(tag.clone()))?;
        let name = reference_name(tag, field);
        let index = Arc::new(Mutex::new(ReferenceIndex::default()));
        let listener = list.add_listener(Arc::new(Indexer {
            name: name.clone(),
            field: field.to_string(),
            index: Arc::clone(&index),
        }));
        log::debug!("Cache reference {} attached to '{}'", name, list.id());
        Ok(Self {
            name,
            list,
            listener: Mutex::new(Some(listener)),
            index,
        })
    }

    /// `Type.field`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Items whose field equals `value`, ordered by key. Empty when none.
    ///
    /// The result is a snapshot taken under the index lock; call again after
    /// further events to see their effect.
    pub fn get_mapping(&self, value: &str) -> Vec<Item> {
        self.index
            .lock()
            .expect("Reference lock poisoned")
            .buckets
            .get(value)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct indexed values.
    pub fn value_count(&self) -> usize {
        self.index.lock().expect("Reference lock poisoned").buckets.len()
    }

    /// Detaches from the list and drops the index.
    pub fn destroy(&self) {
        if let Some(id) = self.listener.lock().expect("Reference lock poisoned").take() {
            self.list.remove_listener(id);
        }
        self.index.lock().expect("Reference lock poisoned").clear();
    }
}

/// Name table of cache references.
#[derive(Default)]
pub struct CacheReferences {
    table: Mutex<HashMap<String, Arc<CacheReference>>>,
}

impl CacheReferences {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The reference for (`tag`, `field`), created on first use.
    pub fn get_or_create(
        &self,
        tag: &TypeTag,
        field: &str,
        owner: &DataSourceOwner,
    ) -> Result<Arc<CacheReference>, RegistryError> {
        let mut table = self.table.lock().expect("Reference table lock poisoned");
        let name = reference_name(tag, field);
        if let Some(existing) = table.get(&name) {
            return Ok(Arc::clone(existing));
        }
        let reference = Arc::new(CacheReference::new(tag, field, owner)?);
        table.insert(name, Arc::clone(&reference));
        Ok(reference)
    }

    /// The reference for (`tag`, `field`), if configured.
    pub fn get(&self, tag: &TypeTag, field: &str) -> Option<Arc<CacheReference>> {
        self.table
            .lock()
            .expect("Reference table lock poisoned")
            .get(&reference_name(tag, field))
            .cloned()
    }

    /// Items of `tag` whose `field` equals `key`.
    pub fn get_referencing_objects(
        &self,
        tag: &TypeTag,
        field: &str,
        key: &str,
        owner: &DataSourceOwner,
    ) -> Result<Vec<Item>, RegistryError> {
        Ok(self.get_or_create(tag, field, owner)?.get_mapping(key))
    }

    /// Replaces the whole table with fresh references for `specs`.
    pub fn rebuild(&self, specs: &[ReferenceSpec], owner: &DataSourceOwner) -> Result<(), RegistryError> {
        let mut fresh = HashMap::with_capacity(specs.len());
        for spec in specs {
            match CacheReference::new(&spec.item_type, &spec.field, owner) {
                Ok(reference) => {
                    fresh.insert(spec.name(), Arc::new(reference));
                }
                Err(e) => {
                    // the table keeps its previous references
                    for reference in fresh.values() {
                        reference.destroy();
                    }
                    return Err(e);
                }
            }
        }
        let stale = std::mem::replace(
            &mut *self.table.lock().expect("Reference table lock poisoned"),
            fresh,
        );
        for reference in stale.values() {
            reference.destroy();
        }
        log::info!("Rebuilt {} cache references", specs.len());
        Ok(())
    }

    /// Destroys every reference.
    pub fn clear(&self) {
        let stale: Vec<Arc<CacheReference>> = self
            .table
            .lock()
            .expect("Reference table lock poisoned")
            .drain()
            .map(|(_, r)| r)
            .collect();
        for reference in stale {
            reference.destroy();
        }
    }

    /// Number of references.
    pub fn len(&self) -> usize {
        self.table.lock().expect("Reference table lock poisoned").len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Record;

    fn setup() -> (DataSourceOwner, Arc<DataList>) {
        let owner = DataSourceOwner::global();
        let list = Arc::new(DataList::new(
            "INSTR",
            TypeTag::new("Instrument"),
            vec!["id".into()],
        ));
        owner.put_data_source(Arc::clone(&list)).unwrap();
        (owner, list)
    }

    fn instrument(id: &str, issuer: Option<&str>) -> Item {
        let mut record = Record::new("Instrument").with("id", id);
        if let Some(issuer) = issuer {
            record = record.with("issuerId", issuer);
        }
        record.into_item()
    }

    fn ids(items: &[Item]) -> Vec<String> {
        items
            .iter()
            .filter_map(|i| attribute_string(&**i, "id"))
            .collect()
    }

    #[test]
    fn snapshot_then_incremental_updates() {
        let (owner, list) = setup();
        list.upsert(instrument("A", Some("X"))).unwrap();

        let reference = CacheReference::new(&TypeTag::new("Instrument"), "issuerId", &owner).unwrap();
        assert_eq!(ids(&reference.get_mapping("X")), vec!["A"]);

        list.upsert(instrument("B", Some("X"))).unwrap();
        assert_eq!(ids(&reference.get_mapping("X")), vec!["A", "B"]);

        list.upsert(instrument("A", Some("Y"))).unwrap();
        assert_eq!(ids(&reference.get_mapping("X")), vec!["B"]);
        assert_eq!(ids(&reference.get_mapping("Y")), vec!["A"]);

        list.upsert(instrument("A", None)).unwrap();
        assert!(reference.get_mapping("Y").is_empty());
        assert_eq!(reference.value_count(), 1);
    }

    #[test]
    fn mappings_are_snapshots() {
        let (owner, list) = setup();
        list.upsert(instrument("A", Some("X"))).unwrap();
        let reference = CacheReference::new(&TypeTag::new("Instrument"), "issuerId", &owner).unwrap();

        let before = reference.get_mapping("X");
        list.upsert(instrument("B", Some("X"))).unwrap();
        assert_eq!(ids(&before), vec!["A"]);
        assert_eq!(ids(&reference.get_mapping("X")), vec!["A", "B"]);
    }

    #[test]
    fn add_then_remove_leaves_no_bucket() {
        let (owner, list) = setup();
        let reference = CacheReference::new(&TypeTag::new("Instrument"), "issuerId", &owner).unwrap();
        assert_eq!(reference.value_count(), 0);

        let item = instrument("A", Some("X"));
        list.upsert(Arc::clone(&item)).unwrap();
        list.remove(&*item).unwrap();
        assert_eq!(reference.value_count(), 0);
        assert!(reference.get_mapping("X").is_empty());
    }

    #[test]
    fn missing_type_is_reported() {
        let (owner, _list) = setup();
        assert!(matches!(
            CacheReference::new(&TypeTag::new("Bond"), "issuerId", &owner),
            Err(RegistryError::NoListForType(_))
        ));
    }

    #[test]
    fn table_rebuild_detaches_old_references() {
        let (owner, list) = setup();
        let references = CacheReferences::new();
        let tag = TypeTag::new("Instrument");
        let first = references.get_or_create(&tag, "issuerId", &owner).unwrap();
        assert!(Arc::ptr_eq(&first, &references.get_or_create(&tag, "issuerId", &owner).unwrap()));
        assert_eq!(list.listener_count(), 1);

        references
            .rebuild(&[ReferenceSpec::new("Instrument", "issuerId")], &owner)
            .unwrap();
        assert_eq!(list.listener_count(), 1);
        assert!(!Arc::ptr_eq(&first, &references.get(&tag, "issuerId").unwrap()));

        list.upsert(instrument("A", Some("X"))).unwrap();
        let found = references.get_referencing_objects(&tag, "issuerId", "X", &owner).unwrap();
        assert_eq!(ids(&found), vec!["A"]);
        assert!(first.get_mapping("X").is_empty());

        references.clear();
        assert!(references.is_empty());
        assert_eq!(list.listener_count(), 0);
    }
}
