//! # Class-to-List Router
//!
//! Delivers broadcast items to the lists registered for their class.
//!
//! A list registered for class `C` also receives instances of every class
//! derived from `C`. Registration order does not matter: when a descendant is
//! registered before its ancestor has any list, the descendant is parked in the
//! pending-ancestor table and picks up the ancestor's lists as soon as they are
//! registered. Map-keyed types never take part in this propagation.
//!
//! Tagged definitions (`tree`, `listTree`) are not class-keyed; they are looked
//! up in the tag table and handed to the [`DefinitionInstaller`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::core::dispatcher::{BdxListener, Broadcast, DispatchError, TaggedDefinition};
use crate::core::list::DataList;
use crate::core::types::{Item, TypeRegistry, TypeTag};

/// Kind of a tagged definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionTag {
    /// A tree definition.
    Tree,
    /// A single-list recursive tree definition.
    ListTree,
}

/// Installs tagged definitions as new root data sources.
pub trait DefinitionInstaller: Send + Sync {
    /// Handles one definition.
    fn install(&self, tag: DefinitionTag, definition: &TaggedDefinition) -> Result<(), DispatchError>;
}

#[derive(Default)]
struct RouteTable {
    direct: HashMap<TypeTag, Vec<Arc<DataList>>>,
    routes: HashMap<TypeTag, Vec<Arc<DataList>>>,
    pending: HashMap<TypeTag, HashSet<TypeTag>>,
}

impl RouteTable {
    fn add_route(&mut self, tag: &TypeTag, list: &Arc<DataList>) {
        let routes = self.routes.entry(tag.clone()).or_default();
        if !routes.iter().any(|l| Arc::ptr_eq(l, list)) {
            routes.push(Arc::clone(list));
        }
    }
}

/// # Class Router
///
/// Catch-all broadcast listener feeding reference lists.
pub struct ClassRouter {
    types: Arc<TypeRegistry>,
    table: Mutex<RouteTable>,
    tags: HashMap<String, DefinitionTag>,
    installer: Mutex<Option<Arc<dyn DefinitionInstaller>>>,
}

impl ClassRouter {
    /// A router resolving ancestors through `types`.
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        let tags = HashMap::from([
            ("tree".to_string(), DefinitionTag::Tree),
            ("listTree".to_string(), DefinitionTag::ListTree),
        ]);
        Self {
            types,
            table: Mutex::new(RouteTable::default()),
            tags,
            installer: Mutex::new(None),
        }
    }

    /// Sets the handler for tagged definitions.
    pub fn set_installer(&self, installer: Arc<dyn DefinitionInstaller>) {
        *self.installer.lock().expect("Router lock poisoned") = Some(installer);
    }

    /// Tag table lookup.
    pub fn definition_tag(&self, tag: &str) -> Option<DefinitionTag> {
        self.tags.get(tag).copied()
    }

    fn propagates(&self, tag: &TypeTag) -> bool {
        !self.types.meta(tag).is_some_and(|m| m.map_keyed)
    }

    /// # Register
    ///
    /// Routes instances of `tag` (and of its descendants) to `list`.
    pub fn register(&self, tag: &TypeTag, list: Arc<DataList>) {
        let mut table = self.table.lock().expect("Router lock poisoned");
        let direct = table.direct.entry(tag.clone()).or_default();
        if direct.iter().any(|l| Arc::ptr_eq(l, &list)) {
            return;
        }
        direct.push(Arc::clone(&list));
        table.add_route(tag, &list);

        // Descendants registered earlier now reach this list too.
        let waiting: Vec<TypeTag> = table
            .pending
            .get(tag)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for descendant in &waiting {
            table.add_route(descendant, &list);
        }

        if self.propagates(tag) {
            for ancestor in self.types.ancestors(tag) {
                let inherited: Vec<Arc<DataList>> = table.direct.get(ancestor).cloned().unwrap_or_default();
                for ancestor_list in &inherited {
                    table.add_route(tag, ancestor_list);
                }
                table.pending.entry(ancestor.clone()).or_default().insert(tag.clone());
            }
        }
        log::debug!(
            "Routing {} to list '{}' ({} routes)",
            tag,
            list.id(),
            table.routes.get(tag).map_or(0, Vec::len)
        );
    }

    /// Removes every route to the list `list_id`.
    pub fn unregister(&self, list_id: &str) {
        let mut guard = self.table.lock().expect("Router lock poisoned");
        let table = &mut *guard;
        for lists in table.direct.values_mut().chain(table.routes.values_mut()) {
            lists.retain(|l| l.id() != list_id);
        }
        table.direct.retain(|_, lists| !lists.is_empty());
        table.routes.retain(|_, lists| !lists.is_empty());
    }

    /// Lists fed by instances of `tag`. A class with no route table entry
    /// falls back to its nearest ancestor that has one.
    pub fn routes_for(&self, tag: &TypeTag) -> Vec<Arc<DataList>> {
        let table = self.table.lock().expect("Router lock poisoned");
        if let Some(lists) = table.routes.get(tag) {
            return lists.clone();
        }
        if !self.propagates(tag) {
            return Vec::new();
        }
        self.types
            .ancestors(tag)
            .iter()
            .find_map(|ancestor| table.routes.get(ancestor))
            .cloned()
            .unwrap_or_default()
    }

    /// # Deliver
    ///
    /// Upserts (or removes) `item` in every routed list. Returns whether at
    /// least one list ingested it. Destroyed lists are dropped from the table.
    pub fn deliver(&self, item: &Item, remove: bool) -> bool {
        let mut ingested = false;
        let mut dead = Vec::new();
        for list in self.routes_for(item.type_tag()) {
            if list.is_destroyed() {
                dead.push(list.id().to_string());
                continue;
            }
            let outcome = if remove {
                list.remove(&**item).map(|_| ())
            } else {
                list.upsert(Arc::clone(item))
            };
            match outcome {
                Ok(()) => ingested = true,
                Err(e) => log::warn!("List '{}' rejected {}: {}", list.id(), item.type_tag(), e),
            }
        }
        for id in dead {
            self.unregister(&id);
        }
        ingested
    }

    fn clear(&self, tag: &TypeTag) {
        for list in self.routes_for(tag) {
            list.clear();
        }
    }

    fn install(&self, definition: &TaggedDefinition) -> Result<(), DispatchError> {
        let Some(kind) = self.definition_tag(&definition.tag) else {
            log::trace!("No handler for tagged definition '{}'", definition.tag);
            return Ok(());
        };
        let installer = self.installer.lock().expect("Router lock poisoned").clone();
        match installer {
            Some(installer) => installer.install(kind, definition),
            None => Err(DispatchError::Listener(format!(
                "no installer for '{}' definitions",
                definition.tag
            ))),
        }
    }
}

impl BdxListener for ClassRouter {
    fn name(&self) -> String {
        "class-router".to_string()
    }

    fn on_broadcast(&self, event: &Broadcast) -> Result<(), DispatchError> {
        match event {
            Broadcast::Item(item) => {
                if !self.deliver(item, false) {
                    log::trace!("No list ingested {}", item.type_tag());
                }
            }
            Broadcast::Remove(item) => {
                self.deliver(item, true);
            }
            Broadcast::Clear(tag) => self.clear(tag),
            Broadcast::Definition(definition) => self.install(definition)?,
            Broadcast::Pulse(_) | Broadcast::Envelope(_) | Broadcast::Stop => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Record, TypeMeta};

    fn types() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::new(vec![
                TypeMeta::new("Instrument", "id"),
                TypeMeta::new("Bond", "id").with_parent("Instrument"),
                TypeMeta::new("Callable", "id").with_parent("Bond"),
                TypeMeta {
                    map_keyed: true,
                    ..TypeMeta::new("Quote", "id").with_parent("Instrument")
                },
            ])
            .unwrap(),
        )
    }

    fn list(id: &str, ty: &str) -> Arc<DataList> {
        Arc::new(DataList::new(id, TypeTag::new(ty), vec!["id".into()]))
    }

    fn item(ty: &str, id: &str) -> Item {
        Record::new(ty).with("id", id).into_item()
    }

    #[test]
    fn descendants_reach_ancestor_lists_in_either_order() {
        let router = ClassRouter::new(types());
        let bonds = list("BONDS", "Bond");
        let instruments = list("INSTR", "Instrument");

        // Bond registered before its ancestor has a list.
        router.register(&TypeTag::new("Bond"), Arc::clone(&bonds));
        router.register(&TypeTag::new("Instrument"), Arc::clone(&instruments));

        assert!(router.deliver(&item("Bond", "B1"), false));
        assert!(bonds.contains_key("B1"));
        assert!(instruments.contains_key("B1"));

        assert!(router.deliver(&item("Instrument", "I1"), false));
        assert!(instruments.contains_key("I1"));
        assert!(!bonds.contains_key("I1"));
    }

    #[test]
    fn unregistered_classes_fall_back_to_the_nearest_ancestor() {
        let router = ClassRouter::new(types());
        let bonds = list("BONDS", "Bond");
        router.register(&TypeTag::new("Bond"), Arc::clone(&bonds));

        assert!(router.deliver(&item("Callable", "C1"), false));
        assert!(bonds.contains_key("C1"));
        assert!(!router.deliver(&item("Instrument", "I1"), false));
    }

    #[test]
    fn map_keyed_types_do_not_propagate() {
        let router = ClassRouter::new(types());
        let instruments = list("INSTR", "Instrument");
        let quotes = list("QUOTES", "Quote");
        router.register(&TypeTag::new("Instrument"), Arc::clone(&instruments));
        router.register(&TypeTag::new("Quote"), Arc::clone(&quotes));

        router.deliver(&item("Quote", "Q1"), false);
        assert!(quotes.contains_key("Q1"));
        assert!(!instruments.contains_key("Q1"));
    }

    #[test]
    fn removal_and_unregistration() {
        let router = ClassRouter::new(types());
        let instruments = list("INSTR", "Instrument");
        router.register(&TypeTag::new("Instrument"), Arc::clone(&instruments));

        router.on_broadcast(&Broadcast::Item(item("Instrument", "A"))).unwrap();
        router.on_broadcast(&Broadcast::Remove(item("Instrument", "A"))).unwrap();
        assert!(instruments.is_empty());

        router.unregister("INSTR");
        assert!(router.routes_for(&TypeTag::new("Instrument")).is_empty());
    }

    #[test]
    fn destroyed_lists_are_pruned() {
        let router = ClassRouter::new(types());
        let instruments = list("INSTR", "Instrument");
        router.register(&TypeTag::new("Instrument"), Arc::clone(&instruments));
        instruments.destroy();

        assert!(!router.deliver(&item("Instrument", "A"), false));
        assert!(router.routes_for(&TypeTag::new("Instrument")).is_empty());
    }

    #[test]
    fn tagged_definitions_need_an_installer() {
        struct Recorder(Mutex<Vec<DefinitionTag>>);
        impl DefinitionInstaller for Recorder {
            fn install(&self, tag: DefinitionTag, _definition: &TaggedDefinition) -> Result<(), DispatchError> {
                self.0.lock().unwrap().push(tag);
                Ok(())
            }
        }

        let router = ClassRouter::new(types());
        let definition = |tag: &str| {
            Broadcast::Definition(TaggedDefinition {
                tag: tag.into(),
                body: serde_json::json!({}),
            })
        };
        assert!(router.on_broadcast(&definition("tree")).is_err());

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        router.set_installer(recorder.clone());
        router.on_broadcast(&definition("listTree")).unwrap();
        router.on_broadcast(&definition("unknown")).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![DefinitionTag::ListTree]);
    }
}
