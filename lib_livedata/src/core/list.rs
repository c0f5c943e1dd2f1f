//! # Materialized Lists
//!
//! A [`DataList`] is a named, key-indexed collection kept current by broadcast
//! events. Every mutation is announced to the list's listeners as a
//! [`ListEvent`]; derived views, reference indexes and tree attachments are all
//! just listeners.
//!
//! Mutations are expected to arrive from the single dispatcher thread, so the
//! list never sees two concurrent writers. The internal locks only guard
//! against readers on other threads (viewports, request handlers) and keep the
//! critical sections short: listeners are always invoked with no list lock
//! held.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::registry::Scope;
use crate::core::types::{attribute_string, key_of, Item, ListItem, TypeTag};

/// Handle returned by [`DataList::add_listener`].
pub type ListenerId = u64;

/// Change notification emitted by a list.
#[derive(Debug, Clone)]
pub enum ListEvent {
    /// Full current content. Sent to a listener when it attaches and to all
    /// listeners after [`DataList::load`].
    Snapshot(Vec<Item>),
    /// A new key appeared.
    Add(Item),
    /// An existing key received a new item.
    Update {
        /// The replaced item.
        old: Item,
        /// The item now stored under the key.
        new: Item,
    },
    /// A key was removed; carries the removed item.
    Remove(Item),
    /// Everything was removed.
    Clear,
}

/// Receiver of [`ListEvent`]s.
pub trait ListListener: Send + Sync {
    /// Identity used in logs.
    fn name(&self) -> String;
    /// Called for every event, with no list lock held.
    fn on_list_event(&self, list: &DataList, event: &ListEvent);
}

/// Inclusion predicate for filtered views.
pub trait Filter: Send + Sync + fmt::Debug {
    /// Stable identity; part of the composite data-source key.
    fn id(&self) -> String;
    /// Whether the item belongs in the view.
    fn include(&self, item: &dyn ListItem) -> bool;
}

/// Ordering for sorted views.
pub trait Sort: Send + Sync + fmt::Debug {
    /// Stable identity; part of the composite data-source key.
    fn id(&self) -> String;
    /// Total order over items.
    fn compare(&self, a: &dyn ListItem, b: &dyn ListItem) -> CmpOrdering;
}

/// Errors raised by list mutations.
#[derive(Debug, Error)]
pub enum ListError {
    /// The item lacks one of the key attributes.
    #[error("{item_type} item has no key for list {list}")]
    Unkeyable {
        /// The list id.
        list: String,
        /// The offending item's type.
        item_type: TypeTag,
    },
    /// The list has been destroyed.
    #[error("list {0} is destroyed")]
    Destroyed(String),
}

#[derive(Default)]
struct ListState {
    items: HashMap<String, Item>,
    order: Vec<String>,
}

/// A registered listener. Until its initial snapshot has been handed over,
/// events fired at it are queued in `backlog` and replayed in order after the
/// snapshot.
struct ListenerSlot {
    listener: Arc<dyn ListListener>,
    backlog: Mutex<Option<Vec<ListEvent>>>,
}

struct Upstream {
    parent: Arc<DataList>,
    listener: ListenerId,
}

/// # Data List
///
/// See the module documentation.
pub struct DataList {
    id: String,
    item_type: TypeTag,
    key_attributes: Vec<String>,
    text_attribute: Option<String>,
    filter: Option<Arc<dyn Filter>>,
    sort: Option<Arc<dyn Sort>>,
    origin: Scope,
    state: Mutex<ListState>,
    listeners: Mutex<Vec<(ListenerId, Arc<ListenerSlot>)>>,
    next_listener: AtomicU64,
    holders: AtomicUsize,
    idle_since: Mutex<Option<Instant>>,
    permanent: AtomicBool,
    destroyed: AtomicBool,
    upstream: Mutex<Option<Upstream>>,
}

impl fmt::Debug for DataList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataList")
            .field("id", &self.id)
            .field("item_type", &self.item_type)
            .field("len", &self.len())
            .field("origin", &self.origin)
            .finish()
    }
}

impl DataList {
    /// A new, empty, Global-origin list.
    pub fn new(id: impl Into<String>, item_type: TypeTag, key_attributes: Vec<String>) -> Self {
        Self {
            id: id.into(),
            item_type,
            key_attributes,
            text_attribute: None,
            filter: None,
            sort: None,
            origin: Scope::Global,
            state: Mutex::new(ListState::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            holders: AtomicUsize::new(0),
            idle_since: Mutex::new(Some(Instant::now())),
            permanent: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            upstream: Mutex::new(None),
        }
    }

    /// Sets the display text attribute.
    pub fn with_text_attribute(mut self, attribute: Option<String>) -> Self {
        self.text_attribute = attribute;
        self
    }

    /// Keeps items ordered by `sort`.
    pub fn with_sort(mut self, sort: Option<Arc<dyn Sort>>) -> Self {
        self.sort = sort;
        self
    }

    /// Sets the owner scope that created this list.
    pub fn with_origin(mut self, origin: Scope) -> Self {
        self.origin = origin;
        self
    }

    /// # Derive
    ///
    /// Builds a child view of `parent` that holds the parent's items accepted
    /// by `filter`, ordered by `sort`. The child is fed by a listener on the
    /// parent and detaches from it when destroyed.
    pub fn derive(
        parent: &Arc<DataList>,
        id: impl Into<String>,
        filter: Option<Arc<dyn Filter>>,
        sort: Option<Arc<dyn Sort>>,
        origin: Scope,
    ) -> Arc<DataList> {
        let mut child = DataList::new(id, parent.item_type.clone(), parent.key_attributes.clone())
            .with_text_attribute(parent.text_attribute.clone())
            .with_sort(sort)
            .with_origin(origin);
        child.filter = filter.clone();
        let child = Arc::new(child);

        let view = Arc::new(DerivedView {
            target: Arc::downgrade(&child),
            filter,
        });
        let listener = parent.add_listener(view);
        *child.upstream.lock().expect("List lock poisoned") = Some(Upstream {
            parent: Arc::clone(parent),
            listener,
        });
        child
    }

    /// The list id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared item type.
    pub fn item_type(&self) -> &TypeTag {
        &self.item_type
    }

    /// Attributes forming the key.
    pub fn key_attributes(&self) -> &[String] {
        &self.key_attributes
    }

    /// Scope of the owner that created the list.
    pub fn origin(&self) -> &Scope {
        &self.origin
    }

    /// Id of the filter this view applies, if any.
    pub fn filter_id(&self) -> Option<String> {
        self.filter.as_ref().map(|f| f.id())
    }

    /// Id of the sort this view applies, if any.
    pub fn sort_id(&self) -> Option<String> {
        self.sort.as_ref().map(|s| s.id())
    }

    /// Id of the list this view is derived from.
    pub fn source_id(&self) -> Option<String> {
        self.upstream
            .lock()
            .expect("List lock poisoned")
            .as_ref()
            .map(|u| u.parent.id.clone())
    }

    /// Key of `item` in this list.
    pub fn key_for(&self, item: &dyn ListItem) -> Result<String, ListError> {
        key_of(item, &self.key_attributes).ok_or_else(|| ListError::Unkeyable {
            list: self.id.clone(),
            item_type: item.type_tag().clone(),
        })
    }

    /// Display text of `item`: the text attribute, falling back to the key.
    pub fn text_of(&self, item: &dyn ListItem) -> String {
        self.text_attribute
            .as_deref()
            .and_then(|attribute| attribute_string(item, attribute))
            .or_else(|| key_of(item, &self.key_attributes))
            .unwrap_or_default()
    }

    /// Item stored under `key`.
    pub fn get(&self, key: &str) -> Option<Item> {
        self.state.lock().expect("List lock poisoned").items.get(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().expect("List lock poisoned").items.contains_key(key)
    }

    /// All items in list order.
    pub fn values(&self) -> Vec<Item> {
        let state = self.state.lock().expect("List lock poisoned");
        state.order.iter().filter_map(|k| state.items.get(k).cloned()).collect()
    }

    /// All keys in list order.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().expect("List lock poisoned").order.clone()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.state.lock().expect("List lock poisoned").items.len()
    }

    /// Whether the list holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Upsert
    ///
    /// Stores `item` under its key, emitting `Add` for a new key and `Update`
    /// otherwise. Sorted lists move the item to its ordered position.
    pub fn upsert(&self, item: Item) -> Result<(), ListError> {
        self.ensure_alive()?;
        let key = self.key_for(&*item)?;
        let event = {
            let mut guard = self.state.lock().expect("List lock poisoned");
            let state = &mut *guard;
            match state.items.insert(key.clone(), Arc::clone(&item)) {
                Some(old) => {
                    if let Some(sort) = &self.sort {
                        state.order.retain(|k| k != &key);
                        let at = Self::sorted_position(&state.order, &state.items, sort.as_ref(), &*item);
                        state.order.insert(at, key);
                    }
                    ListEvent::Update { old, new: item }
                }
                None => {
                    let at = match &self.sort {
                        Some(sort) => Self::sorted_position(&state.order, &state.items, sort.as_ref(), &*item),
                        None => state.order.len(),
                    };
                    state.order.insert(at, key);
                    ListEvent::Add(item)
                }
            }
        };
        self.fire(&event);
        Ok(())
    }

    /// Removes the item stored under the key of `item`.
    pub fn remove(&self, item: &dyn ListItem) -> Result<Option<Item>, ListError> {
        self.ensure_alive()?;
        let key = self.key_for(item)?;
        Ok(self.remove_key(&key))
    }

    /// Removes `key`, emitting `Remove` when it was present.
    pub fn remove_key(&self, key: &str) -> Option<Item> {
        let removed = {
            let mut state = self.state.lock().expect("List lock poisoned");
            let removed = state.items.remove(key);
            if removed.is_some() {
                state.order.retain(|k| k != key);
            }
            removed
        };
        if let Some(item) = &removed {
            self.fire(&ListEvent::Remove(Arc::clone(item)));
        }
        removed
    }

    /// Removes everything, emitting `Clear`.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock().expect("List lock poisoned");
            state.items.clear();
            state.order.clear();
        }
        self.fire(&ListEvent::Clear);
    }

    /// # Load
    ///
    /// Replaces the whole content and announces it with a `Snapshot`.
    /// Un-keyable items are skipped with a warning.
    pub fn load(&self, items: Vec<Item>) -> Result<(), ListError> {
        self.ensure_alive()?;
        let snapshot = {
            let mut guard = self.state.lock().expect("List lock poisoned");
            let state = &mut *guard;
            state.items.clear();
            state.order.clear();
            for item in items {
                let key = match self.key_for(&*item) {
                    Ok(key) => key,
                    Err(e) => {
                        log::warn!("{}", e);
                        continue;
                    }
                };
                if state.items.insert(key.clone(), item).is_none() {
                    state.order.push(key);
                }
            }
            if let Some(sort) = &self.sort {
                let items = &state.items;
                state.order.sort_by(|a, b| sort.compare(&*items[a], &*items[b]));
            }
            state.order.iter().filter_map(|k| state.items.get(k).cloned()).collect::<Vec<_>>()
        };
        self.fire(&ListEvent::Snapshot(snapshot));
        Ok(())
    }

    /// # Add Listener
    ///
    /// Registers `listener` and immediately hands it a `Snapshot` of the
    /// current content. Events fired by other threads while the snapshot is
    /// being delivered reach the listener after it, in firing order.
    pub fn add_listener(&self, listener: Arc<dyn ListListener>) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ListenerSlot {
            listener,
            backlog: Mutex::new(Some(Vec::new())),
        });
        let snapshot = {
            let state = self.state.lock().expect("List lock poisoned");
            self.listeners
                .lock()
                .expect("List lock poisoned")
                .push((id, Arc::clone(&slot)));
            state.order.iter().filter_map(|k| state.items.get(k).cloned()).collect::<Vec<_>>()
        };
        *self.idle_since.lock().expect("List lock poisoned") = None;
        Self::deliver(self, &slot.listener, &ListEvent::Snapshot(snapshot));

        loop {
            let queued = {
                let mut backlog = slot.backlog.lock().expect("List lock poisoned");
                let queued = backlog.take().unwrap_or_default();
                if queued.is_empty() {
                    break;
                }
                *backlog = Some(Vec::new());
                queued
            };
            for event in &queued {
                Self::deliver(self, &slot.listener, event);
            }
        }
        id
    }

    /// Detaches a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.listeners.lock().expect("List lock poisoned");
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            before != listeners.len()
        };
        if removed {
            self.mark_idle_if_unused();
        }
        removed
    }

    /// Number of attached listeners (child views, indexes, tree attachments).
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("List lock poisoned").len()
    }

    /// Registers an external holder.
    pub fn acquire(&self) {
        self.holders.fetch_add(1, Ordering::SeqCst);
        *self.idle_since.lock().expect("List lock poisoned") = None;
    }

    /// Releases an external holder.
    pub fn release(&self) {
        let _ = self
            .holders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.mark_idle_if_unused();
    }

    /// Current number of external holders.
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    /// Whether anything (holder or listener) uses the list.
    pub fn is_in_use(&self) -> bool {
        self.holders() > 0 || self.listener_count() > 0
    }

    /// How long the list has been unused; `None` while in use.
    pub fn idle_for(&self) -> Option<Duration> {
        if self.is_in_use() {
            return None;
        }
        self.idle_since
            .lock()
            .expect("List lock poisoned")
            .map(|since| since.elapsed())
    }

    /// Restarts the idle clock of an unused list.
    pub fn touch(&self) {
        let mut idle = self.idle_since.lock().expect("List lock poisoned");
        if idle.is_some() {
            *idle = Some(Instant::now());
        }
    }

    /// Marks the list as exempt from idle eviction.
    pub fn set_permanent(&self, permanent: bool) {
        self.permanent.store(permanent, Ordering::SeqCst);
    }

    /// Whether the list is exempt from idle eviction.
    pub fn is_permanent(&self) -> bool {
        self.permanent.load(Ordering::SeqCst)
    }

    /// Whether [`DataList::destroy`] already ran.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// # Destroy
    ///
    /// Detaches from the source list, drops all listeners and items.
    /// Returns `false` when the list was already destroyed.
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(upstream) = self.upstream.lock().expect("List lock poisoned").take() {
            upstream.parent.remove_listener(upstream.listener);
        }
        self.listeners.lock().expect("List lock poisoned").clear();
        let mut state = self.state.lock().expect("List lock poisoned");
        state.items.clear();
        state.order.clear();
        log::debug!("List '{}' destroyed", self.id);
        true
    }

    fn ensure_alive(&self) -> Result<(), ListError> {
        if self.is_destroyed() {
            Err(ListError::Destroyed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    fn mark_idle_if_unused(&self) {
        if !self.is_in_use() {
            let mut idle = self.idle_since.lock().expect("List lock poisoned");
            if idle.is_none() {
                *idle = Some(Instant::now());
            }
        }
    }

    fn sorted_position(
        order: &[String],
        items: &HashMap<String, Item>,
        sort: &dyn Sort,
        item: &dyn ListItem,
    ) -> usize {
        order.partition_point(|k| {
            items
                .get(k)
                .map(|existing| sort.compare(&**existing, item) != CmpOrdering::Greater)
                .unwrap_or(true)
        })
    }

    fn fire(&self, event: &ListEvent) {
        let slots: Vec<Arc<ListenerSlot>> = self
            .listeners
            .lock()
            .expect("List lock poisoned")
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in &slots {
            if let Some(queued) = slot.backlog.lock().expect("List lock poisoned").as_mut() {
                queued.push(event.clone());
                continue;
            }
            Self::deliver(self, &slot.listener, event);
        }
    }

    fn deliver(list: &DataList, listener: &Arc<dyn ListListener>, event: &ListEvent) {
        if catch_unwind(AssertUnwindSafe(|| listener.on_list_event(list, event))).is_err() {
            log::error!(
                "List '{}' listener '{}' panicked; continuing with remaining listeners",
                list.id,
                listener.name()
            );
        }
    }
}

/// Feeds a derived child list from its parent.
struct DerivedView {
    target: Weak<DataList>,
    filter: Option<Arc<dyn Filter>>,
}

impl DerivedView {
    fn accepts(&self, item: &dyn ListItem) -> bool {
        self.filter.as_ref().map_or(true, |f| f.include(item))
    }
}

impl ListListener for DerivedView {
    fn name(&self) -> String {
        match self.target.upgrade() {
            Some(target) => format!("view:{}", target.id),
            None => "view:<dropped>".to_string(),
        }
    }

    fn on_list_event(&self, _list: &DataList, event: &ListEvent) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        let outcome = match event {
            ListEvent::Snapshot(items) => target.load(
                items
                    .iter()
                    .filter(|item| self.accepts(&***item))
                    .cloned()
                    .collect(),
            ),
            ListEvent::Add(item) if self.accepts(&**item) => target.upsert(Arc::clone(item)),
            ListEvent::Add(_) => Ok(()),
            ListEvent::Update { old, new } => {
                if self.accepts(&**new) {
                    target.upsert(Arc::clone(new))
                } else {
                    target.remove(&**old).map(|_| ())
                }
            }
            ListEvent::Remove(item) => target.remove(&**item).map(|_| ()),
            ListEvent::Clear => {
                target.clear();
                Ok(())
            }
        };
        if let Err(e) = outcome {
            log::debug!("View '{}' skipped event: {}", target.id, e);
        }
    }
}
