//! # Data Source Registry
//!
//! Materialized lists are owned by scopes. The Global owner holds the
//! reference data fed by the router; Member and User owners are created on
//! demand and derive filtered and sorted views of whatever their parent scope
//! can see.
//!
//! ## Lifecycle
//!
//! - **Global**: created once at startup. Its lists are permanent and also
//!   indexed by item type for class-based lookups.
//! - **Member / User**: created lazily on first access, populated from the
//!   definitions of their scope level, and swept by a periodic cleanup task
//!   that evicts lists nobody has used for longer than the idle timeout.
//!   A User owner is destroyed when its last holder releases it; a Member
//!   owner only when explicitly destroyed (taking its users with it).
//!
//! ## Eviction and acquisition
//!
//! Lookups and eviction decisions are made under the same owner table lock.
//! A lookup restarts the list's idle clock, and
//! [`DataSourceOwner::acquire_data_source`] registers the caller as a holder
//! before the lock is released, so a list handed out by `acquire` can never be
//! evicted underneath its new holder.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::core::definitions::{instantiate, DataSourceDefinition, DataSourceKind, FactoryRegistry};
use crate::core::filters::FilterError;
use crate::core::list::{DataList, Filter, Sort};
use crate::core::router::ClassRouter;
use crate::core::types::TypeTag;

/// Visibility level of an owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Process-wide reference data.
    Global,
    /// One member firm.
    Member {
        /// Member id.
        member_id: String,
    },
    /// One user of a member.
    User {
        /// Owning member id.
        member_id: String,
        /// User id.
        user_id: String,
    },
}

impl Scope {
    /// Level of this scope.
    pub fn level(&self) -> ScopeLevel {
        match self {
            Scope::Global => ScopeLevel::Global,
            Scope::Member { .. } => ScopeLevel::Member,
            Scope::User { .. } => ScopeLevel::User,
        }
    }

    /// A member scope.
    pub fn member(member_id: &str) -> Self {
        Scope::Member {
            member_id: member_id.to_string(),
        }
    }

    /// A user scope.
    pub fn user(member_id: &str, user_id: &str) -> Self {
        Scope::User {
            member_id: member_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Member { member_id } => write!(f, "member:{}", member_id),
            Scope::User { member_id, user_id } => write!(f, "user:{}/{}", member_id, user_id),
        }
    }
}

/// Scope level a data source definition is instantiated at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    /// Instantiated once at startup.
    #[default]
    Global,
    /// Instantiated in every member owner.
    Member,
    /// Instantiated in every user owner.
    User,
}

/// Composite key of an owner's table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataSourceKey {
    /// Data source id.
    pub id: String,
    /// Filter id, if filtered.
    pub filter: Option<String>,
    /// Sort id, if sorted.
    pub sort: Option<String>,
}

impl DataSourceKey {
    /// Builds a key.
    pub fn new(id: &str, filter: Option<String>, sort: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            filter,
            sort,
        }
    }

    /// Key of an unfiltered, unsorted data source.
    pub fn plain(id: &str) -> Self {
        Self::new(id, None, None)
    }
}

impl fmt::Display for DataSourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)?;
        if let Some(filter) = &self.filter {
            write!(f, "[{}]", filter)?;
        }
        if let Some(sort) = &self.sort {
            write!(f, "<{}>", sort)?;
        }
        Ok(())
    }
}

/// Errors raised by owners, definitions and the reference index.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The same key was registered twice in one owner.
    #[error("data source {id} registered twice in {scope}")]
    Duplicate {
        /// Owner scope.
        scope: Scope,
        /// Data source id.
        id: String,
    },
    /// No data source with this id is visible.
    #[error("data source {0} not found")]
    NotFound(String),
    /// No Global list holds items of this type.
    #[error("no global data source for type {0}")]
    NoListForType(TypeTag),
    /// Definitions still pending after the retry limit.
    #[error("unresolved data source definitions: {}", .0.join(", "))]
    Unresolved(Vec<String>),
    /// A definition names an undeclared type.
    #[error("no metadata for type {0}")]
    UnknownType(TypeTag),
    /// A definition names an unregistered factory.
    #[error("no data source factory named {0}")]
    UnknownFactory(String),
    /// A definition is inconsistent.
    #[error("invalid data source definition {id}: {reason}")]
    InvalidDefinition {
        /// Data source id.
        id: String,
        /// What is wrong.
        reason: String,
    },
    /// The owner has been destroyed.
    #[error("owner {0} is destroyed")]
    Destroyed(Scope),
    /// A configured filter could not be built.
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Idle eviction settings for non-global owners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OwnerSettings {
    /// How long a list may stay unused before it is evicted.
    pub idle_timeout: Duration,
    /// Period of the per-owner cleanup task.
    pub cleanup_interval: Duration,
}

impl Default for OwnerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct OwnerTables {
    members: HashMap<String, Arc<DataSourceOwner>>,
    users: HashMap<(String, String), Arc<DataSourceOwner>>,
}

impl OwnerTables {
    fn forget(&mut self, owner: &DataSourceOwner) {
        let same = |candidate: &Arc<DataSourceOwner>| std::ptr::eq(Arc::as_ptr(candidate), owner);
        match &owner.scope {
            Scope::Global => {}
            Scope::Member { member_id } => {
                if self.members.get(member_id).is_some_and(same) {
                    self.members.remove(member_id);
                }
            }
            Scope::User { member_id, user_id } => {
                let key = (member_id.clone(), user_id.clone());
                if self.users.get(&key).is_some_and(same) {
                    self.users.remove(&key);
                }
            }
        }
    }
}

/// # Data Source Owner
///
/// One scope's table of named, filtered and sorted lists.
pub struct DataSourceOwner {
    scope: Scope,
    parent: Option<Arc<DataSourceOwner>>,
    table: Mutex<HashMap<DataSourceKey, Arc<DataList>>>,
    by_type: Mutex<HashMap<TypeTag, Arc<DataList>>>,
    users: Mutex<HashSet<String>>,
    idle_timeout: Duration,
    cleanup: Mutex<Option<CancellationToken>>,
    destroyed: AtomicBool,
    root: Weak<Mutex<OwnerTables>>,
}

impl fmt::Debug for DataSourceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceOwner")
            .field("scope", &self.scope)
            .field("data_sources", &self.len())
            .finish()
    }
}

impl DataSourceOwner {
    /// A standalone Global owner.
    pub fn global() -> Self {
        Self::new(Scope::Global, None, Duration::MAX, Weak::new())
    }

    /// A standalone owner for `scope` under `parent`, not tracked by any
    /// [`OwnerRegistry`].
    pub fn with_parent(scope: Scope, parent: Arc<DataSourceOwner>, idle_timeout: Duration) -> Self {
        Self::new(scope, Some(parent), idle_timeout, Weak::new())
    }

    fn new(
        scope: Scope,
        parent: Option<Arc<DataSourceOwner>>,
        idle_timeout: Duration,
        root: Weak<Mutex<OwnerTables>>,
    ) -> Self {
        Self {
            scope,
            parent,
            table: Mutex::new(HashMap::new()),
            by_type: Mutex::new(HashMap::new()),
            users: Mutex::new(HashSet::new()),
            idle_timeout,
            cleanup: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            root,
        }
    }

    /// This owner's scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The owner this one delegates to.
    pub fn parent(&self) -> Option<&Arc<DataSourceOwner>> {
        self.parent.as_ref()
    }

    /// Number of table entries.
    pub fn len(&self) -> usize {
        self.table.lock().expect("Owner lock poisoned").len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every registered data source, as display keys.
    pub fn data_source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .table
            .lock()
            .expect("Owner lock poisoned")
            .keys()
            .map(DataSourceKey::to_string)
            .collect();
        ids.sort();
        ids
    }

    /// Whether [`DataSourceOwner::destroy`] already ran.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// # Get Data Source
    ///
    /// Resolves `id` in this owner or its ancestors and, when a filter or sort
    /// is given, derives the filtered then sorted view in this owner. Views are
    /// memoized: the same triple always yields the same list.
    pub fn get_data_source(
        &self,
        id: &str,
        filter: Option<Arc<dyn Filter>>,
        sort: Option<Arc<dyn Sort>>,
    ) -> Result<Arc<DataList>, RegistryError> {
        self.resolve(id, filter, sort, false)
    }

    /// Like [`DataSourceOwner::get_data_source`], and registers the caller as
    /// an external holder of the returned list before the owner lock is
    /// released. Pair with [`DataList::release`].
    pub fn acquire_data_source(
        &self,
        id: &str,
        filter: Option<Arc<dyn Filter>>,
        sort: Option<Arc<dyn Sort>>,
    ) -> Result<Arc<DataList>, RegistryError> {
        self.resolve(id, filter, sort, true)
    }

    fn resolve(
        &self,
        id: &str,
        filter: Option<Arc<dyn Filter>>,
        sort: Option<Arc<dyn Sort>>,
        acquire: bool,
    ) -> Result<Arc<DataList>, RegistryError> {
        self.ensure_alive()?;
        let key = DataSourceKey::new(
            id,
            filter.as_ref().map(|f| f.id()),
            sort.as_ref().map(|s| s.id()),
        );
        if let Some(list) = self.lookup(&key, acquire) {
            return Ok(list);
        }

        match (filter, sort) {
            (None, None) => match &self.parent {
                Some(parent) => parent.resolve(id, None, None, acquire),
                None => Err(RegistryError::NotFound(id.to_string())),
            },
            (Some(filter), None) => {
                let base = self.resolve(id, None, None, false)?;
                let view_id = key.to_string();
                Ok(self.memoize(key, acquire, || {
                    DataList::derive(&base, view_id, Some(filter), None, self.scope.clone())
                }))
            }
            (filter, Some(sort)) => {
                let source = self.resolve(id, filter, None, false)?;
                let view_id = key.to_string();
                Ok(self.memoize(key, acquire, || {
                    DataList::derive(&source, view_id, None, Some(sort), self.scope.clone())
                }))
            }
        }
    }

    fn lookup(&self, key: &DataSourceKey, acquire: bool) -> Option<Arc<DataList>> {
        let mut table = self.table.lock().expect("Owner lock poisoned");
        let list = table.get(key)?;
        if list.is_destroyed() {
            table.remove(key);
            return None;
        }
        list.touch();
        if acquire {
            list.acquire();
        }
        Some(Arc::clone(list))
    }

    fn memoize(
        &self,
        key: DataSourceKey,
        acquire: bool,
        make: impl FnOnce() -> Arc<DataList>,
    ) -> Arc<DataList> {
        let mut table = self.table.lock().expect("Owner lock poisoned");
        let existing = table.get(&key).filter(|l| !l.is_destroyed()).cloned();
        let list = match existing {
            Some(existing) => {
                existing.touch();
                existing
            }
            None => {
                let list = make();
                if self.scope == Scope::Global {
                    list.set_permanent(true);
                }
                log::debug!("Derived data source {} in {}", key, self.scope);
                table.insert(key, Arc::clone(&list));
                list
            }
        };
        if acquire {
            list.acquire();
        }
        list
    }

    /// The Global list holding items of `tag`. Non-global owners delegate up.
    pub fn get_data_source_for_type(&self, tag: &TypeTag) -> Option<Arc<DataList>> {
        if let Some(list) = self.by_type.lock().expect("Owner lock poisoned").get(tag) {
            return Some(Arc::clone(list));
        }
        self.parent.as_ref().and_then(|p| p.get_data_source_for_type(tag))
    }

    /// Registers `list` under its own id.
    pub fn put_data_source(&self, list: Arc<DataList>) -> Result<(), RegistryError> {
        let id = list.id().to_string();
        self.put_data_source_as(&id, list)
    }

    /// # Put Data Source As
    ///
    /// Registers `list` under `id`. A second registration of the same id is a
    /// configuration error. Global lists become permanent, and base (non
    /// derived) Global lists become the type's class-lookup list.
    pub fn put_data_source_as(&self, id: &str, list: Arc<DataList>) -> Result<(), RegistryError> {
        self.register(id, list, true)
    }

    /// Registers `list` under its own id without making it a class-lookup
    /// list. Used for lists that are not reference data, such as a tree's
    /// flattened nodes.
    pub fn put_unindexed_data_source(&self, list: Arc<DataList>) -> Result<(), RegistryError> {
        let id = list.id().to_string();
        self.register(&id, list, false)
    }

    fn register(&self, id: &str, list: Arc<DataList>, index_type: bool) -> Result<(), RegistryError> {
        self.ensure_alive()?;
        let key = DataSourceKey::plain(id);
        {
            let mut table = self.table.lock().expect("Owner lock poisoned");
            if table.contains_key(&key) {
                return Err(RegistryError::Duplicate {
                    scope: self.scope.clone(),
                    id: id.to_string(),
                });
            }
            table.insert(key, Arc::clone(&list));
        }
        if self.scope == Scope::Global {
            list.set_permanent(true);
            if index_type && list.source_id().is_none() {
                self.by_type
                    .lock()
                    .expect("Owner lock poisoned")
                    .entry(list.item_type().clone())
                    .or_insert_with(|| Arc::clone(&list));
            }
        }
        log::debug!("Registered data source {} in {}", id, self.scope);
        Ok(())
    }

    /// Marks `holder` as using (or no longer using) this owner. Returns the
    /// number of remaining holders.
    pub fn set_used(&self, holder: &str, used: bool) -> usize {
        let mut users = self.users.lock().expect("Owner lock poisoned");
        if used {
            users.insert(holder.to_string());
        } else {
            users.remove(holder);
        }
        users.len()
    }

    /// Number of holders registered through [`DataSourceOwner::set_used`].
    pub fn use_count(&self) -> usize {
        self.users.lock().expect("Owner lock poisoned").len()
    }

    /// # Clean
    ///
    /// Evicts every list unused for at least the idle timeout, skipping
    /// permanent lists unless `include_permanent`. Lists this owner created
    /// are destroyed; lists borrowed from elsewhere are only unregistered.
    /// Returns the number of evicted entries.
    pub fn clean(&self, include_permanent: bool) -> usize {
        let evicted: Vec<(DataSourceKey, Arc<DataList>)> = {
            let mut table = self.table.lock().expect("Owner lock poisoned");
            let expired: Vec<DataSourceKey> = table
                .iter()
                .filter(|(_, list)| include_permanent || !list.is_permanent())
                .filter(|(_, list)| {
                    list.is_destroyed() || list.idle_for().is_some_and(|idle| idle >= self.idle_timeout)
                })
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|key| table.remove(&key).map(|list| (key, list)))
                .collect()
        };
        if evicted.is_empty() {
            return 0;
        }

        let mut by_type = self.by_type.lock().expect("Owner lock poisoned");
        for (key, list) in &evicted {
            by_type.retain(|_, l| !Arc::ptr_eq(l, list));
            if list.origin() == &self.scope {
                list.destroy();
            }
            log::debug!("Evicted data source {} from {}", key, self.scope);
        }
        evicted.len()
    }

    /// Starts the periodic `clean(false)` task on `handle`.
    pub fn start_cleanup(self: &Arc<Self>, handle: &Handle, period: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .cleanup
            .lock()
            .expect("Owner lock poisoned")
            .replace(token.clone())
        {
            previous.cancel();
        }
        let owner = Arc::downgrade(self);
        let scope = self.scope.clone();
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        log::debug!("Cleanup cancelled for {}", scope);
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(owner) = owner.upgrade() else { break };
                        let evicted = owner.clean(false);
                        if evicted > 0 {
                            log::info!("Cleanup of {} evicted {} data sources", scope, evicted);
                        }
                    }
                }
            }
        });
    }

    /// # Destroy
    ///
    /// Cancels the cleanup task, destroys the lists this owner created and
    /// unregisters the owner from its registry. Idempotent.
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(token) = self.cleanup.lock().expect("Owner lock poisoned").take() {
            token.cancel();
        }
        let lists: Vec<Arc<DataList>> = self
            .table
            .lock()
            .expect("Owner lock poisoned")
            .drain()
            .map(|(_, list)| list)
            .collect();
        self.by_type.lock().expect("Owner lock poisoned").clear();
        for list in lists.iter().filter(|l| l.origin() == &self.scope) {
            list.destroy();
        }
        if let Some(root) = self.root.upgrade() {
            root.lock().expect("Owner registry lock poisoned").forget(self);
        }
        log::info!("Owner {} destroyed", self.scope);
        true
    }

    fn ensure_alive(&self) -> Result<(), RegistryError> {
        if self.is_destroyed() {
            Err(RegistryError::Destroyed(self.scope.clone()))
        } else {
            Ok(())
        }
    }
}

/// # Owner Registry
///
/// Root of the owner hierarchy: the Global owner plus lazily created Member
/// and User owners.
pub struct OwnerRegistry {
    global: Arc<DataSourceOwner>,
    tables: Arc<Mutex<OwnerTables>>,
    definitions: Vec<DataSourceDefinition>,
    factories: Arc<FactoryRegistry>,
    router: Arc<ClassRouter>,
    settings: OwnerSettings,
    runtime: Mutex<Option<Handle>>,
}

impl OwnerRegistry {
    /// Creates the registry and its (still empty) Global owner.
    pub fn new(
        settings: OwnerSettings,
        definitions: Vec<DataSourceDefinition>,
        factories: Arc<FactoryRegistry>,
        router: Arc<ClassRouter>,
    ) -> Self {
        let tables = Arc::new(Mutex::new(OwnerTables::default()));
        let global = Arc::new(DataSourceOwner::new(
            Scope::Global,
            None,
            Duration::MAX,
            Arc::downgrade(&tables),
        ));
        Self {
            global,
            tables,
            definitions,
            factories,
            router,
            settings,
            runtime: Mutex::new(None),
        }
    }

    /// The Global owner.
    pub fn global(&self) -> &Arc<DataSourceOwner> {
        &self.global
    }

    /// Instantiates the Global definitions. Called once at startup.
    pub fn populate_global(&self) -> Result<(), RegistryError> {
        self.populate(&self.global)
    }

    fn populate(&self, owner: &DataSourceOwner) -> Result<(), RegistryError> {
        let created = instantiate(owner, &self.definitions, &self.factories)?;
        for (def, list) in created {
            if def.kind == DataSourceKind::Reference {
                self.router.register(&def.item_type, list);
            }
        }
        Ok(())
    }

    /// Starts cleanup tasks on `handle`, for existing and future owners.
    pub fn set_runtime(&self, handle: Handle) {
        let tables = self.tables.lock().expect("Owner registry lock poisoned");
        for owner in tables.members.values().chain(tables.users.values()) {
            owner.start_cleanup(&handle, self.settings.cleanup_interval);
        }
        *self.runtime.lock().expect("Owner registry lock poisoned") = Some(handle);
    }

    fn create_owner(&self, scope: Scope, parent: Arc<DataSourceOwner>) -> Result<Arc<DataSourceOwner>, RegistryError> {
        let owner = Arc::new(DataSourceOwner::new(
            scope,
            Some(parent),
            self.settings.idle_timeout,
            Arc::downgrade(&self.tables),
        ));
        if let Err(e) = self.populate(&owner) {
            owner.destroy();
            return Err(e);
        }
        Ok(owner)
    }

    fn adopt(&self, owner: &Arc<DataSourceOwner>) {
        if let Some(handle) = self.runtime.lock().expect("Owner registry lock poisoned").as_ref() {
            owner.start_cleanup(handle, self.settings.cleanup_interval);
        }
        log::info!("Owner {} created", owner.scope());
    }

    /// # Member
    ///
    /// The Member owner for `member_id`, created and populated on first use.
    pub fn member(&self, member_id: &str) -> Result<Arc<DataSourceOwner>, RegistryError> {
        if let Some(owner) = self
            .tables
            .lock()
            .expect("Owner registry lock poisoned")
            .members
            .get(member_id)
        {
            return Ok(Arc::clone(owner));
        }

        let created = self.create_owner(Scope::member(member_id), Arc::clone(&self.global))?;
        let winner = {
            let mut tables = self.tables.lock().expect("Owner registry lock poisoned");
            Arc::clone(
                tables
                    .members
                    .entry(member_id.to_string())
                    .or_insert_with(|| Arc::clone(&created)),
            )
        };
        if Arc::ptr_eq(&winner, &created) {
            self.adopt(&created);
        } else {
            created.destroy();
        }
        Ok(winner)
    }

    /// The User owner for (`member_id`, `user_id`), created on first use.
    pub fn user(&self, member_id: &str, user_id: &str) -> Result<Arc<DataSourceOwner>, RegistryError> {
        let key = (member_id.to_string(), user_id.to_string());
        if let Some(owner) = self
            .tables
            .lock()
            .expect("Owner registry lock poisoned")
            .users
            .get(&key)
        {
            return Ok(Arc::clone(owner));
        }

        let member = self.member(member_id)?;
        let created = self.create_owner(Scope::user(member_id, user_id), member)?;
        let winner = {
            let mut tables = self.tables.lock().expect("Owner registry lock poisoned");
            Arc::clone(tables.users.entry(key).or_insert_with(|| Arc::clone(&created)))
        };
        if Arc::ptr_eq(&winner, &created) {
            self.adopt(&created);
        } else {
            created.destroy();
        }
        Ok(winner)
    }

    /// The owner for `scope`.
    pub fn owner(&self, scope: &Scope) -> Result<Arc<DataSourceOwner>, RegistryError> {
        match scope {
            Scope::Global => Ok(Arc::clone(&self.global)),
            Scope::Member { member_id } => self.member(member_id),
            Scope::User { member_id, user_id } => self.user(member_id, user_id),
        }
    }

    /// Registers `holder` on the User owner, creating it if needed.
    pub fn acquire_user(
        &self,
        member_id: &str,
        user_id: &str,
        holder: &str,
    ) -> Result<Arc<DataSourceOwner>, RegistryError> {
        let key = (member_id.to_string(), user_id.to_string());
        loop {
            let owner = self.user(member_id, user_id)?;
            let tables = self.tables.lock().expect("Owner registry lock poisoned");
            if tables.users.get(&key).is_some_and(|o| Arc::ptr_eq(o, &owner)) {
                owner.set_used(holder, true);
                return Ok(owner);
            }
        }
    }

    /// Releases `holder`; destroys the User owner when no holder remains.
    /// Returns whether the owner was destroyed.
    pub fn release_user(&self, member_id: &str, user_id: &str, holder: &str) -> bool {
        let key = (member_id.to_string(), user_id.to_string());
        let doomed = {
            let mut tables = self.tables.lock().expect("Owner registry lock poisoned");
            let remaining = tables.users.get(&key).map(|owner| owner.set_used(holder, false));
            match remaining {
                Some(0) => tables.users.remove(&key),
                _ => None,
            }
        };
        match doomed {
            Some(owner) => owner.destroy(),
            None => false,
        }
    }

    /// Destroys a Member owner and all of its users.
    pub fn destroy_member(&self, member_id: &str) -> bool {
        let (member, users) = {
            let mut tables = self.tables.lock().expect("Owner registry lock poisoned");
            let member = tables.members.remove(member_id);
            let keys: Vec<(String, String)> = tables
                .users
                .keys()
                .filter(|(m, _)| m == member_id)
                .cloned()
                .collect();
            let users: Vec<Arc<DataSourceOwner>> =
                keys.iter().filter_map(|k| tables.users.remove(k)).collect();
            (member, users)
        };
        for user in users {
            user.destroy();
        }
        member.map(|m| m.destroy()).unwrap_or(false)
    }

    /// Number of live Member owners.
    pub fn member_count(&self) -> usize {
        self.tables.lock().expect("Owner registry lock poisoned").members.len()
    }

    /// Number of live User owners.
    pub fn user_count(&self) -> usize {
        self.tables.lock().expect("Owner registry lock poisoned").users.len()
    }

    /// Total number of table entries across all owners.
    pub fn data_source_count(&self) -> usize {
        let tables = self.tables.lock().expect("Owner registry lock poisoned");
        self.global.len()
            + tables
                .members
                .values()
                .chain(tables.users.values())
                .map(|o| o.len())
                .sum::<usize>()
    }

    /// Destroys every owner, users first.
    pub fn shutdown(&self) {
        let (members, users) = {
            let mut tables = self.tables.lock().expect("Owner registry lock poisoned");
            let members: Vec<_> = tables.members.drain().map(|(_, o)| o).collect();
            let users: Vec<_> = tables.users.drain().map(|(_, o)| o).collect();
            (members, users)
        };
        for owner in users.into_iter().chain(members) {
            owner.destroy();
        }
        self.global.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filters::{AttributeFilter, AttributeSort};
    use crate::core::types::Record;

    fn instruments() -> Arc<DataList> {
        let list = Arc::new(DataList::new(
            "INSTR",
            TypeTag::new("Instrument"),
            vec!["id".to_string()],
        ));
        for (id, issuer, price) in [("A", "X", 3), ("B", "Y", 1), ("C", "X", 2)] {
            list.upsert(
                Record::new("Instrument")
                    .with("id", id)
                    .with("issuerId", issuer)
                    .with("price", price)
                    .into_item(),
            )
            .unwrap();
        }
        list
    }

    fn global_with_instruments() -> Arc<DataSourceOwner> {
        let global = Arc::new(DataSourceOwner::global());
        global.put_data_source(instruments()).unwrap();
        global
    }

    fn by_issuer(issuer: &str) -> Option<Arc<dyn Filter>> {
        Some(Arc::new(AttributeFilter::equals("issuerId", issuer)))
    }

    fn by_price() -> Option<Arc<dyn Sort>> {
        AttributeSort::parse("price").map(|s| Arc::new(s) as Arc<dyn Sort>)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let global = global_with_instruments();
        let err = global.put_data_source(instruments()).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
        assert!(global.get_data_source("INSTR", None, None).unwrap().is_permanent());
        assert!(global
            .get_data_source_for_type(&TypeTag::new("Instrument"))
            .is_some());
    }

    #[test]
    fn views_are_memoized_and_filtered_then_sorted() {
        let global = global_with_instruments();
        let member = DataSourceOwner::with_parent(Scope::member("M"), global, Duration::from_secs(60));

        let view = member.get_data_source("INSTR", by_issuer("X"), by_price()).unwrap();
        let again = member.get_data_source("INSTR", by_issuer("X"), by_price()).unwrap();
        assert!(Arc::ptr_eq(&view, &again));
        assert_eq!(view.keys(), vec!["C", "A"]);
        assert_eq!(view.origin(), &Scope::member("M"));
        assert_eq!(member.len(), 2);

        assert!(matches!(
            member.get_data_source("MISSING", None, None),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn clean_is_a_no_op_before_the_timeout() {
        let global = global_with_instruments();
        let member = DataSourceOwner::with_parent(Scope::member("M"), global, Duration::from_secs(3600));
        member.get_data_source("INSTR", by_issuer("X"), None).unwrap();
        assert_eq!(member.clean(false), 0);
        assert_eq!(member.clean(false), 0);
        assert_eq!(member.len(), 1);
    }

    #[test]
    fn clean_evicts_unused_views_once() {
        let global = global_with_instruments();
        let base = global.get_data_source("INSTR", None, None).unwrap();
        let member = DataSourceOwner::with_parent(Scope::member("M"), Arc::clone(&global), Duration::ZERO);

        let view = member.get_data_source("INSTR", by_issuer("X"), by_price()).unwrap();
        assert_eq!(base.listener_count(), 1);

        // Only the sorted view is unused; the filtered view feeds it.
        assert_eq!(member.clean(false), 1);
        assert!(view.is_destroyed());
        assert_eq!(member.clean(false), 1);
        assert_eq!(member.clean(false), 0);
        assert_eq!(base.listener_count(), 0);
        assert!(!base.is_destroyed());
    }

    #[test]
    fn acquired_views_survive_eviction() {
        let global = global_with_instruments();
        let member = DataSourceOwner::with_parent(Scope::member("M"), global, Duration::ZERO);

        let held = member.acquire_data_source("INSTR", by_issuer("Y"), None).unwrap();
        assert_eq!(member.clean(false), 0);
        assert!(!held.is_destroyed());

        held.release();
        assert_eq!(member.clean(false), 1);
        assert!(held.is_destroyed());
    }

    #[test]
    fn borrowed_lists_are_unregistered_not_destroyed() {
        let global = global_with_instruments();
        let shared = global.get_data_source("INSTR", None, None).unwrap();
        let member = DataSourceOwner::with_parent(Scope::member("M"), global, Duration::ZERO);
        member.put_data_source_as("ALIAS", Arc::clone(&shared)).unwrap();

        assert_eq!(member.clean(true), 1);
        assert!(!shared.is_destroyed());
        assert!(member.is_empty());
    }

    #[test]
    fn set_used_counts_distinct_holders() {
        let owner = DataSourceOwner::global();
        assert_eq!(owner.set_used("s1", true), 1);
        assert_eq!(owner.set_used("s1", true), 1);
        assert_eq!(owner.set_used("s2", true), 2);
        assert_eq!(owner.set_used("s1", false), 1);
        assert_eq!(owner.set_used("s2", false), 0);
    }

    #[test]
    fn destroyed_owner_rejects_lookups() {
        let global = global_with_instruments();
        let member = DataSourceOwner::with_parent(Scope::member("M"), global, Duration::ZERO);
        let view = member.get_data_source("INSTR", by_issuer("X"), None).unwrap();
        assert!(member.destroy());
        assert!(!member.destroy());
        assert!(view.is_destroyed());
        assert!(matches!(
            member.get_data_source("INSTR", None, None),
            Err(RegistryError::Destroyed(_))
        ));
    }

    #[test]
    fn scope_display() {
        assert_eq!(Scope::Global.to_string(), "global");
        assert_eq!(Scope::user("M", "U").to_string(), "user:M/U");
        assert_eq!(
            DataSourceKey::new("INSTR", Some("issuerId=X".into()), Some("-price".into())).to_string(),
            "INSTR[issuerId=X]<-price>"
        );
    }
}
