//! # Tree Materialization
//!
//! A [`TreeModel`] turns a [`TreeDefinition`] into one flattened [`DataList`]
//! of [`TreeNode`]s keyed by path. Only visible nodes are materialized: a node
//! is in the list exactly when every ancestor is expanded.
//!
//! ## Expansion
//!
//! Expanding a node walks its definition's child mappings. Folder mappings add
//! one folder node each. Source mappings subscribe a [`ChildAttachment`] to the
//! mapped data source (through a private filtered view when the mapping has a
//! filter or sort); the attachment mirrors the source's items as child nodes
//! for as long as the parent stays expanded.
//!
//! ## Collapse
//!
//! Collapsing removes every descendant, deepest first, and detaches every
//! listener the subtree held.
//!
//! ## Links
//!
//! A link mapping displays the item found under a key attribute in another
//! data source. A [`LinkWatcher`] follows the target; a target that disappears
//! or has the wrong type is logged and the node keeps its last good state.
//!
//! All node changes go through the flattened list's own events, so consumers
//! observe a tree like any other list. Listeners of that list must not call
//! back into the model synchronously.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::core::filters::{AttributeSort, FilterExpr, FilterRegistry};
use crate::core::list::{DataList, Filter, ListEvent, ListListener, ListenerId, Sort};
use crate::core::registry::DataSourceOwner;
use crate::core::tree::definition::{LinkDef, NodeDef, TreeDefinition};
use crate::core::tree::path::NodePath;
use crate::core::tree::TreeError;
use crate::core::types::{attribute_string, Item, ListItem, TypeTag, TREE_NODE};

/// Expand state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandState {
    /// A leaf.
    NonExpandable,
    /// Children not materialized.
    Collapsed,
    /// Children materialized.
    Expanded,
}

impl ExpandState {
    /// Attribute value of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpandState::NonExpandable => "none",
            ExpandState::Collapsed => "collapsed",
            ExpandState::Expanded => "expanded",
        }
    }
}

/// What a node displays.
#[derive(Debug, Clone)]
pub enum NodeContent {
    /// A folder pseudo-item.
    Folder {
        /// Folder key.
        name: String,
    },
    /// A domain item (the link target for link nodes).
    Item(Item),
}

/// # Tree Node
///
/// One visible row. Exposes `path`, `parentPath`, `expandState`, `text` and
/// `depth`; any other attribute is read from the displayed item.
#[derive(Debug, Clone)]
pub struct TreeNode {
    tag: TypeTag,
    path: NodePath,
    parent: NodePath,
    state: ExpandState,
    text: String,
    content: NodeContent,
}

impl TreeNode {
    fn new(path: NodePath, parent: NodePath, state: ExpandState, text: String, content: NodeContent) -> Self {
        Self {
            tag: TypeTag::new(TREE_NODE),
            path,
            parent,
            state,
            text,
            content,
        }
    }

    /// Node path.
    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// Path of the parent (the root for root-level nodes).
    pub fn parent_path(&self) -> &NodePath {
        &self.parent
    }

    /// Expand state.
    pub fn state(&self) -> ExpandState {
        self.state
    }

    /// Display text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Displayed content.
    pub fn content(&self) -> &NodeContent {
        &self.content
    }

    /// Displayed item, for non-folder nodes.
    pub fn item(&self) -> Option<&Item> {
        match &self.content {
            NodeContent::Item(item) => Some(item),
            NodeContent::Folder { .. } => None,
        }
    }

    fn with_state(&self, state: ExpandState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

impl ListItem for TreeNode {
    fn type_tag(&self) -> &TypeTag {
        &self.tag
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "path" => Some(Value::from(self.path.as_str())),
            "parentPath" => Some(Value::from(self.parent.as_str())),
            "expandState" => Some(Value::from(self.state.as_str())),
            "text" => Some(Value::from(self.text.as_str())),
            "depth" => Some(Value::from(self.path.depth())),
            _ => match &self.content {
                NodeContent::Item(item) => item.attribute(name),
                NodeContent::Folder { name: folder } if name == "folder" => Some(Value::from(folder.as_str())),
                NodeContent::Folder { .. } => None,
            },
        }
    }
}

/// A listener registration the tree must undo.
struct Attachment {
    list: Arc<DataList>,
    listener: ListenerId,
    private_view: bool,
}

impl Attachment {
    fn detach(self) {
        self.list.remove_listener(self.listener);
        if self.private_view {
            self.list.destroy();
        }
    }
}

struct LinkBinding {
    key: String,
    attachment: Attachment,
}

struct NodeEntry {
    node: Arc<TreeNode>,
    def: Arc<NodeDef>,
    link: Option<LinkBinding>,
}

#[derive(Default)]
struct TreeState {
    nodes: HashMap<NodePath, NodeEntry>,
    attachments: HashMap<NodePath, Vec<Attachment>>,
    destroyed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutOutcome {
    Ignored,
    Added,
    Updated { expanded: bool },
}

/// # Tree Model
///
/// See the module documentation.
pub struct TreeModel {
    id: String,
    list: Arc<DataList>,
    owner: Arc<DataSourceOwner>,
    filters: Arc<FilterRegistry>,
    state: Mutex<TreeState>,
    me: Weak<TreeModel>,
}

impl TreeModel {
    /// # New
    ///
    /// Builds the flattened list and instantiates the root mappings. Data
    /// sources are resolved through `owner`.
    pub fn new(
        def: TreeDefinition,
        owner: Arc<DataSourceOwner>,
        filters: Arc<FilterRegistry>,
    ) -> Result<Arc<TreeModel>, TreeError> {
        def.validate()?;
        let list = DataList::new(def.id.clone(), TypeTag::new(TREE_NODE), vec!["path".to_string()])
            .with_text_attribute(Some("text".to_string()))
            .with_origin(owner.scope().clone());
        let model = Arc::new_cyclic(|me| TreeModel {
            id: def.id.clone(),
            list: Arc::new(list),
            owner,
            filters,
            state: Mutex::new(TreeState::default()),
            me: me.clone(),
        });

        let root = NodePath::root();
        for (index, mapping) in def.roots.into_iter().enumerate() {
            if let Err(e) = model.attach_mapping(&root, index, Arc::new(mapping), None) {
                model.destroy();
                return Err(e);
            }
        }
        log::info!("Tree '{}' created with {} root nodes", model.id, model.list.len());
        Ok(model)
    }

    /// Tree id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The flattened node list.
    pub fn list(&self) -> &Arc<DataList> {
        &self.list
    }

    /// Node at `path`.
    pub fn node(&self, path: &str) -> Option<Arc<TreeNode>> {
        let path = NodePath::parse(path).ok()?;
        self.state
            .lock()
            .expect("Tree lock poisoned")
            .nodes
            .get(&path)
            .map(|e| Arc::clone(&e.node))
    }

    /// Paths of all visible nodes, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths = self.list.keys();
        paths.sort();
        paths
    }

    /// # Expand
    ///
    /// Materializes the children of a collapsed node. Returns `false` when
    /// the node is a leaf or already expanded. Mappings whose data source
    /// cannot be resolved are logged and skipped.
    pub fn expand(&self, path: &str) -> Result<bool, TreeError> {
        let path = NodePath::parse(path)?;
        let (def, parent_item) = {
            let mut state = self.state.lock().expect("Tree lock poisoned");
            if state.destroyed {
                return Err(TreeError::Destroyed(self.id.clone()));
            }
            let entry = state
                .nodes
                .get_mut(&path)
                .ok_or_else(|| TreeError::UnknownNode(path.to_string()))?;
            if entry.node.state != ExpandState::Collapsed {
                return Ok(false);
            }
            entry.node = Arc::new(entry.node.with_state(ExpandState::Expanded));
            self.publish(&entry.node);
            (Arc::clone(&entry.def), Self::parent_item(&entry.node))
        };

        for (index, mapping) in def.child_mappings().into_iter().enumerate() {
            if let Err(e) = self.attach_mapping(&path, index, Arc::new(mapping), Some(&parent_item)) {
                log::warn!("Tree '{}' could not expand {} mapping {}: {}", self.id, path, index, e);
            }
        }
        Ok(true)
    }

    /// # Collapse
    ///
    /// Removes every descendant of an expanded node and detaches their
    /// listeners. Returns `false` when the node was not expanded.
    pub fn collapse(&self, path: &str) -> Result<bool, TreeError> {
        let path = NodePath::parse(path)?;
        let detached = {
            let mut guard = self.state.lock().expect("Tree lock poisoned");
            let state = &mut *guard;
            if state.destroyed {
                return Err(TreeError::Destroyed(self.id.clone()));
            }
            let entry = state
                .nodes
                .get_mut(&path)
                .ok_or_else(|| TreeError::UnknownNode(path.to_string()))?;
            if entry.node.state != ExpandState::Expanded {
                return Ok(false);
            }
            let node = Arc::new(entry.node.with_state(ExpandState::Collapsed));
            entry.node = Arc::clone(&node);
            let detached = self.drop_subtree(state, &path, false);
            self.publish(&node);
            detached
        };
        detached.into_iter().for_each(Attachment::detach);
        Ok(true)
    }

    /// Collapses an expanded node, expands a collapsed one.
    pub fn toggle(&self, path: &str) -> Result<bool, TreeError> {
        let expanded = self
            .node(path)
            .ok_or_else(|| TreeError::UnknownNode(path.to_string()))?
            .state
            == ExpandState::Expanded;
        if expanded {
            self.collapse(path)
        } else {
            self.expand(path)
        }
    }

    /// Detaches every listener and destroys the flattened list.
    pub fn destroy(&self) -> bool {
        let detached: Vec<Attachment> = {
            let mut state = self.state.lock().expect("Tree lock poisoned");
            if state.destroyed {
                return false;
            }
            state.destroyed = true;
            let mut detached: Vec<Attachment> = state.attachments.drain().flat_map(|(_, a)| a).collect();
            detached.extend(
                state
                    .nodes
                    .drain()
                    .filter_map(|(_, entry)| entry.link.map(|b| b.attachment)),
            );
            detached
        };
        detached.into_iter().for_each(Attachment::detach);
        self.list.destroy();
        log::info!("Tree '{}' destroyed", self.id);
        true
    }

    fn parent_item(node: &Arc<TreeNode>) -> Item {
        match &node.content {
            NodeContent::Item(item) => Arc::clone(item),
            NodeContent::Folder { .. } => Arc::clone(node) as Item,
        }
    }

    fn publish(&self, node: &Arc<TreeNode>) {
        if let Err(e) = self.list.upsert(Arc::clone(node) as Item) {
            log::warn!("Tree '{}' could not publish {}: {}", self.id, node.path, e);
        }
    }

    fn attach_mapping(
        &self,
        parent: &NodePath,
        index: usize,
        mapping: Arc<NodeDef>,
        parent_item: Option<&Item>,
    ) -> Result<(), TreeError> {
        let (data_source, filter, sort) = match &*mapping {
            NodeDef::Folder { name, text, .. } => {
                let path = parent.child(index, name);
                let text = text.clone().unwrap_or_else(|| name.clone());
                let content = NodeContent::Folder { name: name.clone() };
                self.put_node(parent, &path, Arc::clone(&mapping), content, text);
                return Ok(());
            }
            NodeDef::Source {
                data_source, filter, sort, ..
            } => (data_source, filter, sort),
        };

        let filter = self.view_filter(filter.as_deref(), parent_item)?;
        let sort = sort
            .as_deref()
            .and_then(AttributeSort::parse)
            .map(|s| Arc::new(s) as Arc<dyn Sort>);
        let base = self.owner.get_data_source(data_source, None, None)?;
        let private_view = filter.is_some() || sort.is_some();
        let source = if private_view {
            let view_id = format!("{}{}#{}", self.id, parent, index);
            DataList::derive(&base, view_id, filter, sort, self.owner.scope().clone())
        } else {
            base
        };

        let listener = source.add_listener(Arc::new(ChildAttachment {
            tree: self.me.clone(),
            tree_id: self.id.clone(),
            parent: parent.clone(),
            index,
            mapping,
        }));
        let attachment = Attachment {
            list: source,
            listener,
            private_view,
        };

        let mut state = self.state.lock().expect("Tree lock poisoned");
        if !state.destroyed && Self::is_open(&state, parent) {
            state.attachments.entry(parent.clone()).or_default().push(attachment);
        } else {
            drop(state);
            attachment.detach();
        }
        Ok(())
    }

    fn view_filter(&self, expr: Option<&str>, parent_item: Option<&Item>) -> Result<Option<Arc<dyn Filter>>, TreeError> {
        let Some(expr) = expr else {
            return Ok(None);
        };
        let mut parsed = FilterExpr::parse(expr)?;
        if parsed.has_parent_refs() {
            let parent = parent_item.ok_or_else(|| {
                TreeError::InvalidDefinition(format!("filter '{}' refers to a parent at root level", expr))
            })?;
            parsed = parsed.expand_parent(&**parent);
        }
        Ok(Some(parsed.build(&self.filters)?))
    }

    fn is_open(state: &TreeState, parent: &NodePath) -> bool {
        parent.is_root()
            || state
                .nodes
                .get(parent)
                .is_some_and(|e| e.node.state == ExpandState::Expanded)
    }

    fn put_node(
        &self,
        parent: &NodePath,
        path: &NodePath,
        def: Arc<NodeDef>,
        content: NodeContent,
        text: String,
    ) -> PutOutcome {
        let mut state = self.state.lock().expect("Tree lock poisoned");
        if state.destroyed || !Self::is_open(&state, parent) {
            return PutOutcome::Ignored;
        }
        let prior = state.nodes.get(path).map(|e| e.node.state);
        let expand_state = match prior {
            Some(s) => s,
            None if def.is_expandable() => ExpandState::Collapsed,
            None => ExpandState::NonExpandable,
        };
        let node = Arc::new(TreeNode::new(path.clone(), parent.clone(), expand_state, text, content));
        match state.nodes.get_mut(path) {
            Some(entry) => {
                entry.node = Arc::clone(&node);
                entry.def = def;
            }
            None => {
                state.nodes.insert(
                    path.clone(),
                    NodeEntry {
                        node: Arc::clone(&node),
                        def,
                        link: None,
                    },
                );
            }
        }
        self.publish(&node);
        match prior {
            Some(s) => PutOutcome::Updated {
                expanded: s == ExpandState::Expanded,
            },
            None => PutOutcome::Added,
        }
    }

    fn put_item(&self, parent: &NodePath, index: usize, mapping: &Arc<NodeDef>, source: &DataList, item: &Item) {
        let key = match source.key_for(&**item) {
            Ok(key) => key,
            Err(e) => {
                log::debug!("Tree '{}' skipped item: {}", self.id, e);
                return;
            }
        };
        let path = parent.child(index, &key);

        let mut link_key = None;
        let (shown, text) = match mapping.link() {
            None => (Arc::clone(item), source.text_of(&**item)),
            Some(link) => match self.resolve_link(link, &**item) {
                Ok((target_key, target, text)) => {
                    link_key = Some(target_key);
                    (target, text)
                }
                Err(reason) if self.contains(&path) => {
                    log::warn!("Tree '{}' node {}: {}; update ignored", self.id, path, reason);
                    return;
                }
                Err(reason) => {
                    log::warn!("Tree '{}' node {}: {}; showing the unlinked item", self.id, path, reason);
                    (Arc::clone(item), source.text_of(&**item))
                }
            },
        };

        let outcome = self.put_node(parent, &path, Arc::clone(mapping), NodeContent::Item(shown), text);
        if outcome == PutOutcome::Ignored {
            return;
        }
        if let (Some(link), Some(key)) = (mapping.link(), link_key) {
            self.bind_link(&path, link, key);
        }
        if outcome == (PutOutcome::Updated { expanded: true }) && mapping.has_parent_refs() {
            self.refresh(&path);
        }
    }

    fn contains(&self, path: &NodePath) -> bool {
        self.state.lock().expect("Tree lock poisoned").nodes.contains_key(path)
    }

    fn resolve_link(&self, link: &LinkDef, item: &dyn ListItem) -> Result<(String, Item, String), String> {
        let key = attribute_string(item, &link.key_attribute)
            .ok_or_else(|| format!("no '{}' to follow", link.key_attribute))?;
        let target = self
            .owner
            .get_data_source(&link.data_source, None, None)
            .map_err(|e| e.to_string())?;
        let linked = target
            .get(&key)
            .ok_or_else(|| format!("link target {} missing from '{}'", key, link.data_source))?;
        if let Some(expected) = &link.expected_type {
            if linked.type_tag() != expected {
                return Err(format!("link target {} is a {}, expected {}", key, linked.type_tag(), expected));
            }
        }
        let text = target.text_of(&*linked);
        Ok((key, linked, text))
    }

    fn bind_link(&self, path: &NodePath, link: &LinkDef, key: String) {
        let bound = {
            let state = self.state.lock().expect("Tree lock poisoned");
            match state.nodes.get(path) {
                Some(entry) => entry.link.as_ref().is_some_and(|b| b.key == key),
                None => return,
            }
        };
        if bound {
            return;
        }
        let target = match self.owner.get_data_source(&link.data_source, None, None) {
            Ok(target) => target,
            Err(e) => {
                log::warn!("Tree '{}' node {}: {}", self.id, path, e);
                return;
            }
        };
        let listener = target.add_listener(Arc::new(LinkWatcher {
            tree: self.me.clone(),
            tree_id: self.id.clone(),
            path: path.clone(),
            key: key.clone(),
            expected: link.expected_type.clone(),
        }));
        let attachment = Attachment {
            list: target,
            listener,
            private_view: false,
        };
        let stale = {
            let mut state = self.state.lock().expect("Tree lock poisoned");
            match state.nodes.get_mut(path) {
                Some(entry) => entry
                    .link
                    .replace(LinkBinding { key, attachment })
                    .map(|b| b.attachment),
                None => Some(attachment),
            }
        };
        if let Some(stale) = stale {
            stale.detach();
        }
    }

    fn relink(&self, path: &NodePath, item: Item, text: String) {
        let refresh = {
            let mut state = self.state.lock().expect("Tree lock poisoned");
            let Some(entry) = state.nodes.get_mut(path) else {
                return;
            };
            let node = Arc::new(TreeNode {
                text,
                content: NodeContent::Item(item),
                ..(*entry.node).clone()
            });
            entry.node = Arc::clone(&node);
            self.publish(&node);
            node.state == ExpandState::Expanded && entry.def.has_parent_refs()
        };
        if refresh {
            self.refresh(path);
        }
    }

    fn refresh(&self, path: &NodePath) {
        let outcome = self
            .collapse(path.as_str())
            .and_then(|_| self.expand(path.as_str()));
        if let Err(e) = outcome {
            log::warn!("Tree '{}' could not refresh {}: {}", self.id, path, e);
        }
    }

    fn sync_mapping(&self, parent: &NodePath, index: usize, mapping: &Arc<NodeDef>, source: &DataList, items: &[Item]) {
        let keep: HashSet<NodePath> = items
            .iter()
            .filter_map(|item| source.key_for(&**item).ok())
            .map(|key| parent.child(index, &key))
            .collect();
        let stale: Vec<NodePath> = {
            let state = self.state.lock().expect("Tree lock poisoned");
            state
                .nodes
                .keys()
                .filter(|p| p.parent().as_ref() == Some(parent))
                .filter(|p| p.last().is_some_and(|s| s.index == index))
                .filter(|p| !keep.contains(*p))
                .cloned()
                .collect()
        };
        for path in stale {
            self.remove_node(&path);
        }
        for item in items {
            self.put_item(parent, index, mapping, source, item);
        }
    }

    fn remove_node(&self, path: &NodePath) {
        let detached = {
            let mut guard = self.state.lock().expect("Tree lock poisoned");
            if !guard.nodes.contains_key(path) {
                return;
            }
            self.drop_subtree(&mut guard, path, true)
        };
        detached.into_iter().for_each(Attachment::detach);
    }

    /// Removes the descendants of `path` (and `path` itself when
    /// `include_self`) deepest first, returning the listeners to detach.
    fn drop_subtree(&self, state: &mut TreeState, path: &NodePath, include_self: bool) -> Vec<Attachment> {
        let mut victims: Vec<NodePath> = state
            .nodes
            .keys()
            .filter(|p| p.is_descendant_of(path))
            .cloned()
            .collect();
        victims.sort_by_key(|p| Reverse(p.depth()));
        if include_self {
            victims.push(path.clone());
        }

        let mut detached = state.attachments.remove(path).unwrap_or_default();
        for victim in &victims {
            if let Some(entry) = state.nodes.remove(victim) {
                detached.extend(entry.link.map(|b| b.attachment));
            }
            if let Some(attachments) = state.attachments.remove(victim) {
                detached.extend(attachments);
            }
            self.list.remove_key(victim.as_str());
        }
        detached
    }
}

/// Mirrors one source mapping's items as children of one node.
struct ChildAttachment {
    tree: Weak<TreeModel>,
    tree_id: String,
    parent: NodePath,
    index: usize,
    mapping: Arc<NodeDef>,
}

impl ListListener for ChildAttachment {
    fn name(&self) -> String {
        format!("tree:{}{}#{}", self.tree_id, self.parent, self.index)
    }

    fn on_list_event(&self, list: &DataList, event: &ListEvent) {
        let Some(tree) = self.tree.upgrade() else {
            return;
        };
        match event {
            ListEvent::Snapshot(items) => tree.sync_mapping(&self.parent, self.index, &self.mapping, list, items),
            ListEvent::Add(item) | ListEvent::Update { new: item, .. } => {
                tree.put_item(&self.parent, self.index, &self.mapping, list, item)
            }
            ListEvent::Remove(item) => {
                if let Ok(key) = list.key_for(&**item) {
                    tree.remove_node(&self.parent.child(self.index, &key));
                }
            }
            ListEvent::Clear => tree.sync_mapping(&self.parent, self.index, &self.mapping, list, &[]),
        }
    }
}

/// Follows the target of one link node.
struct LinkWatcher {
    tree: Weak<TreeModel>,
    tree_id: String,
    path: NodePath,
    key: String,
    expected: Option<TypeTag>,
}

impl ListListener for LinkWatcher {
    fn name(&self) -> String {
        format!("link:{}{}", self.tree_id, self.path)
    }

    fn on_list_event(&self, list: &DataList, event: &ListEvent) {
        let Some(tree) = self.tree.upgrade() else {
            return;
        };
        match event {
            ListEvent::Add(item) | ListEvent::Update { new: item, .. } => {
                if list.key_for(&**item).ok().as_deref() != Some(self.key.as_str()) {
                    return;
                }
                if let Some(expected) = &self.expected {
                    if item.type_tag() != expected {
                        log::warn!(
                            "Tree '{}' node {}: link target {} became a {}, expected {}; update ignored",
                            self.tree_id,
                            self.path,
                            self.key,
                            item.type_tag(),
                            expected
                        );
                        return;
                    }
                }
                tree.relink(&self.path, Arc::clone(item), list.text_of(&**item));
            }
            ListEvent::Remove(item) => {
                if list.key_for(&**item).ok().as_deref() == Some(self.key.as_str()) {
                    log::warn!(
                        "Tree '{}' node {}: link target {} removed from '{}'; keeping the last view",
                        self.tree_id,
                        self.path,
                        self.key,
                        list.id()
                    );
                }
            }
            ListEvent::Clear => log::warn!(
                "Tree '{}' node {}: link source '{}' cleared; keeping the last view",
                self.tree_id,
                self.path,
                list.id()
            ),
            ListEvent::Snapshot(_) => {}
        }
    }
}
