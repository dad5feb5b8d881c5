//! Arena-backed in-memory [`Document`].
//!
//! Mirrors just enough of a page for the engine: elements with attributes,
//! shadow roots, a rendered box, a computed background, load state and a
//! single scroll axis. Every mutation is broadcast as a [`DomChange`], which
//! makes the type usable both as an embedder-side mirror and as a test
//! harness for synthetic page activity.

use std::collections::HashMap;

use indextree::{Arena, NodeId};
use log::trace;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::broadcast;
use url::Url;

use crate::{Document, DomChange, NodeKey, Rect};

/// Capacity of the change channel; slow subscribers observe `Lagged`.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default)]
enum NodeKind {
    #[default]
    Document,
    Element {
        tag: String,
    },
    ShadowRoot {
        host: NodeKey,
    },
}

#[derive(Debug, Clone)]
struct DOMNode {
    key: NodeKey,
    kind: NodeKind,
    attrs: SmallVec<[(String, String); 4]>,
    shadow: Option<NodeKey>,
    layout: Rect,
    background: Option<String>,
    natural: Option<(u32, u32)>,
    complete: bool,
    current_override: Option<String>,
}

impl DOMNode {
    fn new(key: NodeKey, kind: NodeKind) -> Self {
        Self {
            key,
            kind,
            attrs: SmallVec::new(),
            shadow: None,
            layout: Rect::default(),
            background: None,
            natural: None,
            complete: true,
            current_override: None,
        }
    }

    fn tag(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Element { tag } => Some(tag),
            NodeKind::Document | NodeKind::ShadowRoot { .. } => None,
        }
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
struct Tree {
    arena: Arena<DOMNode>,
    ids: HashMap<NodeKey, NodeId>,
    next_key: u64,
    location: String,
    scroll_y: f64,
    scroll_height: f64,
    viewport_height: f64,
}

impl Tree {
    fn id(&self, key: NodeKey) -> Option<NodeId> {
        self.ids.get(&key).copied()
    }

    fn node(&self, key: NodeKey) -> Option<&DOMNode> {
        let id = self.id(key)?;
        self.arena.get(id).map(indextree::Node::get)
    }

    fn node_mut(&mut self, key: NodeKey) -> Option<&mut DOMNode> {
        let id = self.id(key)?;
        self.arena.get_mut(id).map(indextree::Node::get_mut)
    }

    fn mint(&mut self, kind: NodeKind) -> (NodeKey, NodeId) {
        let key = NodeKey(self.next_key);
        self.next_key = self.next_key.wrapping_add(1);
        let id = self.arena.new_node(DOMNode::new(key, kind));
        self.ids.insert(key, id);
        (key, id)
    }

    fn key_of(&self, id: NodeId) -> Option<NodeKey> {
        self.arena.get(id).map(|node| node.get().key)
    }

    fn attached(&self, key: NodeKey) -> bool {
        let mut current = key;
        // Each hop leaves one shadow tree, so the walk is bounded by nesting depth.
        for _ in 0..=self.ids.len() {
            let Some(id) = self.id(current) else {
                return false;
            };
            let top = id.ancestors(&self.arena).last().unwrap_or(id);
            let Some(top_node) = self.arena.get(top) else {
                return false;
            };
            match &top_node.get().kind {
                NodeKind::Document => return true,
                NodeKind::ShadowRoot { host } => current = *host,
                NodeKind::Element { .. } => return false,
            }
        }
        false
    }

    fn resolve(&self, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        match Url::parse(&self.location).and_then(|base| base.join(trimmed)) {
            Ok(url) => Some(url.to_string()),
            Err(_) => Some(trimmed.to_owned()),
        }
    }

    /// First `<source srcset>` preceding `node` inside a `<picture>` parent.
    fn picture_source(&self, key: NodeKey) -> Option<&str> {
        let id = self.id(key)?;
        let parent = self.arena.get(id)?.parent()?;
        if self.arena.get(parent)?.get().tag() != Some("picture") {
            return None;
        }
        parent
            .children(&self.arena)
            .filter_map(|child| self.arena.get(child).map(indextree::Node::get))
            .filter(|sibling| sibling.tag() == Some("source"))
            .find_map(|sibling| sibling.attr("srcset"))
    }

    fn current_src(&self, key: NodeKey) -> Option<String> {
        let node = self.node(key)?;
        if let Some(current) = &node.current_override {
            return Some(current.clone());
        }
        let raw = match node.tag()? {
            "img" => self
                .picture_source(key)
                .or_else(|| node.attr("srcset"))
                .and_then(first_srcset_url)
                .or_else(|| node.attr("src")),
            "video" => node.attr("poster"),
            "image" => node.attr("href").or_else(|| node.attr("xlink:href")),
            _ => None,
        }?;
        self.resolve(raw)
    }
}

fn first_srcset_url(srcset: &str) -> Option<&str> {
    srcset
        .split(',')
        .filter_map(|entry| entry.split_whitespace().next())
        .find(|url| !url.is_empty())
}

/// Extracts the `url(...)` value of an inline `background`/`background-image`
/// declaration.
fn inline_background(style: &str) -> Option<String> {
    style.split(';').find_map(|declaration| {
        let (property, value) = declaration.split_once(':')?;
        let property = property.trim().to_ascii_lowercase();
        if property != "background-image" && property != "background" {
            return None;
        }
        let value = value.trim();
        value.contains("url(").then(|| value.to_owned())
    })
}

/// In-memory page implementing [`Document`].
#[derive(Debug)]
pub struct MemoryDocument {
    tree: RwLock<Tree>,
    update_sender: broadcast::Sender<DomChange>,
}

impl MemoryDocument {
    /// Creates an empty document at `location` with a 1000px viewport.
    pub fn new(location: &str) -> Self {
        let mut arena = Arena::new();
        let root_id = arena.new_node(DOMNode::new(NodeKey::ROOT, NodeKind::Document));
        let mut ids = HashMap::new();
        ids.insert(NodeKey::ROOT, root_id);
        let (update_sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tree: RwLock::new(Tree {
                arena,
                ids,
                next_key: 1,
                location: location.to_owned(),
                scroll_y: 0.0,
                scroll_height: 1000.0,
                viewport_height: 1000.0,
            }),
            update_sender,
        }
    }

    fn emit(&self, change: DomChange) {
        trace!("dom change {change:?}");
        // No subscribers is fine.
        drop(self.update_sender.send(change));
    }

    /// Appends a new element under `parent` and returns its key.
    pub fn create_element(&self, parent: NodeKey, tag: &str, attrs: &[(&str, &str)]) -> NodeKey {
        self.insert_element(parent, usize::MAX, tag, attrs)
    }

    /// Inserts a new element as child number `index` of `parent` (appending
    /// when `index` is past the end).
    pub fn insert_element(
        &self,
        parent: NodeKey,
        index: usize,
        tag: &str,
        attrs: &[(&str, &str)],
    ) -> NodeKey {
        let key = {
            let mut tree = self.tree.write();
            let (key, id) = tree.mint(NodeKind::Element {
                tag: tag.to_ascii_lowercase(),
            });
            if let Some(node) = tree.node_mut(key) {
                node.attrs = attrs
                    .iter()
                    .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
                    .collect();
            }
            if let Some(parent_id) = tree.id(parent) {
                let sibling = parent_id.children(&tree.arena).nth(index);
                match sibling {
                    Some(sibling) => sibling.insert_before(id, &mut tree.arena),
                    None => parent_id.append(id, &mut tree.arena),
                }
            }
            key
        };
        self.emit(DomChange::ChildInserted { parent, node: key });
        key
    }

    /// Attaches (or returns the existing) shadow root of `host`.
    pub fn attach_shadow(&self, host: NodeKey) -> NodeKey {
        let root = {
            let mut tree = self.tree.write();
            if let Some(existing) = tree.node(host).and_then(|node| node.shadow) {
                return existing;
            }
            let (root, _) = tree.mint(NodeKind::ShadowRoot { host });
            if let Some(node) = tree.node_mut(host) {
                node.shadow = Some(root);
            }
            root
        };
        self.emit(DomChange::ChildInserted {
            parent: host,
            node: root,
        });
        root
    }

    /// Detaches `node` and its subtree. Its key stays valid but reports
    /// `is_attached() == false`.
    pub fn remove(&self, node: NodeKey) {
        {
            let mut tree = self.tree.write();
            let Some(id) = tree.id(node) else {
                return;
            };
            id.detach(&mut tree.arena);
        }
        self.emit(DomChange::NodeRemoved { node });
    }

    pub fn set_box(&self, node: NodeKey, rect: Rect) {
        if let Some(data) = self.tree.write().node_mut(node) {
            data.layout = rect;
        }
    }

    /// Sets the computed (stylesheet-derived) background image.
    pub fn set_background(&self, node: NodeKey, value: Option<&str>) {
        if let Some(data) = self.tree.write().node_mut(node) {
            data.background = value.map(str::to_owned);
        }
    }

    pub fn set_natural_size(&self, node: NodeKey, size: Option<(u32, u32)>) {
        if let Some(data) = self.tree.write().node_mut(node) {
            data.natural = size;
        }
    }

    /// Marks an image element as loading (`false`) or settled (`true`).
    pub fn set_complete(&self, node: NodeKey, complete: bool) {
        if let Some(data) = self.tree.write().node_mut(node) {
            data.complete = complete;
        }
    }

    /// Pins `current_src` to `value` regardless of attributes, as a page
    /// whose own script swaps sources would.
    pub fn set_current_src(&self, node: NodeKey, value: Option<&str>) {
        if let Some(data) = self.tree.write().node_mut(node) {
            data.current_override = value.map(str::to_owned);
        }
    }

    pub fn set_location(&self, location: &str) {
        self.tree.write().location = location.to_owned();
    }

    pub fn set_scroll_height(&self, height: f64) {
        self.tree.write().scroll_height = height;
    }

    pub fn set_viewport_height(&self, height: f64) {
        self.tree.write().viewport_height = height;
    }

    /// Number of nodes ever created, including detached ones.
    pub fn node_count(&self) -> usize {
        self.tree.read().ids.len()
    }
}

impl Document for MemoryDocument {
    fn root(&self) -> NodeKey {
        NodeKey::ROOT
    }

    fn location(&self) -> String {
        self.tree.read().location.clone()
    }

    fn children(&self, node: NodeKey) -> Vec<NodeKey> {
        let tree = self.tree.read();
        let Some(id) = tree.id(node) else {
            return Vec::new();
        };
        id.children(&tree.arena)
            .filter_map(|child| tree.key_of(child))
            .collect()
    }

    fn parent(&self, node: NodeKey) -> Option<NodeKey> {
        let tree = self.tree.read();
        let id = tree.id(node)?;
        let parent = tree.arena.get(id)?.parent()?;
        tree.key_of(parent)
    }

    fn shadow_root(&self, host: NodeKey) -> Option<NodeKey> {
        self.tree.read().node(host)?.shadow
    }

    fn shadow_host(&self, root: NodeKey) -> Option<NodeKey> {
        match self.tree.read().node(root)?.kind {
            NodeKind::ShadowRoot { host } => Some(host),
            NodeKind::Document | NodeKind::Element { .. } => None,
        }
    }

    fn tag_name(&self, node: NodeKey) -> Option<String> {
        self.tree.read().node(node)?.tag().map(str::to_owned)
    }

    fn attribute(&self, node: NodeKey, name: &str) -> Option<String> {
        self.tree.read().node(node)?.attr(name).map(str::to_owned)
    }

    fn attributes(&self, node: NodeKey) -> Vec<(String, String)> {
        self.tree
            .read()
            .node(node)
            .map(|data| data.attrs.to_vec())
            .unwrap_or_default()
    }

    fn set_attribute(&self, node: NodeKey, name: &str, value: &str) {
        {
            let mut tree = self.tree.write();
            let Some(data) = tree.node_mut(node) else {
                return;
            };
            if let Some(slot) = data.attrs.iter_mut().find(|(key, _)| key == name) {
                value.clone_into(&mut slot.1);
            } else {
                data.attrs.push((name.to_owned(), value.to_owned()));
            }
        }
        self.emit(DomChange::AttributeChanged {
            node,
            name: name.to_owned(),
        });
    }

    fn remove_attribute(&self, node: NodeKey, name: &str) {
        let removed = {
            let mut tree = self.tree.write();
            let Some(data) = tree.node_mut(node) else {
                return;
            };
            let before = data.attrs.len();
            data.attrs.retain(|(key, _)| key != name);
            data.attrs.len() != before
        };
        if removed {
            self.emit(DomChange::AttributeChanged {
                node,
                name: name.to_owned(),
            });
        }
    }

    fn is_attached(&self, node: NodeKey) -> bool {
        self.tree.read().attached(node)
    }

    fn current_src(&self, node: NodeKey) -> Option<String> {
        self.tree.read().current_src(node)
    }

    fn natural_size(&self, node: NodeKey) -> Option<(u32, u32)> {
        self.tree.read().node(node)?.natural
    }

    fn is_complete(&self, node: NodeKey) -> bool {
        self.tree
            .read()
            .node(node)
            .is_some_and(|data| data.complete)
    }

    fn bounding_box(&self, node: NodeKey) -> Rect {
        self.tree
            .read()
            .node(node)
            .map(|data| data.layout)
            .unwrap_or_default()
    }

    fn background_image(&self, node: NodeKey) -> Option<String> {
        let tree = self.tree.read();
        let data = tree.node(node)?;
        data.attr("style")
            .and_then(inline_background)
            .or_else(|| data.background.clone())
    }

    fn scroll_y(&self) -> f64 {
        self.tree.read().scroll_y
    }

    fn scroll_to(&self, y: f64) {
        let clamped = {
            let mut tree = self.tree.write();
            let max = (tree.scroll_height - tree.viewport_height).max(0.0);
            tree.scroll_y = y.clamp(0.0, max);
            tree.scroll_y
        };
        self.emit(DomChange::Scrolled { y: clamped });
    }

    fn scroll_height(&self) -> f64 {
        self.tree.read().scroll_height
    }

    fn viewport_height(&self) -> f64 {
        self.tree.read().viewport_height
    }

    fn subscribe(&self) -> broadcast::Receiver<DomChange> {
        self.update_sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_background_extracts_url_declaration() {
        assert_eq!(
            inline_background("color: red; background-image: url(\"a.jpg\")"),
            Some("url(\"a.jpg\")".to_owned())
        );
        assert_eq!(inline_background("background: none"), None);
        assert_eq!(inline_background(""), None);
    }

    #[test]
    fn first_srcset_url_skips_descriptors() {
        assert_eq!(first_srcset_url("a.jpg 1x, b.jpg 2x"), Some("a.jpg"));
        assert_eq!(first_srcset_url(" , c.jpg 300w"), Some("c.jpg"));
        assert_eq!(first_srcset_url(""), None);
    }
}
