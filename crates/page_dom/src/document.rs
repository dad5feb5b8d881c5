//! The [`Document`] trait and composed-tree helpers built on it.

use core::cmp::Ordering;

use tokio::sync::broadcast;
use url::Url;

use crate::{DomChange, NodeKey};

/// Axis-aligned rendered box in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    /// Creates a rectangle from its origin and size.
    #[inline]
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Read/write access to a live page, keyed by [`NodeKey`].
///
/// All methods take `&self`: the page is shared between the resolver, the
/// collector and the trigger, and implementations synchronise internally.
/// Queries about unknown keys answer the neutral value (`None`, empty,
/// `false`) instead of failing.
pub trait Document: Send + Sync {
    /// The document node.
    fn root(&self) -> NodeKey;

    /// Current page location; a change of location is a navigation.
    fn location(&self) -> String;

    /// Base URL used to resolve relative attribute values.
    fn base_url(&self) -> Option<Url> {
        Url::parse(&self.location()).ok()
    }

    /// Light-tree children of `node`, in document order.
    fn children(&self, node: NodeKey) -> Vec<NodeKey>;

    /// Light-tree parent of `node`. Shadow roots have no parent; use
    /// [`Document::shadow_host`].
    fn parent(&self, node: NodeKey) -> Option<NodeKey>;

    /// Shadow root attached to `host`, if any.
    fn shadow_root(&self, host: NodeKey) -> Option<NodeKey>;

    /// Host element of the shadow root `root`.
    fn shadow_host(&self, root: NodeKey) -> Option<NodeKey>;

    /// Lowercase tag name; `None` for non-element nodes.
    fn tag_name(&self, node: NodeKey) -> Option<String>;

    fn attribute(&self, node: NodeKey, name: &str) -> Option<String>;

    /// All attributes in source order.
    fn attributes(&self, node: NodeKey) -> Vec<(String, String)>;

    fn set_attribute(&self, node: NodeKey, name: &str, value: &str);

    fn remove_attribute(&self, node: NodeKey, name: &str);

    /// Whether `node` is connected to the document, crossing shadow
    /// boundaries through their hosts.
    fn is_attached(&self, node: NodeKey) -> bool;

    /// The source the platform actually resolved for an image element
    /// (`currentSrc`), absolute. `None` until something is selected.
    fn current_src(&self, node: NodeKey) -> Option<String>;

    /// Intrinsic `(width, height)` of the loaded image, if known.
    fn natural_size(&self, node: NodeKey) -> Option<(u32, u32)>;

    /// `false` while an image element is still loading.
    fn is_complete(&self, node: NodeKey) -> bool;

    /// Rendered border box.
    fn bounding_box(&self, node: NodeKey) -> Rect;

    /// Computed `background-image` value (e.g. `url("a.jpg")`), if any.
    fn background_image(&self, node: NodeKey) -> Option<String>;

    fn scroll_y(&self) -> f64;

    fn scroll_to(&self, y: f64);

    /// Total scrollable height of the document.
    fn scroll_height(&self) -> f64;

    fn viewport_height(&self) -> f64;

    /// Subscribe to mutations from this point on.
    fn subscribe(&self) -> broadcast::Receiver<DomChange>;
}

/// Composed path of `node` from the document root, one child index per
/// level. A shadow root sorts before the light children of its host.
///
/// Returns `None` for detached nodes.
pub fn composed_ancestors<D: Document + ?Sized>(doc: &D, node: NodeKey) -> Option<Vec<usize>> {
    let root = doc.root();
    let mut path = Vec::new();
    let mut current = node;
    while current != root {
        if let Some(parent) = doc.parent(current) {
            let index = doc
                .children(parent)
                .iter()
                .position(|child| *child == current)?;
            path.push(index + 1);
            current = parent;
        } else if let Some(host) = doc.shadow_host(current) {
            path.push(0);
            current = host;
        } else {
            return None;
        }
    }
    path.reverse();
    Some(path)
}

/// Compares two nodes by composed document position.
///
/// Nodes in different shadow trees are ordered by walking their ancestor
/// chains root by root. Detached nodes compare equal to everything so a
/// stable sort leaves them in place.
pub fn compare_position<D: Document + ?Sized>(doc: &D, left: NodeKey, right: NodeKey) -> Ordering {
    if left == right {
        return Ordering::Equal;
    }
    match (composed_ancestors(doc, left), composed_ancestors(doc, right)) {
        (Some(left_path), Some(right_path)) => left_path.cmp(&right_path),
        _ => Ordering::Equal,
    }
}
