use crate::NodeKey;

/// A mutation observed on the page.
///
/// Producers broadcast these as they apply changes; subscribers must treat
/// them as hints and re-query the [`Document`](crate::Document) for current
/// state, since a lagging receiver may miss intermediate values.
#[derive(Debug, Clone, PartialEq)]
pub enum DomChange {
    /// `node` was inserted under `parent` (light tree or shadow root).
    ChildInserted { parent: NodeKey, node: NodeKey },
    /// `node` was detached together with its subtree.
    NodeRemoved { node: NodeKey },
    /// Attribute `name` of `node` was set or removed.
    AttributeChanged { node: NodeKey, name: String },
    /// The document scroll offset changed.
    Scrolled { y: f64 },
}

impl DomChange {
    /// The node this change is about, if any.
    #[inline]
    pub const fn node(&self) -> Option<NodeKey> {
        match self {
            Self::ChildInserted { node, .. }
            | Self::NodeRemoved { node }
            | Self::AttributeChanged { node, .. } => Some(*node),
            Self::Scrolled { .. } => None,
        }
    }
}
