//! Page model seam for the unlazy engine.
//!
//! The engine never holds live element objects. It works with stable
//! [`NodeKey`]s and asks a [`Document`] implementation about them: tree
//! shape (including shadow trees), attributes, layout boxes, load state and
//! scrolling. Mutations are observed through the [`DomChange`] broadcast
//! stream returned by [`Document::subscribe`].
//!
//! [`MemoryDocument`] is an arena-backed implementation used by embedders
//! that mirror a page and by tests that inject synthetic mutations.

#![allow(
    clippy::missing_inline_in_public_items,
    reason = "Inlining decisions left to compiler for this crate"
)]

pub mod document;
pub mod memory;
pub mod updating;

pub use document::{Document, Rect, compare_position, composed_ancestors};
pub use memory::MemoryDocument;
pub use updating::DomChange;

/// A 64-bit stable key for DOM nodes used to correlate asynchronous work.
///
/// Keys are never reused within a document, so a key held by a stale record
/// keeps referring to the same (possibly detached) node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeKey(pub u64);

impl NodeKey {
    /// The document node key (always present).
    pub const ROOT: Self = Self(0);

    /// Raw key value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}
