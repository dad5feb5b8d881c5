//! Image discovery and lazy-placeholder resolution.
//!
//! The engine finds every image-bearing element of a page (images, video
//! posters, SVG images, CSS backgrounds, shadow trees and iframes), upgrades
//! lazy placeholders to the best real source it can confirm, and maintains
//! one ordered, de-duplicated image list that stays stable while a viewer is
//! browsing it.
//!
//! The pipeline of one refresh is resolve ([`resolver`]) → collect
//! ([`collector`]) → merge ([`merge`]) → publish, serialized by the scan lock
//! in [`sync`]. [`trigger`] schedules refreshes from page mutations and
//! scrolling; [`Engine`] ties the parts together.

#![allow(
    clippy::missing_inline_in_public_items,
    reason = "Inlining decisions left to compiler for this crate"
)]

pub mod candidates;
pub mod collector;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod merge;
pub mod messenger;
pub mod resolver;
pub mod size;
pub mod state;
pub mod sync;
pub mod trigger;
pub mod url_norm;

use page_dom::NodeKey;

pub use config::Options;
pub use engine::Engine;
pub use merge::{MergeHint, MergeOutcome};
pub use messenger::{Messenger, NullMessenger};
pub use state::EngineState;

/// One discovered image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRecord {
    /// Absolute source URL.
    pub src: String,
    /// Element the image was found on; for iframe content, the iframe.
    pub dom: Option<NodeKey>,
}

impl ImageRecord {
    pub fn new(src: impl Into<String>, dom: Option<NodeKey>) -> Self {
        Self {
            src: src.into(),
            dom,
        }
    }
}
