//! Privileged cross-context collaborator.
//!
//! The engine runs inside one frame of a page. Anything it cannot do from
//! there (reading other frames, probing hosts that block cross-origin
//! requests, checking local files) goes through a [`Messenger`]. Every
//! failure resolves to a neutral value, never an error.

use async_trait::async_trait;
use page_dom::NodeKey;

/// One iframe whose images are requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    pub frame: NodeKey,
    pub url: String,
}

/// Ordered image URLs found inside one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImages {
    pub frame: NodeKey,
    pub urls: Vec<String>,
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Image URLs of each requested frame, keyed by frame identity. Frames
    /// that could not be read are omitted.
    async fn frame_images(&self, frames: Vec<FrameRequest>) -> Vec<FrameImages>;

    /// Byte size of `url` probed from a privileged context; `None` on failure.
    async fn probe_size(&self, url: &str) -> Option<u64>;

    /// Whether `url` (typically `file:`) points at an image.
    async fn is_image(&self, url: &str) -> bool;
}

/// Messenger for contexts without a privileged side: answers every request
/// neutrally.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMessenger;

#[async_trait]
impl Messenger for NullMessenger {
    async fn frame_images(&self, _frames: Vec<FrameRequest>) -> Vec<FrameImages> {
        Vec::new()
    }

    async fn probe_size(&self, _url: &str) -> Option<u64> {
        None
    }

    async fn is_image(&self, _url: &str) -> bool {
        false
    }
}
