//! Scripted collaborators shared by the integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Arc;

use anyhow::{Error, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use page_dom::{MemoryDocument, NodeKey, Rect};
use unlazy::fetch::{Fetcher, HeadInfo};
use unlazy::messenger::{FrameImages, FrameRequest, Messenger};
use unlazy::{EngineState, Options};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fetcher answering from a table. Unknown URLs probe as 404 and fail to
/// load.
#[derive(Default)]
pub struct FakeFetcher {
    heads: DashMap<String, HeadInfo>,
    dimensions: DashMap<String, (u32, u32)>,
    latency: Option<Duration>,
    pub head_calls: AtomicUsize,
    pub load_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Registers a JPEG of `bytes` bytes and `width`×`height` pixels.
    pub fn image(&self, url: &str, bytes: u64, width: u32, height: u32) {
        self.respond(url, 200, Some("image/jpeg"), Some(bytes));
        self.dimensions.insert(url.to_owned(), (width, height));
    }

    pub fn respond(&self, url: &str, status: u16, content_type: Option<&str>, length: Option<u64>) {
        self.heads.insert(
            url.to_owned(),
            HeadInfo {
                status,
                content_type: content_type.map(str::to_owned),
                content_length: length,
            },
        );
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn head(&self, url: &str) -> Result<HeadInfo, Error> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        Ok(self.heads.get(url).map_or_else(
            || HeadInfo {
                status: 404,
                ..HeadInfo::default()
            },
            |head| head.clone(),
        ))
    }

    async fn dimensions(&self, url: &str) -> Result<(u32, u32), Error> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        self.dimensions
            .get(url)
            .map(|size| *size)
            .ok_or_else(|| anyhow!("no image at {url}"))
    }
}

/// Messenger answering frame and probe requests from tables.
#[derive(Default)]
pub struct FakeMessenger {
    frames: DashMap<String, Vec<String>>,
    sizes: DashMap<String, u64>,
    pub frame_requests: AtomicUsize,
}

impl FakeMessenger {
    pub fn frame(&self, url: &str, images: &[&str]) {
        self.frames.insert(
            url.to_owned(),
            images.iter().map(|image| (*image).to_owned()).collect(),
        );
    }

    pub fn size(&self, url: &str, bytes: u64) {
        self.sizes.insert(url.to_owned(), bytes);
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn frame_images(&self, frames: Vec<FrameRequest>) -> Vec<FrameImages> {
        self.frame_requests.fetch_add(1, Ordering::SeqCst);
        frames
            .into_iter()
            .filter_map(|request| {
                self.frames.get(&request.url).map(|urls| FrameImages {
                    frame: request.frame,
                    urls: urls.clone(),
                })
            })
            .collect()
    }

    async fn probe_size(&self, url: &str) -> Option<u64> {
        self.sizes.get(url).map(|size| *size)
    }

    async fn is_image(&self, _url: &str) -> bool {
        false
    }
}

pub fn state_with(fetcher: &Arc<FakeFetcher>, messenger: &Arc<FakeMessenger>) -> EngineState {
    EngineState::new(
        Options::default(),
        Arc::clone(fetcher) as Arc<dyn Fetcher>,
        Arc::clone(messenger) as Arc<dyn Messenger>,
    )
}

/// Appends an `<img>` with a rendered box large enough for filtered scans.
pub fn visible_img(doc: &MemoryDocument, parent: NodeKey, attrs: &[(&str, &str)]) -> NodeKey {
    let node = doc.create_element(parent, "img", attrs);
    doc.set_box(node, Rect::new(0.0, 0.0, 200.0, 200.0));
    node
}
