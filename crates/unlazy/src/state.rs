//! Page-lifetime engine state.
//!
//! Everything that must survive between passes but not across a navigation
//! lives in [`EngineState`]: memoized URL forms, size caches, the bad-URL set,
//! the scan lock and the progress signals observed by the trigger and the
//! viewer. [`EngineState::on_navigate`] discards all of it in one step.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use page_dom::NodeKey;
use log::{debug, info};
use tokio::sync::watch;

use crate::ImageRecord;
use crate::config::Options;
use crate::fetch::Fetcher;
use crate::messenger::Messenger;
use crate::size::SizeOracle;
use crate::sync::ScanMutex;
use crate::url_norm::Normalizer;

/// Identifies one page lifetime. Work started under an older generation
/// stops at its next check instead of being cancelled.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Generation(u64);

impl Generation {
    pub const INITIAL: Self = Self(0);

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Atomic navigation counter.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    current: AtomicU64,
}

impl GenerationCounter {
    #[inline]
    pub const fn new() -> Self {
        Self {
            current: AtomicU64::new(Generation::INITIAL.0),
        }
    }

    #[inline]
    pub fn current(&self) -> Generation {
        Generation(self.current.load(Ordering::Acquire))
    }

    /// Starts a new page lifetime and returns it.
    #[inline]
    pub fn increment(&self) -> Generation {
        Generation(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

pub struct EngineState {
    pub options: Options,
    pub normalizer: Normalizer,
    pub oracle: SizeOracle,
    pub scan: ScanMutex,
    pub messenger: Arc<dyn Messenger>,
    bad_urls: DashSet<String>,
    resolving: DashSet<NodeKey>,
    generation: GenerationCounter,
    refreshes: AtomicU64,
    first_unlazy: watch::Sender<bool>,
    resolved: watch::Sender<u64>,
    viewer_open: watch::Sender<bool>,
    list: watch::Sender<Arc<Vec<ImageRecord>>>,
    snapshot: watch::Sender<Arc<Vec<ImageRecord>>>,
}

impl core::fmt::Debug for EngineState {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        formatter
            .debug_struct("EngineState")
            .field("options", &self.options)
            .field("generation", &self.generation.current())
            .field("bad_urls", &self.bad_urls.len())
            .field("resolved", &self.resolved_count())
            .field("oracle", &self.oracle)
            .finish_non_exhaustive()
    }
}

impl EngineState {
    pub fn new(options: Options, fetcher: Arc<dyn Fetcher>, messenger: Arc<dyn Messenger>) -> Self {
        let (first_unlazy, _) = watch::channel(false);
        let (resolved, _) = watch::channel(0);
        let (viewer_open, _) = watch::channel(false);
        let (list, _) = watch::channel(Arc::new(Vec::new()));
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            options,
            normalizer: Normalizer::new(),
            oracle: SizeOracle::new(fetcher, Arc::clone(&messenger)),
            scan: ScanMutex::new(),
            messenger,
            bad_urls: DashSet::new(),
            resolving: DashSet::new(),
            generation: GenerationCounter::new(),
            refreshes: AtomicU64::new(0),
            first_unlazy,
            resolved,
            viewer_open,
            list,
            snapshot,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation.current()
    }

    /// Discards every cache, the bad-URL set, the published list and the
    /// progress signals, and starts a new generation.
    pub fn on_navigate(&self) -> Generation {
        let generation = self.generation.increment();
        info!("navigation: starting generation {}", generation.get());
        self.normalizer.reset();
        self.oracle.reset();
        self.bad_urls.clear();
        self.first_unlazy.send_replace(false);
        self.resolved.send_replace(0);
        self.list.send_replace(Arc::new(Vec::new()));
        self.snapshot.send_replace(Arc::new(Vec::new()));
        generation
    }

    pub fn is_bad(&self, url: &str) -> bool {
        self.bad_urls.contains(url)
    }

    /// Excludes `url` from all further output until the next navigation.
    pub fn mark_bad(&self, url: &str) {
        if self.bad_urls.insert(url.to_owned()) {
            debug!("bad url {url}");
        }
    }

    pub fn bad_urls(&self) -> &DashSet<String> {
        &self.bad_urls
    }

    /// Claims `node` for resolution; `false` when another pass holds it.
    pub fn begin_resolving(&self, node: NodeKey) -> bool {
        self.resolving.insert(node)
    }

    pub fn end_resolving(&self, node: NodeKey) {
        self.resolving.remove(&node);
    }

    pub fn is_resolving(&self, node: NodeKey) -> bool {
        self.resolving.contains(&node)
    }

    pub fn signal_first_unlazy(&self) {
        if !self.first_unlazy.send_replace(true) {
            info!("first unlazy pass complete");
        }
    }

    pub fn first_unlazy_done(&self) -> bool {
        *self.first_unlazy.borrow()
    }

    pub fn subscribe_first_unlazy(&self) -> watch::Receiver<bool> {
        self.first_unlazy.subscribe()
    }

    /// Records one more settled element.
    pub fn bump_resolved(&self) {
        self.resolved.send_modify(|count| *count += 1);
    }

    pub fn resolved_count(&self) -> u64 {
        *self.resolved.borrow()
    }

    pub fn subscribe_resolved(&self) -> watch::Receiver<u64> {
        self.resolved.subscribe()
    }

    pub fn set_viewer_open(&self, open: bool) {
        self.viewer_open.send_replace(open);
    }

    pub fn viewer_open(&self) -> bool {
        *self.viewer_open.borrow()
    }

    pub fn subscribe_viewer(&self) -> watch::Receiver<bool> {
        self.viewer_open.subscribe()
    }

    /// Replaces the authoritative list. Callers hold the scan lock.
    pub fn publish(&self, records: Vec<ImageRecord>) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.list.send_replace(Arc::new(records));
    }

    pub fn current_list(&self) -> Arc<Vec<ImageRecord>> {
        Arc::clone(&self.list.borrow())
    }

    pub fn subscribe_list(&self) -> watch::Receiver<Arc<Vec<ImageRecord>>> {
        self.list.subscribe()
    }

    /// Stores the size-agnostic snapshot used for gap detection.
    pub fn store_snapshot(&self, records: Vec<ImageRecord>) {
        self.snapshot.send_replace(Arc::new(records));
    }

    pub fn current_snapshot(&self) -> Arc<Vec<ImageRecord>> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Number of lists published so far.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::HttpFetcher;
    use crate::messenger::NullMessenger;

    fn state() -> EngineState {
        EngineState::new(
            Options::default(),
            Arc::new(HttpFetcher::new().unwrap()),
            Arc::new(NullMessenger),
        )
    }

    #[test]
    fn navigation_resets_everything() {
        let state = state();
        state.mark_bad("https://example.com/broken.jpg");
        state.normalizer.raw_url("https://example.com/a-10x10.jpg");
        state.bump_resolved();
        state.signal_first_unlazy();
        state.publish(vec![ImageRecord::new("https://example.com/a.jpg", None)]);
        state.store_snapshot(vec![ImageRecord::new("https://example.com/a.jpg", None)]);
        assert_eq!(state.refreshes(), 1);

        let generation = state.on_navigate();
        assert_eq!(generation, state.generation());
        assert!(generation > Generation::INITIAL);
        assert!(!state.is_bad("https://example.com/broken.jpg"));
        assert_eq!(state.normalizer.cached_len(), 0);
        assert_eq!(state.resolved_count(), 0);
        assert!(!state.first_unlazy_done());
        assert!(state.current_list().is_empty());
        assert!(state.current_snapshot().is_empty());
    }

    #[test]
    fn generations_increase() {
        let counter = GenerationCounter::new();
        assert_eq!(counter.current(), Generation::INITIAL);
        let first = counter.increment();
        let second = counter.increment();
        assert!(second > first);
        assert_eq!(second.get(), 2);
    }
}
