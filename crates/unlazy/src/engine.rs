//! The engine facade.
//!
//! [`Engine`] owns the page-lifetime [`EngineState`] and a handle to the
//! [`Document`]. Embedders spawn [`Engine::run`] once per page and talk to
//! the viewer through [`Engine::merge_with_viewer`], [`Engine::current_list`]
//! and [`Engine::subscribe_list`].

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Error;
use futures::future::join;
use log::{debug, info, warn};
use page_dom::Document;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument as _, info_span};

use crate::ImageRecord;
use crate::collector::{ScanMode, collect};
use crate::config::Options;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::merge::{MergeHint, MergeOutcome, merge, restore_index};
use crate::messenger::Messenger;
use crate::resolver::{self, BATCH_RETRY};
use crate::state::{EngineState, Generation};
use crate::trigger;
use crate::url_norm::MatchIndex;

/// Extra attempts of a scan that found nothing.
pub const EMPTY_SCAN_RETRIES: usize = 3;

pub struct Engine<D: ?Sized> {
    state: EngineState,
    doc: Arc<D>,
}

impl<D: ?Sized> core::fmt::Debug for Engine<D> {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        formatter
            .debug_struct("Engine")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<D: Document + ?Sized> Engine<D> {
    pub fn new(
        doc: Arc<D>,
        options: Options,
        fetcher: Arc<dyn Fetcher>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            state: EngineState::new(options, fetcher, messenger),
            doc,
        }
    }

    /// Engine probing the network with [`HttpFetcher`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if the HTTP client cannot be built.
    pub fn with_http(doc: Arc<D>, options: Options, messenger: Arc<dyn Messenger>) -> Result<Self, Error> {
        Ok(Self::new(doc, options, Arc::new(HttpFetcher::new()?), messenger))
    }

    pub fn document(&self) -> &D {
        &self.doc
    }

    pub const fn state(&self) -> &EngineState {
        &self.state
    }

    /// Resolves every lazy placeholder on the page; see [`resolver::unlazy`].
    pub async fn unlazy(&self) {
        resolver::unlazy(&*self.doc, &self.state)
            .instrument(info_span!("unlazy.unlazy"))
            .await;
    }

    /// Waits up to one second for the first full unlazy pass.
    pub async fn wait_first_unlazy(&self) -> bool {
        resolver::wait_first_unlazy(&self.state).await
    }

    /// Collects the page's images, retrying an empty result
    /// [`EMPTY_SCAN_RETRIES`] times before reporting it.
    pub async fn scan(&self, mode: ScanMode) -> Vec<ImageRecord> {
        let mut attempt = 0;
        loop {
            let records = collect(&*self.doc, &self.state, mode).await;
            if !records.is_empty() || attempt == EMPTY_SCAN_RETRIES {
                if records.is_empty() {
                    debug!("no images found after {EMPTY_SCAN_RETRIES} retries");
                }
                return records;
            }
            attempt += 1;
            sleep(BATCH_RETRY).await;
        }
    }

    /// Size-agnostic snapshot of every image-bearing element.
    pub async fn snapshot(&self) -> Vec<ImageRecord> {
        self.scan(ScanMode::Unfiltered).await
    }

    /// Takes and stores the snapshot once unlazying is complete.
    async fn take_snapshot(&self) {
        let records = self.snapshot().await;
        debug!("snapshot of {} images", records.len());
        self.state.store_snapshot(records);
        let gaps = self.gaps();
        if !gaps.is_empty() {
            debug!("{} snapshot images missing from the list", gaps.len());
        }
    }

    /// The last stored snapshot.
    pub fn last_snapshot(&self) -> Arc<Vec<ImageRecord>> {
        self.state.current_snapshot()
    }

    /// Snapshot images that the published list does not contain.
    pub fn gaps(&self) -> Vec<ImageRecord> {
        let normalizer = &self.state.normalizer;
        let list = self.state.current_list();
        let index = MatchIndex::new(normalizer, list.iter().map(|record| record.src.as_str()));
        self.state
            .current_snapshot()
            .iter()
            .filter(|record| index.find(normalizer, &record.src).is_none())
            .cloned()
            .collect()
    }

    fn merge_into(&self, old: &[ImageRecord], new: &[ImageRecord]) -> Vec<ImageRecord> {
        let _span = info_span!("unlazy.merge", old = old.len(), new = new.len()).entered();
        merge(
            &*self.doc,
            &self.state.normalizer,
            self.state.bad_urls(),
            old,
            new,
        )
    }

    /// One resolve → collect → merge → publish pass under the scan lock.
    pub async fn refresh(&self) -> Arc<Vec<ImageRecord>> {
        async {
            let guard = self.state.scan.acquire().await;
            resolver::resolve_batch(&*self.doc, &self.state).await;
            let fresh = self.scan(ScanMode::Filtered).await;
            let current = self.state.current_list();
            let merged = self.merge_into(&current, &fresh);
            debug!("refresh: {} fresh, {} published", fresh.len(), merged.len());
            self.state.publish(merged);
            guard.release();
            self.state.current_list()
        }
        .instrument(info_span!("unlazy.refresh"))
        .await
    }

    /// Merges a fresh scan into the list the viewer shows and publishes the
    /// result, with the position the viewer should restore.
    pub async fn merge_with_viewer(&self, old: &[ImageRecord], hint: &MergeHint) -> MergeOutcome {
        let guard = self.state.scan.acquire().await;
        let fresh = self.scan(ScanMode::Filtered).await;
        let records = self.merge_into(old, &fresh);
        let restore = restore_index(&self.state.normalizer, &records, hint);
        self.state.publish(records.clone());
        guard.release();
        MergeOutcome {
            records,
            restore_index: restore,
        }
    }

    pub fn current_list(&self) -> Arc<Vec<ImageRecord>> {
        self.state.current_list()
    }

    pub fn subscribe_list(&self) -> watch::Receiver<Arc<Vec<ImageRecord>>> {
        self.state.subscribe_list()
    }

    pub fn open_viewer(&self) {
        self.state.set_viewer_open(true);
    }

    pub fn close_viewer(&self) {
        self.state.set_viewer_open(false);
    }

    /// Excludes `url` from every future list and drops it from the current
    /// one.
    pub async fn report_bad_url(&self, url: &str) {
        let guard = self.state.scan.acquire().await;
        self.state.mark_bad(url);
        let current = self.state.current_list();
        if current.iter().any(|record| record.src == url) {
            let kept = current
                .iter()
                .filter(|record| record.src != url)
                .cloned()
                .collect();
            self.state.publish(kept);
        }
        guard.release();
    }

    /// Forgets everything learned about the previous page.
    pub fn on_navigate(&self) -> Generation {
        self.state.on_navigate()
    }

    /// Drives the page: unlazy, publish the first list, nudge the page's own
    /// lazy loading by scrolling, then refresh on mutations until the page
    /// navigates.
    ///
    /// The first list waits for the unlazy pass at most
    /// [`FIRST_UNLAZY_TIMEOUT`](resolver::FIRST_UNLAZY_TIMEOUT). A pass that
    /// finishes later refreshes again, and the snapshot is taken once it is
    /// done.
    pub async fn run(&self) {
        let generation = self.state.generation();
        let location = self.doc.location();
        info!("unlazy engine starting on {location}");
        let gate_missed = AtomicBool::new(false);

        let pass = async {
            self.unlazy().await;
            if self.state.generation() != generation {
                return;
            }
            if gate_missed.load(Ordering::Acquire) {
                debug!("first unlazy pass finished late; refreshing");
                self.refresh().await;
            }
            self.take_snapshot().await;
        };
        let drive = async {
            if !self.wait_first_unlazy().await {
                gate_missed.store(true, Ordering::Release);
                info!("first unlazy pass still running; publishing without it");
            }
            if self.state.generation() != generation {
                return;
            }
            self.refresh().await;
            self.follow(generation, &location).await;
        };
        join(pass, drive).await;
        debug!("engine for generation {} stopped", generation.get());
    }

    /// Keeps the list current after the first publish.
    async fn follow(&self, generation: Generation, location: &str) {
        if self.state.options.allows_auto_scroll(location) {
            join(
                trigger::observe(self, generation),
                self.auto_scroll_sessions(generation),
            )
            .await;
        } else {
            if trigger::sweep(&*self.doc, self.state.options.throttle()).await {
                self.refresh().await;
            }
            trigger::observe(self, generation).await;
        }
    }

    /// Runs [`trigger::auto_scroll`] each time the viewer opens.
    async fn auto_scroll_sessions(&self, generation: Generation) {
        let mut viewer = self.state.subscribe_viewer();
        while self.state.generation() == generation {
            if viewer.wait_for(|open| *open).await.is_err() {
                return;
            }
            let steps = trigger::auto_scroll(
                &*self.doc,
                &self.state,
                self.state.options.auto_scroll_period(),
            )
            .await;
            debug!("auto-scroll session took {steps} steps");
            if viewer.wait_for(|open| !*open).await.is_err() {
                warn!("viewer state channel closed");
                return;
            }
        }
    }
}
