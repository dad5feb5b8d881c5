//! Lazy placeholder resolution.
//!
//! For each image-bearing element the resolver measures the current source,
//! walks the element's [`candidates`](crate::candidates::candidates) and
//! swaps in the first one that is measurably better, repeating until no
//! candidate wins. Settled elements carry [`RESOLVED_ATTR`].

use core::time::Duration;
use std::collections::HashSet;

use futures::future::join_all;
use log::{debug, info, trace};
use once_cell::sync::Lazy;
use page_dom::{Document, NodeKey};
use regex::Regex;
use tokio::time::{Instant, sleep, timeout};

use crate::candidates::{Candidate, candidates};
use crate::collector::{ElementSource, SourceKind, composed_elements, element_source, invalidate_style};
use crate::size::LOAD_TIMEOUT;
use crate::state::EngineState;

/// Marker attribute of settled elements.
pub const RESOLVED_ATTR: &str = "data-unlazy";

const RESOLVED_VALUE: &str = "done";

/// Poll interval while waiting for a rewritten source to become visible.
pub const SETTLE_POLL: Duration = Duration::from_millis(20);

/// Pause between batch passes while elements are still loading.
pub const BATCH_RETRY: Duration = Duration::from_millis(100);

/// How long consumers wait for the first full pass.
pub const FIRST_UNLAZY_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on upgrades of one element in one call.
const MAX_UPGRADES: usize = 16;

/// Upper bound on batch passes of one [`unlazy`] call.
const MAX_BATCH_PASSES: usize = 100;

#[allow(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
static CSS_URL_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\(\s*(?:"[^"]*"|'[^']*'|[^)]*)\s*\)"#).unwrap());

/// Comparable quality of a source. The kind is fixed by the baseline and
/// every candidate is measured the same way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Measure {
    Bytes(u64),
    Pixels(u32),
}

impl Measure {
    pub fn value(self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Pixels(pixels) => u64::from(pixels),
        }
    }
}

pub fn is_resolved<D: Document + ?Sized>(doc: &D, node: NodeKey) -> bool {
    doc.attribute(node, RESOLVED_ATTR).as_deref() == Some(RESOLVED_VALUE)
}

async fn baseline<D: Document + ?Sized>(
    doc: &D,
    state: &EngineState,
    node: NodeKey,
    source: &ElementSource,
    page: &str,
) -> Measure {
    if source.url.is_empty() {
        return Measure::Pixels(0);
    }
    let bytes = state.oracle.byte_size(&source.url, page).await;
    if bytes > 0 {
        return Measure::Bytes(bytes);
    }
    if source.kind == SourceKind::Image
        && let Some((width, height)) = doc.natural_size(node)
    {
        state.oracle.record_pixel_size(&source.url, width, height);
    }
    Measure::Pixels(state.oracle.pixel_size(&source.url).await)
}

/// Measures `url` the same way as `baseline`. A candidate that cannot be
/// loaded as an image at all is marked bad.
async fn measure_like(state: &EngineState, baseline: Measure, url: &str, page: &str) -> Measure {
    match baseline {
        Measure::Bytes(_) => Measure::Bytes(state.oracle.byte_size(url, page).await),
        Measure::Pixels(_) => {
            let pixels = state.oracle.pixel_size(url).await;
            if pixels == 0 {
                state.mark_bad(url);
            }
            Measure::Pixels(pixels)
        }
    }
}

/// Whether `candidate` measuring `measure` beats the current source.
///
/// Equal measures only win when the candidate is a different picture (other
/// canonical form or other filename), not a cache-busted copy.
fn is_better(state: &EngineState, current: &str, baseline: Measure, candidate: &str, measure: Measure) -> bool {
    let value = measure.value();
    if value == 0 {
        return false;
    }
    let base = baseline.value();
    if value > base {
        return true;
    }
    value == base
        && (state.normalizer.raw_url(candidate) != state.normalizer.raw_url(current)
            || state.normalizer.filename(candidate) != state.normalizer.filename(current))
}

/// Replaces the `url(...)` of inline background declarations with `url`, or
/// appends a `background-image` declaration when there is none.
fn rewrite_background_style(style: &str, url: &str) -> String {
    let replacement = format!("url(\"{url}\")");
    let mut replaced = false;
    let mut declarations: Vec<String> = style
        .split(';')
        .map(str::trim)
        .filter(|declaration| !declaration.is_empty())
        .map(|declaration| {
            let property = declaration
                .split_once(':')
                .map(|(property, _)| property.trim().to_ascii_lowercase());
            let is_background = matches!(property.as_deref(), Some("background" | "background-image"));
            if is_background && CSS_URL_CALL.is_match(declaration) {
                replaced = true;
                CSS_URL_CALL
                    .replace(declaration, regex::NoExpand(&replacement))
                    .into_owned()
            } else {
                declaration.to_owned()
            }
        })
        .collect();
    if !replaced {
        declarations.push(format!("background-image: {replacement}"));
    }
    declarations.join("; ")
}

/// Points every source declaration of `node` at `url`.
fn rewrite<D: Document + ?Sized>(doc: &D, node: NodeKey, kind: SourceKind, url: &str) {
    match kind {
        SourceKind::Image => {
            if let Some(picture) = doc.parent(node)
                && doc.tag_name(picture).as_deref() == Some("picture")
            {
                for sibling in doc.children(picture) {
                    if sibling != node && doc.tag_name(sibling).as_deref() == Some("source") {
                        doc.set_attribute(sibling, "srcset", url);
                    }
                }
            }
            if doc.attribute(node, "srcset").is_some() {
                doc.set_attribute(node, "srcset", url);
            }
            doc.set_attribute(node, "src", url);
        }
        SourceKind::Poster => doc.set_attribute(node, "poster", url),
        SourceKind::SvgImage => {
            if doc.attribute(node, "xlink:href").is_some() {
                doc.set_attribute(node, "xlink:href", url);
            }
            doc.set_attribute(node, "href", url);
        }
        SourceKind::Background => {
            let style = doc.attribute(node, "style").unwrap_or_default();
            doc.set_attribute(node, "style", &rewrite_background_style(&style, url));
        }
    }
    invalidate_style(doc, node);
}

/// Polls until the source visible on `node` is `url`, the node detaches, or
/// [`LOAD_TIMEOUT`] elapses.
async fn wait_settled<D: Document + ?Sized>(doc: &D, node: NodeKey, url: &str) -> bool {
    let deadline = Instant::now() + LOAD_TIMEOUT;
    loop {
        if !doc.is_attached(node) {
            return false;
        }
        if element_source(doc, node).is_some_and(|source| source.url == url) {
            return true;
        }
        if Instant::now() >= deadline {
            debug!("source of {node:?} never became {url}");
            return false;
        }
        sleep(SETTLE_POLL).await;
    }
}

/// Upgrades `node` until no candidate beats its current source and marks it
/// resolved. Returns the accepted measure of the final source.
pub async fn resolve_element<D: Document + ?Sized>(
    doc: &D,
    state: &EngineState,
    node: NodeKey,
) -> Option<Measure> {
    let page = doc.location();
    let mut tried: HashSet<String> = HashSet::new();
    let mut accepted: Option<Measure> = None;

    for _ in 0..MAX_UPGRADES {
        if !doc.is_attached(node) {
            break;
        }
        let Some(source) = element_source(doc, node) else {
            break;
        };
        tried.insert(source.url.clone());
        let current = match accepted {
            // The accepted source was just measured; reuse the kind.
            Some(previous) => measure_like(state, previous, &source.url, &page).await,
            None => baseline(doc, state, node, &source, &page).await,
        };
        if accepted.is_none_or(|previous| current >= previous) {
            accepted = Some(current);
        }

        let mut winner: Option<(Candidate, Measure)> = None;
        for candidate in candidates(doc, node, &source.url, &state.normalizer) {
            if state.is_bad(&candidate.url) || tried.contains(&candidate.url) {
                continue;
            }
            let measure = measure_like(state, current, &candidate.url, &page).await;
            trace!("candidate {} ({}) measures {measure:?} vs {current:?}", candidate.url, candidate.label);
            if is_better(state, &source.url, current, &candidate.url, measure) {
                winner = Some((candidate, measure));
                break;
            }
        }
        let Some((candidate, measure)) = winner else {
            break;
        };

        info!("upgrading {} -> {} ({})", source.url, candidate.url, candidate.label);
        if let Some(attr) = &candidate.attr {
            doc.remove_attribute(node, attr);
        }
        rewrite(doc, node, source.kind, &candidate.url);
        accepted = Some(measure);
        if !wait_settled(doc, node, &candidate.url).await {
            break;
        }
    }

    if doc.is_attached(node) {
        doc.set_attribute(node, RESOLVED_ATTR, RESOLVED_VALUE);
        state.bump_resolved();
    }
    accepted
}

/// One pass over every unresolved image-bearing element. Elements still
/// loading, or being resolved by another pass, are left for a later pass.
/// Returns whether any were left.
pub async fn resolve_batch<D: Document + ?Sized>(doc: &D, state: &EngineState) -> bool {
    let mut ready = Vec::new();
    let mut pending = 0_usize;
    for node in composed_elements(doc, doc.root()) {
        if is_resolved(doc, node) || element_source(doc, node).is_none() {
            continue;
        }
        if state.is_resolving(node) || !doc.is_complete(node) {
            pending += 1;
        } else {
            ready.push(node);
        }
    }
    ready.retain(|node| state.begin_resolving(*node));
    if !ready.is_empty() {
        debug!("resolving {} elements ({pending} pending)", ready.len());
    }
    join_all(ready.into_iter().map(|node| async move {
        let measure = resolve_element(doc, state, node).await;
        state.end_resolving(node);
        measure
    }))
    .await;
    pending > 0
}

/// Repeats [`resolve_batch`] until nothing is left, then raises the
/// first-unlazy signal. Stops early when the page navigates.
///
/// Passes do not take the scan lock, so a refresh may publish while one is
/// still probing; elements claimed here are skipped by the refresh.
pub async fn unlazy<D: Document + ?Sized>(doc: &D, state: &EngineState) {
    let generation = state.generation();
    for _ in 0..MAX_BATCH_PASSES {
        let pending = resolve_batch(doc, state).await;
        if state.generation() != generation {
            debug!("navigation during unlazy; abandoning");
            return;
        }
        if !pending {
            state.signal_first_unlazy();
            return;
        }
        sleep(BATCH_RETRY).await;
    }
    debug!("elements still loading after {MAX_BATCH_PASSES} passes");
    state.signal_first_unlazy();
}

/// Waits for the first full [`unlazy`] pass, at most
/// [`FIRST_UNLAZY_TIMEOUT`]. Returns whether the pass completed in time;
/// the pass itself keeps running either way.
pub async fn wait_first_unlazy(state: &EngineState) -> bool {
    let mut done = state.subscribe_first_unlazy();
    matches!(
        timeout(FIRST_UNLAZY_TIMEOUT, done.wait_for(|complete| *complete)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_rewrite_replaces_existing_url() {
        assert_eq!(
            rewrite_background_style("color: red; background-image: url('a.jpg')", "https://x/b.jpg"),
            "color: red; background-image: url(\"https://x/b.jpg\")"
        );
        assert_eq!(
            rewrite_background_style("background: #fff url(a.jpg) no-repeat;", "b.jpg"),
            "background: #fff url(\"b.jpg\") no-repeat"
        );
        assert_eq!(
            rewrite_background_style("", "b.jpg"),
            "background-image: url(\"b.jpg\")"
        );
    }

    #[test]
    fn measure_order_within_kind() {
        assert!(Measure::Bytes(10) < Measure::Bytes(11));
        assert_eq!(Measure::Pixels(300).value(), 300);
    }
}
