//! Mutation- and scroll-driven refresh scheduling.
//!
//! [`observe`] turns the page's [`DomChange`] stream into paced refreshes;
//! [`sweep`] and [`auto_scroll`] scroll the page so its own lazy-loading
//! logic runs.

use core::time::Duration;

use log::{debug, trace};
use page_dom::{Document, DomChange};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::{sleep, timeout};

use crate::collector::{image_elements, invalidate_style};
use crate::engine::Engine;
use crate::state::{EngineState, Generation};

/// Growth of the refresh delay while the viewer stays open (×1.2).
const BACKOFF_GROWTH: (u32, u32) = (6, 5);

/// Ceiling of the refresh delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Viewport steps of one sweep.
pub const SWEEP_STEPS: usize = 4;

/// Consecutive auto-scroll steps without resolver progress before halting.
pub const AUTO_SCROLL_STALLS: usize = 5;

/// Attributes whose change can alter an element's image.
const SOURCE_ATTRIBUTES: &[&str] = &["src", "srcset", "poster", "style", "href", "xlink:href"];

/// Whether `change` can add or alter an image.
pub fn qualifies(change: &DomChange) -> bool {
    match change {
        DomChange::ChildInserted { .. } => true,
        DomChange::AttributeChanged { name, .. } => {
            SOURCE_ATTRIBUTES.contains(&name.as_str())
                || (name.starts_with("data-") && !name.starts_with("data-unlazy"))
        }
        DomChange::NodeRemoved { .. } | DomChange::Scrolled { .. } => false,
    }
}

/// Applies the side effects of one change and reports whether it qualifies.
fn note<D: Document + ?Sized>(doc: &D, change: &DomChange) -> bool {
    if let DomChange::AttributeChanged { node, name } = change
        && name == "style"
    {
        invalidate_style(doc, *node);
    }
    qualifies(change)
}

/// Consumes everything already queued on `changes`.
fn drain<D: Document + ?Sized>(doc: &D, changes: &mut Receiver<DomChange>) -> usize {
    let mut drained = 0;
    loop {
        match changes.try_recv() {
            Ok(change) => {
                note(doc, &change);
                drained += 1;
            }
            Err(TryRecvError::Lagged(skipped)) => drained += skipped as usize,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return drained,
        }
    }
}

/// Refresh delay: starts at the debounce period, grows ×1.2 per refresh
/// while the viewer is open and resets once it closes.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
        }
    }

    /// Delay before the next refresh.
    pub fn next_delay(&mut self, viewer_open: bool) -> Duration {
        if !viewer_open {
            self.current = self.initial;
            return self.initial;
        }
        let delay = self.current;
        self.current = (self.current * BACKOFF_GROWTH.0 / BACKOFF_GROWTH.1).min(MAX_BACKOFF);
        delay
    }
}

/// Runs one refresh per burst of qualifying changes until the page
/// navigates away from `generation` or the change stream closes.
///
/// Changes that arrive during the backoff delay join the burst. Changes made
/// during the refresh itself (mostly the resolver's own rewrites) are
/// discarded by re-subscribing.
pub async fn observe<D: Document + ?Sized>(engine: &Engine<D>, generation: Generation) {
    let doc = engine.document();
    let state = engine.state();
    let mut changes = doc.subscribe();
    let mut backoff = Backoff::new(state.options.debounce());

    while state.generation() == generation {
        match changes.recv().await {
            Ok(change) => {
                if !note(doc, &change) {
                    continue;
                }
                trace!("qualifying change {change:?}");
            }
            Err(RecvError::Lagged(skipped)) => debug!("change stream lagged by {skipped}"),
            Err(RecvError::Closed) => return,
        }
        sleep(backoff.next_delay(state.viewer_open())).await;
        let collapsed = drain(doc, &mut changes);
        if state.generation() != generation {
            return;
        }
        debug!("refreshing after change burst ({collapsed} more)");
        engine.refresh().await;
        changes = changes.resubscribe();
    }
}

/// Scrolls forward up to [`SWEEP_STEPS`] viewports, pausing `pause` after
/// each, then restores the original offset. Returns whether image-bearing
/// nodes were inserted meanwhile.
pub async fn sweep<D: Document + ?Sized>(doc: &D, pause: Duration) -> bool {
    let origin = doc.scroll_y();
    let step = doc.viewport_height();
    let mut changes = doc.subscribe();

    for index in 1..=SWEEP_STEPS {
        doc.scroll_to(step.mul_add(index as f64, origin));
        sleep(pause).await;
        if doc.scroll_y() + step >= doc.scroll_height() {
            break;
        }
    }
    doc.scroll_to(origin);

    let mut appeared = false;
    loop {
        match changes.try_recv() {
            Ok(DomChange::ChildInserted { node, .. }) => {
                if doc.is_attached(node) && !image_elements(doc, node).is_empty() {
                    appeared = true;
                }
            }
            Ok(_) => {}
            Err(TryRecvError::Lagged(_)) => appeared = true,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    debug!("sweep done, new images: {appeared}");
    appeared
}

/// Scrolls one viewport at a time while the viewer is open, pacing each step
/// on resolver progress. Halts after [`AUTO_SCROLL_STALLS`] steps without
/// progress, when the viewer closes or at the bottom of the page. Returns
/// the number of steps taken.
pub async fn auto_scroll<D: Document + ?Sized>(doc: &D, state: &EngineState, period: Duration) -> usize {
    let mut resolved = state.subscribe_resolved();
    let mut stalls = 0;
    let mut steps = 0;

    while stalls < AUTO_SCROLL_STALLS {
        if !state.viewer_open() {
            debug!("viewer closed; auto-scroll stops");
            break;
        }
        state.scan.wait_idle().await;
        let position = doc.scroll_y();
        let viewport = doc.viewport_height();
        if position + viewport >= doc.scroll_height() {
            debug!("auto-scroll reached the bottom");
            break;
        }
        let before = state.resolved_count();
        doc.scroll_to(position + viewport);
        steps += 1;
        let progressed = matches!(
            timeout(period, resolved.wait_for(|count| *count > before)).await,
            Ok(Ok(_))
        );
        if progressed {
            stalls = 0;
        } else {
            stalls += 1;
            trace!("auto-scroll stall {stalls}");
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use page_dom::NodeKey;

    use super::*;

    #[test]
    fn engine_markers_do_not_qualify() {
        let node = NodeKey(3);
        let attr = |name: &str| DomChange::AttributeChanged {
            node,
            name: name.to_owned(),
        };
        assert!(qualifies(&attr("src")));
        assert!(qualifies(&attr("data-src")));
        assert!(qualifies(&attr("style")));
        assert!(!qualifies(&attr("data-unlazy")));
        assert!(!qualifies(&attr("data-unlazy-box")));
        assert!(!qualifies(&attr("class")));
        assert!(!qualifies(&DomChange::Scrolled { y: 10.0 }));
        assert!(qualifies(&DomChange::ChildInserted {
            parent: NodeKey::ROOT,
            node
        }));
    }

    #[test]
    fn backoff_grows_only_while_viewing() {
        let mut backoff = Backoff::new(Duration::from_millis(200));
        assert_eq!(backoff.next_delay(false), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(false), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(true), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(true), Duration::from_millis(240));
        assert_eq!(backoff.next_delay(true), Duration::from_millis(288));
        assert_eq!(backoff.next_delay(false), Duration::from_millis(200));
        for _ in 0..64 {
            backoff.next_delay(true);
        }
        assert_eq!(backoff.next_delay(true), MAX_BACKOFF);
    }
}
