//! Size oracle: byte size and pixel size of candidate URLs.
//!
//! Two independent proxies answer "which URL is the better image": the
//! payload length reported by a header-only probe, and the smaller natural
//! dimension of the loaded image. Both are memoized per URL for the page
//! lifetime and collapse every failure to 0.

use core::time::Duration;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use futures::FutureExt as _;
use futures::future::{BoxFuture, Either, select};
use log::{debug, trace};
use tokio::time::timeout;
use url::Url;

use crate::fetch::{Fetcher, HeadInfo};
use crate::messenger::Messenger;
use crate::sync::{PROBE_SLOTS, Permit, ProbeSemaphore};
use crate::url_norm::has_image_extension;

/// Bound on a header-only probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on an off-document image load.
pub const LOAD_TIMEOUT: Duration = Duration::from_secs(10);

fn is_data_url(url: &str) -> bool {
    url.get(..5)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
}

/// Whether a probe response describes an image payload.
fn is_image_response(head: &HeadInfo, url: &str) -> bool {
    match head.content_type.as_deref() {
        Some(kind) if kind.starts_with("image/") => true,
        Some(kind) if kind.starts_with("application/octet-stream") => has_image_extension(url),
        _ => false,
    }
}

/// Resolves to the first non-zero answer of `left` and `right`, or 0 when
/// both answer 0. A losing probe is not cancelled: it runs to its own
/// timeout in the background and keeps `permit` until then.
async fn first_meaningful(left: BoxFuture<'static, u64>, right: BoxFuture<'static, u64>, permit: Permit) -> u64 {
    let (size, pending) = match select(left, right).await {
        Either::Left(first) | Either::Right(first) => first,
    };
    if size > 0 {
        tokio::spawn(async move {
            let late = pending.await;
            trace!("ignoring late probe answer {late}");
            drop(permit);
        });
        return size;
    }
    let size = pending.await;
    drop(permit);
    size
}

/// Header-only probe of `url`. Hosts that refuse it are added to `blocked`.
fn direct_probe(
    fetcher: Arc<dyn Fetcher>,
    blocked: Arc<DashSet<String>>,
    url: String,
    host: String,
) -> BoxFuture<'static, u64> {
    async move {
        match timeout(PROBE_TIMEOUT, fetcher.head(&url)).await {
            Ok(Ok(head)) if head.is_blocked() => {
                debug!("host {host} blocks probes (status {})", head.status);
                blocked.insert(host);
                0
            }
            Ok(Ok(head)) if head.is_success() && is_image_response(&head, &url) => {
                head.content_length.unwrap_or(0)
            }
            Ok(Ok(_)) => 0,
            Ok(Err(err)) => {
                debug!("probe of {url} failed: {err}");
                blocked.insert(host);
                0
            }
            Err(_) => {
                debug!("probe of {url} timed out");
                0
            }
        }
    }
    .boxed()
}

/// Probe relayed through the messenger, bounded like a direct one.
fn relay_probe(messenger: Arc<dyn Messenger>, url: String) -> BoxFuture<'static, u64> {
    async move {
        match timeout(PROBE_TIMEOUT, messenger.probe_size(&url)).await {
            Ok(size) => size.unwrap_or(0),
            Err(_) => {
                debug!("relayed probe of {url} timed out");
                0
            }
        }
    }
    .boxed()
}

pub struct SizeOracle {
    fetcher: Arc<dyn Fetcher>,
    messenger: Arc<dyn Messenger>,
    semaphore: ProbeSemaphore,
    byte_sizes: DashMap<String, u64>,
    pixel_sizes: DashMap<String, u32>,
    blocked_hosts: Arc<DashSet<String>>,
}

impl core::fmt::Debug for SizeOracle {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        formatter
            .debug_struct("SizeOracle")
            .field("byte_sizes", &self.byte_sizes.len())
            .field("pixel_sizes", &self.pixel_sizes.len())
            .field("blocked_hosts", &self.blocked_hosts.len())
            .finish_non_exhaustive()
    }
}

impl SizeOracle {
    pub fn new(fetcher: Arc<dyn Fetcher>, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            fetcher,
            messenger,
            semaphore: ProbeSemaphore::new(PROBE_SLOTS),
            byte_sizes: DashMap::new(),
            pixel_sizes: DashMap::new(),
            blocked_hosts: Arc::new(DashSet::new()),
        }
    }

    /// Reported payload length of `url`, or 0 when it is not an image, the
    /// probe failed, or its host blocks probes. `page` is the location of the
    /// current document; cross-origin URLs race the direct probe against
    /// the messenger.
    pub async fn byte_size(&self, url: &str, page: &str) -> u64 {
        if is_data_url(url) {
            return 0;
        }
        if let Some(size) = self.byte_sizes.get(url) {
            return *size;
        }
        let size = self.probe_bytes(url, page).await;
        self.byte_sizes.insert(url.to_owned(), size);
        size
    }

    async fn probe_bytes(&self, url: &str, page: &str) -> u64 {
        let Ok(parsed) = Url::parse(url) else {
            return 0;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return 0;
        }
        let host = parsed.host_str().unwrap_or_default().to_owned();
        let cross_origin = Url::parse(page)
            .ok()
            .is_none_or(|document| document.origin() != parsed.origin());
        let blocked = self.blocked_hosts.contains(&host);
        if blocked && !cross_origin {
            trace!("skipping probe of blocked host {host}");
            return 0;
        }

        let mut permit = self.semaphore.acquire().await;
        if blocked {
            trace!("host {host} is blocked; relaying probe of {url}");
            let size = relay_probe(Arc::clone(&self.messenger), url.to_owned()).await;
            permit.release();
            return size;
        }
        let direct = direct_probe(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.blocked_hosts),
            url.to_owned(),
            host,
        );
        if cross_origin {
            let relay = relay_probe(Arc::clone(&self.messenger), url.to_owned());
            first_meaningful(direct, relay, permit).await
        } else {
            let size = direct.await;
            permit.release();
            size
        }
    }

    /// Smaller natural dimension of the image at `url`, or 0 on failure or
    /// after [`LOAD_TIMEOUT`]. Every load occupies a probe slot.
    pub async fn pixel_size(&self, url: &str) -> u32 {
        if let Some(size) = self.pixel_sizes.get(url) {
            return *size;
        }
        let size = self.load_pixels(url).await;
        self.pixel_sizes.insert(url.to_owned(), size);
        size
    }

    async fn load_pixels(&self, url: &str) -> u32 {
        let is_file = url
            .get(..5)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("file:"));
        if is_file && !self.messenger.is_image(url).await {
            return 0;
        }
        let mut permit = self.semaphore.acquire().await;
        let size = match timeout(LOAD_TIMEOUT, self.fetcher.dimensions(url)).await {
            Ok(Ok((width, height))) => width.min(height),
            Ok(Err(err)) => {
                debug!("load of {url} failed: {err}");
                0
            }
            Err(_) => {
                debug!("load of {url} timed out");
                0
            }
        };
        permit.release();
        size
    }

    /// Seeds the pixel cache from dimensions the page already knows.
    pub fn record_pixel_size(&self, url: &str, width: u32, height: u32) {
        self.pixel_sizes
            .entry(url.to_owned())
            .or_insert(width.min(height));
    }

    pub fn known_byte_size(&self, url: &str) -> Option<u64> {
        self.byte_sizes.get(url).map(|size| *size)
    }

    pub fn is_host_blocked(&self, host: &str) -> bool {
        self.blocked_hosts.contains(host)
    }

    /// Drops every memoized size and blocked host.
    pub fn reset(&self) {
        self.byte_sizes.clear();
        self.pixel_sizes.clear();
        self.blocked_hosts.clear();
    }
}
