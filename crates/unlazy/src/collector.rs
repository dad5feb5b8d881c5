//! Image-bearing element discovery.
//!
//! Walks the composed tree (shadow roots before light children, matching
//! [`page_dom::compare_position`]) and turns every image-bearing element into
//! an [`ImageRecord`]. Iframe contents come from the [`Messenger`] and are
//! attached to the iframe element.
//!
//! [`Messenger`]: crate::messenger::Messenger

use std::collections::{HashMap, HashSet};

use log::{debug, trace};
use once_cell::sync::Lazy;
use page_dom::{Document, NodeKey};
use regex::Regex;

use crate::ImageRecord;
use crate::candidates;
use crate::messenger::FrameRequest;
use crate::state::EngineState;
use crate::url_norm::strip_query;

/// Cached rendered box, `"{width}x{height}"`.
pub const BOX_ATTR: &str = "data-unlazy-box";

/// Present when the element was found to have no usable background.
pub const NO_BACKGROUND_ATTR: &str = "data-unlazy-nobg";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Every image-bearing element regardless of rendered size.
    Unfiltered,
    /// Only elements whose rendered box meets the configured minimum.
    Filtered,
}

/// Where an element's image comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Image,
    Poster,
    SvgImage,
    Background,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementSource {
    pub kind: SourceKind,
    pub url: String,
}

#[allow(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#).unwrap()
});

/// First `url(...)` argument of a CSS value.
pub fn css_url(value: &str) -> Option<String> {
    let captures = CSS_URL.captures(value)?;
    let url = captures
        .get(1)
        .or_else(|| captures.get(2))
        .or_else(|| captures.get(3))?
        .as_str()
        .trim();
    (!url.is_empty()).then(|| url.to_owned())
}

fn resolve<D: Document + ?Sized>(doc: &D, value: &str) -> Option<String> {
    candidates::resolve(doc.base_url().as_ref(), value)
}

/// The image currently shown by `node`, if it bears one.
///
/// An `<img>` with no source but a lazy attribute bears an empty URL; the
/// resolver fills it in and scans skip it until then.
///
/// Elements without an image-bearing tag are checked for a computed
/// background, and a miss is cached on the element as
/// [`NO_BACKGROUND_ATTR`].
pub fn element_source<D: Document + ?Sized>(doc: &D, node: NodeKey) -> Option<ElementSource> {
    let tag = doc.tag_name(node)?;
    let (kind, url) = match tag.as_str() {
        "img" => {
            let url = doc
                .current_src(node)
                .or_else(|| doc.attribute(node, "src").and_then(|src| resolve(doc, &src)));
            match url {
                Some(url) => (SourceKind::Image, Some(url)),
                // A placeholder without any source still bears the lazy one.
                None if candidates::has_lazy_source(doc, node) => {
                    (SourceKind::Image, Some(String::new()))
                }
                None => return None,
            }
        }
        "video" => (
            SourceKind::Poster,
            doc.attribute(node, "poster")
                .and_then(|poster| resolve(doc, &poster)),
        ),
        "image" => (
            SourceKind::SvgImage,
            doc.attribute(node, "href")
                .or_else(|| doc.attribute(node, "xlink:href"))
                .and_then(|href| resolve(doc, &href)),
        ),
        "iframe" | "script" | "style" | "source" | "picture" => return None,
        _ => {
            if doc.attribute(node, NO_BACKGROUND_ATTR).is_some() {
                return None;
            }
            let url = doc
                .background_image(node)
                .as_deref()
                .and_then(css_url)
                .and_then(|url| resolve(doc, &url));
            if url.is_none() {
                doc.set_attribute(node, NO_BACKGROUND_ATTR, "1");
            }
            (SourceKind::Background, url)
        }
    };
    url.map(|url| ElementSource { kind, url })
}

/// Rendered box of `node`, from the [`BOX_ATTR`] cache when present.
/// Empty boxes are never cached since they usually belong to images that
/// have not loaded yet.
pub fn element_box<D: Document + ?Sized>(doc: &D, node: NodeKey) -> (f64, f64) {
    if let Some(cached) = doc.attribute(node, BOX_ATTR)
        && let Some((width, height)) = cached.split_once('x')
        && let (Ok(width), Ok(height)) = (width.parse::<f64>(), height.parse::<f64>())
    {
        return (width, height);
    }
    let rect = doc.bounding_box(node);
    if rect.width > 0.0 && rect.height > 0.0 {
        doc.set_attribute(node, BOX_ATTR, &format!("{}x{}", rect.width, rect.height));
    }
    (rect.width, rect.height)
}

/// Drops the cached box and background results of `node`. Driven by changes
/// to the node's own inline `style`.
pub fn invalidate_style<D: Document + ?Sized>(doc: &D, node: NodeKey) {
    if doc.attribute(node, BOX_ATTR).is_some() {
        doc.remove_attribute(node, BOX_ATTR);
    }
    if doc.attribute(node, NO_BACKGROUND_ATTR).is_some() {
        doc.remove_attribute(node, NO_BACKGROUND_ATTR);
    }
}

/// Elements under `root` (inclusive) in composed tree order.
pub fn composed_elements<D: Document + ?Sized>(doc: &D, root: NodeKey) -> Vec<NodeKey> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if doc.tag_name(node).is_some() {
            out.push(node);
        }
        let mut next = doc.children(node);
        if let Some(shadow) = doc.shadow_root(node) {
            next.insert(0, shadow);
        }
        stack.extend(next.into_iter().rev());
    }
    out
}

/// Image-bearing elements under `root` (inclusive) in composed tree order.
pub fn image_elements<D: Document + ?Sized>(doc: &D, root: NodeKey) -> Vec<NodeKey> {
    composed_elements(doc, root)
        .into_iter()
        .filter(|node| element_source(doc, *node).is_some())
        .collect()
}

fn is_svg(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("data:image/svg") || strip_query(&lower).ends_with(".svg")
}

enum Slot {
    Image(ImageRecord),
    Frame(NodeKey),
}

/// Collects the ordered, de-duplicated image list of the page.
pub async fn collect<D: Document + ?Sized>(
    doc: &D,
    state: &EngineState,
    mode: ScanMode,
) -> Vec<ImageRecord> {
    let options = &state.options;
    let mut slots = Vec::new();
    let mut frames = Vec::new();

    for node in composed_elements(doc, doc.root()) {
        if doc.tag_name(node).as_deref() == Some("iframe") {
            if let Some(url) = doc.attribute(node, "src").and_then(|src| resolve(doc, &src)) {
                frames.push(FrameRequest { frame: node, url });
                slots.push(Slot::Frame(node));
            }
            continue;
        }
        let Some(source) = element_source(doc, node).filter(|source| !source.url.is_empty()) else {
            continue;
        };
        if mode == ScanMode::Filtered {
            let (width, height) = element_box(doc, node);
            if width < options.min_width || height < options.min_height {
                trace!("skipping {} ({width}x{height})", source.url);
                continue;
            }
        }
        slots.push(Slot::Image(ImageRecord::new(source.url, Some(node))));
    }

    let mut frame_urls: HashMap<NodeKey, Vec<String>> = HashMap::new();
    if !frames.is_empty() {
        debug!("requesting images of {} frames", frames.len());
        for found in state.messenger.frame_images(frames).await {
            frame_urls.insert(found.frame, found.urls);
        }
    }

    let records = slots.into_iter().flat_map(|slot| match slot {
        Slot::Image(record) => vec![record],
        Slot::Frame(frame) => frame_urls
            .remove(&frame)
            .unwrap_or_default()
            .into_iter()
            .map(|url| ImageRecord::new(url, Some(frame)))
            .collect(),
    });

    dedupe(state, records)
}

/// Drops excluded and bad URLs and collapses records naming the same image
/// into the first one, which takes the canonical form when any member
/// already carries it.
///
/// Records match by canonical form, or by filename when exactly two
/// canonical forms in the scan share it. A filename shared more widely is
/// ambiguous and never matches.
fn dedupe<I>(state: &EngineState, records: I) -> Vec<ImageRecord>
where
    I: IntoIterator<Item = ImageRecord>,
{
    let normalizer = &state.normalizer;
    let records: Vec<(ImageRecord, String, String)> = records
        .into_iter()
        .filter(|record| {
            let excluded = state.options.exclude_svg && is_svg(&record.src);
            !(record.src.is_empty() || excluded || state.is_bad(&record.src))
        })
        .map(|record| {
            let raw = normalizer.raw_url(&record.src);
            let name = normalizer.filename(&record.src);
            (record, raw, name)
        })
        .collect();
    let mut owners: HashMap<&str, HashSet<&str>> = HashMap::new();
    for (_, raw, name) in &records {
        if !name.is_empty() {
            owners.entry(name.as_str()).or_default().insert(raw.as_str());
        }
    }
    let paired: HashSet<&str> = owners
        .into_iter()
        .filter(|(_, raws)| raws.len() == 2)
        .map(|(name, _)| name)
        .collect();

    let mut out: Vec<ImageRecord> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut by_filename: HashMap<String, usize> = HashMap::new();
    for (record, raw, name) in &records {
        if let Some(position) = positions.get(raw) {
            if record.src == *raw
                && let Some(existing) = out.get_mut(*position)
            {
                existing.src.clone_from(raw);
            }
            continue;
        }
        if let Some(position) = by_filename.get(name).filter(|_| paired.contains(name.as_str())) {
            trace!("{} joins record {position} by filename", record.src);
            positions.insert(raw.clone(), *position);
            continue;
        }
        positions.insert(raw.clone(), out.len());
        if !name.is_empty() {
            by_filename.entry(name.clone()).or_insert(out.len());
        }
        out.push(record.clone());
    }
    out
}
