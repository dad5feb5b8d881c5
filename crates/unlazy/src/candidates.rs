//! Candidate generation for lazy placeholders.
//!
//! For one image-bearing element this enumerates, in priority order, every
//! URL that might be the real picture behind its current source. Nothing is
//! confirmed here; the resolver measures each candidate.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use page_dom::{Document, NodeKey};
use regex::Regex;
use url::Url;

use crate::url_norm::{Normalizer, has_image_extension, strip_query};

/// A still-unconfirmed alternative source for one element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub label: String,
    pub url: String,
    /// Attribute to remove once the candidate is accepted.
    pub attr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Cosmetic or structural attribute, never a candidate.
    Ignore,
    /// Single URL value.
    Url,
    /// `srcset`-style list; only the highest-priority entry is used.
    SourceSet,
}

/// One row of the attribute rule table.
#[derive(Debug)]
pub struct AttrRule {
    pub pattern: Regex,
    pub label: &'static str,
    pub kind: RuleKind,
    /// Whether accepting a candidate from this attribute removes it.
    pub consumable: bool,
}

impl AttrRule {
    #[allow(clippy::unwrap_used, reason = "rule patterns are compile-time constants")]
    fn new(pattern: &str, label: &'static str, kind: RuleKind, consumable: bool) -> Self {
        Self {
            pattern: Regex::new(pattern).unwrap(),
            label,
            kind,
            consumable,
        }
    }
}

/// Ordered attribute rules; the first rule whose pattern matches the
/// attribute name decides how it is treated.
pub static ATTR_RULES: Lazy<Vec<AttrRule>> = Lazy::new(|| {
    vec![
        AttrRule::new(
            r"(?i)^(?:class|id|style|alt|title|width|height|sizes|loading|decoding|role|aria-.*|tabindex|crossorigin|referrerpolicy|fetchpriority|draggable|lang|dir|name|type|rel|target|itemprop|itemtype|data-unlazy.*|data-testid|data-id)$",
            "cosmetic",
            RuleKind::Ignore,
            false,
        ),
        AttrRule::new(r"(?i)srcset$", "srcset", RuleKind::SourceSet, true),
        AttrRule::new(
            r"(?i)^data-(?:lazy-?)?(?:src|original|full|full-?src|large|large-?src|hi-?res|zoom|zoom-?src|orig|orig-file|big|image|img|url|bg|background)$",
            "lazy",
            RuleKind::Url,
            true,
        ),
        AttrRule::new(r"(?i)^(?:src|poster|href|xlink:href)$", "source", RuleKind::Url, false),
        AttrRule::new(r"(?i)^data-", "data", RuleKind::Url, true),
        AttrRule::new(r".*", "attr", RuleKind::Url, true),
    ]
});

#[allow(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
static THUMB_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)/(?:thumbs?|thumbnails?|small|resized?|preview|mini)/").unwrap()
});

#[allow(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
static CDN_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|[.-])(?:cdn\d*|img\d*|images?|static|media|pics?|photos?|assets|cloudfront|akamaihd|fastly|imgix|twimg|pinimg|wp)(?:[.-]|$)",
    )
    .unwrap()
});

/// Query keys that only select a rendition size.
const SIZE_QUERY_KEYS: &[&str] = &["w", "h", "width", "height", "maxwidth", "maxheight", "resize"];

fn rule_for(name: &str) -> Option<&'static AttrRule> {
    ATTR_RULES.iter().find(|rule| rule.pattern.is_match(name))
}

/// Whether an attribute value plausibly holds a single URL.
fn is_url_shaped(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return false;
    }
    let lower = value.to_ascii_lowercase();
    if lower.starts_with("javascript:") || lower.starts_with("data:") || lower.starts_with('#') {
        return false;
    }
    lower.starts_with("http://")
        || lower.starts_with("https://")
        || lower.starts_with("//")
        || lower.starts_with('/')
        || lower.starts_with("./")
        || lower.starts_with("../")
        || has_image_extension(value)
}

/// Parses a `srcset` value into `(url, descriptor)` pairs following the
/// HTML candidate-string rules: a URL is a run of non-whitespace, trailing
/// commas end it, and a descriptor runs to the next comma.
pub fn parse_srcset(value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = value;
    loop {
        rest = rest.trim_start_matches(|ch: char| ch.is_whitespace() || ch == ',');
        if rest.is_empty() {
            break;
        }
        let url_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (token, tail) = rest.split_at(url_end);
        rest = tail;
        let url = token.trim_end_matches(',');
        let mut descriptor = "";
        if url.len() == token.len() {
            let descriptor_end = rest.find(',').unwrap_or(rest.len());
            let (found, after) = rest.split_at(descriptor_end);
            descriptor = found.trim();
            rest = after;
        }
        if !url.is_empty() {
            out.push((url.to_owned(), descriptor.to_owned()));
        }
    }
    out
}

/// Priority of a `srcset` descriptor: width descriptors compare by width,
/// density descriptors by density, and a missing descriptor counts as `1x`.
fn descriptor_priority(descriptor: &str) -> f64 {
    let descriptor = descriptor.trim();
    if let Some(width) = descriptor.strip_suffix(['w', 'W']) {
        return width.trim().parse::<f64>().unwrap_or(0.0);
    }
    let density = descriptor
        .strip_suffix(['x', 'X'])
        .map_or(Some(1.0), |value| value.trim().parse::<f64>().ok())
        .unwrap_or(0.0);
    density * 10_000.0
}

/// The highest-priority URL of a `srcset` value; ties keep the first entry.
pub fn best_srcset_url(value: &str) -> Option<String> {
    let mut best: Option<(String, f64)> = None;
    for (url, descriptor) in parse_srcset(value) {
        let priority = descriptor_priority(&descriptor);
        if best.as_ref().is_none_or(|(_, current)| priority > *current) {
            best = Some((url, priority));
        }
    }
    best.map(|(url, _)| url)
}

/// `value` resolved against `base`, or parsed as absolute without one.
pub(crate) fn resolve(base: Option<&Url>, value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    base.map_or_else(|| Url::parse(value), |base| base.join(value))
        .ok()
        .map(|url| url.to_string())
}

fn drop_thumbnail_segment(src: &str) -> Option<String> {
    THUMB_SEGMENT
        .is_match(src)
        .then(|| THUMB_SEGMENT.replace(src, "/").into_owned())
}

fn drop_size_query(src: &str) -> Option<String> {
    let mut url = Url::parse(src).ok()?;
    url.query()?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !SIZE_QUERY_KEYS.contains(&key.to_ascii_lowercase().as_str()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.len() == url.query_pairs().count() {
        return None;
    }
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Some(url.to_string())
}

fn drop_query(src: &str) -> Option<String> {
    let stripped = strip_query(src);
    (stripped.len() != src.len()).then(|| stripped.to_owned())
}

fn is_cdn_host(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .is_some_and(|parsed| parsed.host_str().is_some_and(|host| CDN_HOST.is_match(host)))
}

/// Nearest enclosing `<a href>`, crossing shadow boundaries.
fn enclosing_link<D: Document + ?Sized>(doc: &D, node: NodeKey) -> Option<String> {
    let mut current = node;
    loop {
        let parent = doc.parent(current).or_else(|| doc.shadow_host(current))?;
        if doc.tag_name(parent).as_deref() == Some("a") {
            return doc.attribute(parent, "href");
        }
        current = parent;
    }
}

/// Link targets worth probing: image-like paths, paths shaped like the
/// current source, or anything served from a CDN-looking host.
fn link_is_promising(href: &str, current: &str) -> bool {
    let href_has_ext = has_image_extension(href);
    href_has_ext || href_has_ext == has_image_extension(current) || is_cdn_host(href)
}

/// Whether an attribute of `node` names a source the element does not show
/// yet: a consumable URL-shaped value or a `srcset`-style list.
pub fn has_lazy_source<D: Document + ?Sized>(doc: &D, node: NodeKey) -> bool {
    doc.attributes(node).iter().any(|(name, value)| {
        rule_for(name).is_some_and(|rule| match rule.kind {
            RuleKind::Ignore => false,
            RuleKind::SourceSet => best_srcset_url(value).is_some(),
            RuleKind::Url => rule.consumable && is_url_shaped(value),
        })
    })
}

struct CandidateList {
    current: String,
    seen: HashSet<String>,
    items: Vec<Candidate>,
}

impl CandidateList {
    fn new(current: &str) -> Self {
        Self {
            current: current.to_owned(),
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, label: &str, url: Option<String>, attr: Option<&str>) {
        let Some(url) = url else {
            return;
        };
        if url == self.current || !self.seen.insert(url.clone()) {
            return;
        }
        self.items.push(Candidate {
            label: label.to_owned(),
            url,
            attr: attr.map(str::to_owned),
        });
    }
}

/// Candidates for `node` whose resolved source is `current`, in the order
/// they should be tried. An empty result means there is nothing to try.
pub fn candidates<D: Document + ?Sized>(
    doc: &D,
    node: NodeKey,
    current: &str,
    normalizer: &Normalizer,
) -> Vec<Candidate> {
    let base = doc.base_url();
    let base = base.as_ref();
    let mut list = CandidateList::new(current);
    let mut source_sets = Vec::new();

    for (name, value) in doc.attributes(node) {
        let Some(rule) = rule_for(&name) else {
            continue;
        };
        match rule.kind {
            RuleKind::Ignore => {}
            RuleKind::SourceSet => source_sets.push((name, value)),
            RuleKind::Url => {
                let consumed = rule.consumable.then_some(name.as_str());
                if !is_url_shaped(&value) {
                    continue;
                }
                let Some(url) = resolve(base, &value) else {
                    continue;
                };
                let raw = normalizer.raw_url(&url);
                list.push(rule.label, Some(url.clone()), consumed);
                if raw != url {
                    list.push(&format!("{}-raw", rule.label), Some(raw), consumed);
                }
            }
        }
    }

    for (name, value) in &source_sets {
        let url = best_srcset_url(value).and_then(|best| resolve(base, &best));
        list.push("srcset", url, Some(name));
    }

    list.push("raw", Some(normalizer.raw_url(current)), None);
    list.push("drop-thumb", drop_thumbnail_segment(current), None);
    list.push("drop-size-query", drop_size_query(current), None);
    list.push("drop-query", drop_query(current), None);

    if let Some(href) = enclosing_link(doc, node).and_then(|href| resolve(base, &href))
        && link_is_promising(&href, current)
    {
        list.push("link", Some(href), None);
    }

    list.items
}
