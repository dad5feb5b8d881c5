//! URL canonicalization and fuzzy matching.
//!
//! The canonical ("raw") form of an image URL is the heuristic guess at its
//! original-resolution address. It is the identity key used for
//! de-duplication by the collector and the merge engine.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// Extensions treated as images by every heuristic in this crate.
pub const IMAGE_EXTENSIONS: &str = "jpe?g|jfif|png|apng|gif|webp|avif|bmp|svg|tiff?|heic|ico";

/// Upper bound on heuristic rounds; each round strictly shortens the URL.
const MAX_ROUNDS: usize = 8;

#[allow(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
static THUMB_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^(.+?)[-_]\d{{2,5}}x\d{{2,5}}(\.(?:{IMAGE_EXTENSIONS})(?:[?#].*)?)$"
    ))
    .unwrap()
});

#[allow(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
static IMAGE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^(?:(?:https?:)?//[^\s/]+)?/[^\s?#]*\.(?:{IMAGE_EXTENSIONS})(?:[?#]\S*)?$"
    ))
    .unwrap()
});

#[allow(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
static DECORATED_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^((?:[a-z][a-z0-9+.-]*:)?//[^/?#]+/[^?#]*\.(?:{IMAGE_EXTENSIONS})|[^:?#]*\.(?:{IMAGE_EXTENSIONS}))[?#!:@~_/].*$"
    ))
    .unwrap()
});

#[allow(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
static HAS_IMAGE_EXTENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\.(?:{IMAGE_EXTENSIONS})$")).unwrap()
});

/// Whether the path of `src` (query and fragment ignored) ends in an image
/// extension.
pub fn has_image_extension(src: &str) -> bool {
    HAS_IMAGE_EXTENSION.is_match(strip_query(src))
}

/// `src` without its query string and fragment.
pub fn strip_query(src: &str) -> &str {
    src.split(['?', '#']).next().unwrap_or(src)
}

/// Whether `src` must never be rewritten (inline payloads and object URLs).
fn is_opaque(src: &str) -> bool {
    let lower = src.get(..5).map(str::to_ascii_lowercase);
    matches!(lower.as_deref(), Some("data:" | "blob:"))
}

/// (a) `photo-300x200.jpg` → `photo.jpg`.
fn strip_thumbnail_suffix(src: &str) -> Option<String> {
    let captures = THUMB_SUFFIX.captures(src)?;
    Some(format!("{}{}", &captures[1], &captures[2]))
}

/// (b) `resize.php?src=/img/photo.jpg` → `https://host/img/photo.jpg`.
fn extract_query_image(src: &str) -> Option<String> {
    let url = Url::parse(src).ok()?;
    url.query()?;
    url.query_pairs().find_map(|(_, value)| {
        if !IMAGE_PATH.is_match(&value) {
            return None;
        }
        if value.starts_with("//") {
            return Some(format!("{}:{value}", url.scheme()));
        }
        url.join(&value).ok().map(|joined| joined.to_string())
    })
}

/// (c) `photo.jpg:large`, `photo.jpg?w=300`, `photo.jpg_220x220.jpg` → `photo.jpg`.
fn strip_decoration(src: &str) -> Option<String> {
    let captures = DECORATED_IMAGE.captures(src)?;
    Some(captures[1].to_owned())
}

fn raw_step(src: &str) -> Option<String> {
    strip_thumbnail_suffix(src)
        .or_else(|| extract_query_image(src))
        .or_else(|| strip_decoration(src))
        .filter(|next| next != src && !next.is_empty())
}

/// Memoizing URL normalizer. One instance lives per page lifetime and is
/// cleared on navigation.
#[derive(Debug, Default)]
pub struct Normalizer {
    raw_cache: DashMap<String, String>,
    filename_cache: DashMap<String, String>,
}

impl Normalizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical full-resolution form of `src`; unmatched input is returned
    /// unchanged. Idempotent, `raw_url(raw_url(x)) == raw_url(x)`, whenever
    /// the heuristics settle within eight rounds.
    pub fn raw_url(&self, src: &str) -> String {
        if let Some(cached) = self.raw_cache.get(src) {
            return cached.clone();
        }
        let mut current = src.to_owned();
        if !is_opaque(src) {
            for _ in 0..MAX_ROUNDS {
                match raw_step(&current) {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }
        self.raw_cache.insert(src.to_owned(), current.clone());
        // A form that still steps is not a fixed point.
        if is_opaque(&current) || raw_step(&current).is_none() {
            self.raw_cache.insert(current.clone(), current.clone());
        }
        current
    }

    /// Last path segment of `src` with extension, query and fragment removed.
    pub fn filename(&self, src: &str) -> String {
        if let Some(cached) = self.filename_cache.get(src) {
            return cached.clone();
        }
        let name = if is_opaque(src) {
            String::new()
        } else {
            let path = strip_query(src).trim_end_matches('/');
            let segment = path.rsplit('/').next().unwrap_or(path);
            match segment.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem.to_owned(),
                _ => segment.to_owned(),
            }
        };
        self.filename_cache.insert(src.to_owned(), name.clone());
        name
    }

    /// Whether `left` and `right` share the canonical form.
    pub fn same_canonical(&self, left: &str, right: &str) -> bool {
        left == right || self.raw_url(left) == self.raw_url(right)
    }

    /// Drops all memoized results.
    pub fn reset(&self) {
        self.raw_cache.clear();
        self.filename_cache.clear();
    }

    /// Number of memoized canonical forms.
    pub fn cached_len(&self) -> usize {
        self.raw_cache.len()
    }
}

/// Lookup table implementing the shared matching key priority:
/// exact string, then canonical form, then a filename that is unique in the
/// scope. Ambiguous filenames never match.
#[derive(Debug, Default)]
pub struct MatchIndex {
    exact: HashMap<String, usize>,
    canonical: HashMap<String, usize>,
    filenames: HashMap<String, usize>,
    ambiguous: HashSet<String>,
}

impl MatchIndex {
    /// Indexes `urls` by position; the first occurrence of a key wins.
    pub fn new<'url, I>(normalizer: &Normalizer, urls: I) -> Self
    where
        I: IntoIterator<Item = &'url str>,
    {
        let mut index = Self::default();
        let mut filename_owner: HashMap<String, String> = HashMap::new();
        for (position, url) in urls.into_iter().enumerate() {
            index.exact.entry(url.to_owned()).or_insert(position);
            let raw = normalizer.raw_url(url);
            index.canonical.entry(raw.clone()).or_insert(position);
            let name = normalizer.filename(url);
            if name.is_empty() {
                continue;
            }
            match filename_owner.get(&name) {
                Some(owner) if *owner != raw => {
                    index.ambiguous.insert(name.clone());
                }
                Some(_) => {}
                None => {
                    filename_owner.insert(name.clone(), raw);
                    index.filenames.insert(name, position);
                }
            }
        }
        index
    }

    /// Position of the entry matching `url`, if any.
    pub fn find(&self, normalizer: &Normalizer, url: &str) -> Option<usize> {
        if let Some(position) = self.exact.get(url) {
            return Some(*position);
        }
        if let Some(position) = self.canonical.get(&normalizer.raw_url(url)) {
            return Some(*position);
        }
        let name = normalizer.filename(url);
        if name.is_empty() || self.ambiguous.contains(&name) {
            return None;
        }
        self.filenames.get(&name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_thumbnail_dimensions() {
        let norm = Normalizer::new();
        assert_eq!(
            norm.raw_url("https://example.com/wp/photo-300x200.jpg"),
            "https://example.com/wp/photo.jpg"
        );
        assert_eq!(
            norm.raw_url("https://example.com/img_200x200.png"),
            "https://example.com/img.png"
        );
    }

    #[test]
    fn extracts_image_from_query_parameter() {
        let norm = Normalizer::new();
        assert_eq!(
            norm.raw_url("https://example.com/resize.php?w=100&src=%2Fmedia%2Fa.png"),
            "https://example.com/media/a.png"
        );
        assert_eq!(
            norm.raw_url("https://proxy.example/?url=https%3A%2F%2Fcdn.example%2Fb.jpg"),
            "https://cdn.example/b.jpg"
        );
    }

    #[test]
    fn strips_trailing_decoration() {
        let norm = Normalizer::new();
        assert_eq!(
            norm.raw_url("https://pbs.example.com/media/abc.jpg:large"),
            "https://pbs.example.com/media/abc.jpg"
        );
        assert_eq!(
            norm.raw_url("https://ae.example.com/kf/x.jpg_220x220q90.jpg"),
            "https://ae.example.com/kf/x.jpg"
        );
        assert_eq!(
            norm.raw_url("https://example.com/a.png?v=3"),
            "https://example.com/a.png"
        );
    }

    #[test]
    fn leaves_unmatched_and_opaque_input_alone() {
        let norm = Normalizer::new();
        for src in [
            "https://example.com/image.php?id=5",
            "https://cdn.gif.example/path",
            "data:image/png;base64,AAAA",
            "",
        ] {
            assert_eq!(norm.raw_url(src), src);
        }
    }

    #[test]
    fn truncated_canonicalization_does_not_depend_on_the_memo() {
        let src = format!("https://example.com/deep{}.jpg", "-10x10".repeat(10));
        let norm = Normalizer::new();
        let truncated = norm.raw_url(&src);
        assert_eq!(
            truncated,
            format!("https://example.com/deep{}.jpg", "-10x10".repeat(2))
        );
        assert_eq!(norm.raw_url(&truncated), Normalizer::new().raw_url(&truncated));
        assert_eq!(norm.raw_url(&truncated), "https://example.com/deep.jpg");
        norm.reset();
        assert_eq!(norm.raw_url(&truncated), "https://example.com/deep.jpg");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let norm = Normalizer::new();
        for src in [
            "https://example.com/wp/photo-300x200.jpg?resize=300,200",
            "https://example.com/r?src=/a/b-10x10.png",
            "https://example.com/a.jpg/revision/latest?cb=1",
            "relative/pic_640x480.webp#frag",
            "https://example.com/plain",
        ] {
            let once = norm.raw_url(src);
            assert_eq!(norm.raw_url(&once), once, "not idempotent for {src}");
        }
    }

    #[test]
    fn filename_drops_extension_and_query() {
        let norm = Normalizer::new();
        assert_eq!(norm.filename("https://example.com/a/img_200x200.png?x=1"), "img_200x200");
        assert_eq!(norm.filename("https://example.com/a/noext"), "noext");
        assert_eq!(norm.filename("data:image/png;base64,AA"), "");
    }

    #[test]
    fn match_index_rejects_ambiguous_filenames() {
        let norm = Normalizer::new();
        let scope = [
            "https://a.example/x/photo.jpg",
            "https://b.example/y/photo.jpg",
            "https://c.example/z/unique.jpg",
        ];
        let index = MatchIndex::new(&norm, scope);
        assert_eq!(index.find(&norm, "https://b.example/y/photo.jpg"), Some(1));
        assert_eq!(index.find(&norm, "https://mirror.example/photo.jpg"), None);
        assert_eq!(index.find(&norm, "https://mirror.example/unique.png"), Some(2));
        assert_eq!(index.find(&norm, "https://a.example/x/photo-50x50.jpg"), Some(0));
    }

    #[test]
    fn extension_helpers() {
        assert!(has_image_extension("https://example.com/a.JPG?x=1"));
        assert!(!has_image_extension("https://example.com/a.html"));
        assert_eq!(strip_query("a.jpg?x#y"), "a.jpg");
    }
}
