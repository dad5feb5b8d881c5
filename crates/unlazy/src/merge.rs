//! Order-preserving merge of two image lists.
//!
//! `new` (fresh from the collector) decides which images exist and where
//! they belong; `old` (what the viewer shows) decides the order of anything
//! the new list does not contradict. The result contains every image once,
//! keeps unmoved old entries where they were and puts inserted or reordered
//! entries at their document position.

use std::collections::HashSet;

use dashmap::DashSet;
use page_dom::{Document, composed_ancestors};

use crate::ImageRecord;
use crate::url_norm::{MatchIndex, Normalizer};

/// Where the viewer was before the merge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeHint {
    pub last_url: Option<String>,
    pub last_index: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub records: Vec<ImageRecord>,
    /// Position in `records` the viewer should return to.
    pub restore_index: Option<usize>,
}

/// Rewrites aliases to their canonical form when the canonical form itself
/// appears anywhere in either list.
fn canonicalize_ties(normalizer: &Normalizer, old: &mut [ImageRecord], new: &mut [ImageRecord]) {
    let present: HashSet<String> = old
        .iter()
        .chain(new.iter())
        .map(|record| record.src.clone())
        .collect();
    for record in old.iter_mut().chain(new.iter_mut()) {
        let raw = normalizer.raw_url(&record.src);
        if raw != record.src && present.contains(&raw) {
            record.src = raw;
        }
    }
}

/// Interleaves `new` into `old` at anchors: new entries already present in
/// old that old has not emitted yet. At each anchor the old entries before
/// it flush in old order, then the new run ending at the anchor in new
/// order. Remainders follow, old first.
///
/// The anchor itself is emitted once, as the new entry: the old copy is
/// replaced, so `[B, C]` and `[A, B, C]` give `[A, B, C]`.
fn interleave(normalizer: &Normalizer, old: &[ImageRecord], new: &[ImageRecord]) -> Vec<ImageRecord> {
    let index = MatchIndex::new(normalizer, old.iter().map(|record| record.src.as_str()));
    let mut out = Vec::with_capacity(old.len() + new.len());
    let mut old_cursor = 0;
    let mut new_cursor = 0;

    for (position, record) in new.iter().enumerate() {
        let Some(anchor) = index.find(normalizer, &record.src) else {
            continue;
        };
        if anchor < old_cursor {
            continue;
        }
        out.extend_from_slice(old.get(old_cursor..anchor).unwrap_or_default());
        out.extend_from_slice(new.get(new_cursor..=position).unwrap_or_default());
        old_cursor = anchor + 1;
        new_cursor = position + 1;
    }
    out.extend_from_slice(old.get(old_cursor..).unwrap_or_default());
    out.extend_from_slice(new.get(new_cursor..).unwrap_or_default());
    out
}

fn dedupe(normalizer: &Normalizer, bad: &DashSet<String>, records: Vec<ImageRecord>) -> Vec<ImageRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| !bad.contains(&record.src))
        .filter(|record| seen.insert(normalizer.raw_url(&record.src)))
        .collect()
}

/// Points records whose element detached at the live element of the same
/// image in `new`, when there is one.
fn reattach<D: Document + ?Sized>(
    doc: &D,
    normalizer: &Normalizer,
    records: &mut [ImageRecord],
    new: &[ImageRecord],
) {
    let index = MatchIndex::new(normalizer, new.iter().map(|record| record.src.as_str()));
    for record in records {
        if record.dom.is_some_and(|node| doc.is_attached(node)) {
            continue;
        }
        let live = index
            .find(normalizer, &record.src)
            .and_then(|position| new.get(position))
            .and_then(|found| found.dom)
            .filter(|node| doc.is_attached(*node));
        if live.is_some() {
            record.dom = live;
        }
    }
}

/// Sorts attached entries by composed document position within the slots
/// they occupy; detached entries stay put. Each entry's composed path is
/// computed once.
fn stabilize<D: Document + ?Sized>(doc: &D, records: &mut [ImageRecord]) {
    let mut keyed: Vec<(Vec<usize>, usize)> = records
        .iter()
        .enumerate()
        .filter_map(|(position, record)| {
            let node = record.dom.filter(|node| doc.is_attached(*node))?;
            composed_ancestors(doc, node).map(|path| (path, position))
        })
        .collect();
    let slots: Vec<usize> = keyed.iter().map(|(_, position)| *position).collect();
    keyed.sort();
    let attached: Vec<ImageRecord> = keyed
        .iter()
        .filter_map(|(_, position)| records.get(*position).cloned())
        .collect();
    for (slot, record) in slots.into_iter().zip(attached) {
        if let Some(target) = records.get_mut(slot) {
            *target = record;
        }
    }
}

/// Merges `new` into `old`. Never contains two records with the same
/// canonical source or any bad URL.
pub fn merge<D: Document + ?Sized>(
    doc: &D,
    normalizer: &Normalizer,
    bad: &DashSet<String>,
    old: &[ImageRecord],
    new: &[ImageRecord],
) -> Vec<ImageRecord> {
    let mut old = old.to_vec();
    let mut new = new.to_vec();
    canonicalize_ties(normalizer, &mut old, &mut new);
    let interleaved = interleave(normalizer, &old, &new);
    let mut records = dedupe(normalizer, bad, interleaved);
    reattach(doc, normalizer, &mut records, &new);
    stabilize(doc, &mut records);
    records
}

/// Position in `records` matching the viewer's last shown image, falling
/// back to its last index clamped to the list.
pub fn restore_index(normalizer: &Normalizer, records: &[ImageRecord], hint: &MergeHint) -> Option<usize> {
    if records.is_empty() {
        return None;
    }
    let by_url = hint.last_url.as_deref().and_then(|url| {
        MatchIndex::new(normalizer, records.iter().map(|record| record.src.as_str())).find(normalizer, url)
    });
    by_url.or_else(|| hint.last_index.map(|index| index.min(records.len() - 1)))
}

#[cfg(test)]
mod tests {
    use page_dom::{MemoryDocument, NodeKey};

    use super::*;

    fn detached(urls: &[&str]) -> Vec<ImageRecord> {
        urls.iter()
            .map(|url| ImageRecord::new(format!("https://example.com/{url}"), None))
            .collect()
    }

    fn names(records: &[ImageRecord]) -> Vec<&str> {
        records
            .iter()
            .map(|record| record.src.trim_start_matches("https://example.com/"))
            .collect()
    }

    fn run(old: &[ImageRecord], new: &[ImageRecord]) -> Vec<ImageRecord> {
        let doc = MemoryDocument::new("https://example.com/");
        merge(&doc, &Normalizer::new(), &DashSet::new(), old, new)
    }

    #[test]
    fn merging_with_itself_is_identity() {
        let list = detached(&["a.jpg", "b.jpg", "c.jpg"]);
        assert_eq!(run(&list, &list), list);
    }

    #[test]
    fn appended_entries_follow_their_anchor() {
        let merged = run(
            &detached(&["a.jpg", "b.jpg", "c.jpg"]),
            &detached(&["b.jpg", "c.jpg", "d.jpg"]),
        );
        assert_eq!(names(&merged), vec!["a.jpg", "b.jpg", "c.jpg", "d.jpg"]);
    }

    #[test]
    fn prepended_entries_precede_their_anchor() {
        let merged = run(&detached(&["b.jpg", "c.jpg"]), &detached(&["a.jpg", "b.jpg", "c.jpg"]));
        assert_eq!(names(&merged), vec!["a.jpg", "b.jpg", "c.jpg"]);
    }

    #[test]
    fn spliced_entries_land_between_anchors() {
        let merged = run(
            &detached(&["a.jpg", "c.jpg", "e.jpg"]),
            &detached(&["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"]),
        );
        assert_eq!(names(&merged), vec!["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"]);
    }

    #[test]
    fn canonical_forms_are_unique() {
        let merged = run(
            &detached(&["img_200x200.png", "x.jpg"]),
            &detached(&["img.png", "x.jpg", "x-50x50.jpg"]),
        );
        assert_eq!(names(&merged), vec!["img.png", "x.jpg"]);
    }

    #[test]
    fn bad_urls_are_dropped() {
        let doc = MemoryDocument::new("https://example.com/");
        let bad = DashSet::new();
        bad.insert("https://example.com/b.jpg".to_owned());
        let list = detached(&["a.jpg", "b.jpg"]);
        let merged = merge(&doc, &Normalizer::new(), &bad, &list, &list);
        assert_eq!(names(&merged), vec!["a.jpg"]);
    }

    #[test]
    fn attached_entries_follow_document_order() {
        let doc = MemoryDocument::new("https://example.com/");
        let first = doc.create_element(NodeKey::ROOT, "img", &[("src", "x.jpg")]);
        let second = doc.create_element(NodeKey::ROOT, "img", &[("src", "y.jpg")]);
        let old = vec![
            ImageRecord::new("https://example.com/y.jpg", Some(second)),
            ImageRecord::new("https://example.com/gone.jpg", None),
            ImageRecord::new("https://example.com/x.jpg", Some(first)),
        ];
        let merged = merge(&doc, &Normalizer::new(), &DashSet::new(), &old, &[]);
        assert_eq!(names(&merged), vec!["x.jpg", "gone.jpg", "y.jpg"]);
    }

    #[test]
    fn shadow_content_sorts_before_the_host_children() {
        let doc = MemoryDocument::new("https://example.com/");
        let host = doc.create_element(NodeKey::ROOT, "div", &[]);
        let light = doc.create_element(host, "img", &[("src", "light.jpg")]);
        let shadow = doc.attach_shadow(host);
        let shadowed = doc.create_element(shadow, "img", &[("src", "shadowed.jpg")]);
        let after = doc.create_element(NodeKey::ROOT, "img", &[("src", "after.jpg")]);
        let old = vec![
            ImageRecord::new("https://example.com/after.jpg", Some(after)),
            ImageRecord::new("https://example.com/light.jpg", Some(light)),
            ImageRecord::new("https://example.com/gone.jpg", None),
            ImageRecord::new("https://example.com/shadowed.jpg", Some(shadowed)),
        ];
        let merged = merge(&doc, &Normalizer::new(), &DashSet::new(), &old, &[]);
        assert_eq!(
            names(&merged),
            vec!["shadowed.jpg", "light.jpg", "gone.jpg", "after.jpg"]
        );
    }

    #[test]
    fn stale_references_reattach_to_live_elements() {
        let doc = MemoryDocument::new("https://example.com/");
        let stale = doc.create_element(NodeKey::ROOT, "img", &[("src", "a.jpg")]);
        doc.remove(stale);
        let live = doc.create_element(NodeKey::ROOT, "img", &[("src", "a.jpg")]);
        let old = vec![ImageRecord::new("https://example.com/a.jpg", Some(stale))];
        let new = vec![ImageRecord::new("https://example.com/a.jpg", Some(live))];
        let merged = merge(&doc, &Normalizer::new(), &DashSet::new(), &old, &new);
        assert_eq!(merged[0].dom, Some(live));
    }

    #[test]
    fn restore_index_prefers_url() {
        let norm = Normalizer::new();
        let records = detached(&["a.jpg", "b.jpg", "c.jpg"]);
        let hint = MergeHint {
            last_url: Some("https://example.com/c.jpg".to_owned()),
            last_index: Some(0),
        };
        assert_eq!(restore_index(&norm, &records, &hint), Some(2));
        let fallback = MergeHint {
            last_url: Some("https://example.com/zzz.jpg".to_owned()),
            last_index: Some(9),
        };
        assert_eq!(restore_index(&norm, &records, &fallback), Some(2));
        assert_eq!(restore_index(&norm, &[], &fallback), None);
    }
}
