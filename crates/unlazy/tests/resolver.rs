mod support;

use std::sync::Arc;

use page_dom::{Document as _, MemoryDocument, NodeKey};
use support::{FakeFetcher, FakeMessenger, init_logging, state_with};
use tokio::time::{Duration, sleep};
use unlazy::collector::{ScanMode, collect};
use unlazy::resolver::{self, Measure, RESOLVED_ATTR, resolve_batch, resolve_element};

const PAGE: &str = "https://example.com/gallery/";

fn fakes() -> (Arc<FakeFetcher>, Arc<FakeMessenger>) {
    (Arc::new(FakeFetcher::new()), Arc::new(FakeMessenger::default()))
}

#[tokio::test]
async fn thumbnail_is_upgraded_to_larger_lazy_source() {
    init_logging();
    let (fetcher, messenger) = fakes();
    fetcher.image("https://example.com/gallery/thumb-100x100.jpg", 5_000, 100, 100);
    fetcher.image("https://example.com/gallery/full.jpg", 50_000, 1200, 900);
    let state = state_with(&fetcher, &messenger);

    let doc = MemoryDocument::new(PAGE);
    let img = doc.create_element(
        NodeKey::ROOT,
        "img",
        &[("src", "thumb-100x100.jpg"), ("data-full", "full.jpg")],
    );

    let measure = resolve_element(&doc, &state, img).await;

    assert_eq!(measure, Some(Measure::Bytes(50_000)));
    assert_eq!(
        doc.attribute(img, "src").as_deref(),
        Some("https://example.com/gallery/full.jpg")
    );
    assert_eq!(
        doc.current_src(img).as_deref(),
        Some("https://example.com/gallery/full.jpg")
    );
    assert_eq!(doc.attribute(img, "data-full"), None);
    assert_eq!(doc.attribute(img, RESOLVED_ATTR).as_deref(), Some("done"));
    assert_eq!(state.resolved_count(), 1);
}

#[tokio::test]
async fn accepted_measure_never_decreases() {
    init_logging();
    let (fetcher, messenger) = fakes();
    fetcher.image("https://example.com/gallery/small.jpg", 1_000, 50, 50);
    fetcher.image("https://example.com/gallery/medium.jpg", 3_000, 300, 300);
    fetcher.image("https://example.com/photos/huge.jpg", 9_000, 2000, 2000);
    fetcher.image("https://example.com/gallery/tiny.jpg", 500, 10, 10);
    let state = state_with(&fetcher, &messenger);

    let doc = MemoryDocument::new(PAGE);
    let link = doc.create_element(NodeKey::ROOT, "a", &[("href", "/photos/huge.jpg")]);
    let img = doc.create_element(link, "img", &[("src", "small.jpg"), ("data-large", "medium.jpg")]);

    let first = resolve_element(&doc, &state, img).await;
    assert_eq!(first, Some(Measure::Bytes(9_000)));
    assert_eq!(
        doc.current_src(img).as_deref(),
        Some("https://example.com/photos/huge.jpg")
    );

    doc.remove_attribute(img, RESOLVED_ATTR);
    doc.set_attribute(img, "data-src", "tiny.jpg");
    let second = resolve_element(&doc, &state, img).await;
    assert!(second >= first);
    assert_eq!(
        doc.current_src(img).as_deref(),
        Some("https://example.com/photos/huge.jpg")
    );
}

#[tokio::test]
async fn equal_sizes_only_win_for_a_different_picture() {
    init_logging();
    let (fetcher, messenger) = fakes();
    fetcher.image("https://example.com/gallery/a.jpg?v=1", 4_000, 400, 400);
    fetcher.image("https://example.com/gallery/a.jpg?v=2", 4_000, 400, 400);
    fetcher.image("https://example.com/gallery/c.jpg", 4_000, 400, 400);
    fetcher.image("https://example.com/gallery/d.jpg", 4_000, 400, 400);
    let state = state_with(&fetcher, &messenger);

    let doc = MemoryDocument::new(PAGE);
    let busted = doc.create_element(NodeKey::ROOT, "img", &[("src", "a.jpg?v=1"), ("data-src", "a.jpg?v=2")]);
    let other = doc.create_element(NodeKey::ROOT, "img", &[("src", "c.jpg"), ("data-src", "d.jpg")]);

    resolve_element(&doc, &state, busted).await;
    resolve_element(&doc, &state, other).await;

    assert_eq!(
        doc.current_src(busted).as_deref(),
        Some("https://example.com/gallery/a.jpg?v=1")
    );
    assert_eq!(
        doc.current_src(other).as_deref(),
        Some("https://example.com/gallery/d.jpg")
    );
}

#[tokio::test]
async fn placeholders_fall_back_to_pixel_size() {
    init_logging();
    let (fetcher, messenger) = fakes();
    fetcher.image("https://example.com/gallery/real.jpg", 0, 800, 600);
    let state = state_with(&fetcher, &messenger);

    let doc = MemoryDocument::new(PAGE);
    let img = doc.create_element(
        NodeKey::ROOT,
        "img",
        &[
            ("src", "data:image/gif;base64,R0lGODlhAQABAAAAACw="),
            ("data-original", "broken.jpg"),
            ("data-src", "real.jpg"),
        ],
    );
    doc.set_natural_size(img, Some((1, 1)));

    let measure = resolve_element(&doc, &state, img).await;

    assert_eq!(measure, Some(Measure::Pixels(600)));
    assert_eq!(
        doc.current_src(img).as_deref(),
        Some("https://example.com/gallery/real.jpg")
    );
    assert!(state.is_bad("https://example.com/gallery/broken.jpg"));
    assert_eq!(doc.attribute(img, "data-src"), None);
    assert!(doc.attribute(img, "data-original").is_some());
}

#[tokio::test]
async fn picture_sources_and_backgrounds_are_rewritten() {
    init_logging();
    let (fetcher, messenger) = fakes();
    fetcher.image("https://example.com/gallery/p-small.jpg", 1_000, 10, 10);
    fetcher.image("https://example.com/gallery/p-large.jpg", 8_000, 10, 10);
    fetcher.image("https://example.com/gallery/bg-small.jpg", 1_000, 10, 10);
    fetcher.image("https://example.com/gallery/bg-large.jpg", 8_000, 10, 10);
    let state = state_with(&fetcher, &messenger);

    let doc = MemoryDocument::new(PAGE);
    let picture = doc.create_element(NodeKey::ROOT, "picture", &[]);
    let source = doc.create_element(picture, "source", &[("srcset", "p-small.jpg 1x")]);
    let img = doc.create_element(picture, "img", &[("src", "p-small.jpg"), ("data-lazy-src", "p-large.jpg")]);
    let banner = doc.create_element(
        NodeKey::ROOT,
        "div",
        &[("style", "height: 10px; background-image: url('bg-small.jpg')"), ("data-bg", "bg-large.jpg")],
    );

    resolve_element(&doc, &state, img).await;
    resolve_element(&doc, &state, banner).await;

    assert_eq!(
        doc.attribute(source, "srcset").as_deref(),
        Some("https://example.com/gallery/p-large.jpg")
    );
    assert_eq!(
        doc.current_src(img).as_deref(),
        Some("https://example.com/gallery/p-large.jpg")
    );
    assert_eq!(
        doc.attribute(banner, "style").as_deref(),
        Some("height: 10px; background-image: url(\"https://example.com/gallery/bg-large.jpg\")")
    );
}

#[tokio::test]
async fn placeholder_without_src_takes_its_lazy_source() {
    init_logging();
    let (fetcher, messenger) = fakes();
    fetcher.image("https://example.com/gallery/real.jpg", 50_000, 800, 600);
    let state = state_with(&fetcher, &messenger);
    let doc = MemoryDocument::new(PAGE);
    let img = doc.create_element(NodeKey::ROOT, "img", &[("data-src", "real.jpg")]);
    let bare = doc.create_element(NodeKey::ROOT, "img", &[("alt", "nothing here")]);

    assert!(collect(&doc, &state, ScanMode::Unfiltered).await.is_empty());
    assert!(!resolve_batch(&doc, &state).await);

    assert_eq!(
        doc.current_src(img).as_deref(),
        Some("https://example.com/gallery/real.jpg")
    );
    assert_eq!(doc.attribute(img, "data-src"), None);
    assert!(resolver::is_resolved(&doc, img));
    assert!(!resolver::is_resolved(&doc, bare));
    assert_eq!(state.resolved_count(), 1);
    let records = collect(&doc, &state, ScanMode::Unfiltered).await;
    let urls: Vec<&str> = records.iter().map(|record| record.src.as_str()).collect();
    assert_eq!(urls, vec!["https://example.com/gallery/real.jpg"]);
}

#[tokio::test]
async fn batch_leaves_loading_elements_for_later() {
    init_logging();
    let (fetcher, messenger) = fakes();
    let state = state_with(&fetcher, &messenger);
    let doc = MemoryDocument::new(PAGE);
    let ready = doc.create_element(NodeKey::ROOT, "img", &[("src", "ready.jpg")]);
    let loading = doc.create_element(NodeKey::ROOT, "img", &[("src", "loading.jpg")]);
    doc.set_complete(loading, false);

    assert!(resolve_batch(&doc, &state).await);
    assert!(resolver::is_resolved(&doc, ready));
    assert!(!resolver::is_resolved(&doc, loading));

    doc.set_complete(loading, true);
    assert!(!resolve_batch(&doc, &state).await);
    assert!(resolver::is_resolved(&doc, loading));
    assert_eq!(state.resolved_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn first_unlazy_signal_waits_for_loading_elements() {
    init_logging();
    let (fetcher, messenger) = fakes();
    let state = state_with(&fetcher, &messenger);
    let doc = MemoryDocument::new(PAGE);
    let img = doc.create_element(NodeKey::ROOT, "img", &[("src", "slow.jpg")]);
    doc.set_complete(img, false);

    assert!(!resolver::wait_first_unlazy(&state).await);

    tokio::join!(resolver::unlazy(&doc, &state), async {
        sleep(Duration::from_millis(250)).await;
        assert!(!state.first_unlazy_done());
        doc.set_complete(img, true);
    });

    assert!(state.first_unlazy_done());
    assert!(resolver::is_resolved(&doc, img));
    assert!(resolver::wait_first_unlazy(&state).await);
}
