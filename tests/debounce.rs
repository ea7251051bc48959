//! Burst debouncing of multi-part uploads, including handing a completed
//! album to the accumulator.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use stream_relay::channel::RecordingChannel;
use stream_relay::generation::{FragmentsSource, GenerationRequest};
use stream_relay::storage::InMemoryArtifactStore;
use stream_relay::types::{Attachment, MessageHandle, Recipient};
use stream_relay::{
    BurstBatch, BurstDebouncer, DebounceConfig, EngineConfig, ResilienceState, StreamAccumulator,
};
use tokio::sync::mpsc;

fn photo(name: &str) -> Attachment {
    Attachment::new(name, "image/jpeg", Bytes::from_static(b"\xff\xd8"))
}

type Album = BurstBatch<Attachment, MessageHandle>;

fn album_debouncer() -> (BurstDebouncer<Attachment, MessageHandle>, mpsc::UnboundedReceiver<Album>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let debouncer = BurstDebouncer::new(DebounceConfig::default(), move |batch| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(batch);
        }
    });
    (debouncer, rx)
}

#[tokio::test(start_paused = true)]
async fn test_two_items_in_quiet_period_flush_once() {
    let (debouncer, mut rx) = album_debouncer();
    debouncer.add_item("media-1", MessageHandle::new("10"), photo("a.jpg"), None);
    tokio::time::sleep(Duration::from_millis(700)).await;
    debouncer.add_item("media-1", MessageHandle::new("11"), photo("b.jpg"), None);
    assert_eq!(debouncer.pending_items("media-1"), 2);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let album = rx.recv().await.unwrap();
    assert_eq!(album.items.len(), 2);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_late_item_produces_second_flush() {
    let (debouncer, mut rx) = album_debouncer();
    debouncer.add_item("media-1", MessageHandle::new("10"), photo("a.jpg"), None);
    tokio::time::sleep(Duration::from_secs(2)).await;
    debouncer.add_item("media-1", MessageHandle::new("11"), photo("b.jpg"), None);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.items[0].filename, "a.jpg");
    assert_eq!(second.items[0].filename, "b.jpg");
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_groups_are_independent() {
    let (debouncer, mut rx) = album_debouncer();
    debouncer.add_item("media-1", MessageHandle::new("1"), photo("a.jpg"), None);
    debouncer.add_item("media-2", MessageHandle::new("2"), photo("x.jpg"), None);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    debouncer.add_item("media-1", MessageHandle::new("3"), photo("b.jpg"), None);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let early = rx.recv().await.unwrap();
    assert_eq!(early.key, "media-2");
    assert_eq!(debouncer.pending_groups(), vec!["media-1".to_string()]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let late = rx.recv().await.unwrap();
    assert_eq!(late.key, "media-1");
    assert_eq!(late.items.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_completed_album_feeds_a_stream() {
    let cfg = EngineConfig::new();
    let channel = Arc::new(RecordingChannel::new());
    let state = Arc::new(ResilienceState::new(
        cfg.rate_limit.clone(),
        cfg.circuit_breaker.clone(),
    ));
    let accumulator = StreamAccumulator::new(
        &cfg,
        state,
        channel.clone(),
        Arc::new(FragmentsSource::new(["Two photos of a beach."])),
        Arc::new(InMemoryArtifactStore::new()),
    );

    let (debouncer, mut rx) = album_debouncer();
    let first = channel.seed("photo 1");
    let captioned = channel.seed("photo 2");
    debouncer.add_item("album", first, photo("1.jpg"), None);
    debouncer.add_item("album", captioned.clone(), photo("2.jpg"), Some("What is this?".into()));

    let album = rx.recv().await.unwrap();
    assert_eq!(album.anchor, captioned);
    let request = GenerationRequest::new("conv-9", album.caption.clone().unwrap_or_default())
        .with_attachments(album.items);
    assert_eq!(request.attachments.len(), 2);

    let report = accumulator
        .run(&request, &Recipient::new("9"), Some(album.anchor))
        .await
        .unwrap();
    assert_eq!(
        channel.text(&report.messages[0]).as_deref(),
        Some("Two photos of a beach\\.")
    );
}
