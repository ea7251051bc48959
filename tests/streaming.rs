//! End-to-end streaming through the accumulator with in-memory collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stream_relay::channel::{ChannelClient, ChannelEvent, RecordingChannel};
use stream_relay::generation::{
    FragmentStream, FragmentsSource, GenerationRequest, GenerationSource,
};
use stream_relay::storage::InMemoryArtifactStore;
use stream_relay::types::{EditStatus, MessageHandle, Navigation, OutboundMessage, Recipient};
use stream_relay::{EngineConfig, Error, ErrorKind, ResilienceState, Result, StreamAccumulator};
use tokio_stream::StreamExt;

fn accumulator(
    cfg: &EngineConfig,
    channel: Arc<dyn ChannelClient>,
    source: Arc<dyn GenerationSource>,
    store: Arc<InMemoryArtifactStore>,
) -> StreamAccumulator {
    let state = Arc::new(ResilienceState::new(
        cfg.rate_limit.clone(),
        cfg.circuit_breaker.clone(),
    ));
    StreamAccumulator::new(cfg, state, channel, source, store)
}

/// Yields fragments with a fixed delay between them.
struct Paced {
    fragments: Vec<String>,
    gap: Duration,
}

#[async_trait]
impl GenerationSource for Paced {
    async fn generate(&self, _request: &GenerationRequest) -> Result<FragmentStream> {
        let items: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        Ok(Box::pin(tokio_stream::iter(items).throttle(self.gap)))
    }
}

#[tokio::test(start_paused = true)]
async fn test_hello_world_creates_one_message() {
    let cfg = EngineConfig::new();
    let channel = Arc::new(RecordingChannel::new());
    let store = Arc::new(InMemoryArtifactStore::new());
    let acc = accumulator(
        &cfg,
        channel.clone(),
        Arc::new(FragmentsSource::new(["Hello ", "World"])),
        store.clone(),
    );

    let report = acc
        .run(&GenerationRequest::new("conv", "greet"), &Recipient::new("7"), None)
        .await
        .unwrap();

    assert_eq!(channel.sent_count(), 1);
    assert_eq!(report.messages.len(), 1);
    assert_eq!(channel.text(&report.messages[0]).as_deref(), Some("Hello World"));
    assert_eq!(store.artifact_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_paced_stream_updates_anchor_in_place() {
    let cfg = EngineConfig::new();
    let channel = Arc::new(RecordingChannel::new());
    let words: Vec<String> = (0..30).map(|i| format!("word{} ", i)).collect();
    let acc = accumulator(
        &cfg,
        channel.clone(),
        Arc::new(Paced {
            fragments: words.clone(),
            gap: Duration::from_millis(500),
        }),
        Arc::new(InMemoryArtifactStore::new()),
    );

    let report = acc
        .run(&GenerationRequest::default(), &Recipient::new("7"), None)
        .await
        .unwrap();

    assert_eq!(channel.sent_count(), 1);
    assert!(channel.edit_count() >= 2, "expected intermediate edits");
    assert!(report.flushes >= 2);
    assert_eq!(
        channel.text(&report.messages[0]).unwrap(),
        words.concat().trim_end()
    );
}

#[tokio::test(start_paused = true)]
async fn test_generation_start_is_retried() {
    struct FlakyStart {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl GenerationSource for FlakyStart {
        async fn generate(&self, _request: &GenerationRequest) -> Result<FragmentStream> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::transient("503 service unavailable"));
            }
            Ok(Box::pin(tokio_stream::iter(vec![Ok("recovered".to_string())])))
        }
    }

    let cfg = EngineConfig::new();
    let channel = Arc::new(RecordingChannel::new());
    let source = Arc::new(FlakyStart {
        attempts: AtomicU32::new(0),
    });
    let acc = accumulator(
        &cfg,
        channel.clone(),
        source.clone(),
        Arc::new(InMemoryArtifactStore::new()),
    );

    let report = acc
        .run(&GenerationRequest::default(), &Recipient::new("7"), None)
        .await
        .unwrap();
    assert_eq!(source.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(channel.text(&report.messages[0]).as_deref(), Some("recovered"));
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_surfaces_as_unavailable() {
    struct Down;

    #[async_trait]
    impl GenerationSource for Down {
        async fn generate(&self, _request: &GenerationRequest) -> Result<FragmentStream> {
            Err(Error::transient("connection refused"))
        }
    }

    let cfg = EngineConfig::new();
    let channel = Arc::new(RecordingChannel::new());
    let acc = accumulator(
        &cfg,
        channel.clone(),
        Arc::new(Down),
        Arc::new(InMemoryArtifactStore::new()),
    );
    let chat = Recipient::new("7");

    // Three failed attempts trip the generation breaker.
    let first = acc.run(&GenerationRequest::default(), &chat, None).await.unwrap_err();
    assert_eq!(first.kind(), ErrorKind::TransientUpstream);

    let second = acc.run(&GenerationRequest::default(), &chat, None).await.unwrap_err();
    assert_eq!(second.kind(), ErrorKind::CircuitOpen);
    let anchor = channel.handles().last().cloned().unwrap();
    assert_eq!(
        channel.text(&anchor).as_deref(),
        Some("Error: Service generation is temporarily unavailable")
    );
}

/// Rejects the first edit of every message.
struct FailingEdits {
    inner: RecordingChannel,
    failed: Mutex<Vec<MessageHandle>>,
}

#[async_trait]
impl ChannelClient for FailingEdits {
    async fn send(&self, recipient: &Recipient, message: &OutboundMessage) -> Result<MessageHandle> {
        self.inner.send(recipient, message).await
    }

    async fn edit(
        &self,
        recipient: &Recipient,
        handle: &MessageHandle,
        message: &OutboundMessage,
    ) -> Result<EditStatus> {
        {
            let mut failed = self.failed.lock().unwrap();
            if !failed.contains(handle) {
                failed.push(handle.clone());
                return Err(Error::permanent("message is too old to edit"));
            }
        }
        self.inner.edit(recipient, handle, message).await
    }

    async fn edit_navigation(
        &self,
        recipient: &Recipient,
        handle: &MessageHandle,
        navigation: &Navigation,
    ) -> Result<()> {
        self.inner.edit_navigation(recipient, handle, navigation).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_edit_does_not_abort_stream() {
    let cfg = EngineConfig::new();
    let channel = Arc::new(FailingEdits {
        inner: RecordingChannel::new(),
        failed: Mutex::new(Vec::new()),
    });
    let words: Vec<String> = (0..30).map(|i| format!("token{} ", i)).collect();
    let acc = accumulator(
        &cfg,
        channel.clone(),
        Arc::new(Paced {
            fragments: words.clone(),
            gap: Duration::from_millis(400),
        }),
        Arc::new(InMemoryArtifactStore::new()),
    );

    let report = acc
        .run(&GenerationRequest::default(), &Recipient::new("7"), None)
        .await
        .unwrap();
    // The first flush fails, a later one lands the full text.
    assert_eq!(
        channel.inner.text(&report.messages[0]).unwrap(),
        words.concat().trim_end()
    );
}

#[tokio::test(start_paused = true)]
async fn test_replies_thread_under_anchor() {
    let mut cfg = EngineConfig::new();
    cfg.chunker.max_message_len = 400;
    cfg.chunker.safe_message_len = 380;
    cfg.chunker.safety_margin = 20;
    let channel = Arc::new(RecordingChannel::new());
    let body: String = (0..12)
        .map(|i| format!("Section {} {}\n\n", i, "lorem ipsum ".repeat(6)))
        .collect();
    let acc = accumulator(
        &cfg,
        channel.clone(),
        Arc::new(FragmentsSource::new([body])),
        Arc::new(InMemoryArtifactStore::new()),
    );
    let report = acc
        .run(&GenerationRequest::default(), &Recipient::new("7"), None)
        .await
        .unwrap();

    assert!(report.messages.len() > 1);
    let anchor = &report.messages[0];
    let replies: Vec<_> = channel
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ChannelEvent::Sent { message, .. } => Some(message),
            _ => None,
        })
        .skip(1)
        .collect();
    assert_eq!(replies.len(), report.messages.len() - 1);
    assert!(replies.iter().all(|m| m.reply_to.as_ref() == Some(anchor)));
    for handle in &report.messages {
        assert!(channel.text(handle).unwrap().chars().count() <= 400);
    }
}
