//! 流式累积模块：把生成片段累积为实时更新的渠道消息，并在结束时生成终态渲染。
//!
//! # Streaming Accumulator
//!
//! Drives one generation stream into the downstream channel. Fragments are
//! concatenated as they arrive; on a timer the whole accumulated text is
//! re-chunked and reconciled, index by index, against the messages already
//! delivered. When the generation ends the accumulator runs one final flush,
//! persists the terminal artifact and attaches a navigation affordance to the
//! last message.
//!
//! ## Lifecycle
//!
//! | Phase | Entered when |
//! |-------|--------------|
//! | [`StreamPhase::Collecting`] | stream starts, and after every flush |
//! | [`StreamPhase::Flushing`] | interval elapsed and enough text is buffered |
//! | [`StreamPhase::Finalizing`] | generation exhausted |
//! | [`StreamPhase::Done`] | terminal rendering delivered |
//! | [`StreamPhase::Errored`] | any failure in the drive loop |
//!
//! Failures of individual sends or edits during a flush are logged and do not
//! abort the stream; the next flush reconciles again.

use crate::channel::ChannelClient;
use crate::chunker::{ChunkOutput, Chunker};
use crate::config::{duration_ms, EngineConfig};
use crate::generation::{GenerationRequest, GenerationSource};
use crate::resilience::{CallOutcome, ResilienceState, ResilientExecutor};
use crate::storage::ArtifactStore;
use crate::types::{CodeAsset, MessageHandle, NavButton, Navigation, OutboundMessage, Recipient};
use crate::{Error, ErrorContext, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Minimum time between two flushes.
    #[serde(rename = "flush_interval_ms", with = "duration_ms")]
    pub flush_interval: Duration,
    /// A flush needs strictly more than this many accumulated chars.
    pub min_flush_chars: usize,
    /// Pause after each flush, on top of the rate limiter.
    #[serde(rename = "post_flush_pause_ms", with = "duration_ms")]
    pub post_flush_pause: Duration,
    pub placeholder_text: String,
    pub empty_response_text: String,
    /// Cap for the error text written into the anchor on failure.
    pub error_text_limit: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            min_flush_chars: 50,
            post_flush_pause: Duration::from_millis(300),
            placeholder_text: "Thinking...".to_string(),
            empty_response_text: "No response received (stream ended empty)".to_string(),
            error_text_limit: 4000,
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_min_flush_chars(mut self, chars: usize) -> Self {
        self.min_flush_chars = chars;
        self
    }

    pub fn with_post_flush_pause(mut self, pause: Duration) -> Self {
        self.post_flush_pause = pause;
        self
    }

    pub fn with_placeholder_text(mut self, text: impl Into<String>) -> Self {
        self.placeholder_text = text.into();
        self
    }

    pub fn with_error_text_limit(mut self, limit: usize) -> Self {
        self.error_text_limit = limit;
        self
    }
}

/// Where the terminal navigation affordance points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Base of the web view; `None` omits the "Web View" button.
    pub web_base_url: Option<url::Url>,
}

impl NavigationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_web_base_url(mut self, url: url::Url) -> Self {
        self.web_base_url = Some(url);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Collecting,
    Flushing,
    Finalizing,
    Done,
    Errored,
}

/// A message delivered for one output index.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delivered {
    handle: MessageHandle,
    /// Last content known to be on the channel; `None` for a caller-supplied
    /// anchor whose content is unknown.
    text: Option<String>,
}

/// Per-stream state. Single writer: only the owning `run` call touches it.
struct StreamSession {
    stream_id: String,
    phase: StreamPhase,
    accumulated: String,
    accumulated_chars: usize,
    last_flush: Instant,
    flushes: u32,
    sent: BTreeMap<usize, Delivered>,
}

impl StreamSession {
    fn new(stream_id: String) -> Self {
        Self {
            stream_id,
            phase: StreamPhase::Collecting,
            accumulated: String::new(),
            accumulated_chars: 0,
            last_flush: Instant::now(),
            flushes: 0,
            sent: BTreeMap::new(),
        }
    }

    fn transition(&mut self, phase: StreamPhase) {
        debug!(stream_id = %self.stream_id, from = ?self.phase, to = ?phase, "stream phase");
        self.phase = phase;
    }

    fn push(&mut self, fragment: &str) {
        self.accumulated.push_str(fragment);
        self.accumulated_chars += fragment.chars().count();
    }

    fn anchor(&self) -> Option<&MessageHandle> {
        self.sent.get(&0).map(|d| &d.handle)
    }
}

/// Outcome of a completed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub stream_id: String,
    /// Key of the persisted terminal artifact; `None` for an empty stream.
    pub page_id: Option<String>,
    /// Delivered messages in output order; index 0 is the anchor.
    pub messages: Vec<MessageHandle>,
    pub assets: Vec<CodeAsset>,
    /// Raw accumulated text.
    pub text: String,
    pub empty: bool,
    /// Flushes run, including the final one.
    pub flushes: u32,
    /// Trailing chunks of the final output the channel never accepted.
    pub undelivered: usize,
    /// True when the terminal chunking used the plain-text fallback.
    pub fallback: bool,
}

/// Drives generation streams into a channel.
pub struct StreamAccumulator {
    cfg: StreamConfig,
    navigation: NavigationConfig,
    chunker: Chunker,
    channel_exec: ResilientExecutor,
    generation_exec: ResilientExecutor,
    channel: Arc<dyn ChannelClient>,
    source: Arc<dyn GenerationSource>,
    store: Arc<dyn ArtifactStore>,
}

impl StreamAccumulator {
    pub fn new(
        cfg: &EngineConfig,
        state: Arc<ResilienceState>,
        channel: Arc<dyn ChannelClient>,
        source: Arc<dyn GenerationSource>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            cfg: cfg.stream.clone(),
            navigation: cfg.navigation.clone(),
            chunker: Chunker::new(cfg.chunker.clone()),
            channel_exec: ResilientExecutor::new(cfg.channel.clone(), Arc::clone(&state)),
            generation_exec: ResilientExecutor::new(cfg.generation.clone(), state),
            channel,
            source,
            store,
        }
    }

    /// Replace the default MarkdownV2 chunker.
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.cfg
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Run one generation to completion.
    ///
    /// Without an `anchor`, a placeholder message is sent first and used as
    /// the anchor. On failure the anchor is edited to show the error (best
    /// effort) and the error is returned.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        recipient: &Recipient,
        anchor: Option<MessageHandle>,
    ) -> Result<StreamReport> {
        let mut session = StreamSession::new(uuid::Uuid::new_v4().to_string());
        info!(
            stream_id = %session.stream_id,
            conversation_id = %request.conversation_id,
            recipient = %recipient,
            source = self.source.name(),
            "stream started"
        );

        match self.drive(&mut session, request, recipient, anchor).await {
            Ok(report) => {
                session.transition(StreamPhase::Done);
                info!(
                    stream_id = %report.stream_id,
                    messages = report.messages.len(),
                    assets = report.assets.len(),
                    flushes = report.flushes,
                    empty = report.empty,
                    "stream finished"
                );
                Ok(report)
            }
            Err(e) => {
                session.transition(StreamPhase::Errored);
                warn!(stream_id = %session.stream_id, error = %e, "stream failed");
                self.report_error(&session, recipient, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut StreamSession,
        request: &GenerationRequest,
        recipient: &Recipient,
        anchor: Option<MessageHandle>,
    ) -> Result<StreamReport> {
        let anchor = match anchor {
            Some(handle) => handle,
            None => {
                let placeholder = OutboundMessage::plain(self.cfg.placeholder_text.clone());
                self.send(recipient, &placeholder).await?
            }
        };
        session.sent.insert(
            0,
            Delivered {
                handle: anchor,
                text: None,
            },
        );
        session.last_flush = Instant::now();

        let source = &self.source;
        let mut fragments = self
            .generation_exec
            .execute(None, "generate", || source.generate(request))
            .await?
            .completed()
            .ok_or_else(|| Error::permanent("generation start reported no content"))?;

        while let Some(fragment) = fragments.next().await {
            session.push(&fragment?);
            if session.last_flush.elapsed() >= self.cfg.flush_interval
                && session.accumulated_chars > self.cfg.min_flush_chars
            {
                self.flush(session, recipient).await;
            }
        }

        if session.accumulated.trim().is_empty() {
            return self.finish_empty(session, recipient).await;
        }

        self.flush(session, recipient).await;
        self.finalize(session, recipient).await
    }

    /// Re-chunk the whole accumulated text and reconcile it with the channel.
    async fn flush(&self, session: &mut StreamSession, recipient: &Recipient) -> ChunkOutput {
        session.transition(StreamPhase::Flushing);
        let output = self.chunker.chunk(&session.accumulated);
        self.reconcile(session, recipient, &output.messages).await;
        session.flushes += 1;
        session.last_flush = Instant::now();
        debug!(
            stream_id = %session.stream_id,
            flush = session.flushes,
            chars = session.accumulated_chars,
            messages = output.messages.len(),
            "flushed"
        );
        tokio::time::sleep(self.cfg.post_flush_pause).await;
        session.transition(StreamPhase::Collecting);
        output
    }

    async fn reconcile(&self, session: &mut StreamSession, recipient: &Recipient, messages: &[String]) {
        let format = self.chunker.dialect().format();
        let Some(anchor) = session.anchor().cloned() else {
            return;
        };

        for (index, text) in messages.iter().enumerate() {
            let outbound = OutboundMessage {
                format,
                ..OutboundMessage::plain(text.clone())
            };
            match session.sent.get(&index).cloned() {
                Some(delivered) if delivered.text.as_deref() == Some(text.as_str()) => {}
                Some(delivered) => match self.edit(recipient, &delivered.handle, &outbound).await {
                    Ok(()) => {
                        if let Some(d) = session.sent.get_mut(&index) {
                            d.text = Some(text.clone());
                        }
                    }
                    Err(e) => {
                        warn!(stream_id = %session.stream_id, index, error = %e, "edit failed, will retry on next flush");
                    }
                },
                None => {
                    let outbound = outbound.reply_to(anchor.clone());
                    match self.send(recipient, &outbound).await {
                        Ok(handle) => {
                            session.sent.insert(
                                index,
                                Delivered {
                                    handle,
                                    text: Some(text.clone()),
                                },
                            );
                        }
                        Err(e) => {
                            // Later chunks wait so messages never go out of order.
                            warn!(stream_id = %session.stream_id, index, error = %e, "send failed, holding later messages until next flush");
                            break;
                        }
                    }
                }
            }
        }

        if session.sent.len() > messages.len() {
            debug!(
                stream_id = %session.stream_id,
                delivered = session.sent.len(),
                current = messages.len(),
                "output shrank, leaving trailing messages as they are"
            );
        }
    }

    async fn finish_empty(&self, session: &mut StreamSession, recipient: &Recipient) -> Result<StreamReport> {
        session.transition(StreamPhase::Finalizing);
        warn!(stream_id = %session.stream_id, "generation produced no content");
        if let Some(anchor) = session.anchor().cloned() {
            let notice = OutboundMessage::plain(self.cfg.empty_response_text.clone());
            if let Err(e) = self.edit(recipient, &anchor, &notice).await {
                warn!(stream_id = %session.stream_id, error = %e, "could not report empty response");
            }
        }
        Ok(StreamReport {
            stream_id: session.stream_id.clone(),
            page_id: None,
            messages: session.sent.values().map(|d| d.handle.clone()).collect(),
            assets: Vec::new(),
            text: String::new(),
            empty: true,
            flushes: session.flushes,
            undelivered: 0,
            fallback: false,
        })
    }

    async fn finalize(&self, session: &mut StreamSession, recipient: &Recipient) -> Result<StreamReport> {
        session.transition(StreamPhase::Finalizing);
        let output = self.chunker.chunk(&session.accumulated);
        let page_id = new_page_id();

        self.persist(&session.stream_id, &page_id, &session.accumulated, &output.assets)
            .await;

        if session.sent.len() < output.messages.len() {
            self.reconcile(session, recipient, &output.messages).await;
        }
        let undelivered = output.messages.len().saturating_sub(session.sent.len());
        if undelivered > 0 {
            warn!(stream_id = %session.stream_id, undelivered, "stream finished with undelivered messages");
        }

        let navigation = self.navigation_for(&page_id, output.assets.len());
        let last = output.messages.len().checked_sub(1);
        match (navigation, last) {
            (Some(navigation), Some(last)) => match session.sent.get(&last).cloned() {
                Some(delivered) => {
                    let terminal = OutboundMessage {
                        format: self.chunker.dialect().format(),
                        ..OutboundMessage::plain(output.messages[last].clone())
                    }
                    .with_navigation(navigation.clone());
                    if let Err(e) = self.edit(recipient, &delivered.handle, &terminal).await {
                        warn!(stream_id = %session.stream_id, error = %e, "terminal edit failed, attaching navigation only");
                        if let Err(e) = self.attach_navigation(recipient, &delivered.handle, &navigation).await {
                            warn!(stream_id = %session.stream_id, error = %e, "could not attach navigation");
                        }
                    } else if let Some(d) = session.sent.get_mut(&last) {
                        d.text = Some(output.messages[last].clone());
                    }
                }
                None => {
                    warn!(stream_id = %session.stream_id, index = last, "last message was never delivered, skipping navigation");
                }
            },
            _ => debug!(stream_id = %session.stream_id, "no navigation to attach"),
        }

        Ok(StreamReport {
            stream_id: session.stream_id.clone(),
            page_id: Some(page_id),
            messages: session.sent.values().map(|d| d.handle.clone()).collect(),
            assets: output.assets,
            text: session.accumulated.clone(),
            empty: false,
            flushes: session.flushes,
            undelivered,
            fallback: output.fallback,
        })
    }

    async fn persist(&self, stream_id: &str, page_id: &str, text: &str, assets: &[CodeAsset]) {
        for asset in assets {
            if let Err(e) = self
                .store
                .save_asset(&asset.id, asset.bytes.clone(), &asset.metadata())
                .await
            {
                warn!(stream_id, asset_id = %asset.id, store = self.store.name(), error = %e, "failed to save asset");
            }
        }
        if let Err(e) = self.store.save_terminal_artifact(page_id, text, assets).await {
            warn!(stream_id, page_id, store = self.store.name(), error = %e, "failed to save terminal artifact");
        }
    }

    /// Buttons for the terminal message, or `None` when there is nothing to
    /// link to.
    fn navigation_for(&self, page_id: &str, asset_count: usize) -> Option<Navigation> {
        let mut buttons = Vec::new();
        if let Some(base) = &self.navigation.web_base_url {
            let link = format!("{}/answer/{}", base.as_str().trim_end_matches('/'), page_id);
            match url::Url::parse(&link) {
                Ok(url) => buttons.push(NavButton::url("Web View", url)),
                Err(e) => warn!(link = %link, error = %e, "invalid web view link"),
            }
        }
        if asset_count > 0 {
            buttons.push(NavButton::callback(
                format!("Assets ({})", asset_count),
                format!("assets_menu:{}", page_id),
            ));
        }
        if buttons.is_empty() {
            return None;
        }
        Some(Navigation {
            page_id: page_id.to_string(),
            buttons,
        })
    }

    /// Write the error into the anchor once, without retries.
    async fn report_error(&self, session: &StreamSession, recipient: &Recipient, err: &Error) {
        let Some(anchor) = session.anchor() else {
            return;
        };
        let notice = OutboundMessage::plain(err.user_message(self.cfg.error_text_limit));
        match self.channel.edit(recipient, anchor, &notice).await {
            Ok(_) | Err(Error::NotModified) => {}
            Err(e) => warn!(stream_id = %session.stream_id, error = %e, "could not write error into anchor"),
        }
    }

    async fn send(&self, recipient: &Recipient, message: &OutboundMessage) -> Result<MessageHandle> {
        let channel = &self.channel;
        match self
            .channel_exec
            .execute(Some(recipient), "send", || channel.send(recipient, message))
            .await?
        {
            CallOutcome::Completed(handle) => Ok(handle),
            CallOutcome::Unchanged => Err(Error::permanent_with_context(
                "channel reported an unchanged send",
                ErrorContext::new().with_source(channel.name()),
            )),
        }
    }

    async fn edit(&self, recipient: &Recipient, handle: &MessageHandle, message: &OutboundMessage) -> Result<()> {
        let channel = &self.channel;
        self.channel_exec
            .execute(Some(recipient), "edit", || channel.edit(recipient, handle, message))
            .await
            .map(|_| ())
    }

    async fn attach_navigation(
        &self,
        recipient: &Recipient,
        handle: &MessageHandle,
        navigation: &Navigation,
    ) -> Result<()> {
        let channel = &self.channel;
        self.channel_exec
            .execute(Some(recipient), "edit_navigation", || {
                channel.edit_navigation(recipient, handle, navigation)
            })
            .await
            .map(|_| ())
    }
}

/// 16 random bytes, URL-safe base64 without padding.
fn new_page_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}
