//! 突发去抖模块：把短时间内成组到达的上传合并为一个逻辑单元。
//!
//! # Burst Debouncer
//!
//! Multi-part uploads (e.g. an album of photos) arrive as separate inputs in a
//! quick burst. The debouncer buffers them per group key and hands the whole
//! group to a callback once no new item has arrived for the quiet period.
//!
//! - Every new item cancels the group's pending timer and starts a new one,
//!   so each group has at most one live timer
//! - The first non-empty caption wins and its input becomes the anchor
//! - A flushed key is removed before the callback runs; a later item with the
//!   same key starts a fresh group
//! - A timer that finds its group gone or superseded does nothing

use crate::config::duration_ms;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    #[serde(rename = "quiet_period_ms", with = "duration_ms")]
    pub quiet_period: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(1500),
        }
    }
}

impl DebounceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }
}

/// A completed group handed to the flush callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstBatch<T, A> {
    pub key: String,
    pub items: Vec<T>,
    pub caption: Option<String>,
    /// The captioned input if any, otherwise the first one.
    pub anchor: A,
}

struct BurstBuffer<T, A> {
    items: Vec<T>,
    caption: Option<String>,
    anchor: A,
    generation: u64,
    timer: CancellationToken,
}

impl<T, A> BurstBuffer<T, A> {
    fn into_batch(self, key: String) -> BurstBatch<T, A> {
        BurstBatch {
            key,
            items: self.items,
            caption: self.caption,
            anchor: self.anchor,
        }
    }
}

type FlushFn<T, A> = Arc<dyn Fn(BurstBatch<T, A>) -> BoxFuture<'static, ()> + Send + Sync>;
type Groups<T, A> = Arc<Mutex<HashMap<String, BurstBuffer<T, A>>>>;

pub struct BurstDebouncer<T, A> {
    cfg: DebounceConfig,
    groups: Groups<T, A>,
    /// Timer generations are unique across groups, so a timer can never
    /// flush a later group that reuses its key.
    generations: Arc<AtomicU64>,
    on_flush: FlushFn<T, A>,
}

impl<T, A> Clone for BurstDebouncer<T, A> {
    fn clone(&self) -> Self {
        Self {
            cfg: self.cfg.clone(),
            groups: Arc::clone(&self.groups),
            generations: Arc::clone(&self.generations),
            on_flush: Arc::clone(&self.on_flush),
        }
    }
}

fn lock<T, A>(groups: &Groups<T, A>) -> MutexGuard<'_, HashMap<String, BurstBuffer<T, A>>> {
    groups.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T, A> BurstDebouncer<T, A>
where
    T: Send + 'static,
    A: Send + 'static,
{
    pub fn new<F, Fut>(cfg: DebounceConfig, on_flush: F) -> Self
    where
        F: Fn(BurstBatch<T, A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            cfg,
            groups: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            on_flush: Arc::new(move |batch| on_flush(batch).boxed()),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.cfg
    }

    /// Buffer `item` under `key` and restart the group's quiet-period timer.
    /// Returns the number of items now buffered for the group.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_item(&self, key: &str, anchor: A, item: T, caption: Option<String>) -> usize {
        let caption = caption.filter(|c| !c.trim().is_empty());
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();

        let count = {
            let mut groups = lock(&self.groups);
            match groups.get_mut(key) {
                Some(buffer) => {
                    buffer.items.push(item);
                    if buffer.caption.is_none() && caption.is_some() {
                        buffer.caption = caption;
                        buffer.anchor = anchor;
                    }
                    buffer.timer.cancel();
                    buffer.timer = token.clone();
                    buffer.generation = generation;
                    buffer.items.len()
                }
                None => {
                    groups.insert(
                        key.to_owned(),
                        BurstBuffer {
                            items: vec![item],
                            caption,
                            anchor,
                            generation,
                            timer: token.clone(),
                        },
                    );
                    1
                }
            }
        };
        self.spawn_timer(key.to_owned(), generation, token);
        count
    }

    fn spawn_timer(&self, key: String, generation: u64, token: CancellationToken) {
        let groups = Arc::clone(&self.groups);
        let on_flush = Arc::clone(&self.on_flush);
        let quiet = self.cfg.quiet_period;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(quiet) => {
                    let batch = {
                        let mut groups = lock(&groups);
                        match groups.get(&key) {
                            Some(buffer) if buffer.generation == generation => groups
                                .remove(&key)
                                .map(|buffer| buffer.into_batch(key.clone())),
                            _ => None,
                        }
                    };
                    if let Some(batch) = batch {
                        debug!(key = %batch.key, items = batch.items.len(), "burst group complete");
                        on_flush(batch).await;
                    }
                }
            }
        });
    }

    /// Flush `key` now instead of waiting for its timer.
    /// Returns false when no group was pending.
    pub async fn finalize_now(&self, key: &str) -> bool {
        let batch = {
            let mut groups = lock(&self.groups);
            groups.remove(key).map(|buffer| {
                buffer.timer.cancel();
                buffer.into_batch(key.to_owned())
            })
        };
        match batch {
            Some(batch) => {
                (self.on_flush)(batch).await;
                true
            }
            None => false,
        }
    }

    /// Drop a pending group without flushing it. Returns the discarded items.
    pub fn cancel(&self, key: &str) -> Vec<T> {
        let removed = lock(&self.groups).remove(key);
        match removed {
            Some(buffer) => {
                buffer.timer.cancel();
                debug!(key, items = buffer.items.len(), "burst group cancelled");
                buffer.items
            }
            None => Vec::new(),
        }
    }

    pub fn pending_groups(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.groups).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn pending_items(&self, key: &str) -> usize {
        lock(&self.groups).get(key).map_or(0, |b| b.items.len())
    }
}
