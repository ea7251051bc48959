//! 生成服务模块：上游文本生成的抽象接口。
//!
//! # Generation Source
//!
//! The upstream generation service is an external collaborator. It turns a
//! request into a lazy, finite stream of text fragments. Zero fragments is a
//! valid outcome (reported as an empty response by the accumulator).

use crate::types::Attachment;
use crate::{BoxStream, Error, Result};
use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};

/// Lazy sequence of text fragments; an `Err` item aborts the stream.
pub type FragmentStream = BoxStream<'static, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl GenerationRequest {
    pub fn new(conversation_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            prompt: prompt.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[async_trait]
pub trait GenerationSource: Send + Sync {
    /// Start a generation. Failing here (before any fragment) is retried by
    /// the generation-scope executor.
    async fn generate(&self, request: &GenerationRequest) -> Result<FragmentStream>;

    fn name(&self) -> &'static str {
        "generation"
    }
}

/// Replays a fixed fragment list, optionally ending with an error.
#[derive(Debug, Clone, Default)]
pub struct FragmentsSource {
    fragments: Vec<String>,
    fail_with: Option<String>,
}

impl FragmentsSource {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            fail_with: None,
        }
    }

    /// End the stream with a transient error after the last fragment.
    pub fn failing_after(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }
}

#[async_trait]
impl GenerationSource for FragmentsSource {
    async fn generate(&self, _request: &GenerationRequest) -> Result<FragmentStream> {
        let mut items: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        if let Some(msg) = &self.fail_with {
            items.push(Err(Error::transient(msg.clone())));
        }
        Ok(Box::pin(stream::iter(items)))
    }

    fn name(&self) -> &'static str {
        "fragments"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_fragments_source_replays_in_order() {
        let src = FragmentsSource::new(["Hello ", "World"]);
        let req = GenerationRequest::new("conv-1", "hi");
        let out: Vec<String> = src
            .generate(&req)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["Hello ".to_string(), "World".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_source_ends_with_error() {
        let src = FragmentsSource::new(["a"]).failing_after("connection reset");
        let mut s = src.generate(&GenerationRequest::default()).await.unwrap();
        assert_eq!(s.next().await.unwrap().unwrap(), "a");
        assert!(s.next().await.unwrap().is_err());
        assert!(s.next().await.is_none());
    }
}
