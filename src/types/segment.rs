//! Chunker output types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Code promoted out of inline text. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAsset {
    /// `asset_<n>` where n is the running total of assets in one chunk pass.
    pub id: String,
    /// `<language>_code_<k>.<ext>` with k counted per extension.
    pub filename: String,
    pub language: String,
    pub bytes: Bytes,
    /// Size in bytes.
    pub size: usize,
}

impl CodeAsset {
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        language: impl Into<String>,
        bytes: Bytes,
    ) -> Self {
        let size = bytes.len();
        Self {
            id: id.into(),
            filename: filename.into(),
            language: language.into(),
            bytes,
            size,
        }
    }

    pub fn metadata(&self) -> AssetMetadata {
        AssetMetadata {
            filename: self.filename.clone(),
            language: self.language.clone(),
            size: self.size,
        }
    }
}

/// Descriptive metadata stored next to an asset's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub filename: String,
    pub language: String,
    pub size: usize,
}

/// One size-bounded unit of outbound content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Already rendered in the channel dialect.
    Text { content: String },
    /// A promoted asset plus its fenced renderings (one per chunk).
    Code {
        asset: CodeAsset,
        renderings: Vec<String>,
    },
}

impl Segment {
    pub fn text(content: impl Into<String>) -> Self {
        Segment::Text {
            content: content.into(),
        }
    }

    /// Rendered parts in output order.
    pub fn parts(&self) -> Vec<&str> {
        match self {
            Segment::Text { content } => vec![content.as_str()],
            Segment::Code { renderings, .. } => renderings.iter().map(String::as_str).collect(),
        }
    }
}
