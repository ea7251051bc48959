//! 结构化文本分块模块：把富文本（正文、代码、数学记号）切成受长度约束的消息与代码附件。
//!
//! # Structured-Text Chunker
//!
//! Converts raw model output into an ordered list of outbound messages, each
//! within the channel's size limit, plus the code assets promoted out of it.
//!
//! ## Pipeline
//!
//! 1. Code spans and blocks are shielded while math notation is normalized
//!    ([`notation`]); shielded regions come back byte-identical.
//! 2. The text is decomposed into prose and fenced-code blocks ([`blocks`]).
//! 3. Large code blocks become [`CodeAsset`]s, split on line boundaries when
//!    their fenced rendering would not fit one message ([`assets`]).
//! 4. Prose is rendered in the channel dialect ([`dialect`]).
//! 5. Rendered parts are greedily merged into messages, joined by a blank line.
//! 6. Messages are scanned for dialect problems; issues are logged only.
//!
//! Any failure in steps 1-5 falls back to escaping the raw input and cutting
//! it into fixed windows. [`Chunker::chunk`] never fails.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Chunker`] | Runs the pipeline and the fallback |
//! | [`ChunkerConfig`] | Message limits and code promotion threshold |
//! | [`ChannelDialect`] | Escaping and markup rules of a channel |

pub mod assets;
pub mod blocks;
pub mod dialect;
pub mod notation;

pub use dialect::{ChannelDialect, MarkdownV2, PlainText};

use crate::types::{CodeAsset, Segment};
use crate::Result;
use blocks::Block;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Max issues logged per message by the validation pass.
const MAX_LOGGED_ISSUES: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Hard per-message limit of the channel, in chars.
    pub max_message_len: usize,
    /// Window size for plain-text fallback splitting and long prose.
    pub safe_message_len: usize,
    /// Chars kept free in a message holding a code chunk.
    pub safety_margin: usize,
    /// Fenced blocks at least this long are promoted to assets; shorter ones
    /// stay inline.
    pub promote_code_min_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_message_len: 4096,
            safe_message_len: 4000,
            safety_margin: 100,
            promote_code_min_chars: 200,
        }
    }
}

impl ChunkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_message_len(mut self, len: usize) -> Self {
        self.max_message_len = len;
        self
    }

    pub fn with_safe_message_len(mut self, len: usize) -> Self {
        self.safe_message_len = len;
        self
    }

    pub fn with_safety_margin(mut self, margin: usize) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn with_promote_code_min_chars(mut self, chars: usize) -> Self {
        self.promote_code_min_chars = chars;
        self
    }

    /// Room left for code in one message once the fence for `language` and
    /// the safety margin are accounted for.
    pub fn code_budget(&self, language: &str) -> usize {
        let fence = language.chars().count() + "```\n\n```".len();
        self.max_message_len
            .saturating_sub(fence)
            .saturating_sub(self.safety_margin)
    }
}

/// Messages and assets for one chunk pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkOutput {
    pub messages: Vec<String>,
    pub assets: Vec<CodeAsset>,
    /// True when the plain-text fallback produced `messages`.
    pub fallback: bool,
}

impl ChunkOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Structured-text chunker bound to one channel dialect.
#[derive(Clone)]
pub struct Chunker {
    cfg: ChunkerConfig,
    dialect: Arc<dyn ChannelDialect>,
}

impl Chunker {
    pub fn new(cfg: ChunkerConfig) -> Self {
        Self::with_dialect(cfg, Arc::new(MarkdownV2))
    }

    pub fn with_dialect(cfg: ChunkerConfig, dialect: Arc<dyn ChannelDialect>) -> Self {
        Self { cfg, dialect }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.cfg
    }

    pub fn dialect(&self) -> &dyn ChannelDialect {
        self.dialect.as_ref()
    }

    /// Chunk `raw` into outbound messages. Never fails.
    pub fn chunk(&self, raw: &str) -> ChunkOutput {
        match self.try_chunk(raw) {
            Ok(out) => out,
            Err(e) => {
                error!(error = %e, dialect = self.dialect.name(), "formatting failed, using plain-text fallback");
                ChunkOutput {
                    messages: self.fallback(raw),
                    assets: Vec::new(),
                    fallback: true,
                }
            }
        }
    }

    fn try_chunk(&self, raw: &str) -> Result<ChunkOutput> {
        let normalized = notation::normalize_math(raw)?;
        let segments = self.segments(&normalized)?;

        let mut assets = Vec::new();
        let mut parts: Vec<&str> = Vec::new();
        for segment in &segments {
            parts.extend(segment.parts());
            if let Segment::Code { asset, .. } = segment {
                assets.push(asset.clone());
            }
        }

        let messages = self.merge(&parts);
        debug!(
            segments = segments.len(),
            assets = assets.len(),
            messages = messages.len(),
            "chunked response"
        );
        self.validate(&messages);

        Ok(ChunkOutput {
            messages,
            assets,
            fallback: false,
        })
    }

    /// Structural decomposition plus rendering, in output order.
    pub fn segments(&self, normalized: &str) -> Result<Vec<Segment>> {
        let mut namer = assets::AssetNamer::new();
        let mut segments = Vec::new();

        for block in blocks::decompose(normalized) {
            match block {
                Block::Prose(text) => {
                    let rendered = self.dialect.render_prose(&text)?;
                    for piece in split_rendered(&rendered, self.cfg.safe_message_len) {
                        segments.push(Segment::text(piece));
                    }
                }
                Block::Code { language, code, .. } => {
                    let code_len = code.chars().count();
                    let lang = language.as_deref();
                    if code_len >= self.cfg.promote_code_min_chars
                        || code_len > self.cfg.code_budget(lang.unwrap_or(""))
                    {
                        let (asset, renderings) = assets::promote(
                            &mut namer,
                            lang,
                            &code,
                            self.cfg.max_message_len,
                            self.cfg.safety_margin,
                            self.dialect.as_ref(),
                        );
                        segments.push(Segment::Code { asset, renderings });
                    } else if !code.trim().is_empty() {
                        segments.push(Segment::text(
                            self.dialect.render_code(&code, lang.unwrap_or("")),
                        ));
                    }
                }
            }
        }
        Ok(segments)
    }

    /// Greedy merge of rendered parts into messages joined by a blank line.
    pub fn merge(&self, parts: &[&str]) -> Vec<String> {
        let max = self.cfg.max_message_len;
        let mut messages = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for part in parts.iter().filter(|p| !p.is_empty()) {
            let part_len = part.chars().count();
            if part_len > max {
                warn!(part_len, max, "part exceeds message limit, sending as its own message");
                if !current.is_empty() {
                    messages.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                messages.push((*part).to_string());
                continue;
            }
            if current.is_empty() {
                current.push_str(part);
                current_len = part_len;
            } else if current_len + 2 + part_len <= max {
                current.push_str("\n\n");
                current.push_str(part);
                current_len += 2 + part_len;
            } else {
                messages.push(std::mem::replace(&mut current, (*part).to_string()));
                current_len = part_len;
            }
        }
        if !current.is_empty() {
            messages.push(current);
        }
        messages
    }

    fn validate(&self, messages: &[String]) {
        for (i, msg) in messages.iter().enumerate() {
            let len = msg.chars().count();
            if len > self.cfg.max_message_len {
                warn!(index = i + 1, len, "message exceeds limit");
            }
            let issues = self.dialect.validate(msg);
            for issue in issues.iter().take(MAX_LOGGED_ISSUES) {
                warn!(index = i + 1, dialect = self.dialect.name(), %issue, "formatting issue");
            }
        }
    }

    /// Escape `raw` literally and cut it into windows. Never fails.
    pub fn fallback(&self, raw: &str) -> Vec<String> {
        let escaped = self.dialect.escape(raw);
        if escaped.is_empty() {
            return Vec::new();
        }
        if escaped.chars().count() <= self.cfg.max_message_len {
            return vec![escaped];
        }
        let chars: Vec<char> = escaped.chars().collect();
        hard_windows(&chars, self.cfg.safe_message_len)
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

/// Cut rendered prose into pieces of at most `limit` chars, preferring line
/// breaks and never separating an escape from the char it escapes.
fn split_rendered(rendered: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(2);
    if rendered.chars().count() <= limit {
        return vec![rendered.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in rendered.split('\n') {
        let line_len = line.chars().count();
        let sep = usize::from(!current.is_empty());
        if current_len + sep + line_len <= limit {
            if sep == 1 {
                current.push('\n');
            }
            current.push_str(line);
            current_len += sep + line_len;
            continue;
        }
        if !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= limit {
            current.push_str(line);
            current_len = line_len;
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let mut windows = hard_windows(&chars, limit);
        if let Some(last) = windows.pop() {
            current_len = last.chars().count();
            current = last;
        }
        pieces.extend(windows);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Cut `chars` into windows of at most `limit` chars, moving a cut back one
/// char when it would strand a `\` from the char it escapes.
fn hard_windows(chars: &[char], limit: usize) -> Vec<String> {
    let limit = limit.max(2);
    let mut windows = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + limit).min(chars.len());
        if end < chars.len() && ends_with_open_escape(&chars[start..end]) {
            end -= 1;
        }
        windows.push(chars[start..end].iter().collect());
        start = end;
    }
    windows
}

fn ends_with_open_escape(chars: &[char]) -> bool {
    chars.iter().rev().take_while(|c| **c == '\\').count() % 2 == 1
}
