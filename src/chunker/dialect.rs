//! Channel formatting dialects.

use crate::types::TextFormat;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Characters MarkdownV2 requires escaping outside code.
const MARKDOWN_V2_SPECIAL: &str = "_*[]()~`>#+-=|{}.!\\";

/// Special characters the renderer never emits as markup; an unescaped one
/// is always a defect.
const NEVER_MARKUP: &str = "#+-=|{}.!";

const STAR1: &[char] = &['*'];
const STAR2: &[char] = &['*', '*'];
const UNDER1: &[char] = &['_'];
const UNDER2: &[char] = &['_', '_'];
const TILDE2: &[char] = &['~', '~'];
const TICK1: &[char] = &['`'];
const TICK3: &[char] = &['`', '`', '`'];
const CLOSE_BRACKET: &[char] = &[']'];

/// Delimiter sequences `render_inline` searches for.
const INDEXED: &[&[char]] = &[STAR1, STAR2, UNDER1, UNDER2, TILDE2, TICK1, TICK3, CLOSE_BRACKET];

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s+(.*)$").expect("static regex"));
static BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)[-*+]\s+(.*)$").expect("static regex"));
static NUMBERED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)(\d+)[.)]\s+(.*)$").expect("static regex"));
static QUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^>\s?(.*)$").expect("static regex"));
static RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:-{3,}|\*{3,}|_{3,})\s*$").expect("static regex"));

/// How a downstream channel wants text to be marked up.
pub trait ChannelDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wire format to declare when sending text produced by this dialect.
    fn format(&self) -> TextFormat;

    /// Escape arbitrary text so it renders literally.
    fn escape(&self, text: &str) -> String;

    /// Render a prose block (lightweight markdown) into the dialect.
    fn render_prose(&self, text: &str) -> Result<String>;

    /// Render a fenced code block.
    fn render_code(&self, code: &str, language: &str) -> String;

    /// Rendered size of `code` alone, in chars, once inside a fence.
    fn code_len(&self, code: &str) -> usize {
        code.chars().count()
    }

    /// Diagnostic scan of rendered output. Never blocks delivery.
    fn validate(&self, _rendered: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Telegram-style MarkdownV2.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownV2;

impl MarkdownV2 {
    fn escape_code(code: &str) -> String {
        let mut out = String::with_capacity(code.len());
        for c in code.chars() {
            if c == '`' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }

    fn escape_url(url: &str) -> String {
        let mut out = String::with_capacity(url.len());
        for c in url.chars() {
            if c == ')' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }

    fn render_line(&self, line: &str) -> String {
        if RULE.is_match(line) {
            return "———".to_string();
        }
        if let Some(caps) = HEADING.captures(line) {
            let plain = caps[1].replace("**", "").replace("__", "");
            return format!("*{}*", self.escape(plain.trim()));
        }
        if let Some(caps) = BULLET.captures(line) {
            return format!("{}• {}", &caps[1], render_inline(&caps[2]));
        }
        if let Some(caps) = NUMBERED.captures(line) {
            return format!("{}{}\\. {}", &caps[1], &caps[2], render_inline(&caps[3]));
        }
        if let Some(caps) = QUOTE.captures(line) {
            return format!(">{}", render_inline(&caps[1]));
        }
        render_inline(line)
    }
}

impl ChannelDialect for MarkdownV2 {
    fn name(&self) -> &'static str {
        "markdown_v2"
    }

    fn format(&self) -> TextFormat {
        TextFormat::MarkdownV2
    }

    fn escape(&self, text: &str) -> String {
        escape_markdown_v2(text)
    }

    fn render_prose(&self, text: &str) -> Result<String> {
        let lines: Vec<String> = text.lines().map(|l| self.render_line(l)).collect();
        Ok(lines.join("\n"))
    }

    fn render_code(&self, code: &str, language: &str) -> String {
        format!("```{}\n{}\n```", language, Self::escape_code(code))
    }

    fn code_len(&self, code: &str) -> usize {
        code.chars()
            .map(|c| if c == '`' || c == '\\' { 2 } else { 1 })
            .sum()
    }

    fn validate(&self, rendered: &str) -> Vec<String> {
        let mut issues = Vec::new();
        let mut in_block = false;
        let mut in_span = false;
        let mut escaped = false;
        let chars: Vec<char> = rendered.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if escaped {
                escaped = false;
                i += 1;
                continue;
            }
            if c == '\\' {
                escaped = true;
                i += 1;
                continue;
            }
            if c == '`' {
                if chars[i..].starts_with(TICK3) {
                    in_block = !in_block;
                    i += 3;
                } else {
                    if !in_block {
                        in_span = !in_span;
                    }
                    i += 1;
                }
                continue;
            }
            if !in_block && !in_span && c == ']' && chars.get(i + 1) == Some(&'(') {
                // Link targets only escape ')' and '\'.
                i += 2;
                while i < chars.len() && chars[i] != ')' {
                    i += if chars[i] == '\\' { 2 } else { 1 };
                }
                i += 1;
                continue;
            }
            if !in_block && !in_span && NEVER_MARKUP.contains(c) {
                issues.push(format!("Unescaped '{}' at position {}", c, i));
            }
            i += 1;
        }
        issues
    }
}

pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inline emphasis, code spans and links on a single line.
fn render_inline(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let index = InlineIndex::new(&chars);
    let mut out = String::with_capacity(line.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // Code span, single or triple backtick.
        if c == '`' {
            let fence = if chars[i..].starts_with(TICK3) { TICK3 } else { TICK1 };
            let ticks = fence.len();
            if let Some(end) = index.next(&chars, i + ticks, fence) {
                let body: String = chars[i + ticks..end].iter().collect();
                if !body.is_empty() {
                    out.push('`');
                    out.push_str(&MarkdownV2::escape_code(&body));
                    out.push('`');
                    i = end + ticks;
                    continue;
                }
            }
        }

        // Paired delimiters: bold, strikethrough, italic.
        let pair: Option<(&[char], &str)> = if chars[i..].starts_with(STAR2) {
            Some((STAR2, "*"))
        } else if chars[i..].starts_with(UNDER2) {
            Some((UNDER2, "*"))
        } else if chars[i..].starts_with(TILDE2) {
            Some((TILDE2, "~"))
        } else if c == '*' || c == '_' {
            let opens = chars.get(i + 1).is_some_and(|n| !n.is_whitespace())
                && (c == '*' || i == 0 || !chars[i - 1].is_alphanumeric());
            match (opens, c) {
                (true, '*') => Some((STAR1, "_")),
                (true, _) => Some((UNDER1, "_")),
                _ => None,
            }
        } else {
            None
        };

        if let Some((delim, marker)) = pair {
            let start = i + delim.len();
            if let Some(end) = index.next(&chars, start, delim) {
                let closes = end > start
                    && (delim != UNDER1
                        || chars.get(end + 1).map_or(true, |n| !n.is_alphanumeric()));
                if closes {
                    let inner: String = chars[start..end].iter().collect();
                    out.push_str(marker);
                    out.push_str(&render_inline(&inner));
                    out.push_str(marker);
                    i = end + delim.len();
                    continue;
                }
            }
        }

        // Link: [text](url)
        if c == '[' {
            if let Some(close) = index.next(&chars, i + 1, CLOSE_BRACKET) {
                if chars.get(close + 1) == Some(&'(') {
                    if let Some(paren) = index.closing_paren(close + 1) {
                        let text: String = chars[i + 1..close].iter().collect();
                        let url: String = chars[close + 2..paren].iter().collect();
                        out.push('[');
                        out.push_str(&render_inline(&text));
                        out.push_str("](");
                        out.push_str(&MarkdownV2::escape_url(&url));
                        out.push(')');
                        i = paren + 1;
                        continue;
                    }
                }
            }
        }

        if MARKDOWN_V2_SPECIAL.contains(c) {
            out.push('\\');
        }
        out.push(c);
        i += 1;
    }

    out
}

/// Start positions of every delimiter sequence in one line, plus matching
/// parentheses, so each lookup is a binary search instead of a scan.
struct InlineIndex {
    starts: Vec<(&'static [char], Vec<usize>)>,
    parens: HashMap<usize, usize>,
}

impl InlineIndex {
    fn new(chars: &[char]) -> Self {
        let starts = INDEXED
            .iter()
            .map(|seq| {
                let positions = (0..chars.len())
                    .filter(|&j| chars[j..].starts_with(seq))
                    .collect();
                (*seq, positions)
            })
            .collect();

        let mut parens = HashMap::new();
        let mut open = Vec::new();
        for (j, c) in chars.iter().enumerate() {
            match c {
                '(' => open.push(j),
                ')' => {
                    if let Some(start) = open.pop() {
                        parens.insert(start, j);
                    }
                }
                _ => {}
            }
        }

        Self { starts, parens }
    }

    /// First start of `seq` at or after `from`.
    fn next(&self, chars: &[char], from: usize, seq: &[char]) -> Option<usize> {
        match self.starts.iter().find(|(s, _)| *s == seq) {
            Some((_, positions)) => {
                let k = positions.partition_point(|&p| p < from);
                positions.get(k).copied()
            }
            None => find_seq(chars, from, seq),
        }
    }

    /// The `)` balancing the `(` at `open`.
    fn closing_paren(&self, open: usize) -> Option<usize> {
        self.parens.get(&open).copied()
    }
}

fn find_seq(chars: &[char], from: usize, seq: &[char]) -> Option<usize> {
    if seq.is_empty() || from > chars.len() {
        return None;
    }
    (from..=chars.len().saturating_sub(seq.len())).find(|&j| chars[j..].starts_with(seq))
}

/// Plain text: no markup, nothing to escape.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl ChannelDialect for PlainText {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn format(&self) -> TextFormat {
        TextFormat::Plain
    }

    fn escape(&self, text: &str) -> String {
        text.to_string()
    }

    fn render_prose(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    fn render_code(&self, code: &str, language: &str) -> String {
        format!("```{}\n{}\n```", language, code)
    }
}
