//! Structural decomposition into prose and fenced-code blocks.

/// One structural unit of the normalized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Prose(String),
    Code {
        /// Info-string language tag, if any.
        language: Option<String>,
        code: String,
        /// False for a fence still open at end of input (mid-stream).
        closed: bool,
    },
}

fn fence_open(line: &str) -> Option<Option<String>> {
    let rest = line.trim_start().strip_prefix("```")?;
    if rest.contains("```") {
        return None;
    }
    let tag = rest.split_whitespace().next().map(str::to_lowercase);
    Some(tag.filter(|t| !t.is_empty()))
}

fn fence_close(line: &str) -> bool {
    line.trim() == "```"
}

/// Split `text` on fenced code blocks. Prose between fences is trimmed of
/// surrounding blank lines and runs of 3+ newlines are collapsed; empty
/// prose is dropped. Code content is kept byte-for-byte.
pub fn decompose(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut lines = text.split('\n');

    while let Some(line) = lines.next() {
        let Some(language) = fence_open(line) else {
            prose.push(line);
            continue;
        };
        flush_prose(&mut blocks, &mut prose);

        let mut code: Vec<&str> = Vec::new();
        let mut closed = false;
        for inner in lines.by_ref() {
            if fence_close(inner) {
                closed = true;
                break;
            }
            code.push(inner);
        }
        blocks.push(Block::Code {
            language,
            code: code.join("\n"),
            closed,
        });
    }
    flush_prose(&mut blocks, &mut prose);
    blocks
}

fn flush_prose(blocks: &mut Vec<Block>, prose: &mut Vec<&str>) {
    if prose.is_empty() {
        return;
    }
    let mut out: Vec<&str> = Vec::with_capacity(prose.len());
    let mut blank_run = 0;
    for line in prose.drain(..) {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push("");
        } else {
            blank_run = 0;
            out.push(line.trim_end());
        }
    }
    let joined = out.join("\n");
    let trimmed = joined.trim_matches('\n');
    if !trimmed.trim().is_empty() {
        blocks.push(Block::Prose(trimmed.to_string()));
    }
}
