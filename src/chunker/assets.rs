//! Code-to-asset promotion and line-boundary splitting.

use super::dialect::ChannelDialect;
use crate::types::CodeAsset;
use bytes::Bytes;
use once_cell::sync::Lazy;
use std::collections::HashMap;

static EXTENSION_TO_LANGUAGE: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("py", "python"),
        ("js", "javascript"),
        ("ts", "typescript"),
        ("jsx", "javascript"),
        ("tsx", "typescript"),
        ("java", "java"),
        ("kt", "kotlin"),
        ("kts", "kotlin"),
        ("swift", "swift"),
        ("c", "c"),
        ("cpp", "cpp"),
        ("cc", "cpp"),
        ("cxx", "cpp"),
        ("h", "c"),
        ("hpp", "cpp"),
        ("cs", "csharp"),
        ("php", "php"),
        ("rb", "ruby"),
        ("go", "go"),
        ("rs", "rust"),
        ("sh", "bash"),
        ("bash", "bash"),
        ("zsh", "bash"),
        ("html", "html"),
        ("htm", "html"),
        ("css", "css"),
        ("scss", "scss"),
        ("sass", "sass"),
        ("less", "less"),
        ("json", "json"),
        ("xml", "xml"),
        ("yaml", "yaml"),
        ("yml", "yaml"),
        ("toml", "toml"),
        ("sql", "sql"),
        ("md", "markdown"),
        ("markdown", "markdown"),
        ("tex", "latex"),
        ("bat", "batch"),
        ("ps1", "powershell"),
        ("dockerfile", "dockerfile"),
        ("r", "r"),
        ("lua", "lua"),
        ("perl", "perl"),
        ("pl", "perl"),
    ])
});

/// Preferred file extension for a fence language tag.
static LANGUAGE_TO_EXTENSION: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("python", "py"),
        ("py", "py"),
        ("javascript", "js"),
        ("js", "js"),
        ("typescript", "ts"),
        ("ts", "ts"),
        ("jsx", "jsx"),
        ("tsx", "tsx"),
        ("kotlin", "kt"),
        ("csharp", "cs"),
        ("c#", "cs"),
        ("c++", "cpp"),
        ("ruby", "rb"),
        ("golang", "go"),
        ("rust", "rs"),
        ("bash", "sh"),
        ("shell", "sh"),
        ("sh", "sh"),
        ("zsh", "zsh"),
        ("markdown", "md"),
        ("latex", "tex"),
        ("batch", "bat"),
        ("powershell", "ps1"),
        ("perl", "pl"),
        ("text", "txt"),
        ("plaintext", "txt"),
    ])
});

/// Language tag for a file extension; unknown extensions map to themselves.
pub fn extension_to_language(ext: &str) -> String {
    let ext = ext.to_lowercase();
    EXTENSION_TO_LANGUAGE
        .get(ext.as_str())
        .map(|l| (*l).to_string())
        .unwrap_or(ext)
}

/// File extension for a fence language tag; untagged code is `txt`.
pub fn language_to_extension(language: Option<&str>) -> String {
    match language.map(str::to_lowercase) {
        None => "txt".to_string(),
        Some(lang) if lang.is_empty() => "txt".to_string(),
        Some(lang) => LANGUAGE_TO_EXTENSION
            .get(lang.as_str())
            .map(|e| (*e).to_string())
            .unwrap_or(lang),
    }
}

/// Names assets within one chunk pass: a running per-extension counter and
/// a global total.
#[derive(Debug, Default)]
pub struct AssetNamer {
    per_extension: HashMap<String, usize>,
    total: usize,
}

impl AssetNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(asset_id, filename, language)`.
    pub fn next(&mut self, fence_language: Option<&str>) -> (String, String, String) {
        let ext = language_to_extension(fence_language);
        let language = extension_to_language(&ext);
        let n = self.per_extension.entry(ext.clone()).or_insert(0);
        *n += 1;
        self.total += 1;
        (
            format!("asset_{}", self.total),
            format!("{}_code_{}.{}", language, n, ext),
            language,
        )
    }
}

/// Split `code` at line boundaries into the fewest contiguous chunks whose
/// rendered size stays within `budget`. A single line over budget becomes a
/// chunk of its own; lines are never cut.
pub fn split_lines<'a>(code: &'a str, budget: usize, dialect: &dyn ChannelDialect) -> Vec<&'a str> {
    if dialect.code_len(code) <= budget {
        return vec![code];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut size = 0usize;
    let mut offset = 0usize;
    let mut has_lines = false;

    for line in code.split('\n') {
        let line_size = dialect.code_len(line) + 1;
        if has_lines && size + line_size > budget {
            // Drop the newline that separated the previous chunk from this line.
            chunks.push(&code[start..offset - 1]);
            start = offset;
            size = 0;
        }
        size += line_size;
        has_lines = true;
        offset += line.len() + 1;
    }
    chunks.push(&code[start..]);
    chunks
}

/// Promote one fenced block: build its asset and one fenced rendering per
/// chunk.
pub fn promote(
    namer: &mut AssetNamer,
    fence_language: Option<&str>,
    code: &str,
    max_message_len: usize,
    safety_margin: usize,
    dialect: &dyn ChannelDialect,
) -> (CodeAsset, Vec<String>) {
    let (id, filename, language) = namer.next(fence_language);
    let overhead = dialect.render_code("", &language).chars().count();
    let budget = max_message_len
        .saturating_sub(overhead)
        .saturating_sub(safety_margin)
        .max(1);

    let chunks = split_lines(code, budget, dialect);
    if chunks.len() > 1 {
        tracing::info!(
            asset = %id,
            code_len = code.chars().count(),
            budget,
            chunks = chunks.len(),
            "code block exceeds budget, splitting"
        );
    }
    let renderings = chunks
        .iter()
        .map(|chunk| dialect.render_code(chunk, &language))
        .collect();

    let asset = CodeAsset::new(id, filename, language, Bytes::from(code.to_string()));
    (asset, renderings)
}
