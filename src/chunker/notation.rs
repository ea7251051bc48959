//! Math notation normalization.
//!
//! Display math (`$$…$$`) becomes bold, inline math (`$…$`) becomes italic,
//! and the TeX inside is flattened to Unicode. Code spans and blocks are
//! shielded behind placeholders for the whole pass and restored verbatim.

use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

const OPEN: char = '\u{E000}';
const CLOSE: char = '\u{E001}';

static VERBATIM: Lazy<Regex> = Lazy::new(|| {
    // Closed fences, a trailing fence still being streamed, inline spans.
    Regex::new(r"```[\s\S]*?```|```[\s\S]*\z|`[^`\n]+`").expect("static regex")
});
static DISPLAY_MATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\$\$(.*?)\$\$").expect("static regex"));
static INLINE_MATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([^$\n]+?)\$").expect("static regex"));
static MACRO: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\([a-zA-Z]+)").expect("static regex"));
static FRACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\frac\{([^}]+)\}\{([^}]+)\}").expect("static regex"));
static SUPERSCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\^\{([^}]+)\}|\^([a-zA-Z0-9])").expect("static regex"));
static SUBSCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_\{([^}]+)\}|_([a-zA-Z0-9])").expect("static regex"));
static MACRO_WITH_ARG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[a-zA-Z]+\{([^}]*)\}").expect("static regex"));
static BARE_MACRO: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[a-zA-Z]+").expect("static regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

static SYMBOLS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // Greek, lowercase
        ("alpha", "α"),
        ("beta", "β"),
        ("gamma", "γ"),
        ("delta", "δ"),
        ("epsilon", "ε"),
        ("zeta", "ζ"),
        ("eta", "η"),
        ("theta", "θ"),
        ("iota", "ι"),
        ("kappa", "κ"),
        ("lambda", "λ"),
        ("mu", "μ"),
        ("nu", "ν"),
        ("xi", "ξ"),
        ("pi", "π"),
        ("rho", "ρ"),
        ("sigma", "σ"),
        ("tau", "τ"),
        ("upsilon", "υ"),
        ("phi", "φ"),
        ("chi", "χ"),
        ("psi", "ψ"),
        ("omega", "ω"),
        // Greek, uppercase
        ("Gamma", "Γ"),
        ("Delta", "Δ"),
        ("Theta", "Θ"),
        ("Lambda", "Λ"),
        ("Xi", "Ξ"),
        ("Pi", "Π"),
        ("Sigma", "Σ"),
        ("Upsilon", "Υ"),
        ("Phi", "Φ"),
        ("Psi", "Ψ"),
        ("Omega", "Ω"),
        // Arrows
        ("rightarrow", "→"),
        ("leftarrow", "←"),
        ("uparrow", "↑"),
        ("downarrow", "↓"),
        ("Rightarrow", "⇒"),
        ("Leftarrow", "⇐"),
        ("Uparrow", "⇑"),
        ("Downarrow", "⇓"),
        ("leftrightarrow", "↔"),
        ("Leftrightarrow", "⇔"),
        ("to", "→"),
        // Operators and relations
        ("partial", "∂"),
        ("infty", "∞"),
        ("pm", "±"),
        ("mp", "∓"),
        ("times", "×"),
        ("div", "÷"),
        ("cdot", "·"),
        ("ast", "∗"),
        ("leq", "≤"),
        ("le", "≤"),
        ("geq", "≥"),
        ("ge", "≥"),
        ("neq", "≠"),
        ("ne", "≠"),
        ("approx", "≈"),
        ("equiv", "≡"),
        ("sim", "∼"),
        ("simeq", "≃"),
        ("propto", "∝"),
        // Sets
        ("subset", "⊂"),
        ("supset", "⊃"),
        ("subseteq", "⊆"),
        ("supseteq", "⊇"),
        ("in", "∈"),
        ("notin", "∉"),
        ("ni", "∋"),
        ("emptyset", "∅"),
        ("cup", "∪"),
        ("cap", "∩"),
        // Logic
        ("forall", "∀"),
        ("exists", "∃"),
        ("nexists", "∄"),
        ("therefore", "∴"),
        ("because", "∵"),
        ("land", "∧"),
        ("lor", "∨"),
        ("lnot", "¬"),
        ("neg", "¬"),
        // Calculus
        ("nabla", "∇"),
        ("sum", "∑"),
        ("prod", "∏"),
        ("int", "∫"),
        ("oint", "∮"),
        ("iint", "∬"),
        ("iiint", "∭"),
        // Misc
        ("sqrt", "√"),
        ("angle", "∠"),
        ("perp", "⊥"),
        ("parallel", "∥"),
        ("degree", "°"),
        ("prime", "′"),
        ("hbar", "ℏ"),
        ("ell", "ℓ"),
        ("Re", "ℜ"),
        ("Im", "ℑ"),
        ("aleph", "ℵ"),
    ])
});

fn superscript(c: char) -> char {
    match c {
        '0' => '⁰',
        '1' => '¹',
        '2' => '²',
        '3' => '³',
        '4' => '⁴',
        '5' => '⁵',
        '6' => '⁶',
        '7' => '⁷',
        '8' => '⁸',
        '9' => '⁹',
        '+' => '⁺',
        '-' => '⁻',
        '=' => '⁼',
        '(' => '⁽',
        ')' => '⁾',
        'n' => 'ⁿ',
        'i' => 'ⁱ',
        other => other,
    }
}

fn subscript(c: char) -> char {
    match c {
        '0' => '₀',
        '1' => '₁',
        '2' => '₂',
        '3' => '₃',
        '4' => '₄',
        '5' => '₅',
        '6' => '₆',
        '7' => '₇',
        '8' => '₈',
        '9' => '₉',
        '+' => '₊',
        '-' => '₋',
        '=' => '₌',
        '(' => '₍',
        ')' => '₎',
        'a' => 'ₐ',
        'e' => 'ₑ',
        'i' => 'ᵢ',
        'o' => 'ₒ',
        'r' => 'ᵣ',
        'u' => 'ᵤ',
        'v' => 'ᵥ',
        'x' => 'ₓ',
        other => other,
    }
}

fn map_script(caps: &Captures<'_>, map: fn(char) -> char) -> String {
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().chars().map(map).collect())
        .unwrap_or_default()
}

/// Flatten a TeX fragment into Unicode text.
pub fn latex_to_unicode(latex: &str) -> String {
    let text = MACRO.replace_all(latex.trim(), |caps: &Captures<'_>| {
        match SYMBOLS.get(&caps[1]) {
            Some(symbol) => (*symbol).to_string(),
            None => caps[0].to_string(),
        }
    });
    let text = FRACTION.replace_all(&text, "(${1})/(${2})");
    let text = SUPERSCRIPT.replace_all(&text, |caps: &Captures<'_>| map_script(caps, superscript));
    let text = SUBSCRIPT.replace_all(&text, |caps: &Captures<'_>| map_script(caps, subscript));
    let text = MACRO_WITH_ARG.replace_all(&text, "${1}");
    let text = BARE_MACRO.replace_all(&text, "");
    let text = text.replace(['{', '}'], "");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Text with its verbatim regions swapped out for placeholders.
#[derive(Debug)]
pub(crate) struct Protected {
    pub text: String,
    regions: Vec<String>,
}

pub(crate) fn protect_verbatim(text: &str) -> Result<Protected> {
    if text.contains(OPEN) || text.contains(CLOSE) {
        return Err(Error::formatting("input contains reserved placeholder characters"));
    }
    let mut regions = Vec::new();
    let shielded = VERBATIM.replace_all(text, |caps: &Captures<'_>| {
        let idx = regions.len();
        regions.push(caps[0].to_string());
        format!("{OPEN}{idx}{CLOSE}")
    });
    Ok(Protected {
        text: shielded.into_owned(),
        regions,
    })
}

impl Protected {
    /// Put every region back into `text`. Each placeholder must still be
    /// present exactly once.
    pub fn restore(&self, mut text: String) -> Result<String> {
        for (idx, region) in self.regions.iter().enumerate() {
            let marker = format!("{OPEN}{idx}{CLOSE}");
            if text.matches(marker.as_str()).count() != 1 {
                return Err(Error::formatting(format!(
                    "verbatim region {idx} was lost during normalization"
                )));
            }
            text = text.replacen(marker.as_str(), region, 1);
        }
        Ok(text)
    }
}

/// Rewrite math notation outside code regions.
pub fn normalize_math(text: &str) -> Result<String> {
    if !text.contains('$') {
        return Ok(text.to_string());
    }
    let protected = protect_verbatim(text)?;
    let display = DISPLAY_MATH.replace_all(&protected.text, |caps: &Captures<'_>| {
        format!("**{}**", latex_to_unicode(&caps[1]))
    });
    let inline = INLINE_MATH.replace_all(&display, |caps: &Captures<'_>| {
        format!("_{}_", latex_to_unicode(&caps[1]))
    });
    protected.restore(inline.into_owned())
}
