use regex::Regex;
use std::sync::LazyLock;

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \b(?:
            (?:SNiP|SNIP|СНиП)\s*\d+(?:\.\d+)*(?:\s?[-–—]\s?\d{2,4})?
          | (?:SP|СП)\s*\d+(?:\.\d+)+(?:\s?[-–—]\s?\d{2,4})?
          | (?:GOST|ГОСТ)(?:\s*(?:R|Р)\b)?(?:\s*(?:ISO|EN))?\s*\d+(?:\.\d+)*(?:\s?[-–—]\s?\d{2,4})?
          | ASTM\s*[A-Z]\s?\d+(?:[-–/]\d+)?
          | (?:BS\s+|DIN\s+)?(?:EN|ISO)(?:\s+ISO)?\s*\d{2,5}(?:[-–:]\d+)*
          | (?:BS|DIN)\s*\d{3,5}(?:[-–:]\d+)*
        )",
    )
    .expect("normative code pattern is valid")
});

/// Normative codes mentioned in `text`, normalised, in order of first appearance.
pub fn detect_codes(text: &str) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    for found in CODE_PATTERN.find_iter(text) {
        let code = normalize_code(found.as_str());
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

/// Byte spans of normative codes in `text`.
pub fn code_spans(text: &str) -> Vec<(usize, usize)> {
    CODE_PATTERN
        .find_iter(text)
        .map(|found| (found.start(), found.end()))
        .collect()
}

/// Canonical form of a code: uppercase, ASCII dashes, single spaces, a space between the
/// family prefix and the number.
pub fn normalize_code(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut previous: Option<char> = None;
    let mut letters = 0usize;
    for ch in code.trim().chars() {
        let ch = match ch {
            '–' | '—' | '‐' | '−' => '-',
            other => other,
        };
        if ch.is_whitespace() {
            if previous.is_some_and(|p| p != ' ' && p != '-') {
                out.push(' ');
                previous = Some(' ');
            }
            letters = 0;
            continue;
        }
        if ch == '-' && previous == Some(' ') {
            out.pop();
        }
        // "SNiP2.01" gets a separator, "ASTM A615" keeps its grade letter attached.
        if ch.is_ascii_digit() && letters >= 2 {
            out.push(' ');
        }
        letters = if ch.is_alphabetic() { letters + 1 } else { 0 };
        out.extend(ch.to_uppercase());
        previous = Some(ch);
    }
    out.trim_end().to_string()
}
