//! Sentence-level seed extraction ahead of markup generation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;
use unicode_segmentation::UnicodeSegmentation;

use super::markup::starts_clause;
use super::skeleton::{is_heading, table_cells};
use super::types::DocumentType;

/// Trade or clause tag attached to a seed and later to its work item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedTag {
    /// Excavation, backfill, grading.
    Earthworks,
    /// Formwork, reinforcement, pouring, curing.
    Concrete,
    /// Brick and block work.
    Masonry,
    /// Structural steel erection.
    Steel,
    /// Mechanical, electrical, plumbing and fixture installation.
    Installation,
    /// Plaster, paint, flooring, roofing finishes.
    Finishing,
    /// Inspections, tests and acceptance.
    Inspection,
    /// Mandatory requirement clause.
    Requirement,
    /// Priced line item.
    LineItem,
    /// Contractual obligation.
    Obligation,
    /// Report finding or defect.
    Finding,
    /// Drawing note.
    Note,
    /// Anything else worth keeping.
    General,
}

impl SeedTag {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earthworks => "earthworks",
            Self::Concrete => "concrete",
            Self::Masonry => "masonry",
            Self::Steel => "steel",
            Self::Installation => "installation",
            Self::Finishing => "finishing",
            Self::Inspection => "inspection",
            Self::Requirement => "requirement",
            Self::LineItem => "line_item",
            Self::Obligation => "obligation",
            Self::Finding => "finding",
            Self::Note => "note",
            Self::General => "general",
        }
    }

    /// Whether the tag names a construction activity that can be scheduled.
    pub fn is_work(self) -> bool {
        matches!(
            self,
            Self::Earthworks
                | Self::Concrete
                | Self::Masonry
                | Self::Steel
                | Self::Installation
                | Self::Finishing
                | Self::Inspection
        )
    }
}

impl fmt::Display for SeedTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sentence that may become a work item node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateWorkItem {
    /// Byte span in the document text.
    pub span: Range<usize>,
    /// Trimmed sentence text.
    pub text: String,
    /// Assigned tag.
    pub tag: SeedTag,
}

fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("candidate pattern is valid")
}

static TRADE_PATTERNS: LazyLock<Vec<(SeedTag, Regex)>> = LazyLock::new(|| {
    vec![
        (
            SeedTag::Earthworks,
            pattern(r"(?i)\b(excavat\w*|backfill\w*|trench\w*|grading|compact\w*|earthwork\w*|топсоил|выемк\w*|засыпк\w*|разработк\w* грунта)"),
        ),
        (
            SeedTag::Concrete,
            pattern(r"(?i)\b(concret\w*|formwork|rebar|reinforc\w*|pour\w*|cur(?:e|ing)|slab|footing\w*|бетон\w*|опалубк\w*|армирова\w*)"),
        ),
        (
            SeedTag::Masonry,
            pattern(r"(?i)\b(masonry|brick\w*|blockwork|mortar|кладк\w*|кирпич\w*)"),
        ),
        (
            SeedTag::Steel,
            pattern(r"(?i)\b(steel (?:frame|beam|column|erection)\w*|erect\w*|bolt\w*|weld\w*|металлоконструкц\w*|монтаж\w* каркаса)"),
        ),
        (
            SeedTag::Installation,
            pattern(r"(?i)\b(install\w*|pipework|piping|wiring|cabl\w*|duct\w*|plumbing|hvac|fixtures?|монтаж\w*|прокладк\w*)"),
        ),
        (
            SeedTag::Finishing,
            pattern(r"(?i)\b(plaster\w*|paint\w*|tiling|tile\w*|screed\w*|floor finish\w*|roofing|render\w*|штукатур\w*|окраск\w*|отделк\w*)"),
        ),
        (
            SeedTag::Inspection,
            pattern(r"(?i)\b(inspect\w*|test(?:ing|ed)?|commission\w*|acceptance|survey\w*|испытани\w*|приемк\w*|приёмк\w*)"),
        ),
    ]
});

static REQUIREMENT: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(shall|must|is required|are required|not less than|not more than|at least|должн\w*|следует|допускается|не менее|не более)\b")
});

static OBLIGATION: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(shall|undertakes? to|is obliged|agrees? to|is responsible for|обязу\w*|обязан\w*)\b")
});

static FINDING: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(found|observed|defect\w*|crack\w*|deviation\w*|non-?conform\w*|failed|выявлен\w*|дефект\w*|трещин\w*)\b")
});

static NOTE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)^(?:notes?|general notes?|примечани\w*)\b|\bdimensions? in\b|\bsee detail\b"));

static IMPERATIVE_START: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)^(?:\d+(?:\.\d+)*\.?\s+|[-•*]\s+|\(?[a-zа-я0-9]\)\s+)?(excavate|backfill|compact|install|erect|pour|place|fix|lay|apply|test|inspect|cast|construct|remove|clear|connect|paint|plaster|provide|выполнить|установить|смонтировать|уложить)\b")
});

static LINE_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\d[\d\s.,]*\s*(?:m2|m3|m²|m³|м2|м3|kg|t|pcs|nr|no\.|шт|lm|m)\b.*\d")
});

const MIN_CANDIDATE_CHARS: usize = 12;
const MAX_CANDIDATE_CHARS: usize = 600;

/// Extract seeds from `text` using the patterns that matter for `doc_type`.
pub fn extract(text: &str, doc_type: DocumentType) -> Vec<CandidateWorkItem> {
    let mut candidates = Vec::new();
    for (offset, sentence) in sentence_spans(text) {
        let trimmed = sentence.trim();
        let length = trimmed.chars().count();
        if !(MIN_CANDIDATE_CHARS..=MAX_CANDIDATE_CHARS).contains(&length) {
            continue;
        }
        let Some(tag) = tag_sentence(trimmed, doc_type) else {
            continue;
        };
        let leading = sentence.len() - sentence.trim_start().len();
        let start = offset + leading;
        candidates.push(CandidateWorkItem {
            span: start..start + trimmed.len(),
            text: trimmed.to_string(),
            tag,
        });
    }
    tracing::debug!(doc_type = %doc_type, candidates = candidates.len(), "Extracted candidate seeds");
    candidates
}

/// Sentence spans that never cross a line that is a table row or blank.
fn sentence_spans(text: &str) -> Vec<(usize, &str)> {
    let mut spans = Vec::new();
    for (block_start, block) in blocks(text) {
        // Wrapped lines would otherwise end a sentence at every line break.
        let flattened = block.replace('\n', " ");
        for (offset, sentence) in flattened.split_sentence_bound_indices() {
            if !sentence.trim().is_empty() {
                let start = block_start + offset;
                spans.push((start, &text[start..start + sentence.len()]));
            }
        }
    }
    spans
}

/// Split on blank lines, headings, clause starts and tabular lines so sentences stay inside one
/// paragraph. Heading lines are dropped.
fn blocks(text: &str) -> Vec<(usize, &str)> {
    let mut blocks = Vec::new();
    let mut block_start: Option<usize> = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let content = line.trim();
        let tabular = table_cells(content).is_some();
        let heading = is_heading(content);
        if content.is_empty() || tabular || heading || starts_clause(content) {
            if let Some(start) = block_start.take() {
                blocks.push((start, &text[start..offset]));
            }
        }
        if tabular {
            blocks.push((offset, &text[offset..offset + line.len()]));
        } else if !content.is_empty() && !heading && block_start.is_none() {
            block_start = Some(offset);
        }
        offset += line.len();
    }
    if let Some(start) = block_start {
        blocks.push((start, &text[start..]));
    }
    blocks
}

fn tag_sentence(sentence: &str, doc_type: DocumentType) -> Option<SeedTag> {
    let trade = || {
        TRADE_PATTERNS
            .iter()
            .find(|(_, pattern)| pattern.is_match(sentence))
            .map(|(tag, _)| *tag)
    };
    match doc_type {
        DocumentType::Project => {
            if let Some(tag) = trade() {
                return Some(tag);
            }
            if IMPERATIVE_START.is_match(sentence) {
                return Some(SeedTag::General);
            }
            REQUIREMENT.is_match(sentence).then_some(SeedTag::Requirement)
        }
        DocumentType::Normative => REQUIREMENT
            .is_match(sentence)
            .then_some(SeedTag::Requirement),
        DocumentType::Estimate => LINE_ITEM.is_match(sentence).then_some(SeedTag::LineItem),
        DocumentType::Contract => OBLIGATION
            .is_match(sentence)
            .then_some(SeedTag::Obligation),
        DocumentType::Report => {
            if FINDING.is_match(sentence) {
                Some(SeedTag::Finding)
            } else {
                trade().filter(|tag| *tag == SeedTag::Inspection)
            }
        }
        DocumentType::Drawing => {
            if NOTE.is_match(sentence) {
                Some(SeedTag::Note)
            } else {
                trade().or(Some(SeedTag::Note))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_sentences_get_trade_tags_and_exact_spans() {
        let text = "3 Works\nExcavate the trench to 1.2 m depth. Pour concrete C25/30 into the footings.\n\
                    The contractor must keep the site tidy.\n";
        let seeds = extract(text, DocumentType::Project);
        let tags: Vec<SeedTag> = seeds.iter().map(|seed| seed.tag).collect();
        assert_eq!(
            tags,
            vec![SeedTag::Earthworks, SeedTag::Concrete, SeedTag::Requirement]
        );
        for seed in &seeds {
            assert_eq!(&text[seed.span.clone()], seed.text);
        }
    }

    #[test]
    fn estimate_rows_become_line_items() {
        let text = "Concrete C25/30 | 42 m3 | 5 400 | 226 800\nSite overheads lump sum\n";
        let seeds = extract(text, DocumentType::Estimate);
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].tag, SeedTag::LineItem);
    }

    #[test]
    fn short_fragments_are_ignored() {
        assert!(extract("Pour.\n", DocumentType::Project).is_empty());
    }

    #[test]
    fn work_tags_exclude_clause_tags() {
        assert!(SeedTag::Concrete.is_work());
        assert!(!SeedTag::Requirement.is_work());
        assert!(!SeedTag::LineItem.is_work());
    }
}
