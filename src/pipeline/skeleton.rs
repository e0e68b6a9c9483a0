//! Line-oriented structural analysis: headings, tables and figure captions.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

static MARKDOWN_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(\S.*)$").expect("markdown heading pattern"));

static NUMBERED_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,3}(?:\.\d{1,3}){0,4})\.?\s+(\p{Lu}.{0,100})$")
        .expect("numbered heading pattern")
});

static KEYWORD_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?i:section|chapter|part|appendix|annex|раздел|глава|часть|приложение)\s+(\d{1,3}(?:\.\d{1,3})*|[IVX]{1,4}|[A-ZА-Я])\b\.?\s*[:.\-–—]?\s*(.*)$",
    )
    .expect("keyword heading pattern")
});

static FIGURE_CAPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:figure|fig\.|drawing|sheet|рис\.|рисунок|чертеж|чертёж|лист)\s*[\w.\-–]+")
        .expect("figure caption pattern")
});

static TABLE_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\|?\s*:?-{3,}:?\s*(?:\|\s*:?-{3,}:?\s*)*\|?$").expect("separator"));

const MAX_HEADING_WORDS: usize = 12;
const MAX_CAPS_HEADING_CHARS: usize = 80;
const MAX_DELIMITED_CELL_CHARS: usize = 60;

/// What a skeleton element represents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementKind {
    /// A heading and the lines it governs.
    Section {
        /// Nesting depth, 1 for top-level.
        level: u8,
        /// Dotted clause number, when the heading carries one.
        number: Option<String>,
    },
    /// Consecutive delimited rows.
    Table {
        /// Column count of the header row.
        columns: usize,
        /// Whether rows disagree on the column count.
        malformed: bool,
    },
    /// A figure, drawing or sheet caption.
    Figure,
}

/// One structural element of a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkeletonElement {
    /// Element kind.
    pub kind: ElementKind,
    /// Heading text, table caption or figure caption.
    pub title: String,
    /// Zero-based line range covered by the element.
    pub lines: Range<usize>,
    /// Index of the enclosing section element.
    pub parent: Option<usize>,
}

impl SkeletonElement {
    /// Whether the element is a section heading.
    pub fn is_section(&self) -> bool {
        matches!(self.kind, ElementKind::Section { .. })
    }
}

/// Structural skeleton of one document.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Skeleton {
    /// Elements in document order.
    pub elements: Vec<SkeletonElement>,
    /// Completeness estimate in `[0, 1]`.
    pub completeness: f32,
    /// Recoverable conditions found while scanning.
    pub warnings: Vec<String>,
    /// Number of lines scanned.
    pub line_count: usize,
}

impl Skeleton {
    /// Number of section elements.
    pub fn section_count(&self) -> usize {
        self.elements.iter().filter(|element| element.is_section()).count()
    }

    /// Number of figure elements.
    pub fn figure_count(&self) -> usize {
        self.elements
            .iter()
            .filter(|element| element.kind == ElementKind::Figure)
            .count()
    }

    /// Number of table elements.
    pub fn table_count(&self) -> usize {
        self.elements
            .iter()
            .filter(|element| matches!(element.kind, ElementKind::Table { .. }))
            .count()
    }

    /// Map from first line to element index.
    pub(crate) fn starts(&self) -> HashMap<usize, usize> {
        self.elements
            .iter()
            .enumerate()
            .map(|(index, element)| (element.lines.start, index))
            .collect()
    }
}

/// Byte offset of every line start when splitting on `\n`.
pub(crate) fn line_starts(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(index, _)| index + 1))
        .collect()
}

/// Build the structural skeleton of `text`.
pub fn analyze(text: &str) -> Skeleton {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut elements: Vec<SkeletonElement> = Vec::new();
    let mut warnings = Vec::new();
    // (element index, level) of the open sections, innermost last.
    let mut open: Vec<(usize, u8)> = Vec::new();

    let mut index = 0;
    while index < lines.len() {
        let line = lines[index].trim();
        if line.is_empty() {
            index += 1;
            continue;
        }

        if let Some(end) = table_run_end(&lines, index) {
            let (columns, malformed) = table_shape(&lines[index..end]);
            let title = table_title(&lines, index);
            if malformed {
                warnings.push(format!(
                    "table at line {} has inconsistent column counts",
                    index + 1
                ));
            }
            elements.push(SkeletonElement {
                kind: ElementKind::Table { columns, malformed },
                title,
                lines: index..end,
                parent: open.last().map(|(element, _)| *element),
            });
            index = end;
            continue;
        }

        if let Some((level, number, title)) = parse_heading(line) {
            while open.last().is_some_and(|(_, open_level)| *open_level >= level) {
                if let Some((closed, _)) = open.pop() {
                    elements[closed].lines.end = index;
                }
            }
            elements.push(SkeletonElement {
                kind: ElementKind::Section { level, number },
                title,
                lines: index..index + 1,
                parent: open.last().map(|(element, _)| *element),
            });
            open.push((elements.len() - 1, level));
        } else if FIGURE_CAPTION.is_match(line) {
            elements.push(SkeletonElement {
                kind: ElementKind::Figure,
                title: line.to_string(),
                lines: index..index + 1,
                parent: open.last().map(|(element, _)| *element),
            });
        }
        index += 1;
    }
    for (closed, _) in open {
        elements[closed].lines.end = lines.len();
    }

    let mut skeleton = Skeleton {
        elements,
        completeness: 0.0,
        warnings,
        line_count: lines.len(),
    };
    if skeleton.section_count() == 0 {
        skeleton.warnings.push("no section headings detected".to_string());
    }
    skeleton.completeness = completeness(&skeleton, &lines);
    tracing::debug!(
        elements = skeleton.elements.len(),
        sections = skeleton.section_count(),
        completeness = skeleton.completeness,
        "Built structural skeleton"
    );
    skeleton
}

/// Whether a trimmed line reads as a heading.
pub(crate) fn is_heading(line: &str) -> bool {
    parse_heading(line).is_some()
}

fn parse_heading(line: &str) -> Option<(u8, Option<String>, String)> {
    if let Some(captures) = MARKDOWN_HEADING.captures(line) {
        let level = captures[1].len() as u8;
        let title = captures[2].trim().to_string();
        let number = NUMBERED_HEADING
            .captures(&title)
            .map(|numbered| numbered[1].to_string());
        return Some((level, number, title));
    }

    if let Some(captures) = NUMBERED_HEADING.captures(line) {
        let title = captures[2].trim();
        if title.ends_with(['.', ';', ':', ',']) || title.split_whitespace().count() > MAX_HEADING_WORDS
        {
            return None;
        }
        let number = captures[1].to_string();
        let level = number.split('.').count() as u8;
        return Some((level, Some(number), line.to_string()));
    }

    if let Some(captures) = KEYWORD_HEADING.captures(line)
        && line.split_whitespace().count() <= MAX_HEADING_WORDS
    {
        let number = captures[1].to_string();
        let level = if number.contains('.') {
            number.split('.').count() as u8
        } else {
            1
        };
        return Some((level, Some(number), line.to_string()));
    }

    if is_caps_heading(line) {
        return Some((1, None, line.to_string()));
    }
    None
}

fn is_caps_heading(line: &str) -> bool {
    if line.chars().count() > MAX_CAPS_HEADING_CHARS
        || line.split_whitespace().count() > MAX_HEADING_WORDS
        || FIGURE_CAPTION.is_match(line)
    {
        return false;
    }
    let letters: Vec<char> = line.chars().filter(|ch| ch.is_alphabetic()).collect();
    letters.len() >= 4 && letters.iter().all(|ch| ch.is_uppercase())
}

/// Cells of a delimited row, or `None` when the line is not tabular.
pub(crate) fn table_cells(line: &str) -> Option<Vec<String>> {
    let line = line.trim();
    if line.contains('|') {
        let cells: Vec<String> = line
            .trim_matches('|')
            .split('|')
            .map(|cell| cell.trim().to_string())
            .collect();
        return (cells.len() >= 2).then_some(cells);
    }
    for delimiter in ['\t', ';'] {
        if line.contains(delimiter) {
            let cells: Vec<String> = line
                .split(delimiter)
                .map(|cell| cell.trim().to_string())
                .collect();
            if cells.len() >= 3
                && cells
                    .iter()
                    .all(|cell| cell.chars().count() <= MAX_DELIMITED_CELL_CHARS)
            {
                return Some(cells);
            }
        }
    }
    None
}

/// Whether the line is a markdown header separator such as `|---|---|`.
pub(crate) fn is_separator_row(line: &str) -> bool {
    TABLE_SEPARATOR.is_match(line.trim())
}

fn table_run_end(lines: &[&str], start: usize) -> Option<usize> {
    let mut end = start;
    let mut rows = 0;
    while end < lines.len() {
        let line = lines[end];
        if is_separator_row(line) && rows > 0 {
            end += 1;
            continue;
        }
        if table_cells(line).is_none() {
            break;
        }
        rows += 1;
        end += 1;
    }
    (rows >= 2).then_some(end)
}

fn table_shape(rows: &[&str]) -> (usize, bool) {
    let counts: Vec<usize> = rows
        .iter()
        .filter(|row| !is_separator_row(row))
        .filter_map(|row| table_cells(row).map(|cells| cells.len()))
        .collect();
    let columns = counts.first().copied().unwrap_or(0);
    let malformed = counts.iter().any(|count| *count != columns);
    (columns, malformed)
}

fn table_title(lines: &[&str], start: usize) -> String {
    let caption = start
        .checked_sub(1)
        .map(|previous| lines[previous].trim())
        .filter(|previous| {
            let lower = previous.to_lowercase();
            lower.starts_with("table") || lower.starts_with("таблица")
        });
    match caption {
        Some(caption) => caption.to_string(),
        None => table_cells(lines[start])
            .map(|cells| cells.join(", "))
            .unwrap_or_default(),
    }
}

fn completeness(skeleton: &Skeleton, lines: &[&str]) -> f32 {
    let content_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, _)| index)
        .collect();
    if content_lines.is_empty() {
        return 0.0;
    }

    let covered = content_lines
        .iter()
        .filter(|line| {
            skeleton
                .elements
                .iter()
                .any(|element| !matches!(element.kind, ElementKind::Figure) && element.lines.contains(*line))
        })
        .count();
    let coverage = covered as f32 / content_lines.len() as f32;
    let has_sections = if skeleton.section_count() > 0 { 1.0 } else { 0.0 };

    (0.5 * coverage + 0.3 * has_sections + 0.2 * numbering_consistency(skeleton)).clamp(0.0, 1.0)
}

/// Share of numbered headings that follow from the previous numbered heading.
fn numbering_consistency(skeleton: &Skeleton) -> f32 {
    let numbers: Vec<Vec<u32>> = skeleton
        .elements
        .iter()
        .filter_map(|element| match &element.kind {
            ElementKind::Section {
                number: Some(number),
                ..
            } => parse_number(number),
            _ => None,
        })
        .collect();
    if numbers.is_empty() {
        return 0.5;
    }

    let consistent = numbers
        .iter()
        .enumerate()
        .filter(|(index, number)| match index.checked_sub(1) {
            None => true,
            Some(previous) => follows(&numbers[previous], number),
        })
        .count();
    consistent as f32 / numbers.len() as f32
}

fn parse_number(number: &str) -> Option<Vec<u32>> {
    number
        .split('.')
        .map(|part| part.parse::<u32>().ok())
        .collect()
}

/// `next` is the first child of `previous` or the next sibling at some level.
fn follows(previous: &[u32], next: &[u32]) -> bool {
    if next.len() == previous.len() + 1 && next.starts_with(previous) {
        return next.last() == Some(&1);
    }
    if next.len() > previous.len() || next.is_empty() {
        return false;
    }
    let depth = next.len();
    next[..depth - 1] == previous[..depth - 1] && next[depth - 1] == previous[depth - 1] + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = "\
1 General
Scope of the works.

1.1 Site preparation
Clear the site.

1.2 Excavation
Excavate to formation level.

2 Concrete works
Table 1 Mix schedule
| Element | Class | Volume |
|---|---|---|
| Footings | C25/30 | 42 m3 |
| Slab | C30/37 | 118 m3 |

Figure 3 Footing detail
";

    #[test]
    fn nests_numbered_sections_and_closes_ranges() {
        let skeleton = analyze(SPEC);
        let sections: Vec<&SkeletonElement> =
            skeleton.elements.iter().filter(|e| e.is_section()).collect();
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0].lines, 0..9);
        assert_eq!(sections[1].parent, Some(0));
        assert_eq!(sections[3].title, "2 Concrete works");
        assert_eq!(sections[3].parent, None);
    }

    #[test]
    fn detects_tables_with_caption_and_figures() {
        let skeleton = analyze(SPEC);
        let table = skeleton
            .elements
            .iter()
            .find(|e| matches!(e.kind, ElementKind::Table { .. }))
            .expect("table");
        assert_eq!(
            table.kind,
            ElementKind::Table {
                columns: 3,
                malformed: false
            }
        );
        assert_eq!(table.title, "Table 1 Mix schedule");
        assert_eq!(table.lines.len(), 4);
        assert_eq!(skeleton.figure_count(), 1);
        assert!(skeleton.completeness > 0.8, "{}", skeleton.completeness);
    }

    #[test]
    fn inconsistent_rows_flag_malformed_tables() {
        let skeleton = analyze("A | B | C\n1 | 2\n3 | 4 | 5\n");
        assert_eq!(
            skeleton.elements[0].kind,
            ElementKind::Table {
                columns: 3,
                malformed: true
            }
        );
        assert!(skeleton.warnings.iter().any(|w| w.contains("inconsistent")));
    }

    #[test]
    fn unstructured_prose_scores_low() {
        let skeleton = analyze("we met on site and discussed the weather.\nnothing else happened.\n");
        assert_eq!(skeleton.section_count(), 0);
        assert!(skeleton.completeness < 0.2);
        assert!(!skeleton.warnings.is_empty());
    }

    #[test]
    fn sentences_are_not_headings() {
        assert!(parse_heading("1. Excavate the trench to 2 m depth.").is_none());
        assert!(parse_heading("25 mm cover to reinforcement").is_none());
        assert!(parse_heading("SECTION 3: ROOFING").is_some());
        assert_eq!(parse_heading("GENERAL REQUIREMENTS").map(|h| h.0), Some(1));
        assert_eq!(parse_heading("## Scope").map(|h| h.0), Some(2));
    }

    #[test]
    fn numbering_follows_children_and_siblings() {
        assert!(follows(&[1], &[1, 1]));
        assert!(follows(&[1, 2], &[2]));
        assert!(follows(&[1, 1], &[1, 2]));
        assert!(!follows(&[1], &[3]));
    }
}
