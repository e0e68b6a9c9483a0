//! Metadata extraction from markup graph nodes, with provenance on every item.

use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::LazyLock;
use time::{Date, Month};

use super::markup::{MarkupGraph, NodeId, NodeKind};

/// Graph node an extracted item was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Provenance {
    /// Source node.
    pub node: NodeId,
}

/// Kinds of named entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Company or institution with a legal form.
    Organisation,
    /// Contractual role such as contractor or customer.
    Party,
    /// Normative code.
    NormativeCode,
}

/// Named entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Entity {
    /// Entity kind.
    pub kind: EntityKind,
    /// Normalised value.
    pub value: String,
    /// Text as found in the node.
    pub raw: String,
    /// Source node.
    pub provenance: Provenance,
}

/// Calendar date.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DateMention {
    /// ISO 8601 date.
    pub value: String,
    /// Text as found in the node.
    pub raw: String,
    /// Source node.
    pub provenance: Provenance,
}

/// Number with a construction unit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Quantity {
    /// Parsed number.
    pub value: f64,
    /// Normalised unit.
    pub unit: String,
    /// Text as found in the node.
    pub raw: String,
    /// Source node.
    pub provenance: Provenance,
}

/// Monetary amount.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Amount {
    /// Parsed number.
    pub value: f64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Text as found in the node.
    pub raw: String,
    /// Source node.
    pub provenance: Provenance,
}

/// Everything extracted from one markup graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetadataBundle {
    /// Organisations, parties and normative codes.
    pub entities: Vec<Entity>,
    /// Dates.
    pub dates: Vec<DateMention>,
    /// Quantities.
    pub quantities: Vec<Quantity>,
    /// Monetary amounts.
    pub amounts: Vec<Amount>,
    /// Items dropped because their provenance could not be verified.
    pub dropped: usize,
}

impl MetadataBundle {
    /// Whether any organisation or party was found.
    pub fn has_party(&self) -> bool {
        self.entities
            .iter()
            .any(|entity| matches!(entity.kind, EntityKind::Organisation | EntityKind::Party))
    }

    /// Every provenance node referenced by the bundle.
    pub fn nodes(&self) -> HashSet<NodeId> {
        self.entities
            .iter()
            .map(|item| item.provenance.node)
            .chain(self.dates.iter().map(|item| item.provenance.node))
            .chain(self.quantities.iter().map(|item| item.provenance.node))
            .chain(self.amounts.iter().map(|item| item.provenance.node))
            .collect()
    }
}

fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("metadata pattern is valid")
}

static DOTTED_DATE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"\b(\d{1,2})[./](\d{1,2})[./](\d{4})\b"));

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| pattern(r"\b(\d{4})-(\d{2})-(\d{2})\b"));

static WORDED_DATE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?\s+(jan\w*|feb\w*|mar\w*|apr\w*|may|jun\w*|jul\w*|aug\w*|sep\w*|oct\w*|nov\w*|dec\w*|январ\w*|феврал\w*|март\w*|апрел\w*|ма[яй]|июн\w*|июл\w*|август\w*|сентябр\w*|октябр\w*|ноябр\w*|декабр\w*)\s+(\d{4})\b",
    )
});

static QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)(\d+(?:[.,]\d+)?)\s?(m³|m²|m3|m2|м³|м²|м3|м2|mm|cm|km|lm|m|kg|tonnes?|t|pcs|nr|kn|mpa|мм|см|км|м|кг|тн?|шт)(?:[^\w]|$)",
    )
});

const NUMBER: &str = r"\d{1,3}(?:[ \u{a0},]\d{3})+(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?";

static AMOUNT_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| pattern(&format!(r"([$€£₽]|\b(?:USD|EUR|GBP|RUB))\s?({NUMBER})")));

static AMOUNT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    pattern(&format!(
        r"(?i)({NUMBER})\s?(USD|EUR|GBP|RUB|руб(?:\.|лей|ля|ль)?|₽|€|\$)"
    ))
});

static ORGANISATION_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r#"\b(?:ООО|АО|ПАО|ЗАО|ОАО|JSC)\s+[«"“]?([^»"”\n,;()]{2,60}?)[»"”]"#)
});

static ORGANISATION_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"\b((?:[A-Z][\w&'\-]*\s+){1,5}(?:LLC|Ltd\.?|Limited|Inc\.?|GmbH|PLC))(?:[^\w]|$)")
});

static PARTY: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(contractor|subcontractor|customer|client|employer|owner|engineer|заказчик|подрядчик|генподрядчик|субподрядчик)\b")
});

/// Extract metadata from every text-bearing node of `graph`.
pub fn extract(graph: &MarkupGraph) -> MetadataBundle {
    let mut bundle = MetadataBundle::default();
    let mut seen_entities: HashSet<(EntityKind, String)> = HashSet::new();

    for id in graph.preorder() {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let provenance = Provenance { node: id };
        match node.kind {
            NodeKind::Reference => {
                if seen_entities.insert((EntityKind::NormativeCode, node.title.clone())) {
                    bundle.entities.push(Entity {
                        kind: EntityKind::NormativeCode,
                        value: node.title.clone(),
                        raw: node.text.clone(),
                        provenance,
                    });
                }
                continue;
            }
            NodeKind::Paragraph | NodeKind::TableRow | NodeKind::Figure | NodeKind::Section => {}
            NodeKind::Document | NodeKind::Table | NodeKind::WorkItem => continue,
        }
        let text = node.text.as_str();

        extract_dates(text, provenance, &mut bundle.dates);
        extract_amounts(text, provenance, &mut bundle.amounts);
        extract_quantities(text, provenance, &mut bundle.quantities);
        for entity in entities_in(text, provenance) {
            if seen_entities.insert((entity.kind, entity.value.clone())) {
                bundle.entities.push(entity);
            }
        }
    }

    bundle.dropped = verify_provenance(&mut bundle, graph);
    tracing::debug!(
        entities = bundle.entities.len(),
        dates = bundle.dates.len(),
        quantities = bundle.quantities.len(),
        amounts = bundle.amounts.len(),
        dropped = bundle.dropped,
        "Extracted metadata"
    );
    bundle
}

/// Drop items whose node is missing from `graph` or does not contain the item's raw text.
///
/// Returns the number of dropped items.
pub fn verify_provenance(bundle: &mut MetadataBundle, graph: &MarkupGraph) -> usize {
    let traceable = |provenance: &Provenance, raw: &str| {
        graph
            .node(provenance.node)
            .is_some_and(|node| node.text.contains(raw) || node.title.contains(raw))
    };
    let before = bundle.entities.len()
        + bundle.dates.len()
        + bundle.quantities.len()
        + bundle.amounts.len();
    bundle
        .entities
        .retain(|item| traceable(&item.provenance, &item.raw));
    bundle
        .dates
        .retain(|item| traceable(&item.provenance, &item.raw));
    bundle
        .quantities
        .retain(|item| traceable(&item.provenance, &item.raw));
    bundle
        .amounts
        .retain(|item| traceable(&item.provenance, &item.raw));
    let after = bundle.entities.len()
        + bundle.dates.len()
        + bundle.quantities.len()
        + bundle.amounts.len();
    before - after
}

fn extract_dates(text: &str, provenance: Provenance, out: &mut Vec<DateMention>) {
    let mut push = |captures: &Captures<'_>, year: &str, month: u8, day: &str| {
        let (Ok(year), Ok(day)) = (year.parse::<i32>(), day.parse::<u8>()) else {
            return;
        };
        let Ok(month) = Month::try_from(month) else {
            return;
        };
        if let Ok(date) = Date::from_calendar_date(year, month, day) {
            let value = date.to_string();
            if !out
                .iter()
                .any(|existing| existing.value == value && existing.provenance == provenance)
            {
                out.push(DateMention {
                    value,
                    raw: captures[0].to_string(),
                    provenance,
                });
            }
        }
    };

    for captures in DOTTED_DATE.captures_iter(text) {
        if let Ok(month) = captures[2].parse::<u8>() {
            push(&captures, &captures[3], month, &captures[1]);
        }
    }
    for captures in ISO_DATE.captures_iter(text) {
        if let Ok(month) = captures[2].parse::<u8>() {
            push(&captures, &captures[1], month, &captures[3]);
        }
    }
    for captures in WORDED_DATE.captures_iter(text) {
        if let Some(month) = month_number(&captures[2]) {
            push(&captures, &captures[3], month, &captures[1]);
        }
    }
}

fn month_number(name: &str) -> Option<u8> {
    let name = name.to_lowercase();
    const PREFIXES: [(&str, &str); 12] = [
        ("jan", "январ"),
        ("feb", "феврал"),
        ("mar", "март"),
        ("apr", "апрел"),
        ("may", "ма"),
        ("jun", "июн"),
        ("jul", "июл"),
        ("aug", "август"),
        ("sep", "сентябр"),
        ("oct", "октябр"),
        ("nov", "ноябр"),
        ("dec", "декабр"),
    ];
    PREFIXES
        .iter()
        .position(|(english, russian)| name.starts_with(english) || name.starts_with(russian))
        .map(|index| index as u8 + 1)
}

fn parse_number(raw: &str) -> Option<f64> {
    let compact: String = raw
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '\u{a0}')
        .collect();
    let normalised = match (compact.rfind(','), compact.rfind('.')) {
        (Some(_), Some(_)) => compact.replace(',', ""),
        (Some(comma), None) if compact.len() - comma == 3 && compact.matches(',').count() == 1 => {
            compact.replace(',', ".")
        }
        (Some(_), None) => compact.replace(',', ""),
        _ => compact,
    };
    normalised.parse().ok()
}

fn currency_code(symbol: &str) -> String {
    let lower = symbol.to_lowercase();
    match lower.as_str() {
        "$" | "usd" => "USD".to_string(),
        "€" | "eur" => "EUR".to_string(),
        "£" | "gbp" => "GBP".to_string(),
        _ if lower == "₽" || lower == "rub" || lower.starts_with("руб") => "RUB".to_string(),
        _ => symbol.to_uppercase(),
    }
}

fn extract_amounts(text: &str, provenance: Provenance, out: &mut Vec<Amount>) {
    let mut spans = Vec::new();
    for captures in AMOUNT_PREFIX.captures_iter(text) {
        if let Some(value) = parse_number(&captures[2]) {
            spans.push(captures.get(0).map(|m| m.range()).unwrap_or_default());
            out.push(Amount {
                value,
                currency: currency_code(&captures[1]),
                raw: captures[0].trim().to_string(),
                provenance,
            });
        }
    }
    for captures in AMOUNT_SUFFIX.captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if spans
            .iter()
            .any(|span: &std::ops::Range<usize>| span.start < whole.end() && whole.start() < span.end)
        {
            continue;
        }
        if let Some(value) = parse_number(&captures[1]) {
            out.push(Amount {
                value,
                currency: currency_code(&captures[2]),
                raw: whole.as_str().trim().to_string(),
                provenance,
            });
        }
    }
}

fn normalise_unit(unit: &str) -> String {
    match unit.to_lowercase().as_str() {
        "m³" | "m3" | "м³" | "м3" => "m3".to_string(),
        "m²" | "m2" | "м²" | "м2" => "m2".to_string(),
        "м" => "m".to_string(),
        "мм" => "mm".to_string(),
        "см" => "cm".to_string(),
        "км" => "km".to_string(),
        "кг" => "kg".to_string(),
        "т" | "тн" | "tonne" | "tonnes" => "t".to_string(),
        "шт" | "nr" => "pcs".to_string(),
        other => other.to_string(),
    }
}

fn extract_quantities(text: &str, provenance: Provenance, out: &mut Vec<Quantity>) {
    for captures in QUANTITY.captures_iter(text) {
        let (Some(number), Some(unit)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        let Some(value) = parse_number(number.as_str()) else {
            continue;
        };
        out.push(Quantity {
            value,
            unit: normalise_unit(unit.as_str()),
            raw: text[number.start()..unit.end()].to_string(),
            provenance,
        });
    }
}

fn entities_in(text: &str, provenance: Provenance) -> Vec<Entity> {
    let mut entities = Vec::new();
    for captures in ORGANISATION_PREFIX.captures_iter(text) {
        entities.push(Entity {
            kind: EntityKind::Organisation,
            value: captures[1].trim().to_string(),
            raw: captures[0].to_string(),
            provenance,
        });
    }
    for captures in ORGANISATION_SUFFIX.captures_iter(text) {
        entities.push(Entity {
            kind: EntityKind::Organisation,
            value: captures[1].trim().to_string(),
            raw: captures[1].to_string(),
            provenance,
        });
    }
    for captures in PARTY.captures_iter(text) {
        let raw = captures[1].to_string();
        let lower = raw.to_lowercase();
        let mut chars = lower.chars();
        let value: String = chars
            .next()
            .map(|first| first.to_uppercase().chain(chars).collect())
            .unwrap_or_default();
        entities.push(Entity {
            kind: EntityKind::Party,
            value,
            raw,
            provenance,
        });
    }
    entities
}
