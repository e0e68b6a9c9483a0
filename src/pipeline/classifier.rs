//! Document type classification: weighted lexical signals, a structural signature and an
//! optional model tie-break in the ambiguous band around the confidence floor.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::error::PipelineError;
use super::skeleton::table_cells;
use super::types::DocumentType;
use crate::models::{ModelCache, ModelRole};
use crate::normative::code_spans;

/// Top score at which confidence stops being discounted.
const SATURATION: f32 = 6.0;

/// Classifier thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassifierSettings {
    /// Confidence below which a document is rejected.
    pub confidence_floor: f32,
    /// Whether the classification model may break ties near the floor.
    pub model_assist: bool,
    /// Half-width of the band around the floor in which the model is consulted.
    pub assist_band: f32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            confidence_floor: 0.55,
            model_assist: true,
            assist_band: 0.15,
        }
    }
}

/// Result of classification.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Classification {
    /// Winning type.
    pub doc_type: DocumentType,
    /// Subtype label of the winning type.
    pub subtype: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    /// Lexical score per type, best first.
    pub scores: Vec<(DocumentType, f32)>,
    /// Whether the classification model confirmed the type.
    pub model_confirmed: bool,
    /// Whether the model was unreachable.
    pub degraded: bool,
    /// Recoverable conditions.
    pub warnings: Vec<String>,
}

struct Signal {
    pattern: Regex,
    weight: f32,
}

fn signal(pattern: &str, weight: f32) -> Signal {
    Signal {
        pattern: Regex::new(pattern).expect("classifier signal is valid"),
        weight,
    }
}

fn signals_for(doc_type: DocumentType) -> Vec<Signal> {
    match doc_type {
        DocumentType::Normative => vec![
            signal(r"(?i)\b(?:building code|code of practice|standard|regulations?|normative references|terms and definitions|scope of application)\b", 1.5),
            signal(r"(?i)\b(?:свод правил|строительные нормы|нормативные ссылки|термины и определения|область применения)", 1.5),
            signal(r"(?i)\b(?:shall be|shall not|is permitted|допускается|следует)\b", 0.5),
        ],
        DocumentType::Project => vec![
            signal(r"(?i)\b(?:method statement|work plan|scope of works|sequence of works|work programme|specification|project documentation)\b", 1.5),
            signal(r"(?i)(?:ппр|проект производства работ|технологическая карта|последовательность работ|пояснительная записка)", 1.5),
            signal(r"(?i)\b(?:excavat\w*|formwork|pour\w*|install\w*|erect\w*|backfill\w*)\b", 0.4),
        ],
        DocumentType::Estimate => vec![
            signal(r"(?i)\b(?:estimate|bill of quantities|boq|unit rate|unit price|grand total|subtotal|invoice|cost plan)\b", 1.5),
            signal(r"(?i)(?:смет\w*|ведомость объемов|ведомость объёмов|сметная стоимость|итого|счет на оплату|счёт на оплату)", 1.5),
            signal(r"(?i)\b(?:qty|quantity|rate|amount|total)\b", 0.4),
        ],
        DocumentType::Contract => vec![
            signal(r"(?i)\b(?:agreement|contract|hereinafter|the parties|terms of payment|termination|governing law|in witness whereof)\b", 1.5),
            signal(r"(?i)(?:договор\w*|именуем\w*|стороны|предмет договора|ответственность сторон)", 1.5),
            signal(r"(?i)\b(?:undertakes|obliged|liable|penalt\w*|warrant\w*)\b", 0.5),
        ],
        DocumentType::Drawing => vec![
            signal(r"(?i)\b(?:drawing|sheet|scale 1:\d+|legend|dimensions in|elevation|floor plan|general notes|revision)\b", 1.5),
            signal(r"(?i)(?:чертеж\w*|чертёж\w*|лист\b|масштаб|экспликация|условные обозначения)", 1.5),
        ],
        DocumentType::Report => vec![
            signal(r"(?i)\b(?:report|inspection|findings|observed|test results|site visit|non-?conformance|recommendations)\b", 1.5),
            signal(r"(?i)(?:отчет\w*|отчёт\w*|акт\w*|протокол\w*|обследовани\w*|выявлен\w*)", 1.5),
            signal(r"(?i)\b(?:defect\w*|crack\w*|deviation\w*|inspected)\b", 0.5),
        ],
    }
}

static SIGNALS: LazyLock<Vec<(DocumentType, Vec<Signal>)>> = LazyLock::new(|| {
    DocumentType::ALL
        .into_iter()
        .map(|doc_type| (doc_type, signals_for(doc_type)))
        .collect()
});

static FILENAME_HINTS: LazyLock<Vec<(DocumentType, Regex)>> = LazyLock::new(|| {
    let hint = |pattern: &str| Regex::new(pattern).expect("filename hint is valid");
    vec![
        (DocumentType::Normative, hint(r"(?i)(snip|gost|sp[ _-]?\d|standard|code|снип|гост|сп[ _-]?\d)")),
        (DocumentType::Project, hint(r"(?i)(method|ppr|ппр|plan|spec|project|проект)")),
        (DocumentType::Estimate, hint(r"(?i)(estimate|boq|bill|invoice|smeta|смет|счет)")),
        (DocumentType::Contract, hint(r"(?i)(contract|agreement|dogovor|договор)")),
        (DocumentType::Drawing, hint(r"(?i)(drawing|dwg|dxf|sheet|чертеж|лист)")),
        (DocumentType::Report, hint(r"(?i)(report|inspection|protocol|akt|отчет|акт|протокол)")),
    ]
});

static MONEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:[$€£₽]\s?\d|\d\s?(?:usd|eur|gbp|rub|руб))").expect("money pattern")
});
static NUMBERED_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(?:\.\d{1,3}){1,4}\.?\s").expect("clause pattern"));
static DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,2}[./]\d{1,2}[./]\d{4}\b|\b\d{4}-\d{2}-\d{2}\b").expect("date pattern")
});
static IMPERATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:\d+(?:\.\d+)*\.?\s+|[-•*]\s+)?(?:excavate|install|erect|pour|place|fix|lay|apply|cast|construct|backfill|compact|выполнить|установить|смонтировать|уложить)\b")
        .expect("imperative pattern")
});
static FIGURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:figure|fig\.|drawing|sheet|рис\.|рисунок|чертеж|лист)\s*[\w.\-]+")
        .expect("figure pattern")
});

/// Cheap structural features of the raw text.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Signature {
    table_density: f32,
    money_hits: usize,
    clause_density: f32,
    date_hits: usize,
    imperative_density: f32,
    figure_hits: usize,
    code_hits: usize,
}

fn signature(text: &str) -> Signature {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let total = lines.len().max(1) as f32;
    let share = |predicate: &dyn Fn(&str) -> bool| {
        lines.iter().filter(|line| predicate(line)).count() as f32 / total
    };
    Signature {
        table_density: share(&|line| table_cells(line).is_some()),
        money_hits: MONEY.find_iter(text).count(),
        clause_density: share(&|line| NUMBERED_CLAUSE.is_match(line)),
        date_hits: DATE.find_iter(text).count(),
        imperative_density: share(&|line| IMPERATIVE.is_match(line)),
        figure_hits: FIGURE.find_iter(text).count(),
        code_hits: code_spans(text).len(),
    }
}

/// Lexical and structural scores per document type.
pub fn lexical_scores(text: &str, file_name: &str) -> BTreeMap<DocumentType, f32> {
    let mut scores: BTreeMap<DocumentType, f32> = BTreeMap::new();
    for (doc_type, signals) in SIGNALS.iter() {
        let score = signals
            .iter()
            .map(|signal| {
                // Repeated mentions count with diminishing weight.
                let hits = signal.pattern.find_iter(text).count() as f32;
                signal.weight * (1.0 + hits).ln() / std::f32::consts::LN_2
            })
            .sum::<f32>();
        scores.insert(*doc_type, score);
    }

    for (doc_type, hint) in FILENAME_HINTS.iter() {
        if hint.is_match(file_name) {
            *scores.entry(*doc_type).or_default() += 2.0;
        }
    }

    let signature = signature(text);
    let bump = |scores: &mut BTreeMap<DocumentType, f32>, doc_type, amount: f32| {
        *scores.entry(doc_type).or_default() += amount;
    };
    bump(&mut scores, DocumentType::Estimate, 3.0 * signature.table_density);
    bump(&mut scores, DocumentType::Estimate, (signature.money_hits as f32).min(5.0) * 0.6);
    bump(&mut scores, DocumentType::Contract, (signature.money_hits as f32).min(3.0) * 0.2);
    bump(&mut scores, DocumentType::Normative, 4.0 * signature.clause_density);
    bump(&mut scores, DocumentType::Normative, (signature.code_hits as f32).min(5.0) * 0.3);
    bump(&mut scores, DocumentType::Report, (signature.date_hits as f32).min(4.0) * 0.3);
    bump(&mut scores, DocumentType::Contract, (signature.date_hits as f32).min(3.0) * 0.2);
    bump(&mut scores, DocumentType::Project, 4.0 * signature.imperative_density);
    bump(&mut scores, DocumentType::Drawing, (signature.figure_hits as f32).min(4.0) * 0.8);
    scores
}

fn subtype_rules(doc_type: DocumentType) -> &'static [(&'static str, &'static str)] {
    match doc_type {
        DocumentType::Normative => &[
            ("building_code", r"(?i)(snip|снип|building code|строительные нормы)"),
            ("code_of_practice", r"(?i)(\bsp\s?\d|\bсп\s?\d|code of practice|свод правил)"),
            ("standard", r"(?i)(gost|гост|\biso\b|\ben\s?\d|astm|standard|стандарт)"),
            ("regulation", r""),
        ],
        DocumentType::Project => &[
            ("method_statement", r"(?i)(method statement|ппр|проект производства работ|технологическая карта)"),
            ("work_plan", r"(?i)(work plan|programme|schedule|график)"),
            ("specification", r"(?i)(specification|спецификац)"),
            ("project_documentation", r""),
        ],
        DocumentType::Estimate => &[
            ("bill_of_quantities", r"(?i)(bill of quantities|\bboq\b|ведомость объ[её]мов)"),
            ("invoice", r"(?i)(invoice|сч[её]т на оплату)"),
            ("local_estimate", r"(?i)(локальн\w* смет|local estimate)"),
            ("cost_estimate", r""),
        ],
        DocumentType::Contract => &[
            ("amendment", r"(?i)(amendment|addendum|дополнительное соглашение)"),
            ("subcontract", r"(?i)(subcontract|субподряд)"),
            ("construction_contract", r""),
        ],
        DocumentType::Drawing => &[
            ("floor_plan", r"(?i)(floor plan|план этажа)"),
            ("section", r"(?i)(\bsection [a-z]-[a-z]\b|разрез)"),
            ("detail", r"(?i)(\bdetail\b|узел)"),
            ("drawing_sheet", r""),
        ],
        DocumentType::Report => &[
            ("acceptance_certificate", r"(?i)(acceptance certificate|акт приемки|акт приёмки)"),
            ("test_report", r"(?i)(test report|test results|протокол испытани)"),
            ("inspection_report", r"(?i)(inspection|обследовани|осмотр)"),
            ("progress_report", r"(?i)(progress|ход работ)"),
            ("report", r""),
        ],
    }
}

/// Subtype rules per type, in priority order. A rule without a pattern is the fallback.
static SUBTYPES: LazyLock<Vec<(DocumentType, Vec<(&'static str, Option<Regex>)>)>> =
    LazyLock::new(|| {
        DocumentType::ALL
            .into_iter()
            .map(|doc_type| {
                let rules = subtype_rules(doc_type)
                    .iter()
                    .map(|(label, pattern)| {
                        let regex = (!pattern.is_empty())
                            .then(|| Regex::new(pattern).expect("subtype pattern is valid"));
                        (*label, regex)
                    })
                    .collect();
                (doc_type, rules)
            })
            .collect()
    });

/// Subtype label of `doc_type` for `text`.
pub fn subtype_of(doc_type: DocumentType, text: &str, file_name: &str) -> String {
    let haystack = format!("{file_name}\n{text}");
    SUBTYPES
        .iter()
        .find(|(candidate, _)| *candidate == doc_type)
        .and_then(|(_, rules)| {
            rules.iter().find(|(_, regex)| {
                regex.as_ref().is_none_or(|regex| regex.is_match(&haystack))
            })
        })
        .map(|(label, _)| (*label).to_string())
        .unwrap_or_else(|| doc_type.as_str().to_string())
}

/// Type classifier with an optional classification model.
#[derive(Clone)]
pub struct Classifier {
    settings: ClassifierSettings,
    cache: Option<ModelCache>,
}

impl Classifier {
    /// Classifier with the given thresholds; `cache` enables model assistance.
    pub fn new(settings: ClassifierSettings, cache: Option<ModelCache>) -> Self {
        Self { settings, cache }
    }

    /// Configured thresholds.
    pub fn settings(&self) -> ClassifierSettings {
        self.settings
    }

    /// Classify `text`, rejecting with [`PipelineError::LowConfidence`] below the floor.
    pub async fn classify(
        &self,
        text: &str,
        file_name: &str,
    ) -> Result<Classification, PipelineError> {
        let scores = lexical_scores(text, file_name);
        let mut ranked: Vec<(DocumentType, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let total: f32 = ranked.iter().map(|(_, score)| score).sum();
        let (mut doc_type, top) = ranked[0];
        let mut confidence = if total > 0.0 {
            (top / total) * (top / SATURATION).min(1.0)
        } else {
            0.0
        };

        let floor = self.settings.confidence_floor;
        let mut warnings = Vec::new();
        let mut model_confirmed = false;
        let mut degraded = false;
        let ambiguous = (confidence - floor).abs() <= self.settings.assist_band;
        if self.settings.model_assist
            && ambiguous
            && top > 0.0
            && let Some(cache) = &self.cache
        {
            let candidates = [ranked[0].0, ranked[1].0];
            match ask_model(cache, text, candidates).await {
                Ok(Some(choice)) => {
                    tracing::debug!(choice = %choice, lexical = %doc_type, "Classification model confirmed a candidate");
                    doc_type = choice;
                    confidence = confidence.max(floor);
                    model_confirmed = true;
                }
                Ok(None) => {}
                Err(error) => {
                    degraded = error.is_unavailable();
                    tracing::warn!(error = %error, "Classification model unavailable; using lexical result");
                    warnings.push(format!(
                        "classification model unavailable ({error}); lexical classification used"
                    ));
                }
            }
        }

        if confidence < floor {
            return Err(PipelineError::LowConfidence {
                confidence,
                floor,
                best_guess: Some(doc_type.as_str().to_string()),
            });
        }

        Ok(Classification {
            doc_type,
            subtype: subtype_of(doc_type, text, file_name),
            confidence,
            scores: ranked,
            model_confirmed,
            degraded,
            warnings,
        })
    }
}

const MODEL_EXCERPT_CHARS: usize = 2000;

async fn ask_model(
    cache: &ModelCache,
    text: &str,
    candidates: [DocumentType; 2],
) -> Result<Option<DocumentType>, crate::models::ModelError> {
    let handle = cache.acquire(ModelRole::Classification).await?;
    let excerpt: String = text.chars().take(MODEL_EXCERPT_CHARS).collect();
    let prompt = format!(
        "Classify this construction document. Answer with exactly one word: {} or {}.\n\n{excerpt}",
        candidates[0], candidates[1]
    );
    let reply = handle.complete(&prompt).await?.to_lowercase();
    // The model may only pick one of the lexical candidates.
    let picked: Vec<DocumentType> = candidates
        .into_iter()
        .filter(|candidate| reply.contains(candidate.as_str()))
        .collect();
    Ok(match picked.as_slice() {
        [single] => Some(*single),
        _ => None,
    })
}
