// =============================================================================
// classifier.rs — PERSIAN LEGAL TEXT ANALYSIS
// =============================================================================
//
// A rules engine, not a model. Three passes over normalised text:
//
// 1. Aho-Corasick automata, one per legal category, count keyword hits in a
//    single scan each. The category with the most hits wins; confidence is
//    its share of all hits.
// 2. Regexes pull out citable entities: law titles, article references,
//    courts, dates and case numbers.
// 3. A fixed topic table tags the document by substring membership.
//
// memchr gives a byte-level "could this be legal text at all?" check that
// callers use to skip the expensive passes, and rayon spreads batches over
// every core.
// =============================================================================

use aho_corasick::{AhoCorasick, MatchKind};
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::LegalCategory;

// =============================================================================
// NORMALISATION
// =============================================================================

/// Fold the spelling variants Persian sources mix freely: Arabic yeh/kaf to
/// the Persian letters, Persian and Arabic-Indic digits to ASCII, ZWNJ to a
/// plain space, tatweel dropped.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '\u{0640}')
        .map(|c| match c {
            '\u{064A}' | '\u{0649}' => '\u{06CC}',
            '\u{0643}' => '\u{06A9}',
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{200C}' => ' ',
            other => other,
        })
        .collect()
}

// =============================================================================
// CATEGORY KEYWORDS
// =============================================================================

// Written in normalised form: Persian yeh/kaf, no ZWNJ.
const CATEGORY_KEYWORDS: [(LegalCategory, &[&str]); 8] = [
    (
        LegalCategory::Civil,
        &[
            "قانون مدنی", "مدنی", "قرارداد", "عقد", "مالکیت", "اجاره", "بیع",
            "خسارت", "تعهد", "وکالت", "ضمان", "سند رسمی", "الزام به تنظیم سند",
        ],
    ),
    (
        LegalCategory::Criminal,
        &[
            "کیفری", "جرم", "مجازات", "قصاص", "دیه", "حبس", "سرقت",
            "کلاهبرداری", "متهم", "دادسرا", "تعزیر", "کیفرخواست", "اختلاس",
        ],
    ),
    (
        LegalCategory::Commercial,
        &[
            "قانون تجارت", "تجاری", "تجارت", "شرکت", "سهام", "ورشکستگی",
            "چک برگشتی", "سفته", "برات", "بازرگانی", "اسناد تجاری",
        ],
    ),
    (
        LegalCategory::Administrative,
        &[
            "دیوان عدالت اداری", "اداری", "استخدام", "کارمند", "دولتی",
            "شهرداری", "وزارت", "آیین نامه", "بخشنامه", "مصوبه هیات وزیران",
        ],
    ),
    (
        LegalCategory::Family,
        &[
            "خانواده", "طلاق", "نکاح", "ازدواج", "مهریه", "نفقه", "حضانت",
            "زوجه", "زوج", "جهیزیه", "ملاقات فرزند", "تمکین",
        ],
    ),
    (
        LegalCategory::Labor,
        &[
            "قانون کار", "کارگر", "کارفرما", "دستمزد", "اخراج", "تامین اجتماعی",
            "سنوات", "بیمه", "هیات تشخیص", "اداره کار",
        ],
    ),
    (
        LegalCategory::Constitutional,
        &[
            "قانون اساسی", "اساسی", "شورای نگهبان", "مجلس", "رهبری", "حقوق ملت",
            "انتخابات", "قوه مقننه", "قوه مجریه", "قوه قضاییه",
        ],
    ),
    (
        LegalCategory::Tax,
        &[
            "مالیات", "مالیاتی", "عوارض", "گمرک", "ارزش افزوده", "معافیت",
            "ممیزی", "درآمد", "اظهارنامه", "سازمان امور مالیاتی",
        ],
    ),
];

static CATEGORY_AUTOMATA: LazyLock<Vec<(LegalCategory, AhoCorasick)>> = LazyLock::new(|| {
    CATEGORY_KEYWORDS
        .iter()
        .map(|(category, keywords)| {
            let automaton = AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostLongest)
                .build(*keywords)
                .expect("Failed to build category automaton");
            (*category, automaton)
        })
        .collect()
});

// =============================================================================
// ENTITY PATTERNS
// =============================================================================

static LAW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"قانون\s+\p{Arabic}+(?:\s+\p{Arabic}+)?").expect("Failed to build law regex")
});

static ARTICLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(ماده|تبصره|اصل)\s*(\d+)").expect("Failed to build article regex")
});

static COURT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:دادگاه|دیوان)\s+\p{Arabic}+(?:\s+\p{Arabic}+)?")
        .expect("Failed to build court regex")
});

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:1[34]|20)\d{2}/\d{1,2}/\d{1,2}\b").expect("Failed to build date regex")
});

static CASE_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:پرونده|دادنامه|کلاسه)\s*(?:شماره)?\s*:?\s*(\d[\d/\-]*\d|\d)")
        .expect("Failed to build case number regex")
});

// =============================================================================
// TOPICS
// =============================================================================

const TOPICS: [(&str, &[&str]); 10] = [
    ("ارث", &["ارث", "وراثت", "ترکه", "وصیت", "انحصار وراثت"]),
    ("طلاق", &["طلاق"]),
    ("مهریه", &["مهریه"]),
    ("حضانت", &["حضانت", "ملاقات فرزند"]),
    ("قرارداد", &["قرارداد", "عقد"]),
    ("املاک", &["املاک", "ملک", "اجاره", "سند رسمی"]),
    ("چک", &["چک برگشتی", "صدور چک", "وجه چک"]),
    ("روابط کار", &["کارگر", "کارفرما"]),
    ("مالیات", &["مالیات"]),
    ("جرائم مالی", &["کلاهبرداری", "اختلاس", "پولشویی", "ارتشا"]),
];

// Bytes that show up in nearly every legal text, in either spelling of kaf.
const LEGAL_MARKERS: [&str; 9] = [
    "قانون", "ماده", "دادگاه", "حکم", "حكم", "رأی", "دادنامه", "حقوق", "دعوا",
];

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryScore {
    pub category: LegalCategory,
    pub hits: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LegalEntities {
    pub laws: Vec<String>,
    /// e.g. `ماده 10`, `تبصره 2`, `اصل 44`.
    pub articles: Vec<String>,
    pub courts: Vec<String>,
    pub dates: Vec<String>,
    pub case_numbers: Vec<String>,
}

impl LegalEntities {
    pub fn len(&self) -> usize {
        self.laws.len() + self.articles.len() + self.courts.len() + self.dates.len() + self.case_numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentAnalysis {
    pub category: LegalCategory,
    /// Share of keyword hits that went to `category`, 0.0-1.0.
    pub confidence: f64,
    pub scores: Vec<CategoryScore>,
    pub entities: LegalEntities,
    pub topics: Vec<String>,
    pub quality_score: f64,
    pub is_legal: bool,
}

// =============================================================================
// ANALYSIS
// =============================================================================

fn category_scores(normalized: &str) -> Vec<CategoryScore> {
    CATEGORY_AUTOMATA
        .iter()
        .map(|(category, automaton)| CategoryScore {
            category: *category,
            hits: automaton.find_iter(normalized).count(),
        })
        .collect()
}

/// Best-scoring category and its share of all hits. Ties go to the category
/// listed first. No hits at all means unclassified with zero confidence.
pub fn classify(text: &str) -> (LegalCategory, f64, Vec<CategoryScore>) {
    let scores = category_scores(&normalize(text));
    pick_category(scores)
}

fn pick_category(scores: Vec<CategoryScore>) -> (LegalCategory, f64, Vec<CategoryScore>) {
    let total: usize = scores.iter().map(|s| s.hits).sum();
    if total == 0 {
        return (LegalCategory::Unclassified, 0.0, scores);
    }

    let mut best = &scores[0];
    for score in &scores[1..] {
        if score.hits > best.hits {
            best = score;
        }
    }
    let (category, confidence) = (best.category, best.hits as f64 / total as f64);
    (category, confidence, scores)
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

pub fn extract_entities(text: &str) -> LegalEntities {
    let normalized = normalize(text);
    entities_of(&normalized)
}

fn entities_of(normalized: &str) -> LegalEntities {
    let mut entities = LegalEntities::default();

    for m in LAW_RE.find_iter(normalized) {
        push_unique(&mut entities.laws, m.as_str().to_string());
    }
    for caps in ARTICLE_RE.captures_iter(normalized) {
        push_unique(&mut entities.articles, format!("{} {}", &caps[1], &caps[2]));
    }
    for m in COURT_RE.find_iter(normalized) {
        push_unique(&mut entities.courts, m.as_str().to_string());
    }
    for m in DATE_RE.find_iter(normalized) {
        push_unique(&mut entities.dates, m.as_str().to_string());
    }
    for caps in CASE_NUMBER_RE.captures_iter(normalized) {
        push_unique(&mut entities.case_numbers, caps[1].to_string());
    }

    entities
}

pub fn tag_topics(text: &str) -> Vec<String> {
    topics_of(&normalize(text))
}

fn topics_of(normalized: &str) -> Vec<String> {
    TOPICS
        .iter()
        .filter(|(_, needles)| needles.iter().any(|n| normalized.contains(n)))
        .map(|(topic, _)| topic.to_string())
        .collect()
}

/// 0.0-1.0. Length carries 0.4 (saturating at 2000 chars), citable
/// entities 0.3 (saturating at 5), classifier confidence 0.2, and having
/// any topic at all 0.1.
fn quality_score(normalized: &str, entities: &LegalEntities, confidence: f64, has_topics: bool) -> f64 {
    let length = (normalized.chars().count() as f64 / 2000.0).min(1.0);
    let citations = (entities.len() as f64 / 5.0).min(1.0);
    let topical = if has_topics { 1.0 } else { 0.0 };
    (length * 0.4 + citations * 0.3 + confidence * 0.2 + topical * 0.1).clamp(0.0, 1.0)
}

/// Everything at once, over a single normalisation of `text`.
pub fn analyze(text: &str) -> DocumentAnalysis {
    if text.trim().is_empty() {
        return DocumentAnalysis {
            category: LegalCategory::Unclassified,
            confidence: 0.0,
            scores: Vec::new(),
            entities: LegalEntities::default(),
            topics: Vec::new(),
            quality_score: 0.0,
            is_legal: false,
        };
    }

    let normalized = normalize(text);
    let (category, confidence, scores) = pick_category(category_scores(&normalized));
    let entities = entities_of(&normalized);
    let topics = topics_of(&normalized);
    let quality_score = quality_score(&normalized, &entities, confidence, !topics.is_empty());
    let is_legal = category != LegalCategory::Unclassified || quick_legal_check(&normalized);

    debug!(
        category = %category,
        confidence = confidence,
        entities = entities.len(),
        quality = quality_score,
        "Document analysed"
    );

    DocumentAnalysis {
        category,
        confidence,
        scores,
        entities,
        topics,
        quality_score,
        is_legal,
    }
}

/// Analyse many texts in parallel across all cores.
pub fn analyze_many(texts: &[String]) -> Vec<DocumentAnalysis> {
    texts.par_iter().map(|text| analyze(text)).collect()
}

/// Analyse in chunks of `chunk_size`, each chunk in parallel on the blocking
/// pool, pausing `delay` between chunks so a large batch doesn't starve the
/// rest of the engine. Results come back in input order.
pub async fn batch_analyze(texts: &[String], chunk_size: usize, delay: Duration) -> Vec<DocumentAnalysis> {
    let mut results = Vec::with_capacity(texts.len());

    for (i, chunk) in texts.chunks(chunk_size.max(1)).enumerate() {
        if i > 0 {
            tokio::time::sleep(delay).await;
        }
        let owned = chunk.to_vec();
        match tokio::task::spawn_blocking(move || analyze_many(&owned)).await {
            Ok(analysed) => results.extend(analysed),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                warn!(error = %e, done = results.len(), "Batch analysis cancelled");
                break;
            }
        }
    }

    results
}

/// Byte-level pre-filter: does the text contain any common legal marker?
/// Works on raw or normalised text.
pub fn quick_legal_check(text: &str) -> bool {
    let bytes = text.as_bytes();
    LEGAL_MARKERS
        .iter()
        .any(|marker| memchr::memmem::find(bytes, marker.as_bytes()).is_some())
}
