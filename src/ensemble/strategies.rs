//! The built-in detection strategies. Each is a plain function over a
//! shared [`StrategyContext`]; the ensemble keeps them in a registry keyed
//! by name.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{DriftThresholds, StrategyWeights};
use crate::drift;
use crate::error::StrategyError;
use crate::features;
use crate::models::{Baseline, DetectionSignal, StyleMetrics};

pub const STATISTICAL: &str = "statistical";
pub const PATTERN: &str = "pattern";
pub const LINGUISTIC: &str = "linguistic";
pub const BASELINE: &str = "baseline";
pub const ANTI_EVASION: &str = "anti_evasion";

static STOCK_PHRASE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:delve|delves|tapestry|testament to|pivotal|multifaceted|underscore[sd]?|realm|landscape|foster(?:s|ing)?|navigat(?:e|ing) the complexities|it is important to note|plays? a crucial role|in today's (?:world|society)|in summary|in conclusion|ever-evolving|seamless(?:ly)?)\b",
    )
    .expect("valid stock phrase regex")
});
static HOMOGLYPH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z]+[\p{Cyrillic}\p{Greek}]|[\p{Cyrillic}\p{Greek}]+[A-Za-z]")
        .expect("valid homoglyph regex")
});
static INVISIBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\u{200B}-\u{200D}\u{2060}\u{FEFF}\u{00AD}]").expect("valid invisible regex")
});
static SPACED_PUNCT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\s] {2,}[^\s]|\s+[,;:!?]").expect("valid spacing regex"));

/// Everything a strategy may read. Built once per text (or segment) and
/// shared across strategies.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub text: String,
    pub metrics: StyleMetrics,
    pub baseline: Option<Baseline>,
    pub drift: DriftThresholds,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutput {
    pub score: f64,
    pub signals: Vec<DetectionSignal>,
}

pub type AnalyzeFn = fn(&StrategyContext) -> Result<StrategyOutput, StrategyError>;

#[derive(Debug, Clone, Copy)]
pub struct Strategy {
    pub name: &'static str,
    pub weight: f64,
    /// Skipped, and left out of weight normalization, without a baseline.
    pub requires_baseline: bool,
    pub analyze: AnalyzeFn,
}

pub fn registry(weights: &StrategyWeights) -> Vec<Strategy> {
    vec![
        Strategy {
            name: STATISTICAL,
            weight: weights.statistical,
            requires_baseline: false,
            analyze: statistical,
        },
        Strategy {
            name: PATTERN,
            weight: weights.pattern,
            requires_baseline: false,
            analyze: pattern,
        },
        Strategy {
            name: LINGUISTIC,
            weight: weights.linguistic,
            requires_baseline: false,
            analyze: linguistic,
        },
        Strategy {
            name: BASELINE,
            weight: weights.baseline,
            requires_baseline: true,
            analyze: baseline_comparison,
        },
        Strategy {
            name: ANTI_EVASION,
            weight: weights.anti_evasion,
            requires_baseline: false,
            analyze: anti_evasion,
        },
    ]
}

fn ramp(value: f64, from: f64, to: f64) -> f64 {
    ((value - from) / (to - from)).clamp(0.0, 1.0)
}

/// Surface statistics: machine text keeps sentence lengths uniform and
/// spreads repeated words evenly.
pub fn statistical(ctx: &StrategyContext) -> Result<StrategyOutput, StrategyError> {
    let lengths = features::sentence_word_counts(&ctx.text);
    if lengths.len() < 2 {
        return Err(StrategyError::new(
            STATISTICAL,
            "needs at least two sentences",
        ));
    }
    let words = features::words(&ctx.text);
    let cv = features::coefficient_of_variation(&lengths);
    let uniformity = 1.0 - ramp(cv, 0.0, 0.6);
    let mut signals = vec![DetectionSignal::new(
        "uniform_sentence_length",
        uniformity,
        vec![format!(
            "sentence length varies by {:.2} (coefficient of variation) across {} sentences",
            cv,
            lengths.len()
        )],
    )];

    let repeats = ctx
        .metrics
        .vocabulary
        .word_frequencies
        .values()
        .any(|&c| c > 2.0);
    let score = if repeats {
        let burstiness = features::burstiness(&words);
        let evenness = 1.0 - ramp(burstiness, 0.0, 0.7);
        signals.push(DetectionSignal::new(
            "low_burstiness",
            evenness,
            vec![
                format!("repeated-word burstiness {burstiness:.2}"),
                format!("word entropy {:.2} bits", features::word_entropy(&words)),
                format!("bigram perplexity {:.2}", features::bigram_perplexity(&words)),
            ],
        ));
        0.6 * uniformity + 0.4 * evenness
    } else {
        uniformity
    };
    Ok(StrategyOutput { score, signals })
}

/// Recurring n-grams, repeated sentence openers and stock phrasing.
pub fn pattern(ctx: &StrategyContext) -> Result<StrategyOutput, StrategyError> {
    let words = features::words(&ctx.text);
    if words.is_empty() {
        return Err(StrategyError::new(PATTERN, "no words to analyze"));
    }
    let trigram = features::repeated_ngram_ratio(&words, 3);
    let openers = features::opener_repetition(&features::sentences(&ctx.text));
    let hits: Vec<&str> = STOCK_PHRASE_RE
        .find_iter(&ctx.text)
        .map(|m| m.as_str())
        .collect();
    let density = hits.len() as f64 * 100.0 / words.len() as f64;

    let repetition = ramp(trigram, 0.0, 0.15);
    let opener_score = ramp(openers, 0.3, 0.8);
    let stock = ramp(density, 0.0, 2.0);

    let mut signals = Vec::new();
    if repetition > 0.0 {
        signals.push(DetectionSignal::new(
            "repeated_ngrams",
            repetition,
            vec![format!("{:.1}% of word trigrams recur", trigram * 100.0)],
        ));
    }
    if opener_score > 0.0 {
        signals.push(DetectionSignal::new(
            "repetitive_openers",
            opener_score,
            vec![format!("{:.0}% of sentences share an opening word", openers * 100.0)],
        ));
    }
    if !hits.is_empty() {
        let distinct: BTreeSet<String> = hits.iter().map(|h| h.to_lowercase()).collect();
        signals.push(DetectionSignal::new(
            "stock_phrasing",
            stock,
            distinct.into_iter().map(|h| format!("uses \"{h}\"")).collect(),
        ));
    }
    Ok(StrategyOutput {
        score: 0.35 * repetition + 0.25 * opener_score + 0.4 * stock,
        signals,
    })
}

/// Syntax sophistication: reading level, dense vocabulary, connective use.
pub fn linguistic(ctx: &StrategyContext) -> Result<StrategyOutput, StrategyError> {
    let v = &ctx.metrics.vocabulary;
    let s = &ctx.metrics.style;
    if v.word_count == 0.0 || s.sentence_count == 0.0 {
        return Err(StrategyError::new(LINGUISTIC, "no sentences to analyze"));
    }
    let parts = [
        (
            "elevated_reading_level",
            ramp(s.grade_level, 6.0, 14.0),
            format!("reading grade level {:.1}", s.grade_level),
        ),
        (
            "dense_complex_vocabulary",
            ramp(v.complex_word_ratio, 0.0, 0.25),
            format!("{:.0}% complex words", v.complex_word_ratio * 100.0),
        ),
        (
            "heavy_transition_use",
            ramp(s.transition_density, 0.0, 0.5),
            format!("{:.2} transition words per sentence", s.transition_density),
        ),
        (
            "long_word_choice",
            ramp(v.average_word_length, 4.0, 6.5),
            format!("average word length {:.1}", v.average_word_length),
        ),
    ];
    let score = parts.iter().map(|(_, score, _)| score).sum::<f64>() / parts.len() as f64;
    let signals = parts
        .into_iter()
        .filter(|(_, score, _)| *score > 0.0)
        .map(|(kind, score, evidence)| DetectionSignal::new(kind, score, vec![evidence]))
        .collect();
    Ok(StrategyOutput { score, signals })
}

/// Deviation from the student's own profile, via the drift detector.
pub fn baseline_comparison(ctx: &StrategyContext) -> Result<StrategyOutput, StrategyError> {
    let baseline = ctx
        .baseline
        .as_ref()
        .ok_or_else(|| StrategyError::new(BASELINE, "no baseline supplied"))?;
    let changes = drift::compare(&ctx.metrics, &baseline.aggregate_metrics, &ctx.drift);
    let score = drift::drift_score(&changes, &ctx.drift);
    let signals = changes
        .into_iter()
        .map(|c| {
            DetectionSignal::new(
                format!("style_drift:{}", c.dimension.as_str()),
                c.confidence,
                vec![c.description],
            )
        })
        .collect();
    Ok(StrategyOutput { score, signals })
}

/// Masking tricks: look-alike characters, invisible characters, thesaurus
/// substitution and irregular spacing.
pub fn anti_evasion(ctx: &StrategyContext) -> Result<StrategyOutput, StrategyError> {
    let words = features::words(&ctx.text);
    if words.is_empty() {
        return Err(StrategyError::new(ANTI_EVASION, "no words to analyze"));
    }
    let mut signals = Vec::new();

    let homoglyphs = HOMOGLYPH_RE.find_iter(&ctx.text).count();
    let invisible = INVISIBLE_RE.find_iter(&ctx.text).count();
    if homoglyphs > 0 {
        signals.push(DetectionSignal::new(
            "mixed_script_characters",
            1.0,
            vec![format!("{homoglyphs} words mix Latin and look-alike letters")],
        ));
    }
    if invisible > 0 {
        signals.push(DetectionSignal::new(
            "invisible_characters",
            1.0,
            vec![format!("{invisible} zero-width or soft-hyphen characters")],
        ));
    }
    let strong: f64 = if homoglyphs + invisible > 0 { 1.0 } else { 0.0 };

    // Complex words used exactly once, or absent from the student's profile.
    let frequencies = &ctx.metrics.vocabulary.word_frequencies;
    let substituted = match &ctx.baseline {
        Some(b) => {
            let known = &b.aggregate_metrics.vocabulary.word_frequencies;
            words
                .iter()
                .filter(|w| features::is_complex(w) && !known.contains_key(*w))
                .count()
        }
        None => words
            .iter()
            .filter(|w| features::is_complex(w) && frequencies.get(*w) == Some(&1.0))
            .count(),
    };
    let substitution_ratio = substituted as f64 / words.len() as f64;
    let substitution = ramp(substitution_ratio, 0.0, 0.12);
    if substitution > 0.0 {
        signals.push(DetectionSignal::new(
            "synonym_substitution",
            substitution,
            vec![format!(
                "{:.1}% of words are uncommon complex substitutions",
                substitution_ratio * 100.0
            )],
        ));
    }

    let sentences = ctx.metrics.style.sentence_count.max(1.0);
    let spacing_ratio = SPACED_PUNCT_RE.find_iter(&ctx.text).count() as f64 / sentences;
    let spacing = ramp(spacing_ratio, 0.0, 1.0);
    if spacing > 0.0 {
        signals.push(DetectionSignal::new(
            "irregular_spacing",
            spacing,
            vec![format!("{spacing_ratio:.2} spacing irregularities per sentence")],
        ));
    }

    let soft = 0.6 * substitution + 0.4 * spacing;
    Ok(StrategyOutput {
        score: strong.max(soft),
        signals,
    })
}
