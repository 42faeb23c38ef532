//! Vocabulary and style metrics derived from raw text.
//!
//! Everything here is a pure function of its input: no randomness, no I/O,
//! and map-typed outputs use `BTreeMap` so two runs over the same text
//! produce identical values.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{StyleFeatures, StyleMetrics, VocabularyMetrics};

static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+(?:['’][\p{L}]+)*").expect("valid word regex"));
static SENTENCE_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+").expect("valid sentence regex"));
static PARAGRAPH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t\r]*\n").expect("valid paragraph regex"));
static VOWEL_GROUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[aeiouy]+").expect("valid vowel regex"));

pub const TRANSITION_WORDS: &[&str] = &[
    "accordingly",
    "additionally",
    "as a result",
    "besides",
    "consequently",
    "finally",
    "firstly",
    "for example",
    "for instance",
    "furthermore",
    "hence",
    "however",
    "in addition",
    "in conclusion",
    "in contrast",
    "indeed",
    "likewise",
    "meanwhile",
    "moreover",
    "nevertheless",
    "on the other hand",
    "overall",
    "secondly",
    "similarly",
    "subsequently",
    "therefore",
    "thus",
    "ultimately",
];

pub const PUNCTUATION_MARKS: &[char] = &[',', '.', ';', ':', '!', '?', '-', '\'', '"', '(', ')'];

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "are", "as", "at", "be", "because", "been",
    "but", "by", "can", "could", "did", "do", "for", "from", "had", "has", "have", "he", "her",
    "him", "his", "i", "if", "in", "into", "is", "it", "its", "me", "my", "not", "of", "on", "or",
    "our", "she", "so", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "to", "was", "we", "were", "what", "when", "which", "who", "will", "with", "would",
    "you", "your",
];

const SUFFIXES: &[&str] = &["es", "ed"];

pub fn words(text: &str) -> Vec<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Byte ranges of sentences, terminal punctuation included. A trailing run of
/// text without a terminator still counts as a sentence.
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut push = |from: usize, to: usize| {
        let slice = &text[from..to];
        let lead = slice.len() - slice.trim_start().len();
        if WORD_RE.is_match(slice) {
            spans.push((from + lead, to));
        }
    };
    for m in SENTENCE_END_RE.find_iter(text) {
        push(start, m.end());
        start = m.end();
    }
    if start < text.len() {
        let tail = text[start..].trim_end();
        push(start, start + tail.len());
    }
    spans
}

pub fn sentences(text: &str) -> Vec<&str> {
    sentence_spans(text)
        .into_iter()
        .map(|(s, e)| text[s..e].trim())
        .collect()
}

pub fn paragraphs(text: &str) -> Vec<&str> {
    PARAGRAPH_RE
        .split(text)
        .map(str::trim)
        .filter(|p| WORD_RE.is_match(p))
        .collect()
}

/// Vowel-group count after stripping common silent suffixes. Never below 1.
pub fn count_syllables(word: &str) -> usize {
    let lower = word.to_lowercase();
    let mut stem = lower.as_str();
    if stem.chars().count() > 3 {
        if let Some(suffix) = SUFFIXES.iter().find(|s| stem.ends_with(*s)) {
            stem = &stem[..stem.len() - suffix.len()];
        } else if stem.ends_with('e') && !stem.ends_with("le") {
            stem = &stem[..stem.len() - 1];
        }
    }
    VOWEL_GROUP_RE.find_iter(stem).count().max(1)
}

pub fn is_complex(word: &str) -> bool {
    word.chars().count() > 8 || count_syllables(word) > 3
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m <= 0.0 {
        0.0
    } else {
        variance(values).sqrt() / m
    }
}

pub fn sentence_word_counts(text: &str) -> Vec<f64> {
    sentences(text)
        .iter()
        .map(|s| WORD_RE.find_iter(s).count() as f64)
        .collect()
}

/// Mean dispersion (std / mean) of the gaps between repeated occurrences of
/// the same word. Human writing tends to cluster repeats.
pub fn burstiness(words: &[String]) -> f64 {
    let mut positions: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, word) in words.iter().enumerate() {
        positions.entry(word.as_str()).or_default().push(i);
    }
    let mut scores: Vec<f64> = positions
        .values()
        .filter(|p| p.len() > 2)
        .map(|p| {
            let gaps: Vec<f64> = p.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
            coefficient_of_variation(&gaps)
        })
        .collect();
    // HashMap iteration order is random; sort so the sum is reproducible.
    scores.sort_by(f64::total_cmp);
    mean(&scores)
}

/// Shannon entropy of the word distribution, in bits.
pub fn word_entropy(words: &[String]) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for word in words {
        *counts.entry(word.as_str()).or_insert(0) += 1;
    }
    let total = words.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Perplexity of the text under its own bigram model.
pub fn bigram_perplexity(words: &[String]) -> f64 {
    if words.len() < 2 {
        return 0.0;
    }
    let mut unigrams: HashMap<&str, usize> = HashMap::new();
    let mut bigrams: HashMap<(&str, &str), usize> = HashMap::new();
    for w in words {
        *unigrams.entry(w.as_str()).or_insert(0) += 1;
    }
    for pair in words.windows(2) {
        *bigrams.entry((pair[0].as_str(), pair[1].as_str())).or_insert(0) += 1;
    }
    let n = (words.len() - 1) as f64;
    let log_sum: f64 = words
        .windows(2)
        .map(|pair| {
            let joint = bigrams[&(pair[0].as_str(), pair[1].as_str())] as f64;
            let first = unigrams[pair[0].as_str()] as f64;
            -(joint / first).log2()
        })
        .sum();
    2f64.powf(log_sum / n)
}

/// Fraction of word n-grams that occur more than once.
pub fn repeated_ngram_ratio(words: &[String], n: usize) -> f64 {
    if n == 0 || words.len() < n {
        return 0.0;
    }
    let mut counts: HashMap<&[String], usize> = HashMap::new();
    for gram in words.windows(n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    let total = words.len() - n + 1;
    let repeated: usize = counts.values().filter(|&&c| c > 1).sum();
    repeated as f64 / total as f64
}

/// Fraction of sentences whose first word also opens another sentence.
pub fn opener_repetition(sentences: &[&str]) -> f64 {
    let openers: Vec<String> = sentences
        .iter()
        .filter_map(|s| WORD_RE.find(s).map(|m| m.as_str().to_lowercase()))
        .collect();
    if openers.len() < 2 {
        return 0.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for opener in &openers {
        *counts.entry(opener.as_str()).or_insert(0) += 1;
    }
    let repeated = openers.iter().filter(|o| counts[o.as_str()] > 1).count();
    repeated as f64 / openers.len() as f64
}

pub fn flesch_kincaid_grade(words_per_sentence: f64, syllables_per_word: f64) -> f64 {
    (0.39 * words_per_sentence + 11.8 * syllables_per_word - 15.59).clamp(0.0, 18.0)
}

fn count_phrase(padded: &str, phrase: &str) -> usize {
    padded.matches(&format!(" {phrase} ")).count()
}

/// Ranks a frequency table: highest count first, ties alphabetical.
pub fn top_words(frequencies: &BTreeMap<String, f64>, limit: usize) -> Vec<String> {
    let mut ranked: Vec<(&String, f64)> = frequencies
        .iter()
        .filter(|(w, _)| !STOPWORDS.contains(&w.as_str()))
        .map(|(w, &c)| (w, c))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().take(limit).map(|(w, _)| w.clone()).collect()
}

#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    top_words: usize,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self { top_words: 20 }
    }
}

impl FeatureExtractor {
    pub fn new(top_words: usize) -> Self {
        Self { top_words }
    }

    pub fn extract(&self, text: &str) -> StyleMetrics {
        let tokens = words(text);
        StyleMetrics {
            vocabulary: self.vocabulary(&tokens),
            style: style(text, &tokens),
        }
    }

    fn vocabulary(&self, tokens: &[String]) -> VocabularyMetrics {
        let mut word_frequencies: BTreeMap<String, f64> = BTreeMap::new();
        for token in tokens {
            *word_frequencies.entry(token.clone()).or_insert(0.0) += 1.0;
        }
        let word_count = tokens.len() as f64;
        let per_word = |total: f64| if tokens.is_empty() { 0.0 } else { total / word_count };

        let complex = tokens.iter().filter(|w| is_complex(w)).count() as f64;
        let letters: usize = tokens.iter().map(|w| w.chars().count()).sum();
        let syllables: usize = tokens.iter().map(|w| count_syllables(w)).sum();
        let rare_words = word_frequencies
            .iter()
            .filter(|(_, &c)| c == 1.0)
            .map(|(w, _)| w.clone())
            .collect();

        VocabularyMetrics {
            word_count,
            unique_word_count: word_frequencies.len() as f64,
            complex_word_ratio: per_word(complex),
            average_word_length: per_word(letters as f64),
            lexical_diversity: per_word(word_frequencies.len() as f64),
            average_syllables_per_word: per_word(syllables as f64),
            common_words: top_words(&word_frequencies, self.top_words),
            rare_words,
            word_frequencies,
        }
    }
}

fn style(text: &str, tokens: &[String]) -> StyleFeatures {
    let lengths = sentence_word_counts(text);
    let sentence_count = lengths.len() as f64;
    let paragraph_count = paragraphs(text).len() as f64;
    let word_count = tokens.len() as f64;

    let padded = format!(" {} ", tokens.join(" "));
    let transition_words: BTreeMap<String, f64> = TRANSITION_WORDS
        .iter()
        .filter_map(|phrase| {
            let n = count_phrase(&padded, phrase);
            (n > 0).then(|| (phrase.to_string(), n as f64))
        })
        .collect();
    let transitions: f64 = transition_words.values().sum();

    let mut punctuation: BTreeMap<String, f64> = BTreeMap::new();
    for c in text.chars().filter(|c| PUNCTUATION_MARKS.contains(c)) {
        *punctuation.entry(c.to_string()).or_insert(0.0) += 1.0;
    }
    let marks: f64 = punctuation.values().sum();

    let average_sentence_length = mean(&lengths);
    let syllables_per_word = if tokens.is_empty() {
        0.0
    } else {
        tokens.iter().map(|w| count_syllables(w)).sum::<usize>() as f64 / word_count
    };
    let grade_level = if tokens.is_empty() {
        0.0
    } else {
        flesch_kincaid_grade(average_sentence_length, syllables_per_word)
    };

    StyleFeatures {
        sentence_count,
        paragraph_count,
        average_sentence_length,
        sentence_length_variance: variance(&lengths),
        average_paragraph_length: if paragraph_count > 0.0 {
            sentence_count / paragraph_count
        } else {
            0.0
        },
        transition_words,
        transition_density: if sentence_count > 0.0 {
            transitions / sentence_count
        } else {
            0.0
        },
        punctuation,
        punctuation_density: if word_count > 0.0 { marks / word_count } else { 0.0 },
        grade_level,
    }
}
