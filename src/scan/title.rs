use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

static RE_NON_ALPHANUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Known phrases are shortened before tokenization so that, e.g.,
/// "Definitive Edition" and "DE" titles land on the same tokens.
const PHRASE_REPLACEMENTS: &[(&str, &str)] = &[("definitive edition", "de"), ("game of the year", "goty")];

/// Roman numerals `i` through `xx`, as commonly used in game titles.
const ROMAN_NUMERALS: &[(&str, &str)] = &[
    ("i", "1"),
    ("ii", "2"),
    ("iii", "3"),
    ("iv", "4"),
    ("v", "5"),
    ("vi", "6"),
    ("vii", "7"),
    ("viii", "8"),
    ("ix", "9"),
    ("x", "10"),
    ("xi", "11"),
    ("xii", "12"),
    ("xiii", "13"),
    ("xiv", "14"),
    ("xv", "15"),
    ("xvi", "16"),
    ("xvii", "17"),
    ("xviii", "18"),
    ("xix", "19"),
    ("xx", "20"),
];

/// Acceptance requires strictly more than this.
pub const MIN_MATCH_SCORE: f64 = 0.45;
const CONTAINMENT_BONUS: f64 = 0.15;
const AMBIGUOUS_RUNNER_UP_SCORE: f64 = 0.65;
const AMBIGUOUS_GAP: f64 = 0.05;

fn roman_to_decimal(token: &str) -> Option<&'static str> {
    ROMAN_NUMERALS.iter().find(|(roman, _)| *roman == token).map(|(_, decimal)| *decimal)
}

pub fn normalize_title(title: &str) -> String {
    let mut normalized = title.to_lowercase();
    for (phrase, replacement) in PHRASE_REPLACEMENTS {
        normalized = normalized.replace(phrase, replacement);
    }
    let normalized = RE_NON_ALPHANUMERIC.replace_all(&normalized, " ");
    normalized
        .split_whitespace()
        .map(|token| roman_to_decimal(token).unwrap_or(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity in [0, 1]: Jaccard index over normalized token sets, with a
/// bonus when one normalized string contains the other.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a_normalized = normalize_title(a);
    let b_normalized = normalize_title(b);
    if a_normalized.is_empty() || b_normalized.is_empty() {
        return 0.0;
    }

    let a_tokens: BTreeSet<&str> = a_normalized.split_whitespace().collect();
    let b_tokens: BTreeSet<&str> = b_normalized.split_whitespace().collect();

    let intersection = a_tokens.intersection(&b_tokens).count();
    let union = a_tokens.union(&b_tokens).count();
    let mut score = intersection as f64 / union as f64;

    if a_normalized.contains(&b_normalized) || b_normalized.contains(&a_normalized) {
        score += CONTAINMENT_BONUS;
    }

    score.min(1.0)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TitleScore {
    pub title: String,
    pub score: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TitleMatch {
    pub title: String,
    pub score: f64,
    pub ambiguous: bool,
}

/// Scores every catalog title against every query, keeping each title's
/// best score across queries.
pub fn score_titles(queries: &[String], titles: &[&str]) -> Vec<TitleScore> {
    titles
        .iter()
        .map(|title| TitleScore {
            title: title.to_string(),
            score: queries
                .iter()
                .map(|query| similarity(query, title))
                .fold(0.0, f64::max),
        })
        .collect()
}

/// Picks the best-scoring title, or nothing when even the best score fails
/// the acceptance threshold. Flags the result as ambiguous when the
/// runner-up is both strong and close.
pub fn choose(mut scored: Vec<TitleScore>) -> Option<TitleMatch> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.title.cmp(&b.title))
    });

    let top = scored.first()?.clone();
    if top.score <= MIN_MATCH_SCORE {
        return None;
    }

    let ambiguous = scored
        .get(1)
        .map(|runner_up| {
            runner_up.score >= AMBIGUOUS_RUNNER_UP_SCORE && (top.score - runner_up.score) <= AMBIGUOUS_GAP
        })
        .unwrap_or(false);

    Some(TitleMatch {
        title: top.title,
        score: top.score,
        ambiguous,
    })
}
