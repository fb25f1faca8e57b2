//! Ingredient name normalization.
//!
//! The reference dataset never encodes cooking method or portion size, so
//! those words must go before searching; otherwise AND-search comes back
//! empty for perfectly ordinary names like "banana, medium".

use std::collections::HashSet;

const COOKING_METHODS: &[&str] = &[
    "grilled",
    "baked",
    "fried",
    "steamed",
    "roasted",
    "boiled",
    "sauteed",
    "sautéed",
    "pan-fried",
    "deep-fried",
    "stir-fried",
    "broiled",
    "braised",
    "poached",
    "smoked",
    "cooked",
    "toasted",
    "blanched",
];

const PREPARATION: &[&str] = &[
    "fresh",
    "frozen",
    "raw",
    "organic",
    "free-range",
    "grass-fed",
    "wild-caught",
    "farm-raised",
    "homemade",
    "premium",
    "chopped",
    "diced",
    "sliced",
    "minced",
    "shredded",
    "grated",
    "peeled",
    "cubed",
    "halved",
    "crushed",
];

const SIZE_QUALIFIERS: &[&str] = &[
    "small",
    "medium",
    "large",
    "extra",
    "extra-large",
    "jumbo",
    "mini",
    "big",
    "regular",
    "half",
    "quarter",
    "piece",
    "pieces",
    "slice",
    "slices",
    "serving",
    "servings",
    "portion",
];

/// Words that never narrow a search.
const FILLER: &[&str] = &["and", "with", "of", "in", "the", "a", "or", "on", "for"];

/// Cleaned names that are never matched.
const BLACKLIST: &[&str] = &["water", "ice", "ice cubes", "tap water", "sparkling water"];

fn is_stopword(token: &str) -> bool {
    COOKING_METHODS.contains(&token)
        || PREPARATION.contains(&token)
        || SIZE_QUALIFIERS.contains(&token)
}

/// Lowercase, strip punctuation and qualifiers, collapse whitespace.
#[must_use]
pub fn clean_ingredient_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let spaced: String = lowered
        .chars()
        .filter(|c| *c != '\'' && *c != '’')
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut tokens: Vec<&str> = Vec::new();
    for token in spaced.split_whitespace() {
        let token = token.trim_matches('-');
        if token.is_empty() || is_stopword(token) {
            continue;
        }
        tokens.extend(
            token
                .split('-')
                .filter(|part| !part.is_empty() && !is_stopword(part)),
        );
    }
    tokens.join(" ")
}

/// Tokens worth requiring in a search, deduplicated in order.
#[must_use]
pub fn significant_tokens(cleaned: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    cleaned
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2 && !FILLER.contains(t))
        .filter(|t| seen.insert(*t))
        .map(str::to_string)
        .collect()
}

/// Crude plural folding used for both search patterns and scoring.
/// The result is always a prefix of the input, so it is safe inside `LIKE '%…%'`.
#[must_use]
pub fn stem(token: &str) -> &str {
    if token.len() > 4 && token.ends_with("oes") {
        return &token[..token.len() - 2];
    }
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        return &token[..token.len() - 1];
    }
    token
}

#[must_use]
pub fn is_blacklisted(cleaned: &str) -> bool {
    BLACKLIST.contains(&cleaned)
}

/// Blend of token coverage and Jaro-Winkler over cleaned names, in `[0, 1]`.
#[must_use]
pub fn lexical_similarity(query: &str, candidate: &str) -> f64 {
    let query_tokens = significant_tokens(query);
    let candidate_tokens = significant_tokens(candidate);
    if query_tokens.is_empty() || candidate_tokens.is_empty() {
        return 0.0;
    }
    let candidate_stems: HashSet<&str> = candidate_tokens.iter().map(|t| stem(t)).collect();
    let matched = query_tokens
        .iter()
        .filter(|t| candidate_stems.contains(stem(t)))
        .count();

    #[allow(clippy::cast_precision_loss)]
    let coverage = matched as f64 / query_tokens.len() as f64;
    #[allow(clippy::cast_precision_loss)]
    let precision = matched as f64 / candidate_tokens.len() as f64;
    let jw = strsim::jaro_winkler(query, candidate);

    0.5 * coverage + 0.2 * precision + 0.3 * jw
}
