//! Lexicon-based polarity scoring for review text.
//!
//! Each token found in [`LEXICON`] contributes its polarity. A preceding
//! intensifier scales it by 1.3; a negator within the two previous tokens
//! flips it and halves its magnitude. The score is the mean contribution,
//! clamped to `[-1.0, 1.0]`; text without any lexicon hit scores `0.0`.

/// Sorted by word for binary search.
const LEXICON: &[(&str, f64)] = &[
    ("amazing", 0.6),
    ("awesome", 1.0),
    ("awful", -1.0),
    ("bad", -0.7),
    ("best", 1.0),
    ("broken", -0.4),
    ("cheap", 0.4),
    ("comfortable", 0.4),
    ("decent", 0.17),
    ("defective", -0.6),
    ("disappointed", -0.75),
    ("disappointing", -0.6),
    ("durable", 0.3),
    ("easy", 0.43),
    ("excellent", 1.0),
    ("fantastic", 0.4),
    ("fast", 0.2),
    ("fine", 0.42),
    ("flimsy", -0.5),
    ("good", 0.7),
    ("great", 0.8),
    ("happy", 0.8),
    ("hate", -0.8),
    ("horrible", -1.0),
    ("love", 0.5),
    ("loved", 0.7),
    ("mediocre", -0.3),
    ("nice", 0.6),
    ("ok", 0.5),
    ("okay", 0.5),
    ("perfect", 1.0),
    ("poor", -0.4),
    ("recommend", 0.3),
    ("reliable", 0.4),
    ("slow", -0.3),
    ("solid", 0.3),
    ("terrible", -1.0),
    ("useless", -0.5),
    ("waste", -0.2),
    ("worst", -1.0),
    ("worth", 0.3),
    ("wrong", -0.5),
];

const NEGATORS: &[&str] = &["never", "no", "not", "nothing", "nobody"];
const INTENSIFIERS: &[&str] = &["extremely", "incredibly", "really", "so", "super", "very"];

const INTENSIFIER_SCALE: f64 = 1.3;
const NEGATION_SCALE: f64 = -0.5;

fn lookup(word: &str) -> Option<f64> {
    LEXICON
        .binary_search_by(|(w, _)| (*w).cmp(word))
        .ok()
        .map(|i| LEXICON[i].1)
}

fn is_negator(word: &str) -> bool {
    NEGATORS.contains(&word) || word.ends_with("n't")
}

/// Polarity of `text` in `[-1.0, 1.0]`.
pub fn polarity(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .collect();

    let mut total = 0.0;
    let mut hits = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        let Some(mut score) = lookup(token) else {
            continue;
        };

        if i >= 1 && INTENSIFIERS.contains(&tokens[i - 1]) {
            score *= INTENSIFIER_SCALE;
        }
        let negated = tokens[i.saturating_sub(2)..i]
            .iter()
            .any(|t| is_negator(t));
        if negated {
            score *= NEGATION_SCALE;
        }

        total += score;
        hits += 1;
    }

    if hits == 0 {
        return 0.0;
    }
    (total / hits as f64).clamp(-1.0, 1.0)
}
