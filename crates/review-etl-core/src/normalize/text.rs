//! Text field clean-up.

use unicode_normalization::UnicodeNormalization;

/// Trim and collapse runs of whitespace into single spaces.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// NFKC-normalize, then collapse whitespace. Compatibility forms
/// (full-width letters, ligatures, no-break spaces) fold to their plain
/// equivalents.
pub fn clean_text(s: &str) -> String {
    collapse_whitespace(&s.nfkc().collect::<String>())
}

/// Title-case: a letter is upper-cased when the previous character is not a
/// letter, otherwise lower-cased (`"o'NEIL tv-stand"` → `"O'Neil Tv-Stand"`).
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for ch in s.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}
