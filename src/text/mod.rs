//! Text normalization and variant generation.
//!
//! Pure functions shared by detection dedup (stable hashing), the
//! promotion resolver (variant lookup), and the pattern generator.
//! Diagram text is noisy: OCR drifts on case, spacing, punctuation and
//! leading zeros, so matching happens over normalized forms.

pub mod patterns;

/// Canonical form used for stable hashes and promotion cache keys:
/// trimmed, upper-cased, internal whitespace runs collapsed to one space.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            for upper in ch.to_uppercase() {
                out.push(upper);
            }
            last_was_space = false;
        }
    }
    out
}

/// Drop every character that is not alphanumeric.
pub fn strip_special(text: &str) -> String {
    text.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Remove leading zeros from every digit run ("P-007A" → "P-7A").
/// A run that is all zeros keeps a single zero.
pub fn strip_leading_zeros(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            run.push(ch);
        } else {
            flush_digit_run(&mut out, &mut run);
            out.push(ch);
        }
    }
    flush_digit_run(&mut out, &mut run);
    out
}

fn flush_digit_run(out: &mut String, run: &mut String) {
    if run.is_empty() {
        return;
    }
    let trimmed = run.trim_start_matches('0');
    if trimmed.is_empty() {
        out.push('0');
    } else {
        out.push_str(trimmed);
    }
    run.clear();
}

/// Ordered list of lookup candidates for a detected text, most literal
/// first. Duplicates are removed while preserving order.
pub fn variants(text: &str) -> Vec<String> {
    let trimmed = text.trim().to_string();
    let folded = normalize(text);
    let stripped = strip_special(&folded);
    let zeroless = strip_leading_zeros(&folded);
    let stripped_zeroless = strip_leading_zeros(&stripped);

    let mut out: Vec<String> = Vec::with_capacity(5);
    for candidate in [trimmed, folded, stripped, zeroless, stripped_zeroless] {
        if !candidate.is_empty() && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}
