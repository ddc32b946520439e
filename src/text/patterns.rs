//! Search-template generation for pattern-mode detection.
//!
//! Asset aliases in a site tend to share a shape ("120-P-001A",
//! "120-P-002B", ...). Instead of shipping every alias to the detection
//! service, pattern mode derives a small set of templates from those
//! shapes: digit runs become fixed-width `#` placeholders and variable
//! single-letter suffixes collapse into a bracketed class, so the two
//! aliases above yield `###-P-###[AB]`. Operators can add overrides at
//! unit, site or global scope; overrides outrank generated templates.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

/// Override tiers, narrowest scope first in precedence.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PatternOverrides {
    #[serde(default)]
    pub unit: Vec<String>,
    #[serde(default)]
    pub site: Vec<String>,
    #[serde(default)]
    pub global: Vec<String>,
}

impl PatternOverrides {
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.unit.is_empty() && self.site.is_empty() && self.global.is_empty()
    }

    pub fn len(&self) -> usize {
        self.unit.len() + self.site.len() + self.global.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("unclosed character class in pattern '{0}'")]
    UnclosedClass(String),
    #[error("character class in pattern '{0}' may only contain A-Z and 0-9")]
    InvalidClass(String),
    #[error("pattern '{pattern}' failed to compile: {source}")]
    Compile {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Derive search templates from alias strings.
///
/// Aliases without any digit run are ignored: a template with no
/// placeholder is just an exact string, and exact strings are the
/// standard pass's job. Output is deduplicated and sorted.
pub fn generate_patterns<'a, I>(aliases: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    // Group shape templates by their stem so variable one-letter
    // suffixes ("...#A" / "...#B") can merge into one class.
    let mut suffixed: BTreeMap<String, BTreeSet<char>> = BTreeMap::new();
    let mut plain: BTreeSet<String> = BTreeSet::new();

    for alias in aliases {
        let Some(template) = shape_template(alias) else {
            continue;
        };
        match split_letter_suffix(&template) {
            Some((stem, letter)) => {
                suffixed.entry(stem.to_string()).or_default().insert(letter);
            }
            None => {
                plain.insert(template);
            }
        }
    }

    let mut out: BTreeSet<String> = plain;
    for (stem, letters) in suffixed {
        if letters.len() == 1 {
            let mut template = stem;
            template.extend(letters);
            out.insert(template);
        } else {
            let mut template = stem;
            template.push('[');
            template.extend(letters);
            template.push(']');
            out.insert(template);
        }
    }
    out.into_iter().collect()
}

/// Template for one alias: digit runs become `#` placeholders of the
/// same width, everything else is kept literally (upper-cased).
/// Returns None when the alias contains no digits.
fn shape_template(alias: &str) -> Option<String> {
    let alias = alias.trim();
    if alias.is_empty() || !alias.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut out = String::with_capacity(alias.len());
    for ch in alias.chars() {
        if ch.is_ascii_digit() {
            out.push('#');
        } else {
            for upper in ch.to_uppercase() {
                out.push(upper);
            }
        }
    }
    Some(out)
}

/// Split a trailing single letter off a template when it directly
/// follows a digit placeholder ("###-P-###A" → ("###-P-###", 'A')).
/// Two-letter suffixes stay literal.
fn split_letter_suffix(template: &str) -> Option<(&str, char)> {
    let last = template.chars().last()?;
    if !last.is_ascii_uppercase() {
        return None;
    }
    let stem = &template[..template.len() - last.len_utf8()];
    if stem.ends_with('#') {
        Some((stem, last))
    } else {
        None
    }
}

/// Merge override tiers with generated templates. Precedence is
/// unit over site over global over generated; exact duplicates keep
/// their first (highest-precedence) occurrence.
pub fn merge_patterns(generated: Vec<String>, overrides: &PatternOverrides) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(generated.len() + overrides.len());
    for tier in [
        overrides.unit.as_slice(),
        overrides.site.as_slice(),
        overrides.global.as_slice(),
        generated.as_slice(),
    ] {
        for pattern in tier {
            let trimmed = pattern.trim();
            if !trimmed.is_empty() && !out.iter().any(|p| p == trimmed) {
                out.push(trimmed.to_string());
            }
        }
    }
    out
}

/// Compile a template to an anchored, case-insensitive regex.
/// `#` matches one digit, `[...]` is a class restricted to A-Z and 0-9,
/// every other character matches literally.
pub fn compile_pattern(pattern: &str) -> Result<Regex, PatternError> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(PatternError::Empty);
    }
    let mut regex_src = String::with_capacity(pattern.len() + 8);
    regex_src.push_str("(?i)^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '#' => regex_src.push_str("[0-9]"),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    class.push(inner);
                }
                if !closed {
                    return Err(PatternError::UnclosedClass(pattern.to_string()));
                }
                if class.is_empty()
                    || !class
                        .chars()
                        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
                {
                    return Err(PatternError::InvalidClass(pattern.to_string()));
                }
                regex_src.push('[');
                regex_src.push_str(&class);
                regex_src.push(']');
            }
            other => regex_src.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_src.push('$');
    Regex::new(&regex_src).map_err(|source| PatternError::Compile {
        pattern: pattern.to_string(),
        source,
    })
}
