//! Subject syntax and matching.
//!
//! Subjects are dot separated token strings. `*` matches exactly one token
//! and `>` matches one or more trailing tokens. A subject made only of
//! literal tokens is called literal.

const TOKEN_SEP: char = '.';
const WILDCARD_ONE: &str = "*";
const WILDCARD_TAIL: &str = ">";

/// Maximum length for stream and consumer names.
pub const MAX_NAME_LEN: usize = 32;

/// Returns true if `name` is usable as a stream or consumer name.
/// Names must be non-empty, within the length cap, and free of token
/// separators and wildcards.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Returns true if `subject` is syntactically valid: no empty tokens and
/// wildcards only as whole tokens, with `>` terminal.
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split(TOKEN_SEP).collect();
    for (i, tok) in tokens.iter().enumerate() {
        if tok.is_empty() {
            return false;
        }
        if tok.contains('*') && *tok != WILDCARD_ONE {
            return false;
        }
        if tok.contains('>') && (*tok != WILDCARD_TAIL || i != tokens.len() - 1) {
            return false;
        }
    }
    true
}

/// Returns true if `subject` contains any wildcard token.
pub fn is_literal(subject: &str) -> bool {
    subject
        .split(TOKEN_SEP)
        .all(|t| t != WILDCARD_ONE && t != WILDCARD_TAIL)
}

/// Literal subject match against a pattern that may contain wildcards.
pub fn matches(subject: &str, pattern: &str) -> bool {
    subject_is_subset_match(subject, pattern)
}

/// Returns true if everything matched by `subject` is also matched by
/// `pattern`. Both sides may contain wildcards; a literal subject on the
/// left degrades to a plain match.
pub fn subject_is_subset_match(subject: &str, pattern: &str) -> bool {
    let mut sub = subject.split(TOKEN_SEP);
    let mut pat = pattern.split(TOKEN_SEP);

    loop {
        match (sub.next(), pat.next()) {
            (None, None) => return true,
            (Some(_), Some(WILDCARD_TAIL)) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
            (Some(WILDCARD_TAIL), Some(_)) => return false,
            (Some(s), Some(WILDCARD_ONE)) => {
                // A tail wildcard is broader than a single token.
                if s == WILDCARD_TAIL {
                    return false;
                }
            }
            (Some(s), Some(p)) => {
                if s == WILDCARD_ONE || s != p {
                    return false;
                }
            }
        }
    }
}

/// Returns true if the two patterns can both match some subject.
pub fn subjects_collide(a: &str, b: &str) -> bool {
    let mut ta = a.split(TOKEN_SEP);
    let mut tb = b.split(TOKEN_SEP);

    loop {
        match (ta.next(), tb.next()) {
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
            (Some(WILDCARD_TAIL), Some(_)) | (Some(_), Some(WILDCARD_TAIL)) => return true,
            (Some(WILDCARD_ONE), Some(_)) | (Some(_), Some(WILDCARD_ONE)) => continue,
            (Some(x), Some(y)) => {
                if x != y {
                    return false;
                }
            }
        }
    }
}
