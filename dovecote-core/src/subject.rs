//! Subject grammar.
//!
//! A subject is a non-empty sequence of `.`-separated tokens. Patterns may
//! use the single-token wildcard `*` or the terminal multi-token wildcard
//! `>`; literal subjects carry neither. Tokens are case-sensitive byte
//! sequences, and an empty token anywhere (including a leading or trailing
//! separator) makes the subject invalid.

use smallvec::SmallVec;

/// Token separator
pub const TSEP: u8 = b'.';
/// Single-token wildcard, matches exactly one token
pub const PWC: u8 = b'*';
/// Multi-token wildcard, matches one or more trailing tokens; final only
pub const FWC: u8 = b'>';

/// Inline token list for typical subject depths.
pub type Tokens<'a> = SmallVec<[&'a [u8]; 8]>;

/// Split a subject into its tokens. Empty tokens are preserved so callers
/// can reject them.
#[must_use]
pub fn tokenize(subject: &[u8]) -> Tokens<'_> {
    subject.split(|b| *b == TSEP).collect()
}

#[inline]
#[must_use]
pub fn is_pwc_token(tok: &[u8]) -> bool {
    tok.len() == 1 && tok[0] == PWC
}

#[inline]
#[must_use]
pub fn is_fwc_token(tok: &[u8]) -> bool {
    tok.len() == 1 && tok[0] == FWC
}

/// Check whether `subject` is admissible as a subscription pattern.
#[must_use]
pub fn is_valid_subject(subject: &[u8]) -> bool {
    if subject.is_empty() {
        return false;
    }
    let toks = tokenize(subject);
    for (i, tok) in toks.iter().enumerate() {
        if tok.is_empty() {
            return false;
        }
        if is_fwc_token(tok) && i != toks.len() - 1 {
            return false;
        }
    }
    true
}

/// Check whether `subject` is a valid literal publish subject: a valid
/// subject whose tokens carry no wildcards.
#[must_use]
pub fn is_valid_literal_subject(subject: &[u8]) -> bool {
    if subject.is_empty() {
        return false;
    }
    for tok in tokenize(subject) {
        if tok.is_empty() || is_pwc_token(tok) || is_fwc_token(tok) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        let toks = tokenize(b"foo.bar.baz");
        assert_eq!(toks.as_slice(), &[b"foo" as &[u8], b"bar", b"baz"]);

        let toks = tokenize(b"foo");
        assert_eq!(toks.as_slice(), &[b"foo" as &[u8]]);
    }

    #[test]
    fn test_valid_subjects() {
        assert!(is_valid_subject(b"foo"));
        assert!(is_valid_subject(b"foo.bar.baz"));
        assert!(is_valid_subject(b"foo.*"));
        assert!(is_valid_subject(b"*.foo.*"));
        assert!(is_valid_subject(b"foo.>"));
        assert!(is_valid_subject(b">"));
    }

    #[test]
    fn test_invalid_subjects() {
        assert!(!is_valid_subject(b""));
        assert!(!is_valid_subject(b"foo..bar"));
        assert!(!is_valid_subject(b".foo"));
        assert!(!is_valid_subject(b"foo."));
        assert!(!is_valid_subject(b"foo.>.bar"));
        assert!(!is_valid_subject(b">.foo"));
    }

    #[test]
    fn test_literal_subjects() {
        assert!(is_valid_literal_subject(b"foo.bar"));
        assert!(!is_valid_literal_subject(b"foo.*"));
        assert!(!is_valid_literal_subject(b"foo.>"));
        assert!(!is_valid_literal_subject(b"foo..bar"));
        assert!(!is_valid_literal_subject(b""));
        // Wildcard characters inside a longer token are literal bytes.
        assert!(is_valid_literal_subject(b"foo.b*r"));
    }
}
