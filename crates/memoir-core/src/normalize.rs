//! Term normalization applied at every term boundary: index insert, index
//! lookup, property keying, and alias resolution.

use unicode_normalization::UnicodeNormalization;

/// Normalize a term: Unicode NFC, trim, collapse internal whitespace runs
/// to a single space, lowercase. Idempotent.
pub fn normalize_term(text: &str) -> String {
    let composed: String = text.nfc().collect();
    composed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_collapses_and_lowercases() {
        assert_eq!(normalize_term("  Foo\tBAR  "), "foo bar");
        assert_eq!(normalize_term("foo bar"), "foo bar");
        assert_eq!(normalize_term("FOO BAR"), "foo bar");
        assert_eq!(normalize_term("a\n\n b\t\tc"), "a b c");
    }

    #[test]
    fn composes_to_nfc() {
        // "e" + combining acute accent composes to a single code point.
        let decomposed = "Cafe\u{0301}";
        assert_eq!(normalize_term(decomposed), "caf\u{e9}");
    }

    #[test]
    fn is_idempotent() {
        for s in ["  Foo\tBAR  ", "Cafe\u{0301}", "", "  ", "hello world"] {
            let once = normalize_term(s);
            assert_eq!(normalize_term(&once), once);
        }
    }
}
