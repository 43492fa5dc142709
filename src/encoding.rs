//! Encoding artifacts
//!
//! Some identifiers were written to the store straight from a bytes repr,
//! leaving values like `b'1901766 '`. Both the translator (to match them)
//! and the normalizer (to hide them) need to recognise that shape.
//!
//! The wrapper format comes from a specific upstream ingestion defect and is
//! not guaranteed to stay stable across data batches; keep every use of it
//! behind these two functions.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // b'…' or b"…", optional padding inside and outside the quotes
    static ref BYTES_REPR: Regex = Regex::new(r#"^\s*b(['"])(.*?)\s*(['"])\s*$"#).unwrap();
}

/// Inner text of a bytes-repr wrapped value, `None` when `value` is not wrapped.
pub fn unwrap_encoded_text(value: &str) -> Option<String> {
    let caps = BYTES_REPR.captures(value)?;
    if caps[1] != caps[3] {
        return None;
    }
    Some(caps[2].trim().to_string())
}

/// Identifier literal as the user meant it: wrapper and padding removed.
pub fn bare_identifier(value: &str) -> String {
    unwrap_encoded_text(value).unwrap_or_else(|| value.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_single_quoted_with_padding() {
        assert_eq!(unwrap_encoded_text("b'1901766 '"), Some("1901766".to_string()));
        assert_eq!(unwrap_encoded_text("b'6904092'"), Some("6904092".to_string()));
    }

    #[test]
    fn test_unwrap_double_quoted() {
        assert_eq!(unwrap_encoded_text("b\"R\""), Some("R".to_string()));
    }

    #[test]
    fn test_plain_text_is_not_wrapped() {
        assert_eq!(unwrap_encoded_text("1901766"), None);
        assert_eq!(unwrap_encoded_text("bob's float"), None);
        assert_eq!(unwrap_encoded_text("b'mismatched\""), None);
    }

    #[test]
    fn test_bare_identifier() {
        assert_eq!(bare_identifier(" b'2902746  ' "), "2902746");
        assert_eq!(bare_identifier(" 2902746 "), "2902746");
    }
}
