use unicode_normalization::UnicodeNormalization;

use crate::error::{CoreResult, DoodlepadError};

/// Unicode NFC normalization + BOM strip + CRLF -> LF + trim.
pub fn clean_prompt(s: &str) -> String {
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Clean a free-text prompt and reject it if nothing is left.
/// `what` names the field in the error ("topic", "edit request").
pub fn validate_prompt(s: &str, what: &str) -> CoreResult<String> {
    let cleaned = clean_prompt(s);
    if cleaned.is_empty() {
        return Err(DoodlepadError::Validation(format!("{what} must not be empty")));
    }
    Ok(cleaned)
}
