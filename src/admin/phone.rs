//! E.164 phone normalization.

use crate::security::SecurityError;

/// Normalize `raw` to `+<digits>`.
///
/// Accepts `+CC…`, `00CC…`, bare national numbers (10 digits, prefixed with
/// `default_cc`) and `CC…` numbers already carrying `default_cc`. Spaces,
/// dashes, dots and parentheses are ignored.
pub fn normalize_phone(raw: &str, default_cc: &str) -> Result<String, SecurityError> {
    let trimmed = raw.trim();
    let mut has_plus = false;
    let mut digits = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            '0'..='9' => digits.push(c),
            '+' if digits.is_empty() && !has_plus => has_plus = true,
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => {
                return Err(SecurityError::ValidationFailed(
                    "phone number contains invalid characters".into(),
                ));
            }
        }
    }

    let international = if has_plus {
        digits
    } else if let Some(rest) = digits.strip_prefix("00") {
        rest.to_string()
    } else if let Some(rest) = digits.strip_prefix('0').filter(|r| r.len() == 10) {
        format!("{}{}", default_cc, rest)
    } else if digits.len() == 10 {
        format!("{}{}", default_cc, digits)
    } else {
        digits
    };

    if !(8..=15).contains(&international.len()) || international.starts_with('0') {
        return Err(SecurityError::ValidationFailed(
            "phone number must be a valid E.164 number".into(),
        ));
    }
    Ok(format!("+{}", international))
}
