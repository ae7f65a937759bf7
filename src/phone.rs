use thiserror::Error;

const MIN_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

pub const USER_JID_SUFFIX: &str = "@s.whatsapp.net";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhoneError {
    #[error("phone number is empty")]
    Empty,
    #[error("phone number contains invalid characters: {0}")]
    InvalidCharacters(String),
    #[error("phone number must have between 8 and 15 digits, got {0}")]
    InvalidLength(usize),
    #[error("phone number cannot start with 0 after the country code prefix")]
    LeadingZero,
    #[error("unsupported recipient address: {0}")]
    InvalidJid(String),
}

/// Normalizes a human-entered number to bare E.164 digits (no `+`).
pub fn normalize_phone(raw: &str) -> Result<String, PhoneError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PhoneError::Empty);
    }

    let compact: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    let digits = compact
        .strip_prefix('+')
        .or_else(|| compact.strip_prefix("00"))
        .unwrap_or(&compact);

    if digits.is_empty() {
        return Err(PhoneError::Empty);
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(PhoneError::InvalidCharacters(raw.to_string()));
    }
    if digits.len() < MIN_DIGITS || digits.len() > MAX_DIGITS {
        return Err(PhoneError::InvalidLength(digits.len()));
    }
    if digits.starts_with('0') {
        return Err(PhoneError::LeadingZero);
    }
    Ok(digits.to_string())
}

/// Accepts a phone number or a WhatsApp JID and returns the JID to deliver to.
pub fn normalize_recipient(raw: &str) -> Result<String, PhoneError> {
    let trimmed = raw.trim();
    let Some((local, domain)) = trimmed.split_once('@') else {
        return Ok(format!("{}{}", normalize_phone(trimmed)?, USER_JID_SUFFIX));
    };

    match domain.to_ascii_lowercase().as_str() {
        "s.whatsapp.net" | "c.us" => {
            let digits = normalize_phone(local)?;
            Ok(format!("{}{}", digits, USER_JID_SUFFIX))
        }
        "g.us" => {
            let valid = !local.is_empty()
                && local.chars().all(|c| c.is_ascii_digit() || c == '-');
            if valid {
                Ok(format!("{}@g.us", local))
            } else {
                Err(PhoneError::InvalidJid(raw.to_string()))
            }
        }
        _ => Err(PhoneError::InvalidJid(raw.to_string())),
    }
}
