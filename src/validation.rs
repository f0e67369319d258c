use crate::error::{Error, Result};

/// Validates a phone number: optional leading `+`, 10-15 digits.
pub fn validate_phone(phone: &str) -> Result<()> {
    let trimmed = phone.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Validation(format!("invalid phone number: {}", phone)));
    }
    if !(10..=15).contains(&digits.len()) {
        return Err(Error::Validation(format!(
            "phone number must have 10-15 digits, got {}",
            digits.len()
        )));
    }
    Ok(())
}

/// Rejects empty or whitespace-only required fields.
pub fn validate_required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plausible_phones() {
        assert!(validate_phone("+77011234567").is_ok());
        assert!(validate_phone("87011234567").is_ok());
    }

    #[test]
    fn rejects_bad_phones() {
        assert!(validate_phone("").is_err());
        assert!(validate_phone("+7-701-123").is_err());
        assert!(validate_phone("12345").is_err());
        assert!(validate_phone("abc1234567").is_err());
    }

    #[test]
    fn required_fields_must_be_non_empty() {
        assert!(validate_required("title", "Прайс").is_ok());
        assert!(validate_required("title", "   ").is_err());
    }
}
