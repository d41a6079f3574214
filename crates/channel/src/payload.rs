use winback_core::config::ChannelConfig;
use winback_core::DomainError;

/// Recipient format check: optional leading `+`, then digits only, with the
/// digit count inside the configured bounds.
pub fn validate_recipient(address: &str, config: &ChannelConfig) -> Result<(), DomainError> {
    let digits = address.strip_prefix('+').unwrap_or(address);
    if digits.is_empty() {
        return Err(DomainError::Validation("recipient address is empty".to_string()));
    }
    if !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(DomainError::Validation(format!(
            "recipient address `{address}` must be digits with an optional leading +"
        )));
    }
    let count = digits.len();
    if count < config.recipient_min_digits || count > config.recipient_max_digits {
        return Err(DomainError::Validation(format!(
            "recipient address has {count} digits, expected {} to {}",
            config.recipient_min_digits, config.recipient_max_digits
        )));
    }
    Ok(())
}

/// Message body check: non-blank and within the provider's length cap,
/// counted in characters.
pub fn validate_text(text: &str, config: &ChannelConfig) -> Result<(), DomainError> {
    if text.trim().is_empty() {
        return Err(DomainError::Validation("message text is empty".to_string()));
    }
    let length = text.chars().count();
    if length > config.max_message_length {
        return Err(DomainError::Validation(format!(
            "message text has {length} characters, channel limit is {}",
            config.max_message_length
        )));
    }
    Ok(())
}

/// Both checks together, in the order a send runs them. Invalid input never
/// reaches the network.
pub fn validate_outbound(
    recipient: &str,
    text: &str,
    config: &ChannelConfig,
) -> Result<(), DomainError> {
    validate_recipient(recipient, config)?;
    validate_text(text, config)
}
