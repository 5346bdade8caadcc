//! Ingress validation.
//!
//! Structural checks applied before anything is persisted: message type
//! grammar, payload shape, priority range, idempotency key limits,
//! transport/queue name grammar. Schedule configs validate in the scheduler
//! module where their types live; cron strings parse in [`crate::cron`].

use serde_json::Value;

use crate::error::MessengerError;
use crate::message::Message;

/// Maximum accepted idempotency key length.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Lowest priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest priority.
pub const MAX_PRIORITY: u8 = 10;

/// Whether `s` is a valid message type: `^[A-Za-z][A-Za-z0-9_]*$`.
pub fn is_valid_message_type(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether `s` is a valid transport or queue name: `^[A-Za-z0-9_-]+$`.
pub fn is_valid_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate a message's type and payload shape.
pub fn validate_message(message: &Message) -> Result<(), MessengerError> {
    if !is_valid_message_type(&message.message_type) {
        return Err(MessengerError::Validation(format!(
            "invalid message type {:?}",
            message.message_type
        )));
    }
    validate_payload(&message.payload)
}

/// Validate that a payload is a JSON object.
pub fn validate_payload(payload: &Value) -> Result<(), MessengerError> {
    if !payload.is_object() {
        return Err(MessengerError::Validation(
            "message payload must be an object".to_string(),
        ));
    }
    Ok(())
}

/// Validate a priority value.
pub fn validate_priority(priority: u8) -> Result<(), MessengerError> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(MessengerError::Validation(format!(
            "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {priority}"
        )));
    }
    Ok(())
}

/// Validate an idempotency key's shape.
pub fn validate_idempotency_key(key: &str) -> Result<(), MessengerError> {
    if key.is_empty() {
        return Err(MessengerError::Validation(
            "idempotency key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(MessengerError::Validation(format!(
            "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    Ok(())
}

/// Validate a transport name.
pub fn validate_transport_name(name: &str) -> Result<(), MessengerError> {
    if !is_valid_name(name) {
        return Err(MessengerError::Validation(format!(
            "invalid transport name {name:?}"
        )));
    }
    Ok(())
}

/// Validate a queue name.
pub fn validate_queue_name(name: &str) -> Result<(), MessengerError> {
    if !is_valid_name(name) {
        return Err(MessengerError::Validation(format!(
            "invalid queue name {name:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_type_grammar() {
        assert!(is_valid_message_type("Echo"));
        assert!(is_valid_message_type("email_send_v2"));
        assert!(!is_valid_message_type(""));
        assert!(!is_valid_message_type("1bad"));
        assert!(!is_valid_message_type("has-dash"));
        assert!(!is_valid_message_type("has space"));
    }

    #[test]
    fn transport_and_queue_name_grammar() {
        assert!(is_valid_name("durable"));
        assert!(is_valid_name("high-priority_2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("dot.name"));
    }

    #[test]
    fn priority_bounds() {
        assert!(validate_priority(1).is_ok());
        assert!(validate_priority(10).is_ok());
        assert!(validate_priority(0).is_err());
        assert!(validate_priority(11).is_err());
    }

    #[test]
    fn idempotency_key_limits() {
        assert!(validate_idempotency_key("k1").is_ok());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key(&"x".repeat(256)).is_err());
        assert!(validate_idempotency_key(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn message_validation_checks_payload_shape() {
        let good = Message::new("Echo", json!({ "n": 1 }));
        assert!(validate_message(&good).is_ok());

        let bad_payload = Message::new("Echo", json!(42));
        assert!(matches!(
            validate_message(&bad_payload),
            Err(MessengerError::Validation(_))
        ));

        let bad_type = Message::new("9nope", json!({}));
        assert!(validate_message(&bad_type).is_err());
    }
}
