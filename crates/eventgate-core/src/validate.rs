//! Intake validation
//!
//! Field-level checks on the raw intake request. Failures map to a 400
//! response with one message per offending field.

use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::event::{NewEvent, ALLOWED_EVENT_TYPES, ALLOWED_PLATFORMS};

/// A single field-level validation failure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// All validation failures for one request
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Validate an intake request against the event schema.
pub fn validate(new: &NewEvent) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    if !ALLOWED_EVENT_TYPES.contains(&new.event_type.as_str()) {
        errors.push(
            "event_type",
            format!(
                "must be one of {}",
                ALLOWED_EVENT_TYPES.join(", ")
            ),
        );
    }

    if new.timestamp > Utc::now() {
        errors.push("timestamp", "must not be in the future");
    }

    if let Some(priority) = new.priority {
        if priority > 10 {
            errors.push("priority", "must be between 0 and 10");
        }
    }

    if let Some(key) = &new.idempotency_key {
        if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            errors.push("idempotency_key", "must be 64 lowercase hex characters");
        }
    }

    if !new.payload.is_object() && !new.payload.is_null() {
        errors.push("payload", "must be an object");
    }

    if new.event_type == "purchase" {
        validate_purchase_payload(&new.payload, &mut errors);
    }

    if let Some(metadata) = &new.metadata {
        if !metadata.is_object() {
            errors.push("metadata", "must be an object");
        } else if let Some(platform) = metadata.get("platform").and_then(|v| v.as_str()) {
            if !ALLOWED_PLATFORMS.contains(&platform) {
                errors.push(
                    "metadata.platform",
                    format!("must be one of {}", ALLOWED_PLATFORMS.join(", ")),
                );
            }
        }
    }

    errors.into_result()
}

fn validate_purchase_payload(payload: &serde_json::Value, errors: &mut ValidationErrors) {
    match payload.get("amount").and_then(|v| v.as_f64()) {
        Some(amount) if amount > 0.0 => {}
        Some(_) => errors.push("payload.amount", "must be greater than zero"),
        None => errors.push("payload.amount", "is required for purchase events"),
    }

    match payload.get("currency").and_then(|v| v.as_str()) {
        Some(currency) if currency.len() == 3 => {}
        Some(_) => errors.push("payload.currency", "must be a 3-character code"),
        None => errors.push("payload.currency", "is required for purchase events"),
    }
}
