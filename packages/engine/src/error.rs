use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "SchemaValidationError")]
    SchemaValidation,
    #[serde(rename = "CrossOwnershipError")]
    CrossOwnership,
    #[serde(rename = "InvalidDeclarationError")]
    InvalidDeclaration,
    #[serde(rename = "UnknownReplicant")]
    UnknownReplicant,
    #[serde(rename = "UndeclaredReplicant")]
    UndeclaredReplicant,
    #[serde(rename = "UnknownOperationMethod")]
    UnknownOperationMethod,
    #[serde(rename = "PersistenceError")]
    Persistence,
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SchemaValidation => "SchemaValidationError",
            ErrorKind::CrossOwnership => "CrossOwnershipError",
            ErrorKind::InvalidDeclaration => "InvalidDeclarationError",
            ErrorKind::UnknownReplicant => "UnknownReplicant",
            ErrorKind::UndeclaredReplicant => "UndeclaredReplicant",
            ErrorKind::UnknownOperationMethod => "UnknownOperationMethod",
            ErrorKind::Persistence => "PersistenceError",
            ErrorKind::Internal => "InternalError",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicantError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<JsonValue>,
}

impl ReplicantError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(kind: ErrorKind, message: impl Into<String>, details: JsonValue) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn schema_validation(message: impl Into<String>, details: JsonValue) -> Self {
        Self::with_details(ErrorKind::SchemaValidation, message, details)
    }

    pub fn cross_ownership(message: impl Into<String>, details: JsonValue) -> Self {
        Self::with_details(ErrorKind::CrossOwnership, message, details)
    }

    pub fn invalid_declaration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidDeclaration, message)
    }

    pub fn unknown_replicant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownReplicant, message)
    }

    pub fn undeclared_replicant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UndeclaredReplicant, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl std::fmt::Display for ReplicantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ReplicantError {}

/// Wire form carried on the transport's ack channel when a subscriber's
/// proposed mutations are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl From<&ReplicantError> for ErrorEnvelope {
    fn from(error: &ReplicantError) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
            details: error.details.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_to_wire_names() {
        let kind = serde_json::to_value(ErrorKind::SchemaValidation).unwrap();
        assert_eq!(kind, serde_json::json!("SchemaValidationError"));

        let parsed: ErrorKind =
            serde_json::from_value(serde_json::json!("CrossOwnershipError")).unwrap();
        assert_eq!(parsed, ErrorKind::CrossOwnership);
    }

    #[test]
    fn envelope_round_trips_details() {
        let error = ReplicantError::schema_validation(
            "count must be a number",
            serde_json::json!([{"path": "/count"}]),
        );
        let envelope = ErrorEnvelope::from(&error);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["kind"], "SchemaValidationError");
        let back: ErrorEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }
}
