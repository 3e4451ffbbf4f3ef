use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    /// Maps the framework's `exc_type` (falling back to the HTTP status) onto
    /// the client's error codes.
    pub fn classify(exc_type: Option<&str>, status: u16) -> Self {
        match exc_type {
            Some("AuthenticationError" | "SessionExpired" | "CSRFTokenError") => Self::Unauthorized,
            Some("PermissionError") => Self::Forbidden,
            Some("DoesNotExistError" | "PageDoesNotExistError") => Self::NotFound,
            Some(
                "ValidationError"
                | "MandatoryError"
                | "LinkValidationError"
                | "DuplicateEntryError"
                | "InvalidStatusError",
            ) => Self::Validation,
            Some("TooManyRequestsError" | "RateLimitExceededError") => Self::RateLimited,
            _ => match status {
                401 => Self::Unauthorized,
                403 => Self::Forbidden,
                404 => Self::NotFound,
                409 | 417 | 422 => Self::Validation,
                429 => Self::RateLimited,
                _ => Self::Internal,
            },
        }
    }
}

/// Error body returned by `/api/method/*` on failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    /// JSON-encoded list of JSON-encoded `{ "message": ... }` objects.
    #[serde(
        default,
        rename = "_server_messages",
        skip_serializing_if = "Option::is_none"
    )]
    pub server_messages: Option<String>,
}

impl FrameworkErrorBody {
    pub fn user_message(&self) -> Option<String> {
        if let Some(raw) = &self.server_messages {
            let decoded = serde_json::from_str::<Vec<String>>(raw)
                .ok()
                .and_then(|entries| {
                    entries.into_iter().find_map(|entry| {
                        serde_json::from_str::<serde_json::Value>(&entry)
                            .ok()
                            .and_then(|v| v.get("message")?.as_str().map(str::to_string))
                    })
                });
            if decoded.is_some() {
                return decoded;
            }
        }
        self.exception.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_framework(status: u16, body: &FrameworkErrorBody) -> Self {
        let code = ErrorCode::classify(body.exc_type.as_deref(), status);
        let message = body
            .user_message()
            .or_else(|| body.exc_type.clone())
            .unwrap_or_else(|| format!("request failed with status {status}"));
        Self { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permission_error_as_forbidden() {
        assert_eq!(
            ErrorCode::classify(Some("PermissionError"), 500),
            ErrorCode::Forbidden
        );
    }

    #[test]
    fn falls_back_to_status_for_unknown_exc_type() {
        assert_eq!(ErrorCode::classify(Some("Weird"), 429), ErrorCode::RateLimited);
        assert_eq!(ErrorCode::classify(None, 503), ErrorCode::Internal);
    }

    #[test]
    fn extracts_first_server_message() {
        let body = FrameworkErrorBody {
            exc_type: Some("ValidationError".into()),
            exception: Some("frappe.exceptions.ValidationError: raw".into()),
            server_messages: Some(
                serde_json::to_string(&vec![r#"{"message": "Channel is archived"}"#]).unwrap(),
            ),
        };
        let err = ApiError::from_framework(417, &body);
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.message, "Channel is archived");
        assert_eq!(err.to_string(), "Validation: Channel is archived");
    }
}
