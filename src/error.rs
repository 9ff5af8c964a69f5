//! Error taxonomy and the JSON response returned to callers
//!
//! Callers only ever see an [`ActionResponse`]: a success flag, a stable
//! error code and a fixed human-readable summary. The detailed error text
//! (command lines, runtime stderr) is written to the per-site log instead.

use crate::store::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Error codes reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or malformed request fields
    InvalidPayload,
    /// Cloning or extracting the site source failed
    AcquisitionFailed,
    /// The container image could not be built
    BuildFailed,
    /// The container runtime rejected a command
    RuntimeFailed,
    /// The local fallback store could not be written
    StoreFailed,
    /// Another action holds the site lock
    SiteBusy,
    /// Unexpected local failure
    InternalError,
}

impl ErrorCode {
    /// Stable string form of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::AcquisitionFailed => "ACQUISITION_FAILED",
            ErrorCode::BuildFailed => "BUILD_FAILED",
            ErrorCode::RuntimeFailed => "RUNTIME_FAILED",
            ErrorCode::StoreFailed => "STORE_FAILED",
            ErrorCode::SiteBusy => "SITE_BUSY",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Summary shown to the caller in place of the detailed error
    pub fn summary(&self) -> &'static str {
        match self {
            ErrorCode::InvalidPayload => "Invalid request",
            ErrorCode::AcquisitionFailed => {
                "Could not fetch the site source; see the deployment log"
            }
            ErrorCode::BuildFailed => "Image build failed; see the deployment log",
            ErrorCode::RuntimeFailed => {
                "Container runtime command failed; see the deployment log"
            }
            ErrorCode::StoreFailed => "Could not record the site state",
            ErrorCode::SiteBusy => "Another action is already running for this site",
            ErrorCode::InternalError => "Internal error; see the deployment log",
        }
    }
}

/// Everything that can abort an action
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("source acquisition failed: {0}")]
    Acquisition(String),

    #[error("image build failed: {0}")]
    Build(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("timed out waiting for the lock on site {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        OrchestratorError::Validation(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::Validation(_) => ErrorCode::InvalidPayload,
            OrchestratorError::Acquisition(_) => ErrorCode::AcquisitionFailed,
            OrchestratorError::Build(_) => ErrorCode::BuildFailed,
            OrchestratorError::Runtime(_) => ErrorCode::RuntimeFailed,
            OrchestratorError::Store(_) => ErrorCode::StoreFailed,
            OrchestratorError::Busy(_) => ErrorCode::SiteBusy,
            OrchestratorError::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to hand back to the caller.
    ///
    /// Validation messages only describe the caller's own input, so they are
    /// passed through; everything else collapses to the code's summary.
    pub fn public_message(&self) -> String {
        match self {
            OrchestratorError::Validation(detail) => format!("Invalid request: {}", detail),
            other => other.code().summary().to_string(),
        }
    }
}

/// JSON body printed for every invocation
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            code: None,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok(message)
        }
    }

    pub fn failure(error: &OrchestratorError) -> Self {
        Self::error(error.code(), error.public_message())
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            message: message.into(),
            data: None,
        }
    }

    /// Convert to a single JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":{},"message":"{}"}}"#,
                self.success,
                self.message.replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            OrchestratorError::validation("name is required").code(),
            ErrorCode::InvalidPayload
        );
        assert_eq!(
            OrchestratorError::Build("exit 1".into()).code(),
            ErrorCode::BuildFailed
        );
        assert_eq!(
            OrchestratorError::Busy("demo".into()).code(),
            ErrorCode::SiteBusy
        );
        assert_eq!(ErrorCode::RuntimeFailed.as_str(), "RUNTIME_FAILED");
    }

    #[test]
    fn test_failure_hides_runtime_detail() {
        let error = OrchestratorError::Runtime(
            "podman run -d --name website-demo failed: port is already allocated".into(),
        );
        let response = ActionResponse::failure(&error);
        let json = response.to_json();

        assert!(!response.success);
        assert!(json.contains("\"code\":\"RUNTIME_FAILED\""));
        assert!(!json.contains("podman"));
        assert!(!json.contains("data"));
    }

    #[test]
    fn test_validation_detail_is_shown() {
        let response = ActionResponse::failure(&OrchestratorError::validation("name is required"));
        assert_eq!(response.message, "Invalid request: name is required");
    }

    #[test]
    fn test_ok_response_json() {
        let response =
            ActionResponse::ok_with("done", serde_json::json!({ "subdomain": "demo" }));
        let json = response.to_json();

        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"subdomain\":\"demo\""));
        assert!(!json.contains("\"code\""));
    }
}
