//! Error types and JSON error responses for the panel API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors from the provisioning path
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The request itself is unusable (empty remark, quota overflow)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No administrative user exists to own the inbound
    #[error("no owner user available; create an admin user first")]
    NoOwnerAvailable,

    /// The store rejected the write for a reason other than a conflict
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(#[source] StoreError),

    /// Every randomly chosen port collided with an enabled inbound
    #[error("no free port found after {attempts} attempts")]
    PortAllocationExhausted { attempts: u32 },

    /// The existing inbound for a remark has unusable settings
    #[error("inbound '{remark}' has corrupt settings: {reason}")]
    CorruptSettings { remark: String, reason: String },
}

/// Errors from the SQLite store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An inbound with this remark already exists
    #[error("inbound with remark '{0}' already exists")]
    RemarkConflict(String),

    /// An enabled inbound already listens on this port
    #[error("port {0} is already used by an enabled inbound")]
    PortConflict(u16),

    /// No inbound carries this remark
    #[error("inbound with remark '{0}' not found")]
    NotFound(String),

    /// A stored row could not be decoded
    #[error("inbound {id}: corrupt {field}: {reason}")]
    Corrupt {
        id: i64,
        field: &'static str,
        reason: String,
    },

    /// A settings document could not be serialized
    #[error("failed to encode {field}: {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors from the settings documents
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("settings contain no clients")]
    NoClients,
}

/// Errors from restarting the managed proxy
#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("restart failed: {0:#}")]
    Failed(anyhow::Error),

    #[error("restart timed out after {0:?}")]
    TimedOut(Duration),
}

/// Error codes returned by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Malformed body or invalid parameters
    InvalidRequest,
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown route
    NotFound,
    /// No owner user exists yet
    NoOwnerAvailable,
    /// No free port in the allocation range
    PortAllocationExhausted,
    /// Stored inbound could not be decoded
    CorruptSettings,
    /// Store failure
    ProvisioningFailed,
    /// Anything else
    InternalError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::NoOwnerAvailable => StatusCode::CONFLICT,
            ApiErrorCode::PortAllocationExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::CorruptSettings => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::ProvisioningFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Api-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidRequest => "INVALID_REQUEST",
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::NoOwnerAvailable => "NO_OWNER_AVAILABLE",
            ApiErrorCode::PortAllocationExhausted => "PORT_ALLOCATION_EXHAUSTED",
            ApiErrorCode::CorruptSettings => "CORRUPT_SETTINGS",
            ApiErrorCode::ProvisioningFailed => "PROVISIONING_FAILED",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&ProvisionError> for ApiErrorCode {
    fn from(err: &ProvisionError) -> Self {
        match err {
            ProvisionError::InvalidRequest(_) => ApiErrorCode::InvalidRequest,
            ProvisionError::NoOwnerAvailable => ApiErrorCode::NoOwnerAvailable,
            ProvisionError::ProvisioningFailed(_) => ApiErrorCode::ProvisioningFailed,
            ProvisionError::PortAllocationExhausted { .. } => ApiErrorCode::PortAllocationExhausted,
            ProvisionError::CorruptSettings { .. } => ApiErrorCode::CorruptSettings,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always false, mirrors the success envelope
    pub success: bool,
    /// The error code
    pub code: ApiErrorCode,
    /// Human-readable error message
    pub msg: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            status: code.status_code().as_u16(),
            code,
            msg: msg.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","msg":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.msg.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Api-Error header
pub fn json_error_response(code: ApiErrorCode, msg: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, msg);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Api-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
