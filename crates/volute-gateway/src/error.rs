use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// Uniform JSON error responder for the HTTP surface.
///
/// Library-crate errors are mapped onto the daemon's status taxonomy here,
/// in one place, so handlers can use `?` throughout.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(%message, "internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<volute_store::StoreError> for ApiError {
    fn from(e: volute_store::StoreError) -> Self {
        use volute_store::StoreError;
        match &e {
            StoreError::NotFound { .. } => Self::not_found(e.to_string()),
            StoreError::UsernameTaken(_) | StoreError::ChannelTaken(_) => {
                Self::conflict(e.to_string())
            }
            StoreError::InvalidCredentials => Self::unauthorized(e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<volute_registry::RegistryError> for ApiError {
    fn from(e: volute_registry::RegistryError) -> Self {
        use volute_registry::RegistryError;
        match &e {
            RegistryError::InvalidName(_) => Self::bad_request(e.to_string()),
            RegistryError::DuplicateName(_) | RegistryError::PortInUse(_) => {
                Self::conflict(e.to_string())
            }
            RegistryError::NotFound(_) | RegistryError::VariantNotFound { .. } => {
                Self::not_found(e.to_string())
            }
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<volute_supervisor::SupervisorError> for ApiError {
    fn from(e: volute_supervisor::SupervisorError) -> Self {
        use volute_supervisor::SupervisorError;
        if let SupervisorError::Registry(inner) = e {
            return Self::from(inner);
        }
        match &e {
            SupervisorError::UnknownMind(_) => Self::not_found(e.to_string()),
            SupervisorError::AlreadyRunning(_) | SupervisorError::NotRunning(_) => {
                Self::conflict(e.to_string())
            }
            SupervisorError::ShuttingDown => Self::upstream(e.to_string()),
            SupervisorError::StartupTimeout(_) => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, e.to_string())
            }
            SupervisorError::StartupFailed { .. } | SupervisorError::PortConflict { .. } => {
                Self::upstream(e.to_string())
            }
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<volute_budget::BudgetError> for ApiError {
    fn from(e: volute_budget::BudgetError) -> Self {
        use volute_budget::BudgetError;
        match &e {
            BudgetError::InvalidLimit => Self::bad_request(e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
