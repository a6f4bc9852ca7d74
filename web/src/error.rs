//! Error types for web handlers.
//!
//! [`AppError`] bridges [`GatewayError`] and HTTP responses. Clients get a
//! short user-facing message and a stable code; the underlying error is only
//! logged.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use certgate_core::GatewayError;
use serde::Serialize;
use std::fmt;

/// Application error type for web handlers.
///
/// # Examples
///
/// ```ignore
/// async fn handler(State(state): State<AppState>) -> Result<Json<ReplyPayload>, AppError> {
///     let reply = state.service.submit(&cpf, &nome).await?;
///     Ok(Json(reply))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Error message (user-facing)
    message: String,
    /// Error code (for client error handling)
    code: String,
    /// Internal error (for logging, not exposed to client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
            source: None,
        }
    }

    /// Attach the underlying error for logging.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into(), "VALIDATION_ERROR".to_string())
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message.into(), "NOT_FOUND".to_string())
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorResponse {
    /// Human-readable error message.
    error: String,
    /// Error code (for client error handling).
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = %source,
                    "Request failed"
                );
            } else {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Request failed"
                );
            }
        }

        let body = ErrorResponse {
            error: self.message,
            code: self.code,
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let message = match &err {
            GatewayError::Validation(message) => message.clone(),
            GatewayError::ServiceUnavailable(_) => {
                "Serviço RabbitMQ indisponível. Tente novamente em alguns instantes.".to_string()
            },
            GatewayError::Config(_) => "Erro de configuração do serviço. Tente novamente.".to_string(),
            GatewayError::Publish(_) | GatewayError::Internal(_) => {
                "Erro interno ao processar solicitação. Tente novamente.".to_string()
            },
            GatewayError::Timeout { .. } => "Tempo limite excedido ao aguardar resposta do serviço.".to_string(),
        };

        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = err.code().to_string();
        Self::new(status, message, code).with_source(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::bad_request("CPF e nome são obrigatórios");
        assert_eq!(err.to_string(), "[VALIDATION_ERROR] CPF e nome são obrigatórios");
    }

    #[test]
    fn test_gateway_errors_map_to_statuses() {
        let cases = [
            (GatewayError::Validation("x".to_string()), StatusCode::BAD_REQUEST),
            (GatewayError::ServiceUnavailable("x".to_string()), StatusCode::SERVICE_UNAVAILABLE),
            (GatewayError::Config("x".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
            (GatewayError::Publish("x".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
            (GatewayError::Timeout { timeout_ms: 30_000 }, StatusCode::GATEWAY_TIMEOUT),
        ];

        for (gateway_error, status) in cases {
            let code = gateway_error.code();
            let err = AppError::from(gateway_error);
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let err = AppError::from(GatewayError::Publish("channel 1 closed: PRECONDITION_FAILED".to_string()));
        assert!(!err.to_string().contains("PRECONDITION_FAILED"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
