//! Certificate request endpoint.

use crate::WebResult;
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use certgate_core::ReplyPayload;
use serde::Deserialize;

/// Request body of `POST /solicitar-certificado`.
///
/// Both fields are optional at the JSON level so a missing field becomes a
/// validation error with the usual message instead of a parse failure.
#[derive(Debug, Default, Deserialize)]
pub struct CertificateForm {
    /// Taxpayer id.
    #[serde(default)]
    pub cpf: Option<String>,
    /// Holder name.
    #[serde(default)]
    pub nome: Option<String>,
}

/// Request a certificate and wait for the worker's reply.
///
/// # Endpoint
///
/// ```text
/// POST /solicitar-certificado
/// Content-Type: application/json
///
/// {"cpf": "12345678900", "nome": "Ana"}
/// ```
///
/// # Status Codes
///
/// - 200 OK: the worker's reply, verbatim (certificate or `{"error": ...}`)
/// - 400 Bad Request: missing `cpf`/`nome` or unreadable body
/// - 503 Service Unavailable: broker unreachable
/// - 500 Internal Server Error: configuration or publish failure
/// - 504 Gateway Timeout: no reply in time
///
/// # Errors
///
/// Returns [`AppError`] for every non-200 outcome.
pub async fn request_certificate(
    State(state): State<AppState>,
    body: Result<Json<CertificateForm>, JsonRejection>,
) -> WebResult<Json<ReplyPayload>> {
    let Json(form) = body.map_err(|rejection| {
        tracing::debug!(error = %rejection, "Rejected request body");
        AppError::bad_request("CPF e nome são obrigatórios")
    })?;

    let cpf = form.cpf.unwrap_or_default();
    let nome = form.nome.unwrap_or_default();
    tracing::debug!("Certificate requested");

    let reply = state.service.submit(&cpf, &nome).await?;
    Ok(Json(reply))
}
