//! Axum HTTP surface for the certgate gateway.
//!
//! Thin shell over [`certgate_runtime::GatewayService`]: handlers parse the
//! request, call the service and map its outcome to a response.
//!
//! # Request Flow
//!
//! 1. **HTTP Request** arrives at an Axum handler
//! 2. **Extract** `cpf` and `nome` from the JSON body
//! 3. **Submit** through the shared `GatewayService`
//! 4. **Map** the reply or [`GatewayError`](certgate_core::GatewayError) to a response
//!
//! # Example
//!
//! ```ignore
//! use certgate_web::{AppState, build_router};
//!
//! let app = build_router(AppState::new(service));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:5001").await?;
//! axum::serve(listener, app).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod router;
pub mod state;

// Re-export key types for convenience
pub use error::AppError;
pub use router::build_router;
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
