//! HTTP request handlers.

pub mod certificates;
pub mod health;

pub use certificates::request_certificate;
pub use health::{health_check, metrics};
