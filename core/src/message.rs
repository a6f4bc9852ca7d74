//! Request and reply bodies exchanged with the certificate worker.
//!
//! Both directions are JSON. A reply may take either of two shapes; each
//! shape's fields are required.

use serde::{Deserialize, Serialize};

/// Body published to the request queue.
///
/// `timestamp` is milliseconds since the Unix epoch at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    /// Taxpayer id of the certificate holder.
    pub cpf: String,
    /// Full name of the certificate holder.
    pub nome: String,
    /// Submission time in Unix milliseconds.
    pub timestamp: i64,
}

/// Body the worker publishes back to the reply queue.
///
/// The worker answers either with the certificate record or with an error
/// object (for example when no certificate matches). Both are forwarded to the
/// caller unchanged.
///
/// # Examples
///
/// ```
/// use certgate_core::message::ReplyPayload;
///
/// let reply: ReplyPayload = serde_json::from_str(r#"{"error":"Certificado não encontrado"}"#)?;
/// assert!(reply.is_failure());
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyPayload {
    /// Certificate found.
    Certificate {
        /// Holder name as stored by the worker.
        nome: String,
        /// Holder taxpayer id.
        cpf: String,
        /// Completion date, formatted by the worker.
        data_conclusao: String,
        /// Final grade. Kept as a JSON number so `9` and `9.5` survive unchanged;
        /// `null` when the worker has no grade on record.
        nota: Option<serde_json::Number>,
    },
    /// Worker-side failure, e.g. certificate not found.
    Failure {
        /// Human readable reason.
        error: String,
    },
}

impl ReplyPayload {
    /// Parse a raw message body.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the body is not valid JSON or matches
    /// neither reply shape.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// True when the worker reported an error instead of a certificate.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn certificate_reply_keeps_fractional_grade() {
        let body = br#"{"nome":"Ana","cpf":"123","data_conclusao":"2024-01-01","nota":9.5}"#;
        let reply = ReplyPayload::from_slice(body).unwrap();

        assert!(!reply.is_failure());
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"nome": "Ana", "cpf": "123", "data_conclusao": "2024-01-01", "nota": 9.5})
        );
    }

    #[test]
    fn integer_grade_is_not_widened() {
        let body = br#"{"nome":"Ana","cpf":"123","data_conclusao":"01/01/2024","nota":9}"#;
        let reply = ReplyPayload::from_slice(body).unwrap();

        assert_eq!(serde_json::to_string(&reply).unwrap(), String::from_utf8_lossy(body));
    }

    #[test]
    fn error_reply_is_a_failure() {
        let reply = ReplyPayload::from_slice(r#"{"error":"Certificado não encontrado"}"#.as_bytes()).unwrap();
        assert_eq!(
            reply,
            ReplyPayload::Failure {
                error: "Certificado não encontrado".to_string()
            }
        );
    }

    #[test]
    fn unrecognised_shapes_are_rejected() {
        assert!(ReplyPayload::from_slice(b"not json").is_err());
        assert!(ReplyPayload::from_slice(br#"{"nome":"Ana"}"#).is_err());
        assert!(ReplyPayload::from_slice(b"[]").is_err());
    }

    #[test]
    fn request_serializes_expected_fields() {
        let request = CertificateRequest {
            cpf: "123".to_string(),
            nome: "Ana".to_string(),
            timestamp: 1_735_689_600_000,
        };

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"cpf": "123", "nome": "Ana", "timestamp": 1_735_689_600_000_i64})
        );
    }

    proptest::proptest! {
        #[test]
        fn any_error_text_is_forwarded_verbatim(reason in ".*") {
            let body = serde_json::to_vec(&json!({"error": reason})).unwrap();
            let reply = ReplyPayload::from_slice(&body).unwrap();

            proptest::prop_assert!(reply.is_failure());
            proptest::prop_assert_eq!(serde_json::to_vec(&reply).unwrap(), body);
        }
    }
}
