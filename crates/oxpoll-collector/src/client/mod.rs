//! Protocol clients. Each collector owns its own client and connection
//! pool; clients are never shared across collectors.

pub mod rest;
pub mod zapi;

use oxpoll_common::config::{AuthStyle, Credentials};
use oxpoll_common::error::{Error, Result};
use std::time::Duration;

/// Builds the HTTP client shared by both transports: bounded by the
/// poller's client_timeout, optionally trusting a private CA or
/// presenting a client certificate.
pub(crate) fn build_http_client(
    credentials: &Credentials,
    timeout_secs: u64,
    use_insecure_tls: bool,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .danger_accept_invalid_certs(use_insecure_tls);

    if let Some(ca_cert) = &credentials.ca_cert {
        let pem = std::fs::read(ca_cert)?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| Error::Config(format!("ca_cert {ca_cert:?}: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    if credentials.auth_style == AuthStyle::CertificateAuth {
        let cert_path = credentials
            .ssl_cert
            .as_ref()
            .ok_or_else(|| Error::Auth("certificate_auth without ssl_cert".to_string()))?;
        let key_path = credentials
            .ssl_key
            .as_ref()
            .ok_or_else(|| Error::Auth("certificate_auth without ssl_key".to_string()))?;
        let mut pem = std::fs::read(cert_path)?;
        pem.extend(std::fs::read(key_path)?);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::Auth(format!("client certificate: {e}")))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("http client: {e}")))
}

/// Maps transport failures onto the poller's error classes.
pub(crate) fn classify_transport(context: &str, e: reqwest::Error) -> Error {
    if e.is_decode() || e.is_body() {
        Error::Protocol(format!("{context}: {e}"))
    } else {
        Error::Transient(format!("{context}: {e}"))
    }
}

/// Maps an HTTP status onto the poller's error classes; `None` means the
/// call succeeded.
pub(crate) fn classify_status(context: &str, status: reqwest::StatusCode) -> Option<Error> {
    if status.is_success() {
        None
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        Some(Error::Auth(format!("{context}: {status}")))
    } else if status.is_server_error() {
        Some(Error::Transient(format!("{context}: {status}")))
    } else {
        Some(Error::Protocol(format!("{context}: {status}")))
    }
}
