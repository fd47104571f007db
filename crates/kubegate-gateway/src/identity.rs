//! Inbound caller identity
//!
//! The outer serving layer authenticates callers; this module only extracts
//! what it forwarded. [`CallerIdentity::from_headers`] is the single accessor
//! used at the gateway boundary.
//!
//! Two header forms are understood:
//! - `Authorization: Bearer <token>`: the caller's token is used against the
//!   gateway's configured cluster.
//! - `kubernetes-*` headers: the caller supplies the server, CA and identity,
//!   and no gateway credentials are involved.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// API server URL
pub const SERVER_HEADER: &str = "kubernetes-server";
/// Base64 PEM bundle of trusted CAs
pub const CERTIFICATE_AUTHORITY_DATA_HEADER: &str = "kubernetes-certificate-authority-data";
/// `Bearer <token>` for the target cluster
pub const AUTHORIZATION_HEADER: &str = "kubernetes-authorization";
/// Base64 PEM client certificate
pub const CLIENT_CERTIFICATE_DATA_HEADER: &str = "kubernetes-client-certificate-data";
/// Base64 PEM client key
pub const CLIENT_KEY_DATA_HEADER: &str = "kubernetes-client-key-data";
/// `true` to skip server certificate verification
pub const INSECURE_SKIP_TLS_VERIFY_HEADER: &str = "kubernetes-insecure-skip-tls-verify";

/// Identity a caller presented
#[derive(Clone)]
pub enum CallerIdentity {
    /// Bearer token for the gateway's configured cluster
    Token(Zeroizing<String>),
    /// Client certificate and key (PEM) for the gateway's configured cluster
    ClientCertificate {
        /// PEM certificate chain
        certificate: Vec<u8>,
        /// PEM private key
        key: Zeroizing<Vec<u8>>,
    },
    /// Fully caller-supplied connection and identity
    External(Box<AuthHeaders>),
}

impl CallerIdentity {
    /// Parse `Bearer <token>`; anything else is not a bearer identity
    pub fn bearer(value: &str) -> Option<Self> {
        let token = value.strip_prefix("Bearer ")?.trim();
        (!token.is_empty()).then(|| Self::Token(Zeroizing::new(token.to_string())))
    }

    /// Extract the caller identity from request headers
    ///
    /// `kubernetes-*` headers take precedence over `Authorization`. Returns
    /// `Ok(None)` when the caller presented nothing usable.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>> {
        if headers.contains_key(SERVER_HEADER) {
            return AuthHeaders::from_headers(headers).map(|h| Some(Self::External(Box::new(h))));
        }
        Ok(headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::bearer))
    }

    /// Short label safe for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::ClientCertificate { .. } => "client-certificate",
            Self::External(_) => "external",
        }
    }
}

impl fmt::Debug for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallerIdentity").field(&self.kind()).finish()
    }
}

/// Connection and identity supplied entirely by the caller
#[derive(Clone)]
pub struct AuthHeaders {
    /// API server URL
    pub server: String,
    /// PEM bundle of trusted CAs
    pub certificate_authority: Vec<u8>,
    /// Bearer token
    pub token: Option<Zeroizing<String>>,
    /// PEM client certificate
    pub client_certificate: Option<Vec<u8>>,
    /// PEM client key
    pub client_key: Option<Zeroizing<Vec<u8>>>,
    /// Skip server certificate verification
    pub insecure_skip_tls_verify: bool,
}

impl AuthHeaders {
    /// Parse the `kubernetes-*` header bundle
    ///
    /// Server and CA are required, and either a bearer token or a client
    /// certificate with its key.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let server = required(headers, SERVER_HEADER)?;
        let certificate_authority =
            decode(CERTIFICATE_AUTHORITY_DATA_HEADER, &required(headers, CERTIFICATE_AUTHORITY_DATA_HEADER)?)?;

        let token = match header(headers, AUTHORIZATION_HEADER)? {
            Some(value) => match CallerIdentity::bearer(&value) {
                Some(CallerIdentity::Token(token)) => Some(token),
                _ => {
                    return Err(Error::invalid_identity(format!(
                        "{AUTHORIZATION_HEADER} header must be a bearer token"
                    )))
                }
            },
            None => None,
        };
        let client_certificate = header(headers, CLIENT_CERTIFICATE_DATA_HEADER)?
            .map(|v| decode(CLIENT_CERTIFICATE_DATA_HEADER, &v))
            .transpose()?;
        let client_key = header(headers, CLIENT_KEY_DATA_HEADER)?
            .map(|v| decode(CLIENT_KEY_DATA_HEADER, &v).map(Zeroizing::new))
            .transpose()?;
        let insecure_skip_tls_verify = match header(headers, INSECURE_SKIP_TLS_VERIFY_HEADER)? {
            Some(v) => v.trim().eq_ignore_ascii_case("true"),
            None => false,
        };

        let has_certificate_pair = client_certificate.is_some() && client_key.is_some();
        if token.is_none() && !has_certificate_pair {
            return Err(Error::invalid_identity(format!(
                "either {AUTHORIZATION_HEADER} or both {CLIENT_CERTIFICATE_DATA_HEADER} and {CLIENT_KEY_DATA_HEADER} headers are required"
            )));
        }

        Ok(Self {
            server,
            certificate_authority,
            token,
            client_certificate,
            client_key,
            insecure_skip_tls_verify,
        })
    }
}

impl fmt::Debug for AuthHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHeaders")
            .field("server", &self.server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("client_certificate", &self.client_certificate.is_some())
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .finish()
    }
}

fn header(headers: &HeaderMap, name: &str) -> Result<Option<String>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.to_string()))
            .map_err(|_| Error::invalid_identity(format!("{name} header is not valid ASCII"))),
    }
}

fn required(headers: &HeaderMap, name: &str) -> Result<String> {
    header(headers, name)?
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::invalid_identity(format!("{name} header is required")))
}

fn decode(name: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| Error::invalid_identity(format!("{name} header is not valid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn encoded(raw: &str) -> HeaderValue {
        HeaderValue::from_str(&STANDARD.encode(raw)).unwrap()
    }

    fn external_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SERVER_HEADER, HeaderValue::from_static("https://10.0.0.1:6443"));
        headers.insert(CERTIFICATE_AUTHORITY_DATA_HEADER, encoded("-----BEGIN CERTIFICATE-----"));
        headers
    }

    #[test]
    fn test_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        match CallerIdentity::from_headers(&headers).unwrap() {
            Some(CallerIdentity::Token(token)) => assert_eq!(token.as_str(), "abc.def"),
            other => panic!("unexpected identity: {other:?}"),
        }
    }

    #[test]
    fn test_non_bearer_authorization_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert!(CallerIdentity::from_headers(&headers).unwrap().is_none());
        assert!(CallerIdentity::bearer("Bearer ").is_none());
        assert!(CallerIdentity::from_headers(&HeaderMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_external_headers_with_token() {
        let mut headers = external_headers();
        headers.insert(AUTHORIZATION_HEADER, HeaderValue::from_static("Bearer caller-token"));
        headers.insert(INSECURE_SKIP_TLS_VERIFY_HEADER, HeaderValue::from_static("TRUE"));

        let Some(CallerIdentity::External(h)) = CallerIdentity::from_headers(&headers).unwrap()
        else {
            panic!("expected external identity");
        };
        assert_eq!(h.server, "https://10.0.0.1:6443");
        assert_eq!(h.certificate_authority, b"-----BEGIN CERTIFICATE-----");
        assert_eq!(h.token.as_deref().map(String::as_str), Some("caller-token"));
        assert!(h.insecure_skip_tls_verify);
    }

    #[test]
    fn test_external_headers_are_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::HeaderName::from_bytes(b"Kubernetes-Server").unwrap(),
            HeaderValue::from_static("https://10.0.0.1:6443"),
        );
        headers.insert(
            http::HeaderName::from_bytes(b"KUBERNETES-CERTIFICATE-AUTHORITY-DATA").unwrap(),
            encoded("ca"),
        );
        headers.insert(
            http::HeaderName::from_bytes(b"Kubernetes-Client-Certificate-Data").unwrap(),
            encoded("cert"),
        );
        headers.insert(
            http::HeaderName::from_bytes(b"Kubernetes-Client-Key-Data").unwrap(),
            encoded("key"),
        );
        let h = AuthHeaders::from_headers(&headers).unwrap();
        assert_eq!(h.client_certificate.as_deref(), Some(&b"cert"[..]));
        assert!(h.token.is_none());
    }

    #[test]
    fn test_missing_server_or_ca() {
        let mut headers = external_headers();
        headers.remove(CERTIFICATE_AUTHORITY_DATA_HEADER);
        headers.insert(AUTHORIZATION_HEADER, HeaderValue::from_static("Bearer t"));
        let err = AuthHeaders::from_headers(&headers).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid caller identity: kubernetes-certificate-authority-data header is required"
        );

        let mut headers = HeaderMap::new();
        headers.insert(CERTIFICATE_AUTHORITY_DATA_HEADER, encoded("ca"));
        let err = AuthHeaders::from_headers(&headers).unwrap_err();
        assert!(err.to_string().contains("kubernetes-server header is required"));
    }

    #[test]
    fn test_requires_token_or_certificate_pair() {
        let mut headers = external_headers();
        headers.insert(CLIENT_CERTIFICATE_DATA_HEADER, encoded("cert"));
        let err = AuthHeaders::from_headers(&headers).unwrap_err();
        assert!(err.to_string().contains("either kubernetes-authorization"));
    }

    #[test]
    fn test_rejects_bad_base64() {
        let mut headers = external_headers();
        headers.insert(CERTIFICATE_AUTHORITY_DATA_HEADER, HeaderValue::from_static("%%%"));
        headers.insert(AUTHORIZATION_HEADER, HeaderValue::from_static("Bearer t"));
        let err = AuthHeaders::from_headers(&headers).unwrap_err();
        assert!(err.to_string().contains("not valid base64"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let identity = CallerIdentity::Token(Zeroizing::new("super-secret".to_string()));
        assert!(!format!("{identity:?}").contains("super-secret"));
    }
}
