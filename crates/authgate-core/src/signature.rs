//! `GAP-Signature` request signatures
//!
//! A request is canonicalized into a newline-joined string of its method, a
//! fixed list of headers and its request target. The HMAC of that string
//! (followed by the request body, when its length is known) is sent as
//! `GAP-Signature: <algorithm> <base64url digest>` so that upstreams can
//! verify the request really passed through the proxy.
//!
//! # Body coverage
//!
//! The body only contributes to the digest when the request declares a
//! `Content-Length`. Chunked or otherwise length-less bodies are left out of
//! the digest entirely, so a verifier must not treat a matching signature as
//! proof that such a body is untouched.

use std::fmt;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use hmac::{Hmac, KeyInit, Mac};
use http::{HeaderMap, Method, header::CONTENT_LENGTH};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Header carrying the request signature
pub const SIGNATURE_HEADER: &str = "GAP-Signature";

/// Headers included in the string to sign, in canonical order
pub const SIGNED_HEADERS: [&str; 10] = [
    "Content-Length",
    "Content-Md5",
    "Content-Type",
    "Date",
    "Authorization",
    "X-Forwarded-User",
    "X-Forwarded-Email",
    "X-Forwarded-Access-Token",
    "Cookie",
    "Gap-Auth",
];

/// Errors raised while building signatures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// The algorithm name is not one we can compute
    #[error("unsupported request signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The MAC rejected the key
    #[error("invalid signature key: {0}")]
    InvalidKey(String),
}

/// Supported HMAC digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// HMAC-SHA1, the wire-compatible default
    Sha1,
    /// HMAC-SHA256
    Sha256,
}

impl Algorithm {
    /// Name used on the wire and in key specs
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Borrowed view of the parts of a request that are covered by a signature
#[derive(Debug, Clone, Copy)]
pub struct SignableRequest<'a> {
    method: &'a str,
    target: &'a str,
    headers: &'a HeaderMap,
    body: Option<&'a [u8]>,
}

impl<'a> SignableRequest<'a> {
    /// Create a view over a request.
    ///
    /// `target` is the request target as sent on the wire (path and query).
    #[must_use]
    pub fn new(method: &'a Method, target: &'a str, headers: &'a HeaderMap) -> Self {
        Self {
            method: method.as_str(),
            target,
            headers,
            body: None,
        }
    }

    /// Attach the buffered request body
    #[must_use]
    pub fn with_body(mut self, body: &'a [u8]) -> Self {
        self.body = Some(body);
        self
    }

    fn header(&self, name: &str) -> &'a str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// Canonical string covered by the signature
    #[must_use]
    pub fn string_to_sign(&self) -> String {
        let mut parts = Vec::with_capacity(SIGNED_HEADERS.len() + 2);
        parts.push(self.method);
        for name in SIGNED_HEADERS {
            parts.push(self.header(name));
        }
        parts.push(self.target);
        parts.join("\n")
    }

    /// Body bytes covered by the digest: the declared `Content-Length` prefix
    /// of the body, or nothing when the length is unknown.
    fn signed_body(&self) -> &'a [u8] {
        let declared = self
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok());

        match (declared, self.body) {
            (Some(len), Some(body)) => &body[..len.min(body.len())],
            _ => &[],
        }
    }
}

/// Compute the `GAP-Signature` header value for a request
pub fn request_signature(
    request: &SignableRequest<'_>,
    algorithm: Algorithm,
    secret: &str,
) -> Result<String, SignatureError> {
    let canonical = request.string_to_sign();
    let body = request.signed_body();

    let digest = match algorithm {
        Algorithm::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
                .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
            mac.update(canonical.as_bytes());
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }
        Algorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
            mac.update(canonical.as_bytes());
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }
    };

    Ok(format!("{} {}", algorithm.name(), URL_SAFE.encode(digest)))
}

/// Outcome of checking an inbound signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// No `GAP-Signature` header present
    NoSignature,
    /// Header is not `<algorithm> <digest>`
    InvalidFormat,
    /// Algorithm token is not supported
    UnsupportedAlgorithm,
    /// Recomputed signature matches
    Match,
    /// Recomputed signature differs
    Mismatch,
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoSignature => "no signature",
            Self::InvalidFormat => "invalid format",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::Match => "match",
            Self::Mismatch => "mismatch",
        };
        f.write_str(s)
    }
}

/// Result of [`validate_request`], with both signatures for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// Outcome
    pub result: ValidationResult,
    /// Signature found in the header (empty when absent)
    pub header_signature: String,
    /// Signature we computed (empty unless a digest was computed)
    pub computed_signature: String,
}

/// Validate the `GAP-Signature` header of a request against `secret`
#[must_use]
pub fn validate_request(request: &SignableRequest<'_>, secret: &str) -> Validation {
    let header_signature = request.header(SIGNATURE_HEADER).to_string();
    let outcome = |result, computed_signature: String| Validation {
        result,
        header_signature: header_signature.clone(),
        computed_signature,
    };

    if header_signature.is_empty() {
        return outcome(ValidationResult::NoSignature, String::new());
    }

    let components: Vec<&str> = header_signature.split(' ').collect();
    if components.len() != 2 {
        return outcome(ValidationResult::InvalidFormat, String::new());
    }

    let Ok(algorithm) = components[0].parse::<Algorithm>() else {
        return outcome(ValidationResult::UnsupportedAlgorithm, String::new());
    };

    let Ok(computed) = request_signature(request, algorithm, secret) else {
        return outcome(ValidationResult::Mismatch, String::new());
    };

    let matched: bool = header_signature
        .as_bytes()
        .ct_eq(computed.as_bytes())
        .into();
    let result = if matched {
        ValidationResult::Match
    } else {
        ValidationResult::Mismatch
    };
    outcome(result, computed)
}
