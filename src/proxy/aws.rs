//! AWS Signature Version 4 for `aws+https://` upstreams
//!
//! Region and service are read from the upstream host
//! (`<name>.<region>.<service>.amazonaws.com` or
//! `<service>.<region>.amazonaws.com`) unless the configuration overrides
//! them.

use axum::http::{
    HeaderMap, HeaderValue, Method,
    header::{AUTHORIZATION, HOST},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, KeyInit, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::AwsConfig;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const DEFAULT_REGION: &str = "us-east-1";

/// Signs outbound requests with an access key
#[derive(Clone)]
pub struct AwsSigner {
    access_key_id: String,
    secret_access_key: String,
    region: String,
    service: String,
}

impl std::fmt::Debug for AwsSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSigner")
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl AwsSigner {
    /// Signer for requests to `host`
    pub fn for_host(config: &AwsConfig, host: &str) -> Result<Self, String> {
        if config.access_key_id.is_empty() || config.secret_access_key.is_empty() {
            return Err("aws upstreams require an access key id and secret access key".to_string());
        }
        let (service, region) = service_and_region(host);
        let service = config.service.clone().or(service).ok_or_else(|| {
            format!("cannot tell the AWS service from host {host:?}; set aws.service")
        })?;
        let region = config.region.clone().or(region).unwrap_or_else(|| DEFAULT_REGION.to_string());

        Ok(Self {
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            region,
            service,
        })
    }

    /// Region requests are signed for
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Service requests are signed for
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Add `X-Amz-Date`, `X-Amz-Content-Sha256` and `Authorization`
    pub fn sign(
        &self,
        method: &Method,
        url: &Url,
        headers: &mut HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) {
        if !headers.contains_key(HOST) {
            if let Ok(host) = HeaderValue::from_str(&super::authority(url)) {
                headers.insert(HOST, host);
            }
        }
        let payload_hash = hex::encode(Sha256::digest(body));
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        if let Ok(value) = HeaderValue::from_str(&amz_date) {
            headers.insert("x-amz-date", value);
        }
        if let Ok(value) = HeaderValue::from_str(&payload_hash) {
            headers.insert("x-amz-content-sha256", value);
        }
        headers.remove(AUTHORIZATION);

        let authorization = self.authorization(method, url, headers, &payload_hash, now);
        if let Ok(value) = HeaderValue::from_str(&authorization) {
            headers.insert(AUTHORIZATION, value);
        }
    }

    /// `Authorization` header value over the headers already present
    fn authorization(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> String {
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);

        let (canonical_headers, signed_headers) = canonical_headers(headers);
        let canonical_request = [
            method.as_str(),
            url.path(),
            &canonical_query(url),
            &canonical_headers,
            &signed_headers,
            payload_hash,
        ]
        .join("\n");

        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let secret = format!("AWS4{}", self.secret_access_key);
        let mut key = hmac(secret.as_bytes(), &date);
        for part in [self.region.as_str(), self.service.as_str(), "aws4_request"] {
            key = hmac(&key, part);
        }
        let signature = hex::encode(hmac(&key, &string_to_sign));

        format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key_id
        )
    }
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key) else {
        return Vec::new();
    };
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Signed headers are `host`, `content-type` and every `x-amz-*`
fn canonical_headers(headers: &HeaderMap) -> (String, String) {
    let mut names: Vec<&str> = headers
        .keys()
        .map(axum::http::HeaderName::as_str)
        .filter(|n| *n == "host" || *n == "content-type" || n.starts_with("x-amz-"))
        .collect();
    names.sort_unstable();
    names.dedup();

    let mut canonical = String::new();
    for name in &names {
        let values: Vec<String> = headers
            .get_all(*name)
            .iter()
            .map(|v| {
                String::from_utf8_lossy(v.as_bytes())
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(&values.join(","));
        canonical.push('\n');
    }
    (canonical, names.join(";"))
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Service and region encoded in an `amazonaws.com` host name
fn service_and_region(host: &str) -> (Option<String>, Option<String>) {
    let labels: Vec<&str> = host.split('.').collect();
    let Some(end) = labels.iter().position(|l| *l == "amazonaws") else {
        return (None, None);
    };
    let looks_like_region = |label: &str| {
        label.contains('-') && label.ends_with(|c: char| c.is_ascii_digit())
    };
    match &labels[..end] {
        [] => (None, None),
        [service] => (Some((*service).to_string()), None),
        [.., a, b] if looks_like_region(b) => (Some((*a).to_string()), Some((*b).to_string())),
        [.., a, b] => (Some((*b).to_string()), Some((*a).to_string())),
    }
}
