//! Propagation checks for `dns-01` challenges.
//!
//! Publishing a TXT record and immediately asking the ACME server to
//! validate wastes rate-limit budget when the record has not propagated
//! yet, so the poller confirms visibility through a resolver first.
//!
//! Lookups go over DNS-over-HTTPS (the Google DNS JSON endpoint) so no
//! system resolver configuration is involved. Failures of any kind
//! (NXDOMAIN, timeout, servfail, unparseable body) surface as an empty
//! answer list, never as an error.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::req::req_get;

const GOOGLE_DOH_ENDPOINT: &str = "https://dns.google/resolve";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// The TXT record name validated for a `dns-01` challenge:
/// `_acme-challenge.<domain>`, with any leading wildcard label stripped
/// (the wildcard and base name share one validation record).
pub fn dns_challenge_name(identifier: &str) -> String {
    let name = identifier.trim_end_matches('.');
    let name = name.strip_prefix("*.").unwrap_or(name);
    format!("_acme-challenge.{name}")
}

/// Resolver seam used by the poller; implement it to control how
/// propagation is verified (tests use a canned implementation).
#[async_trait]
pub trait TxtLookup: Send + Sync {
    /// TXT record values at `name`; empty on any failure.
    async fn lookup_txt(&self, name: &str) -> Vec<String>;

    /// NS record values at `name`; empty on any failure.
    async fn lookup_ns(&self, name: &str) -> Vec<String>;
}

/// DNS-over-HTTPS resolver against the Google DNS JSON API.
#[derive(Debug, Clone)]
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl DohResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query a different JSON-API endpoint (e.g. Cloudflare's
    /// `https://cloudflare-dns.com/dns-query`).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn query(&self, name: &str, record_type: &str) -> Vec<String> {
        let url = format!(
            "{}?name={name}&type={record_type}&random_padding=x",
            self.endpoint
        );

        let res = match req_get(&self.client, &url).await {
            Ok(res) => res,
            Err(err) => {
                log::debug!("dns query failed for {name}: {err}");
                return Vec::new();
            }
        };

        let body = match res.text().await {
            Ok(body) => body,
            Err(err) => {
                log::debug!("dns response read failed for {name}: {err}");
                return Vec::new();
            }
        };

        parse_doh_body(&body)
    }
}

impl Default for DohResolver {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_default();
        DohResolver {
            client,
            endpoint: GOOGLE_DOH_ENDPOINT.to_owned(),
        }
    }
}

#[async_trait]
impl TxtLookup for DohResolver {
    async fn lookup_txt(&self, name: &str) -> Vec<String> {
        self.query(name, "TXT").await
    }

    async fn lookup_ns(&self, name: &str) -> Vec<String> {
        self.query(name, "NS").await
    }
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,

    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

fn parse_doh_body(body: &str) -> Vec<String> {
    let response: DohResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(err) => {
            log::debug!("unparseable dns response: {err}");
            return Vec::new();
        }
    };

    // status 0 is NOERROR; anything else (NXDOMAIN = 3, SERVFAIL = 2, ...)
    // reads as "nothing there yet"
    if response.status != 0 {
        return Vec::new();
    }

    response
        .answer
        .unwrap_or_default()
        .into_iter()
        .filter_map(|answer| answer.data)
        .map(|data| trim_txt_quotes(&data))
        .collect()
}

fn trim_txt_quotes(value: &str) -> String {
    value.trim().trim_matches('"').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_name_plain() {
        assert_eq!(
            dns_challenge_name("foo.example.com"),
            "_acme-challenge.foo.example.com"
        );
    }

    #[test]
    fn test_challenge_name_strips_wildcard() {
        assert_eq!(
            dns_challenge_name("*.example.com"),
            "_acme-challenge.example.com"
        );
    }

    #[test]
    fn test_challenge_name_strips_trailing_dot() {
        assert_eq!(
            dns_challenge_name("example.com."),
            "_acme-challenge.example.com"
        );
    }

    #[test]
    fn test_parse_answers() {
        let body = r#"{
            "Status": 0,
            "Answer": [
                { "name": "_acme-challenge.example.com.", "type": 16, "data": "\"abc123\"" },
                { "name": "_acme-challenge.example.com.", "type": 16, "data": "\"def456\"" }
            ]
        }"#;
        assert_eq!(parse_doh_body(body), vec!["abc123", "def456"]);
    }

    #[test]
    fn test_parse_nxdomain_is_empty() {
        assert!(parse_doh_body(r#"{"Status": 3}"#).is_empty());
    }

    #[test]
    fn test_parse_noerror_without_answers_is_empty() {
        assert!(parse_doh_body(r#"{"Status": 0}"#).is_empty());
    }

    #[test]
    fn test_parse_garbage_is_empty() {
        assert!(parse_doh_body("<html>upstream error</html>").is_empty());
    }
}
