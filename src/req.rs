use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;

use crate::{
    api::Problem,
    error::{classify_problem, Error, Result},
};

pub(crate) const JOSE_JSON: &str = "application/jose+json";
pub(crate) const PROBLEM_JSON: &str = "application/problem+json";

pub(crate) async fn req_get(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    log::trace!("GET {url}");
    Ok(client.get(url).send().await?)
}

pub(crate) async fn req_head(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    log::trace!("HEAD {url}");
    Ok(client.head(url).send().await?)
}

pub(crate) async fn req_post(
    client: &reqwest::Client,
    url: &str,
    body: String,
) -> Result<reqwest::Response> {
    log::trace!("POST {url}");
    Ok(client
        .post(url)
        .header("content-type", JOSE_JSON)
        .body(body)
        .send()
        .await?)
}

/// A fully-read ACME response: status, the envelope headers the protocol
/// cares about, and the body text.
///
/// Reading everything up front keeps nonce extraction independent of whether
/// the caller ends up treating the response as success or failure.
#[derive(Debug, Clone)]
pub struct AcmeResponse {
    status: u16,
    nonce: Option<String>,
    location: Option<String>,
    retry_after: Option<Duration>,
    content_type: Option<String>,
    body: String,
}

impl AcmeResponse {
    pub(crate) async fn read(res: reqwest::Response) -> AcmeResponse {
        let header = |name: &str| {
            res.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };

        let status = res.status().as_u16();
        let nonce = header("replay-nonce");
        let location = header("location");
        let retry_after = header("retry-after").as_deref().and_then(parse_retry_after);
        let content_type = header("content-type");

        // letsencrypt sometimes closes the TLS abruptly causing an io error
        // even though the body was captured
        let body = res.text().await.unwrap_or_default();

        AcmeResponse {
            status,
            nonce,
            location,
            retry_after,
            content_type,
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub(crate) fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub(crate) fn expect_location(&self, what: &'static str) -> Result<String> {
        self.location
            .clone()
            .ok_or(Error::MissingHeader(what))
    }

    /// Pass 2xx responses through; turn everything else into a classified
    /// [`Error`].
    pub(crate) fn into_result(self) -> Result<AcmeResponse> {
        if (200..=299).contains(&self.status) {
            return Ok(self);
        }

        let problem = if self
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with(PROBLEM_JSON))
        {
            serde_json::from_str(&self.body).unwrap_or_else(|err| Problem {
                _type: "problemJsonFail".into(),
                detail: Some(format!(
                    "Failed to deserialize application/problem+json ({err}) body: {}",
                    self.body
                )),
                ..Default::default()
            })
        } else {
            Problem {
                _type: "httpReqError".into(),
                detail: Some(format!("{} body: {}", self.status, self.body)),
                status: Some(self.status),
                ..Default::default()
            }
        };

        Err(classify_problem(self.status, problem, self.retry_after))
    }

    #[cfg(test)]
    pub(crate) fn synthetic(
        status: u16,
        content_type: Option<&str>,
        body: &str,
        retry_after: Option<Duration>,
    ) -> AcmeResponse {
        AcmeResponse {
            status,
            nonce: None,
            location: None,
            retry_after,
            content_type: content_type.map(str::to_owned),
            body: body.to_owned(),
        }
    }
}

/// Parse a `Retry-After` value: either delay-seconds or an HTTP-date.
///
/// A date in the past yields `None`, leaving the caller on its regular
/// backoff schedule.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}
