use std::{sync::Arc, time::Duration};

use crate::{
    api,
    error::Result,
    gate::{RateLimit, RateLimitGate},
    key::AccountKey,
    req::{req_get, AcmeResponse},
    trans::Session,
};

/// The main Let's Encrypt directory URL.
pub const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// The staging Let's Encrypt directory URL.
pub const LETSENCRYPT_STAGING_URL: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory.
    ///
    /// Not appropriate for testing / development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory.
    ///
    /// Use for testing and development. Doesn't issue "valid" certificates.
    /// The root signing certificate is not supposed to be in any trust
    /// chains, and the rate limits are far more relaxed.
    LetsEncryptStaging,

    /// Provide an arbitrary directory URL to connect to.
    Other(&'a str),
}

impl DirectoryUrl<'_> {
    fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

impl Default for DirectoryUrl<'_> {
    fn default() -> Self {
        DirectoryUrl::LetsEncrypt
    }
}

/// Configuration for [`Session::create()`].
///
/// Everything except the directory URL has a sensible default; key material,
/// the HTTP client, and all rate-limit parameters are injectable.
#[derive(Debug, Default)]
pub struct SessionConfig<'a> {
    directory_url: DirectoryUrl<'a>,
    account_key: Option<AccountKey>,
    account_kid: Option<String>,
    client: Option<reqwest::Client>,
    gate: Option<Arc<RateLimitGate>>,
    rate_limit: Option<RateLimit>,
    request_timeout: Option<Duration>,
}

impl<'a> SessionConfig<'a> {
    pub fn new(directory_url: DirectoryUrl<'a>) -> Self {
        SessionConfig {
            directory_url,
            ..Default::default()
        }
    }

    /// Sign with this key instead of generating a fresh one.
    pub fn account_key(mut self, key: AccountKey) -> Self {
        self.account_key = Some(key);
        self
    }

    /// Resume with a key ID learned from an earlier `newAccount`.
    pub fn account_kid(mut self, kid: impl Into<String>) -> Self {
        self.account_kid = Some(kid.into());
        self
    }

    /// Use this HTTP client instead of building one.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Admit requests through this gate instead of the process-wide one.
    pub fn gate(mut self, gate: Arc<RateLimitGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Per-session signed-request bucket; defaults to
    /// [`RateLimit::http_default()`].
    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// Per-request timeout; defaults to 30 seconds.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

impl Session {
    /// Fetch the directory (a plain unsigned GET) and assemble a session
    /// around it.
    pub async fn create(config: SessionConfig<'_>) -> Result<Session> {
        let timeout = config.request_timeout.unwrap_or(Duration::from_secs(30));

        let client = match config.client {
            Some(client) => client,
            None => reqwest::Client::builder().timeout(timeout).build()?,
        };

        let url = config.directory_url.to_url();
        log::debug!("fetch directory: {url}");

        let res = AcmeResponse::read(req_get(&client, url).await?)
            .await
            .into_result()?;
        let directory: api::Directory = res.json()?;

        Ok(Session::new(
            client,
            directory,
            config.account_key.unwrap_or_else(AccountKey::generate),
            config.account_kid,
            config.gate.unwrap_or_else(RateLimitGate::global),
            config.rate_limit.unwrap_or_default(),
        ))
    }
}
