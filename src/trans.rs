use std::sync::Arc;

use crate::{
    api,
    error::{Error, Result},
    gate::{RateLimit, RateLimitGate},
    jws::{sign_flattened, JwsProtectedHeader},
    key::AccountKey,
    req::{req_head, req_post, AcmeResponse},
};

/// Bound on transparent bad-nonce retries, so a server that rejects every
/// nonce cannot hold a caller in a loop.
const MAX_BAD_NONCE_RETRIES: usize = 5;

/// The ambient state of a live conversation with one ACME server.
///
/// A session holds the directory, the account key (and, after
/// [`new_account`](Session::new_account), the account's key ID), the single
/// replay-nonce slot, and the handles used to rate limit and transport
/// requests.
///
/// Setup is:
///
/// 1. [`Session::create()`]
/// 2. [`new_account()`](Session::new_account) against the newAccount URL
/// 3. [`post()`](Session::post) / [`post_as_get()`](Session::post_as_get)
///    for all calls after that.
///
/// The nonce is a linear resource: every signed request consumes it and
/// stores the replacement from the response. That is why all request
/// methods take `&mut self`. A session serializes its requests, and
/// sharing one across concurrent workflows is a type error; run multiple
/// pollers on multiple sessions (they may share an account key and key ID).
#[derive(Debug)]
pub struct Session {
    client: reqwest::Client,
    directory: api::Directory,
    key: AccountKey,
    kid: Option<String>,
    nonce: Option<String>,
    gate: Arc<RateLimitGate>,
    limit: RateLimit,
}

#[derive(Clone, Copy)]
enum SignMode {
    /// Embed the public JWK; only for `newAccount`.
    Jwk,
    /// Reference the account URL; everything else.
    Kid,
}

impl Session {
    pub(crate) fn new(
        client: reqwest::Client,
        directory: api::Directory,
        key: AccountKey,
        kid: Option<String>,
        gate: Arc<RateLimitGate>,
        limit: RateLimit,
    ) -> Session {
        Session {
            client,
            directory,
            key,
            kid,
            nonce: None,
            gate,
            limit,
        }
    }

    /// The directory object this session was created from.
    pub fn directory(&self) -> &api::Directory {
        &self.directory
    }

    /// The key used to sign this session's requests.
    pub fn account_key(&self) -> &AccountKey {
        &self.key
    }

    /// The account URL, once `newAccount` has supplied it.
    pub fn account_kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Record the key ID once it is known. First write wins; the kid is
    /// immutable for the rest of the session.
    pub(crate) fn set_account_kid(&mut self, kid: String) {
        if self.kid.is_none() {
            log::debug!("key ID is: {kid}");
            self.kid = Some(kid);
        }
    }

    #[cfg(test)]
    pub(crate) fn current_nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    /// Fetch a fresh replay nonce with a HEAD request to the `newNonce`
    /// endpoint and store it in the session's slot.
    pub async fn new_nonce(&mut self) -> Result<()> {
        self.gate.try_admit(&RateLimit::nonce())?;

        log::debug!("request new nonce");
        let res = req_head(&self.client, &self.directory.new_nonce).await?;
        let res = AcmeResponse::read(res).await;

        let nonce = res
            .nonce()
            .ok_or(Error::MissingHeader("Replay-Nonce"))?
            .to_owned();
        self.nonce = Some(nonce);
        Ok(())
    }

    /// Signed POST in KID mode.
    pub async fn post(&mut self, url: &str, payload: &[u8]) -> Result<AcmeResponse> {
        self.call(url, payload, SignMode::Kid).await
    }

    /// Signed POST with the public JWK embedded in the protected header.
    ///
    /// Only `newAccount` is signed this way.
    pub(crate) async fn post_jwk(&mut self, url: &str, payload: &[u8]) -> Result<AcmeResponse> {
        self.call(url, payload, SignMode::Jwk).await
    }

    /// POST-as-GET: a signed request with an empty payload, used to read a
    /// resource ([RFC 8555 §6.3]).
    ///
    /// [RFC 8555 §6.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.3
    pub async fn post_as_get(&mut self, url: &str) -> Result<AcmeResponse> {
        self.post(url, b"").await
    }

    /// Signed POST of `{}`, telling the server a resource (usually a
    /// challenge) is ready for validation.
    pub async fn poke(&mut self, url: &str) -> Result<AcmeResponse> {
        self.post(url, b"{}").await
    }

    async fn call(&mut self, url: &str, payload: &[u8], mode: SignMode) -> Result<AcmeResponse> {
        // The ACME API may at any point invalidate all nonces. If we detect
        // such an error, we retry with the nonce from the rejection, bounded
        // by MAX_BAD_NONCE_RETRIES.
        let mut attempts = 0;
        loop {
            self.gate.try_admit(&self.limit)?;

            // Either reuse the stored nonce, or fetch a new one.
            let nonce = match self.nonce.take() {
                Some(nonce) => nonce,
                None => {
                    self.new_nonce().await?;
                    self.nonce.take().ok_or(Error::MissingHeader("Replay-Nonce"))?
                }
            };

            let protected = match mode {
                SignMode::Jwk => {
                    JwsProtectedHeader::new_jwk(self.key.public_jwk(), url, nonce)
                }
                SignMode::Kid => {
                    let kid = self.kid.as_deref().ok_or(Error::MissingKeyId)?;
                    JwsProtectedHeader::new_kid(kid, url, nonce)
                }
            };

            let body = sign_flattened(&protected, &self.key, payload)?;

            log::debug!("call endpoint: {url}");
            let res = req_post(&self.client, url, body).await?;
            let res = AcmeResponse::read(res).await;

            // Regardless of the request being a success or not, there might
            // be a nonce in the response.
            if let Some(nonce) = res.nonce() {
                log::trace!("storing replay nonce");
                self.nonce = Some(nonce.to_owned());
            }

            match res.into_result() {
                Ok(res) => return Ok(res),
                Err(err) if err.is_bad_nonce() && attempts < MAX_BAD_NONCE_RETRIES => {
                    attempts += 1;
                    log::debug!("retrying on bad nonce ({attempts}/{MAX_BAD_NONCE_RETRIES})");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
