//! Order operations: creation, refresh, and challenge-response material.
//!
//! An order tracks one certificate request through to issuance. The server
//! hands back one authorization per identifier; each authorization carries
//! challenges, and this module computes the response material (key
//! authorizations, TXT record values) that the caller's publisher
//! provisions out-of-band.

use std::collections::HashSet;

use base64::prelude::*;

use crate::{
    api,
    dns::dns_challenge_name,
    error::Result,
    key::{sha256, AccountKey},
    trans::Session,
};

/// Identifier normalization: a single domain string, a single
/// [`api::Identifier`], or a sequence of either, always ending up as a list
/// of typed identifiers on the wire.
pub trait IntoIdentifiers {
    fn into_identifiers(self) -> Vec<api::Identifier>;
}

impl IntoIdentifiers for &str {
    fn into_identifiers(self) -> Vec<api::Identifier> {
        vec![api::Identifier::dns(self)]
    }
}

impl IntoIdentifiers for String {
    fn into_identifiers(self) -> Vec<api::Identifier> {
        vec![api::Identifier::dns(&self)]
    }
}

impl IntoIdentifiers for api::Identifier {
    fn into_identifiers(self) -> Vec<api::Identifier> {
        vec![self]
    }
}

impl<T: Into<api::Identifier>> IntoIdentifiers for Vec<T> {
    fn into_identifiers(self) -> Vec<api::Identifier> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<T: Into<api::Identifier> + Clone> IntoIdentifiers for &[T] {
    fn into_identifiers(self) -> Vec<api::Identifier> {
        self.iter().cloned().map(Into::into).collect()
    }
}

impl<T: Into<api::Identifier>, const N: usize> IntoIdentifiers for [T; N] {
    fn into_identifiers(self) -> Vec<api::Identifier> {
        self.into_iter().map(Into::into).collect()
    }
}

/// Options for [`Session::new_order()`].
#[derive(Debug, Clone, Default)]
pub struct NewOrderOptions {
    identifiers: Vec<api::Identifier>,
    not_before: Option<String>,
    not_after: Option<String>,
}

impl NewOrderOptions {
    /// Build order options from one or more identifiers. Duplicates are
    /// dropped, first occurrence wins.
    pub fn new(identifiers: impl IntoIdentifiers) -> Self {
        let mut dedup = HashSet::new();
        let identifiers = identifiers
            .into_identifiers()
            .into_iter()
            .filter(|identifier| dedup.insert(identifier.clone()))
            .collect();

        NewOrderOptions {
            identifiers,
            ..Default::default()
        }
    }

    /// Requested start of the validity window, RFC 3339.
    ///
    /// Let's Encrypt ignores it but the client forwards it.
    pub fn not_before(mut self, timestamp: impl Into<String>) -> Self {
        self.not_before = Some(timestamp.into());
        self
    }

    /// Requested end of the validity window, RFC 3339.
    pub fn not_after(mut self, timestamp: impl Into<String>) -> Self {
        self.not_after = Some(timestamp.into());
        self
    }

    pub fn identifiers(&self) -> &[api::Identifier] {
        &self.identifiers
    }
}

/// A server-issued order together with its URL.
///
/// The URL arrives in the `Location` header of the `newOrder` response and
/// MUST be remembered by the client; the server does not enumerate
/// outstanding orders.
#[derive(Debug, Clone)]
pub struct Order {
    pub url: String,
    pub api: api::Order,
}

/// One authorization, fetched via POST-as-GET and enriched with computed
/// challenge response material.
#[derive(Debug, Clone)]
pub struct Authz {
    pub url: String,
    pub api: api::Authorization,
    pub responses: Vec<ChallengeResponse>,
}

impl Authz {
    /// Whether this authorization still needs a challenge discharged. The
    /// provider may remember a recent proof of ownership, in which case the
    /// authorization comes back already valid.
    pub fn needs_challenge(&self) -> bool {
        !self.api.status_is(api::AuthorizationStatus::Valid)
    }

    /// The challenge this crate elects to answer: `dns-01` when offered,
    /// else `http-01`; other types are ignored.
    pub fn preferred_response(&self) -> Option<&ChallengeResponse> {
        self.responses
            .iter()
            .find(|r| r.challenge_type == "dns-01")
            .or_else(|| {
                self.responses
                    .iter()
                    .find(|r| r.challenge_type == "http-01")
            })
    }
}

/// A challenge augmented with its computed response.
///
/// For `dns-01`, `response` is the TXT value to place at `dns_record_name`.
/// For `http-01`, `response` is the key authorization to serve at
/// `/.well-known/acme-challenge/<token>`. Other challenge types pass
/// through with no response computed.
///
/// The response is computed once, when the authorization is fetched, and
/// never revised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    pub identifier: api::Identifier,
    pub challenge_type: String,
    pub url: String,
    pub token: String,
    pub status: api::ChallengeStatus,
    pub response: Option<String>,
    pub dns_record_name: Option<String>,
}

impl Session {
    /// Create a new order for the given identifiers.
    ///
    /// Every call creates a new order with the provider, even when the
    /// identifiers are exactly the same as an outstanding one.
    pub async fn new_order(&mut self, opts: &NewOrderOptions) -> Result<Order> {
        let request = api::NewOrderRequest {
            identifiers: opts.identifiers.clone(),
            not_before: opts.not_before.clone(),
            not_after: opts.not_after.clone(),
        };

        let url = self.directory().new_order.clone();
        let res = self.post(&url, &serde_json::to_vec(&request)?).await?;

        let order_url = res.expect_location("Location")?;
        let from_api: api::Order = res.json()?;

        // keep the caller's identifier order; the server may permute it
        let mut api_order = api::Order {
            identifiers: opts.identifiers.clone(),
            ..Default::default()
        };
        api_order.overwrite(from_api)?;

        Ok(Order {
            url: order_url,
            api: api_order,
        })
    }

    /// Read an order resource by URL (POST-as-GET). Used when resuming an
    /// order created in an earlier session.
    pub async fn fetch_order(&mut self, url: &str) -> Result<Order> {
        let res = self.post_as_get(url).await?;
        Ok(Order {
            url: url.to_owned(),
            api: res.json()?,
        })
    }

    /// Re-fetch the order object, preserving identifier order.
    pub async fn refresh_order(&mut self, order: &mut Order) -> Result<()> {
        let res = self.post_as_get(&order.url).await?;
        order.api.overwrite(res.json()?)
    }

    /// Fetch every authorization of `order` and augment each challenge with
    /// its computed response.
    pub async fn create_challenge_responses(&mut self, order: &Order) -> Result<Vec<Authz>> {
        let auth_urls = order.api.authorizations.clone().unwrap_or_default();

        let mut result = Vec::with_capacity(auth_urls.len());
        for auth_url in auth_urls {
            let res = self.post_as_get(&auth_url).await?;
            let api_auth: api::Authorization = res.json()?;
            let responses = challenge_responses(self.account_key(), &api_auth)?;

            result.push(Authz {
                url: auth_url,
                api: api_auth,
                responses,
            });
        }

        Ok(result)
    }
}

fn challenge_responses(
    key: &AccountKey,
    auth: &api::Authorization,
) -> Result<Vec<ChallengeResponse>> {
    auth.challenges
        .iter()
        .map(|challenge| {
            let response = challenge_response(key, &challenge._type, &challenge.token)?;
            let dns_record_name = (challenge._type == "dns-01")
                .then(|| dns_challenge_name(&auth.identifier.value));

            Ok(ChallengeResponse {
                identifier: auth.identifier.clone(),
                challenge_type: challenge._type.clone(),
                url: challenge.url.clone(),
                token: challenge.token.clone(),
                status: challenge.status,
                response,
                dns_record_name,
            })
        })
        .collect()
}

/// The key authorization string: `<token>.<thumbprint>` ([RFC 8555 §8.1]).
///
/// [RFC 8555 §8.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.1
pub(crate) fn key_authorization(token: &str, key: &AccountKey) -> Result<String> {
    Ok(format!("{token}.{}", key.thumbprint()?))
}

/// Response derivation per challenge type.
///
/// - `dns-01`: base64url-unpadded SHA-256 of the key authorization
///   ([RFC 8555 §8.4])
/// - `http-01`: the raw key authorization ([RFC 8555 §8.3])
/// - anything else: no response; the challenge passes through unmodified
///
/// [RFC 8555 §8.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.3
/// [RFC 8555 §8.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.4
pub(crate) fn challenge_response(
    key: &AccountKey,
    challenge_type: &str,
    token: &str,
) -> Result<Option<String>> {
    let key_auth = key_authorization(token, key)?;

    Ok(match challenge_type {
        "dns-01" => Some(BASE64_URL_SAFE_NO_PAD.encode(sha256(key_auth))),
        "http-01" => Some(key_auth),
        _ => None,
    })
}
