//! Ordering certificates from ACME (Automatic Certificate Management Environment) providers
//! such as [Let's Encrypt](https://letsencrypt.org/).
//!
//! It follows the [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555) spec, using ACME v2,
//! and is built around two pieces:
//!
//! - a signed-request transport ([`Session`]): JWS-over-HTTPS with nonce lifecycle, transparent
//!   bad-nonce recovery, and a local rate-limit gate;
//! - a per-order poller ([`Poller`]): a long-lived task that walks an order from creation through
//!   challenge satisfaction, finalization, and certificate download, calling back into the
//!   caller's [`Publisher`] for everything that lives outside this crate (provisioning TXT
//!   records or webroot files, producing a CSR, storing the issued chain).
//!
//! # Usage
//!
//! Build a [`Session`] against a directory, register the account, then hand the session to a
//! poller together with a [`Publisher`] implementation:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use acme_order::{
//!     DirectoryUrl, NewAccountOptions, NewOrderOptions, Poller, PollerConfig, Publisher,
//!     Session, SessionConfig,
//! };
//!
//! async fn issue(publisher: Arc<dyn Publisher>) -> acme_order::Result<()> {
//!     let mut session =
//!         Session::create(SessionConfig::new(DirectoryUrl::LetsEncryptStaging)).await?;
//!     session
//!         .new_account(
//!             NewAccountOptions::new()
//!                 .contact("mailto:cert-admin@example.com")
//!                 .terms_of_service_agreed(true),
//!         )
//!         .await?;
//!
//!     let mut handle = Poller::spawn(
//!         session,
//!         NewOrderOptions::new(vec!["example.com", "*.example.com"]),
//!         publisher,
//!         PollerConfig::default(),
//!     );
//!
//!     let status = handle.wait_terminal().await;
//!     println!("order finished in {:?}", status.state);
//!     Ok(())
//! }
//! ```
//!
//! # Domain ownership
//!
//! The ACME provider only issues once you prove control over every identifier in the order,
//! through a `dns-01` TXT record or an `http-01` well-known file. This crate computes the
//! response material and waits for DNS propagation, but placing the records is the caller's
//! side of the boundary: implement [`Publisher::publish_challenge_responses`] against your DNS
//! registrar or web server.
//!
//! # Rate limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being
//! abused. Every request this crate sends passes through a local keyed admission gate first,
//! and server `Retry-After` directives are honored by the poller. Use the staging environment
//! for development, where the limits are far more relaxed; see
//! [`DirectoryUrl::LetsEncryptStaging`].
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod acc;
mod dir;
mod dns;
mod error;
mod gate;
mod jws;
mod key;
mod order;
mod poll;
mod req;
mod trans;

pub mod api;

#[cfg(test)]
mod test;

pub use crate::{
    acc::{IntoContacts, NewAccountOptions},
    dir::{DirectoryUrl, SessionConfig, LETSENCRYPT_STAGING_URL, LETSENCRYPT_URL},
    dns::{dns_challenge_name, DohResolver, TxtLookup},
    error::{CallbackError, Error, ErrorKind, Result},
    gate::{RateLimit, RateLimitGate},
    jws::Jwk,
    key::{sha256, AccountKey},
    order::{Authz, ChallengeResponse, IntoIdentifiers, NewOrderOptions, Order},
    poll::{
        FinalizationDisposition, Poller, PollerConfig, PollerHandle, PollerOutcome, PollerState,
        PollerStatus, Publisher, RetryPolicy,
    },
    req::AcmeResponse,
    trans::Session,
};
