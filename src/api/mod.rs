//! JSON API payloads.
//!
//! Typed mirrors of the RFC 8555 wire objects. Servers are free to attach
//! members this crate does not know about; every resource keeps them in an
//! `extra` map so a re-serialized object round-trips verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};

mod account;
mod authorization;
mod challenge;
mod directory;
mod finalize;
mod identifier;
mod order;

pub use self::{
    account::{Account, NewAccountRequest},
    authorization::{Authorization, AuthorizationStatus},
    challenge::{Challenge, ChallengeStatus},
    directory::{Directory, DirectoryMeta},
    finalize::Finalize,
    identifier::Identifier,
    order::{NewOrderRequest, Order, OrderStatus},
};

const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
const RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";
const SERVER_INTERNAL: &str = "urn:ietf:params:acme:error:serverInternal";
const ORDER_NOT_READY: &str = "urn:ietf:params:acme:error:orderNotReady";

/// An RFC 7807 problem document, as returned in `application/problem+json`
/// error bodies, possibly with ACME subproblems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    /// Returns true if problem type is `badNonce`.
    ///
    /// Older servers have been observed sending the bare token rather than
    /// the full urn.
    pub fn is_bad_nonce(&self) -> bool {
        self._type == BAD_NONCE || self._type == "badNonce"
    }

    /// Returns true if problem type is `rateLimited`.
    pub fn is_rate_limited(&self) -> bool {
        self._type == RATE_LIMITED
    }

    /// Returns true if problem type is `serverInternal`.
    pub fn is_server_internal(&self) -> bool {
        self._type == SERVER_INTERNAL
    }

    /// Returns true if problem type is `orderNotReady`.
    pub fn is_order_not_ready(&self) -> bool {
        self._type == ORDER_NOT_READY
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type),
            _ => write!(f, "{}", self._type),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<identifier::Identifier>,
}
