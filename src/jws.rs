//! See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use p256::ecdsa::signature::Signer as _;
use serde::{Deserialize, Serialize};

use crate::{error::Result, key::AccountKey};

/// JWS Protected Header scheme as defined in [RFC 8555 §6.2].
///
/// > For newAccount requests, and for revokeCert requests authenticated by a certificate key,
/// there MUST be a "jwk" field. This field MUST contain the public key corresponding to the
/// private key used to sign the JWS.
/// >
/// > For all other requests, the request is signed using an existing account, and there MUST be a
/// "kid" field. This field MUST contain the account URL received by POSTing to the newAccount
/// resource.
///
/// [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtectedHeader {
    /// Algorithm.
    ///
    /// Always `ES256` here; the only account key type this crate produces is
    /// P-256 ECDSA, which every RFC 8555 server must accept.
    alg: String,

    /// A unique value that enables the verifier of a JWS to recognize when replay has occurred.
    ///
    /// As defined in [RFC 8555 §6.5].
    ///
    /// [RFC 8555 §6.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.5
    nonce: String,

    /// Target URL of the request, per [RFC 8555 §6.4].
    ///
    /// [RFC 8555 §6.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.4
    url: String,

    /// JSON Web Key.
    ///
    /// Mutually exclusive with `kid` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    /// Key ID.
    ///
    /// Mutually exclusive with `jwk` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

/// Public JWK representation of an account key.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

impl From<&AccountKey> for Jwk {
    fn from(key: &AccountKey) -> Self {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        // an uncompressed point always carries both coordinates
        let x = point.x().unwrap();
        let y = point.y().unwrap();

        Jwk {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) struct JwkThumb {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(a: &Jwk) -> Self {
        JwkThumb {
            crv: a.crv.clone(),
            kty: a.kty.clone(),
            x: a.x.clone(),
            y: a.y.clone(),
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Construct a flattened-JSON JWS over `payload` according to [RFC 7515 §5.1].
///
/// An empty `payload` produces an empty `payload` member, which is how
/// POST-as-GET requests are encoded ([RFC 8555 §6.3]).
///
/// [RFC 7515 §5.1]: https://datatracker.ietf.org/doc/html/rfc7515#section-5.1
/// [RFC 8555 §6.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.3
pub(crate) fn sign_flattened(
    protected: &JwsProtectedHeader,
    key: &AccountKey,
    payload: &[u8],
) -> Result<String> {
    let header = {
        let pro_json = serde_json::to_string(protected)?;
        BASE64_URL_SAFE_NO_PAD.encode(pro_json)
    };

    let payload = if payload.is_empty() {
        String::new()
    } else {
        BASE64_URL_SAFE_NO_PAD.encode(payload)
    };

    let to_sign = format!("{header}.{payload}");
    let signature: p256::ecdsa::Signature = key.signing_key().sign(to_sign.as_bytes());
    let signature = BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes());

    let jws = FlattenedJsonJws {
        protected: header,
        payload,
        signature,
    };

    Ok(serde_json::to_string(&jws)?)
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::signature::Verifier as _;

    use super::*;
    use crate::key::tests::TEST_KEY_PEM;

    fn b64_decode(input: &str) -> Vec<u8> {
        BASE64_URL_SAFE_NO_PAD.decode(input).unwrap()
    }

    #[test]
    fn test_signature_verifies_under_public_key() {
        let key = AccountKey::from_pkcs8_pem(TEST_KEY_PEM).unwrap();
        let protected = JwsProtectedHeader::new_kid(
            "https://example.com/acme/acct/1",
            "https://example.com/acme/new-order",
            "nonce-1".to_owned(),
        );

        let jws = sign_flattened(&protected, &key, br#"{"csr":"zzz"}"#).unwrap();
        let jws: FlattenedJsonJws = serde_json::from_str(&jws).unwrap();

        let to_verify = format!("{}.{}", jws.protected, jws.payload);
        let signature = p256::ecdsa::Signature::from_slice(&b64_decode(&jws.signature)).unwrap();

        key.signing_key()
            .verifying_key()
            .verify(to_verify.as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn test_empty_payload_is_empty_string() {
        let key = AccountKey::from_pkcs8_pem(TEST_KEY_PEM).unwrap();
        let protected = JwsProtectedHeader::new_kid(
            "https://example.com/acme/acct/1",
            "https://example.com/acme/order/1",
            "nonce-2".to_owned(),
        );

        let jws = sign_flattened(&protected, &key, b"").unwrap();
        let value: serde_json::Value = serde_json::from_str(&jws).unwrap();
        assert_eq!(value["payload"], "");
    }

    #[test]
    fn test_protected_header_modes_are_exclusive() {
        let key = AccountKey::from_pkcs8_pem(TEST_KEY_PEM).unwrap();

        let kid = JwsProtectedHeader::new_kid("kid-url", "url", "n".to_owned());
        let json = serde_json::to_value(&kid).unwrap();
        assert!(json.get("jwk").is_none());
        assert_eq!(json["kid"], "kid-url");

        let jwk = JwsProtectedHeader::new_jwk(key.public_jwk(), "url", "n".to_owned());
        let json = serde_json::to_value(&jwk).unwrap();
        assert!(json.get("kid").is_none());
        assert_eq!(json["jwk"]["kty"], "EC");
        assert_eq!(json["jwk"]["crv"], "P-256");
    }

    #[test]
    fn test_thumb_canonical_field_order() {
        let key = AccountKey::from_pkcs8_pem(TEST_KEY_PEM).unwrap();
        let thumb = JwkThumb::from(&key.public_jwk());
        let json = serde_json::to_string(&thumb).unwrap();

        let crv = json.find("\"crv\"").unwrap();
        let kty = json.find("\"kty\"").unwrap();
        let x = json.find("\"x\"").unwrap();
        let y = json.find("\"y\"").unwrap();
        assert!(crv < kty && kty < x && x < y);
        assert!(!json.contains(' '));
    }
}
