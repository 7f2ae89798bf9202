use crate::{api, error::Result, trans::Session};

/// Options for [`Session::new_account()`].
///
/// # Example
///
/// ```no_run
/// use acme_order::{DirectoryUrl, NewAccountOptions, Session, SessionConfig};
///
/// async fn register() -> acme_order::Result<Session> {
///     let mut session =
///         Session::create(SessionConfig::new(DirectoryUrl::LetsEncryptStaging)).await?;
///
///     session
///         .new_account(
///             NewAccountOptions::new()
///                 .contact("mailto:cert-admin@example.com")
///                 .terms_of_service_agreed(true),
///         )
///         .await?;
///
///     Ok(session)
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct NewAccountOptions {
    contact: Vec<String>,
    terms_of_service_agreed: bool,
    only_return_existing: bool,
    external_account_binding: Option<serde_json::Value>,
}

impl NewAccountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contact URL(s) for the account. A scalar is coerced to a one-element
    /// list on the wire.
    pub fn contact(mut self, contact: impl IntoContacts) -> Self {
        self.contact = contact.into_contacts();
        self
    }

    /// Agree to the provider's terms of service.
    pub fn terms_of_service_agreed(mut self, agreed: bool) -> Self {
        self.terms_of_service_agreed = agreed;
        self
    }

    /// Look the account up without ever creating one; the server answers
    /// 400 `accountDoesNotExist` when the key is unknown.
    pub fn only_return_existing(mut self, only: bool) -> Self {
        self.only_return_existing = only;
        self
    }

    /// External account binding JWS, passed through verbatim.
    pub fn external_account_binding(mut self, binding: serde_json::Value) -> Self {
        self.external_account_binding = Some(binding);
        self
    }
}

/// Scalar-or-sequence coercion for contact URLs.
pub trait IntoContacts {
    fn into_contacts(self) -> Vec<String>;
}

impl IntoContacts for &str {
    fn into_contacts(self) -> Vec<String> {
        vec![self.to_owned()]
    }
}

impl IntoContacts for String {
    fn into_contacts(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoContacts for Vec<String> {
    fn into_contacts(self) -> Vec<String> {
        self
    }
}

impl IntoContacts for &[&str] {
    fn into_contacts(self) -> Vec<String> {
        self.iter().map(|c| (*c).to_owned()).collect()
    }
}

impl<const N: usize> IntoContacts for [&str; N] {
    fn into_contacts(self) -> Vec<String> {
        self.iter().map(|c| (*c).to_owned()).collect()
    }
}

impl Session {
    /// Register (or look up) the account for this session's key.
    ///
    /// This is fine to do both for new keys and existing ones: for existing
    /// keys the server returns 200 with the `Location` header set to the
    /// account URL. That URL is the key ID; it is stored on the session and
    /// used to sign every subsequent request.
    pub async fn new_account(&mut self, opts: NewAccountOptions) -> Result<api::Account> {
        let request = api::NewAccountRequest {
            // TODO: ensure email contains no hfields or more than one addr-spec
            // see https://datatracker.ietf.org/doc/html/rfc8555#section-7.3
            contact: (!opts.contact.is_empty()).then_some(opts.contact),
            terms_of_service_agreed: opts.terms_of_service_agreed.then_some(true),
            only_return_existing: opts.only_return_existing.then_some(true),
            external_account_binding: opts.external_account_binding,
        };

        let url = self.directory().new_account.clone();
        let body = serde_json::to_vec(&request)?;

        let res = self.post_jwk(&url, &body).await?;

        let kid = res.expect_location("Location")?;
        let account: api::Account = res.json()?;
        self.set_account_kid(kid);

        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test::{ServerScript, TestServer},
        DirectoryUrl, SessionConfig,
    };

    #[test]
    fn test_contact_scalar_coerced_to_list() {
        let opts = NewAccountOptions::new().contact("mailto:foo@bar.com");
        let request = api::NewAccountRequest {
            contact: Some(opts.contact),
            ..Default::default()
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contact"], serde_json::json!(["mailto:foo@bar.com"]));
    }

    #[test]
    fn test_unset_flags_are_omitted() {
        let request = api::NewAccountRequest::default();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_new_account_stores_kid() {
        let server = TestServer::spawn(ServerScript::default());

        let mut session =
            Session::create(SessionConfig::new(DirectoryUrl::Other(&server.dir_url)))
                .await
                .unwrap();

        let account = session
            .new_account(
                NewAccountOptions::new()
                    .contact("mailto:foo@bar.com")
                    .terms_of_service_agreed(true),
            )
            .await
            .unwrap();

        assert!(account.is_status_valid());
        assert!(session.account_kid().unwrap().contains("/acme/acct/"));
    }
}
