//! Connector authentication and connection-mode authorization.

mod token;

pub use token::TokenVerifier;

use anyhow::Result as AnyResult;
use tracing::debug;

use crate::config::{AuthzConfig, Config};
use crate::error::{Error, Result};
use crate::ident::{ClientId, ConnectionMode};

/// Authentication and authorization state built once from the config
/// snapshot.
pub struct Authenticator {
    verifier: Option<TokenVerifier>,
    authz: Option<AuthzConfig>,
    broker_audience: String,
}

impl Authenticator {
    /// Build the authenticator, parsing every issuer key up front so a bad
    /// config fails at startup rather than on the first connect.
    pub fn new(config: &Config) -> AnyResult<Self> {
        let verifier = config
            .authn
            .as_ref()
            .map(TokenVerifier::new)
            .transpose()?;
        Ok(Self {
            verifier,
            authz: config.authz.clone(),
            broker_audience: config.id.audience.clone(),
        })
    }

    /// Verify the password against the identity claimed in the Client-ID.
    pub fn authenticate(&self, client: &ClientId, password: Option<&[u8]>) -> Result<()> {
        let Some(verifier) = &self.verifier else {
            debug!(client_id = %client, "authentication disabled");
            return Ok(());
        };

        let password =
            password.ok_or_else(|| Error::BadCredentials("password is required".into()))?;
        let token = std::str::from_utf8(password)
            .map_err(|_| Error::BadCredentials("password is not valid UTF-8".into()))?;

        let account = verifier.verify(token)?;
        if account != client.account() {
            return Err(Error::NotAuthorized(format!(
                "token subject `{account}` does not own account `{}`",
                client.account_id()
            )));
        }

        debug!(client_id = %client, account = %account, "authenticated");
        Ok(())
    }

    /// Check the connection mode against the trust policy of the broker's
    /// own audience.
    pub fn authorize_mode(&self, client: &ClientId) -> Result<()> {
        if client.mode() == ConnectionMode::Default {
            return Ok(());
        }
        let Some(authz) = &self.authz else {
            debug!(client_id = %client, "authorization disabled");
            return Ok(());
        };

        let policy = authz.get(&self.broker_audience).ok_or_else(|| {
            Error::NotAuthorized(format!(
                "no trust policy for audience `{}`",
                self.broker_audience
            ))
        })?;

        let account = client.account();
        if !policy.is_trusted(&account) {
            return Err(Error::NotAuthorized(format!(
                "account `{account}` is not trusted to connect in mode `{}`",
                client.mode().label()
            )));
        }
        Ok(())
    }

    /// Whether a trust policy is configured at all; dynamic subscriptions
    /// are only cleaned up when it is.
    pub fn authz_enabled(&self) -> bool {
        self.authz.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudiencePolicy, StatConfig};
    use crate::ident::{AccountId, AgentId};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use std::collections::{HashMap, HashSet};

    #[derive(Serialize)]
    struct TestClaims<'a> {
        iss: &'a str,
        sub: &'a str,
        aud: &'a str,
    }

    fn config(authn: bool, trusted: &[(&str, &str)]) -> Config {
        let authn = authn.then(|| {
            let mut issuers = HashMap::new();
            issuers.insert(
                "iam.svc.example.net".to_owned(),
                crate::config::IssuerConfig {
                    algorithm: "HS256".into(),
                    audience: vec!["example.net".into()],
                    key: Some("top-secret".into()),
                    key_file: None,
                },
            );
            issuers
        });
        let authz = (!trusted.is_empty()).then(|| {
            let mut map = HashMap::new();
            map.insert(
                "example.org".to_owned(),
                AudiencePolicy::Trusted {
                    trusted: trusted
                        .iter()
                        .map(|(l, a)| AccountId::new(*l, *a))
                        .collect::<HashSet<_>>(),
                },
            );
            map
        });
        Config {
            id: AgentId::new("mqtt-gateway", "svc", "example.org"),
            authn,
            authz,
            stat: StatConfig::default(),
        }
    }

    fn mint(sub: &str, aud: &str) -> Vec<u8> {
        encode(
            &Header::default(),
            &TestClaims {
                iss: "iam.svc.example.net",
                sub,
                aud,
            },
            &EncodingKey::from_secret(b"top-secret"),
        )
        .unwrap()
        .into_bytes()
    }

    #[test]
    fn test_account_must_match_client_id() {
        let auth = Authenticator::new(&config(true, &[])).unwrap();
        let client = ClientId::parse("v1/agents/web.john-doe.example.net").unwrap();

        let token = mint("john-doe", "example.net");
        assert!(auth.authenticate(&client, Some(&token)).is_ok());

        let token = mint("jane-doe", "example.net");
        assert!(matches!(
            auth.authenticate(&client, Some(&token)),
            Err(Error::NotAuthorized(_))
        ));
    }

    #[test]
    fn test_password_required_when_enabled() {
        let auth = Authenticator::new(&config(true, &[])).unwrap();
        let client = ClientId::parse("v1/agents/web.john-doe.example.net").unwrap();
        assert!(matches!(
            auth.authenticate(&client, None),
            Err(Error::BadCredentials(_))
        ));
    }

    #[test]
    fn test_disabled_authn_accepts_anything() {
        let auth = Authenticator::new(&config(false, &[])).unwrap();
        let client = ClientId::parse("v1/agents/web.john-doe.example.net").unwrap();
        assert!(auth.authenticate(&client, None).is_ok());
        assert!(auth.authenticate(&client, Some(b"whatever")).is_ok());
    }

    #[test]
    fn test_mode_policy() {
        let auth =
            Authenticator::new(&config(false, &[("conference", "svc.example.org")])).unwrap();

        // Default mode needs no trust.
        let client = ClientId::parse("v1/agents/web.john-doe.example.net").unwrap();
        assert!(auth.authorize_mode(&client).is_ok());

        // Trusted service account.
        let client =
            ClientId::parse("v1/service-agents/c-1.conference.svc.example.org").unwrap();
        assert!(auth.authorize_mode(&client).is_ok());

        // Untrusted account asking for a service mode.
        let client = ClientId::parse("v1/service-agents/a.b.c.example.net").unwrap();
        assert!(matches!(
            auth.authorize_mode(&client),
            Err(Error::NotAuthorized(_))
        ));
    }

    #[test]
    fn test_disabled_authz_allows_all_modes() {
        let auth = Authenticator::new(&config(false, &[])).unwrap();
        let client = ClientId::parse("v1/observer-agents/probe.ops.example.com").unwrap();
        assert!(auth.authorize_mode(&client).is_ok());
        assert!(!auth.authz_enabled());
    }
}
