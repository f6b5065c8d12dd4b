//! JWT verification for connector authentication.
//!
//! The MQTT password carries a compact JWT. The unverified `iss` claim
//! selects the issuer entry from the authn config; that entry pins the
//! algorithm, the decoding key, and the audiences the issuer may vouch for.
//! Verification yields the authenticated account.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result as AnyResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::AuthnConfig;
use crate::error::{Error, Result};
use crate::ident::AccountId;

#[derive(Debug, Deserialize)]
struct Claims {
    iss: String,
    sub: String,
    aud: String,
}

struct Issuer {
    algorithm: Algorithm,
    audiences: Vec<String>,
    key: DecodingKey,
}

/// Verifier holding the parsed key of every configured issuer.
pub struct TokenVerifier {
    issuers: HashMap<String, Issuer>,
}

impl TokenVerifier {
    /// Parse every issuer's algorithm and key once at startup.
    pub fn new(config: &AuthnConfig) -> AnyResult<Self> {
        let mut issuers = HashMap::new();
        for (name, issuer) in config {
            let algorithm = Algorithm::from_str(&issuer.algorithm)
                .with_context(|| format!("issuer `{name}`: unknown algorithm `{}`", issuer.algorithm))?;
            let material = issuer
                .key_material()
                .with_context(|| format!("issuer `{name}`"))?;
            let key = decoding_key(algorithm, &material)
                .with_context(|| format!("issuer `{name}`: invalid verification key"))?;
            issuers.insert(
                name.clone(),
                Issuer {
                    algorithm,
                    audiences: issuer.audience.clone(),
                    key,
                },
            );
        }
        Ok(Self { issuers })
    }

    /// Verify a token and return the account it authenticates.
    pub fn verify(&self, token: &str) -> Result<AccountId> {
        let iss = unverified_issuer(token)?;
        let issuer = self
            .issuers
            .get(&iss)
            .ok_or_else(|| Error::BadCredentials(format!("unknown issuer `{iss}`")))?;

        let mut validation = Validation::new(issuer.algorithm);
        validation.set_issuer(&[&iss]);
        validation.set_audience(&issuer.audiences);
        validation.set_required_spec_claims(&["iss", "sub", "aud"]);

        let data = decode::<Claims>(token, &issuer.key, &validation)
            .map_err(|e| Error::BadCredentials(e.to_string()))?;

        Ok(AccountId::new(data.claims.sub, data.claims.aud))
    }
}

/// Read the `iss` claim without verifying the signature. The result is only
/// used to pick the key that then verifies the whole token.
fn unverified_issuer(token: &str) -> Result<String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::BadCredentials("malformed token".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| Error::BadCredentials("malformed token payload".into()))?;

    #[derive(Deserialize)]
    struct IssOnly {
        iss: String,
    }

    let claims: IssOnly = serde_json::from_slice(&bytes)
        .map_err(|_| Error::BadCredentials("token has no `iss` claim".into()))?;
    Ok(claims.iss)
}

fn decoding_key(algorithm: Algorithm, material: &[u8]) -> AnyResult<DecodingKey> {
    let key = match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            DecodingKey::from_secret(material)
        }
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(material)?,
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(material)?,
        Algorithm::EdDSA => DecodingKey::from_ed_pem(material)?,
    };
    Ok(key)
}
