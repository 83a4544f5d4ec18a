use anyhow::{anyhow, bail, Context, Result};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation};
use reqwest::Url;
use serde::Deserialize;

/**
 * OIDC provider settings from the "oidc" section of the settings document.
 */
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcSettings {
    pub issuer: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

/*
 * The out-of-band redirect URL makes the provider display the authorization
 * code for the user to copy, rather than redirecting a browser anywhere.
 */
const DEFAULT_REDIRECT_URL: &str = "urn:ietf:wg:oauth:2.0:oob";
const DEFAULT_SCOPE: &str = "openid";

/*
 * The subset of the provider metadata document that we consume.
 */
#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

/**
 * Claims extracted from a verified ID token.  The subject is the only claim
 * used for authorization; everything else the token carries is ignored once
 * signature, audience, issuer, and expiry have been checked.
 */
#[derive(Debug, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
}

/**
 * A client for one OIDC provider, constructed once at startup from the
 * provider's published metadata.  Construction failure is fatal; after
 * that the client is read-only and shared by every connection.
 */
pub struct OidcClient {
    issuer: String,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    scopes: Vec<String>,
    authorization_endpoint: Url,
    token_endpoint: Url,
    jwks: JwkSet,
    http: reqwest::Client,
}

impl OidcClient {
    /**
     * Fetch the provider metadata from the well-known location under the
     * configured issuer, then fetch the signing keys it advertises.
     */
    pub async fn discover(settings: &OidcSettings) -> Result<OidcClient> {
        if settings.issuer.is_empty() {
            bail!("oidc issuer is missing");
        }
        if settings.client_id.is_empty() {
            bail!("oidc client_id is missing");
        }

        let http = reqwest::Client::new();

        let wellknown = format!(
            "{}/.well-known/openid-configuration",
            settings.issuer.trim_end_matches('/'),
        );
        let metadata: ProviderMetadata = http
            .get(&wellknown)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("fetching {wellknown}"))?
            .json()
            .await
            .context("decoding provider metadata")?;

        if metadata.issuer.trim_end_matches('/')
            != settings.issuer.trim_end_matches('/')
        {
            bail!(
                "provider reports issuer {:?}, settings expect {:?}",
                metadata.issuer,
                settings.issuer,
            );
        }

        let jwks: JwkSet = http
            .get(&metadata.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("fetching {}", metadata.jwks_uri))?
            .json()
            .await
            .context("decoding provider JWKS")?;

        Ok(OidcClient {
            issuer: settings.issuer.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            redirect_url: settings
                .redirect_url
                .clone()
                .unwrap_or_else(|| DEFAULT_REDIRECT_URL.to_string()),
            scopes: settings
                .scopes
                .clone()
                .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]),
            authorization_endpoint: Url::parse(
                &metadata.authorization_endpoint,
            )
            .context("parsing authorization endpoint")?,
            token_endpoint: Url::parse(&metadata.token_endpoint)
                .context("parsing token endpoint")?,
            jwks,
            http,
        })
    }

    /**
     * The URL a user must visit in a browser to obtain an authorization
     * code for this client.
     */
    pub fn auth_code_url(&self, state: &str) -> String {
        let mut url = self.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_url)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);
        url.into()
    }

    /**
     * Exchange an authorization code for an ID token and verify it.  Any
     * failure here, network or cryptographic, surfaces to the caller as an
     * authentication failure.
     */
    pub async fn exchange(&self, code: &str) -> Result<IdTokenClaims> {
        let response = self
            .http
            .post(self.token_endpoint.clone())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_url.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .context("token endpoint request failed")?
            .error_for_status()
            .context("token endpoint refused the exchange")?;

        let token: TokenResponse =
            response.json().await.context("decoding token response")?;
        let raw = token
            .id_token
            .ok_or_else(|| anyhow!("token response carried no id_token"))?;

        self.verify(&raw)
    }

    /**
     * Verify a raw ID token: the signature must check out against a key in
     * the provider JWKS, the audience must contain our client id, the
     * issuer must match, and the token must be within its validity window.
     */
    fn verify(&self, raw: &str) -> Result<IdTokenClaims> {
        let header = jsonwebtoken::decode_header(raw)
            .context("decoding ID token header")?;

        let jwk = match &header.kid {
            Some(kid) => self
                .jwks
                .find(kid)
                .ok_or_else(|| anyhow!("ID token signed by unknown key"))?,
            None => self
                .jwks
                .keys
                .first()
                .ok_or_else(|| anyhow!("provider JWKS is empty"))?,
        };
        let key = DecodingKey::from_jwk(jwk)
            .context("constructing verification key")?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_issuer(&[self.issuer.as_str()]);

        let token = jsonwebtoken::decode::<IdTokenClaims>(
            raw,
            &key,
            &validation,
        )
        .context("ID token verification failed")?;

        Ok(token.claims)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use serde::Serialize;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"agentca-unit-test-secret";
    const ISSUER: &str = "https://issuer.example.com";
    const CLIENT_ID: &str = "agentca-test";

    #[derive(Serialize)]
    struct Claims {
        sub: String,
        aud: String,
        iss: String,
        exp: u64,
    }

    fn test_client() -> OidcClient {
        let jwks: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [{
                "kty": "oct",
                "kid": "test-key",
                "alg": "HS256",
                "k": URL_SAFE_NO_PAD.encode(SECRET),
            }],
        }))
        .unwrap();

        OidcClient {
            issuer: ISSUER.to_string(),
            client_id: CLIENT_ID.to_string(),
            client_secret: "hunter2".to_string(),
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
            scopes: vec![DEFAULT_SCOPE.to_string()],
            authorization_endpoint: Url::parse(
                "https://issuer.example.com/authorize",
            )
            .unwrap(),
            token_endpoint: Url::parse("https://issuer.example.com/token")
                .unwrap(),
            jwks,
            http: reqwest::Client::new(),
        }
    }

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn make_token(claims: &Claims, kid: &str) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(
            &header,
            claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    #[test]
    fn auth_code_url_carries_required_parameters() {
        let url = test_client().auth_code_url("");
        let url = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert!(url.as_str().starts_with(
            "https://issuer.example.com/authorize?"
        ));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        assert!(pairs.contains(&("client_id".into(), CLIENT_ID.into())));
        assert!(pairs
            .contains(&("redirect_uri".into(), DEFAULT_REDIRECT_URL.into())));
        assert!(pairs.contains(&("scope".into(), "openid".into())));
        assert!(pairs.contains(&("state".into(), "".into())));
    }

    #[test]
    fn verifies_valid_token() {
        let token = make_token(
            &Claims {
                sub: "abc-123".into(),
                aud: CLIENT_ID.into(),
                iss: ISSUER.into(),
                exp: now() + 300,
            },
            "test-key",
        );
        let claims = test_client().verify(&token).unwrap();
        assert_eq!(claims.sub, "abc-123");
    }

    #[test]
    fn rejects_wrong_audience() {
        let token = make_token(
            &Claims {
                sub: "abc-123".into(),
                aud: "somebody-else".into(),
                iss: ISSUER.into(),
                exp: now() + 300,
            },
            "test-key",
        );
        assert!(test_client().verify(&token).is_err());
    }

    #[test]
    fn rejects_wrong_issuer() {
        let token = make_token(
            &Claims {
                sub: "abc-123".into(),
                aud: CLIENT_ID.into(),
                iss: "https://elsewhere.example.com".into(),
                exp: now() + 300,
            },
            "test-key",
        );
        assert!(test_client().verify(&token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let token = make_token(
            &Claims {
                sub: "abc-123".into(),
                aud: CLIENT_ID.into(),
                iss: ISSUER.into(),
                exp: now() - 3600,
            },
            "test-key",
        );
        assert!(test_client().verify(&token).is_err());
    }

    #[test]
    fn rejects_unknown_signing_key() {
        let token = make_token(
            &Claims {
                sub: "abc-123".into(),
                aud: CLIENT_ID.into(),
                iss: ISSUER.into(),
                exp: now() + 300,
            },
            "some-other-key",
        );
        assert!(test_client().verify(&token).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(test_client().verify("not-a-token").is_err());
    }
}
