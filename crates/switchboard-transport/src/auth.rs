//! OAuth provider seam used by the HTTP transports.
//!
//! A transport that receives a 401 asks its provider to prepare an
//! authorization URL; the code that comes back on the redirect is later handed
//! to [`OAuthProvider::exchange_code`] through the same transport.

use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use reqwest::Url;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::TransportError;
use crate::transport::BoxFuture;

/// Tokens returned by the authorization server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Per-connection OAuth state holder.
pub trait OAuthProvider: Send + Sync {
    /// Where the authorization server sends the browser back to.
    fn redirect_url(&self) -> String;

    fn client_id(&self) -> Option<String>;

    fn set_client_id(&self, client_id: String);

    fn server_id(&self) -> Option<String>;

    fn set_server_id(&self, server_id: String);

    /// The URL the user must visit, once an auth challenge was seen.
    fn authorization_url(&self) -> Option<String>;

    /// Bearer token to attach to requests, if any.
    fn access_token(&self) -> Option<String>;

    /// React to a 401 from `server_url` by preparing an authorization URL.
    fn begin_authorization<'a>(&'a self, server_url: &'a Url)
    -> BoxFuture<'a, Result<(), TransportError>>;

    /// Trade an authorization code for tokens and keep them.
    fn exchange_code<'a>(&'a self, code: &'a str)
    -> BoxFuture<'a, Result<OAuthTokens, TransportError>>;
}

#[derive(Debug, Clone, Deserialize)]
struct AuthorizationServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
}

#[derive(Debug, Default)]
struct PkceState {
    server_id: Option<String>,
    client_id: Option<String>,
    metadata: Option<AuthorizationServerMetadata>,
    code_verifier: Option<String>,
    authorization_url: Option<String>,
    tokens: Option<OAuthTokens>,
}

/// Authorization-code flow with PKCE (S256) and dynamic client registration.
///
/// The `state` parameter carries the client id so the callback handler can
/// restore it; the redirect URL is `<callback_base>/<server_id>`.
pub struct PkceOAuthProvider {
    http: reqwest::Client,
    callback_base: String,
    client_name: String,
    state: Mutex<PkceState>,
}

impl PkceOAuthProvider {
    pub fn new(callback_base: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            callback_base: callback_base.into(),
            client_name: client_name.into(),
            state: Mutex::new(PkceState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut PkceState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    async fn discover(&self, server_url: &Url) -> AuthorizationServerMetadata {
        let origin = server_url.origin().ascii_serialization();
        let well_known = format!("{origin}/.well-known/oauth-authorization-server");

        let fetched = async {
            let resp = self
                .http
                .get(&well_known)
                .header("accept", "application/json")
                .send()
                .await
                .ok()?;
            if !resp.status().is_success() {
                return None;
            }
            resp.json::<AuthorizationServerMetadata>().await.ok()
        }
        .await;

        fetched.unwrap_or_else(|| {
            tracing::debug!("No OAuth metadata at {well_known}, using default endpoints");
            AuthorizationServerMetadata {
                authorization_endpoint: format!("{origin}/authorize"),
                token_endpoint: format!("{origin}/token"),
                registration_endpoint: Some(format!("{origin}/register")),
            }
        })
    }

    async fn register(&self, registration_endpoint: &str) -> Result<String, TransportError> {
        let payload = serde_json::json!({
            "client_name": self.client_name,
            "redirect_uris": [self.redirect_url()],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none"
        });
        let resp = self
            .http
            .post(registration_endpoint)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::OAuth(format!(
                "client registration failed ({status}): {text}"
            )));
        }
        let registered: RegistrationResponse = resp.json().await?;
        Ok(registered.client_id)
    }
}

impl OAuthProvider for PkceOAuthProvider {
    fn redirect_url(&self) -> String {
        let server_id = self.server_id().unwrap_or_default();
        format!("{}/{}", self.callback_base.trim_end_matches('/'), server_id)
    }

    fn client_id(&self) -> Option<String> {
        self.with_state(|s| s.client_id.clone())
    }

    fn set_client_id(&self, client_id: String) {
        self.with_state(|s| s.client_id = Some(client_id));
    }

    fn server_id(&self) -> Option<String> {
        self.with_state(|s| s.server_id.clone())
    }

    fn set_server_id(&self, server_id: String) {
        self.with_state(|s| s.server_id = Some(server_id));
    }

    fn authorization_url(&self) -> Option<String> {
        self.with_state(|s| s.authorization_url.clone())
    }

    fn access_token(&self) -> Option<String> {
        self.with_state(|s| s.tokens.as_ref().map(|t| t.access_token.clone()))
    }

    fn begin_authorization<'a>(
        &'a self,
        server_url: &'a Url,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let metadata = self.discover(server_url).await;

            let client_id = match self.client_id() {
                Some(id) => id,
                None => {
                    let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
                        TransportError::OAuth(
                            "no client id and the server offers no registration endpoint".into(),
                        )
                    })?;
                    let id = self.register(endpoint).await?;
                    self.set_client_id(id.clone());
                    id
                }
            };

            let verifier = random_urlsafe(48);
            let mut url = Url::parse(&metadata.authorization_endpoint)
                .map_err(|e| TransportError::OAuth(format!("bad authorization endpoint: {e}")))?;
            url.query_pairs_mut()
                .append_pair("response_type", "code")
                .append_pair("client_id", &client_id)
                .append_pair("redirect_uri", &self.redirect_url())
                .append_pair("code_challenge", &pkce_s256_challenge(&verifier))
                .append_pair("code_challenge_method", "S256")
                .append_pair("state", &client_id)
                .append_pair("resource", server_url.as_str());

            tracing::debug!("Prepared OAuth authorization URL for {server_url}");
            self.with_state(|s| {
                s.metadata = Some(metadata);
                s.code_verifier = Some(verifier);
                s.authorization_url = Some(url.to_string());
            });
            Ok(())
        })
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
    ) -> BoxFuture<'a, Result<OAuthTokens, TransportError>> {
        Box::pin(async move {
            let (token_endpoint, verifier, client_id) = self.with_state(|s| {
                (
                    s.metadata.as_ref().map(|m| m.token_endpoint.clone()),
                    s.code_verifier.clone(),
                    s.client_id.clone(),
                )
            });
            let token_endpoint = token_endpoint
                .ok_or_else(|| TransportError::OAuth("authorization was never started".into()))?;
            let verifier = verifier
                .ok_or_else(|| TransportError::OAuth("missing PKCE code verifier".into()))?;
            let redirect_uri = self.redirect_url();

            let mut form = vec![
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri.as_str()),
                ("code", code),
                ("code_verifier", verifier.as_str()),
            ];
            if let Some(id) = client_id.as_deref() {
                form.push(("client_id", id));
            }

            let resp = self.http.post(&token_endpoint).form(&form).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(TransportError::OAuth(format!(
                    "token exchange failed ({status}): {text}"
                )));
            }
            let tokens: OAuthTokens = resp.json().await?;
            self.with_state(|s| {
                s.tokens = Some(tokens.clone());
                s.code_verifier = None;
            });
            Ok(tokens)
        })
    }
}

/// Random URL-safe string built from `bytes_len` random bytes.
pub fn random_urlsafe(bytes_len: usize) -> String {
    let mut bytes = vec![0u8; bytes_len];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// PKCE S256 code challenge for a verifier.
pub fn pkce_s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_matches_rfc_7636_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_s256_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn random_strings_differ() {
        let a = random_urlsafe(32);
        let b = random_urlsafe(32);
        assert_ne!(a, b);
        assert!(!a.contains('=') && !a.contains('+') && !a.contains('/'));
    }

    #[test]
    fn redirect_url_ends_with_server_id() {
        let provider = PkceOAuthProvider::new("http://localhost:8787/oauth/callback/", "test");
        provider.set_server_id("ab12cd34".into());
        assert_eq!(
            provider.redirect_url(),
            "http://localhost:8787/oauth/callback/ab12cd34"
        );
    }

    #[test]
    fn client_id_roundtrip() {
        let provider = PkceOAuthProvider::new("http://localhost/cb", "test");
        assert!(provider.client_id().is_none());
        provider.set_client_id("client-1".into());
        assert_eq!(provider.client_id().as_deref(), Some("client-1"));
        assert!(provider.authorization_url().is_none());
        assert!(provider.access_token().is_none());
    }

    #[tokio::test]
    async fn exchange_before_authorization_fails() {
        let provider = PkceOAuthProvider::new("http://localhost/cb", "test");
        let err = provider.exchange_code("code").await.unwrap_err();
        assert!(matches!(err, TransportError::OAuth(_)));
    }
}
