//! Google sign-in: authorization requests, code exchange and credentials.
//!
//! Sign-in is the OAuth 2.0 authorization code flow with PKCE. The caller
//! opens [`SignInRequest::authorization_url`] in a browser, the provider
//! redirects back with a code, and [`IdentityProvider::complete_sign_in`]
//! turns that redirect into a [`Credential`]. Tokens and codes are never logged.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use rand::Rng;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{DriveConfig, DRIVE_SCOPE};
use crate::error::{DriveError, Result};
use crate::models::{Account, IdTokenClaims, OAuthErrorResponse, TokenResponse};

/// Issuers Google uses in identity tokens.
const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];

/// Refresh this long before the access token actually expires.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// PKCE code verifier and CSRF state for one sign-in attempt.
#[derive(Clone)]
pub struct PkceVerifier {
    verifier: String,
    state: String,
}

impl PkceVerifier {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();

        let mut verifier_bytes = [0u8; 32];
        rng.fill(&mut verifier_bytes);

        let mut state_bytes = [0u8; 16];
        rng.fill(&mut state_bytes);

        Self {
            verifier: URL_SAFE_NO_PAD.encode(verifier_bytes),
            state: URL_SAFE_NO_PAD.encode(state_bytes),
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// S256 challenge: BASE64URL(SHA256(verifier)).
    pub fn challenge(&self) -> String {
        let hash = Sha256::digest(self.verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceVerifier")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Everything the caller needs to launch the provider's sign-in UI, and
/// everything the facade needs to finish the flow afterwards.
#[derive(Debug, Clone)]
pub struct SignInRequest {
    pub authorization_url: String,
    pub scopes: Vec<String>,
    verifier: PkceVerifier,
}

impl SignInRequest {
    pub fn new(authorization_url: String, scopes: Vec<String>, verifier: PkceVerifier) -> Self {
        Self {
            authorization_url,
            scopes,
            verifier,
        }
    }

    pub fn verifier(&self) -> &PkceVerifier {
        &self.verifier
    }
}

/// What the provider handed back on the redirect URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationResponse {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AuthorizationResponse {
    /// Parse the query string of the URL the provider redirected to.
    pub fn from_redirect_url(redirect: &str) -> Result<Self> {
        let url = Url::parse(redirect.trim())
            .map_err(|e| DriveError::SignInFailed(format!("Invalid redirect URL: {}", e)))?;

        let mut response = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => response.code = Some(value.into_owned()),
                "state" => response.state = Some(value.into_owned()),
                "error" => response.error = Some(value.into_owned()),
                "error_description" => response.error_description = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(response)
    }
}

/// Posts grants to the OAuth token endpoint.
struct TokenClient {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl TokenClient {
    fn new(http: Client, config: &DriveConfig) -> Self {
        Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    async fn grant(&self, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("client_id", self.client_id.as_str()));
        if let Some(ref secret) = self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self.http.post(&self.token_url).form(&form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<OAuthErrorResponse>(&body) {
                Ok(e) => match e.error_description {
                    Some(desc) => format!("{}: {}", e.error, desc),
                    None => e.error,
                },
                Err(_) => body,
            };
            return Err(DriveError::TokenExchange(format!(
                "Status {}: {}",
                status, message
            )));
        }

        Ok(response.json().await?)
    }
}

/// Cached access token with expiration.
#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: SystemTime,
}

impl CachedToken {
    fn new(access_token: String, expires_in: u64) -> Self {
        Self {
            access_token,
            expires_at: SystemTime::now() + Duration::from_secs(expires_in),
        }
    }
}

/// Proof of a signed-in account, bound to the Drive scope.
///
/// Clones share the same token cache, so a refresh made through one clone is
/// seen by all of them.
#[derive(Clone)]
pub struct Credential {
    account: Account,
    scope: String,
    refresh_token: Option<String>,
    cached_token: Arc<RwLock<CachedToken>>,
    token_client: Option<Arc<TokenClient>>,
}

impl Credential {
    /// A credential that cannot refresh itself.
    pub fn with_access_token(account: Account, access_token: String, expires_in: u64) -> Self {
        Self {
            account,
            scope: DRIVE_SCOPE.to_string(),
            refresh_token: None,
            cached_token: Arc::new(RwLock::new(CachedToken::new(access_token, expires_in))),
            token_client: None,
        }
    }

    fn refreshable(
        account: Account,
        tokens: TokenResponse,
        refresh_token: Option<String>,
        token_client: Arc<TokenClient>,
    ) -> Self {
        Self {
            account,
            scope: DRIVE_SCOPE.to_string(),
            refresh_token: refresh_token.or(tokens.refresh_token),
            cached_token: Arc::new(RwLock::new(CachedToken::new(
                tokens.access_token,
                tokens.expires_in,
            ))),
            token_client: Some(token_client),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn access_token(&self) -> Result<String> {
        {
            let cached = self.cached_token.read().await;
            if cached.expires_at > SystemTime::now() + EXPIRY_BUFFER {
                return Ok(cached.access_token.clone());
            }
        }

        let (Some(refresh_token), Some(client)) = (&self.refresh_token, &self.token_client) else {
            return Err(DriveError::TokenExchange(
                "Access token expired and no refresh token is available".into(),
            ));
        };

        let mut cached = self.cached_token.write().await;
        // Another clone may have refreshed while we waited for the lock.
        if cached.expires_at > SystemTime::now() + EXPIRY_BUFFER {
            return Ok(cached.access_token.clone());
        }

        debug!(account = %self.account.email, "Refreshing access token");
        let tokens = client
            .grant(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .await?;

        *cached = CachedToken::new(tokens.access_token, tokens.expires_in);
        Ok(cached.access_token.clone())
    }

    /// The token worth revoking: the refresh token when there is one.
    async fn revocable_token(&self) -> String {
        match self.refresh_token {
            Some(ref token) => token.clone(),
            None => self.cached_token.read().await.access_token.clone(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account", &self.account)
            .field("scope", &self.scope)
            .field("refreshable", &self.token_client.is_some())
            .finish_non_exhaustive()
    }
}

/// Decode an identity token and return the account it names.
///
/// The token comes straight from the token endpoint over TLS, so only the
/// claims are checked: audience, issuer, expiry and a present, verified email.
pub fn decode_id_token(id_token: &str, client_id: &str) -> Result<Account> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.set_audience(&[client_id]);
    validation.set_issuer(&GOOGLE_ISSUERS);

    let data = jsonwebtoken::decode::<IdTokenClaims>(
        id_token,
        &DecodingKey::from_secret(&[]),
        &validation,
    )?;
    let claims = data.claims;

    if claims.email_verified == Some(false) {
        return Err(DriveError::SignInFailed("Account email is not verified".into()));
    }
    let email = claims
        .email
        .ok_or_else(|| DriveError::SignInFailed("Identity token carries no email".into()))?;

    Ok(Account {
        subject: claims.sub,
        email,
    })
}

/// The federated identity provider the facade signs in against.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Build the request the caller uses to launch the interactive sign-in.
    fn sign_in_request(&self) -> Result<SignInRequest>;

    /// Turn the provider's redirect into a credential.
    async fn complete_sign_in(
        &self,
        request: &SignInRequest,
        response: &AuthorizationResponse,
    ) -> Result<Credential>;

    /// Rebuild a credential from a refresh token issued earlier.
    async fn restore(&self, refresh_token: &str) -> Result<Credential>;

    /// Sign out, revoking the credential's grant when one is given.
    async fn sign_out(&self, credential: Option<&Credential>) -> Result<()>;
}

/// Google OAuth 2.0 / OpenID Connect.
pub struct GoogleIdentityProvider {
    config: DriveConfig,
    http: Client,
    token_client: Arc<TokenClient>,
}

impl GoogleIdentityProvider {
    pub fn new(config: DriveConfig) -> Self {
        let http = Client::new();
        let token_client = Arc::new(TokenClient::new(http.clone(), &config));
        Self {
            config,
            http,
            token_client,
        }
    }

    fn account_from(&self, tokens: &TokenResponse) -> Result<Account> {
        let id_token = tokens.id_token.as_deref().ok_or_else(|| {
            DriveError::SignInFailed("Token response carries no identity token".into())
        })?;
        decode_id_token(id_token, &self.config.client_id)
    }
}

#[async_trait]
impl IdentityProvider for GoogleIdentityProvider {
    fn sign_in_request(&self) -> Result<SignInRequest> {
        let verifier = PkceVerifier::new();
        let scopes = self.config.scopes();

        let mut url = Url::parse(&self.config.auth_url)
            .map_err(|e| DriveError::InvalidConfig(format!("Invalid auth URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", verifier.state())
            .append_pair("code_challenge", &verifier.challenge())
            .append_pair("code_challenge_method", "S256")
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");

        debug!("Built Google sign-in request");

        Ok(SignInRequest::new(url.to_string(), scopes, verifier))
    }

    #[instrument(skip_all)]
    async fn complete_sign_in(
        &self,
        request: &SignInRequest,
        response: &AuthorizationResponse,
    ) -> Result<Credential> {
        if let Some(ref error) = response.error {
            let message = match response.error_description {
                Some(ref desc) => format!("{}: {}", error, desc),
                None => error.clone(),
            };
            return Err(DriveError::SignInFailed(message));
        }

        let state = response.state.as_deref().unwrap_or_default();
        if state != request.verifier.state() {
            warn!("OAuth state mismatch on sign-in redirect");
            return Err(DriveError::StateMismatch {
                expected: request.verifier.state().to_string(),
                actual: state.to_string(),
            });
        }

        let code = response
            .code
            .as_deref()
            .ok_or_else(|| DriveError::SignInFailed("Redirect carries no authorization code".into()))?;

        let tokens = self
            .token_client
            .grant(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("code_verifier", request.verifier.verifier()),
            ])
            .await?;

        let account = self.account_from(&tokens)?;
        info!(email = %account.email, "Signed in");

        Ok(Credential::refreshable(
            account,
            tokens,
            None,
            Arc::clone(&self.token_client),
        ))
    }

    #[instrument(skip_all)]
    async fn restore(&self, refresh_token: &str) -> Result<Credential> {
        let tokens = self
            .token_client
            .grant(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;

        let account = self.account_from(&tokens)?;
        info!(email = %account.email, "Restored session");

        Ok(Credential::refreshable(
            account,
            tokens,
            Some(refresh_token.to_string()),
            Arc::clone(&self.token_client),
        ))
    }

    #[instrument(skip_all)]
    async fn sign_out(&self, credential: Option<&Credential>) -> Result<()> {
        let Some(credential) = credential else {
            debug!("Sign-out without a credential, nothing to revoke");
            return Ok(());
        };

        let token = credential.revocable_token().await;
        let response = self
            .http
            .post(&self.config.revoke_url)
            .form(&[("token", token.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Token revocation failed");
            return Err(DriveError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        info!(email = %credential.account().email, "Revoked Google grant");
        Ok(())
    }
}
