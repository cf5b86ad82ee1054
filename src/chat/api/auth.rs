//! Authenticated viewer context.
//!
//! The bearer token and the identity it belongs to travel together in an
//! [`AuthContext`] that is handed to every service needing credentials.

use reqwest::StatusCode;
use tracing::{debug, info, warn};
use url::Url;

use crate::chat::api::dto::{ValidateTokenResponse, WireUser};
use crate::chat::api::http;
use crate::chat::core::config::ApiConfig;
use crate::chat::core::errors::ApiError;
use crate::chat::core::ids::UserId;
use crate::chat::core::model::{Role, Viewer};

/// Account details of the signed-in user.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Account {
    /// Account id.
    pub id: UserId,
    /// Display name.
    pub name: Option<String>,
    /// E-mail address.
    pub email: String,
    /// Role the account acts in.
    pub role: Role,
}

impl From<WireUser> for Account {
    fn from(user: WireUser) -> Self {
        let role = match user.role.as_deref() {
            Some("admin" | "support") => Role::Support,
            _ => Role::Customer,
        };
        Self {
            id: UserId::new(user.id),
            name: user.name,
            email: user.email,
            role,
        }
    }
}

/// Bearer token plus the account it authenticates.
#[derive(Clone, Eq, PartialEq)]
pub struct AuthContext {
    token: String,
    account: Account,
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("token", &"<redacted>")
            .field("account", &self.account)
            .finish()
    }
}

impl AuthContext {
    /// Pair a token with its account, e.g. straight from a login response.
    #[must_use]
    pub fn new(token: impl Into<String>, account: Account) -> Self {
        Self {
            token: token.into(),
            account,
        }
    }

    /// Bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Signed-in account.
    #[must_use]
    pub const fn account(&self) -> &Account {
        &self.account
    }

    /// Identity used on the realtime channel.
    #[must_use]
    pub fn viewer(&self) -> Viewer {
        Viewer {
            user_id: self.account.id.clone(),
            role: self.account.role,
        }
    }
}

/// Token validation and logout against `/user/v1`.
pub struct AuthService {
    client: reqwest::Client,
    base: Url,
}

impl AuthService {
    /// Create a new auth service.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        Ok(Self {
            client: http::build_client(config)?,
            base: Url::parse(&config.base_url)?,
        })
    }

    /// Check a stored token and resolve the account behind it.
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthorized`] if the token is rejected or the
    /// backend answers without account data.
    pub async fn validate(&self, token: &str) -> Result<AuthContext, ApiError> {
        let url = http::endpoint(&self.base, &["user", "v1", "validate-token"])?;
        let response = self.client.get(url).bearer_auth(token).send().await?;
        let response = http::ensure_success(response).await?;
        let body: ValidateTokenResponse = http::decode(response).await?;

        let Some(user) = body.user else {
            warn!("Token validation succeeded without user data");
            return Err(ApiError::Unauthorized("missing user data".to_string()));
        };

        let account = Account::from(user);
        info!(user_id = %account.id, role = %account.role, "Token validated");
        Ok(AuthContext::new(token, account))
    }

    /// Log out on the backend. Failures are logged; the caller drops the
    /// context either way.
    pub async fn logout(&self, auth: AuthContext) {
        let url = match http::endpoint(&self.base, &["user", "v1", "logout"]) {
            Ok(url) => url,
            Err(err) => {
                warn!(?err, "Cannot build logout URL");
                return;
            }
        };

        match self.client.post(url).bearer_auth(auth.token()).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                debug!(user_id = %auth.account().id, "Logged out");
            }
            Ok(response) => {
                warn!(status = %response.status(), "Logout returned non-success status");
            }
            Err(err) => warn!(?err, "Logout request failed"),
        }
    }
}
