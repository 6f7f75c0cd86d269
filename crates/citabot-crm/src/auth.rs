//! Per-tenant OAuth: expiry check before every outbound call, refresh with
//! rotation, code exchange for first-time installs.

use citabot_store::tokens::{TokenPayload, TokenStore};
use tracing::{error, info, instrument};

use crate::error::{CrmError, Result};
use crate::types::TokenResponse;

pub struct CrmAuth {
    http: reqwest::Client,
    tokens: TokenStore,
    client_id: String,
    client_secret: String,
    oauth_base_url: String,
}

impl CrmAuth {
    pub fn new(
        http: reqwest::Client,
        tokens: TokenStore,
        client_id: String,
        client_secret: String,
        oauth_base_url: String,
    ) -> Self {
        Self {
            http,
            tokens,
            client_id,
            client_secret,
            oauth_base_url,
        }
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.tokens
    }

    /// Valid bearer token for the account, refreshing first if expired.
    /// Refresh is attempted at most once per call.
    pub async fn bearer_token(&self, account_id: &str) -> Result<String> {
        if self.tokens.is_expired(account_id)? {
            info!(%account_id, "access token expired, refreshing");
            self.refresh(account_id).await?;
        }
        let row = self
            .tokens
            .get(account_id)?
            .ok_or_else(|| CrmError::NoTokens {
                account_id: account_id.to_string(),
            })?;
        Ok(row.access_token)
    }

    /// Refresh the access token. When the response rotates the refresh
    /// token, both tokens are persisted from that single response;
    /// otherwise only the access token and expiry are replaced.
    ///
    /// On failure the stored refresh token is left as-is so an operator
    /// can inspect the tenant before re-running the install flow.
    #[instrument(skip(self))]
    pub async fn refresh(&self, account_id: &str) -> Result<TokenResponse> {
        let row = self
            .tokens
            .get(account_id)?
            .ok_or_else(|| CrmError::NoTokens {
                account_id: account_id.to_string(),
            })?;

        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", row.refresh_token.as_str()),
        ];

        let resp = self
            .http
            .post(format!("{}/oauth/token", self.oauth_base_url))
            .form(&form)
            .send()
            .await
            .map_err(|e| CrmError::TokenRefresh(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(%account_id, status, body = %body, "token refresh rejected");
            return Err(CrmError::TokenRefresh(format!("status {status}: {body}")));
        }

        let new_tokens: TokenResponse = resp
            .json()
            .await
            .map_err(|e| CrmError::TokenRefresh(format!("bad token response: {e}")))?;

        match &new_tokens.refresh_token {
            Some(rotated) => {
                info!(%account_id, "refresh token rotated, saving full pair");
                self.tokens.save(
                    account_id,
                    &TokenPayload {
                        access_token: new_tokens.access_token.clone(),
                        refresh_token: rotated.clone(),
                        token_type: new_tokens.token_type.clone(),
                        scope: new_tokens.scope.clone(),
                        location_id: new_tokens.location_id.clone(),
                        expires_in: new_tokens.expires_in,
                    },
                )?;
            }
            None => {
                self.tokens.update_access_token(
                    account_id,
                    &new_tokens.access_token,
                    new_tokens.expires_in,
                )?;
            }
        }

        info!(%account_id, "token refresh succeeded");
        Ok(new_tokens)
    }

    /// Exchange an authorization code (first-time install) and persist the
    /// resulting token pair.
    #[instrument(skip(self, code))]
    pub async fn exchange_code(
        &self,
        account_id: &str,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<TokenResponse> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
        ];
        if let Some(uri) = redirect_uri {
            form.push(("redirect_uri", uri));
        }

        let resp = self
            .http
            .post(format!("{}/oauth/token", self.oauth_base_url))
            .form(&form)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmError::Api {
                status,
                message: body,
            });
        }

        let tokens: TokenResponse = resp
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;

        self.tokens.save(
            account_id,
            &TokenPayload {
                access_token: tokens.access_token.clone(),
                refresh_token: tokens.refresh_token.clone().unwrap_or_default(),
                token_type: tokens.token_type.clone(),
                scope: tokens.scope.clone(),
                location_id: tokens.location_id.clone(),
                expires_in: tokens.expires_in,
            },
        )?;

        info!(%account_id, "authorization code exchanged");
        Ok(tokens)
    }
}
