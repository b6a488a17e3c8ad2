//! Account flows built on the gateway and the attempt limiters.
//!
//! Sensitive actions consult their limiter before going out, record an
//! attempt only when the call fails, and wipe the history once it succeeds.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AuthFlowError, RequestError};
use crate::gateway::Gateway;
use crate::metrics::ATTEMPTS_BLOCKED;
use crate::models::{
    LoginRequest, LoginResponse, MessageResponse, ProfileResponse, RequestDescriptor,
    ResetPasswordRequest, SignupRequest, UserProfile,
};
use crate::rate_limit::{AttemptLimiter, AttemptStatus, Clock, LimitConfig, RateLimitStore};
use crate::state::{AuthState, AuthUpdate};

pub const LOGIN_KEY: &str = "login";
pub const SIGNUP_KEY: &str = "signup";
pub const FORGOT_PASSWORD_KEY: &str = "forgot-password";

/// Limiter settings for each guarded action.
#[derive(Clone, Copy, Debug)]
pub struct AuthLimits {
    pub login: LimitConfig,
    pub signup: LimitConfig,
    pub forgot_password: LimitConfig,
}

pub struct AuthFlow {
    gateway: Gateway,
    auth: Arc<dyn AuthState>,
    login: AttemptLimiter,
    signup: AttemptLimiter,
    forgot_password: AttemptLimiter,
}

impl AuthFlow {
    pub fn new(
        gateway: Gateway,
        limits: AuthLimits,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let auth = gateway.auth().clone();
        let limiter = |key: &str, config| {
            AttemptLimiter::new(key, config, store.clone(), clock.clone())
        };

        Self {
            login: limiter(LOGIN_KEY, limits.login),
            signup: limiter(SIGNUP_KEY, limits.signup),
            forgot_password: limiter(FORGOT_PASSWORD_KEY, limits.forgot_password),
            gateway,
            auth,
        }
    }

    /// Signs in and replaces the stored session with the returned tokens and
    /// user. The user is `None` when the API does not send one.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<UserProfile>, AuthFlowError> {
        let body = to_body(&LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })?;

        let response: LoginResponse = guarded(
            &self.login,
            self.gateway
                .send_as(RequestDescriptor::post("/auth/login").with_body(body)),
        )
        .await?;

        let data = response.data;
        if data.access_token.is_empty() {
            return Err(RequestError::Parse("login response has no access token".to_string()).into());
        }

        // Nothing from a previous session survives a fresh sign-in
        self.auth.clear();
        self.auth.write(AuthUpdate {
            access_token: Some(data.access_token),
            refresh_token: data.refresh_token,
            user: data.user.clone(),
            initialized: None,
        });
        match &data.user {
            Some(user) => info!(user_id = %user.id, "signed in"),
            None => info!("signed in without a user profile"),
        }
        Ok(data.user)
    }

    /// Creates an account; returns the server's acknowledgement message.
    pub async fn signup(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<String, AuthFlowError> {
        let body = to_body(&SignupRequest {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        })?;

        let response: MessageResponse = guarded(
            &self.signup,
            self.gateway
                .send_as(RequestDescriptor::post("/auth/signup").with_body(body)),
        )
        .await?;
        info!("account created");
        Ok(response.message)
    }

    pub async fn verify_email(&self, token: &str) -> Result<String, AuthFlowError> {
        let descriptor =
            RequestDescriptor::post("/auth/verify-email").with_body(json!({ "token": token }));
        let response: MessageResponse = self.gateway.send_as(descriptor).await?;
        Ok(response.message)
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<String, AuthFlowError> {
        let descriptor =
            RequestDescriptor::post("/auth/forgot-password").with_body(json!({ "email": email }));
        let response: MessageResponse =
            guarded(&self.forgot_password, self.gateway.send_as(descriptor)).await?;
        Ok(response.message)
    }

    pub async fn reset_password(&self, token: &str, password: &str) -> Result<String, AuthFlowError> {
        let body = to_body(&ResetPasswordRequest {
            token: token.to_string(),
            password: password.to_string(),
        })?;
        let response: MessageResponse = self
            .gateway
            .send_as(RequestDescriptor::post("/auth/reset-password").with_body(body))
            .await?;
        Ok(response.message)
    }

    /// Fetches the signed-in user and refreshes the cached copy.
    pub async fn fetch_profile(&self) -> Result<UserProfile, AuthFlowError> {
        let token = self.auth.read().access_token;
        if token.is_empty() {
            return Err(AuthFlowError::NotAuthenticated);
        }

        let response: ProfileResponse = self
            .gateway
            .send_as(RequestDescriptor::get("/auth/me").with_token(token))
            .await?;
        self.auth.write(AuthUpdate::user(response.data.clone()));
        Ok(response.data)
    }

    pub fn logout(&self) {
        self.auth.clear();
        info!("signed out");
    }

    pub fn limits(&self) -> Vec<(&str, AttemptStatus)> {
        [&self.login, &self.signup, &self.forgot_password]
            .into_iter()
            .map(|limiter| (limiter.key(), limiter.can_attempt()))
            .collect()
    }
}

// Runs `call` if the limiter allows it; failures count against the budget, success clears it
async fn guarded<T>(
    limiter: &AttemptLimiter,
    call: impl Future<Output = Result<T, RequestError>>,
) -> Result<T, AuthFlowError> {
    let status = limiter.can_attempt();
    if !status.allowed {
        ATTEMPTS_BLOCKED.inc();
        let retry_after_ms = status.remaining_ms.unwrap_or_default();
        warn!(key = limiter.key(), retry_after_ms, "too many attempts");
        return Err(AuthFlowError::RateLimited { retry_after_ms });
    }

    match call.await {
        Ok(value) => {
            limiter.reset();
            Ok(value)
        }
        Err(err) => {
            limiter.increment();
            Err(err.into())
        }
    }
}

fn to_body<T: serde::Serialize>(payload: &T) -> Result<serde_json::Value, RequestError> {
    serde_json::to_value(payload)
        .map_err(|err| RequestError::Serialization(format!("Failed to encode request: {err}")))
}
