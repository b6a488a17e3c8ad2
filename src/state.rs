use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::config::Args;
use crate::error::RequestError;
use crate::gateway::Gateway;
use crate::models::UserProfile;
use crate::persist;
use crate::rate_limit::{Clock, FileRateLimitStore, RateLimitStore, SystemClock};

const AUTH_FILE: &str = "auth.json";
const RATE_LIMIT_FILE: &str = "rate_limits.json";

/// Credentials and cached profile of the current session.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthSnapshot {
    /// Empty means signed out.
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<UserProfile>,
    /// Set once persisted state has been rehydrated; never persisted itself.
    #[serde(skip)]
    pub initialized: bool,
}

impl AuthSnapshot {
    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty()
    }
}

/// Partial update; `None` fields are left alone.
#[derive(Clone, Debug, Default)]
pub struct AuthUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
    pub initialized: Option<bool>,
}

impl AuthUpdate {
    pub fn tokens(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token,
            ..Self::default()
        }
    }

    pub fn user(user: UserProfile) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    fn apply(self, snapshot: &mut AuthSnapshot) {
        if let Some(access_token) = self.access_token {
            snapshot.access_token = access_token;
        }
        if let Some(refresh_token) = self.refresh_token {
            snapshot.refresh_token = Some(refresh_token);
        }
        if let Some(user) = self.user {
            snapshot.user = Some(user);
        }
        if let Some(initialized) = self.initialized {
            snapshot.initialized = initialized;
        }
    }
}

/// Shared authentication state the gateway reads and, on terminal failures, wipes.
pub trait AuthState: Send + Sync {
    fn read(&self) -> AuthSnapshot;
    fn write(&self, update: AuthUpdate);
    /// Drops both tokens and the cached user together.
    fn clear(&self);
}

#[derive(Default)]
pub struct MemoryAuthState {
    inner: RwLock<AuthSnapshot>,
}

impl MemoryAuthState {
    pub fn new(snapshot: AuthSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }
}

impl AuthState for MemoryAuthState {
    fn read(&self) -> AuthSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write(&self, update: AuthUpdate) {
        let mut snapshot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        update.apply(&mut snapshot);
    }

    fn clear(&self) {
        let mut snapshot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let initialized = snapshot.initialized;
        *snapshot = AuthSnapshot {
            initialized,
            ..AuthSnapshot::default()
        };
    }
}

/// Auth state persisted as JSON so a session survives restarts.
pub struct FileAuthState {
    inner: RwLock<AuthSnapshot>,
    path: PathBuf,
}

impl FileAuthState {
    /// Rehydrates from `path` and marks the state initialized.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut snapshot: AuthSnapshot = persist::load(&path);
        snapshot.initialized = true;
        debug!(
            path = %path.display(),
            authenticated = snapshot.is_authenticated(),
            "auth state rehydrated"
        );

        Self {
            inner: RwLock::new(snapshot),
            path,
        }
    }

    fn flush(&self, snapshot: &AuthSnapshot) {
        if let Err(err) = persist::save(&self.path, snapshot) {
            warn!(path = %self.path.display(), error = %err, "failed to persist auth state");
        }
    }
}

impl AuthState for FileAuthState {
    fn read(&self) -> AuthSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write(&self, update: AuthUpdate) {
        let mut snapshot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        update.apply(&mut snapshot);
        self.flush(&snapshot);
    }

    fn clear(&self) {
        let mut snapshot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let initialized = snapshot.initialized;
        *snapshot = AuthSnapshot {
            initialized,
            ..AuthSnapshot::default()
        };
        self.flush(&snapshot);
    }
}

// app's shared state
pub struct AppState {
    pub gateway: Gateway,
    pub auth: Arc<dyn AuthState>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Opens the persistent stores under the state dir and builds the gateway.
    pub fn from_args(args: &Args) -> Result<Self, RequestError> {
        let dir: &Path = &args.state_dir;
        let auth: Arc<dyn AuthState> = Arc::new(FileAuthState::open(dir.join(AUTH_FILE)));
        let rate_limits: Arc<dyn RateLimitStore> =
            Arc::new(FileRateLimitStore::open(dir.join(RATE_LIMIT_FILE)));
        let gateway = Gateway::builder(&args.base_url)
            .timeout(args.timeout())
            .build(auth.clone())?;

        Ok(Self {
            gateway,
            auth,
            rate_limits,
            clock: Arc::new(SystemClock),
        })
    }
}
