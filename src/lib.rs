//! Client for the todo API: a request gateway that renews expired access
//! tokens on its own, plus persistent attempt limiters for sensitive actions.

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod persist;
pub mod rate_limit;
pub mod state;

pub use auth::{AuthFlow, AuthLimits};
pub use error::{AuthFlowError, LimitConfigError, RequestError};
pub use gateway::Gateway;
pub use models::{Method, RequestDescriptor};
pub use rate_limit::{AttemptLimiter, AttemptStatus, LimitConfig};
pub use state::{AppState, AuthSnapshot, AuthState, AuthUpdate};
