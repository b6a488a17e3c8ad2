use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::LimitConfigError;
use crate::rate_limit::LimitConfig;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "todo-gateway")]
#[command(about = "Authenticated client for the todo API")]
#[command(version)]
pub struct Args {
    // Base URL of the REST API
    #[arg(long, env = "TODO_API_URL", default_value = "http://localhost:5000/api")]
    pub base_url: String,

    // Where session and rate limit state is persisted
    #[arg(long, env = "TODO_GATEWAY_STATE_DIR", default_value = ".todo-gateway")]
    pub state_dir: PathBuf,

    // Request timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    // Log filter used when RUST_LOG is unset
    #[arg(long, env = "TODO_GATEWAY_LOG", default_value = "warn")]
    pub log_level: String,

    // Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    // Print Prometheus metrics after the command
    #[arg(long)]
    pub metrics: bool,

    // Login attempts allowed per window
    #[arg(long, default_value_t = 5)]
    pub login_max_attempts: u32,

    // Login window in seconds
    #[arg(long, default_value_t = 900)]
    pub login_window: u64,

    // Signup attempts allowed per window
    #[arg(long, default_value_t = 3)]
    pub signup_max_attempts: u32,

    // Signup window in seconds
    #[arg(long, default_value_t = 3600)]
    pub signup_window: u64,

    // Password reset requests allowed per window
    #[arg(long, default_value_t = 3)]
    pub reset_max_attempts: u32,

    // Password reset window in seconds
    #[arg(long, default_value_t = 3600)]
    pub reset_window: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Send an arbitrary request with the stored session
    Request {
        /// GET, POST, PUT or DELETE
        method: String,
        /// Endpoint path, e.g. /todos
        path: String,
        /// Query parameter as key=value (GET only, repeatable)
        #[arg(short, long = "query", value_parser = parse_key_value)]
        query: Vec<(String, String)>,
        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
    },
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "TODO_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account
    Signup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "TODO_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Confirm an email address with the emailed token
    VerifyEmail { token: String },
    /// Ask for a password reset email
    ForgotPassword {
        #[arg(long)]
        email: String,
    },
    /// Set a new password with a reset token
    ResetPassword {
        token: String,
        #[arg(long, env = "TODO_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Show the signed-in user
    Me,
    /// Forget the stored session
    Logout,
    /// Show attempt limiter status
    Limits,
}

impl Args {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn login_limit(&self) -> Result<LimitConfig, LimitConfigError> {
        LimitConfig::per_window(self.login_max_attempts, Duration::from_secs(self.login_window))
    }

    pub fn signup_limit(&self) -> Result<LimitConfig, LimitConfigError> {
        LimitConfig::per_window(self.signup_max_attempts, Duration::from_secs(self.signup_window))
    }

    pub fn reset_limit(&self) -> Result<LimitConfig, LimitConfigError> {
        LimitConfig::per_window(self.reset_max_attempts, Duration::from_secs(self.reset_window))
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty query key in {raw}"));
    }
    Ok((key.to_string(), value.to_string()))
}
