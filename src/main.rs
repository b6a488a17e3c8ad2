use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use todo_gateway::config::{Args, Command};
use todo_gateway::{AppState, AuthFlow, AuthLimits, Method, RequestDescriptor, metrics};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let state = AppState::from_args(&args).context("failed to initialize gateway")?;
    let limits = AuthLimits {
        login: args.login_limit().context("invalid login limit")?,
        signup: args.signup_limit().context("invalid signup limit")?,
        forgot_password: args.reset_limit().context("invalid password reset limit")?,
    };
    let flow = AuthFlow::new(
        state.gateway.clone(),
        limits,
        state.rate_limits.clone(),
        state.clock.clone(),
    );

    let outcome = run(&args.command, &state, &flow).await;

    if args.metrics {
        print!("{}", metrics::render());
    }
    outcome
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(command: &Command, state: &AppState, flow: &AuthFlow) -> Result<()> {
    match command {
        Command::Request {
            method,
            path,
            query,
            body,
        } => {
            let method: Method = method.parse().map_err(anyhow::Error::msg)?;
            let mut descriptor = RequestDescriptor::new(method, path.as_str());
            for (key, value) in query {
                descriptor = descriptor.with_query(key.as_str(), value.as_str());
            }
            if let Some(raw) = body {
                let body: Value = serde_json::from_str(raw).context("--body is not valid JSON")?;
                descriptor = descriptor.with_body(body);
            }

            let response = state.gateway.send_authenticated(descriptor).await?;
            print_json(&response)?;
        }
        Command::Login { email, password } => {
            match flow.login(email, password).await? {
                Some(user) => println!("Signed in as {} <{}>", user.name, user.email),
                None => println!("Signed in as {email}"),
            }
        }
        Command::Signup {
            name,
            email,
            password,
        } => {
            let message = flow.signup(name, email, password).await?;
            println!("{}", or_default(message, "Account created. Check your email."));
        }
        Command::VerifyEmail { token } => {
            let message = flow.verify_email(token).await?;
            println!("{}", or_default(message, "Email verified."));
        }
        Command::ForgotPassword { email } => {
            let message = flow.request_password_reset(email).await?;
            println!("{}", or_default(message, "Password reset email sent."));
        }
        Command::ResetPassword { token, password } => {
            let message = flow.reset_password(token, password).await?;
            println!("{}", or_default(message, "Password updated."));
        }
        Command::Me => {
            let user = flow.fetch_profile().await?;
            print_json(&serde_json::to_value(user)?)?;
        }
        Command::Logout => {
            if !state.auth.read().is_authenticated() {
                bail!("not signed in");
            }
            flow.logout();
            println!("Signed out");
        }
        Command::Limits => {
            for (key, status) in flow.limits() {
                match (status.allowed, status.remaining_ms) {
                    (true, None) => println!(
                        "{key}: allowed, {} attempts left",
                        status.remaining_attempts.unwrap_or_default()
                    ),
                    (true, Some(ms)) => println!(
                        "{key}: allowed, {} attempts left, window resets in {}s",
                        status.remaining_attempts.unwrap_or_default(),
                        ms.div_ceil(1000)
                    ),
                    (false, ms) => println!(
                        "{key}: blocked for {}s",
                        ms.unwrap_or_default().div_ceil(1000)
                    ),
                }
            }
        }
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn or_default(message: String, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
