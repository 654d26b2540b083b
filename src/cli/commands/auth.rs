//! Lockout, rate-limit, session and password policy flags.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

use crate::auth::AuthConfig;

pub const ARG_MAX_LOGIN_ATTEMPTS: &str = "max-login-attempts";
pub const ARG_LOCKOUT_SECONDS: &str = "lockout-seconds";
pub const ARG_RATE_LIMIT_ATTEMPTS: &str = "rate-limit-attempts";
pub const ARG_RATE_LIMIT_WINDOW_SECONDS: &str = "rate-limit-window-seconds";
pub const ARG_SESSION_TIMEOUT_SECONDS: &str = "session-timeout-seconds";
pub const ARG_SESSION_ROTATION_SECONDS: &str = "session-rotation-seconds";
pub const ARG_SESSION_SWEEP_SECONDS: &str = "session-sweep-seconds";
pub const ARG_MIN_PASSWORD_LENGTH: &str = "min-password-length";
pub const ARG_PREAUTH_CSRF_TTL_SECONDS: &str = "preauth-csrf-ttl-seconds";
pub const ARG_APPLY_SCHEMA: &str = "apply-schema";

#[derive(Debug)]
pub struct Options {
    pub config: AuthConfig,
    pub sweep_interval: Duration,
    pub apply_schema: bool,
}

impl Options {
    /// Parse auth policy arguments into an [`AuthConfig`].
    ///
    /// # Errors
    /// Returns an error if a value is missing or the resulting policy is invalid.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        fn read<T: Clone + Send + Sync + 'static>(
            matches: &ArgMatches,
            id: &str,
        ) -> anyhow::Result<T> {
            matches
                .get_one::<T>(id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        }

        let config = AuthConfig::new()
            .with_max_login_attempts(read(matches, ARG_MAX_LOGIN_ATTEMPTS)?)
            .with_lockout_seconds(read(matches, ARG_LOCKOUT_SECONDS)?)
            .with_rate_limit_attempts(read(matches, ARG_RATE_LIMIT_ATTEMPTS)?)
            .with_rate_limit_window_seconds(read(matches, ARG_RATE_LIMIT_WINDOW_SECONDS)?)
            .with_session_timeout_seconds(read(matches, ARG_SESSION_TIMEOUT_SECONDS)?)
            .with_session_rotation_seconds(read(matches, ARG_SESSION_ROTATION_SECONDS)?)
            .with_min_password_length(read(matches, ARG_MIN_PASSWORD_LENGTH)?)
            .with_preauth_csrf_ttl_seconds(read(matches, ARG_PREAUTH_CSRF_TTL_SECONDS)?);
        config.validate()?;

        let sweep_seconds: u64 = read(matches, ARG_SESSION_SWEEP_SECONDS)?;
        if sweep_seconds == 0 {
            anyhow::bail!("--{ARG_SESSION_SWEEP_SECONDS} must be greater than zero");
        }

        Ok(Self {
            config,
            sweep_interval: Duration::from_secs(sweep_seconds),
            apply_schema: matches.get_flag(ARG_APPLY_SCHEMA),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_lockout_args(command);
    let command = with_session_args(command);
    command
        .arg(
            Arg::new(ARG_MIN_PASSWORD_LENGTH)
                .long(ARG_MIN_PASSWORD_LENGTH)
                .help("Minimum password length for registration and password changes")
                .env("GATEHOUSE_MIN_PASSWORD_LENGTH")
                .default_value("8")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_APPLY_SCHEMA)
                .long(ARG_APPLY_SCHEMA)
                .help("Create missing tables and default roles before serving")
                .env("GATEHOUSE_APPLY_SCHEMA")
                .action(ArgAction::SetTrue),
        )
}

fn with_lockout_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAX_LOGIN_ATTEMPTS)
                .long(ARG_MAX_LOGIN_ATTEMPTS)
                .help("Failed logins before an account is locked")
                .env("GATEHOUSE_MAX_LOGIN_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_SECONDS)
                .long(ARG_LOCKOUT_SECONDS)
                .help("Account lockout duration in seconds")
                .env("GATEHOUSE_LOCKOUT_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_ATTEMPTS)
                .long(ARG_RATE_LIMIT_ATTEMPTS)
                .help("Attempts allowed per client and action within one window")
                .env("GATEHOUSE_RATE_LIMIT_ATTEMPTS")
                .default_value("20")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_WINDOW_SECONDS)
                .long(ARG_RATE_LIMIT_WINDOW_SECONDS)
                .help("Rate limit window in seconds")
                .env("GATEHOUSE_RATE_LIMIT_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_TIMEOUT_SECONDS)
                .long(ARG_SESSION_TIMEOUT_SECONDS)
                .help("Idle time in seconds after which a session expires")
                .env("GATEHOUSE_SESSION_TIMEOUT_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_SESSION_ROTATION_SECONDS)
                .long(ARG_SESSION_ROTATION_SECONDS)
                .help("Session identifier rotation interval in seconds")
                .env("GATEHOUSE_SESSION_ROTATION_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_PREAUTH_CSRF_TTL_SECONDS)
                .long(ARG_PREAUTH_CSRF_TTL_SECONDS)
                .help("Lifetime in seconds of CSRF tokens issued before login")
                .env("GATEHOUSE_PREAUTH_CSRF_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_SESSION_SWEEP_SECONDS)
                .long(ARG_SESSION_SWEEP_SECONDS)
                .help("Interval in seconds between expired-session sweeps")
                .env("GATEHOUSE_SESSION_SWEEP_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}
