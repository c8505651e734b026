use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use portcullis::{
    LoginSecurityConfig, LoginSecurityService, SessionConfig, SessionManager, StoreClient,
    StoreConfig, SystemClock, sqlite::SqliteCounterStore,
};

/// Administrative interface for a portcullis store
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database connection string
    #[arg(long, env = "PORTCULLIS_DATABASE_URL")]
    db_url: String,

    /// Key namespace shared with the application
    #[arg(long, env = "PORTCULLIS_NAMESPACE", default_value = "portcullis")]
    namespace: String,

    #[command(flatten)]
    policy: PolicyArgs,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

/// Lockout policy of the deployment. Unset values keep the library defaults.
#[derive(clap::Args, Debug, Default)]
struct PolicyArgs {
    /// Failures per identifier before lockout
    #[arg(long, env = "PORTCULLIS_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Failure counting window per identifier, in seconds
    #[arg(long, env = "PORTCULLIS_ATTEMPT_WINDOW_SECS")]
    attempt_window_secs: Option<i64>,

    /// Lockout duration, in seconds
    #[arg(long, env = "PORTCULLIS_LOCKOUT_SECS")]
    lockout_secs: Option<i64>,

    /// Failures per identifier before a captcha is demanded (0 disables captcha)
    #[arg(long, env = "PORTCULLIS_CAPTCHA_THRESHOLD")]
    captcha_threshold: Option<u32>,

    /// Failures per IP before the IP is blocked
    #[arg(long, env = "PORTCULLIS_IP_MAX_ATTEMPTS")]
    ip_max_attempts: Option<u32>,

    /// Failure counting window per IP, in seconds
    #[arg(long, env = "PORTCULLIS_IP_ATTEMPT_WINDOW_SECS")]
    ip_attempt_window_secs: Option<i64>,

    /// IP block duration, in seconds
    #[arg(long, env = "PORTCULLIS_IP_BLOCK_SECS")]
    ip_block_secs: Option<i64>,
}

impl PolicyArgs {
    fn login_security_config(&self) -> LoginSecurityConfig {
        let defaults = LoginSecurityConfig::default();
        LoginSecurityConfig {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            attempt_window: self
                .attempt_window_secs
                .map_or(defaults.attempt_window, Duration::seconds),
            lockout_duration: self
                .lockout_secs
                .map_or(defaults.lockout_duration, Duration::seconds),
            captcha_threshold: self.captcha_threshold.unwrap_or(defaults.captcha_threshold),
            ip_max_attempts: self.ip_max_attempts.unwrap_or(defaults.ip_max_attempts),
            ip_attempt_window: self
                .ip_attempt_window_secs
                .map_or(defaults.ip_attempt_window, Duration::seconds),
            ip_block_duration: self
                .ip_block_secs
                .map_or(defaults.ip_block_duration, Duration::seconds),
            ..defaults
        }
    }
}

/// Available CLI commands
#[derive(clap::Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Remove expired sessions and stale session index entries
    Cleanup,
    /// Remove every record last written more than the given number of days ago
    Expire {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
    /// Clear the failed attempts of a login identifier
    Unlock { identifier: String },
    /// Lift the block on an IP address
    Unblock { ip: String },
    /// Print the security context of an identifier and IP as JSON
    Inspect { ip: String, identifier: String },
    /// Check that the store answers
    Health,
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();
    if let Commands::Version = cli.command {
        println!("Portcullis v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let clock = Arc::new(SystemClock);
    let store = SqliteCounterStore::connect(&cli.db_url, clock.clone()).await?;
    let store = StoreClient::new(
        Arc::new(store),
        &StoreConfig::default().with_namespace(cli.namespace),
    );
    let security = LoginSecurityService::new(
        store.clone(),
        cli.policy.login_security_config(),
        clock.clone(),
    );
    let sessions = SessionManager::new(store.clone(), SessionConfig::default(), clock);

    match cli.command {
        Commands::Migrate => {
            println!("Running migrations...");
            store.migrate().await?;
        }
        Commands::Cleanup => {
            let cleaned = sessions.cleanup_expired_sessions().await?;
            println!("Removed {cleaned} expired session records and index entries");
            let purged = store.purge_expired("").await?;
            println!("Purged {purged} other expired records");
        }
        Commands::Expire { older_than_days } => {
            let removed = security
                .expire_old_data(Utc::now() - Duration::days(older_than_days))
                .await?;
            println!("Removed {removed} records");
        }
        Commands::Unlock { identifier } => {
            if security.unlock_identifier(&identifier).await? {
                println!("Unlocked {identifier}");
            } else {
                println!("{identifier} was not locked");
            }
        }
        Commands::Unblock { ip } => {
            if security.unblock_ip(&ip).await? {
                println!("Unblocked {ip}");
            } else {
                println!("{ip} was not blocked");
            }
        }
        Commands::Inspect { ip, identifier } => {
            let lockout = security.get_lockout_info(&identifier).await?;
            let ip_block = security.get_ip_block_info(&ip).await?;
            let delay = security.get_delay_info(&ip, &identifier).await?;
            let report = serde_json::json!({
                "lockout": lockout,
                "ip_block": ip_block,
                "delay": delay,
                "captcha_required": security.is_captcha_required(&ip, &identifier).await?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Health => {
            store.health_check().await?;
            println!("ok");
        }
        Commands::Version => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "portcullis",
            "--db-url",
            "sqlite::memory:",
            "--max-attempts",
            "8",
            "--lockout-secs",
            "1800",
            "--captcha-threshold",
            "0",
            "inspect",
            "203.0.113.7",
            "user@example.com",
        ])
        .unwrap();

        let config = cli.policy.login_security_config();
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.lockout_duration, Duration::minutes(30));
        assert_eq!(config.captcha_threshold, 0);
        assert_eq!(config.ip_max_attempts, LoginSecurityConfig::default().ip_max_attempts);
        assert!(matches!(cli.command, Commands::Inspect { .. }));
    }

    #[test]
    fn test_policy_defaults_match_library() {
        let config = PolicyArgs::default().login_security_config();
        let defaults = LoginSecurityConfig::default();
        assert_eq!(config.max_attempts, defaults.max_attempts);
        assert_eq!(config.attempt_window, defaults.attempt_window);
        assert_eq!(config.captcha_threshold, defaults.captcha_threshold);
        assert_eq!(config.ip_block_duration, defaults.ip_block_duration);
    }
}
