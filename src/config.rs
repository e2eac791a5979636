use chrono::Duration;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub server: ServerConfig,
    pub settlement: SettlementConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Knobs for the confirmation/settlement core. All of these are tunable via
/// the environment; the defaults match production behavior.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// How long players have to approve or report a recorded score.
    pub confirmation_window: Duration,
    /// Number of reports that cancels a match.
    pub report_threshold: i32,
    /// Interval of the background expiry sweep.
    pub sweep_interval_secs: u64,
    /// Attempts for transient persistence failures (vote, apply, discard).
    pub retry_attempts: u32,
    /// Base of the linear backoff between retry attempts.
    pub retry_backoff_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            confirmation_window: Duration::hours(24),
            report_threshold: 2,
            sweep_interval_secs: 300,
            retry_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl SettlementConfig {
    /// Demo configuration: a 1-hour confirmation window so a full match
    /// lifecycle fits in a live walkthrough. Selected with DEMO_MODE=true.
    pub fn demo() -> Self {
        Self {
            confirmation_window: Duration::hours(1),
            ..Self::default()
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")?;
        let redis_url = env::var("REDIS_URL")?;
        let port: u16 = env::var("PORT")?.parse()?;
        let host = env::var("HOST")?;

        let demo_mode = env::var("DEMO_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let mut settlement = if demo_mode {
            SettlementConfig::demo()
        } else {
            SettlementConfig::default()
        };

        if let Ok(hours) = env::var("CONFIRMATION_WINDOW_HOURS") {
            settlement.confirmation_window = Duration::hours(hours.parse()?);
        }
        if let Ok(threshold) = env::var("REPORT_THRESHOLD") {
            settlement.report_threshold = threshold.parse()?;
        }
        if let Ok(interval) = env::var("SWEEP_INTERVAL_SECS") {
            settlement.sweep_interval_secs = interval.parse()?;
        }
        if let Ok(attempts) = env::var("RETRY_ATTEMPTS") {
            settlement.retry_attempts = attempts.parse()?;
        }
        if let Ok(backoff) = env::var("RETRY_BACKOFF_MS") {
            settlement.retry_backoff_ms = backoff.parse()?;
        }

        Ok(Config {
            database: DatabaseConfig { url: database_url },
            redis: RedisConfig { url: redis_url },
            server: ServerConfig { port, host },
            settlement,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_is_24_hours() {
        let config = SettlementConfig::default();
        assert_eq!(config.confirmation_window, Duration::hours(24));
        assert_eq!(config.report_threshold, 2);
    }

    #[test]
    fn demo_mode_shortens_window_only() {
        let config = SettlementConfig::demo();
        assert_eq!(config.confirmation_window, Duration::hours(1));
        assert_eq!(config.report_threshold, 2);
        assert_eq!(config.retry_attempts, 3);
    }
}
