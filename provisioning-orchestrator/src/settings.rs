use anyhow::{Context, Result};
use provisioning_providers::ProviderClients;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_AWS_REGION: &str = "us-east-1";
const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 60;
const DEFAULT_RESERVATION_TIMEOUT_SECS: u32 = 2 * 60 * 60;
const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub database_max_connections: u32,
    pub aws_default_region: String,
    pub watchdog: WatchdogSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    pub interval: Duration,
    /// Pending reservations without progress for this long are failed.
    pub reservation_timeout_secs: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_WATCHDOG_INTERVAL_SECS),
            reservation_timeout_secs: DEFAULT_RESERVATION_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    /// Reads the process environment. Call `dotenv` first to pick up a local `.env`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;
        let interval_secs: u64 = parse_or(&lookup, "WATCHDOG_INTERVAL_SECS", DEFAULT_WATCHDOG_INTERVAL_SECS)?;
        if interval_secs == 0 {
            anyhow::bail!("WATCHDOG_INTERVAL_SECS must be positive");
        }
        Ok(Self {
            database_url,
            database_max_connections: parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                DEFAULT_DATABASE_MAX_CONNECTIONS,
            )?,
            aws_default_region: lookup("AWS_DEFAULT_REGION")
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_AWS_REGION.to_string()),
            watchdog: WatchdogSettings {
                interval: Duration::from_secs(interval_secs),
                reservation_timeout_secs: parse_or(
                    &lookup,
                    "RESERVATION_TIMEOUT_SECS",
                    DEFAULT_RESERVATION_TIMEOUT_SECS,
                )?,
            },
        })
    }

    /// Real provider clients for credential checks and catalog listing.
    pub fn provider_clients(&self) -> Result<ProviderClients> {
        ProviderClients::new(self.aws_default_region.clone())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw:?}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| env.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let s = Settings::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/db")])).unwrap();
        assert_eq!(s.database_url, "postgres://localhost/db");
        assert_eq!(s.aws_default_region, "us-east-1");
        assert_eq!(s.database_max_connections, 5);
        assert_eq!(s.watchdog.interval, Duration::from_secs(60));
        assert_eq!(s.watchdog.reservation_timeout_secs, 7200);
    }

    #[test]
    fn overrides_are_parsed() {
        let s = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("AWS_DEFAULT_REGION", "eu-west-3"),
            ("WATCHDOG_INTERVAL_SECS", "15"),
            ("RESERVATION_TIMEOUT_SECS", " 900 "),
        ]))
        .unwrap();
        assert_eq!(s.aws_default_region, "eu-west-3");
        assert_eq!(s.watchdog.interval, Duration::from_secs(15));
        assert_eq!(s.watchdog.reservation_timeout_secs, 900);
        assert!(s.provider_clients().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Settings::from_lookup(lookup(&[])).is_err());

        let err = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("RESERVATION_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RESERVATION_TIMEOUT_SECS"));

        assert!(Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("WATCHDOG_INTERVAL_SECS", "0"),
        ]))
        .is_err());
    }
}
