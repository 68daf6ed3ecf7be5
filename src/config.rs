//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::tasks::chunks::DEFAULT_CLEANUP_DELAY;
use crate::tasks::dispatch::DEFAULT_SCAN_BATCH;

/// Where the task database lives.
#[derive(Debug, Clone)]
pub enum DatabaseLocation {
    Local(PathBuf),
    Remote { url: String, auth_token: SecretString },
}

/// External quota service.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub base_url: String,
    pub token: Option<SecretString>,
}

/// Server configuration, read from `TASKHUB_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port.
    pub port: u16,
    pub database: DatabaseLocation,
    /// Root directory for staged callback chunks.
    pub object_dir: PathBuf,
    /// How long staged chunks are kept after the final chunk arrives.
    pub chunk_cleanup_delay: Duration,
    /// Interval of the background chunk cleanup sweep.
    pub cleanup_sweep_interval: Duration,
    /// Candidates read per page during dispatch.
    pub dispatch_scan_batch: u64,
    /// None disables quota admission.
    pub quota: Option<QuotaConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database: DatabaseLocation::Local(PathBuf::from("./data/taskhub.db")),
            object_dir: PathBuf::from("./data/objects"),
            chunk_cleanup_delay: DEFAULT_CLEANUP_DELAY,
            cleanup_sweep_interval: Duration::from_secs(10),
            dispatch_scan_batch: DEFAULT_SCAN_BATCH,
            quota: None,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset or blank keys fall
    /// back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database = match non_empty(&lookup, "TASKHUB_DB_URL") {
            Some(url) => {
                let token = non_empty(&lookup, "TASKHUB_DB_AUTH_TOKEN").ok_or_else(|| {
                    ConfigError::MissingRequired {
                        key: "TASKHUB_DB_AUTH_TOKEN".into(),
                        hint: "A remote database (TASKHUB_DB_URL) needs an auth token.".into(),
                    }
                })?;
                DatabaseLocation::Remote {
                    url,
                    auth_token: SecretString::from(token),
                }
            }
            None => match non_empty(&lookup, "TASKHUB_DB_PATH") {
                Some(path) => DatabaseLocation::Local(PathBuf::from(path)),
                None => defaults.database,
            },
        };

        let quota = non_empty(&lookup, "TASKHUB_QUOTA_URL").map(|base_url| QuotaConfig {
            base_url,
            token: non_empty(&lookup, "TASKHUB_QUOTA_TOKEN").map(SecretString::from),
        });

        Ok(Self {
            port: parse_var(&lookup, "TASKHUB_PORT")?.unwrap_or(defaults.port),
            database,
            object_dir: non_empty(&lookup, "TASKHUB_OBJECT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.object_dir),
            chunk_cleanup_delay: parse_var(&lookup, "TASKHUB_CHUNK_CLEANUP_DELAY_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.chunk_cleanup_delay),
            cleanup_sweep_interval: parse_var::<u64>(&lookup, "TASKHUB_CLEANUP_SWEEP_SECS")?
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(defaults.cleanup_sweep_interval),
            dispatch_scan_batch: parse_var::<u64>(&lookup, "TASKHUB_DISPATCH_SCAN_BATCH")?
                .map(|n| n.max(1))
                .unwrap_or(defaults.dispatch_scan_batch),
            quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.port, 8080);
        assert!(matches!(cfg.database, DatabaseLocation::Local(ref p) if p == &PathBuf::from("./data/taskhub.db")));
        assert_eq!(cfg.chunk_cleanup_delay, Duration::from_secs(60));
        assert_eq!(cfg.cleanup_sweep_interval, Duration::from_secs(10));
        assert_eq!(cfg.dispatch_scan_batch, 64);
        assert!(cfg.quota.is_none());
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("TASKHUB_PORT", "9000"),
            ("TASKHUB_DB_PATH", "/tmp/x.db"),
            ("TASKHUB_CHUNK_CLEANUP_DELAY_SECS", "5"),
            ("TASKHUB_DISPATCH_SCAN_BATCH", "0"),
            ("TASKHUB_QUOTA_URL", "http://quota:3000"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert!(matches!(cfg.database, DatabaseLocation::Local(ref p) if p == &PathBuf::from("/tmp/x.db")));
        assert_eq!(cfg.chunk_cleanup_delay, Duration::from_secs(5));
        assert_eq!(cfg.dispatch_scan_batch, 1);
        let quota = cfg.quota.unwrap();
        assert_eq!(quota.base_url, "http://quota:3000");
        assert!(quota.token.is_none());
    }

    #[test]
    fn test_remote_database_needs_token() {
        let err = config(&[("TASKHUB_DB_URL", "libsql://db.example")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));

        let cfg = config(&[
            ("TASKHUB_DB_URL", "libsql://db.example"),
            ("TASKHUB_DB_AUTH_TOKEN", "secret"),
            ("TASKHUB_DB_PATH", "/ignored.db"),
        ])
        .unwrap();
        match cfg.database {
            DatabaseLocation::Remote { url, auth_token } => {
                assert_eq!(url, "libsql://db.example");
                assert_eq!(auth_token.expose_secret(), "secret");
            }
            other => panic!("expected remote database, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_number() {
        let err = config(&[("TASKHUB_PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "TASKHUB_PORT"));
    }
}
