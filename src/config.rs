// ⚙️ Configuration - defaults → JSON file → TALLY_SYNC_* env → CLI flags
//
// No URLs or credentials are compiled in; everything that points at a server
// comes from one of these layers.

use crate::db::{Schema, Tenant};
use crate::import::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
use crate::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "TALLY_SYNC_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub db_path: PathBuf,

    /// Tally's HTTP endpoint, e.g. http://localhost:9000
    pub tally_url: Option<String>,

    /// Base URL of the JSON proxy in front of Tally
    pub proxy_url: Option<String>,

    /// Full URL of the tally-bulk-import edge function
    pub edge_function_url: Option<String>,

    pub api_key: Option<String>,

    /// Tally company to export from
    pub company_name: Option<String>,

    pub company_id: String,
    pub division_id: String,

    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,

    /// Namespace the local sink writes into
    pub schema: Schema,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            db_path: PathBuf::from("tally_sync.db"),
            tally_url: None,
            proxy_url: None,
            edge_function_url: None,
            api_key: None,
            company_name: None,
            company_id: String::new(),
            division_id: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: 1000,
            timeout_secs: 30,
            schema: Schema::Legacy,
        }
    }
}

impl SyncConfig {
    /// Defaults, then the JSON file (if given), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => SyncConfig::default(),
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `TALLY_SYNC_*` variables. Unknown names are ignored; a value
    /// that doesn't parse is an error.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let set = || Some(value.clone()).filter(|v| !v.trim().is_empty());

            match name {
                "DB_PATH" => self.db_path = PathBuf::from(&value),
                "TALLY_URL" => self.tally_url = set(),
                "PROXY_URL" => self.proxy_url = set(),
                "EDGE_FUNCTION_URL" => self.edge_function_url = set(),
                "API_KEY" => self.api_key = set(),
                "COMPANY_NAME" => self.company_name = set(),
                "COMPANY_ID" => self.company_id = value.trim().to_string(),
                "DIVISION_ID" => self.division_id = value.trim().to_string(),
                "BATCH_SIZE" => self.batch_size = parse_env(&key, &value)?,
                "MAX_ATTEMPTS" => self.max_attempts = parse_env(&key, &value)?,
                "RETRY_DELAY_MS" => self.retry_delay_ms = parse_env(&key, &value)?,
                "TIMEOUT_SECS" => self.timeout_secs = parse_env(&key, &value)?,
                "SCHEMA" => {
                    self.schema = value
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!("{}: {}", key, e))?
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.company_id.trim().is_empty() || self.division_id.trim().is_empty() {
            bail!("company_id and division_id are required (set {}COMPANY_ID / {}DIVISION_ID or pass --company-id / --division-id)", ENV_PREFIX, ENV_PREFIX);
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            bail!("batch_size must be between 1 and {}, got {}", MAX_BATCH_SIZE, self.batch_size);
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.company_id.trim(), self.division_id.trim())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .ok()
        .with_context(|| format!("{} has an invalid value: {:?}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SyncConfig::default();
        config
            .apply_env(vars(&[
                ("TALLY_SYNC_COMPANY_ID", "c-1"),
                ("TALLY_SYNC_DIVISION_ID", " d-1 "),
                ("TALLY_SYNC_BATCH_SIZE", "250"),
                ("TALLY_SYNC_TALLY_URL", "http://tally:9000"),
                ("TALLY_SYNC_SCHEMA", "vt"),
                ("TALLY_SYNC_PROXY_URL", ""),
                ("HOME", "/root"),
            ]))
            .unwrap();

        assert_eq!(config.tenant(), Tenant::new("c-1", "d-1"));
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.tally_url.as_deref(), Some("http://tally:9000"));
        assert_eq!(config.proxy_url, None);
        assert_eq!(config.schema, Schema::Vt);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = SyncConfig::default();
        let err = config
            .apply_env(vars(&[("TALLY_SYNC_MAX_ATTEMPTS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("TALLY_SYNC_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_validate_batch_bounds() {
        let mut config = SyncConfig {
            company_id: "c".to_string(),
            division_id: "d".to_string(),
            ..SyncConfig::default()
        };
        config.batch_size = 0;
        assert!(config.validate().is_err());
        config.batch_size = 5001;
        assert!(config.validate().is_err());
        config.batch_size = 5000;
        config.validate().unwrap();
        config.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(&path, r#"{"company_id": "c-9", "division_id": "d-9", "retry_delay_ms": 10}"#).unwrap();

        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.company_id, "c-9");
        assert_eq!(config.retry_policy().delay_for(2), Duration::from_millis(20));
        assert_eq!(config.batch_size, 500);
    }
}
