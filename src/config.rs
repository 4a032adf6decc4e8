use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::blockchain::recorder::DEFAULT_APPEND_RETRIES;

/// Highest accepted difficulty; each digit multiplies mining cost by 16
pub const MAX_DIFFICULTY: usize = 6;

/// Runtime configuration read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory of the sled database (`BALLOT_DATA_DIR`)
    pub data_dir: PathBuf,

    /// HTTP listen address (`BALLOT_BIND_ADDR`)
    pub bind_addr: SocketAddr,

    /// Leading zero hex digits required in block hashes (`BALLOT_DIFFICULTY`)
    pub difficulty: usize,

    /// Mining attempts per vote before a tip conflict is surfaced (`BALLOT_APPEND_RETRIES`)
    pub append_retries: usize,

    /// Optional JSON file with election and candidate names (`BALLOT_REGISTRY_FILE`)
    pub registry_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("data/ledger"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            difficulty: 2,
            append_retries: DEFAULT_APPEND_RETRIES,
            registry_file: None,
        }
    }
}

impl Config {
    /// Reads the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let config = Config {
            data_dir: lookup("BALLOT_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            bind_addr: parse_or(&lookup, "BALLOT_BIND_ADDR", defaults.bind_addr)?,
            difficulty: parse_or(&lookup, "BALLOT_DIFFICULTY", defaults.difficulty)?,
            append_retries: parse_or(&lookup, "BALLOT_APPEND_RETRIES", defaults.append_retries)?,
            registry_file: lookup("BALLOT_REGISTRY_FILE").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.difficulty > MAX_DIFFICULTY {
            bail!(
                "BALLOT_DIFFICULTY {} is too high, at most {} is allowed",
                self.difficulty,
                MAX_DIFFICULTY
            );
        }

        if self.append_retries == 0 {
            bail!("BALLOT_APPEND_RETRIES must be at least 1");
        }

        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value {:?} for {}", raw, key)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(config_from(&[]).unwrap(), Config::default());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("BALLOT_DATA_DIR", "/tmp/ledger"),
            ("BALLOT_BIND_ADDR", "0.0.0.0:9000"),
            ("BALLOT_DIFFICULTY", "3"),
            ("BALLOT_APPEND_RETRIES", "9"),
            ("BALLOT_REGISTRY_FILE", "registry.json"),
        ])
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/ledger"));
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.difficulty, 3);
        assert_eq!(config.append_retries, 9);
        assert_eq!(config.registry_file, Some(PathBuf::from("registry.json")));
    }

    #[test]
    fn test_rejects_pathological_difficulty() {
        assert!(config_from(&[("BALLOT_DIFFICULTY", "12")]).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(config_from(&[("BALLOT_DIFFICULTY", "two")]).is_err());
        assert!(config_from(&[("BALLOT_BIND_ADDR", "localhost")]).is_err());
        assert!(config_from(&[("BALLOT_APPEND_RETRIES", "0")]).is_err());
    }
}
