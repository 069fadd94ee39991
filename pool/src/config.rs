use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("start_diff must not be negative (got {0})")]
    NegativeStartDiff(f64),
    #[error("mindiff must not be negative (got {0})")]
    NegativeMinDiff(f64),
    #[error("maxdiff {maxdiff} is below mindiff {mindiff}")]
    MaxBelowMin { maxdiff: f64, mindiff: f64 },
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PoolConfig {
    /// Difficulty assigned to a fresh session with no worker history.
    pub start_diff: f64,
    /// Pool-wide difficulty floor. May be fractional for sub-1 H/s devices.
    pub mindiff: f64,
    /// Pool-wide difficulty ceiling; 0 disables it.
    pub maxdiff: f64,
    /// Seconds of share silence before a session is marked dropped;
    /// 0 disables idle dropping.
    pub dropidle: f64,
    /// Consecutive rejected shares before the watchdog drops the session.
    pub reject_threshold: u32,
    /// First auth back-off step in seconds; doubles per failure.
    pub auth_backoff_start: f64,
    /// Saturation cap for auth back-off doubling.
    pub auth_backoff_cap: f64,
    /// Seconds a retired workbase stays resolvable for late shares.
    pub workbase_grace: f64,
    /// Bytes of extranonce2 the client controls.
    pub enonce2_size: usize,
    /// Version-rolling mask offered to mining.configure.
    pub version_mask: u32,
    /// Useragent prefix whitelist; empty allows everyone.
    pub ua_whitelist: Vec<String>,
    /// Seconds between stats snapshots.
    pub stats_interval: f64,
    /// Submit worker shards; per-client ordering is preserved by routing
    /// client ids to a fixed shard.
    pub worker_shards: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            start_diff: 42.0,
            mindiff: 1.0,
            maxdiff: 0.0,
            dropidle: 3600.0,
            reject_threshold: 50,
            auth_backoff_start: 5.0,
            auth_backoff_cap: 300.0,
            workbase_grace: 120.0,
            enonce2_size: 8,
            version_mask: 0x1fffe000,
            ua_whitelist: Vec::new(),
            stats_interval: 60.0,
            worker_shards: 4,
        }
    }
}

impl PoolConfig {
    /// Defaults, then `LODE_*` env overrides, then an optional JSON file.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("LODE_START_DIFF") {
            if let Ok(n) = v.parse::<f64>() {
                cfg.start_diff = n;
            }
        }
        if let Ok(v) = std::env::var("LODE_MINDIFF") {
            if let Ok(n) = v.parse::<f64>() {
                cfg.mindiff = n;
            }
        }
        if let Ok(v) = std::env::var("LODE_MAXDIFF") {
            if let Ok(n) = v.parse::<f64>() {
                cfg.maxdiff = n;
            }
        }
        if let Ok(v) = std::env::var("LODE_DROPIDLE") {
            if let Ok(n) = v.parse::<f64>() {
                cfg.dropidle = n;
            }
        }
        if let Ok(v) = std::env::var("LODE_UA_WHITELIST") {
            cfg.ua_whitelist = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(path) = path {
            let txt = std::fs::read_to_string(path)?;
            cfg = serde_json::from_str(&txt)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Init-time invariants. These are the only fatal configuration
    /// errors; everything else is clamped with a warning.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.start_diff < 0.0 {
            return Err(ConfigError::NegativeStartDiff(self.start_diff));
        }
        if self.mindiff < 0.0 {
            return Err(ConfigError::NegativeMinDiff(self.mindiff));
        }
        if self.maxdiff > 0.0 && self.maxdiff < self.mindiff {
            return Err(ConfigError::MaxBelowMin {
                maxdiff: self.maxdiff,
                mindiff: self.mindiff,
            });
        }
        if self.start_diff > 0.0 && self.start_diff < self.mindiff {
            tracing::warn!(
                "start_diff {} below mindiff {}, clamping",
                self.start_diff,
                self.mindiff
            );
            self.start_diff = self.mindiff;
        }
        if self.worker_shards == 0 {
            tracing::warn!("worker_shards 0 is not runnable, clamping to 1");
            self.worker_shards = 1;
        }
        if self.enonce2_size == 0 || self.enonce2_size > 16 {
            tracing::warn!("enonce2_size {} out of range, using 8", self.enonce2_size);
            self.enonce2_size = 8;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = PoolConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn negative_start_diff_is_fatal() {
        let mut cfg = PoolConfig {
            start_diff: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NegativeStartDiff(_))
        ));
    }

    #[test]
    fn negative_mindiff_is_fatal() {
        let mut cfg = PoolConfig {
            mindiff: -0.5,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::NegativeMinDiff(_))));
    }

    #[test]
    fn maxdiff_below_mindiff_is_fatal() {
        let mut cfg = PoolConfig {
            mindiff: 10.0,
            maxdiff: 5.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn start_diff_clamps_to_mindiff() {
        let mut cfg = PoolConfig {
            start_diff: 0.5,
            mindiff: 2.0,
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.start_diff, 2.0);
    }

    #[test]
    fn fractional_mindiff_is_allowed() {
        let mut cfg = PoolConfig {
            mindiff: 0.00001,
            start_diff: 0.00001,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
