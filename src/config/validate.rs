// src/config/validate.rs

use std::collections::HashSet;
use std::time::Duration;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::engine::MasterSettings;
use crate::errors::{Result, TaskweaveError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::TaskweaveError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        let master = to_master_settings(&raw)?;
        Ok(ConfigFile::new_unchecked(
            master,
            raw.master.local_blob_inline_limit,
            raw.workers,
        ))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_master(cfg)?;
    validate_locality(cfg)?;
    validate_lottery(cfg)?;
    validate_workers(cfg)?;
    Ok(())
}

fn config_error(msg: impl Into<String>) -> TaskweaveError {
    TaskweaveError::ConfigError(msg.into())
}

fn in_unit_interval(x: f64) -> bool {
    x > 0.0 && x <= 1.0
}

fn positive(x: f64) -> bool {
    x > 0.0
}

fn validate_master(cfg: &RawConfigFile) -> Result<()> {
    if cfg.master.max_worker_failures == 0 {
        return Err(config_error(
            "[master].max_worker_failures must be >= 1 (got 0)",
        ));
    }

    let timeout = parse_duration(&cfg.master.heartbeat_timeout)
        .map_err(|e| config_error(format!("[master].heartbeat_timeout: {e}")))?;
    let interval = parse_duration(&cfg.master.heartbeat_check_interval)
        .map_err(|e| config_error(format!("[master].heartbeat_check_interval: {e}")))?;

    if timeout.is_zero() || interval.is_zero() {
        return Err(config_error(
            "[master] heartbeat durations must be greater than zero",
        ));
    }
    Ok(())
}

fn validate_locality(cfg: &RawConfigFile) -> Result<()> {
    let l = &cfg.locality;
    if !in_unit_interval(l.margin) {
        return Err(config_error(format!(
            "[locality].margin must be in (0, 1] (got {})",
            l.margin
        )));
    }
    if !positive(l.sweetheart_factor) {
        return Err(config_error(format!(
            "[locality].sweetheart_factor must be positive (got {})",
            l.sweetheart_factor
        )));
    }
    Ok(())
}

fn validate_lottery(cfg: &RawConfigFile) -> Result<()> {
    let l = &cfg.lottery;
    if !in_unit_interval(l.ewma_alpha) {
        return Err(config_error(format!(
            "[lottery].ewma_alpha must be in (0, 1] (got {})",
            l.ewma_alpha
        )));
    }
    if !positive(l.ticket_budget) {
        return Err(config_error(format!(
            "[lottery].ticket_budget must be positive (got {})",
            l.ticket_budget
        )));
    }
    Ok(())
}

fn validate_workers(cfg: &RawConfigFile) -> Result<()> {
    let mut seen = HashSet::new();
    for worker in &cfg.workers {
        if worker.id.as_str().trim().is_empty() {
            return Err(config_error("[[worker]] id must not be empty"));
        }
        if !seen.insert(&worker.id) {
            return Err(config_error(format!(
                "worker '{}' is defined more than once",
                worker.id
            )));
        }
        if worker.capacity.values().sum::<usize>() == 0 {
            return Err(config_error(format!(
                "worker '{}' has no capacity in any scheduling class",
                worker.id
            )));
        }
    }
    Ok(())
}

fn to_master_settings(cfg: &RawConfigFile) -> Result<MasterSettings> {
    let m = &cfg.master;
    Ok(MasterSettings {
        max_worker_failures: m.max_worker_failures,
        heartbeat_timeout: parse_duration(&m.heartbeat_timeout).map_err(config_error)?,
        heartbeat_check_interval: parse_duration(&m.heartbeat_check_interval)
            .map_err(config_error)?,
        default_policy: m.default_policy,
        journal_dir: m.journal_dir.clone(),
        rng_seed: m.rng_seed,
        locality: cfg.locality,
        lottery: cfg.lottery,
    })
}

/// Parse `<n><unit>` with unit `ms`, `s`, `m` or `h` (e.g. `"250ms"`, `"30s"`).
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' has no unit (use ms, s, m or h)"))?;
    let (digits, unit) = s.split_at(split);

    let n: u64 = digits
        .parse()
        .map_err(|_| format!("duration '{s}' does not start with a number"))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => Err(format!("duration '{s}' has unknown unit '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration(" 2m "), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    }

    #[test]
    fn bad_durations_are_rejected() {
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn empty_config_gets_defaults() {
        let cfg = ConfigFile::try_from(RawConfigFile::default()).unwrap();
        assert_eq!(cfg.master.max_worker_failures, 3);
        assert_eq!(cfg.master.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(cfg.local_blob_inline_limit, 1024);
        assert!(cfg.workers.is_empty());
    }

    #[test]
    fn zero_failures_is_rejected() {
        let mut raw = RawConfigFile::default();
        raw.master.max_worker_failures = 0;
        let err = ConfigFile::try_from(raw).unwrap_err();
        assert!(matches!(err, TaskweaveError::ConfigError(_)));
    }
}
