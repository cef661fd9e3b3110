// tests/config_loading.rs

use std::error::Error;
use std::fs;
use std::time::Duration;

use taskweave::config::{ConfigFile, load_and_validate, load_from_path, load_or_default, parse_raw};
use taskweave::errors::TaskweaveError;
use taskweave::reference::WorkerId;
use taskweave::types::PlacementPolicyKind;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn Error>>;

fn write_config(contents: &str) -> Result<(TempDir, std::path::PathBuf), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Taskweave.toml");
    fs::write(&path, contents)?;
    Ok((dir, path))
}

#[test]
fn full_config_is_loaded_and_converted() -> TestResult {
    let (_dir, path) = write_config(
        r#"
[master]
max_worker_failures = 5
heartbeat_timeout = "10s"
heartbeat_check_interval = "500ms"
default_policy = "two_random"
journal_dir = "/var/lib/taskweave"
rng_seed = 42
local_blob_inline_limit = 64

[locality]
margin = 0.5
sweetheart_factor = 10.0

[lottery]
ewma_alpha = 0.5

[[worker]]
id = "w1"
location = "127.0.0.1:9001"
handlers = ["const", "concat"]
capacity = { default = 2, gpu = 1 }

[[worker]]
id = "w2"
location = "127.0.0.1:9002"
"#,
    )?;

    let cfg = load_and_validate(&path)?;
    let m = &cfg.master;
    assert_eq!(m.max_worker_failures, 5);
    assert_eq!(m.heartbeat_timeout, Duration::from_secs(10));
    assert_eq!(m.heartbeat_check_interval, Duration::from_millis(500));
    assert_eq!(m.default_policy, PlacementPolicyKind::TwoRandom);
    assert_eq!(m.rng_seed, Some(42));
    assert!(m.journal_dir.is_some());
    assert_eq!(m.locality.margin, 0.5);
    assert_eq!(m.locality.sweetheart_factor, 10.0);
    // Unset fields keep their defaults.
    assert_eq!(m.locality.min_saving_threshold, 1_048_576);
    assert_eq!(m.lottery.ewma_alpha, 0.5);
    assert_eq!(cfg.local_blob_inline_limit, 64);

    assert_eq!(cfg.workers.len(), 2);
    let w1 = &cfg.workers[0];
    assert_eq!(w1.id, WorkerId::new("w1"));
    assert!(w1.handlers.contains("concat"));
    assert_eq!(w1.capacity.get("gpu"), Some(&1));
    let w2 = &cfg.workers[1];
    assert!(w2.handlers.is_empty());
    assert_eq!(w2.capacity.get("default"), Some(&1));
    Ok(())
}

#[test]
fn empty_file_is_all_defaults() -> TestResult {
    let (_dir, path) = write_config("")?;
    let cfg = load_and_validate(&path)?;
    assert_eq!(cfg.master.max_worker_failures, 3);
    assert_eq!(cfg.master.default_policy, PlacementPolicyKind::Locality);
    assert!(cfg.master.journal_dir.is_none());
    assert!(cfg.workers.is_empty());
    Ok(())
}

#[test]
fn unknown_keys_are_a_toml_error() -> TestResult {
    let (_dir, path) = write_config("[master]\nmax_retries = 3\n")?;
    let err = load_from_path(&path).unwrap_err();
    assert!(matches!(err, TaskweaveError::TomlError(_)), "got {err:?}");
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let err = load_and_validate(dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, TaskweaveError::IoError(_)), "got {err:?}");
    Ok(())
}

#[test]
fn semantic_errors_are_config_errors() -> TestResult {
    let cases = [
        "[master]\nheartbeat_timeout = \"soon\"\n",
        "[master]\nheartbeat_check_interval = \"0s\"\n",
        "[locality]\nmargin = 1.5\n",
        "[lottery]\nticket_budget = 0.0\n",
        "[[worker]]\nid = \"w1\"\nlocation = \"a\"\n[[worker]]\nid = \"w1\"\nlocation = \"b\"\n",
        "[[worker]]\nid = \"w1\"\nlocation = \"a\"\ncapacity = { default = 0 }\n",
    ];

    for contents in cases {
        let (_dir, path) = write_config(contents)?;
        let err = load_and_validate(&path).unwrap_err();
        assert!(
            matches!(err, TaskweaveError::ConfigError(_)),
            "{contents:?} gave {err:?}"
        );
    }
    Ok(())
}

#[test]
fn explicit_missing_path_is_not_defaulted() -> TestResult {
    let dir = tempfile::tempdir()?;
    let err = load_or_default(&dir.path().join("Taskweave.toml")).unwrap_err();
    assert!(matches!(err, TaskweaveError::IoError(_)), "got {err:?}");
    Ok(())
}

#[test]
fn raw_text_converts_like_a_file() -> TestResult {
    let raw = parse_raw("[master]\ndefault_policy = \"weighted\"\n")?;
    let cfg = ConfigFile::try_from(raw)?;
    assert_eq!(cfg.master.default_policy, PlacementPolicyKind::Weighted);
    assert_eq!(cfg.master.heartbeat_timeout, Duration::from_secs(30));
    Ok(())
}
