// src/lib.rs

pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod graph;
pub mod logging;
pub mod recovery;
pub mod reference;
pub mod sched;
pub mod task;
pub mod types;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::clock::system_clock;
use crate::config::loader::load_or_default;
use crate::config::model::ConfigFile;
use crate::engine::{CoreMaster, MasterEvent, MasterHandle, Runtime};
use crate::exec::{BlockStore, HandlerRegistry, LocalBackend, spawn_heartbeats};
use crate::recovery::recover_all;
use crate::task::TaskDescriptor;
use crate::types::PlacementPolicyKind;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - journal recovery
/// - core master / runtime
/// - the in-process worker backend and its heartbeats
/// - an optional one-shot job submission
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_config(&config_path)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let mut core = CoreMaster::new(cfg.master.clone(), system_clock());
    if args.recover {
        recover_jobs(&mut core, &cfg)?;
    }

    // Master event channel. The handle keeps the sender side alive.
    let (tx, rx) = mpsc::channel::<MasterEvent>(256);
    let handle = MasterHandle::new(tx.clone());

    let backend = LocalBackend::new(
        HandlerRegistry::with_builtins(),
        BlockStore::new(),
        handle.clone(),
        cfg.local_blob_inline_limit,
    );
    let runtime = Runtime::new(core, rx, &tx, backend);
    drop(tx);

    if cfg.workers.is_empty() {
        warn!("no [[worker]] configured; tasks will wait for workers to register");
    }
    let beat = (cfg.master.heartbeat_timeout / 3).max(Duration::from_millis(100));
    let _heartbeats = spawn_heartbeats(handle.clone(), cfg.workers.clone(), beat);

    // Ctrl-C → graceful shutdown.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = handle.shutdown().await;
        });
    }

    let submission = args.submit.clone().map(|path| {
        let handle = handle.clone();
        let timeout = Duration::from_secs(args.timeout);
        let policy = args.policy;
        tokio::spawn(async move {
            let outcome = submit_and_wait(&handle, &path, policy, timeout).await;
            let _ = handle.shutdown().await;
            outcome
        })
    });

    runtime.run().await?;

    if let Some(submission) = submission {
        submission
            .await
            .context("submission task panicked")??;
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<ConfigFile> {
    load_or_default(path).with_context(|| format!("loading config {}", path.display()))
}

fn recover_jobs(core: &mut CoreMaster, cfg: &ConfigFile) -> Result<()> {
    let Some(dir) = cfg.master.journal_dir.as_deref() else {
        bail!("--recover needs [master].journal_dir to be set");
    };

    let journals = recover_all(dir)
        .with_context(|| format!("reading journals under {}", dir.display()))?;
    let total = journals.len();
    let mut restored = 0usize;
    for (job, records) in journals {
        match core.restore_job(job.clone(), records) {
            Ok(_step) => restored += 1,
            Err(e) => warn!(%job, error = %e, "skipping unrecoverable journal"),
        }
    }
    info!(restored, total, "journal recovery finished");
    Ok(())
}

async fn submit_and_wait(
    handle: &MasterHandle,
    path: &Path,
    policy: Option<PlacementPolicyKind>,
    timeout: Duration,
) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading task descriptor {}", path.display()))?;
    let root: TaskDescriptor = serde_json::from_str(&text)
        .with_context(|| format!("parsing task descriptor {}", path.display()))?;

    let job = handle.submit_job(root, policy).await?;
    info!(%job, "job submitted");

    let Some(result) = handle.wait_result(job.clone(), timeout).await? else {
        bail!("job {job} did not finish within {}s", timeout.as_secs());
    };

    let status = handle.job_status(job).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    debug!(%result, "job result");
    if result.is_error() {
        return Err(anyhow!("job failed: {result}"));
    }
    Ok(())
}

/// Simple dry-run output: print the validated settings and workers.
fn print_dry_run(cfg: &ConfigFile) {
    let m = &cfg.master;
    println!("taskweave dry-run");
    println!("  master.max_worker_failures = {}", m.max_worker_failures);
    println!("  master.heartbeat_timeout = {:?}", m.heartbeat_timeout);
    println!(
        "  master.heartbeat_check_interval = {:?}",
        m.heartbeat_check_interval
    );
    println!("  master.default_policy = {}", m.default_policy);
    if let Some(ref dir) = m.journal_dir {
        println!("  master.journal_dir = {}", dir.display());
    }
    if let Some(seed) = m.rng_seed {
        println!("  master.rng_seed = {seed}");
    }
    println!("  master.local_blob_inline_limit = {}", cfg.local_blob_inline_limit);
    println!("  locality = {:?}", m.locality);
    println!("  lottery = {:?}", m.lottery);
    println!();

    println!("workers ({}):", cfg.workers.len());
    for worker in &cfg.workers {
        println!("  - {} @ {}", worker.id, worker.location);
        if !worker.handlers.is_empty() {
            println!("      handlers: {:?}", worker.handlers);
        }
        println!("      capacity: {:?}", worker.capacity);
    }

    debug!("dry-run complete (master not started)");
}
