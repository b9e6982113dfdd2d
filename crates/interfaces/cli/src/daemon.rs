//! Process supervision: pidfile + advisory lock background daemon, and the
//! foreground runner both the daemon process and `aigent run` share.
//!
//! There is no dashboard/socket RPC surface in this workspace (out of scope
//! per spec.md §1) — a background instance is supervised purely through a
//! pidfile and an `fs2` exclusive lock, and "live" introspection commands
//! (`aigent status`, `aigent budget show`, ...) work by reading the State
//! Store / Budget Tracker / Blob Log files directly off disk rather than
//! talking to the running process over IPC.

use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use fs2::FileExt;

use aigent_agent::CoreLoop;
use aigent_config::AppConfig;
use aigent_selfupdate::SelfUpdateManager;

pub(crate) const DAEMON_PROCESS_ENV: &str = "AIGENT_DAEMON_PROCESS";

#[derive(Debug, Clone)]
pub(crate) struct DaemonPaths {
    pub(crate) runtime_dir: PathBuf,
    pub(crate) pid_file: PathBuf,
    pub(crate) log_file: PathBuf,
    pub(crate) lock_file: PathBuf,
}

pub(crate) fn daemon_paths(config: &AppConfig) -> DaemonPaths {
    let runtime_dir = PathBuf::from(&config.agent.data_dir).join("runtime");
    DaemonPaths {
        pid_file: runtime_dir.join("daemon.pid"),
        log_file: runtime_dir.join("daemon.log"),
        lock_file: runtime_dir.join("daemon.lock"),
        runtime_dir,
    }
}

pub(crate) fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<u32>().ok())
}

pub(crate) fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub(crate) fn terminate_pid(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let status = Command::new("kill").arg(pid.to_string()).status()?;
        if !status.success() {
            bail!("failed to signal daemon pid {pid}");
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("daemon stop is only implemented on unix in this build")
    }
}

pub(crate) fn wait_for_pid_exit(pid: u32, timeout: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::from_millis(0);
    while waited < timeout {
        if !is_pid_running(pid) {
            return;
        }
        std::thread::sleep(step);
        waited += step;
    }
}

/// `aigent daemon start` — re-exec ourselves in the background with
/// `AIGENT_DAEMON_PROCESS=1` set, matching the style of a conventional
/// double-fork-free unix daemon: one long-lived child, stdout/stderr
/// redirected to a log file, pid recorded for `stop`/`status`.
pub(crate) fn daemon_start(config_path: &Path, force: bool) -> Result<()> {
    let config = AppConfig::load_from(config_path)?;
    let paths = daemon_paths(&config);
    fs::create_dir_all(&paths.runtime_dir)?;

    if let Some(pid) = read_pid(&paths.pid_file)? {
        if is_pid_running(pid) {
            if !force {
                bail!(
                    "daemon already running with pid {pid}; use `aigent daemon restart` or `--force`"
                );
            }
            terminate_pid(pid)?;
            wait_for_pid_exit(pid, Duration::from_secs(4));
        }
        let _ = fs::remove_file(&paths.pid_file);
    }
    if force {
        let _ = fs::remove_file(&paths.lock_file);
    }

    let exe = std::env::current_exe()?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)
        .with_context(|| format!("opening daemon log at {}", paths.log_file.display()))?;
    let err = log.try_clone()?;

    let mut child = Command::new(exe)
        .arg("--config")
        .arg(config_path)
        .arg("run")
        .env(DAEMON_PROCESS_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err))
        .spawn()
        .context("spawning background daemon process")?;

    // Give the child a moment to either crash immediately or settle in.
    for _ in 0..20 {
        if let Some(status) = child.try_wait()? {
            bail!("daemon exited during startup with status {status}; check {}", paths.log_file.display());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    fs::write(&paths.pid_file, child.id().to_string())?;
    println!("daemon started");
    println!("- pid: {}", child.id());
    println!("- data dir: {}", config.agent.data_dir);
    println!("- log: {}", paths.log_file.display());
    Ok(())
}

pub(crate) fn daemon_stop(config_path: &Path) -> Result<()> {
    let config = AppConfig::load_from(config_path)?;
    let paths = daemon_paths(&config);

    let Some(pid) = read_pid(&paths.pid_file)? else {
        println!("daemon is not running");
        return Ok(());
    };
    if !is_pid_running(pid) {
        let _ = fs::remove_file(&paths.pid_file);
        println!("daemon was not running (stale pid file cleaned)");
        return Ok(());
    }

    terminate_pid(pid)?;
    wait_for_pid_exit(pid, Duration::from_secs(4));
    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    println!("daemon stopped (pid {pid})");
    Ok(())
}

pub(crate) fn daemon_status(config_path: &Path) -> Result<()> {
    let config = AppConfig::load_from(config_path)?;
    let paths = daemon_paths(&config);

    match read_pid(&paths.pid_file)? {
        Some(pid) if is_pid_running(pid) => {
            println!("daemon status: running");
            println!("- pid: {pid}");
        }
        Some(pid) => {
            println!("daemon status: stopped (stale pid {pid})");
        }
        None => println!("daemon status: stopped"),
    }
    println!("- data dir: {}", config.agent.data_dir);
    println!("- log: {}", paths.log_file.display());
    Ok(())
}

/// Runs the core loop (and any configured listeners) until `Ctrl-C` or the
/// process is signalled to stop. Shared by both the interactive `aigent
/// run` and the background daemon process — the only difference is whether
/// a stdin REPL is also attached.
pub(crate) async fn run_foreground(config: AppConfig, config_path: &Path, interactive: bool) -> Result<()> {
    let is_daemon_child = std::env::var(DAEMON_PROCESS_ENV).ok().as_deref() == Some("1");
    let paths = daemon_paths(&config);
    fs::create_dir_all(&paths.runtime_dir)?;

    // Hold the advisory lock for the lifetime of the run so a second
    // `aigent run`/`aigent daemon start` against the same data dir fails
    // fast instead of corrupting state with two writers.
    let lock_file = File::create(&paths.lock_file)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("another aigent instance already holds the lock at {}", paths.lock_file.display()))?;
    if is_daemon_child {
        fs::write(&paths.pid_file, std::process::id().to_string())?;
    }

    // Boot protocol (§4.7, step 6): sync the shipped image into the backup,
    // restore backup -> live, revert to the previous commit if the last
    // boot never reached "healthy", then arm the revert flag again for
    // this boot.
    let self_update = SelfUpdateManager::new(
        config_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf(),
        &config.agent.data_dir,
        config.safety.self_update_allowlist.clone(),
    );
    let reverted = self_update.boot().await.context("self-update boot protocol")?;
    if reverted {
        tracing::warn!("self-update boot protocol reverted to the last known-good commit");
    }

    let (core, state, wake, shutdown, mut summaries) = CoreLoop::bootstrap(config.clone()).await?;
    let loop_handle = tokio::spawn(core.run());

    let mut listener_handles = Vec::new();
    for listener in crate::listeners::configured_listeners(&config) {
        listener_handles.push(tokio::spawn(aigent_listeners::run_listener(
            listener,
            state.clone(),
            wake.clone(),
            shutdown.clone(),
        )));
    }

    let summary_shutdown = shutdown.clone();
    let summary_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                summary = summaries.recv() => {
                    match summary {
                        Ok(summary) => tracing::info!(
                            iteration = summary.iteration,
                            actions = summary.actions_run,
                            violations = summary.violations,
                            "{}",
                            summary.status_message
                        ),
                        Err(_) => break,
                    }
                }
                _ = summary_shutdown.cancelled() => break,
            }
        }
    });

    // Health check, per §4.7 step 6: clear the revert flag once the process
    // has stayed up for the configured grace period.
    let health_shutdown = shutdown.clone();
    let grace = Duration::from_secs(config.self_update.health_check_grace_secs);
    let health_data_dir = config.agent.data_dir.clone();
    let health_allowlist = config.safety.self_update_allowlist.clone();
    let health_live_dir = config_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let health_task = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                let manager = SelfUpdateManager::new(health_live_dir, health_data_dir, health_allowlist);
                if let Err(err) = manager.mark_healthy() {
                    tracing::warn!(error = %err, "failed to clear self-update revert flag");
                }
            }
            _ = health_shutdown.cancelled() => {}
        }
    });

    let repl_handle = if interactive {
        Some(tokio::spawn(crate::interactive::run_repl(state.clone(), wake.clone(), shutdown.clone())))
    } else {
        None
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok::<(), anyhow::Error>(())
    };
    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c().await?;
        Ok::<(), anyhow::Error>(())
    };

    if let Some(repl) = repl_handle {
        tokio::select! {
            _ = terminate => {}
            _ = repl => {}
        }
    } else {
        terminate.await?;
    }

    shutdown.cancel();
    wake.notify_waiters();
    let _ = loop_handle.await;
    for handle in listener_handles {
        let _ = handle.await;
    }
    let _ = summary_task.await;
    let _ = health_task.await;

    if is_daemon_child {
        let _ = fs::remove_file(&paths.pid_file);
    }
    let _ = fs::remove_file(&paths.lock_file);
    Ok(())
}
