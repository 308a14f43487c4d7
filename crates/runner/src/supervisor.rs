use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    collections::{HashMap, HashSet},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
    sync::{mpsc, watch},
};
use uuid::Uuid;

use crate::{
    config::SupervisorConfig,
    error::SupervisorError,
    log_buffer::{render_log_path, LogBuffer},
    ports::allocate_port,
};

/// A ready worker as handed to the proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    pub username: String,
    pub pid: u32,
    pub port: u16,
    /// Sent by the proxy on every request so the worker can tell us apart
    /// from other local users probing its port.
    pub secret: String,
}

#[derive(Clone, Debug)]
enum StartState {
    Pending,
    Ready(WorkerInfo),
    Failed,
}

enum Phase {
    Starting(watch::Receiver<StartState>),
    Ready(WorkerInfo),
    Stopping,
}

struct Entry {
    /// Tells a replacement apart from the entry an exit watcher was created for.
    instance: Uuid,
    port: u16,
    pid: Option<u32>,
    phase: Phase,
}

#[derive(Debug)]
pub enum StartOutcome {
    Started(WorkerInfo),
    Existing(WorkerInfo),
}

struct Inner {
    config: SupervisorConfig,
    workers: Mutex<HashMap<String, Entry>>,
    logs: Mutex<HashMap<String, Arc<Mutex<LogBuffer>>>>,
}

/// Owns the username to worker process mapping. At most one entry exists
/// per username; it is registered before the slow spawn so concurrent first
/// requests wait on the same start instead of racing.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn forward_lines<R>(stream: Option<R>, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else {
        return;
    };
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if lines.send(line).is_err() {
                break;
            }
        }
    });
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                workers: Mutex::new(HashMap::new()),
                logs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Returns the user's live worker, starting one when there is none.
    #[tracing::instrument(skip(self), err)]
    pub async fn ensure_worker(&self, username: &str) -> Result<WorkerInfo, SupervisorError> {
        enum Next {
            Wait(watch::Receiver<StartState>),
            Spawn(Uuid, u16, watch::Sender<StartState>),
        }

        let next = {
            let mut workers = lock(&self.inner.workers);
            match workers.get(username).map(|entry| &entry.phase) {
                Some(Phase::Ready(info)) => return Ok(info.clone()),
                Some(Phase::Starting(ready)) => Next::Wait(ready.clone()),
                Some(Phase::Stopping) | None => {
                    let in_use: HashSet<u16> = workers.values().map(|entry| entry.port).collect();
                    let port = allocate_port(self.inner.config.ports.clone(), &in_use)
                        .ok_or(SupervisorError::NoPorts)?;
                    let (ready_tx, ready_rx) = watch::channel(StartState::Pending);
                    let instance = Uuid::new_v4();
                    workers.insert(
                        username.to_string(),
                        Entry {
                            instance,
                            port,
                            pid: None,
                            phase: Phase::Starting(ready_rx),
                        },
                    );
                    Next::Spawn(instance, port, ready_tx)
                }
            }
        };

        match next {
            Next::Wait(ready) => Self::wait_ready(username, ready).await,
            Next::Spawn(instance, port, ready_tx) => {
                // Detached together with the sender so dropping this request
                // neither strands the entry nor fails the callers waiting on it.
                let supervisor = self.clone();
                let name = username.to_string();
                let launched = tokio::spawn(async move {
                    let result = supervisor.launch(&name, instance, port).await;
                    ready_tx.send_replace(match &result {
                        Ok(info) => StartState::Ready(info.clone()),
                        Err(_) => StartState::Failed,
                    });
                    result
                });
                match launched.await {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::error!("{err:?}");
                        self.forget(username, instance);
                        Err(SupervisorError::StartFailed {
                            username: username.to_string(),
                        })
                    }
                }
            }
        }
    }

    async fn wait_ready(
        username: &str,
        mut ready: watch::Receiver<StartState>,
    ) -> Result<WorkerInfo, SupervisorError> {
        loop {
            let state = ready.borrow_and_update().clone();
            match state {
                StartState::Ready(info) => return Ok(info),
                StartState::Failed => break,
                StartState::Pending => {}
            }
            if ready.changed().await.is_err() {
                break;
            }
        }
        Err(SupervisorError::StartFailed {
            username: username.to_string(),
        })
    }

    fn command(&self, username: &str, port: u16, secret: &str) -> Command {
        let config = &self.inner.config;
        let mut command = if config.use_sudo {
            let mut sudo = Command::new("sudo");
            sudo.arg("-u")
                .arg(username)
                .arg(format!("--preserve-env={}", config.secret_env_var))
                .arg(&config.process_command);
            sudo
        } else {
            Command::new(&config.process_command)
        };
        command
            .args(config.args_for(username, port))
            .env(&config.secret_env_var, secret)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn open_log_file(&self, username: &str, pid: u32) -> Option<File> {
        let template = self.inner.config.log_file_template.as_deref()?;
        let path = render_log_path(template, username, pid, &chrono::Local::now());
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                tracing::info!("Writing output of process {pid} to {path}");
                Some(file)
            }
            Err(err) => {
                tracing::warn!("Unable to open log file {path}: {err}");
                None
            }
        }
    }

    /// Spawns the worker, wires its output and waits out the start delay.
    async fn launch(
        &self,
        username: &str,
        instance: Uuid,
        port: u16,
    ) -> Result<WorkerInfo, SupervisorError> {
        let start_failed = || SupervisorError::StartFailed {
            username: username.to_string(),
        };
        let secret = Uuid::new_v4().simple().to_string();
        let mut child = match self.command(username, port, &secret).spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!("Unable to spawn {}: {err}", self.inner.config.process_command);
                self.forget(username, instance);
                return Err(start_failed());
            }
        };
        let Some(pid) = child.id() else {
            self.forget(username, instance);
            return Err(start_failed());
        };
        if let Some(entry) = lock(&self.inner.workers)
            .get_mut(username)
            .filter(|entry| entry.instance == instance)
        {
            entry.pid = Some(pid);
        }

        let buffer = Arc::new(Mutex::new(LogBuffer::new(self.inner.config.log_lines)));
        lock(&self.inner.logs).insert(username.to_string(), buffer.clone());
        let mut log_file = self.open_log_file(username, pid).await;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        forward_lines(child.stdout.take(), line_tx.clone());
        forward_lines(child.stderr.take(), line_tx);
        let name = username.to_string();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                tracing::debug!(username = %name, pid, "{line}");
                if let Some(file) = log_file.as_mut() {
                    if let Err(err) = file.write_all(format!("{line}\n").as_bytes()).await {
                        tracing::warn!("Dropping log file for process {pid}: {err}");
                        log_file = None;
                    }
                }
                lock(&buffer).push(line);
            }
            if let Some(mut file) = log_file {
                if let Err(err) = file.flush().await {
                    tracing::warn!("{err:?}");
                }
            }
        });

        // The only path that reclaims workers that die on their own.
        let (exit_tx, mut exit_rx) = watch::channel(false);
        let supervisor = self.clone();
        let name = username.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!("Process {pid} for user {name} exited with {status}"),
                Err(err) => tracing::error!("{err:?}"),
            }
            supervisor.forget(&name, instance);
            exit_tx.send_replace(true);
        });

        let exited_early = tokio::time::timeout(
            self.inner.config.start_delay,
            exit_rx.wait_for(|exited| *exited),
        )
        .await
        .is_ok();
        if exited_early {
            tracing::warn!("Process {pid} for user {username} exited during startup");
            self.forget(username, instance);
            return Err(start_failed());
        }

        let info = WorkerInfo {
            username: username.to_string(),
            pid,
            port,
            secret,
        };
        let mut workers = lock(&self.inner.workers);
        match workers.get_mut(username) {
            Some(entry) if entry.instance == instance && matches!(entry.phase, Phase::Starting(_)) => {
                entry.phase = Phase::Ready(info.clone());
                tracing::info!("Started process with PID {pid} for user {username} on port {port}");
                Ok(info)
            }
            // Stopped while it was starting.
            _ => Err(start_failed()),
        }
    }

    /// Removes the entry, but only the one created for `instance`.
    fn forget(&self, username: &str, instance: Uuid) {
        let mut workers = lock(&self.inner.workers);
        if workers
            .get(username)
            .is_some_and(|entry| entry.instance == instance)
        {
            workers.remove(username);
        }
    }

    async fn kill(&self, username: &str, pid: u32) -> Result<(), SupervisorError> {
        let config = &self.inner.config;
        let Some(kill_command) = &config.kill_command else {
            return signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|err| {
                SupervisorError::KillFailed {
                    detail: format!("SIGTERM to {pid}: {err}"),
                }
            });
        };
        let mut command = if config.use_sudo {
            let mut sudo = Command::new("sudo");
            sudo.arg("-u").arg(username).arg(kill_command);
            sudo
        } else {
            Command::new(kill_command)
        };
        let status = command
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|err| SupervisorError::KillFailed {
                detail: format!("{kill_command}: {err}"),
            })?;
        if !status.success() {
            return Err(SupervisorError::KillFailed {
                detail: format!("{kill_command} {pid} exited with {status}"),
            });
        }
        Ok(())
    }

    /// Kills the user's worker through the kill helper and drops its entry.
    #[tracing::instrument(skip(self), err)]
    pub async fn stop_worker(&self, username: &str) -> Result<(), SupervisorError> {
        let not_running = || SupervisorError::NotRunning {
            username: username.to_string(),
        };
        let (instance, pid, previous) = {
            let mut workers = lock(&self.inner.workers);
            let entry = workers
                .get_mut(username)
                .filter(|entry| !matches!(entry.phase, Phase::Stopping))
                .ok_or_else(not_running)?;
            let pid = entry.pid.ok_or_else(not_running)?;
            // Marked first so the exit watcher and new requests leave it alone.
            let previous = std::mem::replace(&mut entry.phase, Phase::Stopping);
            (entry.instance, pid, previous)
        };

        if let Err(err) = self.kill(username, pid).await {
            if let Some(entry) = lock(&self.inner.workers)
                .get_mut(username)
                .filter(|entry| entry.instance == instance)
            {
                entry.phase = previous;
            } else {
                tracing::error!(
                    "Process with PID {pid} for user {username} is still running but no longer tracked"
                );
            }
            return Err(err);
        }
        tokio::time::sleep(self.inner.config.stop_grace).await;
        self.forget(username, instance);
        tracing::info!("Process with PID {pid} for user {username} exited via stop request");
        Ok(())
    }

    /// `/api/server/start`: reuse the running worker unless a restart is forced.
    pub async fn start(
        &self,
        username: &str,
        force_restart: bool,
    ) -> Result<StartOutcome, SupervisorError> {
        if self.status(username) {
            if !force_restart {
                return self.ensure_worker(username).await.map(StartOutcome::Existing);
            }
            match self.stop_worker(username).await {
                Ok(()) | Err(SupervisorError::NotRunning { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        self.ensure_worker(username).await.map(StartOutcome::Started)
    }

    /// True while the user has a worker that is not being stopped.
    pub fn status(&self, username: &str) -> bool {
        lock(&self.inner.workers)
            .get(username)
            .is_some_and(|entry| !matches!(entry.phase, Phase::Stopping))
    }

    /// The user's worker if it is ready.
    pub fn worker(&self, username: &str) -> Option<WorkerInfo> {
        match &lock(&self.inner.workers).get(username)?.phase {
            Phase::Ready(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// Most recent output of the user's latest worker, kept after it exits.
    pub fn log(&self, username: &str) -> Option<Vec<String>> {
        let buffer = lock(&self.inner.logs).get(username)?.clone();
        let lines = lock(&buffer).lines();
        Some(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LONG_RUNNING: &str = "echo started {username} on {port}; exec sleep 5";

    fn supervisor(script: &str) -> Supervisor {
        Supervisor::new(SupervisorConfig::new_test(script))
    }

    #[tokio::test]
    async fn concurrent_first_requests_share_one_worker() {
        let supervisor = supervisor(LONG_RUNNING);
        let (first, second) = tokio::join!(
            supervisor.ensure_worker("alice"),
            supervisor.ensure_worker("alice")
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first, second);
        assert_eq!(lock(&supervisor.inner.workers).len(), 1);
        assert_eq!(supervisor.worker("alice"), Some(first.clone()));

        let bob = supervisor.ensure_worker("bob").await.unwrap();
        assert_ne!(bob.port, first.port);
        assert_ne!(bob.pid, first.pid);

        supervisor.stop_worker("alice").await.unwrap();
        supervisor.stop_worker("bob").await.unwrap();
    }

    #[tokio::test]
    async fn early_exit_fails_the_start() {
        let supervisor = supervisor("echo broken; exit 3");
        let err = supervisor.ensure_worker("alice").await.unwrap_err();
        assert_eq!(err.to_string(), "Problem starting process for user alice");
        assert!(!supervisor.status("alice"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Output of the failed start is still there to look at.
        assert_eq!(supervisor.log("alice").unwrap(), ["broken"]);
    }

    #[tokio::test]
    async fn signal_during_grace_window() {
        let supervisor = supervisor("kill -9 $$");
        assert!(matches!(
            supervisor.ensure_worker("alice").await,
            Err(SupervisorError::StartFailed { .. })
        ));
        assert!(lock(&supervisor.inner.workers).is_empty());
    }

    #[tokio::test]
    async fn log_keeps_latest_lines() {
        let supervisor =
            supervisor("for i in 1 2 3 4 5 6 7; do echo line $i; done; echo oops >&2; exec sleep 5");
        supervisor.ensure_worker("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let lines = supervisor.log("alice").unwrap();
        assert_eq!(lines.len(), 5);
        assert!(lines.contains(&"oops".to_string()));
        assert!(lines.contains(&"line 7".to_string()));
        assert!(!lines.contains(&"line 1".to_string()));
        assert_eq!(supervisor.log("bob"), None);
        supervisor.stop_worker("alice").await.unwrap();
    }

    #[tokio::test]
    async fn worker_receives_its_secret() {
        let supervisor = supervisor("echo secret=$BROKER_AUTH_TOKEN; exec sleep 5");
        let info = supervisor.ensure_worker("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            supervisor.log("alice").unwrap(),
            [format!("secret={}", info.secret)]
        );
        supervisor.stop_worker("alice").await.unwrap();
    }

    #[tokio::test]
    async fn stop_then_start_again() {
        let supervisor = supervisor(LONG_RUNNING);
        let first = supervisor.ensure_worker("alice").await.unwrap();
        supervisor.stop_worker("alice").await.unwrap();
        assert!(!supervisor.status("alice"));
        assert!(matches!(
            supervisor.stop_worker("alice").await,
            Err(SupervisorError::NotRunning { .. })
        ));

        let second = supervisor.ensure_worker("alice").await.unwrap();
        assert_ne!(first.pid, second.pid);
        assert_ne!(first.secret, second.secret);
        assert_eq!(first.port, second.port);
        supervisor.stop_worker("alice").await.unwrap();
    }

    #[tokio::test]
    async fn restart_skips_port_still_draining() {
        let mut config = SupervisorConfig::new_test(LONG_RUNNING);
        config.ports = 47250..47260;
        let supervisor = Supervisor::new(config);
        let first = supervisor.ensure_worker("alice").await.unwrap();
        supervisor.stop_worker("alice").await.unwrap();

        let _draining = std::net::TcpListener::bind(("0.0.0.0", first.port)).unwrap();
        let second = supervisor.ensure_worker("alice").await.unwrap();
        assert_ne!(first.port, second.port);
        supervisor.stop_worker("alice").await.unwrap();
    }

    #[tokio::test]
    async fn waiter_survives_cancelled_first_request() {
        let supervisor = supervisor(LONG_RUNNING);
        let first = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.ensure_worker("alice").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.ensure_worker("alice").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();

        let info = second.await.unwrap().unwrap();
        assert_eq!(supervisor.worker("alice"), Some(info.clone()));
        assert_eq!(supervisor.ensure_worker("alice").await.unwrap(), info);
        supervisor.stop_worker("alice").await.unwrap();
    }

    #[tokio::test]
    async fn exited_worker_is_reclaimed() {
        let supervisor = supervisor("exec sleep 0.4");
        supervisor.ensure_worker("alice").await.unwrap();
        assert!(supervisor.status("alice"));
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!supervisor.status("alice"));
        assert!(lock(&supervisor.inner.workers).is_empty());
    }

    #[tokio::test]
    async fn force_restart_replaces_worker() {
        let supervisor = supervisor(LONG_RUNNING);
        let StartOutcome::Started(first) = supervisor.start("alice", false).await.unwrap() else {
            panic!("expected a fresh worker");
        };
        let StartOutcome::Existing(existing) = supervisor.start("alice", false).await.unwrap() else {
            panic!("expected the running worker");
        };
        assert_eq!(first, existing);
        let StartOutcome::Started(restarted) = supervisor.start("alice", true).await.unwrap() else {
            panic!("expected a restarted worker");
        };
        assert_ne!(first.pid, restarted.pid);
        supervisor.stop_worker("alice").await.unwrap();
    }

    #[tokio::test]
    async fn failing_kill_helper_keeps_worker() {
        let mut config = SupervisorConfig::new_test(LONG_RUNNING);
        config.kill_command = Some("false".to_string());
        let supervisor = Supervisor::new(config);
        supervisor.ensure_worker("alice").await.unwrap();
        let err = supervisor.stop_worker("alice").await.unwrap_err();
        assert!(matches!(err, SupervisorError::KillFailed { .. }));
        assert!(!err.to_string().contains("false"));
        assert!(supervisor.status("alice"));
        assert!(supervisor.worker("alice").is_some());
    }

    #[tokio::test]
    async fn failed_kill_leaves_replacement_alone() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("slow_kill");
        std::fs::write(&helper, "#!/bin/sh\nsleep 0.3\nexit 1\n").unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = SupervisorConfig::new_test(LONG_RUNNING);
        config.kill_command = Some(helper.display().to_string());
        let supervisor = Supervisor::new(config);
        let old = supervisor.ensure_worker("alice").await.unwrap();

        let stopping = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.stop_worker("alice").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!supervisor.status("alice"));
        let replacement = supervisor.ensure_worker("alice").await.unwrap();
        assert_ne!(old.pid, replacement.pid);

        assert!(matches!(
            stopping.await.unwrap(),
            Err(SupervisorError::KillFailed { .. })
        ));
        assert_eq!(supervisor.worker("alice"), Some(replacement));
    }

    #[tokio::test]
    async fn output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SupervisorConfig::new_test("echo to file; exec sleep 5");
        config.log_file_template = Some(format!("{}/{{username}}_{{pid}}.log", dir.path().display()));
        let supervisor = Supervisor::new(config);
        let info = supervisor.ensure_worker("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.stop_worker("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let path = dir.path().join(format!("alice_{}.log", info.pid));
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents, "to file\n");
    }
}
