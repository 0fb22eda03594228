// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use braid_events::{channels, Broker};
use braid_types::new_id;

use crate::process::{BashMode, BashProcess, BashStatus};

/// Default per-process timeout when the caller does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a finished process stays queryable before being reaped.
const REAP_GRACE: chrono::Duration = chrono::Duration::seconds(300);

#[derive(Debug, Error)]
pub enum BashError {
    #[error("spawn failed: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub mode: BashMode,
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
}

enum QueueAction {
    /// Spawn a queued active-mode process when the slot frees.
    Spawn,
    /// Flip a background process to active when the slot frees.
    Promote(oneshot::Sender<()>),
}

struct QueueItem {
    id: String,
    action: QueueAction,
}

struct Entry {
    info: BashProcess,
    timeout: Duration,
    kill_tx: Option<mpsc::UnboundedSender<()>>,
}

#[derive(Default)]
struct Inner {
    procs: HashMap<String, Entry>,
    /// Creation order, for stable `list()` output.
    order: Vec<String>,
    /// Holder of the single active slot.
    active: Option<String>,
    /// Strict FIFO of slot waiters (queued spawns and promotions).
    queue: VecDeque<QueueItem>,
}

/// Concurrency-controlled lifecycle for interactive and background shells.
pub struct BashManager {
    broker: Arc<Broker>,
    inner: Mutex<Inner>,
}

impl BashManager {
    pub fn new(broker: Arc<Broker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a shell command.
    ///
    /// `mode = Active` takes the single slot immediately when it is free,
    /// otherwise the process is recorded as `Queued` and joins the FIFO;
    /// it spawns when the slot is granted.  `mode = Background` spawns
    /// immediately.  Returns the bash id as soon as the record exists.
    pub async fn execute(
        self: &Arc<Self>,
        command: &str,
        opts: ExecuteOptions,
    ) -> Result<String, BashError> {
        let timeout = opts
            .timeout
            .unwrap_or(DEFAULT_TIMEOUT)
            .clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        let id = new_id();
        let info = BashProcess {
            id: id.clone(),
            command: command.to_string(),
            mode: opts.mode,
            status: BashStatus::Queued,
            cwd: opts.cwd,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        };

        let spawn_immediately = {
            let mut inner = self.lock();
            inner.procs.insert(
                id.clone(),
                Entry {
                    info,
                    timeout,
                    kill_tx: None,
                },
            );
            inner.order.push(id.clone());
            match opts.mode {
                BashMode::Background => true,
                BashMode::Active => {
                    if inner.active.is_none() {
                        inner.active = Some(id.clone());
                        true
                    } else {
                        inner.queue.push_back(QueueItem {
                            id: id.clone(),
                            action: QueueAction::Spawn,
                        });
                        false
                    }
                }
            }
        };

        if spawn_immediately {
            if let Err(e) = self.spawn_now(&id).await {
                // Direct spawns fail the execute call itself.
                let mut inner = self.lock();
                if inner.active.as_deref() == Some(id.as_str()) {
                    inner.active = None;
                }
                inner.procs.remove(&id);
                inner.order.retain(|x| x != &id);
                drop(inner);
                self.grant_next().await;
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Spawn the recorded process.  Caller has already reserved the slot
    /// for active-mode processes.
    async fn spawn_now(self: &Arc<Self>, id: &str) -> Result<(), BashError> {
        let (command, cwd, timeout) = {
            let inner = self.lock();
            let entry = inner
                .procs
                .get(id)
                .ok_or_else(|| BashError::Spawn(format!("unknown bash id {id}")))?;
            (entry.info.command.clone(), entry.info.cwd.clone(), entry.timeout)
        };

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        // Detach from the controlling terminal: the subprocess must never
        // read the server's stdin or corrupt a TUI client's terminal state.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if let Some(wd) = &cwd {
            cmd.current_dir(wd);
        }

        debug!(bash_id = id, cmd = %command, "spawning shell process");
        let mut child = cmd.spawn().map_err(|e| BashError::Spawn(e.to_string()))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            let Some(entry) = inner.procs.get_mut(id) else {
                // Killed while spawning; reap the child.
                let _ = child.start_kill();
                return Ok(());
            };
            entry.info.status = BashStatus::Running;
            entry.info.started_at = Utc::now();
            entry.kill_tx = Some(kill_tx);
        }
        self.publish_status(id, BashStatus::Running).await;

        if let Some(out) = stdout {
            tokio::spawn(Self::pump(self.clone(), id.to_string(), "stdout", out));
        }
        if let Some(err) = stderr {
            tokio::spawn(Self::pump(self.clone(), id.to_string(), "stderr", err));
        }
        tokio::spawn(Self::drive(self.clone(), id.to_string(), child, timeout, kill_rx));
        Ok(())
    }

    /// Read one output stream to completion, appending to the process
    /// buffer and mirroring deltas as `bash-output` events.
    async fn pump(
        mgr: Arc<Self>,
        id: String,
        stream: &'static str,
        mut reader: impl tokio::io::AsyncRead + Unpin,
    ) {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let delta = String::from_utf8_lossy(&buf[..n]).to_string();
                    {
                        let mut inner = mgr.lock();
                        if let Some(entry) = inner.procs.get_mut(&id) {
                            match stream {
                                "stdout" => entry.info.stdout.push_str(&delta),
                                _ => entry.info.stderr.push_str(&delta),
                            }
                        }
                    }
                    let _ = mgr
                        .broker
                        .publish(
                            channels::BASH_ALL,
                            "bash-output",
                            json!({ "bashId": id, "stream": stream, "delta": delta }),
                        )
                        .await;
                }
            }
        }
    }

    /// Own the child until it terminates, is killed, or times out.
    async fn drive(
        mgr: Arc<Self>,
        id: String,
        mut child: tokio::process::Child,
        timeout: Duration,
        mut kill_rx: mpsc::UnboundedReceiver<()>,
    ) {
        enum Outcome {
            Exited(Option<i32>, bool),
            Interrupted(BashStatus),
        }

        let outcome = {
            let wait = child.wait();
            tokio::pin!(wait);
            tokio::select! {
                res = &mut wait => match res {
                    Ok(st) => Outcome::Exited(st.code(), st.success()),
                    Err(e) => {
                        warn!(bash_id = %id, "wait failed: {e}");
                        Outcome::Exited(None, false)
                    }
                },
                _ = kill_rx.recv() => Outcome::Interrupted(BashStatus::Killed),
                _ = tokio::time::sleep(timeout) => Outcome::Interrupted(BashStatus::Timeout),
            }
        };

        let (status, exit_code) = match outcome {
            Outcome::Exited(code, true) => (BashStatus::Completed, code),
            Outcome::Exited(code, false) => (BashStatus::Failed, code),
            Outcome::Interrupted(status) => {
                let _ = child.start_kill();
                let code = child.wait().await.ok().and_then(|st| st.code());
                (status, code)
            }
        };
        mgr.finish(&id, status, exit_code).await;
    }

    async fn finish(self: &Arc<Self>, id: &str, status: BashStatus, exit_code: Option<i32>) {
        let was_holder = {
            let mut inner = self.lock();
            let Some(entry) = inner.procs.get_mut(id) else {
                return;
            };
            entry.info.status = status;
            entry.info.ended_at = Some(Utc::now());
            entry.info.exit_code = exit_code;
            entry.kill_tx = None;
            // Drop any queue items for this process (a promote waiter whose
            // process died gets its grant channel closed).
            inner.queue.retain(|q| q.id != id);
            if inner.active.as_deref() == Some(id) {
                inner.active = None;
                true
            } else {
                false
            }
        };

        self.publish_status(id, status).await;
        let _ = self
            .broker
            .publish(
                channels::BASH_ALL,
                "bash-exit",
                json!({ "bashId": id, "status": status, "exitCode": exit_code }),
            )
            .await;

        if was_holder {
            self.grant_next().await;
        }
    }

    /// Grant the slot to the next FIFO waiter, skipping entries that died
    /// while waiting.  Spawns queued processes; flips promoted ones.
    async fn grant_next(self: &Arc<Self>) {
        loop {
            let item = {
                let mut inner = self.lock();
                let Inner {
                    procs,
                    active,
                    queue,
                    ..
                } = &mut *inner;
                if active.is_some() {
                    return;
                }
                let Some(item) = queue.pop_front() else {
                    return;
                };
                match &item.action {
                    QueueAction::Spawn => {
                        let granted = matches!(
                            procs.get(&item.id),
                            Some(e) if e.info.status == BashStatus::Queued
                        );
                        if !granted {
                            continue;
                        }
                        *active = Some(item.id.clone());
                    }
                    QueueAction::Promote(_) => {
                        let granted = match procs.get_mut(&item.id) {
                            Some(e)
                                if e.info.status == BashStatus::Running
                                    && e.info.mode == BashMode::Background =>
                            {
                                e.info.mode = BashMode::Active;
                                true
                            }
                            _ => false,
                        };
                        if !granted {
                            continue;
                        }
                        *active = Some(item.id.clone());
                    }
                }
                item
            };

            match item.action {
                QueueAction::Spawn => {
                    if let Err(e) = self.spawn_now(&item.id).await {
                        warn!(bash_id = %item.id, "queued spawn failed: {e}");
                        {
                            let mut inner = self.lock();
                            if let Some(entry) = inner.procs.get_mut(&item.id) {
                                entry.info.status = BashStatus::Failed;
                                entry.info.ended_at = Some(Utc::now());
                                entry.info.stderr.push_str(&e.to_string());
                            }
                            inner.active = None;
                        }
                        self.publish_status(&item.id, BashStatus::Failed).await;
                        continue;
                    }
                    return;
                }
                QueueAction::Promote(tx) => {
                    self.publish_status(&item.id, BashStatus::Running).await;
                    let _ = tx.send(());
                    return;
                }
            }
        }
    }

    async fn publish_status(&self, id: &str, status: BashStatus) {
        let _ = self
            .broker
            .publish(
                channels::BASH_ALL,
                "bash-status",
                json!({ "bashId": id, "status": status }),
            )
            .await;
    }

    /// Kill a process.  Returns `false` when the process is unknown,
    /// already terminal, or the kill signal could not be delivered.
    pub async fn kill(self: &Arc<Self>, id: &str) -> bool {
        enum Action {
            KillQueued,
            Signal(mpsc::UnboundedSender<()>),
            Nothing,
        }
        let action = {
            let mut inner = self.lock();
            let Inner { procs, queue, .. } = &mut *inner;
            match procs.get_mut(id) {
                None => Action::Nothing,
                Some(e) => match e.info.status {
                    BashStatus::Queued => {
                        e.info.status = BashStatus::Killed;
                        e.info.ended_at = Some(Utc::now());
                        queue.retain(|q| q.id != id);
                        Action::KillQueued
                    }
                    BashStatus::Running => match &e.kill_tx {
                        Some(tx) => Action::Signal(tx.clone()),
                        None => Action::Nothing,
                    },
                    _ => Action::Nothing,
                },
            }
        };
        match action {
            Action::KillQueued => {
                self.publish_status(id, BashStatus::Killed).await;
                let _ = self
                    .broker
                    .publish(
                        channels::BASH_ALL,
                        "bash-exit",
                        json!({ "bashId": id, "status": BashStatus::Killed, "exitCode": null }),
                    )
                    .await;
                true
            }
            Action::Signal(tx) => tx.send(()).is_ok(),
            Action::Nothing => false,
        }
    }

    /// Transition `active → background`, releasing the slot.
    pub async fn demote(self: &Arc<Self>, id: &str) -> bool {
        enum Action {
            Released,
            SpawnQueued,
            Nothing,
        }
        let action = {
            let mut inner = self.lock();
            let is_holder = inner.active.as_deref() == Some(id);
            match inner.procs.get_mut(id) {
                None => Action::Nothing,
                Some(e) if e.info.mode != BashMode::Active => Action::Nothing,
                Some(e) => match e.info.status {
                    BashStatus::Running if is_holder => Action::Released,
                    BashStatus::Queued => Action::SpawnQueued,
                    _ => Action::Nothing,
                },
            }
        };
        match action {
            Action::Released => {
                {
                    let mut inner = self.lock();
                    if let Some(e) = inner.procs.get_mut(id) {
                        e.info.mode = BashMode::Background;
                    }
                    inner.active = None;
                }
                self.publish_status(id, BashStatus::Running).await;
                self.grant_next().await;
                true
            }
            Action::SpawnQueued => {
                {
                    let mut inner = self.lock();
                    inner.queue.retain(|q| q.id != id);
                    if let Some(e) = inner.procs.get_mut(id) {
                        e.info.mode = BashMode::Background;
                    }
                }
                if let Err(e) = self.spawn_now(id).await {
                    warn!(bash_id = id, "demoted spawn failed: {e}");
                    let mut inner = self.lock();
                    if let Some(entry) = inner.procs.get_mut(id) {
                        entry.info.status = BashStatus::Failed;
                        entry.info.ended_at = Some(Utc::now());
                    }
                    return false;
                }
                true
            }
            Action::Nothing => false,
        }
    }

    /// Transition `background → active`.  Waits for the slot to free behind
    /// the same FIFO as queued active spawns.
    pub async fn promote(self: &Arc<Self>, id: &str) -> bool {
        let waiter = {
            let mut inner = self.lock();
            let Inner {
                procs,
                active,
                queue,
                ..
            } = &mut *inner;
            match procs.get_mut(id) {
                Some(e)
                    if e.info.status == BashStatus::Running
                        && e.info.mode == BashMode::Background =>
                {
                    if active.is_none() && queue.is_empty() {
                        e.info.mode = BashMode::Active;
                        *active = Some(id.to_string());
                        None
                    } else {
                        let (tx, rx) = oneshot::channel();
                        queue.push_back(QueueItem {
                            id: id.to_string(),
                            action: QueueAction::Promote(tx),
                        });
                        Some(rx)
                    }
                }
                _ => return false,
            }
        };
        match waiter {
            None => {
                self.publish_status(id, BashStatus::Running).await;
                true
            }
            // A closed channel means the process died while waiting.
            Some(rx) => rx.await.is_ok(),
        }
    }

    pub fn list(&self) -> Vec<BashProcess> {
        let mut inner = self.lock();
        // Reap terminal entries past the grace window.
        let cutoff = Utc::now() - REAP_GRACE;
        let stale: Vec<String> = inner
            .procs
            .iter()
            .filter(|(_, e)| {
                e.info.status.is_terminal()
                    && e.info.ended_at.map_or(false, |t| t < cutoff)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for id in &stale {
            inner.procs.remove(id);
        }
        let Inner { procs, order, .. } = &mut *inner;
        order.retain(|id| procs.contains_key(id));

        order
            .iter()
            .filter_map(|id| procs.get(id))
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<BashProcess> {
        self.lock().procs.get(id).map(|e| e.info.clone())
    }

    pub fn get_active_bash_id(&self) -> Option<String> {
        self.lock().active.clone()
    }

    pub fn get_active(&self) -> Option<BashProcess> {
        let inner = self.lock();
        inner
            .active
            .as_ref()
            .and_then(|id| inner.procs.get(id))
            .map(|e| e.info.clone())
    }

    pub fn get_active_queue_length(&self) -> usize {
        self.lock().queue.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use braid_store::MemoryStore;

    use super::*;

    fn manager() -> Arc<BashManager> {
        let broker = Broker::new(MemoryStore::new());
        BashManager::new(broker)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn background_process_completes_and_buffers_stdout() {
        let m = manager();
        let id = m
            .execute(
                "echo hello",
                ExecuteOptions {
                    mode: BashMode::Background,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        wait_for(|| m.get(&id).unwrap().status == BashStatus::Completed).await;
        let p = m.get(&id).unwrap();
        assert_eq!(p.exit_code, Some(0));
        assert!(p.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let m = manager();
        let id = m
            .execute(
                "exit 3",
                ExecuteOptions {
                    mode: BashMode::Background,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        wait_for(|| m.get(&id).unwrap().status.is_terminal()).await;
        let p = m.get(&id).unwrap();
        assert_eq!(p.status, BashStatus::Failed);
        assert_eq!(p.exit_code, Some(3));
    }

    #[tokio::test]
    async fn second_active_request_is_enqueued_fifo() {
        let m = manager();
        let a = m
            .execute("sleep 5", ExecuteOptions::default())
            .await
            .unwrap();
        let b = m.execute("echo ls", ExecuteOptions::default()).await.unwrap();

        assert_eq!(m.get_active_bash_id(), Some(a.clone()));
        assert_eq!(m.get_active_queue_length(), 1);
        let b_info = m.get(&b).unwrap();
        assert_eq!(b_info.mode, BashMode::Active);
        assert_eq!(b_info.status, BashStatus::Queued);

        // Releasing the slot starts B and makes it the active holder.
        assert!(m.demote(&a).await);
        wait_for(|| m.get_active_bash_id() == Some(b.clone())).await;
        wait_for(|| m.get(&b).unwrap().status.is_terminal()).await;
        assert_eq!(m.get(&b).unwrap().status, BashStatus::Completed);
        assert_eq!(m.get(&a).unwrap().mode, BashMode::Background);
        let _ = m.kill(&a).await;
    }

    #[tokio::test]
    async fn at_most_one_active_running_process() {
        let m = manager();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                m.execute("sleep 2", ExecuteOptions::default())
                    .await
                    .unwrap(),
            );
        }
        let running_active = m
            .list()
            .into_iter()
            .filter(|p| p.mode == BashMode::Active && p.status == BashStatus::Running)
            .count();
        assert!(running_active <= 1);
        for id in ids {
            let _ = m.kill(&id).await;
        }
    }

    #[tokio::test]
    async fn kill_marks_killed_and_releases_slot() {
        let m = manager();
        let a = m
            .execute("sleep 10", ExecuteOptions::default())
            .await
            .unwrap();
        let b = m
            .execute("echo next", ExecuteOptions::default())
            .await
            .unwrap();
        assert!(m.kill(&a).await);
        wait_for(|| m.get(&a).unwrap().status == BashStatus::Killed).await;
        // FIFO successor takes the slot and runs.
        wait_for(|| m.get(&b).unwrap().status.is_terminal()).await;
        assert_eq!(m.get(&b).unwrap().status, BashStatus::Completed);
    }

    #[tokio::test]
    async fn kill_unknown_or_finished_returns_false() {
        let m = manager();
        assert!(!m.kill("no-such-id").await);
        let id = m
            .execute(
                "true",
                ExecuteOptions {
                    mode: BashMode::Background,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        wait_for(|| m.get(&id).unwrap().status.is_terminal()).await;
        assert!(!m.kill(&id).await);
    }

    #[tokio::test]
    async fn timeout_kills_and_marks_timeout() {
        let m = manager();
        let id = m
            .execute(
                "sleep 30",
                ExecuteOptions {
                    mode: BashMode::Background,
                    timeout: Some(Duration::from_secs(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        wait_for(|| m.get(&id).unwrap().status.is_terminal()).await;
        assert_eq!(m.get(&id).unwrap().status, BashStatus::Timeout);
    }

    #[tokio::test]
    async fn promote_waits_for_slot_then_flips_mode() {
        let m = manager();
        let a = m
            .execute("sleep 5", ExecuteOptions::default())
            .await
            .unwrap();
        let b = m
            .execute(
                "sleep 5",
                ExecuteOptions {
                    mode: BashMode::Background,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        wait_for(|| m.get(&b).unwrap().status == BashStatus::Running).await;

        let m2 = m.clone();
        let b2 = b.clone();
        let promote = tokio::spawn(async move { m2.promote(&b2).await });
        // Still queued behind A.
        wait_for(|| m.get_active_queue_length() == 1).await;
        assert_eq!(m.get_active_bash_id(), Some(a.clone()));

        assert!(m.kill(&a).await);
        assert!(promote.await.unwrap());
        assert_eq!(m.get_active_bash_id(), Some(b.clone()));
        assert_eq!(m.get(&b).unwrap().mode, BashMode::Active);
        let _ = m.kill(&b).await;
    }

    #[tokio::test]
    async fn promote_idle_slot_is_immediate() {
        let m = manager();
        let b = m
            .execute(
                "sleep 5",
                ExecuteOptions {
                    mode: BashMode::Background,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        wait_for(|| m.get(&b).unwrap().status == BashStatus::Running).await;
        assert!(m.promote(&b).await);
        assert_eq!(m.get_active_bash_id(), Some(b.clone()));
        let _ = m.kill(&b).await;
    }

    #[tokio::test]
    async fn promote_non_background_returns_false() {
        let m = manager();
        let a = m
            .execute("sleep 5", ExecuteOptions::default())
            .await
            .unwrap();
        assert!(!m.promote(&a).await);
        assert!(!m.promote("unknown").await);
        let _ = m.kill(&a).await;
    }

    #[tokio::test]
    async fn spawn_failure_fails_execute() {
        let m = manager();
        let err = m
            .execute(
                "true",
                ExecuteOptions {
                    mode: BashMode::Background,
                    cwd: Some("/definitely/not/a/dir".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(err.is_err());
        assert!(m.list().is_empty());
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_across_releases() {
        let m = manager();
        let a = m
            .execute("sleep 5", ExecuteOptions::default())
            .await
            .unwrap();
        let b = m
            .execute("echo b", ExecuteOptions::default())
            .await
            .unwrap();
        let c = m
            .execute("echo c", ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(m.get_active_queue_length(), 2);

        assert!(m.kill(&a).await);
        // B must run (and finish) before C starts.
        wait_for(|| m.get(&b).unwrap().status.is_terminal()).await;
        wait_for(|| m.get(&c).unwrap().status.is_terminal()).await;
        let b_end = m.get(&b).unwrap().ended_at.unwrap();
        let c_start = m.get(&c).unwrap().started_at;
        assert!(c_start >= b_end);
    }
}
