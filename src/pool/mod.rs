//! Pool (C4): the top-level actor that owns every Group and Spawner and
//! drives `get`/`close`/GC/control-surface commands against them.
//!
//! Grounded on the teacher's `ipc/server.rs` `run_kernel_actor`: a single
//! task owns all mutable state and processes one command at a time from an
//! mpsc channel, replying over a `oneshot`. That, rather than a literal
//! `Mutex<Pool>`, is this crate's reading of §5's "one pool-wide mutex
//! never held across a suspension point": the actor never awaits while
//! holding anything another task could observe, because nothing else ever
//! touches its state directly.

pub mod gc;
pub mod group;
pub mod inspection;
pub mod process;
pub mod selection;
pub mod session;
pub mod socket;
pub mod waitlist;

use crate::options::Options;
use crate::spawner::Spawner;
use crate::types::{Config, GroupKey, PoolError, ProcessId, Result, SpawnError};
use chrono::Utc;
use group::{CloseOutcome, GetOutcome, Group, ServedWaiter, SpawnFailureOutcome};
use process::Process;
use session::{Session, SessionClosed};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

struct GroupEntry {
    group: Group,
    spawner: Option<Spawner>,
}

struct PendingGet {
    respond_to: oneshot::Sender<Result<Session>>,
}

/// External API surface of the pool actor (§4.3, §6).
enum PoolCommand {
    Get {
        options: Options,
        respond_to: oneshot::Sender<Result<Session>>,
    },
    DetachGroup {
        name: String,
        respond_to: oneshot::Sender<bool>,
    },
    Inspect {
        respond_to: oneshot::Sender<serde_json::Value>,
    },
    GcTick,
}

/// Events a spawned helper task posts back to the actor; distinct from
/// `PoolCommand` because these originate inside the actor itself rather
/// than from a `PoolHandle` caller.
enum InternalEvent {
    SpawnCompleted {
        group_key: GroupKey,
        spawner: Spawner,
        result: std::result::Result<Process, SpawnError>,
    },
    RetrySpawn {
        group_key: GroupKey,
    },
    WaitlistTimeout {
        group_key: GroupKey,
        waiter_id: u64,
    },
}

/// Cloneable front door to a running pool actor.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<PoolCommand>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle").finish_non_exhaustive()
    }
}

impl PoolHandle {
    /// §4.3 `asyncGet`: request a Session for the given identity, spawning
    /// a process if needed. Resolves once a process is available, the
    /// start-timeout deadline elapses, or the pool is shutting down.
    pub async fn async_get(&self, options: Options) -> Result<Session> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Get { options, respond_to })
            .await
            .map_err(|_| PoolError::PoolShuttingDown)?;
        rx.await.map_err(|_| PoolError::Disconnected)?
    }

    /// §4.2.3-adjacent admin operation: detach every process of the named
    /// Group. Returns `false` if no such Group exists.
    pub async fn detach_group_by_name(&self, name: impl Into<String>) -> Result<bool> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::DetachGroup { name: name.into(), respond_to })
            .await
            .map_err(|_| PoolError::PoolShuttingDown)?;
        rx.await.map_err(|_| PoolError::Disconnected)
    }

    pub async fn inspect_state(&self) -> Result<serde_json::Value> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Inspect { respond_to })
            .await
            .map_err(|_| PoolError::PoolShuttingDown)?;
        rx.await.map_err(|_| PoolError::Disconnected)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct PoolActor {
    config: Config,
    groups: HashMap<GroupKey, GroupEntry>,
    pending: HashMap<(GroupKey, u64), PendingGet>,
    waiting_for_capacity: HashSet<GroupKey>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    session_closed_tx: mpsc::UnboundedSender<SessionClosed>,
}

/// Starts the pool actor as a background task and returns a handle to it.
/// The GC ticker is wired up here too, grounded on the teacher's
/// `CleanupService::start`.
pub fn spawn(config: Config) -> PoolHandle {
    let (tx, rx) = mpsc::channel(256);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (session_closed_tx, session_closed_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let gc_interval = config.pool.gc_interval;
    let gc_tx = tx.clone();
    let gc_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gc_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = gc_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if gc_tx.send(PoolCommand::GcTick).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let actor = PoolActor {
        config,
        groups: HashMap::new(),
        pending: HashMap::new(),
        waiting_for_capacity: HashSet::new(),
        internal_tx,
        session_closed_tx,
    };
    tokio::spawn(run_actor(actor, rx, internal_rx, session_closed_rx, cancel.clone()));

    PoolHandle { tx, cancel }
}

async fn run_actor(
    mut actor: PoolActor,
    mut rx: mpsc::Receiver<PoolCommand>,
    mut internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    mut session_closed_rx: mpsc::UnboundedReceiver<SessionClosed>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("pool actor shutting down");
                break;
            }
            command = rx.recv() => {
                match command {
                    Some(command) => actor.handle_command(command).await,
                    None => break,
                }
            }
            event = internal_rx.recv() => {
                match event {
                    Some(event) => actor.handle_internal_event(event).await,
                    None => break,
                }
            }
            closed = session_closed_rx.recv() => {
                match closed {
                    Some(closed) => actor.handle_session_closed(closed).await,
                    None => break,
                }
            }
        }
    }
}

impl PoolActor {
    async fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Get { options, respond_to } => self.handle_get(options, respond_to).await,
            PoolCommand::DetachGroup { name, respond_to } => {
                let outcome = self.detach_group(&GroupKey::from_string(name)).await;
                let _ = respond_to.send(outcome);
            }
            PoolCommand::Inspect { respond_to } => {
                let value = inspection::snapshot(self.groups.iter().map(|(k, e)| (k, &e.group)));
                let _ = respond_to.send(value);
            }
            PoolCommand::GcTick => self.run_gc_sweep().await,
        }
    }

    fn group_params(&self, options: &Options) -> (usize, usize) {
        let min = options.min_processes.unwrap_or(self.config.spawn.min_processes);
        let max = options.max_processes.unwrap_or(self.config.spawn.max_processes);
        (min, max)
    }

    fn ensure_group(&mut self, options: &Options) -> GroupKey {
        let key = options.group_key();
        if !self.groups.contains_key(&key) {
            let (min, max) = self.group_params(options);
            let group = Group::new(
                key.clone(),
                options.clone().into_group_options(),
                min,
                max,
                self.config.spawn.max_request_queue_size,
                self.config.spawn.max_consecutive_spawn_failures,
                self.config.spawn.spawn_retry_backoff_base,
            );
            let spawner = Spawner::for_method(options.spawn_method, None);
            self.groups.insert(key.clone(), GroupEntry { group, spawner: Some(spawner) });
        }
        key
    }

    fn build_session(&self, group_key: &GroupKey, served: &ServedWaiter) -> Session {
        Session::new(
            group_key.clone(),
            served.process_id.clone(),
            served.socket_index,
            served.address.clone(),
            self.session_closed_tx.clone(),
        )
    }

    async fn handle_get(&mut self, options: Options, respond_to: oneshot::Sender<Result<Session>>) {
        let deadline = options
            .start_timeout()
            .unwrap_or(self.config.spawn.start_timeout);
        let group_key = self.ensure_group(&options);
        let Some(entry) = self.groups.get_mut(&group_key) else {
            let _ = respond_to.send(Err(PoolError::internal("group vanished immediately after creation")));
            return;
        };

        match entry.group.get(options.sticky_session_id) {
            GetOutcome::Immediate(idx) => {
                let outcome = entry.group.checkout_immediate(idx);
                match outcome {
                    Ok(served) => {
                        let session = self.build_session(&group_key, &served);
                        let _ = respond_to.send(Ok(session));
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                }
            }
            GetOutcome::NeedsSpawn(waiter_id) => {
                self.pending.insert((group_key.clone(), waiter_id), PendingGet { respond_to });
                self.schedule_timeout(group_key.clone(), waiter_id, deadline);
                if self.ensure_capacity_for_spawn().await {
                    self.dispatch_spawn(group_key).await;
                } else {
                    self.waiting_for_capacity.insert(group_key);
                }
            }
            GetOutcome::SpawnAlreadyInFlight(waiter_id) | GetOutcome::Waiting(waiter_id) => {
                self.pending.insert((group_key.clone(), waiter_id), PendingGet { respond_to });
                self.schedule_timeout(group_key, waiter_id, deadline);
            }
            GetOutcome::QueueFull => {
                let _ = respond_to.send(Err(PoolError::RequestQueueFull { group: group_key.to_string() }));
            }
            GetOutcome::Rejected(err) => {
                let _ = respond_to.send(Err(err));
            }
        }
    }

    fn schedule_timeout(&self, group_key: GroupKey, waiter_id: u64, deadline: std::time::Duration) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = tx.send(InternalEvent::WaitlistTimeout { group_key, waiter_id });
        });
    }

    fn total_process_count(&self) -> usize {
        self.groups.values().map(|e| e.group.process_count()).sum()
    }

    /// §4.3 admission control: free a slot via idle eviction, then via
    /// trashing the globally oldest process, before giving up.
    async fn ensure_capacity_for_spawn(&mut self) -> bool {
        if self.total_process_count() < self.config.pool.max {
            return true;
        }
        if let Some((group_key, process_id)) = self.find_oldest_idle_process_global() {
            self.evict_process(&group_key, &process_id).await;
            return true;
        }
        if let Some((group_key, process_id)) = self.find_best_process_to_trash_global() {
            self.evict_process(&group_key, &process_id).await;
            return true;
        }
        false
    }

    fn find_oldest_idle_process_global(&self) -> Option<(GroupKey, ProcessId)> {
        self.groups
            .iter()
            .filter_map(|(key, entry)| {
                entry
                    .group
                    .oldest_idle_process()
                    .filter(|_| entry.group.enabled_count() > entry.group.min_processes)
                    .map(|p| (key.clone(), p.id.clone(), p.last_used))
            })
            .min_by_key(|(_, _, last_used)| *last_used)
            .map(|(key, id, _)| (key, id))
    }

    fn find_best_process_to_trash_global(&self) -> Option<(GroupKey, ProcessId)> {
        self.groups
            .iter()
            .filter_map(|(key, entry)| {
                entry
                    .group
                    .oldest_process_regardless_of_busyness()
                    .map(|p| (key.clone(), p.id.clone(), p.last_used))
            })
            .min_by_key(|(_, _, last_used)| *last_used)
            .map(|(key, id, _)| (key, id))
    }

    async fn evict_process(&mut self, group_key: &GroupKey, process_id: &ProcessId) {
        let Some(entry) = self.groups.get_mut(group_key) else { return };
        if !entry.group.detach(process_id) {
            return;
        }
        if let Some(process) = entry.group.process_mut(process_id) {
            process.shutdown().await;
        }
        self.reap_group(group_key);
    }

    fn reap_group(&mut self, group_key: &GroupKey) {
        if let Some(entry) = self.groups.get_mut(group_key) {
            entry.group.reap_detached();
            if entry.group.is_empty_and_idle() {
                self.groups.remove(group_key);
            }
        }
    }

    async fn dispatch_spawn(&mut self, group_key: GroupKey) {
        let Some(entry) = self.groups.get_mut(&group_key) else { return };
        if !entry.group.begin_spawn() {
            return;
        }
        let Some(mut spawner) = entry.spawner.take() else {
            return;
        };
        let options = entry.group.options.clone();
        let internal_tx = self.internal_tx.clone();
        let gk = group_key.clone();
        tokio::spawn(async move {
            let result = spawner.spawn(&gk, &options).await;
            let _ = internal_tx.send(InternalEvent::SpawnCompleted {
                group_key: gk,
                spawner,
                result,
            });
        });
    }

    async fn handle_internal_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::SpawnCompleted { group_key, spawner, result } => {
                self.handle_spawn_completed(group_key, spawner, result).await;
            }
            InternalEvent::RetrySpawn { group_key } => {
                self.dispatch_spawn(group_key).await;
            }
            InternalEvent::WaitlistTimeout { group_key, waiter_id } => {
                self.handle_waitlist_timeout(group_key, waiter_id);
            }
        }
    }

    fn handle_waitlist_timeout(&mut self, group_key: GroupKey, waiter_id: u64) {
        let Some(entry) = self.groups.get_mut(&group_key) else { return };
        if !entry.group.cancel_waiter(waiter_id) {
            // Already served or failed in the meantime; nothing to do.
            return;
        }
        if let Some(pending) = self.pending.remove(&(group_key.clone(), waiter_id)) {
            let waited_ms = 0; // exact wait time is tracked by the caller's own clock
            let _ = pending.respond_to.send(Err(PoolError::GetTimeout {
                group: group_key.to_string(),
                waited_ms,
            }));
        }
    }

    async fn handle_spawn_completed(
        &mut self,
        group_key: GroupKey,
        spawner: Spawner,
        result: std::result::Result<Process, SpawnError>,
    ) {
        let Some(entry) = self.groups.get_mut(&group_key) else { return };
        entry.spawner = Some(spawner);

        match result {
            Ok(process) => {
                let served = entry.group.spawn_succeeded(process);
                entry.group.finish_restart_if_ready();
                self.reply_to_served(&group_key, served);
            }
            Err(error) => match entry.group.spawn_failed(error) {
                SpawnFailureOutcome::RetryWithBackoff { backoff, .. } => {
                    let tx = self.internal_tx.clone();
                    let gk = group_key.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(backoff).await;
                        let _ = tx.send(InternalEvent::RetrySpawn { group_key: gk });
                    });
                }
                SpawnFailureOutcome::FailAll { waiter_ids, error, .. } => {
                    for waiter_id in waiter_ids {
                        if let Some(pending) = self.pending.remove(&(group_key.clone(), waiter_id)) {
                            let _ = pending.respond_to.send(Err(PoolError::Spawn(error.clone())));
                        }
                    }
                }
            },
        }
    }

    fn reply_to_served(&mut self, group_key: &GroupKey, served: Vec<ServedWaiter>) {
        for waiter in served {
            if let Some(pending) = self.pending.remove(&(group_key.clone(), waiter.id)) {
                let session = self.build_session(group_key, &waiter);
                let _ = pending.respond_to.send(Ok(session));
            }
        }
    }

    async fn handle_session_closed(&mut self, closed: SessionClosed) {
        let group_key = closed.group_key.clone();
        let Some(entry) = self.groups.get_mut(&group_key) else { return };
        let CloseOutcome { should_detach, served } = entry.group.close_session(&closed.process_id, closed.socket_index);
        self.reply_to_served(&group_key, served);

        if should_detach {
            let Some(entry) = self.groups.get_mut(&group_key) else { return };
            entry.group.detach(&closed.process_id);
            if let Some(process) = entry.group.process_mut(&closed.process_id) {
                process.shutdown().await;
            }
            self.reap_group(&group_key);
        }
        self.retry_waiting_groups().await;
    }

    /// Re-attempts spawns for groups that were blocked on global capacity,
    /// now that a process destruction may have freed a slot.
    async fn retry_waiting_groups(&mut self) {
        if self.waiting_for_capacity.is_empty() {
            return;
        }
        let candidates: Vec<GroupKey> = self.waiting_for_capacity.drain().collect();
        for group_key in candidates {
            if self.ensure_capacity_for_spawn().await {
                self.dispatch_spawn(group_key).await;
            } else {
                self.waiting_for_capacity.insert(group_key);
            }
        }
    }

    async fn detach_group(&mut self, group_key: &GroupKey) -> bool {
        let Some(entry) = self.groups.get_mut(group_key) else { return false };
        let moved = entry.group.begin_shutdown();
        for process_id in &moved {
            if let Some(process) = entry.group.process_mut(process_id) {
                process.shutdown().await;
            }
        }
        self.reap_group(group_key);
        true
    }

    /// §4.1 / §7 supervisor check: a process whose own admin channel
    /// reports it has already exited is detached immediately, ahead of the
    /// idle-eviction/oob-work phases, rather than left to linger until
    /// something tries to use it and gets `PoolError::ProcessDied`.
    async fn run_liveness_sweep(&mut self) {
        let group_keys: Vec<GroupKey> = self.groups.keys().cloned().collect();
        for group_key in group_keys {
            let exited = match self.groups.get_mut(&group_key) {
                Some(entry) => entry.group.exited_process_ids(),
                None => continue,
            };
            for process_id in exited {
                tracing::warn!(group = %group_key, process = %process_id, "process exited unexpectedly; detaching");
                if let Some(entry) = self.groups.get_mut(&group_key) {
                    entry.group.detach(&process_id);
                    if let Some(process) = entry.group.process_mut(&process_id) {
                        process.mark_dead();
                    }
                }
            }
            self.reap_group(&group_key);
        }
    }

    /// §4.3 / §1.2: periodic idle-eviction and out-of-band-work sweep.
    async fn run_gc_sweep(&mut self) {
        self.run_liveness_sweep().await;
        let plan = gc::plan_sweep(
            self.groups.iter().map(|(k, e)| (k, &e.group)),
            self.config.pool.max_idle_time,
            Utc::now(),
        );
        for candidate in plan.evictions {
            self.evict_process(&candidate.group_key, &candidate.process_id).await;
        }
        for candidate in plan.oob_candidates {
            if let Some(entry) = self.groups.get_mut(&candidate.group_key) {
                if let Some(process) = entry.group.process_mut(&candidate.process_id) {
                    process.trigger_oob_work(self.config.pool.oob_work_cooldown).await;
                }
            }
        }
        for entry in self.groups.values_mut() {
            if let Some(spawner) = entry.spawner.as_mut() {
                spawner.gc_idle_preloader(self.config.spawn.max_preloader_idle_time).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SpawnMethod;
    use std::collections::HashMap as StdHashMap;

    fn dummy_options() -> Options {
        Options {
            app_root: "/tmp".to_string(),
            app_type: "rack".to_string(),
            environment: "production".to_string(),
            interpreter: None,
            spawn_method: SpawnMethod::Dummy,
            min_processes: None,
            max_processes: Some(2),
            max_requests: None,
            start_timeout_msec: Some(1000),
            max_idle_time_secs: None,
            max_preloader_idle_time_secs: None,
            concurrency_model: crate::options::ConcurrencyModel::Process,
            process_concurrency: None,
            user: None,
            group: None,
            sticky_session_cookie: None,
            environment_variables: StdHashMap::new(),
            group_name_override: None,
            sticky_session_id: None,
        }
    }

    #[tokio::test]
    async fn async_get_spawns_and_returns_a_session() {
        let handle = spawn(Config::default());
        let session = handle.async_get(dummy_options()).await.unwrap();
        assert!(!session.process_id().as_str().is_empty());
    }

    #[tokio::test]
    async fn second_get_reuses_or_spawns_within_max() {
        let handle = spawn(Config::default());
        let s1 = handle.async_get(dummy_options()).await.unwrap();
        let s2 = handle.async_get(dummy_options()).await.unwrap();
        assert_ne!(s1.process_id(), s2.process_id());
    }

    #[tokio::test]
    async fn inspect_state_reports_the_group_just_created() {
        let handle = spawn(Config::default());
        let _session = handle.async_get(dummy_options()).await.unwrap();
        let snapshot = handle.inspect_state().await.unwrap();
        assert_eq!(snapshot["groups"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detach_unknown_group_returns_false() {
        let handle = spawn(Config::default());
        let detached = handle.detach_group_by_name("nonexistent").await.unwrap();
        assert!(!detached);
    }
}
