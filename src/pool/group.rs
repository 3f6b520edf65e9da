//! Group (C3): a pool of interchangeable processes serving one application
//! identity (§3 Group, §4.2).
//!
//! The four process lists and their index/busyness-vector bookkeeping are
//! ported from the original implementation's list-management algorithm
//! (`original_source/.../Group/ProcessListManagement.cpp`): removal
//! rebuilds every subsequent index in the source list and, if the source
//! was `enabled_processes`, rebuilds the parallel busyness vector; insertion
//! pushes to the back and stamps the new index.

use crate::options::Options;
use crate::pool::process::{Enabled, Process, NO_INDEX};
use crate::pool::selection::{self, Selection};
use crate::pool::waitlist::Waitlist;
use crate::types::{GroupKey, PoolError, ProcessId, SpawnError};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLifeStatus {
    Alive,
    ShuttingDown,
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListTag {
    Enabled,
    Disabling,
    Disabled,
    Detached,
}

/// A waiter queued on `get_waitlist` (§5).
pub struct GetWaiter {
    pub sticky_id: Option<u32>,
}

/// What `Group::get` decided to do with a caller (§4.2 decision tree).
pub enum GetOutcome {
    /// Serve immediately from `enabled_processes[idx]`.
    Immediate(usize),
    /// Queued; caller must check global pool capacity and, if available,
    /// call `begin_spawn` + dispatch a spawn for this waitlist id.
    NeedsSpawn(u64),
    /// Queued behind a spawn already in flight; nothing more to do.
    SpawnAlreadyInFlight(u64),
    /// Queued with no spawn possible (already at local max, or sticky
    /// binding to a busy process); will be served by a future close or
    /// attach.
    Waiting(u64),
    /// `max_request_queue_size` was exceeded.
    QueueFull,
    Rejected(PoolError),
}

/// A waiter that was just handed a process (returned by `attach`/
/// `close_session`'s internal drain of the waitlist).
pub struct ServedWaiter {
    pub id: u64,
    pub process_id: ProcessId,
    pub socket_index: usize,
    pub address: String,
}

pub enum SpawnFailureOutcome {
    RetryWithBackoff { attempt: u32, backoff: Duration },
    FailAll { waiters: Vec<GetWaiter>, waiter_ids: Vec<u64>, error: SpawnError },
}

pub struct CloseOutcome {
    pub should_detach: bool,
    pub served: Vec<ServedWaiter>,
}

pub struct Group {
    pub key: GroupKey,
    pub options: Options,
    pub life_status: GroupLifeStatus,
    pub restarting: bool,

    enabled_processes: Vec<Process>,
    enabled_busyness: Vec<i64>,
    disabling_processes: Vec<Process>,
    disabled_processes: Vec<Process>,
    detached_processes: Vec<Process>,

    get_waitlist: Waitlist<GetWaiter>,

    processes_being_spawned: u32,
    spawning: bool,
    consecutive_spawn_failures: u32,
    pub last_spawn_error: Option<SpawnError>,

    pub min_processes: usize,
    pub max_processes: usize,
    pub max_request_queue_size: usize,
    pub max_consecutive_spawn_failures: u32,
    pub spawn_retry_backoff_base: Duration,
}

impl Group {
    pub fn new(
        key: GroupKey,
        options: Options,
        min_processes: usize,
        max_processes: usize,
        max_request_queue_size: usize,
        max_consecutive_spawn_failures: u32,
        spawn_retry_backoff_base: Duration,
    ) -> Self {
        Self {
            key,
            options,
            life_status: GroupLifeStatus::Alive,
            restarting: false,
            enabled_processes: Vec::new(),
            enabled_busyness: Vec::new(),
            disabling_processes: Vec::new(),
            disabled_processes: Vec::new(),
            detached_processes: Vec::new(),
            get_waitlist: Waitlist::new(),
            processes_being_spawned: 0,
            spawning: false,
            consecutive_spawn_failures: 0,
            last_spawn_error: None,
            min_processes,
            max_processes,
            max_request_queue_size,
            max_consecutive_spawn_failures,
            spawn_retry_backoff_base,
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled_processes.len()
    }

    pub fn disabling_count(&self) -> usize {
        self.disabling_processes.len()
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled_processes.len()
    }

    pub fn detached_count(&self) -> usize {
        self.detached_processes.len()
    }

    pub fn get_waitlist_len(&self) -> usize {
        self.get_waitlist.len()
    }

    pub fn process_count(&self) -> usize {
        self.enabled_count() + self.disabling_count() + self.disabled_count()
            + self.processes_being_spawned as usize
    }

    pub fn is_spawning(&self) -> bool {
        self.spawning
    }

    pub fn enabled_processes(&self) -> &[Process] {
        &self.enabled_processes
    }

    /// §4.3 `find_oldest_idle_process` / GC: the enabled process with zero
    /// busyness and the oldest `last_used`, if any.
    pub fn oldest_idle_process(&self) -> Option<&Process> {
        self.enabled_processes
            .iter()
            .filter(|p| p.busyness() == 0)
            .min_by_key(|p| p.last_used)
    }

    /// §4.3 `find_best_process_to_trash`: the globally oldest-used enabled
    /// process regardless of busyness, a last resort under pressure.
    pub fn oldest_process_regardless_of_busyness(&self) -> Option<&Process> {
        self.enabled_processes.iter().min_by_key(|p| p.last_used)
    }

    /// §4.3 GC candidates: idle enabled processes older than `cutoff`,
    /// oldest first, capped so `min_processes` is never dipped below.
    pub fn idle_processes_beyond_min(&self, cutoff: DateTime<Utc>) -> Vec<ProcessId> {
        if self.enabled_processes.len() <= self.min_processes {
            return Vec::new();
        }
        let mut candidates: Vec<&Process> = self
            .enabled_processes
            .iter()
            .filter(|p| p.busyness() == 0 && p.last_used < cutoff)
            .collect();
        candidates.sort_by_key(|p| p.last_used);
        let budget = self.enabled_processes.len() - self.min_processes;
        candidates.into_iter().take(budget).map(|p| p.id.clone()).collect()
    }

    /// §1.2 out-of-band-work sweep candidates: every enabled, idle process.
    /// `Process::trigger_oob_work` itself enforces the per-process cooldown.
    pub fn idle_process_ids(&self) -> Vec<ProcessId> {
        self.enabled_processes
            .iter()
            .filter(|p| p.busyness() == 0)
            .map(|p| p.id.clone())
            .collect()
    }

    /// §4.1 "detected by the supervisor (SIGCHLD or admin-channel EOF) and
    /// immediately detached": the ids of processes still considered live
    /// (not already detached) whose own admin channel reports they have
    /// already exited. Does not touch `detached_processes`; those are
    /// already on their way out via `shutdown`/`reap_detached`.
    pub fn exited_process_ids(&mut self) -> Vec<ProcessId> {
        let mut exited = Vec::new();
        for tag in [ListTag::Enabled, ListTag::Disabling, ListTag::Disabled] {
            for process in self.list_mut(tag).iter_mut() {
                if process.has_exited() == Some(true) {
                    exited.push(process.id.clone());
                }
            }
        }
        exited
    }

    fn list(&self, tag: ListTag) -> &Vec<Process> {
        match tag {
            ListTag::Enabled => &self.enabled_processes,
            ListTag::Disabling => &self.disabling_processes,
            ListTag::Disabled => &self.disabled_processes,
            ListTag::Detached => &self.detached_processes,
        }
    }

    fn list_mut(&mut self, tag: ListTag) -> &mut Vec<Process> {
        match tag {
            ListTag::Enabled => &mut self.enabled_processes,
            ListTag::Disabling => &mut self.disabling_processes,
            ListTag::Disabled => &mut self.disabled_processes,
            ListTag::Detached => &mut self.detached_processes,
        }
    }

    fn locate(&self, id: &ProcessId) -> Option<(ListTag, usize)> {
        for tag in [ListTag::Enabled, ListTag::Disabling, ListTag::Disabled, ListTag::Detached] {
            if let Some(idx) = self.list(tag).iter().position(|p| &p.id == id) {
                return Some((tag, idx));
            }
        }
        None
    }

    /// Ported from `removeProcessFromList`: erase by index, decrement the
    /// matching count (implicit via `Vec::remove`), rebuild all subsequent
    /// indices, and rebuild the busyness vector if the source was
    /// `enabled_processes`.
    fn remove_process_from_list(&mut self, tag: ListTag, index: usize) -> Process {
        let list = self.list_mut(tag);
        let mut process = list.remove(index);
        for (i, p) in list.iter_mut().enumerate().skip(index) {
            p.index = i as i64;
        }
        process.index = NO_INDEX;
        if tag == ListTag::Enabled {
            self.rebuild_busyness();
        }
        process
    }

    /// Ported from `addProcessToList`: push to the back, stamp the new
    /// index, tag `enabled` per destination, and push a busyness entry if
    /// the destination is `enabled_processes`.
    fn add_process_to_list(&mut self, tag: ListTag, mut process: Process) -> usize {
        process.enabled = match tag {
            ListTag::Enabled => Enabled::Enabled,
            ListTag::Disabling => Enabled::Disabling,
            ListTag::Disabled => Enabled::Disabled,
            ListTag::Detached => Enabled::Detached,
        };
        let busyness = process.busyness();
        let list = self.list_mut(tag);
        list.push(process);
        let idx = list.len() - 1;
        list[idx].index = idx as i64;
        if tag == ListTag::Enabled {
            self.enabled_busyness.push(busyness);
        }
        idx
    }

    fn rebuild_busyness(&mut self) {
        self.enabled_busyness = self.enabled_processes.iter().map(|p| p.busyness()).collect();
    }

    /// §4.2 `get`: the central operation's decision tree.
    pub fn get(&mut self, sticky_id: Option<u32>) -> GetOutcome {
        if self.life_status != GroupLifeStatus::Alive {
            return GetOutcome::Rejected(PoolError::GroupShuttingDown {
                group: self.key.to_string(),
            });
        }
        if self.restarting {
            let id = self.get_waitlist.push(GetWaiter { sticky_id });
            return GetOutcome::Waiting(id);
        }

        match selection::select(&self.enabled_processes, sticky_id) {
            Selection::Found(idx) => GetOutcome::Immediate(idx),
            Selection::StickyBusy => {
                let id = self.get_waitlist.push(GetWaiter { sticky_id });
                GetOutcome::Waiting(id)
            }
            Selection::None => {
                if self.process_count() < self.max_processes && !self.spawning {
                    let id = self.get_waitlist.push(GetWaiter { sticky_id });
                    GetOutcome::NeedsSpawn(id)
                } else if self.spawning {
                    let id = self.get_waitlist.push(GetWaiter { sticky_id });
                    GetOutcome::SpawnAlreadyInFlight(id)
                } else if self.max_request_queue_size > 0
                    && self.get_waitlist.len() >= self.max_request_queue_size
                {
                    GetOutcome::QueueFull
                } else {
                    let id = self.get_waitlist.push(GetWaiter { sticky_id });
                    GetOutcome::Waiting(id)
                }
            }
        }
    }

    /// Completes a `GetOutcome::Immediate(idx)` decision: checks out a
    /// session on the selected process and returns where to connect.
    pub fn checkout_immediate(&mut self, idx: usize) -> Result<ServedWaiter, PoolError> {
        let process = self
            .enabled_processes
            .get_mut(idx)
            .ok_or_else(|| PoolError::internal("checkout_immediate: index out of range"))?;
        let socket_index = process.new_session()?;
        self.enabled_busyness[idx] = process.busyness();
        Ok(ServedWaiter {
            id: 0,
            process_id: process.id.clone(),
            socket_index,
            address: process.sockets[socket_index].address.clone(),
        })
    }

    /// Drops a queued waiter, e.g. because its deadline elapsed. Returns
    /// `true` if it was still queued (and so needed a timeout reply at all).
    pub fn cancel_waiter(&mut self, id: u64) -> bool {
        self.get_waitlist.remove(id).is_some()
    }

    /// §4.2.2: at most one spawn in flight per Group.
    pub fn begin_spawn(&mut self) -> bool {
        if self.spawning {
            return false;
        }
        self.spawning = true;
        self.processes_being_spawned += 1;
        true
    }

    /// §4.2 `attach`: insert the new process, assign it a sticky id, and
    /// serve as many queued waiters as possible.
    pub fn spawn_succeeded(&mut self, mut process: Process) -> Vec<ServedWaiter> {
        self.processes_being_spawned = self.processes_being_spawned.saturating_sub(1);
        self.spawning = false;
        self.consecutive_spawn_failures = 0;
        self.last_spawn_error = None;

        process.sticky_session_id = Some(self.fresh_sticky_id());
        self.add_process_to_list(ListTag::Enabled, process);
        self.try_serve_waitlist()
    }

    fn fresh_sticky_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: u32 = rng.gen_range(1..=u32::MAX);
            if !self
                .enabled_processes
                .iter()
                .any(|p| p.sticky_session_id == Some(candidate))
            {
                return candidate;
            }
        }
    }

    /// §4.2.2 spawn failure policy: up to `max_consecutive_spawn_failures`
    /// retries with backoff, then fail every current waiter.
    pub fn spawn_failed(&mut self, error: SpawnError) -> SpawnFailureOutcome {
        self.processes_being_spawned = self.processes_being_spawned.saturating_sub(1);
        self.spawning = false;
        self.consecutive_spawn_failures += 1;
        self.last_spawn_error = Some(error.clone());

        if self.consecutive_spawn_failures >= self.max_consecutive_spawn_failures {
            self.consecutive_spawn_failures = 0;
            let mut ids = Vec::new();
            let mut waiters = Vec::new();
            while let Some(w) = self.get_waitlist.pop_front() {
                ids.push(w.id);
                waiters.push(w.payload);
            }
            SpawnFailureOutcome::FailAll { waiters, waiter_ids: ids, error }
        } else {
            let attempt = self.consecutive_spawn_failures;
            let backoff = self.spawn_retry_backoff_base * 2u32.pow(attempt.saturating_sub(1));
            SpawnFailureOutcome::RetryWithBackoff { attempt, backoff }
        }
    }

    /// Serves queued waiters in FIFO order against whatever capacity
    /// currently exists in `enabled_processes`. Called after attach and
    /// after any session close that frees capacity (§4.2 `attach`, §5
    /// ordering guarantees).
    fn try_serve_waitlist(&mut self) -> Vec<ServedWaiter> {
        let mut served = Vec::new();
        loop {
            let sticky_id = match self.get_waitlist.peek_front() {
                Some(w) => w.payload.sticky_id,
                None => break,
            };
            match selection::select(&self.enabled_processes, sticky_id) {
                Selection::Found(idx) => {
                    let waiter = self
                        .get_waitlist
                        .pop_front()
                        .expect("peeked waiter must still be present");
                    let process = &mut self.enabled_processes[idx];
                    // select() only returns Found for non-totally-busy
                    // processes; a failure here is an invariant violation.
                    let socket_index = process
                        .new_session()
                        .unwrap_or_else(|e| panic!("invariant violation in try_serve_waitlist: {e}"));
                    self.enabled_busyness[idx] = process.busyness();
                    served.push(ServedWaiter {
                        id: waiter.id,
                        process_id: process.id.clone(),
                        socket_index,
                        address: process.sockets[socket_index].address.clone(),
                    });
                }
                Selection::StickyBusy | Selection::None => break,
            }
        }
        served
    }

    /// §4.1 `close_session`, called by the actor when a Session notifies
    /// it has closed.
    pub fn close_session(&mut self, process_id: &ProcessId, socket_index: usize) -> CloseOutcome {
        let mut should_detach = false;
        if let Some((ListTag::Enabled, idx)) = self.locate(process_id) {
            let recycle = self.enabled_processes[idx].close_session(socket_index);
            self.enabled_busyness[idx] = self.enabled_processes[idx].busyness();
            should_detach = recycle;
        } else if let Some((tag, idx)) = self.locate(process_id) {
            // disabling/disabled/detached processes keep draining; no
            // busyness vector to maintain outside `enabled_processes`.
            let _ = self.list_mut(tag)[idx].close_session(socket_index);
        }
        let served = self.try_serve_waitlist();
        CloseOutcome { should_detach, served }
    }

    /// §4.2 `detach`: move to `detached_processes`. The caller is
    /// responsible for then awaiting `Process::shutdown` on it (kept out
    /// of this synchronous method, see §5 "post-lock actions").
    pub fn detach(&mut self, process_id: &ProcessId) -> bool {
        if let Some((tag, idx)) = self.locate(process_id) {
            if tag != ListTag::Detached {
                let process = self.remove_process_from_list(tag, idx);
                self.add_process_to_list(ListTag::Detached, process);
                return true;
            }
        }
        false
    }

    pub fn process_mut(&mut self, process_id: &ProcessId) -> Option<&mut Process> {
        let (tag, idx) = self.locate(process_id)?;
        Some(&mut self.list_mut(tag)[idx])
    }

    /// Removes a fully-drained detached process (life_status == Dead) so
    /// it can be dropped for good.
    pub fn reap_detached(&mut self) -> Vec<Process> {
        let mut reaped = Vec::new();
        let mut i = 0;
        while i < self.detached_processes.len() {
            if self.detached_processes[i].life_status == crate::pool::process::LifeStatus::Dead {
                reaped.push(self.remove_process_from_list(ListTag::Detached, i));
            } else {
                i += 1;
            }
        }
        reaped
    }

    pub fn enable(&mut self, process_id: &ProcessId) -> Vec<ServedWaiter> {
        if let Some((tag, idx)) = self.locate(process_id) {
            if tag == ListTag::Disabling || tag == ListTag::Disabled {
                let process = self.remove_process_from_list(tag, idx);
                self.add_process_to_list(ListTag::Enabled, process);
                return self.try_serve_waitlist();
            }
        }
        Vec::new()
    }

    pub fn disable(&mut self, process_id: &ProcessId) -> bool {
        if let Some((ListTag::Enabled, idx)) = self.locate(process_id) {
            let process = self.remove_process_from_list(ListTag::Enabled, idx);
            self.add_process_to_list(ListTag::Disabling, process);
            return true;
        }
        false
    }

    /// §4.2.3 restart: move everyone to `detached_processes` (they keep
    /// draining existing sessions) and swap in the new persisted options.
    pub fn begin_restart(&mut self, new_options: Options) -> Vec<ProcessId> {
        self.restarting = true;
        self.options = new_options.into_group_options();
        let mut moved = Vec::new();
        for tag in [ListTag::Enabled, ListTag::Disabling, ListTag::Disabled] {
            while !self.list(tag).is_empty() {
                let process = self.remove_process_from_list(tag, 0);
                let id = process.id.clone();
                self.add_process_to_list(ListTag::Detached, process);
                moved.push(id);
            }
        }
        moved
    }

    pub fn finish_restart_if_ready(&mut self) {
        if self.restarting && !self.enabled_processes.is_empty() {
            self.restarting = false;
        }
    }

    pub fn begin_shutdown(&mut self) -> Vec<ProcessId> {
        self.life_status = GroupLifeStatus::ShuttingDown;
        let mut moved = Vec::new();
        for tag in [ListTag::Enabled, ListTag::Disabling, ListTag::Disabled] {
            while !self.list(tag).is_empty() {
                let process = self.remove_process_from_list(tag, 0);
                let id = process.id.clone();
                self.add_process_to_list(ListTag::Detached, process);
                moved.push(id);
            }
        }
        moved
    }

    pub fn is_empty_and_idle(&self) -> bool {
        self.enabled_processes.is_empty()
            && self.disabling_processes.is_empty()
            && self.disabled_processes.is_empty()
            && self.detached_processes.is_empty()
            && self.get_waitlist.is_empty()
            && !self.spawning
    }

    /// §8 invariant check, exposed for property-based tests.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        assert_eq!(self.enabled_processes.len(), self.enabled_busyness.len());
        for (i, p) in self.enabled_processes.iter().enumerate() {
            assert_eq!(p.index, i as i64, "enabled process index mismatch");
            assert_eq!(self.enabled_busyness[i], p.busyness());
        }
        for (i, p) in self.disabling_processes.iter().enumerate() {
            assert_eq!(p.index, i as i64);
        }
        for (i, p) in self.disabled_processes.iter().enumerate() {
            assert_eq!(p.index, i as i64);
        }
        for (i, p) in self.detached_processes.iter().enumerate() {
            assert_eq!(p.index, i as i64);
        }
        assert!(self.process_count() <= self.max_processes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::process::LifeStatus;
    use crate::pool::socket::{Protocol, Socket};
    use crate::types::{GupId, SocketName};

    fn opts() -> Options {
        serde_json::from_value(serde_json::json!({
            "app_root": "/srv/app",
            "app_type": "rack"
        }))
        .unwrap()
    }

    fn group(max_processes: usize, max_queue: usize) -> Group {
        Group::new(
            GroupKey::from_string("g1"),
            opts(),
            0,
            max_processes,
            max_queue,
            3,
            Duration::from_millis(1),
        )
    }

    fn process_with_concurrency(concurrency: u32) -> Process {
        let socket = Socket::new(
            SocketName::from_string("main"),
            "unix:/tmp/x.sock".to_string(),
            Protocol::Http,
            concurrency,
        );
        Process::new(
            GroupKey::from_string("g1"),
            1,
            GupId::new(),
            vec![socket],
            None,
            Utc::now(),
            0,
        )
    }

    #[test]
    fn first_get_on_empty_group_triggers_spawn() {
        let mut g = group(2, 1);
        match g.get(None) {
            GetOutcome::NeedsSpawn(_) => {}
            _ => panic!("expected NeedsSpawn"),
        }
        g.check_invariants();
    }

    #[test]
    fn scenario_s1_spawn_then_serve() {
        let mut g = group(2, 1);
        let outcome = g.get(None);
        let waiter_id = match outcome {
            GetOutcome::NeedsSpawn(id) => id,
            _ => panic!("expected NeedsSpawn"),
        };
        assert!(g.begin_spawn());
        let process = process_with_concurrency(1);
        let served = g.spawn_succeeded(process);
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].id, waiter_id);
        assert_eq!(g.enabled_count(), 1);
        assert_eq!(g.get_waitlist_len(), 0);
        g.check_invariants();
    }

    #[test]
    fn scenario_s2_second_get_spawns_second_process() {
        let mut g = group(2, 1);
        g.get(None);
        g.begin_spawn();
        g.spawn_succeeded(process_with_concurrency(1));

        match g.get(None) {
            GetOutcome::NeedsSpawn(_) => {}
            _ => panic!("expected NeedsSpawn, got different outcome"),
        }
        g.begin_spawn();
        let served = g.spawn_succeeded(process_with_concurrency(1));
        assert_eq!(served.len(), 1);
        assert_eq!(g.enabled_count(), 2);
        g.check_invariants();
    }

    #[test]
    fn scenario_s3_queue_full_rejects_excess_waiters() {
        let mut g = group(2, 1);
        g.get(None);
        g.begin_spawn();
        g.spawn_succeeded(process_with_concurrency(1));
        g.get(None);
        g.begin_spawn();
        g.spawn_succeeded(process_with_concurrency(1));

        // both processes now totally busy (concurrency=1 each, one session apiece)
        match g.get(None) {
            GetOutcome::Waiting(_) => {}
            _ => panic!("expected Waiting"),
        }
        match g.get(None) {
            GetOutcome::QueueFull => {}
            _ => panic!("expected QueueFull"),
        }
        g.check_invariants();
    }

    #[test]
    fn scenario_s4_close_serves_earliest_waiter() {
        let mut g = group(2, 1);
        g.get(None);
        g.begin_spawn();
        g.spawn_succeeded(process_with_concurrency(1));
        g.get(None);
        g.begin_spawn();
        g.spawn_succeeded(process_with_concurrency(1));
        let waiting_id = match g.get(None) {
            GetOutcome::Waiting(id) => id,
            _ => panic!("expected Waiting"),
        };

        let p1_id = g.enabled_processes()[0].id.clone();
        let outcome = g.close_session(&p1_id, 0);
        assert_eq!(outcome.served.len(), 1);
        assert_eq!(outcome.served[0].id, waiting_id);
        g.check_invariants();
    }

    #[test]
    fn scenario_s5_three_failures_then_fail_all_and_reset() {
        let mut g = group(2, 1);
        g.get(None);
        for attempt in 1..=3u32 {
            assert!(g.begin_spawn());
            let outcome = g.spawn_failed(SpawnError::new(
                crate::types::SpawnErrorCategory::HandshakeTimeout,
                "boom",
            ));
            if attempt < 3 {
                assert!(matches!(outcome, SpawnFailureOutcome::RetryWithBackoff { .. }));
            } else {
                match outcome {
                    SpawnFailureOutcome::FailAll { waiters, .. } => assert_eq!(waiters.len(), 1),
                    _ => panic!("expected FailAll on third failure"),
                }
            }
        }
        assert_eq!(g.get_waitlist_len(), 0);

        // a fresh get() after the waitlist emptied gets its own 3 attempts
        match g.get(None) {
            GetOutcome::NeedsSpawn(_) => {}
            _ => panic!("expected a fresh spawn attempt"),
        }
        g.check_invariants();
    }

    #[test]
    fn scenario_s6_detach_group_moves_everyone_to_detached() {
        let mut g = group(2, 1);
        g.get(None);
        g.begin_spawn();
        g.spawn_succeeded(process_with_concurrency(1));
        let moved = g.begin_shutdown();
        assert_eq!(moved.len(), 1);
        assert_eq!(g.enabled_count(), 0);
        assert_eq!(g.detached_count(), 1);
        g.check_invariants();
    }

    #[test]
    fn sticky_session_returns_same_process() {
        let mut g = group(2, 1);
        g.get(None);
        g.begin_spawn();
        g.spawn_succeeded(process_with_concurrency(3));
        let sticky = g.enabled_processes()[0].sticky_session_id.unwrap();

        match g.get(Some(sticky)) {
            GetOutcome::Immediate(idx) => assert_eq!(idx, 0),
            _ => panic!("expected immediate sticky hit"),
        }
    }

    #[test]
    fn reap_detached_removes_only_dead_processes() {
        let mut g = group(2, 1);
        g.get(None);
        g.begin_spawn();
        g.spawn_succeeded(process_with_concurrency(1));
        g.begin_shutdown();
        assert_eq!(g.detached_count(), 1);
        // shutdown() hasn't run yet (that's async, driven by the actor), so
        // life_status is still Alive and it must not be reaped prematurely.
        assert!(g.reap_detached().is_empty());

        g.detached_processes_mut_for_test()[0].life_status = LifeStatus::Dead;
        let reaped = g.reap_detached();
        assert_eq!(reaped.len(), 1);
        assert_eq!(g.detached_count(), 0);
    }

    #[tokio::test]
    async fn exited_process_ids_finds_a_process_whose_admin_channel_closed() {
        use crate::pool::process::AdminChannel;
        use tokio::net::UnixStream;

        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let stream = UnixStream::from_std(ours).unwrap();

        let socket = Socket::new(
            SocketName::from_string("main"),
            "unix:/tmp/x.sock".to_string(),
            Protocol::Http,
            1,
        );
        let process = Process::new(
            GroupKey::from_string("g1"),
            1,
            GupId::new(),
            vec![socket],
            Some(AdminChannel::Stream(stream)),
            Utc::now(),
            0,
        );

        let mut g = group(2, 1);
        g.get(None);
        g.begin_spawn();
        g.spawn_succeeded(process);
        assert!(g.exited_process_ids().is_empty());

        drop(theirs);
        let exited = g.exited_process_ids();
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0], g.enabled_processes()[0].id);
    }

    impl Group {
        #[cfg(test)]
        fn detached_processes_mut_for_test(&mut self) -> &mut Vec<Process> {
            &mut self.detached_processes
        }
    }
}
