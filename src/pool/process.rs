//! Process (C2): one live application subprocess, owning its Sockets and
//! lifecycle state (§3 Process, §4.1).

use crate::pool::socket::Socket;
use crate::types::{GroupKey, GupId, PoolError, ProcessId, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::process::Child;

/// Selectability tag. Only `Enabled` processes are candidates for new
/// sessions; the other three values say which of the Group's four lists
/// currently owns this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enabled {
    Enabled,
    Disabling,
    Disabled,
    Detached,
}

/// Life-status axis, orthogonal to `Enabled` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeStatus {
    Alive,
    ShuttingDown,
    Dead,
}

/// Sentinel for "not currently in any list" (§3 "`-1` if it is in transit").
pub const NO_INDEX: i64 = -1;

/// The admin channel a Process is told to shut down / do out-of-band work
/// on (§6). `Direct`-spawned processes are real `Child`s this crate forked
/// itself, so their own stdin is the channel; `Smart`-spawned workers are
/// forked internally by a preloader this crate never holds a `Child`
/// handle for, so a `Stream` is opened back to the admin address their own
/// handshake declares (§6 "the socket stays open as a liveness
/// indicator"). `None` only for spawners with no real OS process at all
/// (the dummy spawner used in tests).
#[derive(Debug)]
pub enum AdminChannel {
    Child(Child),
    Stream(UnixStream),
}

impl AdminChannel {
    async fn send_line(&mut self, line: &[u8]) -> bool {
        match self {
            AdminChannel::Child(child) => {
                let Some(stdin) = child.stdin.as_mut() else {
                    return false;
                };
                if stdin.write_all(line).await.is_err() {
                    return false;
                }
                let _ = stdin.flush().await;
                true
            }
            AdminChannel::Stream(stream) => {
                if stream.write_all(line).await.is_err() {
                    return false;
                }
                let _ = stream.flush().await;
                true
            }
        }
    }

    /// Non-blocking liveness probe: `true` if the channel reports the
    /// process has already exited (§4.1 "detected by the supervisor via
    /// SIGCHLD or admin-channel EOF").
    fn has_exited(&mut self) -> bool {
        match self {
            AdminChannel::Child(child) => child.try_wait().ok().flatten().is_some(),
            AdminChannel::Stream(stream) => {
                let mut probe = [0u8; 1];
                match stream.try_read(&mut probe) {
                    Ok(0) => true,
                    Ok(_) => false,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
                    Err(_) => true,
                }
            }
        }
    }

    async fn kill(&mut self, os_pid: u32) {
        match self {
            AdminChannel::Child(child) => {
                let _ = child.kill().await;
            }
            AdminChannel::Stream(_) => {
                let pid = nix::unistd::Pid::from_raw(os_pid as i32);
                let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
    }
}

#[derive(Debug)]
pub struct Process {
    pub id: ProcessId,
    pub gupid: GupId,
    pub group_key: GroupKey,
    pub os_pid: u32,
    pub sockets: Vec<Socket>,
    pub enabled: Enabled,
    pub life_status: LifeStatus,
    pub index: i64,
    pub sticky_session_id: Option<u32>,
    pub spawn_start: DateTime<Utc>,
    pub spawn_end: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub processed_requests: u64,
    pub max_requests: u64,
    pub sessions: u32,
    /// Kept alive for the process's whole lifetime so `shutdown`/
    /// `trigger_oob_work`/`kill`/`has_exited` all have somewhere to act.
    admin: Option<AdminChannel>,
    oob_last_triggered: Option<DateTime<Utc>>,
}

impl Process {
    pub fn new(
        group_key: GroupKey,
        os_pid: u32,
        gupid: GupId,
        sockets: Vec<Socket>,
        admin: Option<AdminChannel>,
        spawn_start: DateTime<Utc>,
        max_requests: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProcessId::new(),
            gupid,
            group_key,
            os_pid,
            sockets,
            enabled: Enabled::Enabled,
            life_status: LifeStatus::Alive,
            index: NO_INDEX,
            sticky_session_id: None,
            spawn_start,
            spawn_end: now,
            last_used: now,
            processed_requests: 0,
            max_requests,
            sessions: 0,
            admin,
            oob_last_triggered: None,
        }
    }

    /// Sum of in-flight sessions across all sockets, biased so a totally
    /// busy process always sorts at least as high as one with the same
    /// raw session count but spare capacity (§4.1 `busyness`).
    pub fn busyness(&self) -> i64 {
        let raw: i64 = self.sockets.iter().map(|s| s.sessions as i64).sum();
        raw * 2 + if self.is_totally_busy() { 1 } else { 0 }
    }

    pub fn is_totally_busy(&self) -> bool {
        !self.sockets.is_empty() && self.sockets.iter().all(|s| s.is_at_capacity())
    }

    pub fn is_selectable(&self) -> bool {
        self.enabled == Enabled::Enabled && self.life_status == LifeStatus::Alive
    }

    /// Pick a socket for a new session: round-robin among sockets with
    /// spare capacity, ties broken by lowest current session count
    /// (§4.1 `new_session`).
    fn select_socket_index(&self) -> Option<usize> {
        self.sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_at_capacity())
            .min_by_key(|(_, s)| s.sessions)
            .map(|(i, _)| i)
    }

    /// Checks out a session slot, returning the chosen socket's index.
    /// Does not open the connection; see §4.5 `initiate` for why that is
    /// a separate step.
    pub fn new_session(&mut self) -> Result<usize> {
        if !self.is_selectable() {
            return Err(PoolError::internal(format!(
                "new_session called on non-selectable process {}",
                self.id
            )));
        }
        if self.is_totally_busy() {
            return Err(PoolError::internal(format!(
                "new_session called on totally busy process {}",
                self.id
            )));
        }
        let idx = self
            .select_socket_index()
            .ok_or_else(|| PoolError::internal("no socket with spare capacity".to_string()))?;
        self.sockets[idx].checkout();
        self.sessions += 1;
        self.last_used = Utc::now();
        Ok(idx)
    }

    /// Releases a session slot. Returns `true` if this process has now
    /// reached its request-recycling cap and should be detached by the
    /// owning Group (§4.1 `close_session`).
    pub fn close_session(&mut self, socket_index: usize) -> bool {
        if let Some(socket) = self.sockets.get_mut(socket_index) {
            socket.checkin();
        }
        self.sessions = self.sessions.saturating_sub(1);
        self.processed_requests += 1;
        self.last_used = Utc::now();

        let recycle_due_to_max_requests =
            self.max_requests > 0 && self.processed_requests >= self.max_requests;
        let recycle_due_to_shutdown_drain =
            self.life_status == LifeStatus::ShuttingDown && self.sessions == 0;
        if recycle_due_to_shutdown_drain {
            self.life_status = LifeStatus::Dead;
        }
        recycle_due_to_max_requests || recycle_due_to_shutdown_drain
    }

    /// Sends `exit\n` on the admin channel and begins the drain (§4.1
    /// `shutdown`, §6 admin channel protocol).
    pub async fn shutdown(&mut self) {
        if self.life_status != LifeStatus::Alive {
            return;
        }
        self.life_status = LifeStatus::ShuttingDown;
        if let Some(admin) = self.admin.as_mut() {
            admin.send_line(b"exit\n").await;
        }
        if self.sessions == 0 {
            self.life_status = LifeStatus::Dead;
        }
    }

    /// Sends `oob_work\n` to an idle, enabled process, subject to a
    /// cooldown so repeated GC sweeps don't re-fire it every cycle
    /// (§1.2 supplement, §4.1 `trigger_oob_work`).
    pub async fn trigger_oob_work(&mut self, cooldown: Duration) -> bool {
        if self.enabled != Enabled::Enabled
            || self.life_status != LifeStatus::Alive
            || self.sessions != 0
        {
            return false;
        }
        if let Some(last) = self.oob_last_triggered {
            if Utc::now().signed_duration_since(last)
                < chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero())
            {
                return false;
            }
        }
        if let Some(admin) = self.admin.as_mut() {
            if !admin.send_line(b"oob_work\n").await {
                return false;
            }
        }
        self.oob_last_triggered = Some(Utc::now());
        true
    }

    pub fn mark_dead(&mut self) {
        self.life_status = LifeStatus::Dead;
    }

    /// Non-blocking liveness check driven by the admin channel (§4.1
    /// "detected by the supervisor... and immediately detached"):
    /// `Some(true)` if the process has already exited, `Some(false)` if
    /// still alive, `None` if this Process has no admin channel at all
    /// (dummy spawner).
    pub fn has_exited(&mut self) -> Option<bool> {
        self.admin.as_mut().map(AdminChannel::has_exited)
    }

    pub async fn kill(&mut self) {
        let os_pid = self.os_pid;
        if let Some(admin) = self.admin.as_mut() {
            admin.kill(os_pid).await;
        }
        self.life_status = LifeStatus::Dead;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::socket::Protocol;
    use crate::types::SocketName;

    fn test_process(concurrency: u32) -> Process {
        let socket = Socket::new(
            SocketName::from_string("main"),
            "unix:/tmp/x.sock".to_string(),
            Protocol::Http,
            concurrency,
        );
        Process::new(
            GroupKey::from_string("g1"),
            123,
            GupId::new(),
            vec![socket],
            None,
            Utc::now(),
            0,
        )
    }

    #[test]
    fn new_process_starts_enabled_and_alive() {
        let p = test_process(1);
        assert!(p.is_selectable());
        assert_eq!(p.busyness(), 0);
    }

    #[test]
    fn new_session_increments_busyness() {
        let mut p = test_process(2);
        let idx = p.new_session().unwrap();
        assert_eq!(idx, 0);
        assert_eq!(p.sessions, 1);
        assert!(!p.is_totally_busy());
        p.new_session().unwrap();
        assert!(p.is_totally_busy());
    }

    #[test]
    fn new_session_fails_when_totally_busy() {
        let mut p = test_process(1);
        p.new_session().unwrap();
        assert!(p.new_session().is_err());
    }

    #[test]
    fn close_session_releases_capacity() {
        let mut p = test_process(1);
        let idx = p.new_session().unwrap();
        let should_detach = p.close_session(idx);
        assert!(!should_detach);
        assert_eq!(p.sessions, 0);
        assert!(!p.is_totally_busy());
    }

    #[test]
    fn close_session_signals_detach_at_max_requests() {
        let socket = Socket::new(
            SocketName::from_string("main"),
            "unix:/tmp/x.sock".to_string(),
            Protocol::Http,
            1,
        );
        let mut p = Process::new(
            GroupKey::from_string("g1"),
            1,
            GupId::new(),
            vec![socket],
            None,
            Utc::now(),
            1,
        );
        let idx = p.new_session().unwrap();
        assert!(p.close_session(idx));
    }

    #[tokio::test]
    async fn shutdown_without_admin_channel_marks_dead_when_idle() {
        let mut p = test_process(1);
        p.shutdown().await;
        assert_eq!(p.life_status, LifeStatus::Dead);
    }

    #[tokio::test]
    async fn shutdown_with_active_sessions_stays_shutting_down_until_drained() {
        let mut p = test_process(1);
        let idx = p.new_session().unwrap();
        p.shutdown().await;
        assert_eq!(p.life_status, LifeStatus::ShuttingDown);
        p.close_session(idx);
        assert_eq!(p.life_status, LifeStatus::Dead);
    }

    #[tokio::test]
    async fn has_exited_is_none_without_an_admin_channel() {
        let mut p = test_process(1);
        assert_eq!(p.has_exited(), None);
    }

    #[tokio::test]
    async fn has_exited_reports_true_once_the_admin_channel_peer_closes() {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let stream = UnixStream::from_std(ours).unwrap();

        let socket = Socket::new(
            SocketName::from_string("main"),
            "unix:/tmp/x.sock".to_string(),
            Protocol::Http,
            1,
        );
        let mut p = Process::new(
            GroupKey::from_string("g1"),
            123,
            GupId::new(),
            vec![socket],
            Some(AdminChannel::Stream(stream)),
            Utc::now(),
            0,
        );
        assert_eq!(p.has_exited(), Some(false));
        drop(theirs);
        assert_eq!(p.has_exited(), Some(true));
    }
}
