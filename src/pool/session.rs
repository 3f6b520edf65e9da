//! Session (§4.5): a one-shot handle to a checked-out Process socket.
//!
//! Implemented as the slab/arena alternative §9 sanctions instead of a
//! literal `Arc<Process>` back-pointer: a Session is just stable ids plus a
//! channel back to the actor that owns all Process state. The actor's own
//! session counters, not Rust's reference count, decide when a detached
//! process with no sessions left is finally dropped.

use crate::spawner::handshake;
use crate::types::{GroupKey, PoolError, ProcessId, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// Sent back to the pool actor when a Session is closed, so the owning
/// Process's accounting can be updated (§4.1 `close_session`).
#[derive(Debug)]
pub struct SessionClosed {
    pub group_key: GroupKey,
    pub process_id: ProcessId,
    pub socket_index: usize,
}

#[derive(Debug)]
pub struct Session {
    group_key: GroupKey,
    process_id: ProcessId,
    socket_index: usize,
    address: String,
    close_tx: mpsc::UnboundedSender<SessionClosed>,
    connection: Option<UnixStream>,
    closed: bool,
}

impl Session {
    pub fn new(
        group_key: GroupKey,
        process_id: ProcessId,
        socket_index: usize,
        address: String,
        close_tx: mpsc::UnboundedSender<SessionClosed>,
    ) -> Self {
        Self {
            group_key,
            process_id,
            socket_index,
            address,
            close_tx,
            connection: None,
            closed: false,
        }
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    pub fn group_key(&self) -> &GroupKey {
        &self.group_key
    }

    /// Opens the connection to the chosen socket. Separate from checkout so
    /// the caller can release the Group's state access across the connect
    /// (§4.1 `initiate`). The address carries this crate's `unix:` scheme
    /// prefix, which `UnixStream::connect` does not understand on its own.
    ///
    /// If the process exited between session allocation and this call, the
    /// connect fails; one retry is attempted before giving up, per §7's
    /// `ProcessDied` policy.
    pub async fn initiate(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let path = handshake::socket_path(&self.address);
        let stream = match UnixStream::connect(path).await {
            Ok(stream) => stream,
            Err(_) => UnixStream::connect(path)
                .await
                .map_err(|_| PoolError::ProcessDied)?,
        };
        self.connection = Some(stream);
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let conn = self.connection.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "session not initiated")
        })?;
        conn.write_all(buf).await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let conn = self.connection.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "session not initiated")
        })?;
        conn.read(buf).await
    }

    /// Must be called exactly once; subsequent calls are no-ops (§4.5).
    pub fn close(&mut self, _success: bool, _keep_alive: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connection = None;
        let _ = self.close_tx.send(SessionClosed {
            group_key: self.group_key.clone(),
            process_id: self.process_id.clone(),
            socket_index: self.socket_index,
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close(false, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn initiate_strips_the_unix_scheme_prefix_and_connects() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("session.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(
            GroupKey::from_string("g1"),
            ProcessId::new(),
            0,
            format!("unix:{}", sock_path.display()),
            tx,
        );
        session.initiate().await.unwrap();
        assert!(session.connection.is_some());
    }

    #[tokio::test]
    async fn initiate_against_a_dead_process_surfaces_process_died() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(
            GroupKey::from_string("g1"),
            ProcessId::new(),
            0,
            "unix:/tmp/apppool-core-test-nonexistent.sock".to_string(),
            tx,
        );
        let err = session.initiate().await.unwrap_err();
        assert!(matches!(err, PoolError::ProcessDied));
    }

    #[tokio::test]
    async fn closing_sends_exactly_one_notification() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(
            GroupKey::from_string("g1"),
            ProcessId::new(),
            0,
            "unix:/tmp/nonexistent.sock".to_string(),
            tx,
        );
        session.close(true, false);
        session.close(true, false);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.socket_index, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_without_explicit_close_still_notifies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let _session = Session::new(
                GroupKey::from_string("g1"),
                ProcessId::new(),
                2,
                "unix:/tmp/nonexistent.sock".to_string(),
                tx,
            );
        }
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.socket_index, 2);
    }
}
