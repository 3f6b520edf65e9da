//! Smart spawner (§4.4.2): one long-lived preloader per Group, forked
//! internally to produce request-workers on demand.

use crate::options::Options;
use crate::pool::process::{AdminChannel, Process};
use crate::spawner::direct;
use crate::spawner::handshake::{self, HandshakeInfo};
use crate::types::{GroupKey, GupId, SpawnError, SpawnErrorCategory};
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::time::timeout;

struct PreloaderHandle {
    child: Child,
    command_address: String,
    last_spawn_at: Instant,
}

/// Per-Group state for the smart spawner. Owned by the actor alongside
/// the Group it serves (one preloader per Group, §4.4.2).
#[derive(Default)]
pub struct SmartSpawner {
    preloader: Option<PreloaderHandle>,
}

impl SmartSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_preloader(&self) -> bool {
        self.preloader.is_some()
    }

    /// §4.4.2 step 4: shut an idle preloader down on the admin channel.
    pub async fn shutdown_if_idle(&mut self, max_idle: Duration) {
        let Some(handle) = &mut self.preloader else {
            return;
        };
        if handle.last_spawn_at.elapsed() < max_idle {
            return;
        }
        if let Some(stdin) = handle.child.stdin.as_mut() {
            let _ = stdin.write_all(b"exit\n").await;
            let _ = stdin.flush().await;
        }
        let _ = handle.child.kill().await;
        self.preloader = None;
    }

    async fn start_preloader(&mut self, options: &Options) -> Result<(), SpawnError> {
        // The preloader is started with the same fork/exec machinery as a
        // direct spawn; its handshake declares `!preloader=1` and a
        // command-channel address instead of request-serving sockets.
        let (child, info) = direct::spawn_raw(options).await?;
        let command_address = info.preloader_command_address.ok_or_else(|| {
            SpawnError::new(
                SpawnErrorCategory::HandshakeParse,
                "preloader handshake missing command address",
            )
        })?;
        self.preloader = Some(PreloaderHandle {
            child,
            command_address,
            last_spawn_at: Instant::now(),
        });
        Ok(())
    }

    fn encode_options_block(options: &Options) -> String {
        let mut out = String::new();
        out.push_str(&format!("app_root={}\n", options.app_root));
        out.push_str(&format!("app_type={}\n", options.app_type));
        out.push_str(&format!("environment={}\n", options.environment));
        out
    }

    async fn request_worker(
        command_address: &str,
        options: &Options,
        deadline: Duration,
    ) -> Result<HandshakeInfo, SpawnError> {
        let connect = async {
            let mut stream = UnixStream::connect(handshake::socket_path(command_address))
                .await
                .map_err(|e| SpawnError::new(SpawnErrorCategory::Fork, e.to_string()))?;
            let request = format!("spawn\n{}\n", Self::encode_options_block(options));
            stream
                .write_all(request.as_bytes())
                .await
                .map_err(|e| SpawnError::new(SpawnErrorCategory::Fork, e.to_string()))?;

            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| SpawnError::new(SpawnErrorCategory::HandshakeParse, e.to_string()))?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(2).any(|w| w == b"\0\0") {
                    break;
                }
            }
            Ok::<Vec<u8>, SpawnError>(buf)
        };

        let buf = timeout(deadline, connect).await.map_err(|_| {
            SpawnError::new(
                SpawnErrorCategory::HandshakeTimeout,
                format!("preloader did not respond within {deadline:?}"),
            )
        })??;

        let text = String::from_utf8_lossy(&buf);
        let body = text
            .strip_prefix("OK\n")
            .ok_or_else(|| {
                let message = text
                    .strip_prefix("error\n")
                    .unwrap_or(&text)
                    .trim()
                    .to_string();
                SpawnError::new(SpawnErrorCategory::AppCrash, message)
            })?;
        handshake::parse_handshake(body)
            .map_err(|e| SpawnError::new(SpawnErrorCategory::HandshakeParse, e))
    }

    /// §4.4.2: start the preloader on first use, then fork a worker from
    /// it for every subsequent call. §4.4.2 step 3: if the command channel
    /// has gone stale, discard the preloader and restart it once.
    pub async fn spawn(
        &mut self,
        group_key: &GroupKey,
        options: &Options,
    ) -> Result<Process, SpawnError> {
        let spawn_start = Utc::now();
        let deadline = options
            .start_timeout()
            .unwrap_or_else(|| Duration::from_secs(5));

        if self.preloader.is_none() {
            self.start_preloader(options).await?;
        }

        let command_address = self
            .preloader
            .as_ref()
            .map(|h| h.command_address.clone())
            .expect("preloader was just started");

        let result = Self::request_worker(&command_address, options, deadline).await;
        let info = match result {
            Ok(info) => info,
            Err(_) => {
                // Preloader's command channel is stale; restart once and
                // retry. A second failure is surfaced to the caller.
                self.preloader = None;
                self.start_preloader(options).await?;
                let command_address = self
                    .preloader
                    .as_ref()
                    .map(|h| h.command_address.clone())
                    .expect("preloader was just restarted");
                Self::request_worker(&command_address, options, deadline).await?
            }
        };

        if let Some(handle) = self.preloader.as_mut() {
            handle.last_spawn_at = Instant::now();
        }

        let os_pid = info.pid.unwrap_or(0);
        let gupid = info
            .gupid
            .clone()
            .map(GupId::from_string)
            .unwrap_or_else(GupId::new);

        // The worker is a fresh OS process the preloader forked internally;
        // this spawner's parent never holds its file descriptors, so there
        // is no `Child` handle to keep here (§4.4.2 step 2). It declares its
        // own admin-channel address in the handshake instead (§6 "the
        // socket stays open as a liveness indicator"); connect back to it
        // now so `shutdown`/`trigger_oob_work`/`kill` have somewhere to act.
        let admin_address = info.admin_address.ok_or_else(|| {
            SpawnError::new(
                SpawnErrorCategory::HandshakeParse,
                "worker handshake missing !admin_address",
            )
        })?;
        let admin_stream = UnixStream::connect(handshake::socket_path(&admin_address))
            .await
            .map_err(|e| SpawnError::new(SpawnErrorCategory::Fork, e.to_string()))?;

        Ok(Process::new(
            group_key.clone(),
            os_pid,
            gupid,
            info.sockets,
            Some(AdminChannel::Stream(admin_stream)),
            spawn_start,
            options.max_requests.unwrap_or(0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::net::UnixListener;

    fn options() -> Options {
        Options {
            app_root: "/srv/app".to_string(),
            app_type: "rack".to_string(),
            environment: "production".to_string(),
            interpreter: None,
            spawn_method: crate::options::SpawnMethod::Smart,
            min_processes: None,
            max_processes: None,
            max_requests: None,
            start_timeout_msec: None,
            max_idle_time_secs: None,
            max_preloader_idle_time_secs: None,
            concurrency_model: crate::options::ConcurrencyModel::Process,
            process_concurrency: None,
            user: None,
            group: None,
            sticky_session_cookie: None,
            environment_variables: HashMap::new(),
            group_name_override: None,
            sticky_session_id: None,
        }
    }

    #[test]
    fn options_block_encodes_identity_fields() {
        let block = SmartSpawner::encode_options_block(&options());
        assert!(block.contains("app_root=/srv/app"));
        assert!(block.contains("app_type=rack"));
    }

    #[test]
    fn fresh_spawner_has_no_preloader() {
        let spawner = SmartSpawner::new();
        assert!(!spawner.has_preloader());
    }

    #[tokio::test]
    async fn request_worker_strips_the_unix_scheme_prefix_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("preloader.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        let gupid = GupId::new();
        let response = format!(
            "OK\n{}",
            handshake::encode_handshake(
                4321,
                &gupid,
                &[("main", "unix:/tmp/worker.sock", "http", 1)],
                Some("unix:/tmp/worker-admin.sock"),
            )
        );
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response.as_bytes()).await;
        });

        let command_address = format!("unix:{}", sock_path.display());
        let info = SmartSpawner::request_worker(&command_address, &options(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(info.pid, Some(4321));
        assert_eq!(info.admin_address.as_deref(), Some("unix:/tmp/worker-admin.sock"));
    }
}
