//! Process-facing control surface (§6.1 supplement): a line-oriented TCP
//! listener for `inspect`, `detach_group <name>`, and `get <options-json>`.
//!
//! Intentionally not the admin gRPC/msgpack API the original implementation
//! carries -- that is out of scope (§1 Non-goals). The accept-loop shape
//! (semaphore-bounded connections, one task per connection, shared
//! cancellation token) is ported from the teacher's `ipc::server::IpcServer`.

use crate::options::Options;
use crate::pool::PoolHandle;
use crate::types::config::ControlConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub struct ControlServer {
    pool: PoolHandle,
    addr: SocketAddr,
    max_connections: usize,
    cancel: CancellationToken,
}

impl ControlServer {
    pub fn new(pool: PoolHandle, config: &ControlConfig) -> std::io::Result<Self> {
        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
        Ok(Self {
            pool,
            addr,
            max_connections: config.max_connections,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        tracing::info!("control surface listening on {}", self.addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("control surface shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!("control connection from {} rejected: at max_connections", peer);
                            drop(stream);
                            continue;
                        }
                    };
                    let pool = self.pool.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_connection(stream, pool).await {
                            tracing::warn!("control connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, pool: PoolHandle) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let response = dispatch_line(&pool, &line).await;
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn dispatch_line(pool: &PoolHandle, line: &str) -> String {
    let line = line.trim();
    if line == "inspect" {
        match pool.inspect_state().await {
            Ok(value) => format!("{value}\n"),
            Err(e) => format!("error: {e}\n"),
        }
    } else if let Some(name) = line.strip_prefix("detach_group ") {
        match pool.detach_group_by_name(name.trim()).await {
            Ok(true) => "ok\n".to_string(),
            Ok(false) => "not_found\n".to_string(),
            Err(e) => format!("error: {e}\n"),
        }
    } else if let Some(json) = line.strip_prefix("get ") {
        match serde_json::from_str::<Options>(json.trim()) {
            Ok(options) => match pool.async_get(options).await {
                Ok(mut session) => match session.initiate().await {
                    Ok(()) => format!("ok {}\n", session.process_id()),
                    Err(e) => format!("error: {e}\n"),
                },
                Err(e) => format!("error: {e}\n"),
            },
            Err(e) => format!("error: invalid options json: {e}\n"),
        }
    } else {
        "error: unknown command\n".to_string()
    }
}
