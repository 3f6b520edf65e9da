//! Direct spawner (§4.4.1): fork+exec a fresh loader process for every
//! spawn.
//!
//! Redesigned per `SPEC_FULL.md` §9 / `DESIGN.md`: the admin channel and
//! handshake pipe are collapsed onto the child's stdin/stdout instead of a
//! raw Unix-domain socketpair, grounded on the `other_examples` process
//! manager which drives children entirely through `tokio::process::Command`
//! handles. The wire content (the `key=value\0` block, `exit\n`/`oob_work\n`)
//! is unchanged.

use crate::options::Options;
use crate::pool::process::{AdminChannel, Process};
use crate::spawner::handshake::{self, HandshakeInfo};
use crate::types::{GroupKey, GupId, SpawnError, SpawnErrorCategory};
use chrono::Utc;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Maps an application type to its default loader script. A real
/// deployment would make this configurable; the set here covers the
/// identities named in the original implementation's type registry.
fn loader_for_app_type(app_type: &str) -> &'static str {
    match app_type {
        "rack" => "/usr/share/apppool/loaders/rack_loader.rb",
        "wsgi" => "/usr/share/apppool/loaders/wsgi_loader.py",
        "node" => "/usr/share/apppool/loaders/node_loader.js",
        _ => "/usr/share/apppool/loaders/generic_loader",
    }
}

fn build_command(options: &Options) -> Result<Command, SpawnError> {
    let interpreter = options
        .interpreter
        .clone()
        .unwrap_or_else(|| "/usr/bin/env".to_string());
    let loader = loader_for_app_type(&options.app_type);

    let mut cmd = Command::new(&interpreter);
    cmd.arg(loader);
    cmd.current_dir(&options.app_root);
    cmd.env_clear();
    cmd.env("HOME", "/nonexistent");
    cmd.env("APP_ROOT", &options.app_root);
    cmd.env("APP_ENV", &options.environment);
    for (k, v) in &options.environment_variables {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    if let Some(user) = &options.user {
        drop_privileges(&mut cmd, user, options.group.as_deref())?;
    }

    Ok(cmd)
}

/// Installs a `pre_exec` hook that drops privileges to the named user
/// (and, if given, group) before `exec`. Runs in the forked child after
/// `fork` and before `exec`, while the child is still single-threaded, so
/// calling `setuid`/`setgid` here is sound despite being outside the set
/// of functions POSIX calls async-signal-safe in general: no other thread
/// exists yet to race with.
fn drop_privileges(cmd: &mut Command, user: &str, group: Option<&str>) -> Result<(), SpawnError> {
    let uid = nix::unistd::User::from_name(user)
        .map_err(|e| SpawnError::new(SpawnErrorCategory::Preparation, e.to_string()))?
        .ok_or_else(|| {
            SpawnError::new(SpawnErrorCategory::Preparation, format!("unknown user {user}"))
        })?
        .uid;
    let gid = match group {
        Some(g) => nix::unistd::Group::from_name(g)
            .map_err(|e| SpawnError::new(SpawnErrorCategory::Preparation, e.to_string()))?
            .ok_or_else(|| {
                SpawnError::new(SpawnErrorCategory::Preparation, format!("unknown group {g}"))
            })?
            .gid,
        None => nix::unistd::Gid::from_raw(uid.as_raw()),
    };

    // SAFETY: `pre_exec` runs after `fork`, before `exec`, in a child that
    // has not yet spawned any threads. `setgid`/`setuid` are the only
    // syscalls performed here and neither allocates nor touches the
    // parent's memory.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setgid(gid).map_err(std::io::Error::from)?;
            nix::unistd::setuid(uid).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    Ok(())
}

async fn read_handshake(child: &mut Child, deadline: Duration) -> Result<HandshakeInfo, SpawnError> {
    let stdout = child.stdout.as_mut().ok_or_else(|| {
        SpawnError::new(SpawnErrorCategory::Preparation, "child stdout not piped")
    })?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let read_loop = async {
        loop {
            let n = stdout
                .read(&mut chunk)
                .await
                .map_err(|e| SpawnError::new(SpawnErrorCategory::HandshakeParse, e.to_string()))?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.ends_with(b"\0\0") || buf.windows(2).any(|w| w == b"\0\0") {
                break;
            }
        }
        Ok::<(), SpawnError>(())
    };

    match timeout(deadline, read_loop).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(SpawnError::new(
                SpawnErrorCategory::HandshakeTimeout,
                format!("no handshake within {deadline:?}"),
            )
            .with_last_step("waiting for handshake block"))
        }
    }

    let text = String::from_utf8_lossy(&buf).to_string();
    handshake::parse_handshake(&text)
        .map_err(|e| SpawnError::new(SpawnErrorCategory::HandshakeParse, e).with_last_step("parsing handshake block"))
}

async fn capture_stderr_tail(child: &mut Child) -> Option<String> {
    let stderr = child.stderr.as_mut()?;
    let mut buf = Vec::new();
    let _ = timeout(Duration::from_millis(200), stderr.read_to_end(&mut buf)).await;
    if buf.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&buf).to_string())
    }
}

/// Fork+exec and read back the handshake, without building a `Process`.
/// Shared by the direct spawner and, for starting the preloader itself, by
/// `spawner::smart`.
pub async fn spawn_raw(options: &Options) -> Result<(Child, HandshakeInfo), SpawnError> {
    let deadline = options
        .start_timeout()
        .unwrap_or_else(|| Duration::from_secs(5));

    let mut cmd = build_command(options)?;
    let mut child = cmd
        .spawn()
        .map_err(|e| SpawnError::new(SpawnErrorCategory::Fork, e.to_string()).with_last_step("fork/exec"))?;

    let handshake_result = read_handshake(&mut child, deadline).await;
    match handshake_result {
        Ok(info) => Ok((child, info)),
        Err(mut err) => {
            if let Some(stderr) = capture_stderr_tail(&mut child).await {
                err = err.with_stderr(stderr);
            }
            let _ = child.kill().await;
            Err(err)
        }
    }
}

pub async fn spawn(group_key: &GroupKey, options: &Options) -> Result<Process, SpawnError> {
    let spawn_start = Utc::now();
    let (child, info) = spawn_raw(options).await?;
    let os_pid = child.id().unwrap_or(0);

    let gupid = info
        .gupid
        .map(GupId::from_string)
        .unwrap_or_else(GupId::new);

    Ok(Process::new(
        group_key.clone(),
        os_pid,
        gupid,
        info.sockets,
        Some(AdminChannel::Child(child)),
        spawn_start,
        options.max_requests.unwrap_or(0),
    ))
}
