//! Spawn handshake wire format (§6): a `\0`-terminated `key=value` block a
//! freshly spawned process writes back to declare its sockets, and the
//! line-oriented preloader command-channel protocol built on the same
//! block (§4.4.2, §6 "Preloader command channel").

use crate::pool::socket::{Protocol, Socket};
use crate::types::{GupId, SocketName};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct HandshakeInfo {
    pub pid: Option<u32>,
    pub gupid: Option<String>,
    pub is_preloader: bool,
    pub preloader_command_address: Option<String>,
    /// The process's own admin-channel address (§6): a worker forked
    /// internally by a preloader declares this so the parent can still
    /// open a liveness/shutdown channel to it despite never holding its
    /// `Child` handle directly.
    pub admin_address: Option<String>,
    pub sockets: Vec<Socket>,
}

/// Strips this crate's `unix:` scheme prefix from a handshake-declared
/// address. `UnixStream::connect` treats its argument as a literal
/// filesystem path, so every connect against an address from this wire
/// format must go through this first.
pub fn socket_path(address: &str) -> &str {
    address.strip_prefix("unix:").unwrap_or(address)
}

/// Parses a handshake block: `\0`-terminated `key=value` pairs, final
/// trailing `\0`. Tolerant of a missing final empty segment (some writers
/// omit the trailing separator on the last pair).
pub fn parse_handshake(block: &str) -> Result<HandshakeInfo, String> {
    let mut fields: HashMap<String, String> = HashMap::new();
    for pair in block.split('\0') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().ok_or_else(|| "malformed handshake pair".to_string())?;
        let value = parts.next().ok_or_else(|| format!("missing value for key {key}"))?;
        fields.insert(key.to_string(), value.to_string());
    }

    let mut info = HandshakeInfo::default();
    if let Some(pid) = fields.get("!pid") {
        info.pid = Some(
            pid.parse()
                .map_err(|_| format!("invalid !pid value: {pid}"))?,
        );
    }
    info.gupid = fields.get("!gupid").cloned();
    if fields.get("!preloader").map(|v| v == "1").unwrap_or(false) {
        info.is_preloader = true;
        info.preloader_command_address = fields.get("!preloader_command_address").cloned();
    }
    info.admin_address = fields.get("!admin_address").cloned();

    let mut n = 0;
    loop {
        let name_key = format!("!socket_{n}_name");
        let Some(name) = fields.get(&name_key) else {
            break;
        };
        let address = fields
            .get(&format!("!socket_{n}_address"))
            .ok_or_else(|| format!("socket {n} missing address"))?
            .clone();
        let protocol_str = fields
            .get(&format!("!socket_{n}_protocol"))
            .map(|s| s.as_str())
            .unwrap_or("http");
        let protocol = match protocol_str {
            "session" => Protocol::SessionOriented,
            _ => Protocol::Http,
        };
        let concurrency: u32 = fields
            .get(&format!("!socket_{n}_concurrency"))
            .map(|s| s.parse().unwrap_or(0))
            .unwrap_or(0);
        info.sockets.push(Socket::new(
            SocketName::from_string(name.clone()),
            address,
            protocol,
            concurrency,
        ));
        n += 1;
    }

    if info.pid.is_none() {
        return Err("handshake missing required !pid key".to_string());
    }
    if info.sockets.is_empty() && !info.is_preloader {
        return Err("handshake declared zero sockets".to_string());
    }
    Ok(info)
}

/// Encodes a handshake block, used by `spawner::dummy` and by tests that
/// exercise the parser against a known-good message.
pub fn encode_handshake(
    pid: u32,
    gupid: &GupId,
    sockets: &[(&str, &str, &str, u32)],
    admin_address: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("!pid={pid}\0"));
    out.push_str(&format!("!gupid={gupid}\0"));
    if let Some(address) = admin_address {
        out.push_str(&format!("!admin_address={address}\0"));
    }
    for (i, (name, address, protocol, concurrency)) in sockets.iter().enumerate() {
        out.push_str(&format!("!socket_{i}_name={name}\0"));
        out.push_str(&format!("!socket_{i}_address={address}\0"));
        out.push_str(&format!("!socket_{i}_protocol={protocol}\0"));
        out.push_str(&format!("!socket_{i}_concurrency={concurrency}\0"));
    }
    out
}
