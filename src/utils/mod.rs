use anyhow::{anyhow, Result};
use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use std::io::Read;
use std::net::{Ipv4Addr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyboard-interactive prompt handler that always responds with the password
struct PasswordPrompt {
    password: String,
}

impl ssh2::KeyboardInteractivePrompt for PasswordPrompt {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

/// Normalize MAC address to lowercase with colons
pub fn normalize_mac(mac: &str) -> String {
    let clean: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();

    if clean.len() != 12 {
        return mac.to_lowercase();
    }

    clean
        .chars()
        .collect::<Vec<_>>()
        .chunks(2)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
        .to_lowercase()
}

/// Validate a MAC address in `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff` form
pub fn is_valid_mac(mac: &str) -> bool {
    static MAC_RE: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    MAC_RE
        .get_or_init(|| regex_lite::Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(mac))
}

/// Validate an IPv4 address (e.g., "192.168.1.1").
pub fn is_valid_ipv4(ip: &str) -> bool {
    ip.parse::<Ipv4Addr>().is_ok()
}

/// Parse a dotted-quad IPv4 address into its integer form
pub fn ipv4_to_u32(ip: &str) -> Result<u32> {
    let addr: Ipv4Addr = ip
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid IPv4 address: {}", ip))?;
    Ok(u32::from(addr))
}

pub fn u32_to_ipv4(n: u32) -> String {
    Ipv4Addr::from(n).to_string()
}

/// Network facts derived from a CIDR string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrInfo {
    pub network: u32,
    pub broadcast: u32,
    pub prefix_length: u8,
}

impl CidrInfo {
    /// First and last host address. /31 and /32 have no reserved addresses.
    pub fn host_range(&self) -> (u32, u32) {
        if self.prefix_length >= 31 {
            (self.network, self.broadcast)
        } else {
            (self.network + 1, self.broadcast - 1)
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.network && addr <= self.broadcast
    }

    pub fn overlaps(&self, other: &CidrInfo) -> bool {
        self.network <= other.broadcast && other.network <= self.broadcast
    }
}

/// Parse a CIDR like "10.0.0.0/24". Host bits are masked off.
pub fn parse_cidr(cidr: &str) -> Result<CidrInfo> {
    let net: Ipv4Network = cidr
        .trim()
        .parse()
        .map_err(|e| anyhow!("invalid CIDR {}: {}", cidr, e))?;
    Ok(CidrInfo {
        network: u32::from(net.network()),
        broadcast: u32::from(net.broadcast()),
        prefix_length: net.prefix(),
    })
}

/// Per-key async mutexes. Used for per-pool allocation and per-device serialization.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`; released when the guard drops
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let handle = self
            .inner
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        handle.lock_owned().await
    }
}

/// Create an SSH session and authenticate with password + keyboard-interactive.
/// Blocking, so call from a spawn_blocking context.
pub fn ssh_connect(host: &str, port: u16, user: &str, pass: &str, timeout_secs: u64) -> Result<ssh2::Session, String> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("Invalid address {}:{}: {}", host, port, e))?
        .next()
        .ok_or_else(|| format!("No address for {}:{}", host, port))?;
    let tcp = TcpStream::connect_timeout(&addr, Duration::from_secs(timeout_secs))
        .map_err(|e| format!("TCP connection failed: {}", e))?;

    tcp.set_read_timeout(Some(Duration::from_secs(timeout_secs)))
        .ok();
    tcp.set_write_timeout(Some(Duration::from_secs(timeout_secs)))
        .ok();

    let mut session = ssh2::Session::new()
        .map_err(|e| format!("Failed to create SSH session: {}", e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_secs as u32 * 1000);
    session.handshake()
        .map_err(|e| format!("SSH handshake failed: {}", e))?;

    match session.userauth_password(user, pass) {
        Ok(_) if session.authenticated() => return Ok(session),
        _ => {}
    }

    // Several OLT firmwares only offer keyboard-interactive
    let mut prompter = PasswordPrompt { password: pass.to_string() };
    let _ = session.userauth_keyboard_interactive(user, &mut prompter);

    if session.authenticated() {
        Ok(session)
    } else {
        Err("SSH authentication failed: all methods exhausted".to_string())
    }
}

/// Execute one command on an open session and return its output
pub fn ssh_exec(session: &ssh2::Session, command: &str) -> Result<String, String> {
    let mut channel = session.channel_session()
        .map_err(|e| format!("Failed to open channel: {}", e))?;

    channel.exec(command)
        .map_err(|e| format!("Failed to execute command: {}", e))?;

    let mut output = String::new();
    channel.read_to_string(&mut output)
        .map_err(|e| format!("Failed to read output: {}", e))?;

    channel.wait_close()
        .map_err(|e| format!("Failed to close channel: {}", e))?;

    Ok(output)
}

/// Lines an OLT prints when it refuses a command
pub fn looks_like_cli_error(output: &str) -> bool {
    output.lines().any(|l| {
        let l = l.trim();
        l.starts_with('%')
            || l.contains("Invalid input")
            || l.contains("Unknown command")
            || l.contains("Error:")
            || l.contains("Failure:")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("00:1A:2B:3C:4D:5E"), "00:1a:2b:3c:4d:5e");
        assert_eq!(normalize_mac("00-1A-2B-3C-4D-5E"), "00:1a:2b:3c:4d:5e");
        assert_eq!(normalize_mac("001a2b3c4d5e"), "00:1a:2b:3c:4d:5e");
    }

    #[test]
    fn test_is_valid_mac() {
        assert!(is_valid_mac("00:1A:2B:3C:4D:5E"));
        assert!(is_valid_mac("00-1a-2b-3c-4d-5e"));
        assert!(!is_valid_mac("001a2b3c4d5e"));
        assert!(!is_valid_mac("00:1A:2B:3C:4D"));
        assert!(!is_valid_mac("zz:1A:2B:3C:4D:5E"));
        assert!(!is_valid_mac(""));
    }

    #[test]
    fn test_parse_cidr_masks_host_bits() {
        let info = parse_cidr("192.168.1.77/24").unwrap();
        assert_eq!(u32_to_ipv4(info.network), "192.168.1.0");
        assert_eq!(u32_to_ipv4(info.broadcast), "192.168.1.255");
        assert_eq!(info.prefix_length, 24);
        assert!(parse_cidr("300.1.1.0/24").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_host_range() {
        let slash30 = parse_cidr("10.0.0.0/30").unwrap();
        let (first, last) = slash30.host_range();
        assert_eq!(last - first + 1, 2);

        let slash29 = parse_cidr("10.0.0.8/29").unwrap();
        let (first, last) = slash29.host_range();
        assert_eq!(last - first + 1, 6);

        let slash32 = parse_cidr("10.0.0.9/32").unwrap();
        assert_eq!(slash32.host_range(), (slash32.network, slash32.network));
    }

    #[test]
    fn test_overlaps() {
        let a = parse_cidr("10.0.0.0/24").unwrap();
        let b = parse_cidr("10.0.0.128/25").unwrap();
        let c = parse_cidr("10.0.1.0/24").unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_ipv4_round_trip_edges() {
        assert_eq!(ipv4_to_u32("0.0.0.0").unwrap(), 0);
        assert_eq!(ipv4_to_u32("255.255.255.255").unwrap(), u32::MAX);
        assert!(ipv4_to_u32("10.0.0").is_err());
    }

    #[test]
    fn test_looks_like_cli_error() {
        assert!(looks_like_cli_error("% Invalid input detected at '^' marker."));
        assert!(looks_like_cli_error("ok\nError: ONU not exist"));
        assert!(!looks_like_cli_error("gpon-onu_1/1:1 HWTC12345678 online"));
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("pool:1").await;
        let other = locks.clone();
        let pending = tokio::spawn(async move {
            let _g = other.lock("pool:1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        // A different key is independent
        let _g2 = locks.lock("pool:2").await;
        drop(guard);
        pending.await.unwrap();
    }
}
