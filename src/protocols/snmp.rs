use async_trait::async_trait;
use std::time::Duration;

use crate::error::{NetError, NetResult};

/// Hard cap on GETNEXT iterations for one walk
const MAX_WALK_ROWS: usize = 4096;

/// Decoded SNMP varbind value
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Int(i64),
    Str(String),
    Counter(u64),
    Ticks(u32),
    Ip(String),
    Null,
}

impl SnmpValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SnmpValue::Int(v) => Some(*v),
            SnmpValue::Counter(v) => i64::try_from(*v).ok(),
            SnmpValue::Ticks(v) => Some(*v as i64),
            SnmpValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            SnmpValue::Str(s) => Some(s.trim_matches(char::from(0)).trim().to_string()),
            SnmpValue::Ip(s) => Some(s.clone()),
            SnmpValue::Int(v) => Some(v.to_string()),
            SnmpValue::Counter(v) => Some(v.to_string()),
            SnmpValue::Ticks(v) => Some(v.to_string()),
            SnmpValue::Null => None,
        }
    }
}

/// OID as dotted text, with or without a leading dot
pub fn parse_oid(oid: &str) -> NetResult<Vec<u32>> {
    oid.trim()
        .trim_start_matches('.')
        .split('.')
        .map(|p| p.parse::<u32>().map_err(|_| NetError::invalid(format!("invalid OID {}", oid))))
        .collect()
}

pub fn format_oid(parts: &[u32]) -> String {
    let mut out = String::new();
    for p in parts {
        out.push('.');
        out.push_str(&p.to_string());
    }
    out
}

/// Components of `oid` after `base`, or None when `oid` is outside the subtree
pub fn oid_suffix(base: &str, oid: &str) -> Option<Vec<u32>> {
    let base = parse_oid(base).ok()?;
    let oid = parse_oid(oid).ok()?;
    if oid.len() <= base.len() || oid[..base.len()] != base[..] {
        return None;
    }
    Some(oid[base.len()..].to_vec())
}

/// SNMP v2c operations used by the OLT engine
#[async_trait]
pub trait SnmpClient: Send + Sync {
    async fn get(&self, oid: &str) -> NetResult<Option<SnmpValue>>;
    /// All (oid, value) pairs under `base`
    async fn walk(&self, base: &str) -> NetResult<Vec<(String, SnmpValue)>>;
    async fn set_integer(&self, oid: &str, value: i64) -> NetResult<()>;
}

/// Blocking `snmp` crate session run on the blocking pool
pub struct UdpSnmpClient {
    host: String,
    port: u16,
    community: String,
    timeout: Duration,
}

impl UdpSnmpClient {
    pub fn new(host: &str, port: u16, community: &str, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            community: community.to_string(),
            timeout,
        }
    }

    fn session(&self) -> NetResult<snmp::SyncSession> {
        snmp::SyncSession::new(
            (self.host.as_str(), self.port),
            self.community.as_bytes(),
            Some(self.timeout),
            0,
        )
        .map_err(|e| NetError::DeviceUnreachable(format!("SNMP socket to {}: {}", self.host, e)))
    }

    /// Run a blocking SNMP exchange with an outer deadline
    async fn blocking<T, F>(&self, operation: &str, f: F) -> NetResult<T>
    where
        T: Send + 'static,
        F: FnOnce(UdpSnmpClient) -> NetResult<T> + Send + 'static,
    {
        let owned = UdpSnmpClient {
            host: self.host.clone(),
            port: self.port,
            community: self.community.clone(),
            timeout: self.timeout,
        };
        // Walks issue many requests; allow a generous multiple of the per-request timeout
        let deadline = self.timeout * 20;
        let task = tokio::task::spawn_blocking(move || f(owned));
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(NetError::DeviceUnreachable(format!("SNMP task failed: {}", e))),
            Err(_) => Err(NetError::Timeout {
                operation: format!("snmp {} on {}", operation, self.host),
                secs: deadline.as_secs(),
            }),
        }
    }
}

fn convert_value(value: &snmp::Value) -> Option<SnmpValue> {
    use snmp::Value;
    match value {
        Value::Integer(v) => Some(SnmpValue::Int(*v)),
        Value::OctetString(b) => Some(SnmpValue::Str(String::from_utf8_lossy(b).into_owned())),
        Value::Counter32(v) | Value::Unsigned32(v) => Some(SnmpValue::Counter(*v as u64)),
        Value::Counter64(v) => Some(SnmpValue::Counter(*v)),
        Value::Timeticks(v) => Some(SnmpValue::Ticks(*v)),
        Value::IpAddress(b) => Some(SnmpValue::Ip(format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3]))),
        Value::Null => Some(SnmpValue::Null),
        // endOfMibView, noSuchObject, noSuchInstance and anything exotic
        _ => None,
    }
}

fn snmp_err(host: &str, e: snmp::SnmpError) -> NetError {
    match e {
        snmp::SnmpError::ReceiveError | snmp::SnmpError::SendError => {
            NetError::DeviceUnreachable(format!("SNMP agent {} not responding", host))
        }
        other => NetError::DeviceUnreachable(format!("SNMP error from {}: {:?}", host, other)),
    }
}

#[async_trait]
impl SnmpClient for UdpSnmpClient {
    async fn get(&self, oid: &str) -> NetResult<Option<SnmpValue>> {
        let name = parse_oid(oid)?;
        self.blocking("get", move |c| {
            let mut sess = c.session()?;
            let pdu = sess.get(&name).map_err(|e| snmp_err(&c.host, e))?;
            if pdu.error_status != 0 {
                return Ok(None);
            }
            Ok(pdu.varbinds.into_iter().next().and_then(|(_, v)| convert_value(&v)))
        })
        .await
    }

    async fn walk(&self, base: &str) -> NetResult<Vec<(String, SnmpValue)>> {
        let root = parse_oid(base)?;
        self.blocking("walk", move |c| {
            let mut sess = c.session()?;
            let mut rows = Vec::new();
            let mut current = root.clone();
            let mut buf = [0u32; 128];
            for _ in 0..MAX_WALK_ROWS {
                let pdu = sess.getnext(&current).map_err(|e| snmp_err(&c.host, e))?;
                if pdu.error_status != 0 {
                    break;
                }
                let Some((name, value)) = pdu.varbinds.into_iter().next() else {
                    break;
                };
                let next: Vec<u32> = match name.read_name(&mut buf) {
                    Ok(parts) => parts.to_vec(),
                    Err(_) => break,
                };
                if next.len() <= root.len() || next[..root.len()] != root[..] || next <= current {
                    break;
                }
                match convert_value(&value) {
                    Some(v) => rows.push((format_oid(&next), v)),
                    None => break,
                }
                current = next;
            }
            Ok(rows)
        })
        .await
    }

    async fn set_integer(&self, oid: &str, value: i64) -> NetResult<()> {
        let name = parse_oid(oid)?;
        self.blocking("set", move |c| {
            let mut sess = c.session()?;
            let pdu = sess
                .set(&[(name.as_slice(), snmp::Value::Integer(value))])
                .map_err(|e| snmp_err(&c.host, e))?;
            if pdu.error_status != 0 {
                return Err(NetError::DeviceRejected(format!(
                    "SNMP set {} failed with status {}",
                    format_oid(&name),
                    pdu.error_status
                )));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_oid() {
        let parts = parse_oid(".1.3.6.1.2.1.1.1.0").unwrap();
        assert_eq!(parts, vec![1, 3, 6, 1, 2, 1, 1, 1, 0]);
        assert_eq!(format_oid(&parts), ".1.3.6.1.2.1.1.1.0");
        assert_eq!(parse_oid("1.3.6").unwrap(), vec![1, 3, 6]);
        assert!(parse_oid("1.3.x").is_err());
    }

    #[test]
    fn test_oid_suffix() {
        let base = ".1.3.6.1.4.1.2011.6.128.1.1.2.43.1.3";
        assert_eq!(
            oid_suffix(base, ".1.3.6.1.4.1.2011.6.128.1.1.2.43.1.3.4194312448.5"),
            Some(vec![4194312448, 5])
        );
        assert_eq!(oid_suffix(base, base), None);
        assert_eq!(oid_suffix(base, ".1.3.6.1.4.1.2011.6.128.1.1.2.43.1.4.1"), None);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(SnmpValue::Int(-2150).as_i64(), Some(-2150));
        assert_eq!(SnmpValue::Str("HWTC1234\0".into()).as_text().as_deref(), Some("HWTC1234"));
        assert_eq!(SnmpValue::Null.as_text(), None);
        assert_eq!(SnmpValue::Str(" 42 ".into()).as_i64(), Some(42));
    }
}
