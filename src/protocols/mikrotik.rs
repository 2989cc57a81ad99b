use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::routeros::{ApiConnection, Attributes, Command, RouterOsError};
use crate::error::{NetError, NetResult};
use crate::models::{DeviceHealth, PppProfileAttributes, PppoeUserAttributes, Router};

/// `/ppp/secret` entry as read from the router
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PppSecret {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub profile: String,
    pub service: String,
    pub remote_address: Option<String>,
    pub caller_id: Option<String>,
    pub comment: String,
    pub disabled: bool,
}

/// `/ppp/active` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActiveSession {
    pub id: String,
    pub name: String,
    pub service: String,
    pub address: Option<String>,
    pub caller_id: Option<String>,
    pub uptime: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PppProfile {
    pub id: String,
    pub name: String,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
    pub rate_limit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimpleQueue {
    pub id: String,
    pub name: String,
    pub target: String,
    pub max_limit: String,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimpleQueueAttributes {
    pub name: String,
    pub target: String,
    pub max_limit: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FirewallRule {
    pub id: String,
    pub chain: String,
    pub action: String,
    pub src_address: Option<String>,
    pub dst_address: Option<String>,
    pub comment: Option<String>,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FirewallRuleAttributes {
    pub chain: String,
    pub action: String,
    pub src_address: Option<String>,
    pub dst_address: Option<String>,
    pub comment: Option<String>,
}

/// `/system/resource/print` subset
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemResource {
    pub uptime: String,
    pub version: String,
    pub board_name: String,
    pub cpu_load: Option<f64>,
    pub free_memory: Option<u64>,
    pub total_memory: Option<u64>,
}

impl SystemResource {
    pub fn health(&self) -> DeviceHealth {
        let memory_usage = match (self.free_memory, self.total_memory) {
            (Some(free), Some(total)) if total > 0 => {
                Some(((total - free.min(total)) as f64 / total as f64) * 100.0)
            }
            _ => None,
        };
        DeviceHealth {
            uptime_seconds: parse_routeros_duration(&self.uptime),
            temperature: None,
            cpu_usage: self.cpu_load,
            memory_usage,
        }
    }
}

/// Parse RouterOS durations like `1w2d03:04:05`, `3h4m5s` or `00:10:00` into seconds
pub fn parse_routeros_duration(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (units, clock) = if s.contains(':') {
        let split = s.rfind(|c: char| c.is_ascii_alphabetic()).map(|i| i + 1).unwrap_or(0);
        (&s[..split], Some(&s[split..]))
    } else {
        (s, None)
    };

    let mut total: i64 = 0;
    let mut num = String::new();
    for c in units.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let value: i64 = num.parse().ok()?;
        num.clear();
        let factor = match c {
            'w' => 604_800,
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        total += value * factor;
    }
    if !num.is_empty() {
        return None;
    }

    if let Some(clock) = clock {
        let parts: Vec<&str> = clock.split(':').collect();
        if parts.len() != 3 {
            return None;
        }
        let h: i64 = parts[0].parse().ok()?;
        let m: i64 = parts[1].parse().ok()?;
        let sec: i64 = parts[2].parse().ok()?;
        total += h * 3600 + m * 60 + sec;
    }
    Some(total)
}

fn flag(attrs: &Attributes, key: &str) -> bool {
    attrs.get(key).is_some_and(|v| v == "true" || v == "yes")
}

fn text(attrs: &Attributes, key: &str) -> String {
    attrs.get(key).cloned().unwrap_or_default()
}

fn opt_text(attrs: &Attributes, key: &str) -> Option<String> {
    attrs.get(key).filter(|v| !v.is_empty()).cloned()
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

pub fn secret_from_attrs(attrs: &Attributes) -> PppSecret {
    PppSecret {
        id: text(attrs, ".id"),
        name: text(attrs, "name"),
        password: text(attrs, "password"),
        profile: text(attrs, "profile"),
        service: text(attrs, "service"),
        remote_address: opt_text(attrs, "remote-address"),
        caller_id: opt_text(attrs, "caller-id"),
        comment: text(attrs, "comment"),
        disabled: flag(attrs, "disabled"),
    }
}

fn session_from_attrs(attrs: &Attributes) -> ActiveSession {
    ActiveSession {
        id: text(attrs, ".id"),
        name: text(attrs, "name"),
        service: text(attrs, "service"),
        address: opt_text(attrs, "address"),
        caller_id: opt_text(attrs, "caller-id"),
        uptime: text(attrs, "uptime"),
    }
}

fn profile_from_attrs(attrs: &Attributes) -> PppProfile {
    PppProfile {
        id: text(attrs, ".id"),
        name: text(attrs, "name"),
        local_address: opt_text(attrs, "local-address"),
        remote_address: opt_text(attrs, "remote-address"),
        rate_limit: opt_text(attrs, "rate-limit"),
    }
}

fn resource_from_attrs(attrs: &Attributes) -> SystemResource {
    SystemResource {
        uptime: text(attrs, "uptime"),
        version: text(attrs, "version"),
        board_name: text(attrs, "board-name"),
        cpu_load: attrs.get("cpu-load").and_then(|v| v.parse().ok()),
        free_memory: attrs.get("free-memory").and_then(|v| v.parse().ok()),
        total_memory: attrs.get("total-memory").and_then(|v| v.parse().ok()),
    }
}

/// Operations the core needs from a MikroTik router
#[async_trait]
pub trait RouterApi: Send {
    async fn identity(&mut self) -> NetResult<String>;
    async fn system_resource(&mut self) -> NetResult<SystemResource>;

    async fn find_secret(&mut self, name: &str) -> NetResult<Option<PppSecret>>;
    async fn list_secrets(&mut self) -> NetResult<Vec<PppSecret>>;
    /// Returns the new secret's `.id`
    async fn add_secret(&mut self, attrs: &PppoeUserAttributes) -> NetResult<String>;
    async fn set_secret(&mut self, id: &str, attrs: &PppoeUserAttributes) -> NetResult<()>;
    async fn set_secret_disabled(&mut self, id: &str, disabled: bool) -> NetResult<()>;
    async fn remove_secret(&mut self, id: &str) -> NetResult<()>;

    async fn active_sessions(&mut self, name: Option<&str>) -> NetResult<Vec<ActiveSession>>;
    async fn remove_active_session(&mut self, id: &str) -> NetResult<()>;

    async fn find_profile(&mut self, name: &str) -> NetResult<Option<PppProfile>>;
    async fn list_profiles(&mut self) -> NetResult<Vec<PppProfile>>;
    async fn add_profile(&mut self, attrs: &PppProfileAttributes) -> NetResult<String>;

    async fn list_queues(&mut self) -> NetResult<Vec<SimpleQueue>>;
    async fn add_queue(&mut self, attrs: &SimpleQueueAttributes) -> NetResult<String>;
    async fn list_firewall_rules(&mut self, chain: Option<&str>) -> NetResult<Vec<FirewallRule>>;
    async fn add_firewall_rule(&mut self, attrs: &FirewallRuleAttributes) -> NetResult<String>;
}

/// Opens API sessions to routers
#[async_trait]
pub trait RouterConnector: Send + Sync {
    async fn connect(&self, router: &Router) -> NetResult<Box<dyn RouterApi>>;
}

/// Connector for real routers over TCP
pub struct RouterOsConnector {
    timeout: Duration,
}

impl RouterOsConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RouterConnector for RouterOsConnector {
    async fn connect(&self, router: &Router) -> NetResult<Box<dyn RouterApi>> {
        tracing::debug!("Connecting to router {} at {}:{}", router.name, router.host, router.api_port);
        let conn = ApiConnection::connect(
            &router.host,
            router.api_port,
            &router.username,
            &router.password,
            self.timeout,
        )
        .await
        .map_err(|e| match e {
            // A trap during login means bad credentials
            RouterOsError::Trap(msg) => NetError::DeviceUnreachable(format!("login rejected: {}", msg)),
            other => map_error(other, "connect"),
        })?;
        Ok(Box::new(RouterOsClient::new(conn)))
    }
}

fn map_error(err: RouterOsError, operation: &str) -> NetError {
    match err {
        RouterOsError::Timeout(d) => NetError::Timeout {
            operation: operation.to_string(),
            secs: d.as_secs().max(1),
        },
        RouterOsError::Trap(msg) => NetError::DeviceRejected(msg),
        RouterOsError::Io(e) => NetError::DeviceUnreachable(format!("{}: {}", operation, e)),
        RouterOsError::Fatal(msg) => NetError::DeviceUnreachable(format!("{}: {}", operation, msg)),
        RouterOsError::Protocol(msg) => NetError::DeviceUnreachable(format!("{}: {}", operation, msg)),
        RouterOsError::Desynced => NetError::DeviceUnreachable(format!("{}: connection out of sync", operation)),
    }
}

/// RouterOS API implementation of [`RouterApi`]
pub struct RouterOsClient<S> {
    conn: ApiConnection<S>,
}

impl<S> RouterOsClient<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(conn: ApiConnection<S>) -> Self {
        Self { conn }
    }

    async fn run(&mut self, cmd: Command, operation: &str) -> NetResult<Vec<Attributes>> {
        self.conn.run(&cmd).await.map_err(|e| map_error(e, operation))
    }

    /// Rows of a print; `!done` attributes are never data rows
    async fn print(&mut self, cmd: Command, operation: &str) -> NetResult<Vec<Attributes>> {
        let rows = self.run(cmd, operation).await?;
        Ok(rows.into_iter().filter(|r| !r.contains_key("ret")).collect())
    }

    async fn add(&mut self, cmd: Command, operation: &str) -> NetResult<String> {
        let rows = self.run(cmd, operation).await?;
        rows.iter()
            .rev()
            .find_map(|r| r.get("ret").cloned())
            .ok_or_else(|| NetError::DeviceUnreachable(format!("{}: router returned no id", operation)))
    }
}

/// `updating` sends an empty remote-address so a dropped address is cleared on the router
fn secret_command(path: &str, attrs: &PppoeUserAttributes, updating: bool) -> Command {
    let remote_address = attrs.remote_address.as_deref().or(updating.then_some(""));
    Command::new(path)
        .attr("name", &attrs.name)
        .attr("password", &attrs.password)
        .attr("profile", &attrs.profile)
        .attr("service", &attrs.service)
        .attr_opt("remote-address", remote_address)
        .attr_opt("caller-id", attrs.caller_id.as_deref())
        .attr("comment", &attrs.comment)
        .attr("disabled", yes_no(attrs.disabled))
}

#[async_trait]
impl<S> RouterApi for RouterOsClient<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn identity(&mut self) -> NetResult<String> {
        let rows = self.print(Command::new("/system/identity/print"), "identity").await?;
        Ok(rows.first().map(|r| text(r, "name")).unwrap_or_default())
    }

    async fn system_resource(&mut self) -> NetResult<SystemResource> {
        let rows = self.print(Command::new("/system/resource/print"), "system resource").await?;
        rows.first()
            .map(resource_from_attrs)
            .ok_or_else(|| NetError::DeviceUnreachable("system resource: empty reply".into()))
    }

    async fn find_secret(&mut self, name: &str) -> NetResult<Option<PppSecret>> {
        let cmd = Command::new("/ppp/secret/print").query("name", name);
        let rows = self.print(cmd, "find secret").await?;
        Ok(rows.first().map(secret_from_attrs))
    }

    async fn list_secrets(&mut self) -> NetResult<Vec<PppSecret>> {
        let rows = self.print(Command::new("/ppp/secret/print"), "list secrets").await?;
        Ok(rows.iter().map(secret_from_attrs).collect())
    }

    async fn add_secret(&mut self, attrs: &PppoeUserAttributes) -> NetResult<String> {
        self.add(secret_command("/ppp/secret/add", attrs, false), "add secret").await
    }

    async fn set_secret(&mut self, id: &str, attrs: &PppoeUserAttributes) -> NetResult<()> {
        let cmd = secret_command("/ppp/secret/set", attrs, true).attr(".id", id);
        self.run(cmd, "set secret").await.map(|_| ())
    }

    async fn set_secret_disabled(&mut self, id: &str, disabled: bool) -> NetResult<()> {
        let path = if disabled { "/ppp/secret/disable" } else { "/ppp/secret/enable" };
        self.run(Command::new(path).attr(".id", id), "toggle secret").await.map(|_| ())
    }

    async fn remove_secret(&mut self, id: &str) -> NetResult<()> {
        let cmd = Command::new("/ppp/secret/remove").attr(".id", id);
        self.run(cmd, "remove secret").await.map(|_| ())
    }

    async fn active_sessions(&mut self, name: Option<&str>) -> NetResult<Vec<ActiveSession>> {
        let mut cmd = Command::new("/ppp/active/print");
        if let Some(name) = name {
            cmd = cmd.query("name", name);
        }
        let rows = self.print(cmd, "active sessions").await?;
        Ok(rows.iter().map(session_from_attrs).collect())
    }

    async fn remove_active_session(&mut self, id: &str) -> NetResult<()> {
        let cmd = Command::new("/ppp/active/remove").attr(".id", id);
        self.run(cmd, "disconnect session").await.map(|_| ())
    }

    async fn find_profile(&mut self, name: &str) -> NetResult<Option<PppProfile>> {
        let cmd = Command::new("/ppp/profile/print").query("name", name);
        let rows = self.print(cmd, "find profile").await?;
        Ok(rows.first().map(profile_from_attrs))
    }

    async fn list_profiles(&mut self) -> NetResult<Vec<PppProfile>> {
        let rows = self.print(Command::new("/ppp/profile/print"), "list profiles").await?;
        Ok(rows.iter().map(profile_from_attrs).collect())
    }

    async fn add_profile(&mut self, attrs: &PppProfileAttributes) -> NetResult<String> {
        let cmd = Command::new("/ppp/profile/add")
            .attr("name", &attrs.name)
            .attr_opt("local-address", attrs.local_address.as_deref())
            .attr_opt("remote-address", attrs.remote_address.as_deref())
            .attr_opt("rate-limit", attrs.rate_limit.as_deref())
            .attr_opt("session-timeout", attrs.session_timeout.as_deref())
            .attr("only-one", yes_no(attrs.only_one));
        self.add(cmd, "add profile").await
    }

    async fn list_queues(&mut self) -> NetResult<Vec<SimpleQueue>> {
        let rows = self.print(Command::new("/queue/simple/print"), "list queues").await?;
        Ok(rows
            .iter()
            .map(|r| SimpleQueue {
                id: text(r, ".id"),
                name: text(r, "name"),
                target: text(r, "target"),
                max_limit: text(r, "max-limit"),
                disabled: flag(r, "disabled"),
            })
            .collect())
    }

    async fn add_queue(&mut self, attrs: &SimpleQueueAttributes) -> NetResult<String> {
        let cmd = Command::new("/queue/simple/add")
            .attr("name", &attrs.name)
            .attr("target", &attrs.target)
            .attr("max-limit", &attrs.max_limit)
            .attr_opt("comment", attrs.comment.as_deref());
        self.add(cmd, "add queue").await
    }

    async fn list_firewall_rules(&mut self, chain: Option<&str>) -> NetResult<Vec<FirewallRule>> {
        let mut cmd = Command::new("/ip/firewall/filter/print");
        if let Some(chain) = chain {
            cmd = cmd.query("chain", chain);
        }
        let rows = self.print(cmd, "list firewall rules").await?;
        Ok(rows
            .iter()
            .map(|r| FirewallRule {
                id: text(r, ".id"),
                chain: text(r, "chain"),
                action: text(r, "action"),
                src_address: opt_text(r, "src-address"),
                dst_address: opt_text(r, "dst-address"),
                comment: opt_text(r, "comment"),
                disabled: flag(r, "disabled"),
            })
            .collect())
    }

    async fn add_firewall_rule(&mut self, attrs: &FirewallRuleAttributes) -> NetResult<String> {
        let cmd = Command::new("/ip/firewall/filter/add")
            .attr("chain", &attrs.chain)
            .attr("action", &attrs.action)
            .attr_opt("src-address", attrs.src_address.as_deref())
            .attr_opt("dst-address", attrs.dst_address.as_deref())
            .attr_opt("comment", attrs.comment.as_deref());
        self.add(cmd, "add firewall rule").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::routeros::encode_sentence;
    use tokio_test::io::Builder;

    #[test]
    fn test_parse_routeros_duration() {
        assert_eq!(parse_routeros_duration("1w2d3h4m5s"), Some(604_800 + 172_800 + 10_800 + 240 + 5));
        assert_eq!(parse_routeros_duration("5m"), Some(300));
        assert_eq!(parse_routeros_duration("2d03:04:05"), Some(172_800 + 3 * 3600 + 4 * 60 + 5));
        assert_eq!(parse_routeros_duration("00:10:00"), Some(600));
        assert_eq!(parse_routeros_duration(""), None);
        assert_eq!(parse_routeros_duration("12"), None);
        assert_eq!(parse_routeros_duration("3x"), None);
    }

    #[test]
    fn test_resource_health() {
        let res = SystemResource {
            uptime: "1d".into(),
            cpu_load: Some(12.0),
            free_memory: Some(25),
            total_memory: Some(100),
            ..Default::default()
        };
        let health = res.health();
        assert_eq!(health.uptime_seconds, Some(86_400));
        assert_eq!(health.cpu_usage, Some(12.0));
        assert_eq!(health.memory_usage, Some(75.0));
    }

    #[tokio::test]
    async fn test_add_secret_sends_all_attributes() {
        let attrs = PppoeUserAttributes {
            name: "alice".into(),
            password: "pw".into(),
            profile: "10M".into(),
            service: "pppoe".into(),
            remote_address: Some("10.0.0.5".into()),
            caller_id: None,
            comment: "alice|42|7|2026-12-31|pppoe".into(),
            disabled: false,
        };
        let mock = Builder::new()
            .write(&encode_sentence(&[
                "/ppp/secret/add",
                "=name=alice",
                "=password=pw",
                "=profile=10M",
                "=service=pppoe",
                "=remote-address=10.0.0.5",
                "=comment=alice|42|7|2026-12-31|pppoe",
                "=disabled=no",
            ]))
            .read(&encode_sentence(&["!done", "=ret=*1F"]))
            .build();
        let mut client = RouterOsClient::new(ApiConnection::new(mock, Duration::from_secs(1)));
        assert_eq!(client.add_secret(&attrs).await.unwrap(), "*1F");
    }

    #[tokio::test]
    async fn test_set_secret_without_address_clears_it() {
        let attrs = PppoeUserAttributes {
            name: "alice".into(),
            password: "pw".into(),
            profile: "10M".into(),
            service: "pppoe".into(),
            remote_address: None,
            caller_id: None,
            comment: "alice|42|7|2026-12-31|pppoe".into(),
            disabled: false,
        };
        let mock = Builder::new()
            .write(&encode_sentence(&[
                "/ppp/secret/set",
                "=name=alice",
                "=password=pw",
                "=profile=10M",
                "=service=pppoe",
                "=remote-address=",
                "=comment=alice|42|7|2026-12-31|pppoe",
                "=disabled=no",
                "=.id=*1F",
            ]))
            .read(&encode_sentence(&["!done"]))
            .build();
        let mut client = RouterOsClient::new(ApiConnection::new(mock, Duration::from_secs(1)));
        client.set_secret("*1F", &attrs).await.unwrap();
    }

    #[tokio::test]
    async fn test_find_secret_absent_and_trap_mapping() {
        let mock = Builder::new()
            .write(&encode_sentence(&["/ppp/secret/print", "?name=ghost"]))
            .read(&encode_sentence(&["!done"]))
            .write(&encode_sentence(&["/ppp/secret/remove", "=.id=*99"]))
            .read(&encode_sentence(&["!trap", "=message=no such item"]))
            .read(&encode_sentence(&["!done"]))
            .build();
        let mut client = RouterOsClient::new(ApiConnection::new(mock, Duration::from_secs(1)));
        assert!(client.find_secret("ghost").await.unwrap().is_none());
        let err = client.remove_secret("*99").await.unwrap_err();
        assert_eq!(err.kind(), "device_rejected");
    }

    #[tokio::test]
    async fn test_active_sessions_filtered_by_name() {
        let mock = Builder::new()
            .write(&encode_sentence(&["/ppp/active/print", "?name=bob"]))
            .read(&encode_sentence(&[
                "!re",
                "=.id=*A1",
                "=name=bob",
                "=service=pppoe",
                "=address=10.0.0.9",
                "=uptime=1h2m",
            ]))
            .read(&encode_sentence(&["!done"]))
            .build();
        let mut client = RouterOsClient::new(ApiConnection::new(mock, Duration::from_secs(1)));
        let sessions = client.active_sessions(Some("bob")).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "*A1");
        assert_eq!(sessions[0].address.as_deref(), Some("10.0.0.9"));
    }
}
