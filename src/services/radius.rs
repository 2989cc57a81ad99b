use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::db::RadiusStore;
use crate::error::{NetError, NetResult};
use crate::models::*;

/// RADIUS mirror used by the provisioning orchestrator
#[async_trait]
pub trait RadiusSync: Send + Sync {
    /// Create or replace the user's credentials and reply attributes
    async fn upsert_user(&self, attrs: &RadiusUserAttributes) -> NetResult<()>;
    async fn set_user_disabled(&self, username: &str, disabled: bool) -> NetResult<()>;
    /// Returns false when the user did not exist
    async fn delete_user(&self, username: &str) -> NetResult<bool>;
}

fn attr(attribute: &str, op: &str, value: impl Into<String>) -> RadiusAttribute {
    RadiusAttribute {
        attribute: attribute.to_string(),
        op: op.to_string(),
        value: value.into(),
    }
}

fn reject_attr() -> RadiusAttribute {
    attr(radius_attr::AUTH_TYPE, ":=", "Reject")
}

/// Check and reply rows for one user
pub fn build_attributes(user: &RadiusUserAttributes) -> (Vec<RadiusAttribute>, Vec<RadiusAttribute>) {
    let mut check = vec![attr(radius_attr::CLEARTEXT_PASSWORD, ":=", user.password.as_str())];
    if user.disabled {
        check.push(reject_attr());
    }

    let mut reply = Vec::new();
    if let Some(ip) = user.framed_ip.as_deref().filter(|v| !v.is_empty()) {
        reply.push(attr(radius_attr::FRAMED_IP_ADDRESS, "=", ip));
    }
    if let Some(rate) = user.rate_limit.as_deref().filter(|v| !v.is_empty()) {
        reply.push(attr(radius_attr::MIKROTIK_RATE_LIMIT, "=", rate));
    }
    if let Some(profile) = user.profile.as_deref().filter(|v| !v.is_empty()) {
        reply.push(attr(radius_attr::MIKROTIK_GROUP, "=", profile));
    }
    if let Some(secs) = user.session_timeout {
        reply.push(attr(radius_attr::SESSION_TIMEOUT, "=", secs.to_string()));
    }
    (check, reply)
}

/// SQL-backed RADIUS user and accounting management
#[derive(Clone)]
pub struct RadiusService {
    store: RadiusStore,
    timeout: Duration,
}

impl RadiusService {
    pub fn new(store: RadiusStore, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> NetResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| NetError::Storage(format!("radius {}: {:#}", operation, e))),
            Err(_) => Err(NetError::Timeout {
                operation: format!("radius {}", operation),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub async fn test_connection(&self) -> NetResult<ConnectionTest> {
        let started = std::time::Instant::now();
        match self.bounded("ping", self.store.ping()).await {
            Ok(()) => Ok(ConnectionTest {
                success: true,
                message: "RADIUS database reachable".into(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            }),
            Err(e) => Ok(ConnectionTest {
                success: false,
                message: e.to_string(),
                latency_ms: None,
            }),
        }
    }

    pub async fn get_user(&self, username: &str) -> NetResult<RadiusUser> {
        let check = self.bounded("read", self.store.check_attributes(username)).await?;
        if check.is_empty() {
            return Err(NetError::not_found("RADIUS user", username));
        }
        let reply = self.bounded("read", self.store.reply_attributes(username)).await?;
        Ok(RadiusUser {
            username: username.to_string(),
            check,
            reply,
        })
    }

    /// Create a user that must not exist yet
    pub async fn create_user(&self, user: &RadiusUserAttributes) -> NetResult<()> {
        validate(user)?;
        let existing = self.bounded("read", self.store.check_attributes(&user.username)).await?;
        if !existing.is_empty() {
            return Err(NetError::invalid(format!("RADIUS user {} already exists", user.username)));
        }
        self.upsert_user(user).await
    }

    /// Update a user that must already exist
    pub async fn update_user(&self, user: &RadiusUserAttributes) -> NetResult<()> {
        validate(user)?;
        let existing = self.bounded("read", self.store.check_attributes(&user.username)).await?;
        if existing.is_empty() {
            return Err(NetError::not_found("RADIUS user", &user.username));
        }
        self.upsert_user(user).await
    }

    /// Upsert regardless of prior state
    pub async fn sync_user(&self, user: &RadiusUserAttributes) -> NetResult<()> {
        validate(user)?;
        self.upsert_user(user).await
    }

    /// Check credentials the way the RADIUS server would
    pub async fn authenticate(&self, username: &str, password: &str) -> NetResult<AuthResult> {
        let check = self.bounded("read", self.store.check_attributes(username)).await?;
        let rejected = |reason: &str| AuthResult {
            accepted: false,
            reason: Some(reason.to_string()),
            reply: Vec::new(),
        };
        if check.is_empty() {
            return Ok(rejected("unknown user"));
        }
        if check
            .iter()
            .any(|a| a.attribute == radius_attr::AUTH_TYPE && a.value.eq_ignore_ascii_case("reject"))
        {
            return Ok(rejected("account disabled"));
        }
        let matches = check
            .iter()
            .any(|a| a.attribute == radius_attr::CLEARTEXT_PASSWORD && a.value == password);
        if !matches {
            return Ok(rejected("invalid credentials"));
        }
        let reply = self.bounded("read", self.store.reply_attributes(username)).await?;
        Ok(AuthResult {
            accepted: true,
            reason: None,
            reply,
        })
    }

    pub async fn accounting_start(&self, req: &AccountingRequest) -> NetResult<AccountingRecord> {
        self.accounting_start_at(req, Utc::now()).await
    }

    pub async fn accounting_start_at(&self, req: &AccountingRequest, at: DateTime<Utc>) -> NetResult<AccountingRecord> {
        validate_accounting(req)?;
        self.bounded("accounting start", self.store.accounting_start(req, at)).await?;
        self.load_session(req).await
    }

    /// Interim update; a session never started is opened first
    pub async fn accounting_update(&self, req: &AccountingRequest) -> NetResult<AccountingRecord> {
        self.accounting_progress(req, Utc::now(), false).await
    }

    pub async fn accounting_stop(&self, req: &AccountingRequest) -> NetResult<AccountingRecord> {
        self.accounting_progress(req, Utc::now(), true).await
    }

    pub async fn accounting_progress(
        &self,
        req: &AccountingRequest,
        at: DateTime<Utc>,
        stop: bool,
    ) -> NetResult<AccountingRecord> {
        validate_accounting(req)?;
        let operation = if stop { "accounting stop" } else { "accounting update" };
        let matched = self.bounded(operation, self.store.accounting_update(req, at, stop)).await?;
        if !matched {
            tracing::debug!("Accounting {} for unknown session {}; opening it", operation, req.acct_session_id);
            self.bounded(operation, self.store.accounting_start(req, at)).await?;
            self.bounded(operation, self.store.accounting_update(req, at, stop)).await?;
        }
        self.load_session(req).await
    }

    async fn load_session(&self, req: &AccountingRequest) -> NetResult<AccountingRecord> {
        self.bounded("read", self.store.get_session(&req.acct_session_id, &req.username))
            .await?
            .ok_or_else(|| NetError::not_found("accounting session", &req.acct_session_id))
    }

    pub async fn active_sessions(&self, username: Option<&str>) -> NetResult<Vec<AccountingRecord>> {
        self.bounded("read", self.store.open_sessions(username)).await
    }

    pub async fn session_history(&self, username: &str, limit: i64) -> NetResult<Vec<AccountingRecord>> {
        self.bounded("read", self.store.session_history(username, limit.clamp(1, 1000))).await
    }

    pub async fn usage(&self, username: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> NetResult<UsageSummary> {
        if from >= to {
            return Err(NetError::invalid("usage window is empty"));
        }
        self.bounded("read", self.store.usage(username, from, to)).await
    }

    /// Mirror every local network user: provisioned users are upserted, the rest disabled.
    /// `rate_limits` maps profile name to a rate-limit string.
    pub async fn sync_all(&self, users: &[NetworkUser], rate_limits: &HashMap<String, String>) -> RadiusSyncSummary {
        let mut summary = RadiusSyncSummary::default();
        for user in users {
            let result = if user.state == network_user_state::PROVISIONED {
                let attrs = RadiusUserAttributes {
                    username: user.username.clone(),
                    password: user.password.clone(),
                    profile: Some(user.profile.clone()),
                    framed_ip: user.static_ip.clone(),
                    rate_limit: rate_limits.get(&user.profile).cloned(),
                    session_timeout: None,
                    disabled: false,
                };
                self.upsert_user(&attrs).await.map(|_| summary.synced += 1)
            } else {
                self.set_user_disabled(&user.username, true).await.map(|_| summary.disabled += 1)
            };
            if let Err(e) = result {
                tracing::warn!("RADIUS sync failed for {}: {}", user.username, e);
                summary.failed.push(user.username.clone());
            }
        }
        summary
    }
}

fn validate(user: &RadiusUserAttributes) -> NetResult<()> {
    if user.username.trim().is_empty() {
        return Err(NetError::invalid("RADIUS username is required"));
    }
    if user.password.is_empty() {
        return Err(NetError::invalid("RADIUS password is required"));
    }
    Ok(())
}

fn validate_accounting(req: &AccountingRequest) -> NetResult<()> {
    if req.acct_session_id.trim().is_empty() || req.username.trim().is_empty() {
        return Err(NetError::invalid("accounting requires a session id and username"));
    }
    Ok(())
}

#[async_trait]
impl RadiusSync for RadiusService {
    async fn upsert_user(&self, attrs: &RadiusUserAttributes) -> NetResult<()> {
        let (check, reply) = build_attributes(attrs);
        self.bounded("write", self.store.replace_user(&attrs.username, &check, &reply)).await?;
        tracing::debug!("RADIUS user {} synced", attrs.username);
        Ok(())
    }

    async fn set_user_disabled(&self, username: &str, disabled: bool) -> NetResult<()> {
        let existing = self.bounded("read", self.store.check_attributes(username)).await?;
        if existing.is_empty() {
            return Ok(());
        }
        if disabled {
            self.bounded("write", self.store.set_check(username, &reject_attr())).await
        } else {
            self.bounded("write", self.store.remove_check(username, radius_attr::AUTH_TYPE)).await
        }
    }

    async fn delete_user(&self, username: &str) -> NetResult<bool> {
        self.bounded("write", self.store.delete_user(username)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_radius;

    async fn service() -> RadiusService {
        RadiusService::new(memory_radius().await, Duration::from_secs(5))
    }

    fn user(name: &str) -> RadiusUserAttributes {
        RadiusUserAttributes {
            username: name.into(),
            password: "s3cret".into(),
            profile: Some("10M".into()),
            framed_ip: Some("10.0.0.5".into()),
            rate_limit: Some("10M/10M".into()),
            session_timeout: None,
            disabled: false,
        }
    }

    fn acct(session: &str, name: &str) -> AccountingRequest {
        AccountingRequest {
            acct_session_id: session.into(),
            username: name.into(),
            nas_ip_address: "192.0.2.1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_attributes() {
        let (check, reply) = build_attributes(&RadiusUserAttributes {
            disabled: true,
            ..user("alice")
        });
        assert_eq!(check.len(), 2);
        assert_eq!(check[1].value, "Reject");
        let names: Vec<&str> = reply.iter().map(|a| a.attribute.as_str()).collect();
        assert_eq!(names, vec!["Framed-IP-Address", "Mikrotik-Rate-Limit", "Mikrotik-Group"]);
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let radius = service().await;
        radius.create_user(&user("alice")).await.unwrap();
        assert!(radius.create_user(&user("alice")).await.is_err());

        let mut changed = user("alice");
        changed.framed_ip = None;
        radius.update_user(&changed).await.unwrap();
        let stored = radius.get_user("alice").await.unwrap();
        assert!(stored.reply.iter().all(|a| a.attribute != "Framed-IP-Address"));

        assert!(radius.delete_user("alice").await.unwrap());
        assert!(!radius.delete_user("alice").await.unwrap());
        assert_eq!(radius.update_user(&user("alice")).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_authenticate_and_disable() {
        let radius = service().await;
        radius.sync_user(&user("bob")).await.unwrap();

        let ok = radius.authenticate("bob", "s3cret").await.unwrap();
        assert!(ok.accepted);
        assert!(ok.reply.iter().any(|a| a.value == "10.0.0.5"));

        assert!(!radius.authenticate("bob", "wrong").await.unwrap().accepted);
        assert!(!radius.authenticate("nobody", "x").await.unwrap().accepted);

        radius.set_user_disabled("bob", true).await.unwrap();
        let denied = radius.authenticate("bob", "s3cret").await.unwrap();
        assert_eq!(denied.reason.as_deref(), Some("account disabled"));

        radius.set_user_disabled("bob", false).await.unwrap();
        assert!(radius.authenticate("bob", "s3cret").await.unwrap().accepted);
    }

    #[tokio::test]
    async fn test_accounting_lifecycle() {
        let radius = service().await;
        radius.accounting_start(&acct("S1", "carol")).await.unwrap();
        assert_eq!(radius.active_sessions(Some("carol")).await.unwrap().len(), 1);

        let mut interim = acct("S1", "carol");
        interim.input_octets = 1000;
        interim.output_octets = 5000;
        interim.session_time = 60;
        let rec = radius.accounting_update(&interim).await.unwrap();
        assert_eq!(rec.output_octets, 5000);
        assert!(rec.stop_time.is_none());

        let mut stop = interim.clone();
        stop.session_time = 120;
        stop.terminate_cause = "User-Request".into();
        let rec = radius.accounting_stop(&stop).await.unwrap();
        assert!(rec.stop_time.is_some());
        assert_eq!(rec.terminate_cause, "User-Request");
        assert!(radius.active_sessions(Some("carol")).await.unwrap().is_empty());

        let history = radius.session_history("carol", 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start_opens_session() {
        let radius = service().await;
        let mut stop = acct("S9", "dave");
        stop.session_time = 30;
        let rec = radius.accounting_stop(&stop).await.unwrap();
        assert_eq!(rec.session_time, 30);
        assert!(rec.stop_time.is_some());
    }

    #[tokio::test]
    async fn test_connection_probe() {
        let radius = service().await;
        assert!(radius.test_connection().await.unwrap().success);
    }
}
