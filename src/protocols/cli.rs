use async_trait::async_trait;
use std::time::Duration;

use crate::error::{NetError, NetResult};
use crate::utils::{ssh_connect, ssh_exec};

/// Line-oriented command execution on a device shell
#[async_trait]
pub trait CliClient: Send + Sync {
    /// Run `commands` in order on one session; returns one output per command
    async fn run(&self, commands: &[String]) -> NetResult<Vec<String>>;
}

pub struct SshCliClient {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl SshCliClient {
    pub fn new(host: &str, port: u16, username: &str, password: &str, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl CliClient for SshCliClient {
    async fn run(&self, commands: &[String]) -> NetResult<Vec<String>> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.username.clone();
        let pass = self.password.clone();
        let secs = self.timeout.as_secs().max(1);
        let cmds = commands.to_vec();

        let task = tokio::task::spawn_blocking(move || -> NetResult<Vec<String>> {
            let session = ssh_connect(&host, port, &user, &pass, secs)
                .map_err(NetError::DeviceUnreachable)?;
            let mut outputs = Vec::with_capacity(cmds.len());
            for cmd in &cmds {
                let out = ssh_exec(&session, cmd).map_err(NetError::DeviceUnreachable)?;
                outputs.push(out);
            }
            Ok(outputs)
        });

        // Each command gets its own timeout budget on top of the connect
        let budget = self.timeout * (commands.len() as u32 + 1);
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(NetError::DeviceUnreachable(format!("SSH task failed: {}", e))),
            Err(_) => Err(NetError::Timeout {
                operation: format!("ssh to {}:{}", self.host, self.port),
                secs: budget.as_secs(),
            }),
        }
    }
}
