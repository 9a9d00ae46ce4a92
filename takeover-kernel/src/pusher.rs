//! Host configuration push over the remote command channel.
//!
//! Converting a compute node to a platform's hypervisor driver is a list of
//! shell commands run in order on that node. The last command reports the
//! compute service state; its output must contain the success marker,
//! otherwise the rollback commands are replayed and the push fails.

use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info, warn};

use crate::config::SshConf;
use crate::error::{Result, TakeoverError};

/// Captured result of one remote command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u128,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\nSTDERR:\n{}", self.stdout, self.stderr)
        }
    }
}

#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn run(&self, host: &str, command: &str) -> Result<CommandOutput>;
}

/// Runs commands through the local `ssh` client.
pub struct SshChannel {
    conf: SshConf,
}

impl SshChannel {
    pub fn new(conf: SshConf) -> Self {
        Self { conf }
    }

    fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.conf.port.to_string(),
        ];
        if let Some(identity) = &self.conf.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(format!("{}@{}", self.conf.user, host));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    async fn run(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let start_time = Instant::now();
        debug!(host, command, "ssh exec");

        let output = tokio::time::timeout(
            Duration::from_secs(self.conf.timeout_secs),
            AsyncCommand::new("ssh")
                .args(self.ssh_args(host, command))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| TakeoverError::RemoteConnect(format!("ssh to {} timed out", host)))??;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}

pub struct RemoteConfigPusher {
    channel: Arc<dyn CommandChannel>,
    success_marker: String,
}

impl RemoteConfigPusher {
    pub fn new(channel: Arc<dyn CommandChannel>, success_marker: impl Into<String>) -> Self {
        Self { channel, success_marker: success_marker.into() }
    }

    /// Runs `commands` on `host`; on failure replays `rollback` before
    /// returning `ComputeServiceActivationFailed`.
    pub async fn apply(&self, host: &str, commands: &[String], rollback: Option<&[String]>) -> Result<()> {
        validate(commands)?;
        if let Some(rollback) = rollback {
            validate(rollback)?;
        }
        if commands.is_empty() {
            return Ok(());
        }

        info!(host, count = commands.len(), "pushing host configuration");
        let detail = match self.run_all(host, commands).await {
            Ok(last) if last.contains(&self.success_marker) => {
                info!(host, "compute service active");
                return Ok(());
            }
            Ok(last) => format!("success marker missing from output: {}", last.trim()),
            Err(e) => e.to_string(),
        };

        error!(host, %detail, "host configuration failed");
        if let Some(rollback) = rollback {
            self.replay_rollback(host, rollback).await;
        }
        Err(TakeoverError::ComputeServiceActivationFailed { host: host.to_string(), detail })
    }

    async fn run_all(&self, host: &str, commands: &[String]) -> Result<String> {
        let mut last = String::new();
        for command in commands {
            let output = self.channel.run(host, command).await?;
            if output.exit_code != 0 {
                warn!(host, command = %command, exit_code = output.exit_code, "command exited non-zero");
            }
            last = output.combined();
        }
        Ok(last)
    }

    async fn replay_rollback(&self, host: &str, rollback: &[String]) {
        warn!(host, count = rollback.len(), "replaying rollback commands");
        for command in rollback {
            match self.channel.run(host, command).await {
                Ok(output) if output.exit_code != 0 => {
                    warn!(host, command = %command, exit_code = output.exit_code, "rollback command exited non-zero")
                }
                Ok(_) => {}
                Err(e) => error!(host, command = %command, error = %e, "rollback command failed"),
            }
        }
    }
}

/// Rejects commands a shell could not parse (unbalanced quotes and the like)
/// before anything reaches the host.
fn validate(commands: &[String]) -> Result<()> {
    for command in commands {
        let words = shell_words::split(command).map_err(|e| TakeoverError::InvalidCommand(format!("{}: {}", command, e)))?;
        if words.is_empty() {
            return Err(TakeoverError::InvalidCommand("empty command".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Replies with `last_output` to every command and records what ran.
    struct ScriptedChannel {
        last_output: String,
        ran: Mutex<Vec<String>>,
    }

    impl ScriptedChannel {
        fn new(last_output: &str) -> Arc<Self> {
            Arc::new(Self { last_output: last_output.into(), ran: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl CommandChannel for ScriptedChannel {
        async fn run(&self, _host: &str, command: &str) -> Result<CommandOutput> {
            self.ran.lock().push(command.to_string());
            Ok(CommandOutput {
                stdout: self.last_output.clone(),
                stderr: String::new(),
                exit_code: 0,
                execution_time_ms: 1,
            })
        }
    }

    fn cmds(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn healthy_service_skips_rollback() {
        let channel = ScriptedChannel::new("nova-compute.service\n   Active: active (running)");
        let pusher = RemoteConfigPusher::new(channel.clone(), "active (running)");

        let apply = cmds(&["cp nova.conf.a /etc/nova/nova.conf", "systemctl status nova-compute"]);
        let rollback = cmds(&["cp /etc/nova/nova.conf.bak /etc/nova/nova.conf"]);
        pusher.apply("compute-1", &apply, Some(&rollback)).await.unwrap();

        assert_eq!(*channel.ran.lock(), apply);
    }

    #[tokio::test]
    async fn failed_service_replays_rollback() {
        let channel = ScriptedChannel::new("Active: failed (Result: exit-code)");
        let pusher = RemoteConfigPusher::new(channel.clone(), "active (running)");

        let apply = cmds(&["systemctl restart nova-compute", "systemctl status nova-compute"]);
        let rollback = cmds(&["cp /etc/nova/nova.conf.bak /etc/nova/nova.conf", "systemctl restart nova-compute"]);
        let err = pusher.apply("compute-1", &apply, Some(&rollback)).await.unwrap_err();

        assert!(matches!(err, TakeoverError::ComputeServiceActivationFailed { ref host, .. } if host == "compute-1"));
        let ran = channel.ran.lock().clone();
        assert_eq!(ran.len(), 4);
        assert_eq!(&ran[2..], &rollback[..]);
    }

    #[tokio::test]
    async fn malformed_command_runs_nothing() {
        let channel = ScriptedChannel::new("active (running)");
        let pusher = RemoteConfigPusher::new(channel.clone(), "active (running)");

        let err = pusher
            .apply("compute-1", &cmds(&["echo 'unterminated"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TakeoverError::InvalidCommand(_)));
        assert!(channel.ran.lock().is_empty());
    }

    #[test]
    fn ssh_args_target_user_at_host() {
        let channel = SshChannel::new(SshConf { identity_file: Some("/root/.ssh/id".into()), ..SshConf::default() });
        let args = channel.ssh_args("compute-1", "systemctl status nova-compute");
        assert!(args.contains(&"root@compute-1".to_string()));
        assert_eq!(args.last().unwrap(), "systemctl status nova-compute");
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/root/.ssh/id"));
    }
}
