/*!
Recording command channel

Records every `(host, command)` it is asked to run. Each command answers
with the configured service status, so a test decides whether host
configuration succeeds (`active (running)`) or fails.
*/

use async_trait::async_trait;
use parking_lot::Mutex;

use takeover_kernel::pusher::{CommandChannel, CommandOutput};
use takeover_kernel::{Result, TakeoverError};

pub const SERVICE_RUNNING: &str = "nova-compute.service\n   Active: active (running)";
pub const SERVICE_FAILED: &str = "nova-compute.service\n   Active: failed (Result: exit-code)";

pub struct MockChannel {
    ran: Mutex<Vec<(String, String)>>,
    status: Mutex<String>,
    unreachable: Mutex<bool>,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            ran: Mutex::new(Vec::new()),
            status: Mutex::new(SERVICE_RUNNING.to_string()),
            unreachable: Mutex::new(false),
        }
    }

    pub fn set_status(&self, status: &str) {
        *self.status.lock() = status.to_string();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }

    pub fn ran(&self) -> Vec<(String, String)> {
        self.ran.lock().clone()
    }

    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.ran.lock().iter().filter(|(h, _)| h == host).map(|(_, c)| c.clone()).collect()
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    async fn run(&self, host: &str, command: &str) -> Result<CommandOutput> {
        if *self.unreachable.lock() {
            return Err(TakeoverError::RemoteConnect(format!("ssh to {host} refused")));
        }
        self.ran.lock().push((host.to_string(), command.to_string()));
        log::debug!("[mock-ssh] {}: {}", host, command);
        Ok(CommandOutput {
            stdout: self.status.lock().clone(),
            stderr: String::new(),
            exit_code: 0,
            execution_time_ms: 1,
        })
    }
}
