//! Scripted [`RemoteExecutor`] for tests
//!
//! Responses are matched by host address and a substring of the script;
//! the most recently added rule wins. Unmatched scripts exit 0 with empty
//! output. Every call is recorded.

use crate::error::{ProvisionError, ProvisionResult};
use crate::executor::{CommandOutput, HostConnection, RemoteExecutor};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// What a matched script produces
#[derive(Debug, Clone)]
pub enum Response {
    Output(CommandOutput),
    /// Fail to reach the host
    Unreachable,
    /// Overrun the call's timeout
    Hang,
}

impl Response {
    pub fn stdout(stdout: &str) -> Self {
        Self::exit(0, stdout, "")
    }

    pub fn exit(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self::Output(CommandOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        })
    }
}

struct Rule {
    address: Option<String>,
    needle: String,
    /// Played in order; the last one repeats
    responses: VecDeque<Response>,
}

/// One recorded invocation
#[derive(Debug, Clone)]
pub struct Call {
    pub host_name: String,
    pub address: String,
    pub script: String,
    pub timeout: Duration,
}

#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to scripts on `address` containing `needle`
    pub fn on(self, address: &str, needle: &str, response: Response) -> Self {
        self.push_rule(Some(address), needle, vec![response])
    }

    /// Respond to scripts on any host containing `needle`
    pub fn on_any(self, needle: &str, response: Response) -> Self {
        self.push_rule(None, needle, vec![response])
    }

    /// Play `responses` in order for matching scripts, repeating the last
    pub fn sequence(self, address: &str, needle: &str, responses: Vec<Response>) -> Self {
        self.push_rule(Some(address), needle, responses)
    }

    fn push_rule(self, address: Option<&str>, needle: &str, responses: Vec<Response>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                address: address.map(str::to_string),
                needle: needle.to_string(),
                responses: responses.into(),
            });
        }
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, address: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.address == address)
            .collect()
    }

    fn respond(&self, address: &str, script: &str) -> Response {
        let Ok(mut rules) = self.rules.lock() else {
            return Response::stdout("");
        };

        let rule = rules.iter_mut().rev().find(|rule| {
            rule.address.as_deref().map_or(true, |a| a == address) && script.contains(&rule.needle)
        });

        match rule {
            Some(rule) if rule.responses.len() > 1 => rule
                .responses
                .pop_front()
                .unwrap_or_else(|| Response::stdout("")),
            Some(rule) => rule
                .responses
                .front()
                .cloned()
                .unwrap_or_else(|| Response::stdout("")),
            None => Response::stdout(""),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        connection: &HostConnection,
        script: &str,
        timeout: Duration,
    ) -> ProvisionResult<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Call {
                host_name: connection.host_name.clone(),
                address: connection.address.clone(),
                script: script.to_string(),
                timeout,
            });
        }

        match self.respond(&connection.address, script) {
            Response::Output(output) => Ok(output),
            Response::Unreachable => Err(ProvisionError::Connection {
                host: connection.address.clone(),
                message: "Connection refused".to_string(),
            }),
            Response::Hang => {
                tokio::time::sleep(timeout).await;
                Err(ProvisionError::Timeout {
                    host: connection.address.clone(),
                    after: timeout,
                })
            }
        }
    }
}
