//! Running one script against one host.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DeployError;
use crate::expect::{Expecter, Pattern};
use crate::host::HostEntry;
use crate::script::{extract_pids, kill_command, Action, Await, Script, Step};
use crate::session::Connector;
use crate::sync::Cancel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// The remote side hung up, or the session never opened.
    EndOfStreamFailure,
    /// An expected pattern did not show up in time.
    TimeoutFailure,
    /// A branch said to fail.
    ScriptFailure,
    /// The whole run was aborted.
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(self) -> bool {
        self == TaskOutcome::Success
    }
}

impl From<DeployError> for TaskOutcome {
    fn from(error: DeployError) -> Self {
        match error {
            DeployError::Timeout(_) => TaskOutcome::TimeoutFailure,
            DeployError::Cancelled => TaskOutcome::Cancelled,
            // Everything else is the transport giving out.
            _ => TaskOutcome::EndOfStreamFailure,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            TaskOutcome::Success => "success",
            TaskOutcome::EndOfStreamFailure => "unexpected EOF",
            TaskOutcome::TimeoutFailure => "operation timeout",
            TaskOutcome::ScriptFailure => "remote command failed",
            TaskOutcome::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Where a step sends the script next.
enum Flow<'a> {
    Next,
    /// Run these steps, then carry on.
    Descend(&'a [Step]),
    Stop,
    Fail,
}

/// How `Await::Quiet` decides the output has stopped.
#[derive(Debug, Clone, Copy)]
pub struct DrainTiming {
    pub poll: Duration,
    pub quiet: Duration,
}

pub struct SessionRunner {
    connector: Arc<dyn Connector>,
    /// Upper bound on opening a session, on top of whatever the connector enforces.
    open_timeout: Duration,
    drain: DrainTiming,
    cancel: Cancel,
}

impl SessionRunner {
    pub fn new(
        connector: Arc<dyn Connector>,
        open_timeout: Duration,
        drain: DrainTiming,
        cancel: Cancel,
    ) -> Self {
        Self {
            connector,
            open_timeout,
            drain,
            cancel,
        }
    }

    /// Open a session with `host`, run `script` in it and close it again.
    ///
    /// Every way this can go wrong ends up as a `TaskOutcome`. The session is
    /// closed on every path.
    pub async fn run(&self, host: &HostEntry, script: &Script) -> TaskOutcome {
        eprintln!("{} === {} ===", host.label, script.name);
        let outcome = match self.open(host).await {
            Ok(mut expecter) => {
                let outcome = self.execute(&mut expecter, host, script).await;
                expecter.close().await;
                outcome
            }
            Err(e) => {
                tracing::debug!(host = %host.address, error = %e, "session did not open");
                TaskOutcome::from(e)
            }
        };
        eprintln!("{} === {} done ({}) ===", host.label, script.name, outcome);
        outcome
    }

    async fn open(&self, host: &HostEntry) -> Result<Expecter, DeployError> {
        let shell = tokio::select! {
            opened = tokio::time::timeout(self.open_timeout, self.connector.open(host)) => {
                // Running out of time to connect is a failed open, not a pattern timeout.
                opened.map_err(|_| DeployError::EndOfStream)??
            }
            _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
        };
        Ok(Expecter::new(shell, self.cancel.clone()))
    }

    async fn execute(
        &self,
        expecter: &mut Expecter,
        host: &HostEntry,
        script: &Script,
    ) -> TaskOutcome {
        // Nested branch steps push their own iterator and pop when done.
        let mut stack = vec![script.steps.iter()];
        while let Some(steps) = stack.last_mut() {
            let Some(step) = steps.next() else {
                stack.pop();
                continue;
            };
            match self.step(expecter, host, step).await {
                Ok(Flow::Next) => {}
                Ok(Flow::Descend(nested)) => stack.push(nested.iter()),
                Ok(Flow::Stop) => break,
                Ok(Flow::Fail) => return TaskOutcome::ScriptFailure,
                Err(e) => {
                    eprintln!("{} Fail: {}", host.label, e);
                    return TaskOutcome::from(e);
                }
            }
        }
        TaskOutcome::Success
    }

    async fn step<'a>(
        &self,
        expecter: &mut Expecter,
        host: &HostEntry,
        step: &'a Step,
    ) -> Result<Flow<'a>, DeployError> {
        if let Some(command) = &step.command {
            expecter.send_line(command).await?;
        }
        match &step.wait {
            Await::Nothing => Ok(Flow::Next),
            Await::Any { branches, timeout } => {
                let patterns: Vec<Pattern> = branches.iter().map(|b| b.pattern.clone()).collect();
                let index = expecter.expect_any(&patterns, *timeout).await?;
                let branch = &branches[index];
                tracing::debug!(
                    host = %host.address,
                    pattern = %branch.pattern,
                    action = ?branch.action,
                    "branch taken"
                );
                match &branch.action {
                    Action::Continue => {}
                    Action::SendLine(line) => expecter.send_line(line).await?,
                    Action::Fail => {
                        eprintln!("{} Fail: remote answered {}", host.label, branch.pattern);
                        return Ok(Flow::Fail);
                    }
                    Action::Stop => return Ok(Flow::Stop),
                }
                if branch.then.is_empty() {
                    Ok(Flow::Next)
                } else {
                    Ok(Flow::Descend(&branch.then))
                }
            }
            Await::Quiet => {
                expecter.drain(self.drain.poll, self.drain.quiet).await;
                Ok(Flow::Next)
            }
            Await::KillListed {
                done_marker,
                process_name,
                exclude,
                timeout,
            } => {
                let listing = expecter.read_until(done_marker, *timeout).await?;
                for pid in extract_pids(&listing, process_name, exclude) {
                    eprintln!("{} Killing {} ({})", host.label, process_name, pid);
                    expecter.send_line(&kill_command(pid)).await?;
                }
                Ok(Flow::Next)
            }
        }
    }
}
