//! Bounded per-host retries.

use crate::host::HostEntry;
use crate::runner::{SessionRunner, TaskOutcome};
use crate::script::Script;

pub struct RetryController {
    runner: SessionRunner,
}

impl RetryController {
    pub fn new(runner: SessionRunner) -> Self {
        Self { runner }
    }

    /// Run `scripts` against `host` until one try gets all of them through.
    ///
    /// A try runs every script in order, each in a fresh session, and fails at
    /// the first script that does not succeed. A failed try starts over from
    /// the first script; there is no resuming from where it broke off, since
    /// the scripts cope with leftovers of earlier tries on their own. Gives up
    /// after `max_tries` tries, or right away once the run is cancelled.
    pub async fn attempt(&self, host: &HostEntry, scripts: &[Script], max_tries: usize) -> bool {
        let mut tries = 0;
        while tries < max_tries {
            tries += 1;
            match self.try_once(host, scripts).await {
                TaskOutcome::Success => {
                    eprintln!("{} Done after {} tries.", host.label, tries);
                    return true;
                }
                TaskOutcome::Cancelled => {
                    eprintln!("{} Cancelled, not trying again.", host.label);
                    return false;
                }
                outcome => {
                    tracing::info!(host = %host.address, tries, %outcome, "try failed");
                    eprintln!("{} Try {}/{} failed: {}", host.label, tries, max_tries, outcome);
                }
            }
        }
        eprintln!("{} Fail to finish after {} tries.", host.label, tries);
        false
    }

    async fn try_once(&self, host: &HostEntry, scripts: &[Script]) -> TaskOutcome {
        for script in scripts {
            let outcome = self.runner.run(host, script).await;
            if !outcome.is_success() {
                return outcome;
            }
        }
        TaskOutcome::Success
    }
}
