//! Fleet-wide fan-out and the final report.
//!
//! Every host runs in its own tokio task. A semaphore caps how many hosts are
//! being worked on at once, so a big fleet does not run the local machine out
//! of ssh connections or file descriptors. Finished hosts report back over a
//! channel to a single aggregating loop, which is the only writer of the
//! `ClusterReport`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::host::HostEntry;
use crate::retry::RetryController;
use crate::script::Script;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClusterReport {
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

impl ClusterReport {
    /// File `address` under its result. A host is only ever recorded once;
    /// later records for the same address are ignored.
    pub fn record(&mut self, address: &str, ok: bool) {
        if self.succeeded.contains(address) || self.failed.contains(address) {
            return;
        }
        if ok {
            self.succeeded.insert(address.to_string());
        } else {
            self.failed.insert(address.to_string());
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable summary, with `done_message` used when nothing failed.
    pub fn summary(&self, done_message: &str) -> String {
        if self.all_succeeded() {
            return done_message.to_string();
        }
        let mut summary = "Servers on the following machines may not run properly:".to_string();
        for address in &self.failed {
            summary.push_str("\n\t");
            summary.push_str(address);
        }
        summary
    }
}

impl fmt::Display for ClusterReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed",
            self.succeeded.len(),
            self.failed.len()
        )
    }
}

pub struct Cluster {
    retry: Arc<RetryController>,
    parallelism: usize,
    max_tries: usize,
}

impl Cluster {
    pub fn new(retry: RetryController, parallelism: usize, max_tries: usize) -> Self {
        Self {
            retry: Arc::new(retry),
            // Zero permits would never let a host start.
            parallelism: parallelism.max(1),
            max_tries,
        }
    }

    /// Work through every host and report which ones made it.
    ///
    /// Hosts are independent; a host that fails, hangs until its timeouts, or
    /// even panics only ever lands itself in `failed`.
    pub async fn run(&self, hosts: Vec<HostEntry>, scripts: Arc<Vec<Script>>) -> ClusterReport {
        let addresses: Vec<String> = hosts.iter().map(|host| host.address.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        // MPMC channel (used as MPSC) for hosts to report their result.
        let (done_tx, done_rx) = flume::unbounded::<(String, bool)>();

        let mut tasks = Vec::with_capacity(hosts.len());
        for host in hosts {
            let retry = Arc::clone(&self.retry);
            let scripts = Arc::clone(&scripts);
            let semaphore = Arc::clone(&semaphore);
            let done_tx = done_tx.clone();
            let max_tries = self.max_tries;
            tasks.push(tokio::spawn(async move {
                // The semaphore is never closed.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let ok = retry.attempt(&host, &scripts, max_tries).await;
                let _ = done_tx.send_async((host.address, ok)).await;
            }));
        }
        drop(done_tx);

        let mut report = ClusterReport::default();
        while let Ok((address, ok)) = done_rx.recv_async().await {
            report.record(&address, ok);
        }
        for result in join_all(tasks).await {
            if let Err(e) = result {
                eprintln!("[chfleet] A host task died: {}", e);
            }
        }

        // Hosts whose task died never reported back.
        for address in &addresses {
            report.record(address, false);
        }
        tracing::info!(%report, "run finished");
        report
    }
}
