//! chfleet: provision, build and restart a server across a fleet of SSH hosts.

// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to parse and represent hosts.
pub mod host;
// Synchronization primitives.
pub mod sync;
// Remote shell sessions.
pub mod session;
// Pattern matching on shell output.
pub mod expect;
// What to do on each host, as data.
pub mod script;
// Running one script against one host.
pub mod runner;
// Per-host retries.
pub mod retry;
// Fleet-wide fan-out and reporting.
pub mod cluster;

pub use cluster::{Cluster, ClusterReport};
pub use config::{Config, Mode, Settings};
pub use error::DeployError;
pub use expect::{Expecter, Pattern};
pub use host::{get_hosts, parse_hosts, Credentials, HostEntry};
pub use retry::RetryController;
pub use runner::{DrainTiming, SessionRunner, TaskOutcome};
pub use script::{Action, Await, Branch, GitAuth, Script, Step, Task};
pub use session::{Chunk, Connector, Shell, SshConnector};
pub use sync::Cancel;
