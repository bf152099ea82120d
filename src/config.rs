//! Configuration for chfleet.
//!
//! Holds the clap structs for command line arguments and the deployment
//! `Settings`, which come with defaults and can be overridden by a YAML file
//! and then by command line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::DeployError;

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    #[command(subcommand)]
    pub mode: Mode,

    /// YAML file overriding the deployment settings
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// How many hosts to work on at the same time
    #[arg(long, short, global = true)]
    pub parallel: Option<usize>,

    /// How many times to try each host before giving up on it
    #[arg(long, global = true)]
    pub max_tries: Option<usize>,

    /// Remote login user
    #[arg(long, short, global = true)]
    pub user: Option<String>,
}

#[derive(Subcommand)]
pub enum Mode {
    /// Install dependencies, clone, build and launch the server on every host
    Deploy {
        /// Host file, one address per line
        config_file: PathBuf,
        /// Private key used to log into the hosts
        private_key_file: PathBuf,
        /// Answer to git's username challenge while cloning
        git_username: Option<String>,
        /// Answer to git's password challenge while cloning
        git_password: Option<String>,
    },
    /// Kill the running server on every host and launch it again
    Restart {
        /// Host file, one address per line
        config_file: PathBuf,
        /// Private key used to log into the hosts
        private_key_file: PathBuf,
    },
}

impl Mode {
    pub fn config_file(&self) -> &Path {
        match self {
            Mode::Deploy { config_file, .. } | Mode::Restart { config_file, .. } => config_file,
        }
    }

    pub fn private_key_file(&self) -> &Path {
        match self {
            Mode::Deploy {
                private_key_file, ..
            }
            | Mode::Restart {
                private_key_file, ..
            } => private_key_file,
        }
    }
}

/// Everything about the deployed server and how patient to be with hosts.
///
/// Timeouts given as `None` are unbounded, but still give way to Ctrl-c.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub user: String,
    pub repo_name: String,
    pub repo_url: String,
    /// Server binary path, relative to the repository root.
    pub server_binary: String,
    /// What the server shows up as in `ps aux`.
    pub process_name: String,
    pub git_package: String,
    pub compiler_package: String,
    pub max_tries: usize,
    pub parallelism: usize,
    pub connect_timeout_secs: u64,
    pub login_timeout_secs: Option<u64>,
    pub install_timeout_secs: Option<u64>,
    pub clone_timeout_secs: Option<u64>,
    pub finish_timeout_secs: Option<u64>,
    pub listing_timeout_secs: Option<u64>,
    pub drain_poll_ms: u64,
    pub drain_quiet_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user: "ec2-user".to_string(),
            repo_name: "cHadoop".to_string(),
            repo_url: "https://github.com/lidajian/cHadoop".to_string(),
            server_binary: "bin/cHadoopServer".to_string(),
            process_name: "cHadoopServer".to_string(),
            git_package: "git".to_string(),
            compiler_package: "gcc-c++".to_string(),
            max_tries: 5,
            parallelism: 8,
            connect_timeout_secs: 30,
            login_timeout_secs: Some(5),
            install_timeout_secs: Some(600),
            clone_timeout_secs: Some(600),
            finish_timeout_secs: Some(1800),
            listing_timeout_secs: Some(30),
            drain_poll_ms: 100,
            drain_quiet_ms: 100,
        }
    }
}

impl Settings {
    /// Defaults, overridden by the YAML file at `path` if one is given.
    pub fn load(path: Option<&Path>) -> Result<Self, DeployError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content =
            std::fs::read_to_string(path).map_err(|source| DeployError::ReadError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, DeployError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Command line flags win over the settings file.
    pub fn apply_cli(&mut self, cli: &Config) {
        if let Some(parallel) = cli.parallel {
            self.parallelism = parallel;
        }
        if let Some(max_tries) = cli.max_tries {
            self.max_tries = max_tries;
        }
        if let Some(user) = &cli.user {
            self.user = user.clone();
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Upper bound on opening a session: connecting plus spawning the remote shell.
    pub fn open_timeout(&self) -> Duration {
        self.connect_timeout().saturating_mul(2)
    }

    pub fn login_timeout(&self) -> Option<Duration> {
        self.login_timeout_secs.map(Duration::from_secs)
    }

    pub fn install_timeout(&self) -> Option<Duration> {
        self.install_timeout_secs.map(Duration::from_secs)
    }

    pub fn clone_timeout(&self) -> Option<Duration> {
        self.clone_timeout_secs.map(Duration::from_secs)
    }

    pub fn finish_timeout(&self) -> Option<Duration> {
        self.finish_timeout_secs.map(Duration::from_secs)
    }

    pub fn listing_timeout(&self) -> Option<Duration> {
        self.listing_timeout_secs.map(Duration::from_secs)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    pub fn drain_quiet(&self) -> Duration {
        Duration::from_millis(self.drain_quiet_ms)
    }
}
