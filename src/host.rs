//! Fleet hosts.
//!
//! One remote shell session is opened per `HostEntry` at a time. Each host is worked on in its own
//! tokio task, independently of every other host.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::*;
use colourado::{Color, ColorPalette, PaletteType};
use itertools::Itertools;

use crate::error::DeployError;

/// How to log into a host. Shared by every host of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Remote login user.
    pub user: String,
    /// Private key file handed to ssh.
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct HostEntry {
    /// Address to connect to, as written in the host file.
    pub address: String,
    pub credentials: Arc<Credentials>,
    /// `[address]`, colored once the run knows how many hosts there are.
    pub label: ColoredString,
}

impl HostEntry {
    pub fn new(address: String, credentials: Arc<Credentials>) -> Self {
        let label = format!("[{}]", address).normal();
        Self {
            address,
            credentials,
            label,
        }
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.address)
    }
}

/// Give every host a distinct pastel label color.
pub fn paint(hosts: &mut [HostEntry]) {
    if hosts.is_empty() {
        return;
    }
    let colors = ColorPalette::new(hosts.len() as u32, PaletteType::Pastel, false).colors;
    for (host, color) in hosts.iter_mut().zip(colors) {
        host.label = host.prettify(color);
    }
}

/// Whether a host file line names a host.
///
/// Comment lines and lines without a dot are skipped.
fn is_host_line(line: &str) -> bool {
    !line.contains('#') && line.contains('.')
}

/// Parse host file content. Lines are trimmed and duplicate addresses keep their first position.
pub fn parse_hosts(content: &str, credentials: Arc<Credentials>) -> Vec<HostEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| is_host_line(line))
        .unique()
        .map(|address| HostEntry::new(address.to_string(), Arc::clone(&credentials)))
        .collect()
}

pub fn get_hosts(
    hosts_file: &Path,
    credentials: Arc<Credentials>,
) -> Result<Vec<HostEntry>, DeployError> {
    let content =
        std::fs::read_to_string(hosts_file).map_err(|source| DeployError::ReadError {
            path: hosts_file.to_path_buf(),
            source,
        })?;
    let hosts = parse_hosts(&content, credentials);
    eprintln!(
        "[chfleet] Hosts detected: {}",
        hosts.iter().map(|host| &host.address).join(", ")
    );
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Arc<Credentials> {
        Arc::new(Credentials {
            user: "ec2-user".to_string(),
            key_file: PathBuf::from("key.pem"),
        })
    }

    fn addresses(hosts: &[HostEntry]) -> Vec<&str> {
        hosts.iter().map(|h| h.address.as_str()).collect()
    }

    #[test]
    fn test_comments_and_trailing_newlines() {
        let hosts = parse_hosts("10.0.0.1\n# comment\n10.0.0.2\n", credentials());
        assert_eq!(addresses(&hosts), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_lines_without_dot_are_skipped() {
        let hosts = parse_hosts("localhost\n\n   \nnode-1.cluster\n", credentials());
        assert_eq!(addresses(&hosts), vec!["node-1.cluster"]);
    }

    #[test]
    fn test_inline_comment_skips_the_line() {
        let hosts = parse_hosts("10.0.0.1 # master\n10.0.0.2\n", credentials());
        assert_eq!(addresses(&hosts), vec!["10.0.0.2"]);
    }

    #[test]
    fn test_whitespace_trimmed_and_duplicates_dropped() {
        let hosts = parse_hosts("  10.0.0.1\r\n10.0.0.2\n10.0.0.1\n", credentials());
        assert_eq!(addresses(&hosts), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_hosts_share_credentials() {
        let creds = credentials();
        let hosts = parse_hosts("10.0.0.1\n10.0.0.2\n", Arc::clone(&creds));
        assert!(hosts.iter().all(|h| Arc::ptr_eq(&h.credentials, &creds)));
    }

    #[test]
    fn test_label_is_bracketed_address() {
        let mut hosts = parse_hosts("10.0.0.1\n", credentials());
        paint(&mut hosts);
        assert_eq!(hosts[0].to_string(), "[10.0.0.1]");
        assert!(hosts[0].label.contains("10.0.0.1"));
    }
}
