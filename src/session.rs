//! Remote shell sessions.
//!
//! A `Connector` opens one `Shell` per host. A `Shell` is a live interactive
//! shell: lines go in, output comes out in whatever chunks the transport
//! delivers. Pattern matching on top of that lives in `crate::expect`.

use std::time::Duration;

use async_trait::async_trait;
use openssh::{ChildStdin, KnownHosts, Session as SSHSession, SessionBuilder, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::error::DeployError;
use crate::host::HostEntry;

/// First line the remote shell prints once it is ready for commands.
///
/// The ssh master handles host keys itself and no login banner comes through
/// a multiplexed channel, so this is the first thing to wait for.
pub const SHELL_READY_BANNER: &str = "chfleet: remote shell ready";

/// Runs the interactive shell on a pseudo-terminal. git and sudo only prompt
/// on a terminal.
const TERMINAL_SHELL: &str = "script -qfc sh /dev/null";

/// How long `close` waits for the remote shell to exit on its own.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// What one read from a shell produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// New output bytes.
    Data(Vec<u8>),
    /// Nothing arrived within the wait.
    Quiet,
    /// The remote side closed the stream.
    Eof,
}

#[async_trait]
pub trait Shell: Send {
    /// Write `line` followed by a newline.
    async fn send_line(&mut self, line: &str) -> Result<(), DeployError>;

    /// Wait at most `wait` for the next output chunk.
    async fn read(&mut self, wait: Duration) -> Result<Chunk, DeployError>;

    /// Tear the session down. Never fails; problems are only reported.
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, host: &HostEntry) -> Result<Box<dyn Shell>, DeployError>;
}

/// Opens shells through an OpenSSH multiplexed master connection.
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// What `sh -c` runs on the remote side.
fn remote_shell_command() -> String {
    format!("'echo \"{}\"; exec {}'", SHELL_READY_BANNER, TERMINAL_SHELL)
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, host: &HostEntry) -> Result<Box<dyn Shell>, DeployError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(host.credentials.user.clone())
            .keyfile(&host.credentials.key_file)
            .known_hosts_check(KnownHosts::Add)
            .connect_timeout(self.connect_timeout);
        let session = match builder.connect_mux(&host.address).await {
            Ok(session) => session,
            Err(e) => {
                eprintln!("{} Failed to connect to host: {:?}", host.label, e);
                return Err(e.into());
            }
        };
        eprintln!("{} Connected to host.", host.label);
        Ok(Box::new(SshShell::spawn(session, host.label.to_string()).await?))
    }
}

/// `sh` running on the remote host, with stdout and stderr merged into one stream.
///
/// The remote child borrows the ssh session, so both live in one driver task
/// that waits for the shell to exit and then closes the session. This side
/// only holds the stdin pipe and the output channel.
pub struct SshShell {
    stdin: ChildStdin,
    output: flume::Receiver<Vec<u8>>,
    driver: JoinHandle<()>,
}

impl SshShell {
    async fn spawn(session: SSHSession, label: String) -> Result<Self, DeployError> {
        let (opened_tx, opened) = flume::bounded(1);
        let driver = tokio::spawn(drive(session, label, opened_tx));
        match opened.recv_async().await {
            Ok(Ok((stdin, output))) => Ok(Self {
                stdin,
                output,
                driver,
            }),
            Ok(Err(e)) => {
                let _ = driver.await;
                Err(e)
            }
            // The driver died before reporting back.
            Err(_) => Err(DeployError::EndOfStream),
        }
    }
}

type Opened = Result<(ChildStdin, flume::Receiver<Vec<u8>>), DeployError>;

/// Owns the session for as long as the remote shell runs.
async fn drive(session: SSHSession, label: String, opened: flume::Sender<Opened>) {
    run_shell(&session, opened).await;
    if let Err(e) = session.close().await {
        eprintln!("{} Error while terminating connection: {}", label, e);
    }
}

async fn run_shell(session: &SSHSession, opened: flume::Sender<Opened>) {
    let mut command = session.command("sh");
    command
        .arg("-c")
        .raw_arg(remote_shell_command())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = match command.spawn().await {
        Ok(child) => child,
        Err(e) => {
            let _ = opened.send_async(Err(e.into())).await;
            return;
        }
    };
    let pipes = (
        child.stdin().take(),
        child.stdout().take(),
        child.stderr().take(),
    );
    let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
        let _ = opened.send_async(Err(DeployError::EndOfStream)).await;
        return;
    };

    // The channel disconnects once both pumps hit EOF, which is how `read`
    // learns that the remote shell is gone.
    let (tx, output) = flume::unbounded();
    tokio::spawn(pump(stdout, tx.clone()));
    tokio::spawn(pump(stderr, tx));
    if opened.send_async(Ok((stdin, output))).await.is_err() {
        return;
    }

    match child.wait().await {
        Ok(status) => tracing::debug!(%status, "remote shell exited"),
        Err(e) => tracing::debug!(error = %e, "remote shell wait failed"),
    }
}
async fn pump<R: AsyncRead + Unpin>(mut stream: R, tx: flume::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send_async(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Shell for SshShell {
    async fn send_line(&mut self, line: &str) -> Result<(), DeployError> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read(&mut self, wait: Duration) -> Result<Chunk, DeployError> {
        match tokio::time::timeout(wait, self.output.recv_async()).await {
            Ok(Ok(bytes)) => Ok(Chunk::Data(bytes)),
            Ok(Err(flume::RecvError::Disconnected)) => Ok(Chunk::Eof),
            Err(_) => Ok(Chunk::Quiet),
        }
    }

    async fn close(self: Box<Self>) {
        let Self {
            stdin,
            output,
            mut driver,
        } = *self;
        // Closing stdin makes an idle shell exit, which lets the driver close
        // the session.
        drop(stdin);
        drop(output);
        if tokio::time::timeout(CLOSE_GRACE, &mut driver).await.is_err() {
            tracing::debug!("remote shell did not exit in time");
            // Dropping the session tears the master connection down.
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_shell_gets_a_terminal() {
        let command = remote_shell_command();
        assert!(command.starts_with("'echo \"chfleet: remote shell ready\";"));
        assert!(command.ends_with("exec script -qfc sh /dev/null'"));
    }
}
