use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Failed to connect SSH session or spawn remote shell: {0}")]
    SshError(#[from] openssh::Error),
    #[error("Failed to talk to the remote shell: {0}")]
    ShellIoError(#[from] std::io::Error),
    #[error("Failed to read {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse settings: {0}")]
    SettingsError(#[from] serde_yaml::Error),
    #[error("Failed to register command template: {0}")]
    TemplateError(#[from] handlebars::TemplateError),
    #[error("Failed to render command template: {0}")]
    RenderError(#[from] handlebars::RenderError),
    #[error("Remote shell closed the connection unexpectedly")]
    EndOfStream,
    #[error("Timed out waiting for one of {0:?}")]
    Timeout(Vec<String>),
    #[error("Run was cancelled")]
    Cancelled,
}
