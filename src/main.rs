use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use chfleet::host::paint;
use chfleet::{
    get_hosts, Cancel, Cluster, Config, Credentials, DeployError, DrainTiming, GitAuth, Mode,
    RetryController, SessionRunner, Settings, SshConnector, Task,
};

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_cli() -> Config {
    match Config::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and are not errors.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

async fn run(cli: Config) -> Result<(), DeployError> {
    let mut settings = Settings::load(cli.settings.as_deref())?;
    settings.apply_cli(&cli);

    let task = match &cli.mode {
        Mode::Deploy {
            git_username,
            git_password,
            ..
        } => Task::Deploy {
            git: git_username.clone().map(|username| GitAuth {
                username,
                password: git_password.clone(),
            }),
        },
        Mode::Restart { .. } => Task::Restart,
    };
    let scripts = Arc::new(task.scripts(&settings)?);

    let credentials = Arc::new(Credentials {
        user: settings.user.clone(),
        key_file: cli.mode.private_key_file().to_path_buf(),
    });
    let mut hosts = get_hosts(cli.mode.config_file(), credentials)?;
    paint(&mut hosts);

    let cancel = Cancel::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("[chfleet] Ctrl-c detected. Abandoning pending hosts.");
                cancel.cancel();
            }
        });
    }

    let connector = Arc::new(SshConnector::new(settings.connect_timeout()));
    let runner = SessionRunner::new(
        connector,
        settings.open_timeout(),
        DrainTiming {
            poll: settings.drain_poll(),
            quiet: settings.drain_quiet(),
        },
        cancel,
    );
    let cluster = Cluster::new(
        RetryController::new(runner),
        settings.parallelism,
        settings.max_tries,
    );

    let report = cluster.run(hosts, scripts).await;
    println!("{}", report.summary(task.done_message()));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), DeployError> {
    let cli = parse_cli();
    setup_logging();
    run(cli).await
}
