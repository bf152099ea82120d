//! Step scripts.
//!
//! A `Script` is plain data: an ordered list of steps, each sending an
//! optional command and then waiting for something. Waiting on a set of
//! `Branch`es is a priority-ordered match: the first listed pattern found in
//! the output wins and its `Action` decides what happens next. Executing a
//! script is `crate::runner`'s job.
//!
//! Scripts never resume halfway. A retry runs the whole script again, and the
//! scripts tolerate what an earlier attempt left behind through branches like
//! "Nothing to do" and "already exists".

use std::collections::HashMap;
use std::time::Duration;

use handlebars::Handlebars;
use itertools::Itertools;

use crate::config::Settings;
use crate::error::DeployError;
use crate::expect::Pattern;
use crate::session::SHELL_READY_BANNER;

/// What ssh asks the first time it sees a host key.
pub const HOST_KEY_PROMPT: &str = "continue connecting (yes/no)?";
/// Printed by `git clone` once it succeeds. The clone command spells it with
/// quotes in the middle so an echoed command line never matches.
pub const CLONE_DONE: &str = "chfleet-clone-done";
/// Printed after the process listing, spelled like `CLONE_DONE`.
pub const LISTING_DONE: &str = "chfleet-ps-done";
/// Lines of the process listing containing this are the listing itself.
pub const LISTING_SELF: &str = "grep";
/// git's answer to a credential challenge it cannot show without a terminal.
const NO_TERMINAL: &str = "could not read";

const TEMPLATES: &[(&str, &str)] = &[
    ("install_git", "sudo yum install {{git_package}}"),
    ("install_compiler", "sudo yum install {{compiler_package}}"),
    ("clone", "git clone {{repo_url}} && echo chfleet-clone-'done'"),
    ("make_state_dir", "mkdir -p .{{repo_name}}"),
    ("enter_repo", "cd {{repo_name}}"),
    (
        "launch",
        "nohup ./{{server_binary}} > ~/.{{repo_name}}/server.log 2>&1 &",
    ),
    (
        "list_server",
        "ps aux | grep {{process_name}}; echo chfleet-ps-'done'",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Go on with the next step.
    Continue,
    /// Send a line, then go on with the next step.
    SendLine(String),
    /// Abort the script as failed.
    Fail,
    /// End the script early, successfully.
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub pattern: Pattern,
    pub action: Action,
    /// Steps that only run when this branch fires, before the rest of the
    /// enclosing step list.
    pub then: Vec<Step>,
}

impl Branch {
    pub fn new(pattern: Pattern, action: Action) -> Self {
        Self {
            pattern,
            action,
            then: vec![],
        }
    }

    pub fn on(text: &str, action: Action) -> Self {
        Self::new(Pattern::text(text), action)
    }

    pub fn then(mut self, steps: Vec<Step>) -> Self {
        self.then = steps;
        self
    }
}

/// What a step waits for after sending its command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Await {
    /// Nothing. The next step follows immediately.
    Nothing,
    /// One of the branches. `None` waits without a deadline.
    Any {
        branches: Vec<Branch>,
        timeout: Option<Duration>,
    },
    /// Output to stop arriving, which is then discarded.
    Quiet,
    /// A process listing ending in `done_marker`; every listed `process_name`
    /// process gets force-killed. Lines containing `exclude` are the listing's
    /// own.
    KillListed {
        done_marker: String,
        process_name: String,
        exclude: String,
        timeout: Option<Duration>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub command: Option<String>,
    pub wait: Await,
}

impl Step {
    /// Send `command` and move on.
    pub fn send(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            wait: Await::Nothing,
        }
    }

    /// Wait for output without sending anything first.
    pub fn expect(branches: Vec<Branch>, timeout: Option<Duration>) -> Self {
        Self {
            command: None,
            wait: Await::Any { branches, timeout },
        }
    }

    /// Send `command` and wait for one of `branches`.
    pub fn exchange(
        command: impl Into<String>,
        branches: Vec<Branch>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            command: Some(command.into()),
            wait: Await::Any { branches, timeout },
        }
    }

    pub fn drain() -> Self {
        Self {
            command: None,
            wait: Await::Quiet,
        }
    }

    pub fn kill_listed(
        command: impl Into<String>,
        done_marker: impl Into<String>,
        process_name: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            command: Some(command.into()),
            wait: Await::KillListed {
                done_marker: done_marker.into(),
                process_name: process_name.into(),
                exclude: LISTING_SELF.to_string(),
                timeout,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub name: String,
    pub steps: Vec<Step>,
}

/// Answers to git's credential challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitAuth {
    pub username: String,
    pub password: Option<String>,
}

/// What a run does to every host.
#[derive(Debug, Clone)]
pub enum Task {
    Deploy { git: Option<GitAuth> },
    Restart,
}

impl Task {
    /// The scripts one try runs, in order.
    pub fn scripts(&self, settings: &Settings) -> Result<Vec<Script>, DeployError> {
        let commands = Commands::new(settings)?;
        let script = match self {
            Task::Deploy { git } => provision_and_build(&commands, settings, git.as_ref())?,
            Task::Restart => kill_and_restart(&commands, settings)?,
        };
        Ok(vec![script])
    }

    pub fn done_message(&self) -> &'static str {
        match self {
            Task::Deploy { .. } => "Deployed on all machines",
            Task::Restart => "Restarted on all machines",
        }
    }
}

/// Command templates filled in with the settings.
struct Commands {
    registry: Handlebars<'static>,
    params: HashMap<&'static str, String>,
}

impl Commands {
    fn new(settings: &Settings) -> Result<Self, DeployError> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);
        for (name, template) in TEMPLATES {
            registry.register_template_string(name, template)?;
        }
        let params = HashMap::from([
            ("repo_name", settings.repo_name.clone()),
            ("repo_url", settings.repo_url.clone()),
            ("server_binary", settings.server_binary.clone()),
            ("process_name", settings.process_name.clone()),
            ("git_package", settings.git_package.clone()),
            ("compiler_package", settings.compiler_package.clone()),
        ]);
        Ok(Self { registry, params })
    }

    fn render(&self, name: &str) -> Result<String, DeployError> {
        Ok(self.registry.render(name, &self.params)?)
    }
}

fn login(settings: &Settings) -> Step {
    Step::expect(
        vec![
            Branch::on(HOST_KEY_PROMPT, Action::SendLine("yes".to_string())),
            Branch::on("Last login", Action::Continue),
            Branch::on(SHELL_READY_BANNER, Action::Continue),
        ],
        settings.login_timeout(),
    )
}

fn install(command: String, settings: &Settings) -> Step {
    Step::exchange(
        command,
        vec![
            Branch::on("Is this ok", Action::SendLine("y".to_string())),
            // Old yum follows this with "Error: Nothing to do".
            Branch::on("No package", Action::Fail),
            Branch::on("Nothing to do", Action::Continue),
            Branch::on("must have a tty", Action::Fail),
            Branch::on("a password is required", Action::Fail),
            Branch::on("not in the sudoers file", Action::Fail),
        ],
        settings.install_timeout(),
    )
}

/// Waits for the clone to end one way or another.
fn clone_outcome() -> Vec<Branch> {
    vec![
        Branch::on(CLONE_DONE, Action::Continue),
        Branch::on("Authentication failed", Action::Fail),
        Branch::on("unable to access", Action::Fail),
    ]
}

fn clone(command: String, git: Option<&GitAuth>, settings: &Settings) -> Step {
    let timeout = settings.clone_timeout();
    let challenge = match git {
        Some(git) => {
            let password = match &git.password {
                Some(password) => Branch::on("Password for", Action::SendLine(password.clone()))
                    .then(vec![Step::expect(clone_outcome(), timeout)]),
                None => Branch::on("Password for", Action::Fail),
            };
            let mut after_username = vec![Branch::on(NO_TERMINAL, Action::Fail), password];
            after_username.extend(clone_outcome());
            Branch::on("Username for", Action::SendLine(git.username.clone()))
                .then(vec![Step::expect(after_username, timeout)])
        }
        None => Branch::on("Username for", Action::Fail),
    };
    // "could not read Username for" also contains the challenge text.
    let mut branches = vec![
        Branch::on(NO_TERMINAL, Action::Fail),
        challenge,
        Branch::on("already exists", Action::Continue),
    ];
    branches.extend(clone_outcome());
    Step::exchange(command, branches, timeout)
}

/// `exit`, then wait for the shell to work through everything queued before
/// it and hang up.
fn finish(settings: &Settings) -> Step {
    Step::exchange(
        "exit",
        vec![Branch::new(Pattern::Eof, Action::Continue)],
        settings.finish_timeout(),
    )
}

fn provision_and_build(
    commands: &Commands,
    settings: &Settings,
    git: Option<&GitAuth>,
) -> Result<Script, DeployError> {
    let steps = vec![
        login(settings),
        install(commands.render("install_git")?, settings),
        install(commands.render("install_compiler")?, settings),
        clone(commands.render("clone")?, git, settings),
        Step::send(commands.render("make_state_dir")?),
        Step::send(commands.render("enter_repo")?),
        Step::send("make"),
        Step::send(commands.render("launch")?),
        finish(settings),
    ];
    Ok(Script {
        name: "provision-and-build".to_string(),
        steps,
    })
}

fn kill_and_restart(commands: &Commands, settings: &Settings) -> Result<Script, DeployError> {
    let steps = vec![
        login(settings),
        Step::drain(),
        Step::kill_listed(
            commands.render("list_server")?,
            LISTING_DONE,
            settings.process_name.clone(),
            settings.listing_timeout(),
        ),
        Step::send(commands.render("make_state_dir")?),
        Step::send(commands.render("enter_repo")?),
        Step::send(commands.render("launch")?),
        finish(settings),
    ];
    Ok(Script {
        name: "kill-and-restart".to_string(),
        steps,
    })
}

/// Process ids in `ps aux` output.
///
/// A line counts if it mentions `process_name` and not `exclude`. The pid is
/// the second whitespace-separated field; lines without one are skipped.
pub fn extract_pids(listing: &str, process_name: &str, exclude: &str) -> Vec<u32> {
    listing
        .lines()
        .filter(|line| line.contains(process_name) && !line.contains(exclude))
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|pid| pid.parse().ok())
        .unique()
        .collect()
}

pub fn kill_command(pid: u32) -> String {
    format!("kill -9 {}", pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands_of(script: &Script) -> Vec<&str> {
        script
            .steps
            .iter()
            .filter_map(|step| step.command.as_deref())
            .collect()
    }

    #[test]
    fn test_pid_from_genuine_line_only() {
        let listing = "ps aux | grep chserver\r\n\
                       ec2-user  4821  0.0  0.1  1234  567 ?  S  10:00  0:00 ./bin/chserver\r\n\
                       ec2-user  4830  0.0  0.0  1100  400 pts/0 S+ 10:01 0:00 grep chserver\r\n";
        assert_eq!(extract_pids(listing, "chserver", "grep"), vec![4821]);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let listing = "chserver\nuser notapid chserver\n  root   77 ./chserver --port 8712\n";
        assert_eq!(extract_pids(listing, "chserver", "grep"), vec![77]);
    }

    #[test]
    fn test_no_match_no_pids() {
        assert!(extract_pids("root 1 init\n", "chserver", "grep").is_empty());
        assert!(extract_pids("", "chserver", "grep").is_empty());
    }

    #[test]
    fn test_deploy_commands_follow_settings() {
        let settings = Settings {
            repo_name: "chadoop".to_string(),
            repo_url: "https://example.com/chadoop".to_string(),
            server_binary: "bin/chserver".to_string(),
            ..Settings::default()
        };
        let scripts = Task::Deploy { git: None }.scripts(&settings).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(
            commands_of(&scripts[0]),
            vec![
                "sudo yum install git",
                "sudo yum install gcc-c++",
                "git clone https://example.com/chadoop && echo chfleet-clone-'done'",
                "mkdir -p .chadoop",
                "cd chadoop",
                "make",
                "nohup ./bin/chserver > ~/.chadoop/server.log 2>&1 &",
                "exit",
            ]
        );
    }

    #[test]
    fn test_commands_never_contain_their_markers() {
        let commands = Commands::new(&Settings::default()).unwrap();
        assert!(!commands.render("clone").unwrap().contains(CLONE_DONE));
        assert!(!commands.render("list_server").unwrap().contains(LISTING_DONE));
    }

    #[test]
    fn test_install_fails_on_sudo_and_yum_errors() {
        let step = install("sudo yum install git".to_string(), &Settings::default());
        let Await::Any { branches, timeout } = step.wait else {
            panic!("install step must wait for branches");
        };
        assert_eq!(timeout, Some(Duration::from_secs(600)));
        let action = |text: &str| {
            branches
                .iter()
                .find(|b| b.pattern == Pattern::text(text))
                .map(|b| b.action.clone())
        };
        assert_eq!(action("must have a tty"), Some(Action::Fail));
        assert_eq!(action("No package"), Some(Action::Fail));
        let no_package = branches.iter().position(|b| b.pattern == Pattern::text("No package"));
        let nothing = branches.iter().position(|b| b.pattern == Pattern::text("Nothing to do"));
        assert!(no_package < nothing);
    }

    #[test]
    fn test_restart_kills_by_process_name() {
        let settings = Settings {
            process_name: "chserver".to_string(),
            ..Settings::default()
        };
        let scripts = Task::Restart.scripts(&settings).unwrap();
        let steps = &scripts[0].steps;
        assert_eq!(steps[1].wait, Await::Quiet);
        assert_eq!(
            steps[2].command.as_deref(),
            Some("ps aux | grep chserver; echo chfleet-ps-'done'")
        );
        assert_eq!(
            steps[2].wait,
            Await::KillListed {
                done_marker: LISTING_DONE.to_string(),
                process_name: "chserver".to_string(),
                exclude: "grep".to_string(),
                timeout: Some(Duration::from_secs(30)),
            }
        );
    }

    #[test]
    fn test_clone_without_credentials_fails_on_challenge() {
        let step = clone("git clone x".to_string(), None, &Settings::default());
        let Await::Any { branches, .. } = step.wait else {
            panic!("clone step must wait for branches");
        };
        assert_eq!(branches[0].pattern, Pattern::text("could not read"));
        assert_eq!(branches[0].action, Action::Fail);
        assert_eq!(branches[1].pattern, Pattern::text("Username for"));
        assert_eq!(branches[1].action, Action::Fail);
        assert_eq!(branches[2].pattern, Pattern::text("already exists"));
    }

    #[test]
    fn test_clone_with_credentials_answers_challenge() {
        let git = GitAuth {
            username: "alice".to_string(),
            password: Some("secret".to_string()),
        };
        let step = clone("git clone x".to_string(), Some(&git), &Settings::default());
        let Await::Any { branches, .. } = step.wait else {
            panic!("clone step must wait for branches");
        };
        assert_eq!(branches[0].action, Action::Fail);
        assert_eq!(branches[1].action, Action::SendLine("alice".to_string()));
        let Await::Any { branches: inner, .. } = &branches[1].then[0].wait else {
            panic!("username branch must wait for the password challenge");
        };
        assert_eq!(inner[0].pattern, Pattern::text("could not read"));
        assert_eq!(inner[1].pattern, Pattern::text("Password for"));
        assert_eq!(inner[1].action, Action::SendLine("secret".to_string()));
        assert!(!inner[1].then.is_empty());
    }
}
