//! The per-sandbox daemon factory: starts, watches and stops storlet daemons

use crate::{
    errors::SandError,
    launch::{LaunchCommand, Launcher},
    process::{self, Pid, ProcessState},
    server::{CommandHandler, CommandResponse},
};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    process::{Child, Command as ProcessCommand, Stdio},
    thread,
    time::Duration,
};
use storlets_protocol::{Command, DaemonSpec, Params, ReplyChannel, Request, SBusClient};

const COMMANDS: &[Command] = &[
    Command::StartDaemon,
    Command::StopDaemon,
    Command::StopDaemons,
    Command::DaemonStatus,
    Command::Ping,
    Command::Halt,
];

/// How long a freshly spawned daemon gets before it must answer a ping
#[derive(Clone, Debug)]
pub struct StartupPolicy {
    pub settle: Duration,
    pub ping_attempts: usize,
    pub ping_interval: Duration,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        StartupPolicy {
            settle: Duration::from_secs(1),
            ping_attempts: 10,
            ping_interval: Duration::from_secs(1),
        }
    }
}

/// What the factory knows about one storlet's daemon
#[derive(Debug)]
struct DaemonRecord {
    uds_path: String,
    pid: Option<Pid>,
    relay: Option<Child>,
}

impl DaemonRecord {
    /// Forget the process, reaping its log relay if there was one
    fn clear(&mut self) {
        self.pid = None;
        if let Some(mut relay) = self.relay.take() {
            if let Err(err) = relay.wait() {
                log::warn!("failed to reap log relay: {}", err);
            }
        }
    }
}

fn str_param(params: &Params, name: &'static str) -> Result<String, SandError> {
    match params.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(SandError::MissingParam(name)),
    }
}

/// Parse the parameters of a start_daemon request
pub fn daemon_spec(params: &Params) -> Result<DaemonSpec, SandError> {
    let pool_size = str_param(params, "pool_size")?;
    Ok(DaemonSpec {
        language: str_param(params, "daemon_language")?,
        language_version: str_param(params, "daemon_language_version").ok(),
        storlet_path: str_param(params, "storlet_path")?,
        storlet_name: str_param(params, "storlet_name")?,
        uds_path: str_param(params, "uds_path")?,
        log_level: str_param(params, "log_level")?,
        pool_size: pool_size.parse().map_err(|_| SandError::InvalidParam {
            name: "pool_size",
            value: pool_size.clone(),
        })?,
    })
}

pub struct DaemonFactory {
    launcher: Launcher,
    log_relay: Option<Vec<String>>,
    policy: StartupPolicy,
    daemons: BTreeMap<String, DaemonRecord>,
}

impl DaemonFactory {
    pub fn new(launcher: Launcher) -> Self {
        DaemonFactory {
            launcher,
            log_relay: None,
            policy: StartupPolicy::default(),
            daemons: BTreeMap::new(),
        }
    }

    /// Pipe each daemon's stderr into this command
    pub fn log_relay(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.log_relay = Some(command);
        }
        self
    }

    pub fn startup_policy(mut self, policy: StartupPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether the named daemon is alive, forgetting it if it is not
    pub fn is_running(&mut self, storlet_name: &str) -> Result<bool, SandError> {
        let record = match self.daemons.get_mut(storlet_name) {
            Some(record) => record,
            None => return Ok(false),
        };
        let pid = match record.pid {
            Some(pid) => pid,
            None => return Ok(false),
        };
        match process::check(pid)? {
            ProcessState::Running => Ok(true),
            state => {
                log::debug!("daemon {} (pid {}) is gone: {:?}", storlet_name, pid, state);
                record.clear();
                Ok(false)
            }
        }
    }

    fn spawn(&self, storlet_name: &str, launch: &LaunchCommand) -> Result<(Pid, Option<Child>), SandError> {
        log::debug!("starting daemon for {}: {:?}", storlet_name, launch);
        let mut cmd = launch.command();
        cmd.stdin(Stdio::null()).stdout(Stdio::null());
        if self.log_relay.is_some() {
            cmd.stderr(Stdio::piped());
        }
        let mut child = cmd.spawn()?;
        let pid = child.id() as Pid;

        let relay = match (&self.log_relay, child.stderr.take()) {
            (Some(relay), Some(stderr)) => {
                let spawned = ProcessCommand::new(&relay[0])
                    .args(&relay[1..])
                    .stdin(Stdio::from(stderr))
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn();
                match spawned {
                    Ok(relay) => Some(relay),
                    Err(err) => {
                        log::warn!("failed to start log relay for {}: {}", storlet_name, err);
                        None
                    }
                }
            }
            _ => None,
        };
        Ok((pid, relay))
    }

    fn wait_for_ping(&self, uds_path: &str) -> bool {
        let client = SBusClient::new(uds_path);
        for attempt in 0..self.policy.ping_attempts {
            match client.ping() {
                Ok(reply) if reply.status => return true,
                Ok(reply) => log::debug!("ping {} failed: {}", attempt, reply.message),
                Err(err) => log::debug!("ping {} failed: {}", attempt, err),
            }
            thread::sleep(self.policy.ping_interval);
        }
        false
    }

    /// Kill and reap whatever process is recorded for this storlet
    fn kill(&mut self, storlet_name: &str) -> Result<Option<(Pid, i32)>, SandError> {
        let record = match self.daemons.get_mut(storlet_name) {
            Some(record) => record,
            None => return Ok(None),
        };
        let pid = match record.pid {
            Some(pid) => pid,
            None => return Ok(None),
        };
        process::signal(pid, libc::SIGKILL)?;
        let code = match process::wait(pid)? {
            ProcessState::Exited(code) => code,
            _ => 0,
        };
        record.clear();
        Ok(Some((pid, code)))
    }

    /// Best effort kill of a daemon whose state could not be read, then forget it
    fn abandon(&mut self, storlet_name: &str, pid: Pid) {
        if let Err(err) = process::signal(pid, libc::SIGKILL) {
            log::error!("failed to kill daemon {} (pid {}): {}", storlet_name, pid, err);
        } else if let Err(err) = process::wait(pid) {
            log::error!("failed to reap daemon {} (pid {}): {}", storlet_name, pid, err);
        }
        if let Some(record) = self.daemons.get_mut(storlet_name) {
            record.clear();
        }
    }

    pub fn start_daemon(&mut self, spec: &DaemonSpec) -> Result<CommandResponse, SandError> {
        let launch = self.launcher.command(spec)?;
        let name = spec.storlet_name.clone();

        log::debug!("storlet {} uses channel {}", name, spec.uds_path);
        self.daemons
            .entry(name.clone())
            .or_insert_with(|| DaemonRecord {
                uds_path: String::new(),
                pid: None,
                relay: None,
            })
            .uds_path = spec.uds_path.clone();

        if self.is_running(&name)? {
            return Ok(CommandResponse::success(format!("{} is already running", name)));
        }

        let (pid, relay) = self.spawn(&name, &launch)?;
        if let Some(record) = self.daemons.get_mut(&name) {
            record.pid = Some(pid);
            record.relay = relay;
        }

        thread::sleep(self.policy.settle);
        match self.is_running(&name) {
            Ok(true) => {}
            Ok(false) => {
                log::error!("daemon for {} terminated right after start", name);
                return Err(SandError::DaemonStartFailed(name));
            }
            Err(err) => {
                log::error!("failed to check daemon for {}: {}", name, err);
                self.abandon(&name, pid);
                return Err(err);
            }
        }
        if !self.wait_for_ping(&spec.uds_path) {
            log::error!("daemon for {} never answered ping", name);
            if let Err(err) = self.kill(&name) {
                log::error!("failed to kill daemon for {}: {}", name, err);
                self.abandon(&name, pid);
            }
            return Err(SandError::DaemonStartFailed(name));
        }
        log::info!("daemon for {} started with pid {}", name, pid);
        Ok(CommandResponse::success("OK"))
    }

    pub fn stop_daemon(&mut self, storlet_name: &str) -> Result<CommandResponse, SandError> {
        match self.kill(storlet_name)? {
            Some((pid, code)) => Ok(CommandResponse::success(format!(
                "Storlet {}, PID = {}, ErrCode = {}",
                storlet_name, pid, code
            ))),
            None => Ok(CommandResponse::failure(format!(
                "{} is not found",
                storlet_name
            ))),
        }
    }

    pub fn daemon_status(&mut self, storlet_name: &str) -> Result<CommandResponse, SandError> {
        Ok(if self.is_running(storlet_name)? {
            CommandResponse::success(format!("Storlet {} seems to be running", storlet_name))
        } else {
            CommandResponse::failure(format!("No running storlet daemons for {}", storlet_name))
        })
    }

    fn running_names(&self) -> Vec<String> {
        self.daemons
            .iter()
            .filter(|(_, record)| record.pid.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn stop_daemons(&mut self) -> CommandResponse {
        let mut failed = Vec::new();
        for name in self.running_names() {
            if let Err(err) = self.kill(&name) {
                log::error!("failed to kill daemon {}: {}", name, err);
                failed.push(name);
            }
        }
        if failed.is_empty() {
            CommandResponse::success("Killed all storlet daemons")
        } else {
            CommandResponse::failure(format!(
                "Failed to kill some storlet daemons: {}",
                failed.join(", ")
            ))
        }
    }

    /// Ask every daemon to halt and wait for each of them
    pub fn halt(&mut self) -> CommandResponse {
        let mut failed = Vec::new();
        let mut terminated = Vec::new();
        for name in self.running_names() {
            let uds_path = self.daemons[&name].uds_path.clone();
            let halted = match SBusClient::new(&uds_path).halt() {
                Ok(reply) if reply.status => true,
                Ok(reply) => {
                    log::error!("daemon {} refused to halt: {}", name, reply.message);
                    false
                }
                Err(err) => {
                    log::error!("failed to send halt to daemon {}: {}", name, err);
                    false
                }
            };
            if !halted {
                failed.push(name.clone());
                // still make sure the process is gone before waiting on it
                if let Some(pid) = self.daemons[&name].pid {
                    if let Err(err) = process::signal(pid, libc::SIGKILL) {
                        log::error!("failed to kill daemon {}: {}", name, err);
                    }
                }
            }

            if let Some(record) = self.daemons.get_mut(&name) {
                if let Some(pid) = record.pid {
                    match process::wait(pid) {
                        Ok(state) => log::debug!("daemon {} finished: {:?}", name, state),
                        Err(err) => {
                            log::error!("failed to wait for daemon {}: {}", name, err);
                            if !failed.contains(&name) {
                                failed.push(name.clone());
                            }
                        }
                    }
                }
                record.clear();
            }
            terminated.push(format!("{}: terminated", name));
        }

        let summary = terminated.join("; ");
        let response = if failed.is_empty() {
            CommandResponse::success(summary)
        } else {
            CommandResponse::failure(format!(
                "Failed to shutdown some storlet daemons: {} ({})",
                failed.join(", "),
                summary
            ))
        };
        response.stop()
    }

    fn storlet_name(request: &Request) -> Result<String, SandError> {
        str_param(&request.params, "storlet_name")
    }
}

fn respond(result: Result<CommandResponse, SandError>) -> CommandResponse {
    result.unwrap_or_else(|err| {
        log::error!("{}", err);
        CommandResponse::failure(err.to_string())
    })
}

impl CommandHandler for DaemonFactory {
    fn commands(&self) -> &'static [Command] {
        COMMANDS
    }

    fn handle(
        &mut self,
        command: Command,
        request: Request,
        _reply: &mut Option<ReplyChannel>,
    ) -> CommandResponse {
        match command {
            Command::StartDaemon => {
                respond(daemon_spec(&request.params).and_then(|spec| self.start_daemon(&spec)))
            }
            Command::StopDaemon => respond(
                DaemonFactory::storlet_name(&request).and_then(|name| self.stop_daemon(&name)),
            ),
            Command::DaemonStatus => respond(
                DaemonFactory::storlet_name(&request).and_then(|name| self.daemon_status(&name)),
            ),
            Command::StopDaemons => self.stop_daemons(),
            Command::Ping => CommandResponse::success("OK"),
            Command::Halt => self.halt(),
            other => CommandResponse::failure(format!("{} is not supported", other)),
        }
    }

    /// Daemons left behind by a failed loop are killed rather than orphaned
    fn shutdown(&mut self) {
        if !self.running_names().is_empty() {
            self.stop_daemons();
        }
    }
}
