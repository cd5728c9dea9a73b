//! The per-storlet daemon: forks one worker per task, up to a fixed pool size

use crate::{
    files::{StorletInputFile, StorletLogger, StorletOutputFile},
    process::{self, Fork, Pid, ProcessState},
    server::{CommandHandler, CommandResponse},
    storlet,
};
use rand::Rng;
use std::{
    collections::HashMap,
    io,
    panic::{self, AssertUnwindSafe},
};
use storlets_protocol::{Command, FdType, ReplyChannel, Request};

const COMMANDS: &[Command] = &[Command::Execute, Command::Cancel, Command::Ping, Command::Halt];

pub struct StorletDaemon {
    storlet_name: String,
    storlet_path: Option<String>,
    pool_size: usize,
    tasks: HashMap<String, Pid>,
}

impl StorletDaemon {
    pub fn new<S: Into<String>>(storlet_name: S, pool_size: usize) -> Self {
        StorletDaemon {
            storlet_name: storlet_name.into(),
            storlet_path: None,
            pool_size: pool_size.max(1),
            tasks: HashMap::new(),
        }
    }

    /// Code path searched for executable storlets
    pub fn storlet_path<S: Into<String>>(mut self, path: S) -> Self {
        self.storlet_path = Some(path.into());
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn mint_task_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let task_id = format!("{:08x}", rng.gen::<u32>());
            if !self.tasks.contains_key(&task_id) {
                return task_id;
            }
        }
    }

    fn forget_pid(&mut self, pid: Pid) {
        self.tasks.retain(|_, task_pid| *task_pid != pid);
    }

    /// Reap every worker that has already exited
    fn reap_finished(&mut self) {
        loop {
            match process::waitpid(-1, libc::WNOHANG) {
                Ok(Some((pid, code))) => {
                    log::debug!("worker {} exited with {}", pid, code);
                    self.forget_pid(pid);
                }
                Ok(None) => return,
                Err(err) => {
                    if err.raw_os_error() == Some(libc::ECHILD) {
                        self.tasks.clear();
                    } else {
                        log::error!("failed to reap workers: {}", err);
                    }
                    return;
                }
            }
        }
    }

    /// Free at least one pool slot, blocking only if nothing has exited yet
    fn wait_child_process(&mut self) {
        let before = self.tasks.len();
        self.reap_finished();
        if self.tasks.is_empty() || self.tasks.len() < before {
            return;
        }
        match process::waitpid(-1, 0) {
            Ok(Some((pid, code))) => {
                log::debug!("worker {} exited with {}", pid, code);
                self.forget_pid(pid);
            }
            Ok(None) => {}
            Err(err) => {
                if err.raw_os_error() != Some(libc::ECHILD) {
                    log::error!("failed to wait for workers: {}", err);
                }
                self.tasks.clear();
            }
        }
    }

    fn execute(&mut self, request: Request, reply: &mut Option<ReplyChannel>) -> CommandResponse {
        let task_id = self.mint_task_id();
        while self.tasks.len() >= self.pool_size {
            self.wait_child_process();
        }

        // the caller learns the task id before the worker exists
        let response = CommandResponse::success("Successfully invoked storlet").task_id(&task_id);
        if let Some(channel) = reply.take() {
            if let Err(err) = channel.send(&response.reply()) {
                log::warn!("failed to send task id {}: {}", task_id, err);
            }
        }

        match process::fork() {
            Ok(Fork::Child) => {
                // a cancel signals the whole group, programs the storlet runs included
                if let Err(err) = process::own_process_group(0) {
                    log::error!("worker for task {} kept its process group: {}", task_id, err);
                }
                process::exit_child(self.run_task(request))
            }
            Ok(Fork::Parent(pid)) => {
                // also set here so a cancel right after fork already finds the group
                if let Err(err) = process::own_process_group(pid) {
                    log::debug!("setpgid for worker {}: {}", pid, err);
                }
                log::debug!("task {} running as worker {}", task_id, pid);
                drop(request);
                self.tasks.insert(task_id, pid);
                response
            }
            Err(err) => {
                self.report_fork_failure(&task_id, request, &err);
                CommandResponse::failure("Failed to fork storlet worker")
            }
        }
    }

    /// The caller already holds a task id, so the cause goes to the execution log too
    fn report_fork_failure(&self, task_id: &str, mut request: Request, err: &io::Error) {
        log::error!(
            "failed to fork worker for task {} (errno {:?}): {}",
            task_id,
            err.raw_os_error(),
            err
        );
        if let Some(sfd) = request.take(FdType::Logger).into_iter().next() {
            let mut logger = StorletLogger::new(self.storlet_name.clone(), sfd.fd);
            logger.error(&format!("failed to start task {}: {}", task_id, err));
        }
        // the remaining fds close here, ending the caller's reads
        drop(request);
    }

    /// Body of a forked worker, returning its exit code
    fn run_task(&self, mut request: Request) -> i32 {
        let logger_fd = request.take(FdType::Logger).into_iter().next();
        let mut logger = match logger_fd {
            Some(sfd) => StorletLogger::new(self.storlet_name.clone(), sfd.fd),
            None => {
                log::error!("execute request without a logger fd");
                return 1;
            }
        };

        let mut inputs = Vec::new();
        for sfd in request.take(FdType::InputObject) {
            match StorletInputFile::from_sfd(sfd) {
                Ok(input) => inputs.push(input),
                Err(err) => {
                    logger.error(&format!("bad input: {}", err));
                    return 1;
                }
            }
        }
        let mut outputs: Vec<StorletOutputFile> = request
            .take(FdType::OutputObject)
            .into_iter()
            .zip(request.take(FdType::OutputObjectMetadata))
            .map(|(body, metadata)| StorletOutputFile::new(metadata.fd, body.fd))
            .collect();

        let mut storlet = match storlet::load(&self.storlet_name, self.storlet_path.as_deref()) {
            Ok(storlet) => storlet,
            Err(err) => {
                logger.error(&err.to_string());
                log::error!("{}", err);
                return 1;
            }
        };

        let params = &request.params;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            storlet.invoke(&mut inputs, &mut outputs, params, &mut logger)
        }));
        match result {
            Ok(Ok(())) => 0,
            Ok(Err(err)) => {
                logger.error(&format!("storlet invocation failed: {}", err));
                log::error!("storlet invocation failed: {}", err);
                1
            }
            Err(_) => {
                logger.error("storlet invocation panicked");
                log::error!("storlet invocation panicked");
                1
            }
        }
    }

    fn cancel(&mut self, task_id: Option<String>) -> CommandResponse {
        let task_id = match task_id {
            Some(task_id) => task_id,
            None => return CommandResponse::failure("Task id is required"),
        };
        let pid = match self.tasks.get(&task_id) {
            Some(pid) => *pid,
            None => return CommandResponse::failure(format!("Task id {} is not found", task_id)),
        };
        match process::signal_group(pid, libc::SIGTERM) {
            Ok(ProcessState::Gone) => log::debug!("task {} had already finished", task_id),
            Ok(_) => log::debug!("sent SIGTERM to worker group {} of task {}", pid, task_id),
            Err(err) => {
                log::error!("failed to cancel task {}: {}", task_id, err);
                return CommandResponse::failure(format!("Failed to cancel task {}", task_id));
            }
        }
        self.tasks.remove(&task_id);
        CommandResponse::success(format!("Cancelled task {}", task_id))
    }
}

impl CommandHandler for StorletDaemon {
    fn commands(&self) -> &'static [Command] {
        COMMANDS
    }

    fn handle(
        &mut self,
        command: Command,
        request: Request,
        reply: &mut Option<ReplyChannel>,
    ) -> CommandResponse {
        match command {
            Command::Execute => self.execute(request, reply),
            Command::Cancel => self.cancel(request.task_id),
            Command::Ping => CommandResponse::success("OK"),
            Command::Halt => CommandResponse::success("OK").stop(),
            other => CommandResponse::failure(format!("{} is not supported", other)),
        }
    }

    /// Wait for every worker before the daemon exits
    fn shutdown(&mut self) {
        while !self.tasks.is_empty() {
            self.wait_child_process();
        }
        // cancelled workers are no longer tracked but still need reaping
        while let Ok(Some((pid, code))) = process::waitpid(-1, 0) {
            log::debug!("worker {} exited with {}", pid, code);
        }
    }
}
