//! Command loop shared by the storlet daemon and the daemon factory

use crate::errors::SandError;
use std::panic::{self, AssertUnwindSafe};
use storlets_protocol::{Command, Datagram, ReplyChannel, Request, SBus, ServiceReply};

/// Outcome of one command, and whether the loop keeps going afterwards
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandResponse {
    pub status: bool,
    pub message: String,
    pub task_id: Option<String>,
    pub keep_running: bool,
}

impl CommandResponse {
    pub fn success<S: Into<String>>(message: S) -> Self {
        CommandResponse {
            status: true,
            message: message.into(),
            task_id: None,
            keep_running: true,
        }
    }

    pub fn failure<S: Into<String>>(message: S) -> Self {
        CommandResponse {
            status: false,
            ..CommandResponse::success(message)
        }
    }

    pub fn task_id<S: Into<String>>(mut self, task_id: S) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Stop the command loop once this response is sent
    pub fn stop(mut self) -> Self {
        self.keep_running = false;
        self
    }

    pub fn reply(&self) -> ServiceReply {
        ServiceReply {
            status: self.status,
            message: self.message.clone(),
            task_id: self.task_id.clone(),
        }
    }
}

/// A server with a fixed set of commands
pub trait CommandHandler {
    /// Every command this server answers; anything else gets a failure reply
    fn commands(&self) -> &'static [Command];

    /// Run one command. Handlers that must answer early take the reply
    /// channel out of `reply`; otherwise the loop sends the returned response.
    fn handle(
        &mut self,
        command: Command,
        request: Request,
        reply: &mut Option<ReplyChannel>,
    ) -> CommandResponse;

    /// Runs once after the loop stops
    fn shutdown(&mut self) {}
}

/// Handle one datagram, returning false once the loop should stop
pub fn dispatch<H: CommandHandler>(handler: &mut H, datagram: Datagram) -> bool {
    let (channel, request) = datagram.into_request();
    let mut reply = Some(channel);

    let command = request
        .command
        .parse::<Command>()
        .ok()
        .filter(|command| handler.commands().contains(command));
    let response = match command {
        None => {
            log::warn!("{} is not supported", request.command);
            CommandResponse::failure(format!("{} is not supported", request.command))
        }
        Some(command) => {
            log::debug!("handling {}", command);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                handler.handle(command, request, &mut reply)
            }));
            match result {
                Ok(response) => response,
                Err(_) => {
                    log::error!("handler for {} panicked", command);
                    CommandResponse::failure(format!("{} failed", command))
                }
            }
        }
    };

    if let Some(channel) = reply.take() {
        if let Err(err) = channel.send(&response.reply()) {
            log::warn!("failed to send reply: {}", err);
        }
    }
    response.keep_running
}

/// Receive and dispatch commands until a handler stops the loop
pub fn serve<H: CommandHandler>(sbus: &SBus, handler: &mut H) -> Result<(), SandError> {
    log::info!(
        "serving {:?} on {:?}",
        handler.commands(),
        sbus.path()
    );
    let result = run(sbus, handler);
    handler.shutdown();
    result
}

fn run<H: CommandHandler>(sbus: &SBus, handler: &mut H) -> Result<(), SandError> {
    loop {
        sbus.listen(None)?;
        let datagram = match sbus.receive() {
            Ok(datagram) => datagram,
            Err(storlets_protocol::ProtocolError::IOError(err)) => Err(err)?,
            Err(err) => {
                log::warn!("dropping malformed datagram: {}", err);
                continue;
            }
        };
        if !dispatch(handler, datagram) {
            log::info!("command loop stopping");
            return Ok(());
        }
    }
}
