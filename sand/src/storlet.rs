//! Storlet implementations a daemon can run
//!
//! A handful of native storlets are built in. Any other name is looked up as
//! an executable inside the storlet's code directory and run as a filter:
//! input on stdin, output on stdout, the execution log on stderr.

use crate::{
    errors::SandError,
    files::{StorletInputFile, StorletLogger, StorletOutputFile},
};
use serde_json::Value;
use std::{
    fs::File,
    io::{self, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use storlets_protocol::Params;

/// User code invoked once per task, inside its own forked process
pub trait Storlet {
    fn invoke(
        &mut self,
        inputs: &mut [StorletInputFile],
        outputs: &mut [StorletOutputFile],
        params: &Params,
        logger: &mut StorletLogger,
    ) -> Result<(), SandError>;
}

fn first<'a, T>(items: &'a mut [T], what: &str) -> Result<&'a mut T, SandError> {
    items
        .first_mut()
        .ok_or_else(|| SandError::StorletFailed(format!("no {} given", what)))
}

/// Copies every input to the first output
pub struct Identity;

impl Storlet for Identity {
    fn invoke(
        &mut self,
        inputs: &mut [StorletInputFile],
        outputs: &mut [StorletOutputFile],
        _params: &Params,
        logger: &mut StorletLogger,
    ) -> Result<(), SandError> {
        let metadata = first(inputs, "input")?.metadata().clone();
        let output = first(outputs, "output")?;
        output.set_metadata(metadata)?;
        for input in inputs.iter_mut() {
            let copied = io::copy(input, output)?;
            logger.debug(&format!("copied {} bytes", copied));
        }
        Ok(())
    }
}

/// Keeps every other byte of the first input
pub struct Half;

impl Storlet for Half {
    fn invoke(
        &mut self,
        inputs: &mut [StorletInputFile],
        outputs: &mut [StorletOutputFile],
        _params: &Params,
        logger: &mut StorletLogger,
    ) -> Result<(), SandError> {
        logger.info("HalfStorlet Invoked");
        let input = first(inputs, "input")?;
        let output = first(outputs, "output")?;
        output.set_metadata(input.metadata().clone())?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut keep = true;
        loop {
            let len = input.read(&mut buf)?;
            if len == 0 {
                break;
            }
            let mut half = Vec::with_capacity(len / 2 + 1);
            for byte in &buf[..len] {
                if keep {
                    half.push(*byte);
                }
                keep = !keep;
            }
            output.write_all(&half)?;
        }
        logger.info("HalfStorlet Invocation done");
        Ok(())
    }
}

/// Behaviour chosen by the `op` param, used to exercise the daemon itself
pub struct TestStorlet;

impl Storlet for TestStorlet {
    fn invoke(
        &mut self,
        inputs: &mut [StorletInputFile],
        outputs: &mut [StorletOutputFile],
        params: &Params,
        logger: &mut StorletLogger,
    ) -> Result<(), SandError> {
        let op = params.get("op").and_then(Value::as_str).unwrap_or("");
        logger.debug(&format!("op = {}", op));
        if op == "crash" {
            panic!("Crashed");
        }

        let metadata = first(inputs, "input")?.metadata().clone();
        let output = first(outputs, "output")?;
        output.set_metadata(metadata)?;

        match op {
            "print" => {
                for (key, value) in params {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    output.write_all(format!("{}     {}\n", key, value).as_bytes())?;
                }
            }
            "hold" => loop {
                thread::sleep(Duration::from_secs(3600));
            },
            _ => {}
        }
        Ok(())
    }
}

/// An executable storlet run as a stdin/stdout filter
pub struct ExecStorlet {
    program: PathBuf,
}

impl ExecStorlet {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        ExecStorlet {
            program: program.as_ref().to_path_buf(),
        }
    }
}

impl Storlet for ExecStorlet {
    fn invoke(
        &mut self,
        inputs: &mut [StorletInputFile],
        outputs: &mut [StorletOutputFile],
        params: &Params,
        logger: &mut StorletLogger,
    ) -> Result<(), SandError> {
        let input = first(inputs, "input")?;
        let output = first(outputs, "output")?;
        output.set_metadata(input.metadata().clone())?;

        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::piped())
            .stdout(File::from(output.body_fd()?))
            .stderr(File::from(logger.fd()?));
        for (key, value) in params {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cmd.env(format!("STORLET_PARAM_{}", key.to_uppercase()), value);
        }
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            match io::copy(input, &mut stdin) {
                Ok(_) => {}
                // the program may stop reading early; its exit status decides
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                Err(err) => Err(err)?,
            }
        }
        let status = child.wait()?;
        if !status.success() {
            Err(SandError::StorletFailed(format!(
                "{:?} exited with {}",
                self.program, status
            )))?
        }
        Ok(())
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|md| md.is_file() && md.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Find the storlet to run for a daemon
///
/// `storlet_path` is the colon separated code path the daemon was started
/// with: an entry that is itself executable wins, otherwise a program named
/// after the storlet inside one of the listed directories.
pub fn load(name: &str, storlet_path: Option<&str>) -> Result<Box<dyn Storlet>, SandError> {
    Ok(match name {
        "identity" => Box::new(Identity),
        "half" => Box::new(Half),
        "test" => Box::new(TestStorlet),
        _ => {
            let entries: Vec<&Path> = storlet_path
                .unwrap_or("")
                .split(':')
                .filter(|entry| !entry.is_empty())
                .map(Path::new)
                .collect();
            let program = entries
                .iter()
                .map(|entry| entry.to_path_buf())
                .find(|entry| is_executable(entry))
                .or_else(|| {
                    entries
                        .iter()
                        .map(|entry| entry.join(name))
                        .find(|candidate| is_executable(candidate))
                })
                .ok_or_else(|| SandError::UnknownStorlet(name.to_string()))?;
            Box::new(ExecStorlet::new(program))
        }
    })
}
