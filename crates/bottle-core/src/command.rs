//! Execution wrapper for the external tools behind a bottle.
//!
//! Shell integration stays here so host and authenticator logic remains
//! testable with fake binaries and captured output. Calls block until the
//! tool exits: a privilege prompt or a hardware-key touch may take
//! arbitrarily long.

use crate::error::{BottleError, BottleResult};
use crate::workflow::Escalator;
use log::debug;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use zeroize::Zeroizing;

/// How the child's stdin is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input<'a> {
    None,
    /// Feed these bytes, then close the pipe.
    Bytes(&'a [u8]),
    /// Share the terminal so the tool can prompt by itself.
    Inherit,
}

#[derive(Debug, Clone)]
pub struct ToolCommand {
    binary: PathBuf,
    escalator: Escalator,
}

/// Captured result of one tool run.
///
/// stdout is wiped on drop since some tools print key material.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: Zeroizing<String>,
    pub stderr: String,
    pub status: i32,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// The tool's own explanation: stderr when present, else stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        let text = if !stderr.is_empty() { stderr } else { stdout };
        if text.is_empty() {
            format!("exited with code {} and no output", self.status)
        } else {
            text.to_string()
        }
    }
}

impl ToolCommand {
    /// Run `binary` directly.
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            escalator: Escalator::direct(),
        }
    }

    /// Run `binary` through `escalator` when it wraps anything.
    pub fn privileged(binary: PathBuf, escalator: Escalator) -> Self {
        Self { binary, escalator }
    }

    pub fn run<S: AsRef<str>>(&self, args: &[S], input: Input<'_>) -> BottleResult<ToolOutput> {
        let args: Vec<OsString> = args.iter().map(|arg| OsString::from(arg.as_ref())).collect();
        let (program, argv) = self.escalator.wrap(&self.binary, &args);
        debug!("exec {} {:?}", program.display(), argv);

        let mut command = Command::new(&program);
        command.args(&argv);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(match input {
            Input::None => Stdio::null(),
            Input::Bytes(_) => Stdio::piped(),
            Input::Inherit => Stdio::inherit(),
        });

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BottleError::MissingTool(program.display().to_string())
            } else {
                BottleError::Io(err)
            }
        })?;

        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());

        if let Input::Bytes(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // A tool that exits before reading its input reports why on stderr.
                if let Err(err) = stdin.write_all(payload) {
                    if err.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(err.into());
                    }
                }
            }
        }

        let status = child.wait()?;
        let stdout = stdout_handle
            .join()
            .map_err(|_| BottleError::tool("exec", "stdout reader thread panicked"))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| BottleError::tool("exec", "stderr reader thread panicked"))??;

        Ok(ToolOutput {
            stdout: Zeroizing::new(stdout),
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }

    /// Run and turn a non-zero exit into [`BottleError::Tool`] with the
    /// diagnostic kept verbatim.
    pub fn run_checked<S: AsRef<str>>(
        &self,
        operation: &str,
        args: &[S],
        input: Input<'_>,
    ) -> BottleResult<ToolOutput> {
        let out = self.run(args, input)?;
        if out.success() {
            Ok(out)
        } else {
            Err(BottleError::tool(operation, out.diagnostic()))
        }
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<BottleResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> BottleResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Zeroizing::new(Vec::new());
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        } else {
            Ok(String::new())
        }
    })
}
