use std::{
    fmt,
    io::{self, BufRead, BufReader, Write},
    path::PathBuf,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{pending::PendingTable, BridgeError, ExecutionError};

/// How long a worker gets to exit on its own after its stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Line-oriented channel to a backend. Responses are delivered to the
/// [`PendingTable`] the transport was created with.
pub trait Transport: Send + Sync {
    fn send_line(&self, line: &str) -> io::Result<()>;

    /// Stops the backend. Must be idempotent.
    fn shutdown(&self);
}

/// The backend worker program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl BackendCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for BackendCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A worker process spoken to over its stdin and stdout. Its stderr is
/// inherited so backend diagnostics reach the terminal.
pub struct ProcessTransport {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessTransport {
    pub fn spawn(command: &BackendCommand, pending: Arc<PendingTable>) -> Result<Self, BridgeError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: command.program.display().to_string(),
                source,
            })?;
        log::debug!("spawned backend '{command}' (pid {})", child.id());

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                terminate_and_reap_child(&mut child);
                return Err(BridgeError::Stream("stdin"));
            }
        };
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                terminate_and_reap_child(&mut child);
                return Err(BridgeError::Stream("stdout"));
            }
        };

        let reader = thread::Builder::new()
            .name("wptnn-backend-reader".into())
            .spawn(move || read_responses(stdout, &pending));
        let reader = match reader {
            Ok(reader) => reader,
            Err(err) => {
                terminate_and_reap_child(&mut child);
                return Err(err.into());
            }
        };

        Ok(Self {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            reader: Mutex::new(Some(reader)),
        })
    }
}

impl Transport for ProcessTransport {
    fn send_line(&self, line: &str) -> io::Result<()> {
        let mut stdin = lock(&self.stdin);
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "backend stdin is closed"))?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    fn shutdown(&self) {
        // Closing stdin is the worker's cue to exit.
        drop(lock(&self.stdin).take());

        if let Some(mut child) = lock(&self.child).take() {
            let started = Instant::now();
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        log::debug!("backend exited with {status}");
                        break;
                    }
                    Ok(None) if started.elapsed() < SHUTDOWN_GRACE => {
                        thread::sleep(Duration::from_millis(10))
                    }
                    _ => {
                        log::debug!("terminating backend");
                        terminate_and_reap_child(&mut child);
                        break;
                    }
                }
            }
        }

        if let Some(reader) = lock(&self.reader).take() {
            if reader.join().is_err() {
                log::warn!("backend reader thread panicked");
            }
        }
    }
}

fn read_responses(stdout: ChildStdout, pending: &PendingTable) {
    for line in BufReader::new(stdout).lines() {
        match line {
            Ok(line) => pending.dispatch_line(&line),
            Err(err) => {
                log::debug!("backend stdout read failed: {err}");
                break;
            }
        }
    }
    pending.reject_all(ExecutionError::ProcessExited(
        "backend closed its output".into(),
    ));
}

fn terminate_and_reap_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn backend_command_display() {
    let cmd = BackendCommand::new("/usr/bin/worker")
        .with_arg("--device")
        .with_args(["cpu"]);
    assert_eq!(cmd.to_string(), "/usr/bin/worker --device cpu");
}
