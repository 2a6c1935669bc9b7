//! Batch server child processes

use super::io::{BatchRequest, PlatformError, PlatformResult};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::process::{Child, ChildStdout, Command, Stdio};

/// Lifecycle of a batch server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Running,
    /// Process exited on its own
    Exited(Option<i32>),
    /// Process was stopped by the broker
    Stopped,
}

impl BatchState {
    pub fn is_alive(&self) -> bool {
        matches!(self, BatchState::Running)
    }
}

/// Entry of the configuration handed to a batch server on stdin
#[derive(Debug, Serialize)]
struct BatchEntry<'a> {
    name: &'a str,
    domain_type: i32,
    domain_idx: i32,
    do_write: bool,
}

/// A running batch server
pub struct BatchProcess {
    client_pid: i32,
    state: BatchState,
    key: String,
    child: Child,

    // Held open so the server can keep writing after reporting its key
    _stdout: BufReader<ChildStdout>,
}

impl BatchProcess {
    /// Spawn `command` for a client and wait for it to report its key.
    ///
    /// The client pid is appended to the command line. The requested signals
    /// and controls are written to stdin as JSON, then stdin is closed. The
    /// first line of stdout is the key.
    pub fn spawn(
        command: &[String],
        client_pid: i32,
        signals: &[BatchRequest],
        controls: &[BatchRequest],
    ) -> PlatformResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| PlatformError::new("no batch server command configured"))?;

        tracing::info!(
            "Spawning batch server '{}' for client {}",
            program,
            client_pid
        );

        let mut child = Command::new(program)
            .args(args)
            .arg(client_pid.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PlatformError::new(format!("unable to spawn '{}': {}", program, e)))?;

        let entries: Vec<BatchEntry<'_>> = signals
            .iter()
            .map(|r| (r, false))
            .chain(controls.iter().map(|r| (r, true)))
            .map(|(r, do_write)| BatchEntry {
                name: &r.name,
                domain_type: r.domain,
                domain_idx: r.domain_idx,
                do_write,
            })
            .collect();

        let result = Self::handshake(&mut child, &entries);
        let (stdout, key) = match result {
            Ok(ok) => ok,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        Ok(Self {
            client_pid,
            state: BatchState::Running,
            key,
            child,
            _stdout: stdout,
        })
    }

    fn handshake(
        child: &mut Child,
        entries: &[BatchEntry<'_>],
    ) -> PlatformResult<(BufReader<ChildStdout>, String)> {
        let config = serde_json::to_string(entries)
            .map_err(|e| PlatformError::new(format!("unable to encode batch config: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(config.as_bytes()) {
                Ok(()) => {}
                // Servers that ignore their configuration may close stdin early
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(PlatformError::new(format!(
                        "unable to configure batch server: {}",
                        e
                    )))
                }
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlatformError::new("batch server stdout unavailable"))?;
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| PlatformError::new(format!("unable to read batch server key: {}", e)))?;

        let key = line.trim().to_string();
        if key.is_empty() {
            return Err(PlatformError::new(
                "batch server exited before reporting its key",
            ));
        }
        Ok((reader, key))
    }

    /// Refresh and return the current state
    pub fn poll(&mut self) -> BatchState {
        if self.state.is_alive() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.state = BatchState::Exited(status.code());
            }
        }
        self.state
    }

    /// Terminate the server and reap it
    pub fn stop(&mut self) -> PlatformResult<()> {
        if !self.poll().is_alive() {
            return Ok(());
        }

        let pid = Pid::from_raw(self.pid());
        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => {
                return Err(PlatformError::new(format!(
                    "unable to signal batch server {}: {}",
                    pid, e
                )))
            }
        }
        self.child
            .wait()
            .map_err(|e| PlatformError::new(format!("unable to reap batch server {}: {}", pid, e)))?;

        self.state = BatchState::Stopped;
        tracing::info!("Stopped batch server {} of client {}", pid, self.client_pid);
        Ok(())
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    pub fn client_pid(&self) -> i32 {
        self.client_pid
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for BatchProcess {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("{}", e);
        }
    }
}
