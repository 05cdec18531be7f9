// src/core/process.rs

//! OS process control for the supervisor: spawning, liveness polling, and
//! escalated termination.
//!
//! All OS specifics live behind the `ProcessHost` trait so the supervisor
//! logic stays portable and testable.

use crate::core::ShardError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Capability for spawning and controlling OS processes.
pub trait ProcessHost: Send + Sync {
    /// Launches a process from a full command line. Returns the PID, or an
    /// error the caller treats as a zero-PID spawn failure.
    fn spawn(&self, command_line: &str) -> Result<u32, ShardError>;

    /// Whether the process still exists. Exited children are reaped here.
    fn is_alive(&self, pid: u32) -> bool;

    /// Immediate termination (SIGKILL-equivalent).
    fn terminate(&self, pid: u32);

    /// Abort with a core dump (SIGABRT-equivalent), for hung-process diagnosis.
    fn force_core(&self, pid: u32);

    /// Reads the process's command line from the OS process table.
    fn read_command_line(&self, pid: u32) -> Option<String>;
}

/// Splits a command line into tokens, honoring double quotes.
pub fn tokenize_command_line(command_line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut inside_quotes = false;
    for c in command_line.chars() {
        match c {
            '"' => inside_quotes = !inside_quotes,
            ' ' if !inside_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// The real `ProcessHost`, backed by `std::process` and the OS process table.
///
/// Children we spawned are kept so their exit status can be reaped by the
/// per-tick liveness poll; without the reap, exited children would linger as
/// zombies and still look alive to the process table.
pub struct OsProcessHost {
    children: Mutex<HashMap<u32, Child>>,
    system: Mutex<System>,
}

impl Default for OsProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl OsProcessHost {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
        }
    }

    fn signal(&self, pid: u32, signum: i32, what: &str) {
        #[cfg(unix)]
        {
            // Signal 0 and negative PIDs are never meant here.
            if pid == 0 {
                return;
            }
            let rc = unsafe { libc::kill(pid as libc::pid_t, signum) };
            if rc != 0 {
                warn!(
                    "{} of pid {} failed: {}",
                    what,
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signum;
            let mut system = self.system.lock();
            system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                if !process.kill() {
                    warn!("{} of pid {} failed", what, pid);
                }
            }
        }
    }
}

impl ProcessHost for OsProcessHost {
    fn spawn(&self, command_line: &str) -> Result<u32, ShardError> {
        let tokens = tokenize_command_line(command_line);
        let Some((program, args)) = tokens.split_first() else {
            return Err(ShardError::SpawnFailed("empty command line".to_string()));
        };

        debug!("Spawning process: {}", command_line);
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| ShardError::SpawnFailed(format!("{program}: {e}")))?;

        let pid = child.id();
        self.children.lock().insert(pid, child);
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        // Children we own are polled through their handle, which also reaps
        // the exit status.
        let mut children = self.children.lock();
        if let Some(child) = children.get_mut(&pid) {
            return match child.try_wait() {
                Ok(Some(_status)) => {
                    children.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!("try_wait on pid {} failed: {}", pid, e);
                    children.remove(&pid);
                    false
                }
            };
        }
        drop(children);

        // Processes we did not spawn (e.g. a worker adopted after a
        // supervisor restart) fall back to the process table.
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
        system.process(Pid::from_u32(pid)).is_some()
    }

    fn terminate(&self, pid: u32) {
        #[cfg(unix)]
        self.signal(pid, libc::SIGKILL, "kill");
        #[cfg(not(unix))]
        self.signal(pid, 0, "kill");

        // Reap immediately if this was our child; otherwise the next
        // liveness poll observes the exit.
        if let Some(mut child) = self.children.lock().remove(&pid) {
            let _ = child.wait();
        }
    }

    fn force_core(&self, pid: u32) {
        #[cfg(unix)]
        self.signal(pid, libc::SIGABRT, "forceCore");
        #[cfg(not(unix))]
        self.signal(pid, 0, "forceCore");
    }

    fn read_command_line(&self, pid: u32) -> Option<String> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
        let process = system.process(Pid::from_u32(pid))?;
        let cmd = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        (!cmd.is_empty()).then_some(cmd)
    }
}
