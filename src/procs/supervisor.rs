// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config::Config;
use crate::fork;
use crate::msg::Command;
use crate::mux::Multiplexer;
use crate::Error;

/// Lifecycle of the supervised child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildState {
    /// Forked, exec not yet confirmed
    Starting,
    Running,
    /// Exited normally, low 8 bits of the status
    Exited(u8),
    /// Killed by an uncaught signal
    Terminated(Signal),
}

/// How the child ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Exited(u8),
    Signaled(Signal),
}

impl Termination {
    /// Shell convention for reporting this termination as a process exit status
    pub fn exit_status(self) -> i32 {
        match self {
            Termination::Exited(code) => i32::from(code),
            Termination::Signaled(signal) => 128 + signal as i32,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exited with code {}", code),
            Termination::Signaled(signal) => write!(f, "terminated by {}", signal),
        }
    }
}

/// The one child process owned by a supervisor
#[derive(Debug)]
struct ChildProcess {
    pid: Pid,
    state: ChildState,
}

impl ChildProcess {
    fn termination(&self) -> Option<Termination> {
        match self.state {
            ChildState::Exited(code) => Some(Termination::Exited(code)),
            ChildState::Terminated(signal) => Some(Termination::Signaled(signal)),
            ChildState::Starting | ChildState::Running => None,
        }
    }

    /// Applies a wait status, returning the termination if the child is gone
    fn record(&mut self, status: WaitStatus) -> Option<Termination> {
        match status {
            WaitStatus::Exited(_, code) => self.state = ChildState::Exited((code & 0xff) as u8),
            WaitStatus::Signaled(_, signal, _) => self.state = ChildState::Terminated(signal),
            _ => return None,
        }

        let termination = self.termination();
        if let Some(termination) = termination {
            info!("child {} {}", self.pid, termination);
        }
        termination
    }
}

/// Launch and monitor the supervised program
///
/// Rules:
///   - exactly one child per supervisor, it is never restarted
///   - commands come only from the multiplexer, one at a time
///   - the child's own exit ends supervision, as does an exit command
pub struct Supervisor {
    child: ChildProcess,
    mux: Multiplexer,
    upload_path: PathBuf,
    poll_timeout: Duration,
    watch_output: bool,
    forward_stderr: bool,
}

impl Supervisor {
    /// Starts the child and takes ownership of the multiplexer that will feed it commands
    ///
    /// If the program can not be exec'd this returns a launch error, and no supervisor exists.
    pub fn launch(config: &Config, mux: Multiplexer) -> Result<Self, Error> {
        if !config.upload_dir_writable() {
            warn!(
                "{} is not writable, an upload will stop the server",
                config.upload_path.display()
            );
        }

        let spawned = fork::spawn(&config.program, mux.signals().original_mask())?;
        let mut child = ChildProcess {
            pid: spawned.pid(),
            state: ChildState::Starting,
        };

        spawned.wait_for_exec()?;
        child.state = ChildState::Running;
        info!(
            "started {} as pid {}",
            config.program.path().display(),
            child.pid
        );

        Ok(Self {
            child,
            mux,
            upload_path: config.upload_path.clone(),
            poll_timeout: config.poll_timeout,
            watch_output: false,
            forward_stderr: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.child.pid
    }

    pub fn state(&self) -> ChildState {
        self.child.state
    }

    pub fn upload_path(&self) -> &Path {
        &self.upload_path
    }

    pub fn watch_output(&self) -> bool {
        self.watch_output
    }

    pub fn forward_stderr(&self) -> bool {
        self.forward_stderr
    }

    /// How the child ended, `None` until it has
    pub fn exit_code(&self) -> Option<Termination> {
        self.child.termination()
    }

    /// Supervises until the child exits or an exit command has brought it down
    pub fn run(&mut self) -> Result<Termination, Error> {
        if let Some(termination) = self.exit_code() {
            return Ok(termination);
        }

        loop {
            if let Some(termination) = self.try_wait()? {
                return Ok(termination);
            }

            let command = match self.mux.next_command(self.poll_timeout)? {
                Some(command) => command,
                None => continue,
            };

            if let Some(termination) = self.dispatch(command)? {
                return Ok(termination);
            }
        }
    }

    /// Acts on one command, returning the termination if it ended supervision
    pub fn dispatch(&mut self, command: Command) -> Result<Option<Termination>, Error> {
        info!("{}", command);

        match command {
            Command::Kill(signal) => {
                kill(self.child.pid, signal)?;
                Ok(None)
            }
            Command::Exit => {
                kill(self.child.pid, Signal::SIGINT)?;
                self.wait().map(Some)
            }
            Command::Reload => {
                // restarting with a new image is not supported, the child is never recreated
                info!("reload of {} requested", self.child.pid);
                Ok(None)
            }
            Command::Watch(enabled) => {
                self.watch_output = enabled;
                Ok(None)
            }
            Command::Stderr(enabled) => {
                self.forward_stderr = enabled;
                Ok(None)
            }
            Command::Upload(image) => {
                let len = image.content().len();
                image.persist(&self.upload_path)?;
                info!("wrote {} bytes to {}", len, self.upload_path.display());
                Ok(None)
            }
        }
    }

    /// Non-blocking check for the child's termination
    fn try_wait(&mut self) -> Result<Option<Termination>, Error> {
        let status = waitpid(self.child.pid, Some(WaitPidFlag::WNOHANG))?;
        Ok(self.child.record(status))
    }

    /// Blocks until the child has terminated
    fn wait(&mut self) -> Result<Termination, Error> {
        loop {
            let status = match waitpid(self.child.pid, None) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            };

            if let Some(termination) = self.child.record(status) {
                return Ok(termination);
            }
        }
    }
}

/// Launches the program described by `config` and supervises it to completion
pub fn supervise(config: &Config, mux: Multiplexer) -> Result<Termination, Error> {
    let mut supervisor = Supervisor::launch(config, mux)?;
    supervisor.run()
}
