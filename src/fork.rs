// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::SigSet;
use nix::sys::wait::waitpid;
use nix::unistd::{execve, fork, ForkResult, Pid};

use crate::{Error, ErrorKind};

pub const STDERR: RawFd = 2;

/// Exit status of a child whose exec failed, same as a shell's "command not found"
pub const EXEC_FAILED: i32 = 127;

/// The program to supervise, its arguments and environment
#[derive(Clone, Debug)]
pub struct Program {
    path: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl Program {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env<K: Into<OsString>, V: Into<OsString>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Passes this process's own environment on to the child
    pub fn inherit_env(mut self) -> Self {
        self.env.extend(std::env::vars_os());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Everything exec needs, allocated before forking
    fn to_exec_parts(&self) -> Result<(CString, Vec<CString>, Vec<CString>), Error> {
        let path = c_string(self.path.as_os_str())?;

        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(path.clone());
        for arg in &self.args {
            argv.push(c_string(arg)?);
        }

        let mut envp = Vec::with_capacity(self.env.len());
        for (key, value) in &self.env {
            let mut pair = key.clone();
            pair.push("=");
            pair.push(value);
            envp.push(c_string(&pair)?);
        }

        Ok((path, argv, envp))
    }
}

fn c_string(s: &OsStr) -> Result<CString, Error> {
    CString::new(s.as_bytes())
        .map_err(|_| Error::from(format!("interior nul byte in {:?}", s)))
}

/// A forked child which has not yet been confirmed to have exec'd
#[derive(Debug)]
pub struct Spawned {
    pid: Pid,
    program: PathBuf,
    report: UnixStream,
}

impl Spawned {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Blocks until the child has either exec'd or reported why it could not.
    ///
    /// A child that failed to exec is reaped here and surfaces as a launch error.
    pub fn wait_for_exec(mut self) -> Result<Pid, Error> {
        match read_exec_report(&mut self.report)? {
            None => Ok(self.pid),
            Some(errno) => {
                // the failed child has already exited, collect it
                waitpid(self.pid, None)?;
                Err(Error::from(ErrorKind::Launch {
                    program: self.program,
                    source: errno,
                }))
            }
        }
    }
}

/// Forks the child and execs the program in it
///
/// A close-on-exec socketpair carries the errno of a failed exec back to the parent, if the
///  exec succeeds the child's end is closed by the kernel and the parent reads EOF.
///
/// `sigmask` is installed in the child before exec, signal masks survive exec and the
///  server's blocked shutdown signals must not leak into the supervised program.
pub fn spawn(program: &Program, sigmask: &SigSet) -> Result<Spawned, Error> {
    let (path, argv, envp) = program.to_exec_parts()?;
    let (report, child_report) = UnixStream::pair()?;

    // This is safe as long as the child only calls async-signal-safe functions before exec,
    //   everything it needs was allocated above.
    match unsafe { fork() }? {
        ForkResult::Child => {
            drop(report);
            exec_child(&path, &argv, &envp, sigmask, child_report)
        }
        ForkResult::Parent { child } => {
            drop(child_report);
            debug!("forked {} as {}", program.path().display(), child);

            Ok(Spawned {
                pid: child,
                program: program.path().to_path_buf(),
                report,
            })
        }
    }
}

/// Spawns the program and waits for its exec to succeed
pub fn launch(program: &Program, sigmask: &SigSet) -> Result<Pid, Error> {
    spawn(program, sigmask)?.wait_for_exec()
}

/// The child's half of launch, this never returns into the caller's logic
fn exec_child(
    path: &CString,
    argv: &[CString],
    envp: &[CString],
    sigmask: &SigSet,
    mut report: UnixStream,
) -> ! {
    let errno = match sigmask.thread_set_mask() {
        Ok(()) => match execve(path, argv, envp) {
            Ok(never) => match never {},
            Err(errno) => errno,
        },
        Err(errno) => errno,
    };

    report.write_all(&(errno as i32).to_be_bytes()).ok();

    // std's stderr takes a lock which another thread may have held at fork time
    let mut stderr = ManuallyDrop::new(unsafe { File::from_raw_fd(STDERR) });
    stderr
        .write_all(b"minium: exec of supervised program failed\n")
        .ok();
    // the forked copy must not run atexit handlers or flush stdio
    unsafe { nix::libc::_exit(EXEC_FAILED) }
}

/// `None` if the child exec'd, otherwise the errno of the failed exec
fn read_exec_report(report: &mut UnixStream) -> Result<Option<Errno>, Error> {
    let mut buf = [0u8; 4];
    let mut read = 0;
    while read < buf.len() {
        match report.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(len) => read += len,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    match read {
        0 => Ok(None),
        4 => Ok(Some(Errno::from_raw(i32::from_be_bytes(buf)))),
        _ => Err(Error::from("short exec report from child")),
    }
}
