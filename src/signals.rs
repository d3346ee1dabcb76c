// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Delivery of SIGINT and SIGTERM as a readable file descriptor
//!
//! No handler ever runs in signal context, the signals are blocked and then read from a
//!  `signalfd(2)` that is registered with the poll loop like any socket.

use std::convert::TryFrom;
use std::io;
use std::os::unix::io::AsRawFd;

use log::{debug, warn};
use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

/// Signals which request shutdown of the server
pub const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Owns the blocked signal mask and the signalfd that reports those signals.
///
/// The mask is installed on the calling thread, for a single threaded server that is the
///  process mask. It must be created before any other thread is spawned so that they
///  inherit it. Dropping the bridge closes the fd and restores the previous mask.
#[derive(Debug)]
pub struct SignalBridge {
    fd: SignalFd,
    original_mask: SigSet,
}

impl SignalBridge {
    pub fn new() -> nix::Result<Self> {
        let mut mask = SigSet::empty();
        for signal in SHUTDOWN_SIGNALS.iter() {
            mask.add(*signal);
        }

        let original_mask = mask.thread_swap_mask(SigmaskHow::SIG_BLOCK)?;
        let fd = match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
            Ok(fd) => fd,
            Err(err) => {
                original_mask.thread_set_mask().ok();
                return Err(err);
            }
        };

        debug!("signalfd {} created for {:?}", fd.as_raw_fd(), SHUTDOWN_SIGNALS);
        Ok(Self { fd, original_mask })
    }

    /// The mask in effect before the bridge was built, a forked child restores this before exec
    pub fn original_mask(&self) -> &SigSet {
        &self.original_mask
    }

    /// Reads one pending signal, `None` once nothing is pending
    pub fn read_signal(&mut self) -> nix::Result<Option<Signal>> {
        loop {
            let info = match self.fd.read_signal()? {
                Some(info) => info,
                None => return Ok(None),
            };

            match Signal::try_from(info.ssi_signo as i32) {
                Ok(signal) => return Ok(Some(signal)),
                Err(_) => warn!("ignoring unknown signal number: {}", info.ssi_signo),
            }
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        if let Err(err) = self.original_mask.thread_set_mask() {
            warn!("failed to restore signal mask: {}", err);
        }
    }
}

impl Source for SignalBridge {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).deregister(registry)
    }
}
