// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single poll loop over the listener, the signal bridge and every operator connection
//!
//! Rules:
//!  - a pending shutdown signal always wins over a client command seen in the same wake
//!  - at most one command is returned per call, anything else that was ready is deferred
//!  - malformed input closes only the connection it arrived on

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::control::{ConnectionRegistry, Received, LISTENER, SIGNALS};
use crate::msg::{Command, Decoded, Decoder};
use crate::signals::{SignalBridge, SHUTDOWN_SIGNALS};
use crate::Error;

const EVENTS_CAPACITY: usize = 128;
/// Reads one client may do per service before it goes back into the ready queue
const READS_PER_SERVICE: usize = 64;

/// Outcome of servicing one ready client
enum Serviced {
    Command(Command),
    Nothing,
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    signals: SignalBridge,
    connections: ConnectionRegistry,
    decoder: Decoder,
    /// Sources that were readable but not serviced yet, readiness is edge triggered so
    ///  these would otherwise never be reported again.
    listener_ready: bool,
    signals_ready: bool,
    clients_ready: VecDeque<Token>,
}

impl Multiplexer {
    /// Binds the listening socket and registers it and the signal bridge in their fixed slots
    pub fn bind(
        addr: SocketAddr,
        mut signals: SignalBridge,
        decoder: Decoder,
    ) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut signals, SIGNALS, Interest::READABLE)?;

        info!("listening on {}", listener.local_addr()?);

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            signals,
            connections: ConnectionRegistry::new(),
            decoder,
            listener_ready: false,
            signals_ready: false,
            clients_ready: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn signals(&self) -> &SignalBridge {
        &self.signals
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Waits for the next command from any source.
    ///
    /// Returns `Ok(None)` if the timeout elapsed without a complete command, which is the
    ///  normal idle outcome.
    pub fn next_command(&mut self, timeout: Duration) -> Result<Option<Command>, Error> {
        // deferred work must not wait, but still gives a pending signal its chance to preempt
        let timeout = if self.has_deferred() {
            Duration::from_millis(0)
        } else {
            timeout
        };
        self.wait_for_event(timeout)?;

        if self.listener_ready {
            self.listener_ready = false;
            self.accept_connections()?;
        }

        if self.signals_ready {
            self.signals_ready = false;
            if self.drain_signals()? {
                return Ok(Some(Command::Exit));
            }
        }

        let mut ready: Vec<Token> = self.clients_ready.drain(..).collect();
        ready.sort_by_key(|token| self.connections.get(*token).map(|c| c.seq()));
        ready.dedup();

        let mut ready = ready.into_iter();
        while let Some(token) = ready.next() {
            if let Serviced::Command(command) = self.service_client(token)? {
                self.clients_ready.extend(ready);
                return Ok(Some(command));
            }
        }

        Ok(None)
    }

    /// Blocks until a watched descriptor is readable or the timeout elapses, recording
    ///  which sources became ready. Returns the number of readiness events observed.
    pub fn wait_for_event(&mut self, timeout: Duration) -> Result<usize, Error> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => (),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            match event.token() {
                LISTENER => self.listener_ready = true,
                SIGNALS => self.signals_ready = true,
                token => self.clients_ready.push_back(token),
            }
        }

        Ok(count)
    }

    /// Accepts every pending connection, failures of accept itself are fatal
    pub fn accept_connections(&mut self) -> Result<usize, Error> {
        let mut accepted = 0;
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(accepted),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            let token = self.connections.insert(stream, peer);
            let connection = self
                .connections
                .get_mut(token)
                .expect("just inserted connection is missing");
            self.poll
                .registry()
                .register(connection.stream_mut(), token, Interest::READABLE)?;

            info!("accepted connection from {} ({:?})", peer, token);
            accepted += 1;
        }
    }

    /// Deregisters and closes a connection in one step.
    ///
    /// # Panics
    ///
    /// If the token is not a registered connection, which is a bug in the caller.
    pub fn remove_connection(&mut self, token: Token) -> Result<(), Error> {
        let mut connection = self
            .connections
            .remove(token)
            .expect("removing a connection that is not registered");
        self.clients_ready.retain(|t| *t != token);

        self.poll.registry().deregister(connection.stream_mut())?;
        info!("closed connection from {}", connection.peer());

        // dropping the stream closes the socket
        drop(connection);
        Ok(())
    }

    fn has_deferred(&self) -> bool {
        self.listener_ready || self.signals_ready || !self.clients_ready.is_empty()
    }

    /// Returns true if a shutdown signal was pending
    fn drain_signals(&mut self) -> Result<bool, Error> {
        let mut shutdown = false;
        while let Some(signal) = self.signals.read_signal()? {
            if SHUTDOWN_SIGNALS.contains(&signal) {
                info!("received {}, shutting down", signal);
                shutdown = true;
            } else {
                debug!("ignoring {}", signal);
            }
        }

        Ok(shutdown)
    }

    /// Decodes whatever the client has buffered, reading one chunk at a time until a command
    ///  is complete, the socket would block, or the client has used up its reads.
    ///
    /// The inbox never holds more than one chunk past the end of the frame being decoded,
    ///  the decoder rejects anything that could not become a command as soon as it sees it.
    fn service_client(&mut self, token: Token) -> Result<Serviced, Error> {
        let decoder = self.decoder;
        let connection = match self.connections.get_mut(token) {
            Some(connection) => connection,
            // closed earlier in this wake
            None => return Ok(Serviced::Nothing),
        };

        let mut reads = 0;
        let decoded = loop {
            let decoded = if connection.peer_closed() {
                decoder.finish(connection.inbox())
            } else {
                decoder.decode(connection.inbox())
            };

            match decoded {
                Ok(Decoded::Incomplete) if !connection.peer_closed() => (),
                decoded => break decoded,
            }

            if reads == READS_PER_SERVICE {
                // still readable, give the other sources a turn first
                self.clients_ready.push_back(token);
                return Ok(Serviced::Nothing);
            }
            reads += 1;

            match connection.read_chunk()? {
                Received::Data(_) | Received::Closed => continue,
                Received::Pending => return Ok(Serviced::Nothing),
            }
        };

        match decoded {
            Ok(Decoded::Complete(command, len)) => {
                connection.consume(len);
                debug!("{} from {}", command, connection.peer());

                // more commands may be buffered or still unread, or the close has to be seen
                self.clients_ready.push_back(token);
                Ok(Serviced::Command(command))
            }
            Ok(Decoded::Incomplete) => {
                debug!("{} closed the connection", connection.peer());
                self.remove_connection(token)?;
                Ok(Serviced::Nothing)
            }
            Err(err) => {
                warn!("protocol error from {}: {}", connection.peer(), err);
                self.remove_connection(token)?;
                Ok(Serviced::Nothing)
            }
        }
    }
}
