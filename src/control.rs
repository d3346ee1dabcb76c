// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Registry of operator control connections

use std::io::{self, Read};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

/// Reserved slot of the listening socket
pub const LISTENER: Token = Token(0);
/// Reserved slot of the signal bridge
pub const SIGNALS: Token = Token(1);
/// Client tokens are offset past the reserved slots
const FIRST_CLIENT: usize = 2;

/// Upper bound of a single read, the decoder looks at the inbox after every chunk
pub const READ_CHUNK: usize = 4096;

/// Result of one read from a connection's socket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received {
    /// This many bytes were appended to the inbox, the socket may hold more
    Data(usize),
    /// The socket would block, more bytes may arrive later
    Pending,
    /// The peer closed its end, nothing more will arrive
    Closed,
}

/// A connected operator
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    /// order of registration, used to service ready clients in the order they connected
    seq: u64,
    inbox: Vec<u8>,
    /// start of the undecoded bytes in `inbox`
    read_pos: usize,
    peer_closed: bool,
}

impl Connection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Bytes received but not yet decoded
    pub fn inbox(&self) -> &[u8] {
        &self.inbox[self.read_pos..]
    }

    /// Drops bytes which have been decoded
    ///
    /// Only the read offset moves, the buffer is compacted once the consumed prefix
    ///  outweighs what is left.
    pub fn consume(&mut self, len: usize) {
        self.read_pos += len;
        debug_assert!(self.read_pos <= self.inbox.len());

        if self.read_pos == self.inbox.len() {
            self.inbox.clear();
            self.read_pos = 0;
        } else if self.read_pos >= READ_CHUNK && self.read_pos * 2 >= self.inbox.len() {
            self.inbox.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Reads at most one chunk from the socket into the inbox
    ///
    /// Readiness is edge triggered, the caller must keep reading until `Pending` or `Closed`,
    ///  or requeue the connection, otherwise the remaining bytes are never reported again.
    pub fn read_chunk(&mut self) -> io::Result<Received> {
        if self.peer_closed {
            return Ok(Received::Closed);
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(Received::Closed);
                }
                Ok(len) => {
                    self.inbox.extend_from_slice(&chunk[..len]);
                    return Ok(Received::Data(len));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Received::Pending),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // a reset is the peer going away, not a failure of the server
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    self.peer_closed = true;
                    return Ok(Received::Closed);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Arena of connection slots with a free list
///
/// The token handed out on insert is the stable identity of the connection, it is the same
///  token the stream is registered under with the poll. A slot is only reused after the
///  connection in it has been removed, and removal hands ownership of the stream back to
///  the caller so that deregistering and closing happen together.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: Vec<Option<Connection>>,
    free: Vec<usize>,
    next_seq: u64,
    len: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new connection, returning the token it must be registered under
    pub fn insert(&mut self, stream: TcpStream, peer: SocketAddr) -> Token {
        let connection = Connection {
            stream,
            peer,
            seq: self.next_seq,
            inbox: Vec::new(),
            read_pos: 0,
            peer_closed: false,
        };
        self.next_seq += 1;
        self.len += 1;

        let slot = match self.free.pop() {
            Some(slot) => {
                debug_assert!(self.slots[slot].is_none());
                self.slots[slot] = Some(connection);
                slot
            }
            None => {
                self.slots.push(Some(connection));
                self.slots.len() - 1
            }
        };

        Token(slot + FIRST_CLIENT)
    }

    pub fn get(&self, token: Token) -> Option<&Connection> {
        Self::slot(token).and_then(|slot| self.slots.get(slot)?.as_ref())
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        Self::slot(token).and_then(move |slot| self.slots.get_mut(slot)?.as_mut())
    }

    /// Takes the connection out of its slot, the slot becomes free
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        let slot = Self::slot(token)?;
        let connection = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        self.len -= 1;
        Some(connection)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.get(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tokens of all live connections, in slot order
    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(slot, _)| Token(slot + FIRST_CLIENT))
    }

    fn slot(token: Token) -> Option<usize> {
        token.0.checked_sub(FIRST_CLIENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{Shutdown, TcpListener as StdListener, TcpStream as StdStream};
    use std::thread;
    use std::time::Duration;

    use nix::libc;
    use nix::sys::socket::{setsockopt, sockopt};

    /// Closes the stream with a RST instead of a FIN
    fn reset(stream: StdStream) {
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        setsockopt(&stream, sockopt::Linger, &linger).unwrap();
        drop(stream);
    }

    /// Returns the server side as a mio stream and the client side as a std stream
    fn pair() -> (TcpStream, SocketAddr, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer, client)
    }

    #[test]
    fn test_reserved_tokens_are_never_handed_out() {
        let mut registry = ConnectionRegistry::new();
        let (stream, peer, _client) = pair();
        let token = registry.insert(stream, peer);

        assert_ne!(token, LISTENER);
        assert_ne!(token, SIGNALS);
        assert!(registry.get(LISTENER).is_none());
        assert!(registry.get(SIGNALS).is_none());
        assert!(registry.remove(SIGNALS).is_none());
    }

    #[test]
    fn test_insert_remove_reuses_slots() {
        let mut registry = ConnectionRegistry::new();
        let (s1, p1, _c1) = pair();
        let (s2, p2, _c2) = pair();
        let (s3, p3, _c3) = pair();

        let t1 = registry.insert(s1, p1);
        let t2 = registry.insert(s2, p2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(t2).unwrap().peer(), p2);

        let removed = registry.remove(t1).unwrap();
        assert_eq!(removed.peer(), p1);
        assert!(!registry.contains(t1));
        assert!(registry.remove(t1).is_none());
        assert_eq!(registry.len(), 1);

        let t3 = registry.insert(s3, p3);
        assert_eq!(t3, t1);
        assert_eq!(registry.get(t3).unwrap().peer(), p3);
        assert!(registry.get(t3).unwrap().seq() > registry.get(t2).unwrap().seq());

        let tokens: Vec<Token> = registry.tokens().collect();
        assert_eq!(tokens, vec![t3, t2]);
    }

    /// Reads until the socket has nothing more to give
    fn read_all(connection: &mut Connection) -> Received {
        loop {
            match connection.read_chunk().unwrap() {
                Received::Data(len) => assert!(len <= READ_CHUNK),
                other => return other,
            }
        }
    }

    #[test]
    fn test_read_chunk() {
        let mut registry = ConnectionRegistry::new();
        let (stream, peer, mut client) = pair();
        let token = registry.insert(stream, peer);

        client.write_all(b"w1k9").unwrap();
        thread::sleep(Duration::from_millis(50));

        let connection = registry.get_mut(token).unwrap();
        assert_eq!(connection.read_chunk().unwrap(), Received::Data(4));
        assert_eq!(connection.read_chunk().unwrap(), Received::Pending);
        assert_eq!(connection.inbox(), b"w1k9");

        connection.consume(2);
        assert_eq!(connection.inbox(), b"k9");

        client.write_all(b"\n").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(read_all(connection), Received::Closed);
        assert!(connection.peer_closed());
        assert_eq!(connection.inbox(), b"k9\n");
        assert_eq!(connection.read_chunk().unwrap(), Received::Closed);
    }

    #[test]
    fn test_read_chunk_is_bounded() {
        let mut registry = ConnectionRegistry::new();
        let (stream, peer, mut client) = pair();
        let token = registry.insert(stream, peer);

        client.write_all(&[b'r'; 3 * READ_CHUNK]).unwrap();
        thread::sleep(Duration::from_millis(50));

        let connection = registry.get_mut(token).unwrap();
        match connection.read_chunk().unwrap() {
            Received::Data(len) => assert!(len <= READ_CHUNK),
            other => panic!("expected data: {:?}", other),
        }
        assert!(connection.inbox().len() <= READ_CHUNK);
    }

    #[test]
    fn test_consume_keeps_undecoded_bytes() {
        let mut registry = ConnectionRegistry::new();
        let (stream, peer, mut client) = pair();
        let token = registry.insert(stream, peer);

        let mut burst = vec![b'r'; 2 * READ_CHUNK];
        burst.extend_from_slice(b"w1");
        client.write_all(&burst).unwrap();
        thread::sleep(Duration::from_millis(50));

        let connection = registry.get_mut(token).unwrap();
        assert_eq!(read_all(connection), Received::Pending);

        for _ in 0..2 * READ_CHUNK {
            assert_eq!(connection.inbox()[0], b'r');
            connection.consume(1);
        }
        assert_eq!(connection.inbox(), b"w1");

        connection.consume(2);
        assert!(connection.inbox().is_empty());
    }

    #[test]
    fn test_reset_is_a_close() {
        let mut registry = ConnectionRegistry::new();
        let (stream, peer, client) = pair();
        let token = registry.insert(stream, peer);

        reset(client);
        thread::sleep(Duration::from_millis(50));

        let connection = registry.get_mut(token).unwrap();
        assert_eq!(read_all(connection), Received::Closed);
        assert!(connection.peer_closed());
    }
}
