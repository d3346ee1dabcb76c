// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wire format for operator commands
//!
//! Every message is a single ASCII tag byte followed by a tag specific payload, multi-byte
//!  integers are big-endian and there is no outer framing.
//!
//! ```text
//! k  <1-3 ascii digits> '\n'          Kill(signal)
//! r                                   Reload
//! w  '0' | '1'                        Watch(enabled)
//! e  '0' | '1'                        Stderr(enabled)
//! u  <mode: u32> <len: u64> <bytes>   Upload(image)
//! q                                   Exit
//! ```

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::sys::signal::Signal;
use thiserror::Error;

pub const KILL: u8 = b'k';
pub const RELOAD: u8 = b'r';
pub const WATCH: u8 = b'w';
pub const STDERR: u8 = b'e';
pub const UPLOAD: u8 = b'u';
pub const EXIT: u8 = b'q';

/// Digits allowed before the newline of a kill payload
const MAX_SIGNAL_DIGITS: usize = 3;
/// tag + mode word + length
const UPLOAD_HEADER_LEN: usize = 1 + 4 + 8;
/// Only permission, setuid/setgid and sticky bits are ever applied
const MODE_MASK: u32 = 0o7777;

/// Default ceiling for the declared length of an upload
pub const DEFAULT_MAX_UPLOAD: u64 = 256 * 1024 * 1024;

/// The portable POSIX signals a client is allowed to deliver
pub const PORTABLE_SIGNALS: [Signal; 12] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGILL,
    Signal::SIGTRAP,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGKILL,
    Signal::SIGSEGV,
    Signal::SIGPIPE,
    Signal::SIGALRM,
    Signal::SIGTERM,
];

/// A fully decoded operator request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Kill(Signal),
    Reload,
    Watch(bool),
    Stderr(bool),
    Upload(ExecutableImage),
    Exit,
}

impl Command {
    pub fn tag(&self) -> u8 {
        match self {
            Command::Kill(_) => KILL,
            Command::Reload => RELOAD,
            Command::Watch(_) => WATCH,
            Command::Stderr(_) => STDERR,
            Command::Upload(_) => UPLOAD,
            Command::Exit => EXIT,
        }
    }

    /// Serialize the command the way a client puts it on the wire
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.tag()];

        match self {
            Command::Kill(signal) => {
                buf.extend_from_slice((*signal as i32).to_string().as_bytes());
                buf.push(b'\n');
            }
            Command::Watch(enabled) | Command::Stderr(enabled) => {
                buf.push(if *enabled { b'1' } else { b'0' })
            }
            Command::Upload(image) => {
                buf.reserve(UPLOAD_HEADER_LEN + image.content.len());
                buf.extend_from_slice(&image.mode.to_be_bytes());
                buf.extend_from_slice(&(image.content.len() as u64).to_be_bytes());
                buf.extend_from_slice(&image.content);
            }
            Command::Reload | Command::Exit => (),
        }

        buf
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Kill(signal) => write!(f, "kill({})", signal),
            Command::Reload => f.write_str("reload"),
            Command::Watch(enabled) => write!(f, "watch({})", enabled),
            Command::Stderr(enabled) => write!(f, "stderr({})", enabled),
            Command::Upload(image) => write!(f, "upload({})", image),
            Command::Exit => f.write_str("exit"),
        }
    }
}

/// A replacement binary sent by a client
#[derive(Clone, PartialEq, Eq)]
pub struct ExecutableImage {
    mode: u32,
    content: Vec<u8>,
}

impl ExecutableImage {
    pub fn new(mode: u32, content: Vec<u8>) -> Self {
        Self { mode, content }
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Writes the image next to `path` and atomically renames it into place
    ///
    /// Renaming rather than truncating in place lets a running executable be replaced.
    pub fn persist(self, path: &Path) -> std::io::Result<()> {
        let mode = self.mode & MODE_MASK;
        let mut staging = path.as_os_str().to_owned();
        staging.push(".upload");
        let staging = Path::new(&staging);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(staging)?;
        file.write_all(&self.content)?;
        file.sync_all()?;
        drop(file);

        // the umask applies at creation, reapply the exact bits
        fs::set_permissions(staging, fs::Permissions::from_mode(mode))?;
        fs::rename(staging, path)
    }
}

impl fmt::Debug for ExecutableImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableImage")
            .field("mode", &format_args!("{:o}", self.mode))
            .field("len", &self.content.len())
            .finish()
    }
}

impl fmt::Display for ExecutableImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mode: {:o}, {} bytes", self.mode, self.content.len())
    }
}

/// Malformed client input, these are recovered from by closing the connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command tag: {0:#04x}")]
    UnknownTag(u8),
    #[error("kill payload is not a number: {0:?}")]
    NotANumber(Vec<u8>),
    #[error("kill payload exceeds {} digits", MAX_SIGNAL_DIGITS)]
    SignalTooLong,
    #[error("signal {0} is not in the portable set")]
    UnsupportedSignal(i32),
    #[error("invalid boolean for tag {tag:#04x}: {byte:#04x}")]
    InvalidBoolean { tag: u8, byte: u8 },
    #[error("upload of {len} bytes exceeds the maximum of {max}")]
    UploadTooLarge { len: u64, max: u64 },
    #[error("stream closed in the middle of tag {tag:#04x} after {buffered} bytes")]
    Truncated { tag: u8, buffered: usize },
}

/// Outcome of a decode attempt over buffered bytes
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A command and the number of bytes it consumed
    Complete(Command, usize),
    /// The buffer holds a valid prefix, more bytes are needed
    Incomplete,
}

/// Decodes commands out of a connection's inbox
///
/// The decoder holds no per-connection state, partially received payloads simply stay in
///  the connection's buffer until they are complete.
#[derive(Clone, Copy, Debug)]
pub struct Decoder {
    max_upload: u64,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UPLOAD)
    }
}

impl Decoder {
    pub fn new(max_upload: u64) -> Self {
        Self { max_upload }
    }

    pub fn decode(&self, buf: &[u8]) -> Result<Decoded, ProtocolError> {
        let tag = match buf.first() {
            Some(tag) => *tag,
            None => return Ok(Decoded::Incomplete),
        };
        let payload = &buf[1..];

        match tag {
            KILL => decode_kill(payload),
            RELOAD => Ok(Decoded::Complete(Command::Reload, 1)),
            WATCH => decode_bool(tag, payload, Command::Watch),
            STDERR => decode_bool(tag, payload, Command::Stderr),
            UPLOAD => self.decode_upload(payload),
            EXIT => Ok(Decoded::Complete(Command::Exit, 1)),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    /// Called once the peer has closed, any bytes still buffered can never become a command
    pub fn finish(&self, buf: &[u8]) -> Result<Decoded, ProtocolError> {
        match self.decode(buf)? {
            Decoded::Incomplete if buf.is_empty() => Ok(Decoded::Incomplete),
            Decoded::Incomplete => Err(ProtocolError::Truncated {
                tag: buf[0],
                buffered: buf.len(),
            }),
            complete => Ok(complete),
        }
    }

    fn decode_upload(&self, payload: &[u8]) -> Result<Decoded, ProtocolError> {
        if payload.len() < UPLOAD_HEADER_LEN - 1 {
            return Ok(Decoded::Incomplete);
        }

        let mut mode = [0u8; 4];
        mode.copy_from_slice(&payload[..4]);
        let mut len = [0u8; 8];
        len.copy_from_slice(&payload[4..12]);
        let mode = u32::from_be_bytes(mode);
        let len = u64::from_be_bytes(len);

        if len > self.max_upload {
            return Err(ProtocolError::UploadTooLarge {
                len,
                max: self.max_upload,
            });
        }

        // bounded by max_upload above, which the caller sized for this platform
        let len = len as usize;
        let content = &payload[12..];
        if content.len() < len {
            return Ok(Decoded::Incomplete);
        }

        let image = ExecutableImage::new(mode, content[..len].to_vec());
        Ok(Decoded::Complete(
            Command::Upload(image),
            UPLOAD_HEADER_LEN + len,
        ))
    }
}

fn decode_kill(payload: &[u8]) -> Result<Decoded, ProtocolError> {
    let digits = match payload.iter().position(|b| *b == b'\n') {
        Some(newline) => &payload[..newline],
        None if payload.len() > MAX_SIGNAL_DIGITS => return Err(ProtocolError::SignalTooLong),
        None if payload.iter().all(u8::is_ascii_digit) => return Ok(Decoded::Incomplete),
        None => return Err(ProtocolError::NotANumber(payload.to_vec())),
    };

    if digits.len() > MAX_SIGNAL_DIGITS {
        return Err(ProtocolError::SignalTooLong);
    }
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::NotANumber(digits.to_vec()));
    }

    let number = digits
        .iter()
        .fold(0i32, |acc, d| acc * 10 + i32::from(d - b'0'));
    let signal = PORTABLE_SIGNALS
        .iter()
        .copied()
        .find(|s| *s as i32 == number)
        .ok_or(ProtocolError::UnsupportedSignal(number))?;

    // tag + digits + newline
    Ok(Decoded::Complete(Command::Kill(signal), digits.len() + 2))
}

fn decode_bool(
    tag: u8,
    payload: &[u8],
    command: fn(bool) -> Command,
) -> Result<Decoded, ProtocolError> {
    let enabled = match payload.first() {
        None => return Ok(Decoded::Incomplete),
        Some(b'0') => false,
        Some(b'1') => true,
        Some(byte) => return Err(ProtocolError::InvalidBoolean { tag, byte: *byte }),
    };

    Ok(Decoded::Complete(command(enabled), 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Result<Decoded, ProtocolError> {
        Decoder::default().decode(bytes)
    }

    fn upload_bytes(mode: u32, len: u64, content: &[u8]) -> Vec<u8> {
        let mut buf = vec![UPLOAD];
        buf.extend_from_slice(&mode.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(content);
        buf
    }

    #[test]
    fn test_decode_simple_tags() {
        assert_eq!(decode(b"r").unwrap(), Decoded::Complete(Command::Reload, 1));
        assert_eq!(decode(b"q").unwrap(), Decoded::Complete(Command::Exit, 1));
        assert_eq!(decode(b"").unwrap(), Decoded::Incomplete);
    }

    #[test]
    fn test_decode_kill() {
        assert_eq!(
            decode(b"k9\n").unwrap(),
            Decoded::Complete(Command::Kill(Signal::SIGKILL), 3)
        );
        assert_eq!(
            decode(b"k015\nq").unwrap(),
            Decoded::Complete(Command::Kill(Signal::SIGTERM), 5)
        );
        assert_eq!(decode(b"k1").unwrap(), Decoded::Incomplete);
        assert_eq!(decode(b"k").unwrap(), Decoded::Incomplete);
    }

    #[test]
    fn test_decode_kill_rejects() {
        assert_eq!(
            decode(b"k99\n").unwrap_err(),
            ProtocolError::UnsupportedSignal(99)
        );
        assert_eq!(
            decode(b"k7\n").unwrap_err(),
            ProtocolError::UnsupportedSignal(7)
        );
        assert_eq!(decode(b"k1234").unwrap_err(), ProtocolError::SignalTooLong);
        assert_eq!(decode(b"k0009\n").unwrap_err(), ProtocolError::SignalTooLong);
        assert_eq!(
            decode(b"kx\n").unwrap_err(),
            ProtocolError::NotANumber(b"x".to_vec())
        );
        assert_eq!(
            decode(b"k9a").unwrap_err(),
            ProtocolError::NotANumber(b"9a".to_vec())
        );
        assert_eq!(
            decode(b"k\n").unwrap_err(),
            ProtocolError::NotANumber(vec![])
        );
    }

    #[test]
    fn test_portable_signal_numbers() {
        let numbers: Vec<i32> = PORTABLE_SIGNALS.iter().map(|s| *s as i32).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6, 8, 9, 11, 13, 14, 15]);
    }

    #[test]
    fn test_decode_booleans() {
        assert_eq!(
            decode(b"w1").unwrap(),
            Decoded::Complete(Command::Watch(true), 2)
        );
        assert_eq!(
            decode(b"w0").unwrap(),
            Decoded::Complete(Command::Watch(false), 2)
        );
        assert_eq!(
            decode(b"e1").unwrap(),
            Decoded::Complete(Command::Stderr(true), 2)
        );
        assert_eq!(decode(b"e").unwrap(), Decoded::Incomplete);
        assert_eq!(
            decode(b"w2").unwrap_err(),
            ProtocolError::InvalidBoolean { tag: WATCH, byte: b'2' }
        );
        assert_eq!(
            decode(b"e\x01").unwrap_err(),
            ProtocolError::InvalidBoolean { tag: STDERR, byte: 1 }
        );
    }

    #[test]
    fn test_decode_unknown_tag() {
        assert_eq!(decode(b"x").unwrap_err(), ProtocolError::UnknownTag(b'x'));
        assert_eq!(decode(b"K9\n").unwrap_err(), ProtocolError::UnknownTag(b'K'));
    }

    #[test]
    fn test_decode_upload() {
        let bytes = upload_bytes(0o755, 5, b"hello");
        match decode(&bytes).unwrap() {
            Decoded::Complete(Command::Upload(image), used) => {
                assert_eq!(used, bytes.len());
                assert_eq!(image.mode(), 0o755);
                assert_eq!(image.content(), b"hello");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_upload_partial() {
        let bytes = upload_bytes(0o644, 5, b"hello");
        for end in 0..bytes.len() {
            assert_eq!(decode(&bytes[..end]).unwrap(), Decoded::Incomplete, "at {}", end);
        }

        let empty = upload_bytes(0o600, 0, b"");
        assert_eq!(
            decode(&empty).unwrap(),
            Decoded::Complete(Command::Upload(ExecutableImage::new(0o600, vec![])), 13)
        );
    }

    #[test]
    fn test_decode_upload_too_large() {
        let bytes = upload_bytes(0o755, 1024, b"");
        assert_eq!(
            Decoder::new(16).decode(&bytes).unwrap_err(),
            ProtocolError::UploadTooLarge { len: 1024, max: 16 }
        );
    }

    #[test]
    fn test_finish_reports_truncation() {
        let decoder = Decoder::default();
        assert_eq!(decoder.finish(b"").unwrap(), Decoded::Incomplete);
        assert_eq!(
            decoder.finish(b"w").unwrap_err(),
            ProtocolError::Truncated { tag: WATCH, buffered: 1 }
        );

        let bytes = upload_bytes(0o755, 10, b"short");
        assert_eq!(
            decoder.finish(&bytes).unwrap_err(),
            ProtocolError::Truncated {
                tag: UPLOAD,
                buffered: bytes.len()
            }
        );
        assert_eq!(
            decoder.finish(b"r").unwrap(),
            Decoded::Complete(Command::Reload, 1)
        );
    }

    #[test]
    fn test_encode_matches_wire_format() {
        assert_eq!(Command::Kill(Signal::SIGTERM).encode(), b"k15\n");
        assert_eq!(Command::Watch(true).encode(), b"w1");
        assert_eq!(Command::Stderr(false).encode(), b"e0");
        assert_eq!(Command::Exit.encode(), b"q");
        assert_eq!(
            Command::Upload(ExecutableImage::new(0o755, b"ab".to_vec())).encode(),
            upload_bytes(0o755, 2, b"ab")
        );
    }

    #[test]
    fn test_persist_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target-bin");
        fs::write(&path, b"old").unwrap();

        ExecutableImage::new(0o750, b"#!/bin/sh\nexit 0\n".to_vec())
            .persist(&path)
            .unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"#!/bin/sh\nexit 0\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o750);
        assert!(!dir.path().join("target-bin.upload").exists());
    }
}
