// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// All failures that abort the server.
///
/// Protocol-level problems are not represented here, see [`crate::msg::ProtocolError`],
/// those only ever close the offending connection.
#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("nix error: {0}")]
    NixError(#[from] nix::Error),
    #[error("failed to launch {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// True if the target program could not be exec'd at all
    pub fn is_launch(&self) -> bool {
        matches!(self.0, ErrorKind::Launch { .. })
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}
