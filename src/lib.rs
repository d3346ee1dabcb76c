// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Common library functions for Minium
//!
//! One program is supervised, any number of operators connect over TCP and send it
//!  lifecycle commands, see [`msg`] for the wire format.

pub mod config;
pub mod control;
pub mod fork;
pub mod msg;
pub mod mux;
pub mod procs;
pub mod signals;

mod error;

pub use error::{Error, ErrorKind};
