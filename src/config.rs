// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{App, AppSettings, Arg, ArgMatches};
use nix::unistd::{access, AccessFlags};

use crate::fork::Program;
use crate::msg::DEFAULT_MAX_UPLOAD;
use crate::Error;

pub const PROGRAM: &str = "PROGRAM";
pub const ARGS: &str = "ARGS";
pub const LISTEN: &str = "listen";
pub const PORT: &str = "port";
pub const UPLOAD_PATH: &str = "upload-path";
pub const POLL_TIMEOUT: &str = "poll-timeout";
pub const MAX_UPLOAD: &str = "max-upload";
pub const CLEAR_ENV: &str = "clear-env";
pub const VERBOSE: &str = "verbose";

pub const DEFAULT_LISTEN: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 4319;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Everything the server needs to start
#[derive(Clone, Debug)]
pub struct Config {
    pub listen: SocketAddr,
    pub program: Program,
    /// Destination of uploaded executable images
    pub upload_path: PathBuf,
    pub poll_timeout: Duration,
    pub max_upload: u64,
    pub verbose: bool,
}

impl Config {
    /// Defaults for supervising `program`, listening on all interfaces
    pub fn new(program: Program) -> Self {
        let listen = IpAddr::from_str(DEFAULT_LISTEN)
            .map(|ip| SocketAddr::new(ip, DEFAULT_PORT))
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)));

        Self {
            listen,
            upload_path: program.path().to_path_buf(),
            program,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            max_upload: DEFAULT_MAX_UPLOAD,
            verbose: false,
        }
    }

    pub fn from_matches(args: &ArgMatches<'_>) -> Result<Self, Error> {
        let path = args
            .value_of_os(PROGRAM)
            .ok_or("the program to supervise is required")?;

        let mut program = Program::new(path);
        if let Some(values) = args.values_of_os(ARGS) {
            program = program.args(values.map(OsString::from));
        }
        if !args.is_present(CLEAR_ENV) {
            program = program.inherit_env();
        }

        let mut config = Config::new(program);

        let ip: IpAddr = parse_value(args, LISTEN)?.unwrap_or(config.listen.ip());
        let port: u16 = parse_value(args, PORT)?.unwrap_or(DEFAULT_PORT);
        config.listen = SocketAddr::new(ip, port);

        if let Some(path) = args.value_of_os(UPLOAD_PATH) {
            config.upload_path = PathBuf::from(path);
        }
        if let Some(millis) = parse_value::<u64>(args, POLL_TIMEOUT)? {
            config.poll_timeout = Duration::from_millis(millis);
        }
        if let Some(max) = parse_value(args, MAX_UPLOAD)? {
            config.max_upload = max;
        }
        config.verbose = args.is_present(VERBOSE);

        Ok(config)
    }

    /// True if an upload could be written, i.e. the directory of `upload_path` is writable
    ///
    /// Uploads are staged next to their destination and renamed over it.
    pub fn upload_dir_writable(&self) -> bool {
        let dir = match self.upload_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        access(dir, AccessFlags::W_OK).is_ok()
    }
}

fn parse_value<T: FromStr>(args: &ArgMatches<'_>, name: &str) -> Result<Option<T>, Error>
where
    T::Err: std::fmt::Display,
{
    match args.value_of(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e| Error::from(format!("invalid --{} {:?}: {}", name, value, e))),
        None => Ok(None),
    }
}

fn is_number(value: String) -> Result<(), String> {
    u64::from_str(&value)
        .map(|_| ())
        .map_err(|_| String::from("number was expected"))
}

/// CLI definition of the server
pub fn app() -> App<'static, 'static> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Supervise one program and accept lifecycle commands for it over TCP")
        .setting(AppSettings::TrailingVarArg)
        .arg(
            Arg::with_name(LISTEN)
                .short("l")
                .long(LISTEN)
                .value_name("ADDR")
                .takes_value(true)
                .help("interface to listen on for operator connections [default: 0.0.0.0]"),
        )
        .arg(
            Arg::with_name(PORT)
                .short("p")
                .long(PORT)
                .value_name("PORT")
                .takes_value(true)
                .validator(is_number)
                .help("port to listen on [default: 4319]"),
        )
        .arg(
            Arg::with_name(UPLOAD_PATH)
                .long(UPLOAD_PATH)
                .value_name("PATH")
                .takes_value(true)
                .help(
                    "where uploaded executables are written, its directory must be writable \
                     or an upload stops the server [default: PROGRAM]",
                ),
        )
        .arg(
            Arg::with_name(POLL_TIMEOUT)
                .long(POLL_TIMEOUT)
                .value_name("MILLIS")
                .takes_value(true)
                .validator(is_number)
                .help("upper bound on each wait for network events [default: 100]"),
        )
        .arg(
            Arg::with_name(MAX_UPLOAD)
                .long(MAX_UPLOAD)
                .value_name("BYTES")
                .takes_value(true)
                .validator(is_number)
                .help("largest executable image a client may upload [default: 268435456]"),
        )
        .arg(
            Arg::with_name(CLEAR_ENV)
                .long(CLEAR_ENV)
                .help("start the program with an empty environment"),
        )
        .arg(
            Arg::with_name(VERBOSE)
                .short("v")
                .long(VERBOSE)
                .help("log debug output"),
        )
        .arg(
            Arg::with_name(PROGRAM)
                .required(true)
                .index(1)
                .help("path of the program to supervise"),
        )
        .arg(
            Arg::with_name(ARGS)
                .multiple(true)
                .allow_hyphen_values(true)
                .index(2)
                .help("arguments passed to the program"),
        )
}
