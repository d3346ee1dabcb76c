// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Issue one command to a running minium server
//!
//! The server never answers, a successful exit only means the command was written.

use std::convert::TryFrom;
use std::fs;
use std::io::Write;
use std::net::TcpStream;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use nix::sys::signal::Signal;

use minium::config::DEFAULT_PORT;
use minium::msg::{Command, ExecutableImage};
use minium::Error;

const ADDR: &str = "addr";
const SIGNAL: &str = "SIGNAL";
const ENABLED: &str = "ENABLED";
const MODE: &str = "MODE";
const FILE: &str = "FILE";

fn toggle_sub_command(name: &'static str, about: &'static str) -> App<'static, 'static> {
    SubCommand::with_name(name).about(about).arg(
        Arg::with_name(ENABLED)
            .required(true)
            .possible_values(&["on", "off"]),
    )
}

fn app() -> App<'static, 'static> {
    App::new("minium-ctl")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Send a lifecycle command to a minium server")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name(ADDR)
                .short("a")
                .long(ADDR)
                .value_name("HOST:PORT")
                .takes_value(true)
                .help("address of the server [default: 127.0.0.1:4319]"),
        )
        .subcommand(
            SubCommand::with_name("kill")
                .about("deliver a signal to the supervised program")
                .arg(Arg::with_name(SIGNAL).required(true).help("signal number, e.g. 9")),
        )
        .subcommand(SubCommand::with_name("reload").about("request a reload"))
        .subcommand(toggle_sub_command("watch", "toggle watching of program output"))
        .subcommand(toggle_sub_command("stderr", "toggle forwarding of program stderr"))
        .subcommand(
            SubCommand::with_name("upload")
                .about("replace the program's executable")
                .arg(Arg::with_name(MODE).required(true).help("octal file mode, e.g. 755"))
                .arg(Arg::with_name(FILE).required(true).help("file to upload")),
        )
        .subcommand(SubCommand::with_name("exit").about("interrupt the program and stop the server"))
}

fn command(args: &ArgMatches<'_>) -> Result<Command, Error> {
    let command = match args.subcommand() {
        ("kill", Some(args)) => {
            let number = args
                .value_of(SIGNAL)
                .unwrap_or_default()
                .parse::<i32>()
                .map_err(|e| format!("signal must be a number: {}", e))?;
            Command::Kill(Signal::try_from(number)?)
        }
        ("reload", _) => Command::Reload,
        ("watch", Some(args)) => Command::Watch(args.value_of(ENABLED) == Some("on")),
        ("stderr", Some(args)) => Command::Stderr(args.value_of(ENABLED) == Some("on")),
        ("upload", Some(args)) => {
            let mode = u32::from_str_radix(args.value_of(MODE).unwrap_or_default(), 8)
                .map_err(|e| format!("mode must be octal: {}", e))?;
            let file = args.value_of_os(FILE).ok_or("file is required")?;
            Command::Upload(ExecutableImage::new(mode, fs::read(file)?))
        }
        ("exit", _) => Command::Exit,
        (other, _) => return Err(format!("unexpected command: {}", other).into()),
    };

    Ok(command)
}

fn main() -> Result<(), Error> {
    let args = app().get_matches();
    let addr = args
        .value_of(ADDR)
        .map(String::from)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_PORT));

    let command = command(&args)?;
    let mut stream = TcpStream::connect(&addr)?;
    stream.write_all(&command.encode())?;
    println!("sent {} to {}", command, addr);

    Ok(())
}
