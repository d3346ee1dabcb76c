// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use log::{error, info};

use minium::config::{self, Config};
use minium::fork::EXEC_FAILED;
use minium::msg::Decoder;
use minium::mux::Multiplexer;
use minium::procs::{self, Termination};
use minium::signals::SignalBridge;
use minium::Error;

fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn main() {
    // a missing program exits here, before any socket is opened
    let args = config::app().get_matches();

    let config = match Config::from_matches(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            println!("{}", args.usage());
            std::process::exit(2);
        }
    };
    init_logger(config.verbose);

    match run(&config) {
        Ok(termination) => {
            info!("{} {}", config.program.path().display(), termination);
            std::process::exit(termination.exit_status());
        }
        Err(err) if err.is_launch() => {
            error!("{}", err);
            std::process::exit(EXEC_FAILED);
        }
        Err(err) => {
            error!("minium failed: {}", err);
            std::process::exit(1);
        }
    }
}

fn run(config: &Config) -> Result<Termination, Error> {
    // the mask must be in place before anything else could spawn a thread
    let signals = SignalBridge::new()?;
    let mux = Multiplexer::bind(config.listen, signals, Decoder::new(config.max_upload))?;

    procs::supervise(config, mux)
}
