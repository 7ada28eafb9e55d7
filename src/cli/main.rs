//-
// Copyright (c) 2025, 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY; without  even the implied warranty  of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use std::fs;
use std::path::PathBuf;

use structopt::StructOpt;

use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;
use crate::support::tls::TlsContextStore;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Accept SMTP connections and hand them to the built-in demo service.
    ///
    /// The demo service accepts every envelope, reads each message body,
    /// logs what it saw, and discards the mail. It exists so that the
    /// engine can be exercised end to end; real deployments embed the
    /// engine and supply their own service.
    Serve(CommonOptions),
    /// Load the configuration (and TLS key material, if configured) and
    /// report problems without serving anything.
    CheckConfig(CommonOptions),
}

#[derive(StructOpt)]
struct CommonOptions {
    /// Path to postern.toml
    /// [default: /etc/postern/postern.toml]
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,
}

pub fn main() {
    let command = Command::from_args();

    match command {
        Command::Serve(options) => {
            crate::init_simple_log();
            let config = load_config(&options);
            super::serve::serve(config);
        },

        Command::CheckConfig(options) => {
            let config = load_config(&options);
            if let Some(ref tls) = config.tls {
                if let Err(e) = TlsContextStore::from_config(tls) {
                    eprintln!("TLS configuration is unusable: {}", e);
                    EX_CONFIG.exit();
                }
            } else if config.smtp.implicit_tls {
                eprintln!("implicit_tls requires a [tls] section");
                EX_CONFIG.exit();
            }

            println!("Configuration looks reasonable");
        },
    }
}

fn load_config(options: &CommonOptions) -> SystemConfig {
    let path = options
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("/etc/postern/postern.toml"));

    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Unable to read '{}': {}", path.display(), e);
            EX_CONFIG.exit()
        },
    };

    match toml::from_str(&text) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Unable to parse '{}': {}", path.display(), e);
            EX_CONFIG.exit()
        },
    }
}
