/*
 * yggmail.rs
 * Copyright (C) 2026 Yggmail developers
 *
 * This file is part of Yggmail, a peer-to-peer mail server.
 *
 * Yggmail is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Yggmail is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Yggmail.  If not, see <http://www.gnu.org/licenses/>.
 */

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use yggmail::storage::Storage;
use yggmail::{Node, NodeOptions};

/// Single-user mail server carrying inter-server SMTP over a
/// cryptographically-addressed overlay.
#[derive(Parser, Debug)]
#[command(name = "yggmail", version)]
struct Args {
    /// SQLite database file
    #[arg(long, default_value = "yggmail.db")]
    database: String,

    /// SMTP listen address
    #[arg(long, default_value = "localhost:1025")]
    smtp: String,

    /// IMAP listen address
    #[arg(long, default_value = "localhost:1143")]
    imap: String,

    /// Discover peers on your LAN via multicast
    #[arg(long)]
    multicast: bool,

    /// Connect to a static peer (repeatable)
    #[arg(long = "peer")]
    peer: Vec<String>,

    /// Prompt for a new IMAP/SMTP password and store it
    #[arg(long)]
    password: bool,

    /// Store an already-computed bcrypt password hash
    #[arg(long)]
    passwordhash: Option<String>,
}

fn main() {
    // Starting with no arguments at all means the user needs the manual.
    if std::env::args().len() == 1 {
        println!("Yggmail must be started with either a static peer specified,");
        println!("multicast enabled, or both.");
        println!();
        Args::command().print_help().ok();
        std::process::exit(0);
    }
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    runtime.block_on(run(args));
}

async fn run(args: Args) {
    if args.password || args.passwordhash.is_some() {
        set_password(&args).await;
        return;
    }

    if args.peer.is_empty() && !args.multicast {
        eprintln!("You must specify either --peer, --multicast or both!");
        std::process::exit(1);
    }

    let options = NodeOptions {
        database: args.database,
        smtp: args.smtp,
        imap: args.imap,
        peers: args.peer,
        multicast: args.multicast,
    };
    let node = match Node::start(options).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    tokio::signal::ctrl_c().await.ok();
    node.stop();
}

/// Handle --password / --passwordhash, then exit.
async fn set_password(args: &Args) {
    let storage = match Storage::open(&args.database).await {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let hash = match &args.passwordhash {
        Some(hash) => hash.clone(),
        None => {
            let first = prompt_password("Please enter your new password: ");
            let second = prompt_password("Please enter your new password again: ");
            if first != second {
                eprintln!("The supplied passwords do not match");
                std::process::exit(1);
            }
            match bcrypt::hash(first.trim(), bcrypt::DEFAULT_COST) {
                Ok(hash) => hash,
                Err(e) => {
                    eprintln!("Failed to hash password: {}", e);
                    std::process::exit(1);
                }
            }
        }
    };

    if let Err(e) = storage.config_set_password(&hash).await {
        eprintln!("Failed to set password: {}", e);
        std::process::exit(1);
    }
    println!("Password for IMAP and SMTP has been updated!");
}

fn prompt_password(prompt: &str) -> String {
    use std::io::Write;
    print!("{}", prompt);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok();
    line.trim_end_matches(['\r', '\n']).to_string()
}
