// Copyright 2025 the Portward authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use portward::{
    admin::Admin,
    cli::{Cli, Commands},
    config::Config,
    entry::EntryDescriptor,
    utils::init_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Admin {
            host,
            port,
            commands,
        }) => run_admin_client(&cli.config, &host, port, &commands).await,
        None => run_daemon(&cli.config, &cli.rules).await,
    }
}

/// Send a command batch to a running instance and print its response.
async fn run_admin_client(
    config_path: &std::path::Path,
    host: &str,
    port: Option<u16>,
    commands: &[String],
) -> Result<()> {
    let config = Config::load(config_path).await?;
    let port = port.unwrap_or(config.admin.port);
    let batch = commands.join(",");
    let response = Admin::execute_command(host, port, &batch, &config.socket).await?;
    println!("{}", response.trim_end());
    Ok(())
}

/// Start the forwarders given on the command line and in the configuration
/// file, then serve the admin protocol until told to stop.
async fn run_daemon(config_path: &std::path::Path, rules: &[String]) -> Result<()> {
    let config = Config::load(config_path).await?;
    let admin = Admin::new(config.socket.clone());

    let mut defined = 0;
    for rule in rules {
        defined += register_rule(&admin, EntryDescriptor::parse(rule)).await;
    }
    for (port_str, target) in &config.service {
        defined += register_rule(&admin, EntryDescriptor::from_parts(port_str, target)).await;
    }
    if defined == 0 {
        println!("No entry defined");
    }

    Arc::clone(&admin).run_server(config.admin.port).await
}

/// Start one forwarding rule, reporting success or failure on the console.
/// A bad or unbindable rule is skipped, it never aborts startup.
async fn register_rule(admin: &Admin, parsed: Result<EntryDescriptor>) -> usize {
    let desc = match parsed {
        Ok(desc) => desc,
        Err(e) => {
            println!("{e}");
            warn!("skipping forwarding definition: {e:#}");
            return 0;
        }
    };
    match admin.create_entry(&desc).await {
        Ok(_) => {
            println!("Forwarding local port {} to {}", desc.port(), desc.target());
            1
        }
        Err(e) => {
            println!("{e}");
            warn!("failed to start forwarder {desc}: {e:#}");
            0
        }
    }
}
