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

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "portward",
    version,
    about = "TCP port forwarder with a remote administration service",
    long_about = "portward listens on local ports and relays each accepted connection to a\nconfigured remote host and port. Forwarding rules come from the command line\nand the configuration file; once running, rules can be added, removed and\nlisted remotely through the built-in admin service.",
    after_help = "EXAMPLES:\n  Forward one port:           portward 11000=localhost:10000\n  Forward several:            portward 8080=web1:80 8443=web1:443\n  Query a running instance:   portward admin list\n  Add a rule remotely:        portward admin +9090=localhost:9000\n  Remove and shut down:       portward admin \"-9090, stop\""
)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(
        help = "Forwarding rules in <local_port>=<host>:<port> format\nIPv6 hosts may be bracketed: 9100=[::1]:9000\nCombined with the `service` entries of the configuration file"
    )]
    pub rules: Vec<String>,

    #[arg(
        long,
        global = true,
        default_value = "portward.yaml",
        help = "Configuration file path [default: portward.yaml]"
    )]
    pub config: PathBuf,

    #[arg(
        short = 'v',
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send commands to a running instance's admin service
    #[command(
        about = "Send commands to a running instance's admin service",
        long_about = "Connects to the admin service of a running portward instance, sends the\ngiven commands and prints the response. Several commands may be joined in\none argument with ',', ';' or '|', or passed as separate arguments.\n\nCommands:\n  +<local_port>=<host>:<port>   add a forwarding entry\n  -<local_port>                 remove a forwarding entry\n  list                          list all entries\n  stop                          close all entries and terminate the instance\n  clear                         close all entries, keep the instance running",
        after_help = "Examples:\n  portward admin list\n  portward admin +11000=localhost:10000\n  portward admin -p 9999 \"+8080=web1:80; list\"\n  portward admin \"clear\""
    )]
    Admin {
        #[arg(
            short = 'H',
            long,
            default_value = "localhost",
            help = "Host the admin service runs on"
        )]
        host: String,

        #[arg(
            short = 'p',
            long,
            help = "Admin service port [default: the configured admin port]"
        )]
        port: Option<u16>,

        #[arg(required = true, help = "Commands to send")]
        commands: Vec<String>,
    },
}
