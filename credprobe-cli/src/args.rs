use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "credprobe", version, about = "Weak-credential and open-service verification")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity level (use -v or -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Record database path (default: ~/.credprobe/credprobe.db)
    #[arg(long = "db", value_name = "PATH", global = true)]
    pub db_path: Option<PathBuf>,

    /// SOCKS5 proxy host (overrides the config file)
    #[arg(long = "proxy-host", value_name = "HOST", global = true)]
    pub proxy_host: Option<String>,

    /// SOCKS5 proxy port
    #[arg(long = "proxy-port", value_name = "PORT", global = true)]
    pub proxy_port: Option<u16>,

    /// SOCKS5 proxy username
    #[arg(long = "proxy-user", value_name = "USER", global = true)]
    pub proxy_user: Option<String>,

    /// SOCKS5 proxy password
    #[arg(long = "proxy-pass", value_name = "PASS", global = true)]
    pub proxy_pass: Option<String>,

    /// Ignore any configured proxy and dial directly
    #[arg(long = "no-proxy", global = true, conflicts_with = "proxy_host")]
    pub no_proxy: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Probe one target and store the result
    Probe {
        /// Service type (redis, mysql, ssh, ...)
        #[arg(value_name = "TYPE")]
        protocol: String,
        /// Target host or IP
        host: String,
        /// Target port (defaults to the service's conventional port)
        #[arg(short = 'p', long = "port", value_name = "PORT")]
        port: Option<u16>,
        /// Username to try (otherwise protocol defaults)
        #[arg(short = 'u', long = "user", value_name = "USER")]
        username: Option<String>,
        /// Password to try
        #[arg(short = 'P', long = "pass", value_name = "PASS")]
        password: Option<String>,
    },

    /// Import targets from a CSV file and probe them all
    Batch {
        /// CSV with header `type,ip,port,user,pass` (extra columns ignored)
        #[arg(short = 'f', long = "file", value_name = "FILE")]
        file: PathBuf,
    },

    /// List stored records
    List {
        /// Only records of this service type
        #[arg(long = "type", value_name = "TYPE")]
        protocol: Option<String>,
    },

    /// Show one record in full (log and evidence)
    Show {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Re-run the probe for a stored record
    Reprobe {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Execute a protocol command against a stored record
    Exec {
        #[arg(value_name = "ID")]
        id: String,
        #[arg(value_name = "COMMAND", num_args = 1.., required = true)]
        command: Vec<String>,
    },

    /// Delete a record
    Delete {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Persist the proxy flags into ~/.credprobe/config.json
    SaveConfig,
}
