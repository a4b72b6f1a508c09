mod args;
mod config;
mod csv;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use credprobe_core::ProbeEngine;
use credprobe_db::SqliteStore;
use credprobe_types::{
    ConnectionRecord, Protocol, ProxyConfig, Target, IMAGE_MARKER_CLOSE, IMAGE_MARKER_OPEN,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = config::default_path();
    let mut config = config::load(&config_path)?;
    apply_proxy_flags(&mut config.proxy, &args);

    if let Command::SaveConfig = args.command {
        config::save(&config_path, &config)?;
        println!("saved {}", config_path.display());
        return Ok(());
    }

    let store = Arc::new(match &args.db_path {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_default()?,
    });
    let proxy = config.proxy.active().cloned();
    if let Some(p) = &proxy {
        tracing::info!(proxy = %p.url(), "dialing through proxy");
    }
    let engine = Arc::new(ProbeEngine::new(store, proxy));
    engine.reset_interrupted()?;

    match args.command {
        Command::Probe {
            protocol,
            host,
            port,
            username,
            password,
        } => {
            let protocol: Protocol = protocol.parse()?;
            let port = port.unwrap_or_else(|| protocol.default_port());
            let target =
                Target::new(protocol, host, port).with_credentials(username, password);
            let record = engine.add_target(&target)?;
            let record = engine.probe_record(&record.id).await?;
            print_record(&record);
        }
        Command::Batch { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let import = csv::parse(&text).map_err(anyhow::Error::msg)?;
            for error in &import.errors {
                warn!("{}: {error}", file.display());
            }
            if import.targets.is_empty() {
                bail!("{}: no usable targets", file.display());
            }

            let mut ids = Vec::new();
            for target in &import.targets {
                ids.push(engine.add_target(target)?.id);
            }
            println!("probing {} targets...", ids.len());
            let results = engine.probe_batch(ids).await;

            let mut succeeded = 0usize;
            for (id, result) in results {
                match result {
                    Ok(record) => {
                        if record.status == credprobe_types::ProbeStatus::Success {
                            succeeded += 1;
                        }
                        print_record_line(&record);
                    }
                    Err(e) => println!("{:.8}  error: {e}", id),
                }
            }
            println!("done: {succeeded}/{} succeeded", import.targets.len());
        }
        Command::List { protocol } => {
            let records = match protocol {
                Some(name) => engine.store().list_by_type(name.parse()?)?,
                None => engine.store().list()?,
            };
            if records.is_empty() {
                println!("no records");
            }
            for record in records {
                print_record_line(&record);
            }
        }
        Command::Show { id } => {
            let record = engine.store().get(&id)?;
            print_record(&record);
        }
        Command::Reprobe { id } => {
            let record = engine.probe_record(&id).await?;
            print_record(&record);
        }
        Command::Exec { id, command } => {
            let output = engine.run_command(&id, &command.join(" ")).await?;
            println!("{output}");
        }
        Command::Delete { id } => {
            if engine.store().delete(&id)? {
                println!("deleted {id}");
            } else {
                bail!("no record with id {id}");
            }
        }
        // Handled by the early return above, before the engine is built.
        Command::SaveConfig => unreachable!(),
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Command-line flags beat the config file for this invocation.
fn apply_proxy_flags(proxy: &mut ProxyConfig, args: &Args) {
    if args.no_proxy {
        proxy.enabled = false;
        return;
    }
    if let Some(host) = &args.proxy_host {
        proxy.enabled = true;
        proxy.scheme = "socks5".to_string();
        proxy.host = host.clone();
        proxy.port = args.proxy_port.unwrap_or(1080);
        proxy.username = args.proxy_user.clone();
        proxy.password = args.proxy_pass.clone();
    }
}

fn print_record_line(record: &ConnectionRecord) {
    println!(
        "{:.8}  {:<13} {:<21} {:<8} {}",
        record.id,
        record.protocol.to_string(),
        format!("{}:{}", record.host, record.port),
        record.status.to_string(),
        record.message
    );
}

fn print_record(record: &ConnectionRecord) {
    println!("id:       {}", record.id);
    println!("type:     {}", record.protocol);
    println!("target:   {}:{}", record.host, record.port);
    if let Some(user) = &record.username {
        println!("user:     {user}");
    }
    println!("status:   {}", record.status);
    println!("message:  {}", record.message);
    println!("created:  {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(at) = record.connected_at {
        println!("verified: {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if !record.log.is_empty() {
        println!("\n--- log ---");
        for line in &record.log {
            println!("{line}");
        }
    }
    if !record.evidence.is_empty() {
        println!("\n--- evidence ---");
        println!("{}", elide_images(&record.evidence));
    }
}

/// Inline base64 screenshots are useless on a terminal; replace each with a
/// size note.
fn elide_images(evidence: &str) -> String {
    let mut out = String::with_capacity(evidence.len());
    let mut rest = evidence;
    while let Some(start) = rest.find(IMAGE_MARKER_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + IMAGE_MARKER_OPEN.len()..];
        match after.find(IMAGE_MARKER_CLOSE) {
            Some(end) => {
                out.push_str(&format!("[screenshot: {} base64 bytes]", end));
                rest = &after[end + IMAGE_MARKER_CLOSE.len()..];
            }
            None => {
                out.push_str(IMAGE_MARKER_OPEN);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
