//! cometsub CLI — watch Tendermint/CometBFT event subscriptions from the terminal.
//!
//! Usage:
//! ```bash
//! # Stream new blocks and transactions as JSON lines
//! cometsub watch --url ws://localhost:26657/websocket \
//!     --query "tm.event='NewBlock'" --query "tm.event='Tx'" --auto-reconnect
//!
//! # Take connection settings from a config file
//! cometsub watch --config node.json --query "tm.event='Tx'"
//! ```

mod logging;

use std::env;
use std::process;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tracing::{debug, info};

use cometsub_core::{ConnectionState, SubscriberConfig, SubscriberEvent};

use crate::logging::{init_tracing, LogConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "watch" => cmd_watch(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("cometsub {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("cometsub {}", env!("CARGO_PKG_VERSION"));
    println!("Watch Tendermint/CometBFT event subscriptions\n");
    println!("USAGE:");
    println!("    cometsub <COMMAND>\n");
    println!("COMMANDS:");
    println!("    watch      Subscribe to queries and print events as JSON lines");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("WATCH FLAGS:");
    println!("    --url <URL>                  Node WebSocket endpoint  [required unless in --config]");
    println!("    --query <QUERY>              Event query, repeatable  [required]");
    println!("    --config <FILE>              JSON config file (camelCase keys)");
    println!("    --auto-reconnect             Reconnect after failures");
    println!("    --reconnect-delay-ms <MS>    Delay before reconnecting");
    println!("    --log-level <LEVEL>          trace | debug | info | warn | error  (default: warn)");
    println!("    --log-component <NAME=LEVEL> Per-crate level override, repeatable");
    println!("    --json-logs                  Structured JSON logs on stderr");
}

async fn cmd_watch(args: &[String]) -> anyhow::Result<()> {
    init_tracing(&log_config(args)?);

    let config = watch_config(args)?;
    let queries = parse_flags(args, "--query");
    if queries.is_empty() {
        bail!("at least one --query is required");
    }
    cometsub_ws::parse_address(&config.address)?;

    let auto_reconnect = config.auto_reconnect;
    let (subscriber, mut events) = cometsub_ws::subscriber(config)?;
    for query in &queries {
        let label = query.clone();
        subscriber.subscribe(query.clone(), move |event| {
            print_line(&json!({ "kind": "event", "query": label, "event": event }));
        })?;
    }

    info!(address = subscriber.address(), queries = queries.len(), "starting watch");
    subscriber.start();

    let mut state = subscriber.watch_state();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted, closing connection");
                subscriber.stop();
                return Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SubscriberEvent::Connected { address } => {
                        print_line(&json!({ "kind": "connected", "address": address }));
                    }
                    SubscriberEvent::Disconnected => print_line(&json!({ "kind": "disconnected" })),
                    SubscriberEvent::HeartbeatAck => debug!("heartbeat ack"),
                    SubscriberEvent::Error(e) => {
                        print_line(&json!({ "kind": "error", "message": e.to_string() }));
                    }
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                if *state.borrow() == ConnectionState::Closed {
                    // Drain what is already queued so the final error is printed.
                    while let Ok(SubscriberEvent::Error(e)) = events.try_recv() {
                        print_line(&json!({ "kind": "error", "message": e.to_string() }));
                    }
                    if auto_reconnect {
                        bail!("connection closed");
                    }
                    bail!("connection closed (pass --auto-reconnect to keep watching)");
                }
            }
        }
    }

    bail!("subscriber stopped unexpectedly")
}

/// Config file (if any) overlaid with command-line flags.
fn watch_config(args: &[String]) -> anyhow::Result<SubscriberConfig> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => SubscriberConfig::from_json_file(&path)?,
        None => SubscriberConfig::default(),
    };
    if let Some(url) = parse_flag(args, "--url") {
        config.address = url;
    }
    if has_flag(args, "--auto-reconnect") {
        config.auto_reconnect = true;
    }
    if let Some(ms) = parse_flag(args, "--reconnect-delay-ms") {
        config.reconnect_delay_ms = ms
            .parse()
            .with_context(|| format!("--reconnect-delay-ms: '{ms}' is not a number"))?;
    }
    if config.address.is_empty() {
        bail!("--url is required (or set \"address\" in --config)");
    }
    config.validate()?;
    Ok(config)
}

fn log_config(args: &[String]) -> anyhow::Result<LogConfig> {
    let mut config = LogConfig {
        json: has_flag(args, "--json-logs"),
        ..LogConfig::default()
    };
    if let Some(level) = parse_flag(args, "--log-level") {
        config.level = level;
    }
    for entry in parse_flags(args, "--log-component") {
        let (component, level) = entry
            .split_once('=')
            .with_context(|| format!("--log-component expects NAME=LEVEL, got '{entry}'"))?;
        config.components.insert(component.to_string(), level.to_string());
    }
    Ok(config)
}

fn print_line(value: &Value) {
    println!("{value}");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

/// Every value given for a repeatable flag, in order.
fn parse_flags(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
        .collect()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn repeated_queries_are_collected_in_order() {
        let a = args(&["--query", "tm.event='NewBlock'", "--url", "ws://x", "--query", "tm.event='Tx'"]);
        assert_eq!(parse_flags(&a, "--query"), vec!["tm.event='NewBlock'", "tm.event='Tx'"]);
        assert_eq!(parse_flag(&a, "--url").as_deref(), Some("ws://x"));
    }

    #[test]
    fn flags_build_config() {
        let a = args(&[
            "--url",
            "ws://localhost:26657/websocket",
            "--auto-reconnect",
            "--reconnect-delay-ms",
            "250",
        ]);
        let config = watch_config(&a).unwrap();
        assert_eq!(config.address, "ws://localhost:26657/websocket");
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect_delay_ms, 250);
    }

    #[test]
    fn missing_url_is_reported() {
        let err = watch_config(&args(&["--auto-reconnect"])).unwrap_err();
        assert!(err.to_string().contains("--url is required"));
    }

    #[test]
    fn bad_delay_is_reported() {
        let a = args(&["--url", "ws://x", "--reconnect-delay-ms", "soon"]);
        let err = watch_config(&a).unwrap_err();
        assert!(err.to_string().contains("soon"));
    }

    #[test]
    fn log_components_parse() {
        let a = args(&["--log-level", "info", "--log-component", "cometsub-core=debug", "--json-logs"]);
        let config = log_config(&a).unwrap();
        assert!(config.json);
        assert_eq!(config.directives(), "info,cometsub_core=debug");
        assert!(log_config(&args(&["--log-component", "nolevel"])).is_err());
    }
}
