// Copyright 2026 Highway RPC Developers

use std::process;
use std::sync::Mutex;

use bytes::Bytes;
use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;
use slog::{o, Drain, Level, LevelFilter, Logger};

use highway_rpc::{ClientConfig, ClientRegistry, Connector, Request};

static APP: &'static str = "highway-call";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a single highway call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("service")
                .help("Logical service name sent with the call")
                .long("service")
                .short("s")
                .takes_value(true)
                .default_value("demo-service"),
        )
        .arg(
            Arg::with_name("schema")
                .help("Schema id of the remote operation")
                .long("schema")
                .takes_value(true)
                .default_value("demo"),
        )
        .arg(
            Arg::with_name("operation")
                .help("Name of the remote operation")
                .long("operation")
                .short("o")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("body")
                .help("JSON-encoded body for the call")
                .long("body")
                .takes_value(true)
                .default_value("null"),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Call timeout in milliseconds")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("one_way")
                .help("Send without waiting for a response")
                .long("one-way")
                .takes_value(false),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = format!("{}:{}", host, port);
    let body = value_t!(matches, "body", Value).unwrap_or_else(|e| e.exit());
    let body = serde_json::to_vec(&body).unwrap_or_else(|e| {
        eprintln!("Failed to encode body: {}", e);
        process::exit(1)
    });
    let request = Request::new(
        matches.value_of("service").unwrap_or_default(),
        matches.value_of("schema").unwrap_or_default(),
        matches.value_of("operation").unwrap_or_default(),
        Bytes::from(body),
    );

    let mut config = ClientConfig {
        pool_size: 1,
        ..ClientConfig::default()
    };
    if matches.is_present("timeout") {
        config.call_timeout_ms = value_t!(matches, "timeout", u64).unwrap_or_else(|e| e.exit());
    }

    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!(),
    );
    let registry = ClientRegistry::new(config, Connector::Tcp, Some(&log));

    if matches.is_present("one_way") {
        if let Err(e) = registry.post(&addr, &request).await {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
        registry.close_all().await;
        return;
    }

    let result = registry.call(&addr, &request).await.and_then(|resp| resp.into_result());
    registry.close_all().await;
    match result {
        Ok(body) => match serde_json::from_slice::<Value>(&body) {
            Ok(value) => println!("{}", value),
            Err(_) => println!("{}", String::from_utf8_lossy(&body)),
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }
}
