// Copyright 2026 Highway RPC Developers

use std::process;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use chrono::prelude::*;
use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use slog::{debug, error, info, o, Drain, Logger};

use highway_rpc::dispatch::{DispatchError, DispatchResult, Router};
use highway_rpc::{listen, Acceptor, Request, Server, ServerConfig};

static APP: &'static str = "highway-serve";
static DEFAULT_ADDRESS: &'static str = "127.0.0.1:2030";
static SCHEMA: &'static str = "demo";

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: i64,
    iso8601: DateTime<Utc>,
}

impl DatePayload {
    fn new() -> DatePayload {
        let now = Utc::now();
        DatePayload {
            timestamp: now.timestamp_millis(),
            iso8601: now,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct BenchPayload {
    echo: Value,
    delay: Option<u64>,
}

fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Example highway server answering date, echo and bench calls")
        .version(crate_version!())
        .arg(
            Arg::with_name("address")
                .help("Address to listen on (Default: 127.0.0.1:2030)")
                .long("address")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("handshake_timeout")
                .help("Milliseconds a new connection has to log in")
                .long("handshake-timeout")
                .takes_value(true),
        )
        .get_matches()
}

fn to_body<T: serde::Serialize>(value: &T) -> DispatchResult {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| DispatchError(format!("failed to encode result: {}", e)))
}

async fn date_handler(log: Logger) -> DispatchResult {
    debug!(log, "handling date request");
    to_body(&DatePayload::new())
}

async fn bench_handler(req: Request, log: Logger) -> DispatchResult {
    debug!(log, "handling bench request");
    let payload: BenchPayload = serde_json::from_slice(&req.body)
        .map_err(|_| DispatchError::from("expected a JSON bench payload"))?;
    if let Some(delay) = payload.delay {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    to_body(&payload.echo)
}

fn router(log: &Logger) -> Router {
    let date_log = log.clone();
    let echo_log = log.clone();
    let bench_log = log.clone();
    Router::new()
        .register(SCHEMA, "date", move |_req: Request| {
            date_handler(date_log.clone())
        })
        .register(SCHEMA, "echo", move |req: Request| {
            debug!(echo_log, "handling echo request"; "len" => req.body.len());
            async move { Ok::<_, DispatchError>(req.body) }
        })
        .register(SCHEMA, "bench", move |req: Request| {
            bench_handler(req, bench_log.clone())
        })
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let addr = matches.value_of("address").unwrap_or(DEFAULT_ADDRESS);
    let mut config = ServerConfig::default();
    if matches.is_present("handshake_timeout") {
        config.handshake_timeout_ms =
            value_t!(matches, "handshake_timeout", u64).unwrap_or_else(|e| e.exit());
    }

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let listener = listen(addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to listen on {}: {}", addr, e);
        process::exit(1)
    });
    info!(root_log, "starting server"; "address" => addr);

    let server = Server::new(router(&root_log), config, Acceptor::Plain, Some(&root_log));
    if let Err(e) = server.serve(listener).await {
        error!(root_log, "server stopped"; "err" => %e);
    }
}
