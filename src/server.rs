// Copyright 2026 Highway RPC Developers

//! Server side: the accept loop and the per-socket connection that decodes
//! requests, hands them to the dispatcher and writes correlated responses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use slog::{debug, error, info, o, warn, Logger};
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{HighwayError, Result};
use crate::message::{ControlMessage, Request, Response, STATUS_SERVER_ERROR};
use crate::protocol::{read_frame, write_frame, Frame, HighwayCodec};
use crate::transport::{Acceptor, BoxedStream};

type FrameSink = FramedWrite<WriteHalf<BoxedStream>, HighwayCodec>;

/// Binds a listener for `Server::serve`.
pub async fn listen(addr: &str) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}

/// One accepted socket.
pub struct ServerConnection {
    peer: SocketAddr,
    log: Logger,
    dispatcher: Arc<dyn Dispatcher>,
    writer: AsyncMutex<Option<FrameSink>>,
    closed: Mutex<bool>,
    shutdown: CancellationToken,
}

impl ServerConnection {
    pub fn new(
        peer: SocketAddr,
        dispatcher: Arc<dyn Dispatcher>,
        log: Option<&Logger>,
    ) -> Arc<ServerConnection> {
        let log = crate::logger_or_stdlog(log).new(o!("peer" => peer.to_string()));
        Arc::new(ServerConnection {
            peer,
            log,
            dispatcher,
            writer: AsyncMutex::new(None),
            closed: Mutex::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn lock_closed(&self) -> MutexGuard<'_, bool> {
        self.closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        *self.lock_closed()
    }

    /// Reads the peer's login frame and answers it when the peer advertises
    /// structured attachments.
    pub async fn handshake(&self, stream: &mut BoxedStream) -> Result<()> {
        let frame = read_frame(stream)
            .await?
            .ok_or_else(|| HighwayError::handshake("peer closed the connection before login"))?;

        let login = match ControlMessage::decode(&frame.header) {
            Ok(ControlMessage::Login(login)) => login,
            Ok(other) => {
                return Err(HighwayError::handshake(format!(
                    "expected login, got {:?}",
                    other.kind()
                )))
            }
            Err(e) => {
                return Err(HighwayError::handshake(format!("unparseable login: {}", e)));
            }
        };

        debug!(self.log, "login received";
            "protocol" => &login.protocol, "map_attachments" => login.use_map_attachments);
        if login.use_map_attachments {
            let reply = Response::ok(Bytes::new()).to_frame(frame.correlation_id)?;
            write_frame(stream, &reply).await?;
        }
        Ok(())
    }

    /// Reads frames until the peer goes away or the connection is closed.
    /// Each request is handled in its own task, so responses may go out in
    /// a different order than the requests came in.
    pub async fn run(self: &Arc<Self>, stream: BoxedStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(FramedWrite::new(write_half, HighwayCodec));
        let mut frames = FramedRead::new(read_half, HighwayCodec);

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    let conn = Arc::clone(self);
                    tokio::spawn(async move { conn.handle_request(frame).await });
                }
                Some(Err(e)) => {
                    warn!(self.log, "receive failed"; "err" => %e);
                    break;
                }
                None => {
                    debug!(self.log, "peer closed the connection");
                    break;
                }
            }
        }

        drop(frames);
        self.close().await;
    }

    async fn handle_request(&self, frame: Frame) {
        let correlation_id = frame.correlation_id;
        let request = match ControlMessage::decode(&frame.header) {
            Ok(ControlMessage::Request(header)) => Request::from_parts(header, frame.body),
            Ok(other) => {
                warn!(self.log, "unexpected message kind";
                    "kind" => ?other.kind(), "correlation_id" => correlation_id);
                let reason = format!("unexpected message kind {:?}", other.kind());
                self.respond(correlation_id, Response::error(STATUS_SERVER_ERROR, &reason))
                    .await;
                return;
            }
            Err(e) => {
                error!(self.log, "bad control header, closing"; "err" => %e);
                self.close().await;
                return;
            }
        };

        let operation = request.operation.clone();
        let dispatched = AssertUnwindSafe(self.dispatcher.dispatch(request))
            .catch_unwind()
            .await;
        let response = match dispatched {
            Ok(Ok(body)) => Response::ok(body),
            Ok(Err(e)) => {
                debug!(self.log, "dispatch failed";
                    "operation" => &operation, "err" => %e);
                Response::error(STATUS_SERVER_ERROR, &e.0)
            }
            Err(_) => {
                error!(self.log, "handler panicked"; "operation" => &operation);
                Response::error(STATUS_SERVER_ERROR, "handler panicked")
            }
        };
        self.respond(correlation_id, response).await;
    }

    async fn respond(&self, correlation_id: u64, response: Response) {
        let written = match response.to_frame(correlation_id) {
            Ok(frame) => self.write(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(self.log, "failed to write response, closing";
                "correlation_id" => correlation_id, "err" => %e);
            self.close().await;
        }
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink.send(frame).await,
            None => Err(HighwayError::ConnectionClosed),
        }
    }

    /// Idempotent.
    pub async fn close(&self) {
        {
            let mut closed = self.lock_closed();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.shutdown.cancel();
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = SinkExt::<Frame>::close(&mut sink).await;
        }
        debug!(self.log, "connection closed");
    }
}

/// Accepts sockets and serves highway requests on them.
pub struct Server {
    config: ServerConfig,
    acceptor: Acceptor,
    dispatcher: Arc<dyn Dispatcher>,
    log: Logger,
    connections: Mutex<HashMap<SocketAddr, Arc<ServerConnection>>>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new<D: Dispatcher>(
        dispatcher: D,
        config: ServerConfig,
        acceptor: Acceptor,
        log: Option<&Logger>,
    ) -> Arc<Server> {
        Arc::new(Server {
            config,
            acceptor,
            dispatcher: Arc::new(dispatcher),
            log: crate::logger_or_stdlog(log).new(o!("component" => "server")),
            connections: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<SocketAddr, Arc<ServerConnection>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Runs the accept loop until `shutdown` is called. Each accepted socket
    /// is handshaken and served in its own task so a slow peer cannot hold
    /// up the next accept.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(self.log, "listening for highway requests"; "address" => %addr);
        }

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp, peer)) => {
                    tokio::spawn(Arc::clone(&self).open_connection(tcp, peer));
                }
                Err(e) => {
                    error!(self.log, "failed to accept socket"; "err" => %e);
                }
            }
        }

        info!(self.log, "accept loop stopped");
        Ok(())
    }

    /// Spawns `serve` onto the runtime.
    pub fn spawn(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<Result<()>> {
        tokio::spawn(Arc::clone(self).serve(listener))
    }

    async fn open_connection(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr) {
        let mut stream = match self.acceptor.accept(tcp).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(self.log, "failed to set up socket"; "peer" => %peer, "err" => %e);
                return;
            }
        };

        let conn = ServerConnection::new(peer, Arc::clone(&self.dispatcher), Some(&self.log));
        let timeout = self.config.handshake_timeout();
        match tokio::time::timeout(timeout, conn.handshake(&mut stream)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(self.log, "handshake failed"; "peer" => %peer, "err" => %e);
                return;
            }
            Err(_) => {
                warn!(self.log, "handshake timed out"; "peer" => %peer);
                return;
            }
        }

        self.lock_connections().insert(peer, Arc::clone(&conn));
        conn.run(stream).await;

        let mut connections = self.lock_connections();
        if connections
            .get(&peer)
            .map_or(false, |current| Arc::ptr_eq(current, &conn))
        {
            connections.remove(&peer);
        }
    }

    /// Closes every active connection without stopping the accept loop.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<ServerConnection>> =
            self.lock_connections().values().cloned().collect();
        for conn in conns {
            conn.close().await;
        }
    }

    /// Stops accepting and closes every active connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.close_all().await;
    }
}
