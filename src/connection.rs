// Copyright 2026 Highway RPC Developers

//! Client-role connection: one socket, one receive loop, and the table of
//! calls waiting for a response on it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use slog::{debug, o, warn, Logger};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{HighwayError, Result};
use crate::invocation::InvocationContext;
use crate::message::{ControlMessage, LoginHeader, Response};
use crate::protocol::{read_frame, write_frame, Frame, HighwayCodec};
use crate::transport::{BoxedStream, Connector};

/// Correlation id used for the login exchange. Calls never use it because
/// the login happens before the receive loop starts.
pub(crate) const LOGIN_CORRELATION_ID: u64 = 0;

/// Sends a login frame and waits for the peer's success reply.
pub(crate) async fn login(stream: &mut BoxedStream) -> Result<()> {
    let login = ControlMessage::Login(LoginHeader::default())
        .into_frame(LOGIN_CORRELATION_ID, Bytes::new())?;
    write_frame(stream, &login).await?;

    let reply = read_frame(stream)
        .await?
        .ok_or_else(|| HighwayError::handshake("peer closed the connection during login"))?;
    let resp = Response::from_frame(reply)
        .map_err(|e| HighwayError::handshake(format!("unparseable login reply: {}", e)))?;
    if !resp.is_ok() {
        return Err(HighwayError::handshake(format!(
            "login rejected with status {}: {}",
            resp.status, resp.reason
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Handshaking,
    Open,
    Closed,
}

type FrameSink = FramedWrite<WriteHalf<BoxedStream>, HighwayCodec>;
type FrameSource = FramedRead<ReadHalf<BoxedStream>, HighwayCodec>;

struct Shared {
    state: ConnectionState,
    pending: HashMap<u64, Arc<InvocationContext>>,
}

pub struct ClientConnection {
    remote: String,
    log: Logger,
    shared: Mutex<Shared>,
    writer: AsyncMutex<Option<FrameSink>>,
    shutdown: CancellationToken,
}

impl ClientConnection {
    pub fn new(remote: &str, log: Option<&Logger>) -> Arc<ClientConnection> {
        let log = crate::logger_or_stdlog(log).new(o!("remote" => remote.to_string()));
        Arc::new(ClientConnection {
            remote: remote.to_string(),
            log,
            shared: Mutex::new(Shared {
                state: ConnectionState::Unopened,
                pending: HashMap::new(),
            }),
            writer: AsyncMutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Creates and opens a connection in one step.
    pub async fn connect(
        remote: &str,
        connector: &Connector,
        timeout: Duration,
        log: Option<&Logger>,
    ) -> Result<Arc<ClientConnection>> {
        let conn = ClientConnection::new(remote, log);
        conn.open(connector, timeout).await?;
        Ok(conn)
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_shared().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Correlation ids of calls still waiting for a response, sorted.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock_shared().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.lock_shared().pending.len()
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dials, performs the login exchange and starts the receive loop.
    ///
    /// `timeout` bounds the dial and the login together. On failure the
    /// connection ends up `Closed` and is not retried.
    pub async fn open(self: &Arc<Self>, connector: &Connector, timeout: Duration) -> Result<()> {
        {
            let mut shared = self.lock_shared();
            let state = shared.state;
            match state {
                ConnectionState::Unopened => shared.state = ConnectionState::Handshaking,
                ConnectionState::Closed => return Err(HighwayError::ConnectionClosed),
                state => {
                    return Err(HighwayError::handshake(format!(
                        "connection already {:?}",
                        state
                    )))
                }
            }
        }

        let stream = match tokio::time::timeout(timeout, self.handshake(connector, timeout)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(self.log, "failed to open connection"; "err" => %e);
                self.lock_shared().state = ConnectionState::Closed;
                return Err(e);
            }
            Err(_) => {
                warn!(self.log, "login timed out"; "timeout" => ?timeout);
                self.lock_shared().state = ConnectionState::Closed;
                return Err(HighwayError::handshake(format!(
                    "login timed out after {:?}",
                    timeout
                )));
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = self.writer.lock().await;
        {
            let mut shared = self.lock_shared();
            if shared.state != ConnectionState::Handshaking {
                // closed while logging in
                return Err(HighwayError::ConnectionClosed);
            }
            shared.state = ConnectionState::Open;
        }
        *writer = Some(FramedWrite::new(write_half, HighwayCodec));
        drop(writer);

        let frames = FramedRead::new(read_half, HighwayCodec);
        tokio::spawn(Arc::clone(self).receive_loop(frames));
        debug!(self.log, "connection open");
        Ok(())
    }

    async fn handshake(&self, connector: &Connector, timeout: Duration) -> Result<BoxedStream> {
        let mut stream = connector.connect(&self.remote, timeout).await?;
        login(&mut stream).await?;
        debug!(self.log, "login accepted");
        Ok(stream)
    }

    fn register(&self, ctx: &Arc<InvocationContext>) -> Result<()> {
        let mut shared = self.lock_shared();
        if shared.state != ConnectionState::Open {
            return Err(HighwayError::ConnectionClosed);
        }
        match shared.pending.entry(ctx.correlation_id()) {
            Entry::Occupied(_) => Err(HighwayError::DuplicateCorrelationId(ctx.correlation_id())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(ctx));
                Ok(())
            }
        }
    }

    /// Drops `ctx`'s registration if it is still the one in the table.
    pub fn forget(&self, ctx: &Arc<InvocationContext>) -> bool {
        let mut shared = self.lock_shared();
        let id = ctx.correlation_id();
        let is_current = shared
            .pending
            .get(&id)
            .map_or(false, |current| Arc::ptr_eq(current, ctx));
        if is_current {
            shared.pending.remove(&id);
        }
        is_current
    }

    fn take_pending(&self, correlation_id: u64) -> Option<Arc<InvocationContext>> {
        self.lock_shared().pending.remove(&correlation_id)
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink.send(frame).await,
            None => Err(HighwayError::ConnectionClosed),
        }
    }

    /// Registers `ctx` and writes its request. Every failure is delivered
    /// through `ctx`, so the caller only ever waits on the context.
    ///
    /// The registration happens before the write so a fast response cannot
    /// miss its waiter.
    pub async fn send_two_way(&self, ctx: Arc<InvocationContext>) {
        if let Err(e) = self.register(&ctx) {
            ctx.complete(Err(e));
            return;
        }

        if let Err(e) = self.write(ctx.request().clone()).await {
            warn!(self.log, "failed to write request";
                "correlation_id" => ctx.correlation_id(), "err" => %e);
            self.forget(&ctx);
            ctx.complete(Err(e));
            self.close().await;
        }
    }

    /// Writes a request that expects no response.
    pub async fn send_one_way(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(HighwayError::ConnectionClosed);
        }
        let correlation_id = frame.correlation_id;
        if let Err(e) = self.write(frame).await {
            warn!(self.log, "failed to write one-way request";
                "correlation_id" => correlation_id, "err" => %e);
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Closes the socket and fails every pending call with
    /// `ConnectionClosed`. Calling it again is a no-op.
    pub async fn close(&self) {
        let pending = {
            let mut shared = self.lock_shared();
            if shared.state == ConnectionState::Closed {
                return;
            }
            shared.state = ConnectionState::Closed;
            std::mem::take(&mut shared.pending)
        };

        self.shutdown.cancel();
        let failed = pending.len();
        for (_, ctx) in pending {
            ctx.complete(Err(HighwayError::ConnectionClosed));
        }

        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = SinkExt::<Frame>::close(&mut sink).await;
        }
        debug!(self.log, "connection closed"; "failed_calls" => failed);
    }

    async fn receive_loop(self: Arc<Self>, mut frames: FrameSource) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    if let Err(e) = self.deliver(frame) {
                        warn!(self.log, "bad response frame"; "err" => %e);
                        break;
                    }
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

    fn deliver(&self, frame: Frame) -> Result<()> {
        let correlation_id = frame.correlation_id;
        let ctx = match self.take_pending(correlation_id) {
            Some(ctx) => ctx,
            None => {
                debug!(self.log, "discarding response with no waiting call";
                    "correlation_id" => correlation_id);
                return Ok(());
            }
        };

        match Response::from_frame(frame) {
            Ok(resp) => {
                ctx.complete(Ok(resp));
                Ok(())
            }
            Err(e) => {
                ctx.complete(Err(HighwayError::framing(e.to_string())));
                Err(e)
            }
        }
    }
}
