// Copyright 2026 Highway RPC Developers

//! A fixed number of connections to one destination.
//!
//! A call picks its connection by `correlation_id % size`. Dead slots are
//! redialed lazily by the next call that lands on them, one slot at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use slog::{debug, info, o, Logger};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout_at, Instant};

use crate::config::ClientConfig;
use crate::connection::ClientConnection;
use crate::error::{HighwayError, Result};
use crate::invocation::InvocationContext;
use crate::message::{Request, Response};
use crate::transport::Connector;

type Slots = Vec<Option<Arc<ClientConnection>>>;

fn slot_index(correlation_id: u64, size: usize) -> usize {
    (correlation_id % size as u64) as usize
}

pub struct ConnectionPool {
    addr: String,
    connector: Connector,
    connect_timeout: Duration,
    log: Logger,
    slots: Mutex<Slots>,
    /// Serializes slot repair so two callers never dial the same slot.
    repair: AsyncMutex<()>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Opens all `config.pool_size` connections to `addr`. If any of them
    /// fails the ones already open are closed and the error is returned.
    pub async fn connect(
        addr: &str,
        config: &ClientConfig,
        connector: Connector,
        log: Option<&Logger>,
    ) -> Result<Arc<ConnectionPool>> {
        config.validate()?;
        let log = crate::logger_or_stdlog(log).new(o!("destination" => addr.to_string()));

        let mut slots: Slots = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            match ClientConnection::connect(addr, &connector, config.connect_timeout(), Some(&log))
                .await
            {
                Ok(conn) => slots.push(Some(conn)),
                Err(e) => {
                    for conn in slots.into_iter().flatten() {
                        conn.close().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(log, "connection pool created"; "size" => config.pool_size);
        Ok(Arc::new(ConnectionPool {
            addr: addr.to_string(),
            connector,
            connect_timeout: config.connect_timeout(),
            log,
            slots: Mutex::new(slots),
            repair: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn address(&self) -> &str {
        &self.addr
    }

    pub fn size(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The slot a call with `correlation_id` is routed to.
    pub fn slot_for(&self, correlation_id: u64) -> usize {
        slot_index(correlation_id, self.size())
    }

    /// The connection currently installed in `slot`, dead or alive.
    pub fn connection_at(&self, slot: usize) -> Option<Arc<ClientConnection>> {
        self.lock_slots().get(slot).cloned().flatten()
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_connection(&self, slot: usize) -> Option<Arc<ClientConnection>> {
        self.connection_at(slot).filter(|conn| !conn.is_closed())
    }

    async fn connection_for(&self, correlation_id: u64) -> Result<Arc<ClientConnection>> {
        if self.is_closed() {
            return Err(HighwayError::ConnectionClosed);
        }
        let slot = self.slot_for(correlation_id);
        if let Some(conn) = self.live_connection(slot) {
            return Ok(conn);
        }

        let _repair = self.repair.lock().await;
        // another caller may have fixed it while we waited
        if let Some(conn) = self.live_connection(slot) {
            return Ok(conn);
        }
        if self.is_closed() {
            return Err(HighwayError::ConnectionClosed);
        }

        debug!(self.log, "redialing dead slot"; "slot" => slot);
        let conn = ClientConnection::connect(
            &self.addr,
            &self.connector,
            self.connect_timeout,
            Some(&self.log),
        )
        .await?;
        if let Some(entry) = self.lock_slots().get_mut(slot) {
            *entry = Some(Arc::clone(&conn));
        }
        Ok(conn)
    }

    /// Sends a two-way call and waits for its response.
    ///
    /// `timeout` covers slot repair, the write and the wait. When it expires
    /// the call is completed locally with `SendTimeout` and its registration
    /// is removed, so a response arriving later is discarded. The connection
    /// stays open.
    pub async fn call(
        &self,
        correlation_id: u64,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let frame = request.to_frame(correlation_id)?;
        let timed_out = || HighwayError::SendTimeout {
            correlation_id,
            timeout,
        };

        let conn = match timeout_at(deadline, self.connection_for(correlation_id)).await {
            Ok(conn) => conn?,
            Err(_) => return Err(timed_out()),
        };

        let (ctx, mut rx) = InvocationContext::new(frame);
        if timeout_at(deadline, conn.send_two_way(Arc::clone(&ctx)))
            .await
            .is_ok()
        {
            if let Ok(result) = timeout_at(deadline, &mut rx).await {
                return result.unwrap_or(Err(HighwayError::ConnectionClosed));
            }
        }

        conn.forget(&ctx);
        if ctx.complete(Err(timed_out())) {
            debug!(self.log, "call timed out"; "correlation_id" => correlation_id);
            return Err(timed_out());
        }
        // a response or failure landed just before the deadline
        rx.try_recv().unwrap_or(Err(HighwayError::ConnectionClosed))
    }

    /// Sends a one-way request. Success only means the frame was written.
    pub async fn post(&self, correlation_id: u64, request: &Request) -> Result<()> {
        let frame = request.to_frame(correlation_id)?;
        let conn = self.connection_for(correlation_id).await?;
        conn.send_one_way(frame).await
    }

    /// Closes every connection. Later calls fail with `ConnectionClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let conns: Vec<Arc<ClientConnection>> = {
            let _repair = self.repair.lock().await;
            self.lock_slots().iter_mut().filter_map(Option::take).collect()
        };
        for conn in conns {
            conn.close().await;
        }
        debug!(self.log, "connection pool closed");
    }
}
