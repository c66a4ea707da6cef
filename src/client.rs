// Copyright 2026 Highway RPC Developers

//! The client registry: one connection pool per destination address, and
//! the correlation id counter shared by every call made through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use slog::{debug, o, Logger};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::ClientConfig;
use crate::connection::LOGIN_CORRELATION_ID;
use crate::error::{HighwayError, Result};
use crate::message::{Request, Response};
use crate::pool::ConnectionPool;
use crate::transport::Connector;

/// Maps a logical service to a destination address and learns how calls to
/// it went. Implemented by the discovery and load-balancing layer.
pub trait Resolver: Send + Sync {
    fn resolve(&self, service: &str) -> Result<String>;

    fn report(&self, _address: &str, _outcome: std::result::Result<(), &HighwayError>) {}
}

/// A resolver that always answers with the same address.
#[derive(Debug, Clone)]
pub struct StaticResolver(pub String);

impl Resolver for StaticResolver {
    fn resolve(&self, _service: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub struct ClientRegistry {
    config: ClientConfig,
    connector: Connector,
    log: Logger,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    /// One lock per address, held while that address's pool is created so
    /// concurrent first calls do not dial two pools. Other addresses are not
    /// held up.
    creating: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new(config: ClientConfig, connector: Connector, log: Option<&Logger>) -> ClientRegistry {
        ClientRegistry {
            config,
            connector,
            log: crate::logger_or_stdlog(log).new(o!("component" => "client")),
            pools: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(LOGIN_CORRELATION_ID + 1),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A correlation id no other call from this registry is using.
    pub fn next_correlation_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != LOGIN_CORRELATION_ID {
                return id;
            }
        }
    }

    fn cached(&self, addr: &str) -> Option<Arc<ConnectionPool>> {
        self.pools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(addr)
            .filter(|pool| !pool.is_closed())
            .cloned()
    }

    /// Returns the pool for `addr`, creating and fully opening it on first
    /// use. A pool that fails to open is not cached.
    pub async fn get_client(&self, addr: &str) -> Result<Arc<ConnectionPool>> {
        if let Some(pool) = self.cached(addr) {
            return Ok(pool);
        }

        let create = self.creation_lock(addr);
        let _create = create.lock().await;
        if let Some(pool) = self.cached(addr) {
            return Ok(pool);
        }

        let pool =
            ConnectionPool::connect(addr, &self.config, self.connector.clone(), Some(&self.log))
                .await?;
        self.pools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(addr.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    fn creation_lock(&self, addr: &str) -> Arc<AsyncMutex<()>> {
        let mut creating = self
            .creating
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            creating
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.cached(addr).is_some()
    }

    /// Removes and closes the pool for `addr`. Unknown addresses are ignored.
    pub async fn close(&self, addr: &str) {
        let removed = self
            .pools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(addr);
        if let Some(pool) = removed {
            debug!(self.log, "closing pool"; "destination" => addr);
            pool.close().await;
        }
    }

    pub async fn close_all(&self) {
        let pools: Vec<Arc<ConnectionPool>> = self
            .pools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in pools {
            pool.close().await;
        }
    }

    /// Two-way call to `addr` with the configured call timeout.
    pub async fn call(&self, addr: &str, request: &Request) -> Result<Response> {
        self.call_with_timeout(addr, request, self.config.call_timeout())
            .await
    }

    pub async fn call_with_timeout(
        &self,
        addr: &str,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let pool = self.get_client(addr).await?;
        pool.call(self.next_correlation_id(), request, timeout).await
    }

    /// One-way request to `addr`.
    pub async fn post(&self, addr: &str, request: &Request) -> Result<()> {
        let pool = self.get_client(addr).await?;
        pool.post(self.next_correlation_id(), request).await
    }

    /// Resolves `request.service` through `resolver`, calls it and reports
    /// the transport-level outcome back. A non-success status still counts
    /// as a delivered call.
    pub async fn invoke(&self, resolver: &dyn Resolver, request: &Request) -> Result<Response> {
        let addr = resolver.resolve(&request.service)?;
        let result = self.call(&addr, request).await;
        match &result {
            Ok(_) => resolver.report(&addr, Ok(())),
            Err(e) => resolver.report(&addr, Err(e)),
        }
        result
    }
}
