// Copyright 2026 Highway RPC Developers

//! Worker-pool variant of the client.
//!
//! Each destination gets a bounded job queue and a fixed set of workers.
//! A worker owns its own connection, logs in on its first job and then runs
//! jobs strictly one at a time: write the request, wait for the matching
//! response, take the next job. A job that breaks the connection tears down
//! every worker of that destination; the next `ensure_workers` builds a
//! fresh set. Teardown and idle reaping close the queue but let running
//! jobs finish; `close_all`, `remove_destination` and dropping the scheduler
//! abandon them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use slog::{debug, info, o, warn, Logger};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{QueueFullPolicy, SchedulerConfig};
use crate::connection::{login, LOGIN_CORRELATION_ID};
use crate::error::{HighwayError, Result};
use crate::message::{Request, Response};
use crate::protocol::{read_frame, write_frame};
use crate::transport::{BoxedStream, Connector};

struct Job {
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
}

/// Waits for the outcome of a scheduled job.
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<Result<Response>>,
}

impl JobHandle {
    /// A job dropped because its destination was torn down resolves to
    /// `ConnectionClosed`.
    pub async fn wait(self) -> Result<Response> {
        self.rx.await.unwrap_or(Err(HighwayError::ConnectionClosed))
    }
}

struct Destination {
    addr: String,
    workers: usize,
    /// `None` once the destination is retired.
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    /// Milliseconds since the scheduler's epoch.
    last_activity: AtomicU64,
    /// Workers stop taking jobs once this fires. Child of `shutdown`.
    retired: CancellationToken,
    /// Workers abandon the job they are running once this fires.
    shutdown: CancellationToken,
}

impl Destination {
    fn lock_queue(&self) -> MutexGuard<'_, Option<mpsc::Sender<Job>>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.lock_queue().clone()
    }

    /// Closes the queue. Running jobs finish, queued ones are dropped once
    /// the last worker exits.
    fn retire(&self) {
        self.lock_queue().take();
        self.retired.cancel();
    }

    fn abort(&self) {
        self.retire();
        self.shutdown.cancel();
    }
}

struct Inner {
    config: SchedulerConfig,
    connector: Connector,
    log: Logger,
    epoch: Instant,
    destinations: Mutex<HashMap<String, Arc<Destination>>>,
}

impl Inner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn lock_destinations(&self) -> MutexGuard<'_, HashMap<String, Arc<Destination>>> {
        self.destinations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Unregisters `dest` if it is still the current entry for its address
    /// and retires its workers.
    fn teardown(&self, dest: &Arc<Destination>) {
        {
            let mut destinations = self.lock_destinations();
            let is_current = destinations
                .get(&dest.addr)
                .map_or(false, |current| Arc::ptr_eq(current, dest));
            if is_current {
                destinations.remove(&dest.addr);
            }
        }
        dest.retire();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for dest in self.lock_destinations().values() {
            dest.abort();
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        connector: Connector,
        log: Option<&Logger>,
    ) -> Result<Scheduler> {
        config.validate()?;
        Ok(Scheduler {
            inner: Arc::new(Inner {
                config,
                connector,
                log: crate::logger_or_stdlog(log).new(o!("component" => "scheduler")),
                epoch: Instant::now(),
                destinations: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn destination(&self, addr: &str) -> Option<Arc<Destination>> {
        self.inner.lock_destinations().get(addr).cloned()
    }

    pub fn has_destination(&self, addr: &str) -> bool {
        self.destination(addr).is_some()
    }

    pub fn worker_count(&self, addr: &str) -> Option<usize> {
        self.destination(addr).map(|dest| dest.workers)
    }

    /// Creates the queue and `count` workers for `addr`. Does nothing if the
    /// destination already has workers.
    pub fn ensure_workers(&self, addr: &str, count: usize) -> Result<()> {
        if count == 0 {
            return Err(HighwayError::Config(String::from(
                "worker count must be at least 1",
            )));
        }

        let (dest, rx) = {
            let mut destinations = self.inner.lock_destinations();
            if destinations.contains_key(addr) {
                return Ok(());
            }
            let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity);
            let shutdown = CancellationToken::new();
            let dest = Arc::new(Destination {
                addr: addr.to_string(),
                workers: count,
                queue: Mutex::new(Some(tx)),
                last_activity: AtomicU64::new(self.inner.now_ms()),
                retired: shutdown.child_token(),
                shutdown,
            });
            destinations.insert(addr.to_string(), Arc::clone(&dest));
            (dest, rx)
        };

        let queue = Arc::new(AsyncMutex::new(rx));
        for id in 0..count {
            let worker = Worker {
                id,
                dest: Arc::clone(&dest),
                queue: Arc::clone(&queue),
                scheduler: Arc::downgrade(&self.inner),
                connector: self.inner.connector.clone(),
                connect_timeout: self.inner.config.connect_timeout(),
                call_timeout: self.inner.config.call_timeout(),
                log: self
                    .inner
                    .log
                    .new(o!("destination" => addr.to_string(), "worker" => id)),
            };
            tokio::spawn(worker.run());
        }

        info!(self.inner.log, "destination workers created";
            "destination" => addr, "workers" => count);
        Ok(())
    }

    /// Queues `request` for one of `addr`'s workers.
    pub async fn schedule_job(&self, addr: &str, request: Request) -> Result<JobHandle> {
        let dest = self
            .destination(addr)
            .ok_or_else(|| HighwayError::DestinationNotFound(addr.to_string()))?;
        let queue = dest.sender().ok_or(HighwayError::ConnectionClosed)?;

        let (reply, rx) = oneshot::channel();
        let job = Job { request, reply };
        dest.last_activity
            .store(self.inner.now_ms(), Ordering::Release);

        match self.inner.config.full_policy {
            QueueFullPolicy::Block => queue
                .send(job)
                .await
                .map_err(|_| HighwayError::ConnectionClosed)?,
            QueueFullPolicy::Reject => queue.try_send(job).map_err(|e| match e {
                TrySendError::Full(_) => HighwayError::QueueFull(addr.to_string()),
                TrySendError::Closed(_) => HighwayError::ConnectionClosed,
            })?,
        }
        Ok(JobHandle { rx })
    }

    /// Schedules `request` and waits for its response.
    pub async fn call(&self, addr: &str, request: Request) -> Result<Response> {
        self.schedule_job(addr, request).await?.wait().await
    }

    /// Stops and forgets `addr`'s workers, abandoning running and queued
    /// jobs. Returns whether it existed.
    pub fn remove_destination(&self, addr: &str) -> bool {
        match self.destination(addr) {
            Some(dest) => {
                self.inner.teardown(&dest);
                dest.abort();
                true
            }
            None => false,
        }
    }

    /// Removes every destination that has not seen a job within the idle
    /// timeout. Workers that are mid-job finish it and then exit. Returns the
    /// removed addresses.
    pub fn reap_idle(&self) -> Vec<String> {
        let idle_ms = self.inner.config.idle_timeout_ms;
        let now = self.inner.now_ms();
        let reaped: Vec<Arc<Destination>> = {
            let mut destinations = self.inner.lock_destinations();
            let idle: Vec<String> = destinations
                .iter()
                .filter(|(_, dest)| {
                    now.saturating_sub(dest.last_activity.load(Ordering::Acquire)) >= idle_ms
                })
                .map(|(addr, _)| addr.clone())
                .collect();
            idle.iter()
                .filter_map(|addr| destinations.remove(addr))
                .collect()
        };

        reaped
            .into_iter()
            .map(|dest| {
                dest.retire();
                info!(self.inner.log, "reaped idle destination"; "destination" => &dest.addr);
                dest.addr.clone()
            })
            .collect()
    }

    /// Runs `reap_idle` every reap interval until the scheduler is dropped.
    pub fn start_reaper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.reap_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        Scheduler { inner }.reap_idle();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn close_all(&self) {
        let all: Vec<Arc<Destination>> = self
            .inner
            .lock_destinations()
            .drain()
            .map(|(_, dest)| dest)
            .collect();
        for dest in all {
            dest.abort();
        }
    }
}

/// A worker's connection to its destination.
struct Session {
    stream: BoxedStream,
    logged_in: bool,
    next_id: u64,
}

impl Session {
    /// Writes the request and reads until the matching response arrives.
    async fn exchange(&mut self, request: &Request, log: &Logger) -> Result<Response> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(LOGIN_CORRELATION_ID + 1);

        write_frame(&mut self.stream, &request.to_frame(id)?).await?;
        loop {
            let frame = read_frame(&mut self.stream)
                .await?
                .ok_or(HighwayError::ConnectionClosed)?;
            if frame.correlation_id == id {
                return Response::from_frame(frame);
            }
            debug!(log, "discarding response with no waiting job";
                "correlation_id" => frame.correlation_id, "expected" => id);
        }
    }
}

struct Worker {
    id: usize,
    dest: Arc<Destination>,
    queue: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    scheduler: Weak<Inner>,
    connector: Connector,
    connect_timeout: Duration,
    call_timeout: Duration,
    log: Logger,
}

impl Worker {
    async fn next_job(&self) -> Option<Job> {
        let retired = &self.dest.retired;
        let mut queue = tokio::select! {
            biased;
            _ = retired.cancelled() => return None,
            queue = self.queue.lock() => queue,
        };
        tokio::select! {
            biased;
            _ = retired.cancelled() => None,
            job = queue.recv() => job,
        }
    }

    async fn run(self) {
        let mut session: Option<Session> = None;

        while let Some(job) = self.next_job().await {
            if job.reply.is_closed() {
                // caller stopped waiting
                continue;
            }
            let outcome = tokio::select! {
                // dropping the job resolves its handle to ConnectionClosed
                _ = self.dest.shutdown.cancelled() => break,
                outcome = self.process(&mut session, &job.request) => outcome,
            };
            match outcome {
                Ok(resp) => {
                    let _ = job.reply.send(Ok(resp));
                }
                Err(e) if e.is_fatal_to_connection() => {
                    warn!(self.log, "job failed, tearing down destination"; "err" => %e);
                    let _ = job.reply.send(Err(e));
                    match self.scheduler.upgrade() {
                        Some(inner) => inner.teardown(&self.dest),
                        None => self.dest.retire(),
                    }
                    break;
                }
                Err(e) => {
                    debug!(self.log, "job failed"; "err" => %e);
                    if let HighwayError::SendTimeout { .. } = e {
                        // the abandoned read may have left a partial frame
                        session = None;
                    }
                    let _ = job.reply.send(Err(e));
                }
            }
        }

        debug!(self.log, "worker stopped"; "worker" => self.id);
    }

    async fn process(&self, session: &mut Option<Session>, request: &Request) -> Result<Response> {
        if session.is_none() {
            let stream = self
                .connector
                .connect(&self.dest.addr, self.connect_timeout)
                .await?;
            *session = Some(Session {
                stream,
                logged_in: false,
                next_id: LOGIN_CORRELATION_ID + 1,
            });
        }
        let session = session.as_mut().ok_or(HighwayError::ConnectionClosed)?;

        if !session.logged_in {
            tokio::time::timeout(self.connect_timeout, login(&mut session.stream))
                .await
                .map_err(|_| HighwayError::handshake("login timed out"))??;
            session.logged_in = true;
            debug!(self.log, "worker logged in");
        }

        let correlation_id = session.next_id;
        tokio::time::timeout(self.call_timeout, session.exchange(request, &self.log))
            .await
            .map_err(|_| HighwayError::SendTimeout {
                correlation_id,
                timeout: self.call_timeout,
            })?
    }
}
