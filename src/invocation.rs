// Copyright 2026 Highway RPC Developers

//! Client-side bookkeeping for one in-flight two-way call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::Result;
use crate::message::Response;
use crate::protocol::Frame;

pub type CallResult = Result<Response>;

/// Pairs an outgoing request frame with the slot its response lands in.
///
/// Completion fires at most once. Whichever of the receive loop, the caller's
/// timeout or a connection close gets there first wins; every later attempt
/// is a no-op that returns `false`.
#[derive(Debug)]
pub struct InvocationContext {
    correlation_id: u64,
    request: Frame,
    completed: AtomicBool,
    slot: Mutex<Option<oneshot::Sender<CallResult>>>,
}

impl InvocationContext {
    pub fn new(request: Frame) -> (Arc<InvocationContext>, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        let ctx = InvocationContext {
            correlation_id: request.correlation_id,
            request,
            completed: AtomicBool::new(false),
            slot: Mutex::new(Some(tx)),
        };
        (Arc::new(ctx), rx)
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn request(&self) -> &Frame {
        &self.request
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Delivers `result` to the waiting caller. Returns `false` if the
    /// context had already been completed.
    pub fn complete(&self, result: CallResult) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = sender {
            // The caller may already have given up waiting.
            let _ = tx.send(result);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::error::HighwayError;

    fn context() -> (Arc<InvocationContext>, oneshot::Receiver<CallResult>) {
        InvocationContext::new(Frame::new(17, &b"h"[..], &b"b"[..]))
    }

    #[test]
    fn first_completion_wins() {
        let (ctx, mut rx) = context();
        assert_eq!(ctx.correlation_id(), 17);
        assert!(ctx.complete(Ok(Response::ok(&b"pong"[..]))));
        assert!(!ctx.complete(Err(HighwayError::ConnectionClosed)));
        assert!(ctx.is_completed());

        let resp = rx.try_recv().unwrap().unwrap();
        assert_eq!(&resp.body[..], b"pong");
    }

    #[test]
    fn concurrent_completion_fires_once() {
        let (ctx, mut rx) = context();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || {
                    if i % 2 == 0 {
                        ctx.complete(Err(HighwayError::ConnectionClosed))
                    } else {
                        ctx.complete(Ok(Response::ok(vec![i as u8])))
                    }
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn completing_after_receiver_dropped_is_harmless() {
        let (ctx, rx) = context();
        drop(rx);
        assert!(ctx.complete(Err(HighwayError::ConnectionClosed)));
        assert!(!ctx.complete(Err(HighwayError::ConnectionClosed)));
    }
}
