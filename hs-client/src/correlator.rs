//! # Request Correlator
//!
//! Purpose: Attribute every response line to the request that caused it.
//!
//! The protocol carries no request id, so the n-th line read from a socket
//! answers the n-th line written to it only while requests on that socket are
//! never interleaved. The correlator enforces this with an exclusivity token:
//! a `Ticket` holds the connection's async mutex for one full
//! submit-and-await cycle.
//!
//! ## Design Principles
//! 1. **Token, Not Data Lock**: The mutex guards the queue pair, not any data
//!    the caller reads.
//! 2. **Cancellable**: Acquiring and awaiting both honour a deadline.
//! 3. **Abandonment Is Sticky**: Once a submitted request goes unanswered
//!    (deadline hit or caller future dropped), the next response on that
//!    socket belongs to nobody. The connection is flagged and must be rebuilt.
//!    The flag is only read under the ticket, so a request that is merely in
//!    flight never looks abandoned to a waiting caller.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::warn;

use hs_common::{Command, Response};

use crate::connection::{Direction, Lifecycle, Shared};
use crate::error::{ClientError, ClientResult};

struct Slot {
    outbound: mpsc::Sender<Command>,
    inbound: mpsc::Receiver<ClientResult<Response>>,
}

/// Per-connection exclusivity for request/response exchanges.
pub(crate) struct Correlator {
    direction: Direction,
    slot: Mutex<Slot>,
    abandoned: AtomicBool,
    shared: Arc<Shared>,
}

impl Correlator {
    pub(crate) fn new(
        direction: Direction,
        outbound: mpsc::Sender<Command>,
        inbound: mpsc::Receiver<ClientResult<Response>>,
        shared: Arc<Shared>,
    ) -> Self {
        Correlator {
            direction,
            slot: Mutex::new(Slot { outbound, inbound }),
            abandoned: AtomicBool::new(false),
            shared,
        }
    }

    /// Waits for exclusive use of the connection.
    ///
    /// An abandoned connection is still handed out so the holder can see
    /// `Ticket::is_abandoned` and rebuild it; any other closed connection is
    /// an error.
    pub(crate) async fn acquire(&self, deadline: Option<Instant>) -> ClientResult<Ticket<'_>> {
        let slot = until(deadline, self.slot.lock())
            .await
            .ok_or(ClientError::Timeout {
                direction: self.direction,
            })?;
        let ticket = Ticket {
            correlator: self,
            slot,
        };
        if !ticket.is_abandoned() {
            self.shared.ensure_open()?;
        }
        Ok(ticket)
    }
}

/// Exclusive right to one exchange on a connection; released on drop.
pub(crate) struct Ticket<'a> {
    correlator: &'a Correlator,
    slot: MutexGuard<'a, Slot>,
}

impl Ticket<'_> {
    /// True if an earlier holder submitted a request and never consumed its
    /// response. Only the ticket holder touches the flag, so this is exact.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.correlator.abandoned.load(Ordering::Acquire)
    }

    /// Submits `command` and waits for its response.
    ///
    /// On deadline the connection is shut down and flagged as abandoned.
    pub(crate) async fn round_trip(
        &mut self,
        command: Command,
        deadline: Option<Instant>,
    ) -> ClientResult<Response> {
        let correlator = self.correlator;
        let shared = &correlator.shared;
        if self.is_abandoned() {
            return Err(ClientError::connection(
                correlator.direction,
                "connection abandoned after an unanswered request",
            ));
        }
        shared.ensure_open()?;

        // Cleared only once the matching response has been consumed, so a
        // dropped future leaves the flag set for the next ticket holder.
        correlator.abandoned.store(true, Ordering::Release);

        let slot = &mut *self.slot;
        let mut lifecycle = shared.subscribe();
        let exchange = async {
            slot.outbound
                .send(command)
                .await
                .map_err(|_| shared.closed_error())?;
            tokio::select! {
                biased;
                received = slot.inbound.recv() => match received {
                    Some(result) => result,
                    None => Err(shared.closed_error()),
                },
                _ = async { drop(lifecycle.wait_for(|state| *state == Lifecycle::Closed).await) } => {
                    // A closed connection has a reader that is exiting; it
                    // hands over its terminal error, if any, before the
                    // channel ends.
                    match slot.inbound.recv().await {
                        Some(result) => result,
                        None => Err(shared.closed_error()),
                    }
                }
            }
        };

        match until(deadline, exchange).await {
            Some(result) => {
                correlator.abandoned.store(false, Ordering::Release);
                result
            }
            None => {
                warn!(direction = %correlator.direction, "request deadline elapsed, dropping connection");
                shared.shutdown("request timed out");
                Err(ClientError::Timeout {
                    direction: correlator.direction,
                })
            }
        }
    }
}

async fn until<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}
