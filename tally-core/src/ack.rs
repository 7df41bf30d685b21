//! Ack propagation.
//!
//! Every record's `DeliveryHandle` is reference counted across the tokens and write
//! entries derived from it. The stage that receives the record from the source opens the
//! handle with one guard reference, retains one reference per derived unit, and releases
//! the guard when it is done deriving. Each derived unit releases its reference once it is
//! durably written, or fails it once it is abandoned.
//!
//! When the count drops to zero the record is resolved exactly once: acked if no derived
//! unit failed, failed otherwise. Resolutions are sent to the source stage through an
//! unbounded channel, so resolving never blocks a worker.
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use likely_stable::unlikely;
use log::{error, warn};
use strum::Display;

use crate::record::DeliveryHandle;

/// Why a record was failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Payload could not be decoded.
    Decode,

    /// The target partition worker was unreachable.
    Routing,

    /// The sink store rejected the write after all retries.
    Sink,

    /// The pipeline shut down before the write could be flushed.
    Shutdown,
}

/// Resolution of one record, sent back to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    Ack(DeliveryHandle),
    Fail(DeliveryHandle, FailureKind),
}

impl AckEvent {
    pub fn handle(&self) -> DeliveryHandle {
        match self {
            AckEvent::Ack(handle) => *handle,
            AckEvent::Fail(handle, _) => *handle,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    /// Outstanding references.
    pending: usize,

    /// First failure reported by any derived unit.
    failure: Option<FailureKind>,
}

/// Reference counts of all records in flight.
pub struct AckTracker {
    in_flight: DashMap<DeliveryHandle, InFlight>,
    sender: async_channel::Sender<AckEvent>,
}

impl AckTracker {
    /// Create a tracker and the receiver of its resolutions.
    ///
    /// The receiver is closed once the tracker is dropped.
    pub fn channel() -> (Self, async_channel::Receiver<AckEvent>) {
        let (sender, receiver) = async_channel::unbounded();

        (
            Self {
                in_flight: DashMap::new(),
                sender,
            },
            receiver,
        )
    }

    /// Start tracking `handle` with one guard reference.
    pub fn open(&self, handle: DeliveryHandle) {
        match self.in_flight.entry(handle) {
            Entry::Occupied(mut e) => {
                warn!("delivery handle opened twice, handle: {}", handle);
                e.get_mut().pending += 1;
            }
            Entry::Vacant(e) => {
                e.insert(InFlight {
                    pending: 1,
                    failure: None,
                });
            }
        }
    }

    /// Add one reference for a derived unit.
    pub fn retain(&self, handle: DeliveryHandle) {
        match self.in_flight.get_mut(&handle) {
            Some(mut state) => state.pending += 1,
            None => {
                error!("retain on unknown delivery handle, handle: {}", handle);
            }
        }
    }

    /// Drop one reference; the unit is done.
    pub fn release(&self, handle: DeliveryHandle) {
        self.release_with(handle, None);
    }

    /// Drop one reference; the unit was abandoned and the record must be failed.
    pub fn fail(&self, handle: DeliveryHandle, kind: FailureKind) {
        self.release_with(handle, Some(kind));
    }

    /// Number of records not yet resolved.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn release_with(&self, handle: DeliveryHandle, failure: Option<FailureKind>) {
        let resolved = match self.in_flight.entry(handle) {
            Entry::Occupied(mut e) => {
                let state = e.get_mut();

                if let Some(kind) = failure {
                    state.failure.get_or_insert(kind);
                }

                state.pending = state.pending.saturating_sub(1);

                if state.pending == 0 {
                    Some(e.remove().failure)
                } else {
                    None
                }
            }
            Entry::Vacant(_) => {
                error!("release on unknown delivery handle, handle: {}", handle);
                None
            }
        };

        if let Some(failure) = resolved {
            let event = match failure {
                Some(kind) => AckEvent::Fail(handle, kind),
                None => AckEvent::Ack(handle),
            };

            if unlikely(self.sender.try_send(event).is_err()) {
                error!("ack receiver is closed, dropping {:?}", event);
            }
        }
    }
}
