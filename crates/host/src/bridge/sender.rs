//! Outbound CPort multiplexing
//!
//! Every send stamps the CPort id into the buffer's headroom and submits the
//! resulting `[cport][payload]` frame on the single bulk-out endpoint. The
//! buffer travels inside the request and comes back to the caller through
//! `data_sent` exactly once.

use super::pool::{Acquired, Released};
use super::{Bridge, Cookie, SendError, SendErrorKind, StatusClass, classify};
use common::{Completion, OutSlot, SubmitError, TransferKind, Urb, UrbId, UrbStatus};
use protocol::{CportId, FRAME_OFFSET, MessageBuffer};
use tracing::{debug, error, warn};

impl Bridge {
    /// Queue `buffer` for transmission on `cport`
    ///
    /// On success the buffer is owned by the transport until it is handed
    /// back through [`BridgeHandler::data_sent`]. On failure no I/O was
    /// started and the buffer is returned inside the error.
    ///
    /// [`BridgeHandler::data_sent`]: common::BridgeHandler::data_sent
    pub fn send(&self, cport: CportId, mut buffer: MessageBuffer) -> Result<Cookie, SendError> {
        if self.is_shutting_down() {
            return Err(SendError::new(SendErrorKind::Shutdown, buffer));
        }

        let frame_len = match buffer.stamp_cport(cport) {
            Ok(len) => len,
            Err(e) => {
                debug!("Rejecting send on {}: {}", cport, e);
                return Err(SendError::new(e.into(), buffer));
            }
        };

        let slot = match self.pool.acquire() {
            Some(Acquired::Pooled(slot)) => slot,
            Some(Acquired::Overflow(slot)) => {
                warn!("No free CPort OUT urbs, having to dynamically allocate one");
                self.stats.overflow_allocated();
                self.stats.request_allocated();
                slot
            }
            None => {
                warn!(
                    "CPort OUT requests exhausted on bridge {} ({} pooled, {} overflow)",
                    self.id,
                    self.pool.capacity(),
                    self.settings.max_overflow_urbs
                );
                return Err(SendError::new(SendErrorKind::OutOfResources, buffer));
            }
        };

        let id = UrbId::CportOut(slot);
        let urb = Urb {
            id,
            endpoint: self.endpoints.cport_out,
            kind: TransferKind::Bulk,
            buffer: buffer.into_storage(),
            offset: FRAME_OFFSET,
        };

        if let Err(SubmitError { urb, error }) = self.bus.submit(urb) {
            error!("Failed to submit CPort OUT request on {}: {}", cport, error);
            self.release_out(slot);
            let buffer = restore_buffer(urb.buffer);
            return Err(SendError::new(SendErrorKind::SubmissionFailed(error), buffer));
        }

        self.stats.send_submitted();
        debug!("Sent {} byte frame on {} ({:?})", frame_len, cport, slot);

        // Lost a race with teardown after the shutdown check; the kill below
        // guarantees the completion reaches the queue before quiesce finishes
        if self.is_shutting_down() {
            self.bus.kill(id);
        }

        Ok(Cookie {
            instance: self.instance,
            slot,
        })
    }

    /// Abort an in-flight send
    ///
    /// `None`, stale and unknown cookies (including another bridge's) are
    /// ignored. Returns without waiting for the transfer to stop. A
    /// cancelled send is still reported once through `data_sent`, with
    /// whatever status the transfer finished with.
    pub fn cancel(&self, cookie: Option<Cookie>) {
        let Some(Cookie { instance, slot }) = cookie else {
            return;
        };

        if instance != self.instance {
            debug!("Ignoring cancel with a cookie from another bridge");
            return;
        }

        if !self.pool.is_in_flight(slot) {
            debug!("Ignoring cancel of finished send {:?}", slot);
            return;
        }

        // The id carries the generation, so a slot reused since the check
        // above does not match
        self.bus.unlink(UrbId::CportOut(slot));
    }

    pub(super) fn complete_out(&self, slot: OutSlot, completion: Completion) {
        if !self.pool.begin_complete(slot) {
            warn!("Dropping duplicate completion for {:?}", slot);
            return;
        }

        let status = completion.status;
        let class = classify(status);
        match class {
            StatusClass::Success => {
                debug!("CPort OUT request {:?} done", slot);
            }
            StatusClass::Fatal if status == UrbStatus::Cancelled => {
                debug!("CPort OUT request {:?} cancelled", slot);
            }
            _ => {
                warn!("CPort OUT request {:?} failed: {}", slot, status);
            }
        }

        self.stats.send_completed(class == StatusClass::Success);
        self.handler
            .data_sent(restore_buffer(completion.urb.buffer), status);
        self.release_out(slot);

        if class == StatusClass::Fatal && status != UrbStatus::Cancelled {
            self.raise_disconnect(status);
        }
    }

    fn release_out(&self, slot: OutSlot) {
        if self.pool.release(slot) == Released::Dropped {
            self.stats.request_freed();
        }
    }
}

/// Turn a request's storage back into the caller's buffer
fn restore_buffer(storage: Vec<u8>) -> MessageBuffer {
    MessageBuffer::from_storage(storage).unwrap_or_else(|e| {
        error!("Outbound request storage corrupted: {}", e);
        MessageBuffer::default()
    })
}
