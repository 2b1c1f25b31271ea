//! Inbound CPort demultiplexing
//!
//! A small set of bulk-in requests is kept armed at all times. Each completed
//! request carries one `[cport][payload]` frame, which is handed upward
//! synchronously before the same request and buffer are resubmitted.

use super::{Bridge, StatusClass, classify};
use common::{Completion, SubmitError, TransferKind, Urb, UrbId, UrbStatus};
use protocol::{MAX_PAYLOAD, decode_frame};
use tracing::{debug, error, warn};

/// Receive buffer size for one CPort IN request
pub const CPORT_IN_BUFFER_SIZE: usize = MAX_PAYLOAD;

impl Bridge {
    /// Build the `index`th CPort IN request with a fresh buffer
    pub(super) fn cport_in_urb(&self, index: u8) -> Urb {
        Urb {
            id: UrbId::CportIn(index),
            endpoint: self.endpoints.cport_in,
            kind: TransferKind::Bulk,
            buffer: vec![0u8; CPORT_IN_BUFFER_SIZE],
            offset: 0,
        }
    }

    pub(super) fn complete_cport_in(&self, completion: Completion) {
        let status = completion.status;
        let class = classify(status);
        match class {
            StatusClass::Success => self.deliver_frame(completion.data()),
            StatusClass::Transient => {
                warn!("CPort IN request failed: {}", status);
                self.stats.transient_fault();
            }
            StatusClass::Unknown => {
                warn!("CPort IN request finished with {}, resubmitting", status);
                self.stats.transient_fault();
            }
            StatusClass::Fatal => {}
        }

        if class.resubmits() {
            self.resubmit(completion.urb);
        } else {
            self.stop_receive(completion.urb.id, status);
        }
    }

    fn deliver_frame(&self, frame: &[u8]) {
        match decode_frame(frame) {
            Ok((cport, payload)) => {
                self.stats.frame_received();
                self.handler.data_received(cport, payload);
            }
            Err(e) => {
                debug!("Dropping inbound frame on bridge {}: {}", self.id, e);
                self.stats.frame_dropped();
            }
        }
    }

    /// A receive request hit a fatal status; it is never resubmitted
    pub(super) fn stop_receive(&self, id: UrbId, status: UrbStatus) {
        if self.is_shutting_down() {
            debug!("Receive request {:?} stopped ({})", id, status);
        } else {
            error!("Receive request {:?} failed: {}", id, status);
        }
        self.retire_receive(id);
        self.raise_disconnect(status);
    }

    /// Hand a receive request back to the bus with its buffer intact
    pub(super) fn resubmit(&self, urb: Urb) {
        let id = urb.id;
        if self.is_shutting_down() {
            self.retire_receive(id);
            return;
        }

        if let Err(SubmitError { urb, error }) = self.bus.submit(urb) {
            error!("Can not resubmit receive request {:?}: {}", urb.id, error);
            self.retire_receive(urb.id);
            return;
        }

        // Teardown may have killed this request's previous incarnation
        // between the check above and the submit
        if self.is_shutting_down() {
            self.bus.kill(id);
        }
    }
}
