//! SVC link
//!
//! Inbound SVC messages arrive whole on the interrupt-in endpoint and are
//! resubmitted like CPort receives. Outbound messages go out synchronously as
//! a vendor request on the control endpoint.

use super::{Bridge, ControlError, StatusClass, classify};
use common::{Completion, ControlSetup, TransferKind, Urb, UrbId};
use protocol::SVC_MSG_SIZE;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Vendor request carrying an SVC message
pub const REQUEST_SVC: u8 = 0x01;

/// Host-to-device, vendor, interface recipient
pub const SVC_REQUEST_TYPE: u8 = 0x41;

/// Largest message a single control transfer can carry
pub const SVC_SEND_MAX: usize = u16::MAX as usize;

const SVC_SETUP: ControlSetup = ControlSetup {
    request_type: SVC_REQUEST_TYPE,
    request: REQUEST_SVC,
    value: 0,
    index: 0,
};

impl Bridge {
    pub(super) fn svc_in_urb(&self) -> Urb {
        Urb {
            id: UrbId::SvcIn,
            endpoint: self.endpoints.svc_in,
            kind: TransferKind::Interrupt {
                interval: self.endpoints.svc_interval,
            },
            buffer: vec![0u8; SVC_MSG_SIZE],
            offset: 0,
        }
    }

    pub(super) fn complete_svc_in(&self, completion: Completion) {
        let status = completion.status;
        let class = classify(status);
        match class {
            StatusClass::Success => {
                self.stats.svc_received();
                self.handler.svc_received(completion.data());
            }
            StatusClass::Transient | StatusClass::Unknown => {
                warn!("SVC IN request failed: {}", status);
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

    /// Send a message to the SVC, blocking for at most `timeout`
    pub fn send_svc(&self, message: &[u8], timeout: Duration) -> Result<(), ControlError> {
        if self.is_shutting_down() {
            return Err(ControlError::Shutdown);
        }
        if message.len() > SVC_SEND_MAX {
            return Err(ControlError::TooLarge {
                size: message.len(),
                max: SVC_SEND_MAX,
            });
        }

        let written = self
            .bus
            .control_out(SVC_SETUP, message, timeout)
            .inspect_err(|e| error!("Failed to send SVC message: {}", e))?;

        if written != message.len() {
            error!(
                "Short SVC write on bridge {}: {} of {} bytes",
                self.id,
                written,
                message.len()
            );
            return Err(ControlError::ShortWrite {
                written,
                expected: message.len(),
            });
        }

        debug!("Sent {} byte SVC message", written);
        Ok(())
    }

    /// [`send_svc`](Bridge::send_svc) with the configured SVC timeout
    pub fn send_svc_default(&self, message: &[u8]) -> Result<(), ControlError> {
        self.send_svc(message, self.settings.svc_timeout)
    }
}
