//! Callbacks from the transport into the upper protocol layer

use crate::usb_types::UrbStatus;
use protocol::{CportId, MessageBuffer};

/// Receives everything a bridge delivers upward
///
/// All methods run in the completion dispatch context: they must return
/// quickly and must not block. Anything slow should be queued elsewhere.
pub trait BridgeHandler: Send + Sync {
    /// A frame arrived on `cport`; `payload` excludes the CPort byte
    fn data_received(&self, cport: CportId, payload: &[u8]);

    /// A whole SVC message arrived on the control link
    fn svc_received(&self, message: &[u8]);

    /// A send finished (or failed, or was cancelled); the buffer is returned
    fn data_sent(&self, buffer: MessageBuffer, status: UrbStatus);
}
