//! Transfer status classification

use common::UrbStatus;

/// How a completion status should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// The request can be reused; receive paths resubmit
    Transient,
    /// The endpoint or device is unusable; receive paths stop
    Fatal,
    /// Unrecognised status, handled like `Transient`
    Unknown,
}

impl StatusClass {
    /// Whether a receive request completing with this class is resubmitted
    pub fn resubmits(self) -> bool {
        !matches!(self, StatusClass::Fatal)
    }
}

pub fn classify(status: UrbStatus) -> StatusClass {
    match status {
        UrbStatus::Completed => StatusClass::Success,
        UrbStatus::Overflow | UrbStatus::Proto | UrbStatus::IlSeq | UrbStatus::TimedOut => {
            StatusClass::Transient
        }
        UrbStatus::Cancelled
        | UrbStatus::ConnReset
        | UrbStatus::Shutdown
        | UrbStatus::NoDevice
        | UrbStatus::Stall => StatusClass::Fatal,
        UrbStatus::Other(_) => StatusClass::Unknown,
    }
}
