//! Collaborators the engine drives but does not own.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::{error::RelayError, protocol::Datagram, zone::ActuationState};

/// Output stage wiring for the relay bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelayVariant {
    /// GPIO drives the relay coil input directly, high means heating.
    #[default]
    Direct,
    /// 5V board behind an open-drain output, pulled low means heating.
    OpenDrain,
}

impl RelayVariant {
    /// Logic level that produces `state` on the output.
    pub fn level(self, state: ActuationState) -> bool {
        match self {
            Self::Direct => state.is_on(),
            Self::OpenDrain => !state.is_on(),
        }
    }
}

pub trait RelayDriver: Send + Sync {
    fn variant(&self) -> RelayVariant;
    fn set(&self, relay: u8, state: ActuationState) -> Result<(), RelayError>;
}

pub trait DisplayNotifier: Send + Sync {
    fn request_refresh(&self);
}

/// Outbound push of snapshots to the controller. Never blocks.
pub trait ReportSink: Send + Sync {
    fn push(&self, datagram: Datagram);
}

/// Refresh request latched until the display consumes it.
#[derive(Debug, Default)]
pub struct RefreshFlag(AtomicBool);

impl RefreshFlag {
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl DisplayNotifier for RefreshFlag {
    fn request_refresh(&self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct NoReports;

impl ReportSink for NoReports {
    fn push(&self, _datagram: Datagram) {}
}
