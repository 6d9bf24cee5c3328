//! Cellular connection states.  Every wait carries its own deadline.

use std::fmt;
use std::time::Instant;

use super::scan::CarrierRecord;

/// Steps of the modem bring-up in `Connecting`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectStep {
    /// Index into the handshake command list.
    Handshake(usize),
    /// Manual re-selection of the preferred carrier.
    Select,
    /// Registration polling; next `+CREG?` no sooner than `next_poll`.
    Register { next_poll: Instant },
}

/// Periodic queries while online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineQuery {
    Operator,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanConnectPhase {
    Select,
    WaitIp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellularState {
    Init,
    Connecting {
        step:     ConnectStep,
        deadline: Instant,
    },
    SetupOperator,
    Online {
        next_check: Instant,
        query:      Option<OnlineQuery>,
    },
    Disconnected {
        retry_at: Instant,
        /// Deregister from the network before retrying.
        detach:   bool,
    },
    ScanStopPpp {
        issue_at: Instant,
    },
    ScanWaitSupervisorDown,
    ScanVerifyStopped {
        deadline: Instant,
        attempt:  u32,
    },
    ScanGetOperators,
    ScanTestCarrier {
        carriers: Vec<CarrierRecord>,
        index:    usize,
    },
    ScanWaitSignal {
        carriers: Vec<CarrierRecord>,
        index:    usize,
        until:    Instant,
    },
    ScanSelectBest {
        carriers: Vec<CarrierRecord>,
    },
    ScanConnect {
        carrier:  CarrierRecord,
        phase:    ScanConnectPhase,
        deadline: Instant,
    },
    ScanComplete {
        carrier: CarrierRecord,
    },
    ScanFailed {
        reason: String,
    },
    HardwareReset {
        attempt: u32,
    },
    WaitModemBoot {
        deadline:    Instant,
        attempt:     u32,
        seen_absent: bool,
    },
}

impl CellularState {
    pub fn name(&self) -> &'static str {
        match self {
            CellularState::Init                   => "Init",
            CellularState::Connecting { .. }      => "Connecting",
            CellularState::SetupOperator          => "SetupOperator",
            CellularState::Online { .. }          => "Online",
            CellularState::Disconnected { .. }    => "Disconnected",
            CellularState::ScanStopPpp { .. }     => "ScanStopPPP",
            CellularState::ScanWaitSupervisorDown => "ScanWaitSupervisorDown",
            CellularState::ScanVerifyStopped { .. } => "ScanVerifyStopped",
            CellularState::ScanGetOperators       => "ScanGetOperators",
            CellularState::ScanTestCarrier { .. } => "ScanTestCarrier",
            CellularState::ScanWaitSignal { .. }  => "ScanWaitSignal",
            CellularState::ScanSelectBest { .. }  => "ScanSelectBest",
            CellularState::ScanConnect { .. }     => "ScanConnect",
            CellularState::ScanComplete { .. }    => "ScanComplete",
            CellularState::ScanFailed { .. }      => "ScanFailed",
            CellularState::HardwareReset { .. }   => "HardwareReset",
            CellularState::WaitModemBoot { .. }   => "WaitModemBoot",
        }
    }

    pub fn is_scan(&self) -> bool {
        matches!(
            self,
            CellularState::ScanStopPpp { .. }
                | CellularState::ScanWaitSupervisorDown
                | CellularState::ScanVerifyStopped { .. }
                | CellularState::ScanGetOperators
                | CellularState::ScanTestCarrier { .. }
                | CellularState::ScanWaitSignal { .. }
                | CellularState::ScanSelectBest { .. }
                | CellularState::ScanConnect { .. }
                | CellularState::ScanComplete { .. }
                | CellularState::ScanFailed { .. }
        )
    }

    pub fn is_recovery(&self) -> bool {
        matches!(self, CellularState::HardwareReset { .. } | CellularState::WaitModemBoot { .. })
    }
}

impl fmt::Display for CellularState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellularState::ScanTestCarrier { index, .. } | CellularState::ScanWaitSignal { index, .. } => {
                write!(f, "{}({index})", self.name())
            }
            CellularState::HardwareReset { attempt } | CellularState::WaitModemBoot { attempt, .. } => {
                write!(f, "{}#{attempt}", self.name())
            }
            _ => f.write_str(self.name()),
        }
    }
}
