//! Completion status classification
//!
//! Folds the three status bytes the sg driver hands back (SCSI status, host
//! status, driver status) plus any sense data into a single
//! [`SenseCategory`], then maps that category onto the copy engine's
//! [`Disposition`]: proceed, retry or abort.
//!
//! Category codes double as process exit statuses and follow the
//! sg3_utils numbering so scripts written against the C tools keep working.

use std::fmt;

/// SCSI status byte values
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const COMMAND_TERMINATED: u8 = 0x22;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Sense keys
pub mod key {
    pub const NO_SENSE: u8 = 0x0;
    pub const RECOVERED_ERROR: u8 = 0x1;
    pub const NOT_READY: u8 = 0x2;
    pub const MEDIUM_ERROR: u8 = 0x3;
    pub const HARDWARE_ERROR: u8 = 0x4;
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    pub const UNIT_ATTENTION: u8 = 0x6;
    pub const DATA_PROTECT: u8 = 0x7;
    pub const BLANK_CHECK: u8 = 0x8;
    pub const COPY_ABORTED: u8 = 0xa;
    pub const ABORTED_COMMAND: u8 = 0xb;
    pub const MISCOMPARE: u8 = 0xe;
    pub const COMPLETED: u8 = 0xf;
}

// Linux host byte values that mean the command never reached the target
const DID_NO_CONNECT: u16 = 0x01;
const DID_BUS_BUSY: u16 = 0x02;
const DID_TIME_OUT: u16 = 0x03;
const DID_NEXUS_FAILURE: u16 = 0x11;

const DRIVER_SENSE: u16 = 0x08;
const DRIVER_TIMEOUT: u16 = 0x06;
const DRIVER_MASK: u16 = 0x0f;

/// Classification of a completed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenseCategory {
    Clean,
    NotReady,
    MediumHard,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    InvalidOpcode,
    CopyAborted,
    AbortedCommand,
    Miscompare,
    NoSense,
    Recovered,
    ReservationConflict,
    ConditionMet,
    Busy,
    TaskSetFull,
    AcaActive,
    TaskAborted,
    Timeout,
    Protection,
    /// Check condition with sense data we couldn't interpret
    UnknownSense,
    Other,
}

impl SenseCategory {
    /// Numeric code, also used as the process exit status
    pub fn code(self) -> i32 {
        match self {
            SenseCategory::Clean => 0,
            SenseCategory::NotReady => 2,
            SenseCategory::MediumHard => 3,
            SenseCategory::IllegalRequest => 5,
            SenseCategory::UnitAttention => 6,
            SenseCategory::DataProtect => 7,
            SenseCategory::InvalidOpcode => 9,
            SenseCategory::CopyAborted => 10,
            SenseCategory::AbortedCommand => 11,
            SenseCategory::Miscompare => 14,
            SenseCategory::NoSense => 20,
            SenseCategory::Recovered => 21,
            SenseCategory::ReservationConflict => 24,
            SenseCategory::ConditionMet => 25,
            SenseCategory::Busy => 26,
            SenseCategory::TaskSetFull => 27,
            SenseCategory::AcaActive => 28,
            SenseCategory::TaskAborted => 29,
            SenseCategory::Timeout => 33,
            SenseCategory::Protection => 40,
            SenseCategory::UnknownSense => 98,
            SenseCategory::Other => 99,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            SenseCategory::Clean => "no errors",
            SenseCategory::NotReady => "not ready",
            SenseCategory::MediumHard => "medium or hardware error",
            SenseCategory::IllegalRequest => "illegal request",
            SenseCategory::UnitAttention => "unit attention",
            SenseCategory::DataProtect => "data protect",
            SenseCategory::InvalidOpcode => "invalid opcode",
            SenseCategory::CopyAborted => "copy aborted",
            SenseCategory::AbortedCommand => "aborted command",
            SenseCategory::Miscompare => "miscompare",
            SenseCategory::NoSense => "no sense",
            SenseCategory::Recovered => "recovered error",
            SenseCategory::ReservationConflict => "reservation conflict",
            SenseCategory::ConditionMet => "condition met",
            SenseCategory::Busy => "busy",
            SenseCategory::TaskSetFull => "task set full",
            SenseCategory::AcaActive => "ACA active",
            SenseCategory::TaskAborted => "task aborted",
            SenseCategory::Timeout => "timeout",
            SenseCategory::Protection => "protection information error",
            SenseCategory::UnknownSense => "unrecognised sense data",
            SenseCategory::Other => "other error",
        }
    }
}

impl fmt::Display for SenseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.describe(), self.code())
    }
}

/// The interesting fields of fixed or descriptor format sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub response_code: u8,
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    /// Normalise raw sense bytes; `None` when the format isn't recognised
    pub fn parse(sb: &[u8]) -> Option<Self> {
        let first = *sb.first()?;
        let response_code = first & 0x7f;
        match response_code {
            0x70 | 0x71 => Some(Self {
                response_code,
                key: sb.get(2).map_or(0, |b| b & 0xf),
                asc: sb.get(12).copied().unwrap_or(0),
                ascq: sb.get(13).copied().unwrap_or(0),
            }),
            0x72 | 0x73 => Some(Self {
                response_code,
                key: sb.get(1).map_or(0, |b| b & 0xf),
                asc: sb.get(2).copied().unwrap_or(0),
                ascq: sb.get(3).copied().unwrap_or(0),
            }),
            _ => None,
        }
    }

    /// Build fixed format sense bytes for a key and additional sense code
    pub fn fixed(key: u8, asc: u8, ascq: u8) -> [u8; 18] {
        let mut sb = [0u8; 18];
        sb[0] = 0x70;
        sb[2] = key & 0xf;
        sb[7] = 10;
        sb[12] = asc;
        sb[13] = ascq;
        sb
    }
}

/// Classify a completion
pub fn categorize(device_status: u8, host_status: u16, driver_status: u16, sense: &[u8]) -> SenseCategory {
    let scsi_status = device_status & 0x7e;
    let driver = driver_status & DRIVER_MASK;
    if scsi_status == status::GOOD && host_status == 0 && driver == 0 {
        return SenseCategory::Clean;
    }

    if scsi_status == status::CHECK_CONDITION
        || scsi_status == status::COMMAND_TERMINATED
        || driver == DRIVER_SENSE
    {
        return match SenseData::parse(sense) {
            Some(sd) => categorize_sense(&sd),
            None => SenseCategory::UnknownSense,
        };
    }

    if scsi_status != status::GOOD {
        return match scsi_status {
            status::RESERVATION_CONFLICT => SenseCategory::ReservationConflict,
            status::CONDITION_MET => SenseCategory::ConditionMet,
            status::BUSY => SenseCategory::Busy,
            status::TASK_SET_FULL => SenseCategory::TaskSetFull,
            status::ACA_ACTIVE => SenseCategory::AcaActive,
            status::TASK_ABORTED => SenseCategory::TaskAborted,
            _ => SenseCategory::Other,
        };
    }

    match host_status {
        DID_NO_CONNECT | DID_BUS_BUSY | DID_TIME_OUT => return SenseCategory::Timeout,
        DID_NEXUS_FAILURE => return SenseCategory::ReservationConflict,
        _ => {}
    }
    if driver == DRIVER_TIMEOUT {
        return SenseCategory::Timeout;
    }
    SenseCategory::Other
}

fn categorize_sense(sd: &SenseData) -> SenseCategory {
    match sd.key {
        key::NO_SENSE | key::COMPLETED => SenseCategory::NoSense,
        key::RECOVERED_ERROR => SenseCategory::Recovered,
        key::NOT_READY => SenseCategory::NotReady,
        key::MEDIUM_ERROR | key::HARDWARE_ERROR | key::BLANK_CHECK => SenseCategory::MediumHard,
        key::UNIT_ATTENTION => SenseCategory::UnitAttention,
        key::DATA_PROTECT => SenseCategory::DataProtect,
        key::ILLEGAL_REQUEST => {
            if sd.asc == 0x20 && sd.ascq == 0 {
                SenseCategory::InvalidOpcode
            } else {
                SenseCategory::IllegalRequest
            }
        }
        key::COPY_ABORTED => SenseCategory::CopyAborted,
        key::ABORTED_COMMAND => {
            if sd.asc == 0x10 {
                SenseCategory::Protection
            } else {
                SenseCategory::AbortedCommand
            }
        }
        key::MISCOMPARE => SenseCategory::Miscompare,
        _ => SenseCategory::UnknownSense,
    }
}

/// What the engine does with a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Data moved, carry on
    Proceed,
    /// Data moved but the device reported a recovered error
    ProceedWithWarning,
    /// Transient; resubmit the identical command
    Retry,
    /// Medium or hardware error; continue-on-error decides
    MediumHard,
    /// Anything else stops the copy
    Fatal(SenseCategory),
}

impl From<SenseCategory> for Disposition {
    fn from(cat: SenseCategory) -> Self {
        match cat {
            SenseCategory::Clean => Disposition::Proceed,
            SenseCategory::Recovered => Disposition::ProceedWithWarning,
            SenseCategory::AbortedCommand | SenseCategory::UnitAttention => Disposition::Retry,
            SenseCategory::MediumHard => Disposition::MediumHard,
            other => Disposition::Fatal(other),
        }
    }
}
