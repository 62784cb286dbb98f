//! Status codes for navigation queries
//!
//! A status is a primary kind plus a set of diagnostic details. At an ABI
//! boundary it converts to and from the classic Detour bitmask.

use std::fmt;

use bitflags::bitflags;
use navi_common::{Error, Result};

/// Primary outcome of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Success,
    Failure,
    InProgress,
}

bitflags! {
    /// Diagnostic details that may accompany any kind
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusDetail: u32 {
        /// Input data is not recognized
        const WRONG_MAGIC = 1 << 0;
        /// Input data is in wrong version
        const WRONG_VERSION = 1 << 1;
        /// Operation ran out of memory
        const OUT_OF_MEMORY = 1 << 2;
        /// An input parameter was invalid
        const INVALID_PARAM = 1 << 3;
        /// Result buffer for the query was too small to store all results
        const BUFFER_TOO_SMALL = 1 << 4;
        /// Query ran out of nodes during search
        const OUT_OF_NODES = 1 << 5;
        /// Query did not reach the end location, returning best guess
        const PARTIAL_RESULT = 1 << 6;
        /// A tile has already been assigned to the given x,y coordinate
        const ALREADY_OCCUPIED = 1 << 7;
    }
}

/// Status of a query or mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    kind: StatusKind,
    detail: StatusDetail,
}

impl Status {
    /// Operation failed
    pub const FAILURE_BIT: u32 = 1u32 << 31;
    /// Operation succeeded
    pub const SUCCESS_BIT: u32 = 1u32 << 30;
    /// Operation still in progress
    pub const IN_PROGRESS_BIT: u32 = 1u32 << 29;
    /// Mask of the detail bits
    pub const DETAIL_MASK: u32 = 0x0ff_ffff;

    pub const fn success() -> Self {
        Self {
            kind: StatusKind::Success,
            detail: StatusDetail::empty(),
        }
    }

    pub const fn failure() -> Self {
        Self {
            kind: StatusKind::Failure,
            detail: StatusDetail::empty(),
        }
    }

    pub const fn in_progress() -> Self {
        Self {
            kind: StatusKind::InProgress,
            detail: StatusDetail::empty(),
        }
    }

    /// Returns this status with extra detail bits set
    pub fn with(mut self, detail: StatusDetail) -> Self {
        self.detail |= detail;
        self
    }

    /// Adds detail bits in place
    pub fn add(&mut self, detail: StatusDetail) {
        self.detail |= detail;
    }

    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    pub fn detail(&self) -> StatusDetail {
        self.detail
    }

    pub fn is_success(&self) -> bool {
        self.kind == StatusKind::Success
    }

    pub fn is_failure(&self) -> bool {
        self.kind == StatusKind::Failure
    }

    pub fn is_in_progress(&self) -> bool {
        self.kind == StatusKind::InProgress
    }

    /// Returns true if any of the given detail bits are set
    pub fn has(&self, detail: StatusDetail) -> bool {
        self.detail.intersects(detail)
    }

    /// Encodes the status as a Detour compatible bitmask
    pub fn to_bits(&self) -> u32 {
        let primary = match self.kind {
            StatusKind::Success => Self::SUCCESS_BIT,
            StatusKind::Failure => Self::FAILURE_BIT,
            StatusKind::InProgress => Self::IN_PROGRESS_BIT,
        };
        primary | (self.detail.bits() & Self::DETAIL_MASK)
    }

    /// Decodes a Detour compatible bitmask
    ///
    /// A mask carrying no primary bit, or several, decodes as a failure.
    pub fn from_bits(bits: u32) -> Self {
        let kind = match bits & (Self::FAILURE_BIT | Self::SUCCESS_BIT | Self::IN_PROGRESS_BIT) {
            Self::SUCCESS_BIT => StatusKind::Success,
            Self::IN_PROGRESS_BIT => StatusKind::InProgress,
            _ => StatusKind::Failure,
        };
        Self {
            kind,
            detail: StatusDetail::from_bits_truncate(bits & Self::DETAIL_MASK),
        }
    }

    /// Converts a failure into an error, passing other kinds through
    pub fn into_result(self) -> Result<Status> {
        if self.is_failure() {
            Err(Error::Detour(self.to_string()))
        } else {
            Ok(self)
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::success()
    }
}

impl From<Status> for u32 {
    fn from(status: Status) -> Self {
        status.to_bits()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StatusKind::Success => write!(f, "Success")?,
            StatusKind::Failure => write!(f, "Failure")?,
            StatusKind::InProgress => write!(f, "In Progress")?,
        }

        let names = [
            (StatusDetail::WRONG_MAGIC, "Wrong Magic"),
            (StatusDetail::WRONG_VERSION, "Wrong Version"),
            (StatusDetail::OUT_OF_MEMORY, "Out of Memory"),
            (StatusDetail::INVALID_PARAM, "Invalid Param"),
            (StatusDetail::BUFFER_TOO_SMALL, "Buffer Too Small"),
            (StatusDetail::OUT_OF_NODES, "Out of Nodes"),
            (StatusDetail::PARTIAL_RESULT, "Partial Result"),
            (StatusDetail::ALREADY_OCCUPIED, "Already Occupied"),
        ];
        let details: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.detail.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_bits() {
        assert_eq!(Status::success().to_bits(), 1 << 30);
        assert_eq!(Status::failure().to_bits(), 1 << 31);
        assert_eq!(Status::in_progress().to_bits(), 1 << 29);
    }

    #[test]
    fn test_detail_coexists_with_success() {
        let status = Status::success().with(StatusDetail::BUFFER_TOO_SMALL | StatusDetail::PARTIAL_RESULT);
        assert!(status.is_success());
        assert!(!status.is_failure());
        assert!(status.has(StatusDetail::BUFFER_TOO_SMALL));
        assert!(!status.has(StatusDetail::OUT_OF_NODES));
        assert_eq!(status.to_bits(), (1 << 30) | (1 << 4) | (1 << 6));
    }

    #[test]
    fn test_from_bits() {
        let bits = (1u32 << 31) | (1 << 3);
        let status = Status::from_bits(bits);
        assert!(status.is_failure());
        assert!(status.has(StatusDetail::INVALID_PARAM));
        assert_eq!(status.to_bits(), bits);

        // Ambiguous masks decode as failure.
        assert!(Status::from_bits(0).is_failure());
        assert!(Status::from_bits((1 << 31) | (1 << 30)).is_failure());
    }

    #[test]
    fn test_display_and_result() {
        let status = Status::failure().with(StatusDetail::OUT_OF_MEMORY);
        assert_eq!(status.to_string(), "Failure (Out of Memory)");
        assert!(status.into_result().is_err());
        assert!(Status::success().into_result().is_ok());
    }
}
