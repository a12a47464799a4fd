use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::RequestFailure;

/// Handle returned by [`crate::Channel::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rq#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

pub const SECTOR_SIZE: u64 = 512;

/// One read or write accepted from the block layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub direction: Direction,
    pub lba: u64,
    pub sectors: u32,
    pub(crate) id: RequestId,
    pub(crate) retries: u8,
    pub(crate) max_retries: u8,
    /// Handed to the command builder and not yet completed or requeued.
    pub(crate) dispatched: bool,
}

impl Request {
    pub fn new(direction: Direction, lba: u64, sectors: u32) -> Self {
        Self {
            direction,
            lba,
            sectors,
            id: RequestId(0),
            retries: 0,
            max_retries: 0,
            dispatched: false,
        }
    }

    pub fn read(lba: u64, sectors: u32) -> Self {
        Self::new(Direction::Read, lba, sectors)
    }

    pub fn write(lba: u64, sectors: u32) -> Self {
        Self::new(Direction::Write, lba, sectors)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    /// Saturates for LBAs past the end of the 64-bit byte range.
    pub fn byte_offset(&self) -> u64 {
        self.lba.saturating_mul(SECTOR_SIZE)
    }

    pub fn byte_len(&self) -> u64 {
        u64::from(self.sectors) * SECTOR_SIZE
    }
}

/// Terminal event of a request.
#[derive(Debug, Clone)]
pub struct Completion {
    pub request: RequestId,
    pub device: DeviceId,
    pub result: std::result::Result<(), RequestFailure>,
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Receives every request completion.
///
/// Completions are delivered after the channel lock has been released, so implementations may
/// call back into the channel (e.g. to submit the next request).
pub trait CompletionSink: Send + Sync {
    fn complete(&self, completion: Completion);
}

impl<F> CompletionSink for F
where
    F: Fn(Completion) + Send + Sync,
{
    fn complete(&self, completion: Completion) {
        self(completion)
    }
}
