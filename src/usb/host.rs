//! Host side of the mass-storage link.

use super::UsbError;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::collections::VecDeque;

/// A sector-level request issued by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    /// Read `count` sectors starting at `lba`.
    Read { lba: u64, count: u32 },
    /// Write whole sectors starting at `lba`.
    Write { lba: u64, data: Vec<u8> },
}

impl HostRequest {
    pub fn lba(&self) -> u64 {
        match self {
            HostRequest::Read { lba, .. } | HostRequest::Write { lba, .. } => *lba,
        }
    }
}

/// Completion returned to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostResponse {
    Data { lba: u64, data: Vec<u8> },
    Written { lba: u64, count: u32 },
}

/// Source of host requests and sink for their completions.
///
/// Stands in for the USB mass-storage class driver: `poll` yields the
/// next decoded command, `complete` answers it.
pub trait HostPort: Send {
    /// Returns the next pending request, if any.
    fn poll(&mut self) -> Option<HostRequest>;

    /// Delivers the result of the request most recently polled.
    fn complete(&mut self, result: Result<HostResponse, UsbError>);

    /// Called once when the volume is exported.
    fn attach(&mut self, _sector_size: u64, _sector_count: u64) {}
}

/// Host that replays a fixed list of requests and records completions.
#[derive(Debug, Default)]
pub struct ScriptedHost {
    requests: VecDeque<HostRequest>,
    completions: Vec<Result<HostResponse, UsbError>>,
    volume: Option<(u64, u64)>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a request.
    pub fn push(&mut self, request: HostRequest) {
        self.requests.push_back(request);
    }

    /// Completions received so far, in order.
    pub fn completions(&self) -> &[Result<HostResponse, UsbError>] {
        &self.completions
    }

    /// Sector size and count announced at export.
    pub fn volume(&self) -> Option<(u64, u64)> {
        self.volume
    }
}

impl HostPort for ScriptedHost {
    fn poll(&mut self) -> Option<HostRequest> {
        self.requests.pop_front()
    }

    fn complete(&mut self, result: Result<HostResponse, UsbError>) {
        self.completions.push(result);
    }

    fn attach(&mut self, sector_size: u64, sector_count: u64) {
        self.volume = Some((sector_size, sector_count));
    }
}

/// Host that browses the volume at random.
///
/// Issues multi-sector reads only, unless a write ratio is set. Write-backs
/// replay the sector read last, so they overwrite anything the filesystem
/// stored there since; only enable them on a volume nothing else writes.
pub struct SimulatedHost {
    rng: ChaCha8Rng,
    activity: f64,
    write_ratio: f64,
    max_burst: u32,
    sector_count: u64,
    sector_size: u64,
    last_read: Option<(u64, Vec<u8>)>,
    served: u64,
    failed: u64,
}

impl SimulatedHost {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            activity: 0.25,
            write_ratio: 0.0,
            max_burst: 8,
            sector_count: 0,
            sector_size: 0,
            last_read: None,
            served: 0,
            failed: 0,
        }
    }

    /// Probability that a poll yields a request.
    pub fn with_activity(mut self, activity: f64) -> Self {
        self.activity = activity.clamp(0.0, 1.0);
        self
    }

    /// Probability that a request is a write-back of the last read sector.
    pub fn with_write_ratio(mut self, ratio: f64) -> Self {
        self.write_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Requests that completed successfully.
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Requests that completed with an error.
    pub fn failed(&self) -> u64 {
        self.failed
    }

    fn chance(&mut self, p: f64) -> bool {
        (self.rng.next_u32() as f64) < p * (u32::MAX as f64)
    }
}

impl HostPort for SimulatedHost {
    fn poll(&mut self) -> Option<HostRequest> {
        if self.sector_count == 0 || !self.chance(self.activity) {
            return None;
        }

        if self.chance(self.write_ratio) {
            if let Some((lba, sector)) = self.last_read.take() {
                return Some(HostRequest::Write { lba, data: sector });
            }
        }

        let lba = self.rng.next_u64() % self.sector_count;
        let room = (self.sector_count - lba).min(u64::from(self.max_burst)) as u32;
        let count = 1 + self.rng.next_u32() % room;
        Some(HostRequest::Read { lba, count })
    }

    fn complete(&mut self, result: Result<HostResponse, UsbError>) {
        match result {
            Ok(HostResponse::Data { lba, mut data }) => {
                data.truncate(self.sector_size as usize);
                self.last_read = Some((lba, data));
                self.served += 1;
            }
            Ok(HostResponse::Written { .. }) => self.served += 1,
            Err(error) => {
                tracing::debug!(%error, "Simulated host request failed");
                self.failed += 1;
            }
        }
    }

    fn attach(&mut self, sector_size: u64, sector_count: u64) {
        self.sector_size = sector_size;
        self.sector_count = sector_count;
    }
}
