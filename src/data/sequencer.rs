use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use log::warn;
use smallvec::SmallVec;

use crate::transport::TransportResponse;
use crate::{Error, Result};

/// A request handed to the transport and not yet applied
#[derive(Debug, Clone)]
pub struct InFlightRequest {
    pub request_index: u64,
    pub is_async: bool,
    pub async_ids: SmallVec<[u64; 4]>,
    /// Ids whose `dispose` notice travels with this request
    pub disposes: Vec<i64>,
    pub sent_at: Instant,
}

/// What to do with a response that just arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// It is next in sequence
    Apply,
    /// An earlier asynchronous request is still outstanding; hold it
    Buffer,
    /// A synchronous request overtook an earlier one; apply it now anyway
    OutOfBand,
    /// Late answer to a request whose waiter already gave up
    Stale,
}

/// Sequence window: assigns request indices and decides when each response
/// may be applied so that effects land in issue order.
#[derive(Debug)]
pub struct Sequencer {
    next_index: u64,
    expected_index: u64,
    in_flight: BTreeMap<u64, InFlightRequest>,
    buffered: BTreeMap<u64, TransportResponse>,
    applied_out_of_band: BTreeSet<u64>,
    abandoned: BTreeSet<u64>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Sequencer {
            next_index: 1,
            expected_index: 1,
            in_flight: BTreeMap::new(),
            buffered: BTreeMap::new(),
            applied_out_of_band: BTreeSet::new(),
            abandoned: BTreeSet::new(),
        }
    }

    pub fn expected_index(&self) -> u64 {
        self.expected_index
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Registers a request about to be sent and returns its index.
    pub fn begin(&mut self, is_async: bool, async_ids: SmallVec<[u64; 4]>, disposes: Vec<i64>) -> u64 {
        let request_index = self.next_index;
        self.next_index += 1;
        self.in_flight.insert(
            request_index,
            InFlightRequest {
                request_index,
                is_async,
                async_ids,
                disposes,
                sent_at: Instant::now(),
            },
        );
        request_index
    }

    pub fn place(&mut self, request_index: u64) -> Result<Placement> {
        if self.abandoned.remove(&request_index) {
            return Ok(Placement::Stale);
        }
        if request_index < self.expected_index || self.applied_out_of_band.contains(&request_index) {
            return Err(Error::Sequence {
                received: request_index,
                expected: self.expected_index,
            });
        }
        let request = self.in_flight.get(&request_index).ok_or_else(|| {
            Error::Protocol(format!("Response for request {} which was never sent", request_index))
        })?;
        if self.buffered.contains_key(&request_index) {
            return Err(Error::Protocol(format!("Duplicate response for request {}", request_index)));
        }
        if request_index == self.expected_index {
            Ok(Placement::Apply)
        } else if request.is_async {
            Ok(Placement::Buffer)
        } else {
            warn!(
                "Response to synchronous request {} overtook request {}; applying out of sequence",
                request_index, self.expected_index
            );
            Ok(Placement::OutOfBand)
        }
    }

    pub fn buffer(&mut self, response: TransportResponse, request_index: u64) {
        self.buffered.insert(request_index, response);
    }

    /// Marks `request_index` as applied and advances the window past it and
    /// past any requests already applied out of band.
    pub fn complete(&mut self, request_index: u64) -> Option<InFlightRequest> {
        let request = self.in_flight.remove(&request_index);
        if request_index == self.expected_index {
            self.expected_index += 1;
            while self.applied_out_of_band.remove(&self.expected_index) {
                self.expected_index += 1;
            }
        } else if request_index > self.expected_index {
            self.applied_out_of_band.insert(request_index);
        }
        request
    }

    /// The buffered response whose turn has come, if any
    pub fn next_ready(&mut self) -> Option<(u64, TransportResponse)> {
        let index = self.expected_index;
        self.buffered.remove(&index).map(|r| (index, r))
    }

    /// A late response for this index will be dropped instead of applied.
    pub fn abandon(&mut self, request_index: u64) {
        self.abandoned.insert(request_index);
    }

    pub fn is_in_flight(&self, request_index: u64) -> bool {
        self.in_flight.contains_key(&request_index)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Nothing in flight and nothing waiting in the buffer
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.buffered.is_empty()
    }
}
