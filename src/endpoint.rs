// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Endpoint table: per-endpoint transfer state and the packet-buffer
//! allocator.

use core::cell::Cell;
use vcell::VolatileCell;

use crate::hil::TransferType;
use crate::registers::{CTRL_BUF_RESERVED, PKT_BUF_SIZE};

/// Software-visible state of one physical endpoint slot.
///
/// At most one transfer (read xor write) is in flight per endpoint; the
/// engine has exactly one transfer slot, not a queue.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EndpointState {
    Idle,
    Reading,
    Writing,
    Stalled,
}

/// One entry of the endpoint table.
///
/// The buffer slice is externally owned; the engine holds it only from
/// `endpoint_read` until completion or abort and never copies it out of
/// interrupt context.
pub(crate) struct Endpoint<'a> {
    pub state: Cell<EndpointState>,
    pub transfer_type: Cell<TransferType>,
    pub max_packet: Cell<usize>,
    pub configured: Cell<bool>,
    /// Destination for an in-flight read.
    pub read_buf: Cell<Option<&'a [VolatileCell<u8>]>>,
    /// Caller's cap on the in-flight read.
    pub read_max: Cell<usize>,
    /// Byte count of a completed transfer, until polled via `*_result`.
    pub result: Cell<Option<usize>>,
}

impl<'a> Endpoint<'a> {
    pub const fn new() -> Self {
        Endpoint {
            state: Cell::new(EndpointState::Idle),
            transfer_type: Cell::new(TransferType::Bulk),
            max_packet: Cell::new(0),
            configured: Cell::new(false),
            read_buf: Cell::new(None),
            read_max: Cell::new(0),
            result: Cell::new(None),
        }
    }

    /// Drop all transfer state, keeping the configuration.
    pub fn reset_transfer(&self) {
        self.state.set(EndpointState::Idle);
        self.read_buf.set(None);
        self.read_max.set(0);
        self.result.set(None);
    }

    /// Return the slot to unused.
    pub fn deconfigure(&self) {
        self.reset_transfer();
        self.configured.set(false);
        self.max_packet.set(0);
    }
}

/// High-water-mark allocator for the controller's internal packet buffer.
///
/// Regions are handed out contiguously and never compacted; `remove`
/// leaves a hole (fragmentation is accepted). `reset` rewinds the mark to
/// just past EP0's fixed allocation, freeing everything configured by
/// SET_CONFIGURATION in one step.
pub(crate) struct BufferAllocator {
    top: Cell<usize>,
}

impl BufferAllocator {
    pub const fn new() -> Self {
        BufferAllocator {
            top: Cell::new(CTRL_BUF_RESERVED),
        }
    }

    /// Reserve `size` bytes, returning the region's offset, or `None` when
    /// the buffer is exhausted.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        let offset = self.top.get();
        if size == 0 || size > PKT_BUF_SIZE - offset {
            return None;
        }
        self.top.set(offset + size);
        Some(offset)
    }

    pub fn reset(&self) {
        self.top.set(CTRL_BUF_RESERVED);
    }

    #[cfg(test)]
    fn high_water(&self) -> usize {
        self.top.get()
    }
}
