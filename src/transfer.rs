// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Single-packet transfer engine for the non-control endpoints.
//!
//! Each endpoint carries at most one transfer at a time; a request against
//! a busy endpoint is refused without touching the in-flight transfer.
//! Completion is signalled both through the `Client` callback and through
//! the `*_result` polls, whichever the stack prefers.

use log::trace;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use vcell::VolatileCell;

use crate::controller::Usbdc;
use crate::endpoint::{Endpoint, EndpointState};
use crate::hil::{Direction, EndpointAddress, TransferStatus};
use crate::registers::{EndpointBuffer, EndpointControl, EndpointCount};

/// Logical address of the endpoint behind physical slot `phy`.
pub(crate) fn address_of(phy: usize) -> EndpointAddress {
    let dir = if phy & 1 != 0 {
        Direction::In
    } else {
        Direction::Out
    };
    EndpointAddress::new((phy >> 1) as u8, dir)
}

impl<'a> Usbdc<'a> {
    /// Look up a configured data endpoint, checking index and direction.
    fn data_endpoint(
        &self,
        ep: EndpointAddress,
        direction: Direction,
    ) -> Option<(usize, &Endpoint<'a>)> {
        if ep.number() == 0 || ep.number() > 7 || ep.direction() != direction {
            return None;
        }
        let phy = ep.phy_index();
        let endpoint = &self.endpoints[phy];
        if !endpoint.configured.get() {
            return None;
        }
        Some((phy, endpoint))
    }

    pub(crate) fn data_endpoint_read(
        &self,
        ep: EndpointAddress,
        buffer: &'a [VolatileCell<u8>],
        max_size: usize,
    ) -> TransferStatus {
        let regs = &*self.registers;

        let Some((phy, endpoint)) = self.data_endpoint(ep, Direction::Out) else {
            return TransferStatus::Invalid;
        };
        if endpoint.state.get() != EndpointState::Idle {
            return TransferStatus::Invalid;
        }

        endpoint.read_buf.set(Some(buffer));
        endpoint.read_max.set(max_size.min(buffer.len()));
        endpoint.result.set(None);
        endpoint.state.set(EndpointState::Reading);

        regs.epctrl[phy].modify(EndpointControl::READY::SET);
        TransferStatus::Pending
    }

    pub(crate) fn data_endpoint_read_result(&self, ep: EndpointAddress) -> TransferStatus {
        let Some((_, endpoint)) = self.data_endpoint(ep, Direction::Out) else {
            return TransferStatus::Invalid;
        };
        match endpoint.result.take() {
            Some(n) => TransferStatus::Complete(n),
            None if endpoint.state.get() == EndpointState::Reading => TransferStatus::Pending,
            None => TransferStatus::Invalid,
        }
    }

    pub(crate) fn data_endpoint_write(
        &self,
        ep: EndpointAddress,
        buffer: &[VolatileCell<u8>],
        len: usize,
    ) -> TransferStatus {
        let regs = &*self.registers;

        let Some((phy, endpoint)) = self.data_endpoint(ep, Direction::In) else {
            return TransferStatus::Invalid;
        };
        if endpoint.state.get() != EndpointState::Idle {
            return TransferStatus::Invalid;
        }

        let max_packet = endpoint.max_packet.get();
        if len > max_packet || len > buffer.len() {
            return TransferStatus::Invalid;
        }

        let offset = regs.epbuf[phy].read(EndpointBuffer::OFFSET) as usize;
        regs.fifo_write_cells(offset, buffer, len);
        regs.epcount[phy].write(EndpointCount::COUNT.val(len as u32));

        // The short-packet flag must be in place before the transfer is
        // armed, or the host treats the packet as a truncated long one.
        if len < max_packet {
            regs.epctrl[phy].modify(EndpointControl::SHORT::SET);
        } else {
            regs.epctrl[phy].modify(EndpointControl::SHORT::CLEAR);
        }

        endpoint.result.set(None);
        endpoint.state.set(EndpointState::Writing);
        regs.epctrl[phy].modify(EndpointControl::READY::SET);
        TransferStatus::Pending
    }

    pub(crate) fn data_endpoint_write_result(&self, ep: EndpointAddress) -> TransferStatus {
        let Some((_, endpoint)) = self.data_endpoint(ep, Direction::In) else {
            return TransferStatus::Invalid;
        };
        match endpoint.result.take() {
            Some(n) => TransferStatus::Complete(n),
            None if endpoint.state.get() == EndpointState::Writing => TransferStatus::Pending,
            None => TransferStatus::Invalid,
        }
    }

    /// An OUT packet landed in a data endpoint's buffer region.
    pub(crate) fn handle_out_complete(&self, phy: usize) {
        let regs = &*self.registers;
        let endpoint = &self.endpoints[phy];

        if endpoint.state.get() != EndpointState::Reading {
            // The packet arrived with no read posted; hardware keeps the
            // endpoint NAKing until one is, so this is a stale event.
            trace!("ep{} OUT with no read in flight", phy);
            return;
        }

        let count = regs.epcount[phy].read(EndpointCount::COUNT) as usize;
        let offset = regs.epbuf[phy].read(EndpointBuffer::OFFSET) as usize;
        let n = count.min(endpoint.read_max.get());

        if let Some(buffer) = endpoint.read_buf.take() {
            regs.fifo_read_cells(offset, buffer, n);
        }
        endpoint.read_max.set(0);
        endpoint.result.set(Some(n));
        endpoint.state.set(EndpointState::Idle);

        self.map_client(|c| c.out_complete(address_of(phy)));
    }

    /// The host collected an IN packet from a data endpoint.
    pub(crate) fn handle_in_complete(&self, phy: usize) {
        let regs = &*self.registers;
        let endpoint = &self.endpoints[phy];

        if endpoint.state.get() != EndpointState::Writing {
            trace!("ep{} IN with no write in flight", phy);
            return;
        }

        let count = regs.epcount[phy].read(EndpointCount::COUNT) as usize;
        endpoint.result.set(Some(count));
        endpoint.state.set(EndpointState::Idle);

        self.map_client(|c| c.in_complete(address_of(phy)));
    }

    pub(crate) fn data_endpoint_stall(&self, ep: EndpointAddress) {
        let regs = &*self.registers;
        let Some((phy, endpoint)) = self.data_endpoint(ep, ep.direction()) else {
            return;
        };
        regs.epctrl[phy].modify(EndpointControl::STALL::SET);
        endpoint.reset_transfer();
        endpoint.state.set(EndpointState::Stalled);
    }

    pub(crate) fn data_endpoint_unstall(&self, ep: EndpointAddress) {
        let regs = &*self.registers;
        let Some((phy, endpoint)) = self.data_endpoint(ep, ep.direction()) else {
            return;
        };
        // RSTDT returns the data toggle to DATA0, as CLEAR_FEATURE(HALT)
        // requires even when the halt bit was never set.
        regs.epctrl[phy]
            .modify(EndpointControl::STALL::CLEAR + EndpointControl::RSTDT::SET);
        if endpoint.state.get() == EndpointState::Stalled {
            endpoint.state.set(EndpointState::Idle);
        }
    }

    pub(crate) fn data_endpoint_stalled(&self, ep: EndpointAddress) -> bool {
        let regs = &*self.registers;
        match self.data_endpoint(ep, ep.direction()) {
            Some((phy, _)) => regs.epctrl[phy].is_set(EndpointControl::STALL),
            None => false,
        }
    }

    /// Cancel whatever is in flight on `ep`. Safe to call repeatedly and on
    /// an idle endpoint.
    pub(crate) fn data_endpoint_abort(&self, ep: EndpointAddress) {
        let regs = &*self.registers;
        let Some((phy, endpoint)) = self.data_endpoint(ep, ep.direction()) else {
            return;
        };

        // Quiesce the slot before touching its state so a completion that
        // races with the abort cannot be half-observed.
        self.inten_enable_guard(phy, |_| {
            regs.epctrl[phy]
                .modify(EndpointControl::READY::CLEAR + EndpointControl::SHORT::CLEAR);
            regs.epev[phy].set(0);
            regs.epcount[phy].set(0);
            endpoint.reset_transfer();
        });
    }

    /// Run `f` with the endpoint's interrupt source masked, restoring the
    /// previous enable state afterwards.
    fn inten_enable_guard<F: FnOnce(&Self)>(&self, phy: usize, f: F) {
        let regs = &*self.registers;
        let was_enabled =
            regs.inten.get() & crate::controller::ep_summary_bit(phy) != 0;
        self.inten_disable_endpoint(phy);
        f(self);
        if was_enabled {
            self.inten_enable_endpoint(phy);
        }
    }
}
