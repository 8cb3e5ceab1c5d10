// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Control-transfer state machine for endpoint 0.
//!
//! EP0 is driven through Setup -> (optional Data) -> Status. A new SETUP
//! always wins: the controller hardware aborts whatever transaction was in
//! flight and the software must follow it, never resist it. The engine
//! arms Status stages itself; the device stack only supplies or consumes
//! data-stage packets via `ep0_write`/`ep0_read`.

use core::cell::Cell;

use log::{debug, trace};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use crate::controller::Usbdc;
use crate::debug::HexBuf;
use crate::hil::ErrorCode;
use crate::protocol::{SetupData, TransferDirection};
use crate::registers::{
    Address, EndpointBuffer, EndpointControl, EndpointCount, CTRL_IN_OFFSET, CTRL_MAX_PACKET,
    CTRL_OUT_OFFSET,
};

/// Physical slot of EP0OUT.
pub(crate) const CTRL_OUT_PHY: usize = 0;

/// Physical slot of EP0IN.
pub(crate) const CTRL_IN_PHY: usize = 1;

/// Stage of the control transfer currently in progress.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum CtrlState {
    Idle,
    SetupReceived,
    DataIn,
    DataOut,
    StatusIn,
    StatusOut,
}

/// Bookkeeping for the single control endpoint.
pub(crate) struct ControlContext {
    pub state: Cell<CtrlState>,
    /// The last-received 8-byte SETUP packet, byte-exact from the wire.
    pub setup: Cell<[u8; 8]>,
    /// Address latched by SET_ADDRESS, written to hardware only once the
    /// Status stage has been acknowledged.
    pub pending_address: Cell<Option<u8>>,
    /// Data-stage bytes sent so far (IN transfers).
    sent: Cell<usize>,
    /// Data-stage bytes received so far (OUT transfers).
    received: Cell<usize>,
    /// Size of the OUT packet sitting in EP0's buffer, if any.
    last_out: Cell<usize>,
}

impl ControlContext {
    pub const fn new() -> Self {
        ControlContext {
            state: Cell::new(CtrlState::Idle),
            setup: Cell::new([0; 8]),
            pending_address: Cell::new(None),
            sent: Cell::new(0),
            received: Cell::new(0),
            last_out: Cell::new(0),
        }
    }

    /// Forced return to Idle (bus reset, disconnect). Discards everything,
    /// including a latched address.
    pub fn reset(&self) {
        self.state.set(CtrlState::Idle);
        self.pending_address.set(None);
        self.sent.set(0);
        self.received.set(0);
        self.last_out.set(0);
    }

    fn begin_transfer(&self) {
        self.sent.set(0);
        self.received.set(0);
        self.last_out.set(0);
    }

    fn current_setup(&self) -> Option<SetupData> {
        let raw = self.setup.get();
        SetupData::get(&raw)
    }
}

impl<'a> Usbdc<'a> {
    /// Configure EP0's two physical slots over their fixed buffer regions
    /// and enable SETUP reception. Called at connect and after bus reset.
    pub(crate) fn enable_endpoint0(&self) {
        let regs = &*self.registers;

        regs.epbuf[CTRL_OUT_PHY].write(
            EndpointBuffer::OFFSET.val(CTRL_OUT_OFFSET as u32)
                + EndpointBuffer::SIZE.val(CTRL_MAX_PACKET as u32),
        );
        regs.epbuf[CTRL_IN_PHY].write(
            EndpointBuffer::OFFSET.val(CTRL_IN_OFFSET as u32)
                + EndpointBuffer::SIZE.val(CTRL_MAX_PACKET as u32),
        );
        regs.epctrl[CTRL_OUT_PHY].write(
            EndpointControl::ENABLE::SET
                + EndpointControl::DIR::Out
                + EndpointControl::TYPE::Control,
        );
        regs.epctrl[CTRL_IN_PHY].write(
            EndpointControl::ENABLE::SET
                + EndpointControl::DIR::In
                + EndpointControl::TYPE::Control,
        );

        for phy in [CTRL_OUT_PHY, CTRL_IN_PHY] {
            let ep = &self.endpoints[phy];
            ep.reset_transfer();
            ep.configured.set(true);
            ep.max_packet.set(CTRL_MAX_PACKET);
            ep.transfer_type.set(crate::hil::TransferType::Control);
        }
    }

    /// A SETUP packet arrived on EP0.
    pub(crate) fn handle_ep0_setup(&self) {
        let regs = &*self.registers;

        // The hardware has already killed any in-progress transaction;
        // drop our record of it before touching the new packet. Data-stage
        // events latched by the aborted transaction are dead too, or they
        // would be attributed to the transfer this SETUP starts.
        self.endpoints[CTRL_OUT_PHY].reset_transfer();
        self.endpoints[CTRL_IN_PHY].reset_transfer();
        for phy in [CTRL_OUT_PHY, CTRL_IN_PHY] {
            regs.epctrl[phy].modify(
                EndpointControl::READY::CLEAR
                    + EndpointControl::SHORT::CLEAR
                    + EndpointControl::STALL::CLEAR,
            );
            // OUT, IN and STALLED; a SETUP latched concurrently survives.
            self.epev_clear(phy, (1 << 1) | (1 << 2) | (1 << 3));
        }
        self.ctrl.begin_transfer();

        let count = regs.epcount[CTRL_OUT_PHY].read(EndpointCount::COUNT) as usize;
        if count != 8 {
            debug!("Bad SETUP length {}", count);
            self.ctrl_stall();
            return;
        }

        let mut raw = [0u8; 8];
        regs.fifo_read(CTRL_OUT_OFFSET, &mut raw, 8);
        self.ctrl.setup.set(raw);
        self.ctrl.state.set(CtrlState::SetupReceived);
        trace!("SETUP {:?}", HexBuf(&raw));

        self.map_client(|c| c.ep0_setup());

        // The callback may already have queued a data-stage packet
        // (`ep0_write`), armed a read (`ep0_read`), or stalled; only
        // decide the next stage if it did none of those.
        if self.ctrl.state.get() == CtrlState::SetupReceived {
            match self.ctrl.current_setup() {
                Some(setup) if setup.length > 0 => {
                    let next = match setup.transfer_direction() {
                        TransferDirection::DeviceToHost => CtrlState::DataIn,
                        TransferDirection::HostToDevice => CtrlState::DataOut,
                    };
                    self.ctrl.state.set(next);
                }
                // No data stage: the status handshake is an IN from the
                // device's perspective.
                Some(_) => self.start_status_in(),
                None => self.ctrl_stall(),
            }
        }
    }

    /// An IN packet on EP0 was acknowledged by the host.
    pub(crate) fn handle_ep0_in(&self) {
        let regs = &*self.registers;

        match self.ctrl.state.get() {
            CtrlState::DataIn => {
                let packet = regs.epcount[CTRL_IN_PHY].read(EndpointCount::COUNT) as usize;
                let total = self.ctrl.sent.get() + packet;
                self.ctrl.sent.set(total);

                let length = self
                    .ctrl
                    .current_setup()
                    .map_or(0, |s| s.length as usize);

                if packet < CTRL_MAX_PACKET || total >= length {
                    // Short packet (possibly a ZLP) or request satisfied:
                    // the data stage is over.
                    self.start_status_out();
                } else {
                    self.map_client(|c| c.ep0_in());
                }
            }
            CtrlState::StatusIn => self.finish_control_transfer(),
            // Completion of a packet some later SETUP already aborted.
            _ => trace!("stale EP0 IN event"),
        }
    }

    /// An OUT packet arrived on EP0.
    pub(crate) fn handle_ep0_out(&self) {
        let regs = &*self.registers;

        match self.ctrl.state.get() {
            CtrlState::DataOut => {
                let packet = regs.epcount[CTRL_OUT_PHY].read(EndpointCount::COUNT) as usize;
                self.ctrl.last_out.set(packet);
                self.ctrl.received.set(self.ctrl.received.get() + packet);

                self.map_client(|c| c.ep0_out());

                let length = self
                    .ctrl
                    .current_setup()
                    .map_or(0, |s| s.length as usize);

                if packet < CTRL_MAX_PACKET || self.ctrl.received.get() >= length {
                    self.start_status_in();
                }
            }
            CtrlState::StatusOut => self.finish_control_transfer(),
            _ => trace!("stale EP0 OUT event"),
        }
    }

    /// Copy the most recent SETUP packet into `buffer`.
    pub(crate) fn ctrl_setup_packet(&self, buffer: &mut [u8]) {
        let raw = self.ctrl.setup.get();
        let n = buffer.len().min(raw.len());
        buffer[..n].copy_from_slice(&raw[..n]);
    }

    /// Queue one data-stage IN packet.
    pub(crate) fn ctrl_write(&self, buffer: &[u8]) -> Result<(), ErrorCode> {
        let regs = &*self.registers;
        let len = buffer.len();

        if len > CTRL_MAX_PACKET {
            return Err(ErrorCode::Invalid);
        }
        if regs.epctrl[CTRL_IN_PHY].is_set(EndpointControl::STALL) {
            return Err(ErrorCode::Stalled);
        }
        if regs.epctrl[CTRL_IN_PHY].is_set(EndpointControl::READY) {
            // Previous packet not yet collected by the host.
            return Err(ErrorCode::Busy);
        }

        let allowed = match self.ctrl.state.get() {
            CtrlState::SetupReceived => self.ctrl.current_setup().is_some_and(|s| {
                s.length > 0 && s.transfer_direction() == TransferDirection::DeviceToHost
            }),
            CtrlState::DataIn => true,
            _ => false,
        };
        if !allowed {
            return Err(ErrorCode::Invalid);
        }

        regs.fifo_write(CTRL_IN_OFFSET, buffer);
        regs.epcount[CTRL_IN_PHY].write(EndpointCount::COUNT.val(len as u32));

        // Flag a short packet (or ZLP) before arming the transfer, or the
        // host keeps waiting for a full-size packet that never comes.
        if len < CTRL_MAX_PACKET {
            regs.epctrl[CTRL_IN_PHY].modify(EndpointControl::SHORT::SET);
        } else {
            regs.epctrl[CTRL_IN_PHY].modify(EndpointControl::SHORT::CLEAR);
        }
        regs.epctrl[CTRL_IN_PHY].modify(EndpointControl::READY::SET);

        self.ctrl.state.set(CtrlState::DataIn);
        Ok(())
    }

    /// Arm EP0 to accept the next data-stage OUT packet.
    pub(crate) fn ctrl_read(&self) -> Result<(), ErrorCode> {
        let regs = &*self.registers;

        if regs.epctrl[CTRL_OUT_PHY].is_set(EndpointControl::STALL) {
            return Err(ErrorCode::Stalled);
        }

        let allowed = match self.ctrl.state.get() {
            CtrlState::SetupReceived => self.ctrl.current_setup().is_some_and(|s| {
                s.length > 0 && s.transfer_direction() == TransferDirection::HostToDevice
            }),
            CtrlState::DataOut => true,
            _ => false,
        };
        if !allowed {
            return Err(ErrorCode::Invalid);
        }

        regs.epctrl[CTRL_OUT_PHY].modify(EndpointControl::READY::SET);
        self.ctrl.state.set(CtrlState::DataOut);
        Ok(())
    }

    /// Copy the last data-stage OUT packet into `buffer`, returning its
    /// actual size.
    pub(crate) fn ctrl_get_read_result(&self, buffer: &mut [u8]) -> usize {
        let regs = &*self.registers;
        let n = self.ctrl.last_out.get().min(buffer.len());
        regs.fifo_read(CTRL_OUT_OFFSET, buffer, n);
        n
    }

    /// Respond to the current control transfer with STALL. Cleared
    /// automatically when the next SETUP arrives.
    pub(crate) fn ctrl_stall(&self) {
        let regs = &*self.registers;
        regs.epctrl[CTRL_OUT_PHY].modify(EndpointControl::STALL::SET);
        regs.epctrl[CTRL_IN_PHY].modify(EndpointControl::STALL::SET);
        self.ctrl.state.set(CtrlState::Idle);
    }

    /// Arm the zero-length IN handshake of the Status stage.
    fn start_status_in(&self) {
        let regs = &*self.registers;
        regs.epcount[CTRL_IN_PHY].write(EndpointCount::COUNT.val(0));
        regs.epctrl[CTRL_IN_PHY].modify(EndpointControl::SHORT::SET);
        regs.epctrl[CTRL_IN_PHY].modify(EndpointControl::READY::SET);
        self.ctrl.state.set(CtrlState::StatusIn);
    }

    /// Accept the host's zero-length OUT handshake of the Status stage.
    fn start_status_out(&self) {
        let regs = &*self.registers;
        regs.epctrl[CTRL_OUT_PHY].modify(EndpointControl::READY::SET);
        self.ctrl.state.set(CtrlState::StatusOut);
    }

    /// The Status stage has been acknowledged; the transfer is done.
    ///
    /// A latched SET_ADDRESS takes effect now. Writing it any earlier
    /// would make the controller NAK the Status handshake, which the host
    /// still addresses to the old device address.
    fn finish_control_transfer(&self) {
        let regs = &*self.registers;

        if let Some(addr) = self.ctrl.pending_address.take() {
            regs.addr
                .write(Address::ADDR.val(addr as u32) + Address::ENABLE::SET);
            debug!("Set address = {}", addr);
        }

        self.ctrl.state.set(CtrlState::Idle);
        self.ctrl.begin_transfer();
    }
}
