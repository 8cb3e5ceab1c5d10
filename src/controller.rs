// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The controller driver object and its interrupt dispatcher.

use core::cell::Cell;

use log::{debug, trace};
use tock_registers::interfaces::{Readable, Writeable};

use vcell::VolatileCell;

use crate::control::ControlContext;
use crate::debug::{BusEventFlags, EndpointEventFlags};
use crate::endpoint::{BufferAllocator, Endpoint, EndpointState};
use crate::hil::{
    Client, Direction, EndpointAddress, ErrorCode, TransferStatus, TransferType, UsbController,
};
use crate::registers::{
    Address, Control, EndpointBuffer, EndpointControl, Frame, Status, UsbdcRegisters, N_ENDPOINTS,
};
use crate::static_ref::StaticRef;

/// Bus speed, fixed at construction time per build configuration.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Speed {
    Full,
    High,
}

/// Interrupt-status bit for physical endpoint slot `phy`.
pub(crate) const fn ep_summary_bit(phy: usize) -> u32 {
    1 << (8 + phy)
}

const BUS_EVENT_MASK: u32 =
    (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3) | (1 << 4);

const EP_SUMMARY_MASK: u32 = 0xffff << 8;

const EP_EVENT_MASK: u32 = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3);

/// State for managing one USB device controller.
///
/// All fields use interior mutability: the main program and the interrupt
/// handler run on the same core, with the USB interrupt providing mutual
/// exclusion, so every entry point takes `&self`.
pub struct Usbdc<'a> {
    pub(crate) registers: StaticRef<UsbdcRegisters>,
    pub(crate) client: Cell<Option<&'a dyn Client>>,
    pub(crate) endpoints: [Endpoint<'a>; N_ENDPOINTS],
    pub(crate) ctrl: ControlContext,
    pub(crate) allocator: BufferAllocator,
    speed: Speed,
    attached: Cell<bool>,
    suspended: Cell<bool>,
    powered: Cell<bool>,
}

impl<'a> Usbdc<'a> {
    pub const fn new(registers: StaticRef<UsbdcRegisters>, speed: Speed) -> Self {
        Usbdc {
            registers,
            client: Cell::new(None),
            endpoints: [
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
            ],
            ctrl: ControlContext::new(),
            allocator: BufferAllocator::new(),
            speed,
            attached: Cell::new(false),
            suspended: Cell::new(false),
            powered: Cell::new(false),
        }
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn attached(&self) -> bool {
        self.attached.get()
    }

    pub(crate) fn map_client<F: FnOnce(&dyn Client)>(&self, f: F) {
        if let Some(client) = self.client.get() {
            f(client);
        }
    }

    /// Handle an interrupt from the controller.
    ///
    /// Reads the live status word, masks it against the enable mask, and
    /// performs exactly the actions needed to clear each set condition.
    /// Bus events come first, then EP0 (a SETUP always preempts any data
    /// stage), then the remaining endpoints. Every loop is bounded by the
    /// physical endpoint count.
    pub fn handle_interrupt(&self) {
        let regs = &*self.registers;
        let active = regs.intst.get() & regs.inten.get();

        trace!("usb irq {:?}", BusEventFlags(active));

        if active & (1 << 0) != 0 {
            // Bus reset
            self.intst_clear(1 << 0);
            self.handle_bus_reset();
        }

        if active & (1 << 4) != 0 {
            // VBUS level changed
            self.intst_clear(1 << 4);
            let powered = regs.status.is_set(Status::VBUS);
            self.powered.set(powered);
            debug!("VBUS {}", if powered { "detected" } else { "removed" });
            self.map_client(|c| c.power(powered));
        }

        if active & (1 << 1) != 0 {
            // The bus went idle for 3 ms. Arm the resume interrupt; it is
            // only meaningful while suspended.
            self.intst_clear(1 << 1);
            if !self.suspended.get() {
                self.suspended.set(true);
                regs.inten.set(regs.inten.get() | (1 << 2));
                self.map_client(|c| c.suspend(true));
            }
        }

        if active & (1 << 2) != 0 {
            self.intst_clear(1 << 2);
            regs.inten.set(regs.inten.get() & !(1 << 2));
            if self.suspended.get() {
                self.suspended.set(false);
                self.map_client(|c| c.suspend(false));
            }
        }

        if active & (1 << 3) != 0 {
            self.intst_clear(1 << 3);
            let frame = regs.frame.read(Frame::NUMBER) as u16;
            self.map_client(|c| c.sof(frame));
        }

        // Anything else in the status word is electrical noise; ack it.
        let spurious = active & !(BUS_EVENT_MASK | EP_SUMMARY_MASK);
        if spurious != 0 {
            self.intst_clear(spurious);
        }

        // Per-endpoint events. Slot 0 (EP0OUT, where SETUP lands) is
        // deliberately first.
        for phy in 0..N_ENDPOINTS {
            if active & ep_summary_bit(phy) == 0 {
                continue;
            }
            self.intst_clear(ep_summary_bit(phy));

            let mut events = regs.epev[phy].get();
            trace!("ep{} events {:?}", phy, EndpointEventFlags(events));

            if events & (1 << 0) != 0 {
                // SETUP is only valid on EP0OUT; elsewhere it is noise.
                self.epev_clear(phy, 1 << 0);
                if phy == 0 {
                    self.handle_ep0_setup();
                    // Servicing the SETUP discarded the events its
                    // predecessor transaction had latched; keep only what
                    // is still set.
                    events = regs.epev[phy].get();
                }
            }

            if events & (1 << 2) != 0 {
                self.epev_clear(phy, 1 << 2);
                match phy {
                    0 => {}
                    1 => self.handle_ep0_in(),
                    _ => self.handle_in_complete(phy),
                }
            }

            if events & (1 << 1) != 0 {
                self.epev_clear(phy, 1 << 1);
                match phy {
                    0 => self.handle_ep0_out(),
                    1 => {}
                    _ => self.handle_out_complete(phy),
                }
            }

            if events & (1 << 3) != 0 {
                // The controller answered a transaction with STALL; nothing
                // to do beyond acknowledging it.
                self.epev_clear(phy, 1 << 3);
                trace!("ep{} sent STALL", phy);
            }

            let residual = events & !EP_EVENT_MASK;
            if residual != 0 {
                self.epev_clear(phy, residual);
            }
        }
    }

    /// Clear bits in the bus interrupt-status word (events are cleared by
    /// writing the bit back as zero).
    fn intst_clear(&self, mask: u32) {
        let regs = &*self.registers;
        regs.intst.set(regs.intst.get() & !mask);
    }

    pub(crate) fn epev_clear(&self, phy: usize, mask: u32) {
        let regs = &*self.registers;
        regs.epev[phy].set(regs.epev[phy].get() & !mask);
    }

    pub(crate) fn inten_enable_endpoint(&self, phy: usize) {
        let regs = &*self.registers;
        regs.inten.set(regs.inten.get() | ep_summary_bit(phy));
    }

    pub(crate) fn inten_disable_endpoint(&self, phy: usize) {
        let regs = &*self.registers;
        regs.inten.set(regs.inten.get() & !ep_summary_bit(phy));
    }

    fn handle_bus_reset(&self) {
        let regs = &*self.registers;

        // Back to the default address.
        regs.addr.write(Address::ADDR.val(0));

        // Reset traffic ends any suspend; disarm the resume interrupt so
        // the next suspend is reported again.
        self.suspended.set(false);
        regs.inten.set(regs.inten.get() & !(1 << 2));

        // The configuration set up in response to SET_CONFIGURATION is gone.
        for phy in 2..N_ENDPOINTS {
            self.disable_data_endpoint(phy);
        }
        self.allocator.reset();

        // EP0 survives a reset; re-arm it for the next SETUP.
        self.ctrl.reset();
        self.enable_endpoint0();

        debug!("USB Bus Reset");
        self.map_client(|c| c.bus_reset());
    }

    fn disable_data_endpoint(&self, phy: usize) {
        let regs = &*self.registers;
        self.inten_disable_endpoint(phy);
        regs.epctrl[phy].set(0);
        regs.epev[phy].set(0);
        regs.epcount[phy].set(0);
        self.endpoints[phy].deconfigure();
    }
}

impl<'a> UsbController<'a> for Usbdc<'a> {
    fn set_client(&self, client: &'a dyn Client) {
        self.client.set(Some(client));
    }

    fn connect(&self) {
        let regs = &*self.registers;
        if self.attached.get() {
            debug!("Already attached");
            return;
        }

        // Platform pin-mux and clock bring-up are assumed done by now.
        regs.ctrl.write(
            Control::ENABLE::SET
                + Control::CONNECT::SET
                + match self.speed {
                    Speed::Full => Control::SPEED::Full,
                    Speed::High => Control::SPEED::High,
                },
        );

        self.enable_endpoint0();

        // Bus reset, suspend and VBUS interrupts; resume is armed on
        // demand, SOF via `sof_enable`. Merged into the mask so a
        // `sof_enable` issued before attachment is kept.
        let bus = (1 << 0) | (1 << 1) | (1 << 4);
        regs.inten
            .set(regs.inten.get() | bus | ep_summary_bit(0) | ep_summary_bit(1));

        self.powered.set(regs.status.is_set(Status::VBUS));
        self.attached.set(true);
        debug!("Attached");
    }

    fn disconnect(&self) {
        let regs = &*self.registers;
        regs.inten.set(0);
        regs.ctrl.write(Control::ENABLE::CLEAR + Control::CONNECT::CLEAR);
        self.ctrl.reset();
        for phy in 2..N_ENDPOINTS {
            self.disable_data_endpoint(phy);
        }
        self.allocator.reset();
        self.attached.set(false);
        self.suspended.set(false);
        debug!("Detached");
    }

    fn set_address(&self, addr: u8) {
        // Deferred: the hardware register is written after the Status
        // stage completes, never before.
        self.ctrl.pending_address.set(Some(addr & 0x7f));
        debug!("Latched address {}", addr);
    }

    fn endpoint_add(
        &self,
        ep: EndpointAddress,
        max_packet: usize,
        transfer_type: TransferType,
    ) -> Result<(), ErrorCode> {
        let regs = &*self.registers;

        if ep.number() == 0 || ep.number() > 7 || transfer_type == TransferType::Control {
            return Err(ErrorCode::Invalid);
        }
        if max_packet == 0 || max_packet > 1024 {
            return Err(ErrorCode::Invalid);
        }

        let phy = ep.phy_index();
        let endpoint = &self.endpoints[phy];
        if endpoint.configured.get() {
            return Err(ErrorCode::Busy);
        }

        let offset = self.allocator.allocate(max_packet).ok_or(ErrorCode::NoMem)?;

        regs.epbuf[phy].write(
            EndpointBuffer::OFFSET.val(offset as u32)
                + EndpointBuffer::SIZE.val(max_packet as u32),
        );
        regs.epctrl[phy].write(
            EndpointControl::ENABLE::SET
                + match ep.direction() {
                    Direction::Out => EndpointControl::DIR::Out,
                    Direction::In => EndpointControl::DIR::In,
                }
                + match transfer_type {
                    TransferType::Control => EndpointControl::TYPE::Control,
                    TransferType::Isochronous => EndpointControl::TYPE::Isochronous,
                    TransferType::Bulk => EndpointControl::TYPE::Bulk,
                    TransferType::Interrupt => EndpointControl::TYPE::Interrupt,
                },
        );

        endpoint.configured.set(true);
        endpoint.max_packet.set(max_packet);
        endpoint.transfer_type.set(transfer_type);
        endpoint.state.set(EndpointState::Idle);
        endpoint.result.set(None);

        self.inten_enable_endpoint(phy);

        debug!(
            "Enabled endpoint {} {:?} ({:?}, {} bytes at {})",
            ep.number(),
            ep.direction(),
            transfer_type,
            max_packet,
            offset
        );
        Ok(())
    }

    fn endpoint_remove(&self, ep: EndpointAddress) {
        if ep.number() == 0 || ep.number() > 7 {
            return;
        }
        // The packet-buffer region stays allocated until
        // `unconfigure_device`; fragmentation is accepted.
        self.disable_data_endpoint(ep.phy_index());
    }

    fn unconfigure_device(&self) {
        for phy in 2..N_ENDPOINTS {
            self.disable_data_endpoint(phy);
        }
        self.allocator.reset();
        debug!("Unconfigured");
    }

    fn ep0_setup(&self, buffer: &mut [u8]) {
        self.ctrl_setup_packet(buffer);
    }

    fn ep0_read(&self) -> Result<(), ErrorCode> {
        self.ctrl_read()
    }

    fn ep0_get_read_result(&self, buffer: &mut [u8]) -> usize {
        self.ctrl_get_read_result(buffer)
    }

    fn ep0_write(&self, buffer: &[u8]) -> Result<(), ErrorCode> {
        self.ctrl_write(buffer)
    }

    fn ep0_stall(&self) {
        self.ctrl_stall();
    }

    fn endpoint_read(
        &self,
        ep: EndpointAddress,
        buffer: &'a [VolatileCell<u8>],
        max_size: usize,
    ) -> TransferStatus {
        self.data_endpoint_read(ep, buffer, max_size)
    }

    fn endpoint_read_result(&self, ep: EndpointAddress) -> TransferStatus {
        self.data_endpoint_read_result(ep)
    }

    fn endpoint_write(
        &self,
        ep: EndpointAddress,
        buffer: &[VolatileCell<u8>],
        len: usize,
    ) -> TransferStatus {
        self.data_endpoint_write(ep, buffer, len)
    }

    fn endpoint_write_result(&self, ep: EndpointAddress) -> TransferStatus {
        self.data_endpoint_write_result(ep)
    }

    fn endpoint_stall(&self, ep: EndpointAddress) {
        self.data_endpoint_stall(ep);
    }

    fn endpoint_unstall(&self, ep: EndpointAddress) {
        self.data_endpoint_unstall(ep);
    }

    fn endpoint_stalled(&self, ep: EndpointAddress) -> bool {
        self.data_endpoint_stalled(ep)
    }

    fn endpoint_abort(&self, ep: EndpointAddress) {
        self.data_endpoint_abort(ep);
    }

    fn sof_enable(&self) {
        let regs = &*self.registers;
        regs.inten.set(regs.inten.get() | (1 << 3));
    }

    fn sof_disable(&self) {
        let regs = &*self.registers;
        regs.inten.set(regs.inten.get() & !(1 << 3));
    }
}
