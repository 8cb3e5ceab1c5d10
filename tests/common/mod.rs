// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RAM-backed virtual controller plus a scripted device stack.
//!
//! The harness plays both the silicon and the host: it deposits packets in
//! the packet buffer, flips event bits, and collects armed IN packets,
//! all through the same typed register interface the driver uses. Event
//! registers are cleared by writing the bit back as zero, so a zeroed heap
//! block behaves exactly like the peripheral.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use vcell::VolatileCell;

use usbdc::protocol::TransferDirection;
use usbdc::registers::{
    EndpointBuffer, EndpointControl, EndpointCount, UsbdcRegisters, CTRL_MAX_PACKET,
    CTRL_OUT_OFFSET,
};
use usbdc::{Client, EndpointAddress, SetupData, Speed, StaticRef, UsbController, Usbdc};

/// Physical slot of EP0OUT.
pub const EP0_OUT: usize = 0;
/// Physical slot of EP0IN.
pub const EP0_IN: usize = 1;

pub const SETUP_EV: u32 = 1 << 0;
pub const OUT_EV: u32 = 1 << 1;
pub const IN_EV: u32 = 1 << 2;

pub const RESET_IRQ: u32 = 1 << 0;
pub const SUSPEND_IRQ: u32 = 1 << 1;
pub const RESUME_IRQ: u32 = 1 << 2;
pub const SOF_IRQ: u32 = 1 << 3;
pub const VBUS_IRQ: u32 = 1 << 4;

/// A virtual controller: the reference register block in leaked, zeroed
/// heap memory.
pub struct Hardware {
    pub regs: StaticRef<UsbdcRegisters>,
}

impl Hardware {
    pub fn new() -> Hardware {
        // 0xc00-byte window, word-aligned like a real peripheral.
        let block = Box::leak(Box::new([0u32; 0x300]));
        let regs = unsafe { StaticRef::new(block.as_ptr() as *const UsbdcRegisters) };
        Hardware { regs }
    }

    /// Latch bus-event bits into the interrupt-status word.
    pub fn raise_bus(&self, mask: u32) {
        self.regs.intst.set(self.regs.intst.get() | mask);
    }

    fn raise_ep(&self, phy: usize, mask: u32) {
        self.regs.epev[phy].set(self.regs.epev[phy].get() | mask);
        self.regs.intst.set(self.regs.intst.get() | (1 << (8 + phy)));
    }

    /// True when the driver has armed `phy` for its next transaction.
    pub fn armed(&self, phy: usize) -> bool {
        self.regs.epctrl[phy].is_set(EndpointControl::READY)
    }

    pub fn stalled(&self, phy: usize) -> bool {
        self.regs.epctrl[phy].is_set(EndpointControl::STALL)
    }

    /// Deposit a SETUP packet in EP0OUT's fixed region and signal it.
    pub fn send_setup(&self, setup: [u8; 8]) {
        self.send_setup_raw(&setup);
    }

    /// Like `send_setup` but without the length guarantee, for modelling a
    /// corrupted handshake.
    pub fn send_setup_raw(&self, bytes: &[u8]) {
        self.regs.fifo_write(CTRL_OUT_OFFSET, bytes);
        self.regs.epcount[EP0_OUT].write(EndpointCount::COUNT.val(bytes.len() as u32));
        self.raise_ep(EP0_OUT, SETUP_EV);
    }

    /// Deliver an OUT data packet to an armed endpoint, as the host would.
    pub fn send_out(&self, phy: usize, data: &[u8]) {
        assert!(self.armed(phy), "ep{} not armed for OUT", phy);
        let offset = self.regs.epbuf[phy].read(EndpointBuffer::OFFSET) as usize;
        self.regs.fifo_write(offset, data);
        self.regs.epcount[phy].write(EndpointCount::COUNT.val(data.len() as u32));
        self.regs.epctrl[phy].modify(EndpointControl::READY::CLEAR);
        self.raise_ep(phy, OUT_EV);
    }

    /// Collect an armed IN packet, returning its payload and whether the
    /// short-packet flag accompanied it.
    pub fn collect_in(&self, phy: usize) -> (Vec<u8>, bool) {
        assert!(self.armed(phy), "ep{} not armed for IN", phy);
        let offset = self.regs.epbuf[phy].read(EndpointBuffer::OFFSET) as usize;
        let count = self.regs.epcount[phy].read(EndpointCount::COUNT) as usize;
        let mut data = vec![0u8; count];
        self.regs.fifo_read(offset, &mut data, count);
        let short = self.regs.epctrl[phy].is_set(EndpointControl::SHORT);
        self.regs.epctrl[phy].modify(EndpointControl::READY::CLEAR);
        self.raise_ep(phy, IN_EV);
        (data, short)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Ep0Setup,
    Ep0In,
    Ep0Out,
    InComplete(EndpointAddress),
    OutComplete(EndpointAddress),
    Sof(u16),
    Suspend(bool),
    Power(bool),
    BusReset,
}

/// A minimal device stack: records every callback and serves control
/// transfers from a scripted payload.
pub struct TestClient {
    usb: Cell<Option<&'static Usbdc<'static>>>,
    pub events: RefCell<Vec<Event>>,
    /// Payload streamed during a control read's data stage.
    pub in_payload: RefCell<Vec<u8>>,
    in_sent: Cell<usize>,
    in_total: Cell<usize>,
    /// Bytes accumulated from a control write's data stage.
    pub out_received: RefCell<Vec<u8>>,
    out_expected: Cell<usize>,
    /// Stall the next SETUP instead of serving it.
    pub reject_next: Cell<bool>,
}

impl TestClient {
    pub fn new() -> TestClient {
        TestClient {
            usb: Cell::new(None),
            events: RefCell::new(Vec::new()),
            in_payload: RefCell::new(Vec::new()),
            in_sent: Cell::new(0),
            in_total: Cell::new(0),
            out_received: RefCell::new(Vec::new()),
            out_expected: Cell::new(0),
            reject_next: Cell::new(false),
        }
    }

    pub fn bind(&self, usb: &'static Usbdc<'static>) {
        self.usb.set(Some(usb));
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    fn usb(&self) -> &'static Usbdc<'static> {
        self.usb.get().expect("client not bound")
    }

    fn send_next_in(&self) {
        let payload = self.in_payload.borrow();
        let total = self.in_total.get().min(payload.len());
        let off = self.in_sent.get().min(total);
        let end = total.min(off + CTRL_MAX_PACKET);
        self.in_sent.set(end);
        // An empty chunk is the terminating ZLP.
        self.usb()
            .ep0_write(&payload[off..end])
            .expect("ep0_write refused");
    }
}

impl Client for TestClient {
    fn ep0_setup(&self) {
        self.events.borrow_mut().push(Event::Ep0Setup);
        let usb = self.usb();

        let mut raw = [0u8; 8];
        usb.ep0_setup(&mut raw);
        let setup = match SetupData::get(&raw) {
            Some(s) => s,
            None => return,
        };

        if self.reject_next.replace(false) {
            usb.ep0_stall();
            return;
        }

        match setup.transfer_direction() {
            TransferDirection::DeviceToHost => {
                self.in_sent.set(0);
                self.in_total.set(setup.length as usize);
                self.send_next_in();
            }
            TransferDirection::HostToDevice => {
                // SET_ADDRESS
                if setup.request_code == 0x05 {
                    usb.set_address(setup.value as u8);
                }
                if setup.length > 0 {
                    self.out_expected.set(setup.length as usize);
                    self.out_received.borrow_mut().clear();
                    usb.ep0_read().expect("ep0_read refused");
                }
            }
        }
    }

    fn ep0_in(&self) {
        self.events.borrow_mut().push(Event::Ep0In);
        self.send_next_in();
    }

    fn ep0_out(&self) {
        self.events.borrow_mut().push(Event::Ep0Out);
        let usb = self.usb();
        let mut buf = [0u8; CTRL_MAX_PACKET];
        let n = usb.ep0_get_read_result(&mut buf);
        let mut received = self.out_received.borrow_mut();
        received.extend_from_slice(&buf[..n]);
        if n == CTRL_MAX_PACKET && received.len() < self.out_expected.get() {
            usb.ep0_read().expect("ep0_read refused");
        }
    }

    fn in_complete(&self, ep: EndpointAddress) {
        self.events.borrow_mut().push(Event::InComplete(ep));
    }

    fn out_complete(&self, ep: EndpointAddress) {
        self.events.borrow_mut().push(Event::OutComplete(ep));
    }

    fn sof(&self, frame: u16) {
        self.events.borrow_mut().push(Event::Sof(frame));
    }

    fn suspend(&self, suspended: bool) {
        self.events.borrow_mut().push(Event::Suspend(suspended));
    }

    fn power(&self, powered: bool) {
        self.events.borrow_mut().push(Event::Power(powered));
    }

    fn bus_reset(&self) {
        self.events.borrow_mut().push(Event::BusReset);
    }
}

/// An attached controller on a fresh virtual bus.
pub fn setup() -> (&'static Hardware, &'static Usbdc<'static>, &'static TestClient) {
    let _ = env_logger::builder().is_test(true).try_init();

    let hw = Box::leak(Box::new(Hardware::new()));
    let usb = Box::leak(Box::new(Usbdc::new(hw.regs, Speed::Full)));
    let client = Box::leak(Box::new(TestClient::new()));

    client.bind(usb);
    usb.set_client(client);
    usb.connect();
    (hw, usb, client)
}

/// A leaked transfer buffer with the 'static lifetime `endpoint_read`
/// wants.
pub fn leak_buffer(len: usize) -> &'static [VolatileCell<u8>] {
    let cells: Vec<VolatileCell<u8>> = (0..len).map(|_| VolatileCell::new(0)).collect();
    Box::leak(cells.into_boxed_slice())
}
