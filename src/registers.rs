// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Register map of the reference USB device controller.
//!
//! The block exposes 16 physical endpoint slots (a logical endpoint's slot
//! is `(number << 1) | direction`, so EP0OUT = 0, EP0IN = 1, EP1OUT = 2, …)
//! and a 2 KiB byte-addressable internal packet buffer. Per-endpoint buffer
//! regions are described by `(offset, size)` pairs in `epbuf`.
//!
//! Event registers (`intst`, `epev`) are set by hardware and cleared by
//! software writing the bit back to zero, so a RAM-backed copy of this
//! block behaves exactly like the silicon; the integration-test harness
//! relies on that to instantiate virtual controllers. Register fields are
//! `pub` for the same reason: the harness plays the part of the hardware
//! through the same typed interface the driver uses.
//!
//! SETUP packets are deposited by hardware into EP0OUT's fixed buffer
//! region at packet-buffer offset 0 and signalled via `epev[0].SETUP`.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};
use vcell::VolatileCell;

/// Number of physical endpoint slots (8 logical endpoints, both directions).
pub const N_ENDPOINTS: usize = 16;

/// Size of the controller's internal packet buffer in bytes.
pub const PKT_BUF_SIZE: usize = 2048;

/// EP0's max packet size; fixed by the controller.
pub const CTRL_MAX_PACKET: usize = 64;

/// Packet-buffer offset of EP0OUT's fixed region.
pub const CTRL_OUT_OFFSET: usize = 0;

/// Packet-buffer offset of EP0IN's fixed region.
pub const CTRL_IN_OFFSET: usize = CTRL_MAX_PACKET;

/// First packet-buffer offset available to `endpoint_add`; everything below
/// is EP0's fixed allocation.
pub const CTRL_BUF_RESERVED: usize = 2 * CTRL_MAX_PACKET;

register_structs! {
    pub UsbdcRegisters {
        /// Controller enable, bus pull-up, speed selection.
        (0x000 => pub ctrl: ReadWrite<u32, Control::Register>),
        /// Device address; takes effect once ENABLE is set.
        (0x004 => pub addr: ReadWrite<u32, Address::Register>),
        /// Current 11-bit frame number, hardware-maintained.
        (0x008 => pub frame: ReadWrite<u32, Frame::Register>),
        /// Live bus line state.
        (0x00c => pub status: ReadWrite<u32, Status::Register>),
        /// Bus-event flags plus per-endpoint event summary bits.
        (0x010 => pub intst: ReadWrite<u32, BusInterrupt::Register>),
        /// Interrupt enable mask, same layout as `intst`.
        (0x014 => pub inten: ReadWrite<u32, BusInterrupt::Register>),
        (0x018 => _reserved0),
        /// Per-endpoint configuration and handshake control.
        (0x020 => pub epctrl: [ReadWrite<u32, EndpointControl::Register>; N_ENDPOINTS]),
        /// Per-endpoint packet-buffer region, offset and max packet size.
        (0x060 => pub epbuf: [ReadWrite<u32, EndpointBuffer::Register>; N_ENDPOINTS]),
        /// Byte count: written by software for IN, by hardware for OUT.
        (0x0a0 => pub epcount: [ReadWrite<u32, EndpointCount::Register>; N_ENDPOINTS]),
        /// Per-endpoint event flags.
        (0x0e0 => pub epev: [ReadWrite<u32, EndpointEvent::Register>; N_ENDPOINTS]),
        (0x120 => _reserved1),
        /// Internal packet buffer.
        (0x400 => pub pktbuf: [ReadWrite<u8>; PKT_BUF_SIZE]),
        (0xc00 => @END),
    }
}

register_bitfields![u32,
    pub Control [
        ENABLE OFFSET(0) NUMBITS(1) [],
        CONNECT OFFSET(1) NUMBITS(1) [],
        SPEED OFFSET(2) NUMBITS(1) [
            Full = 0,
            High = 1
        ]
    ],
    pub Address [
        ADDR OFFSET(0) NUMBITS(7) [],
        ENABLE OFFSET(7) NUMBITS(1) []
    ],
    pub Frame [
        NUMBER OFFSET(0) NUMBITS(11) []
    ],
    pub Status [
        VBUS OFFSET(0) NUMBITS(1) []
    ],
    pub BusInterrupt [
        RESET OFFSET(0) NUMBITS(1) [],
        SUSPEND OFFSET(1) NUMBITS(1) [],
        RESUME OFFSET(2) NUMBITS(1) [],
        SOF OFFSET(3) NUMBITS(1) [],
        VBUS OFFSET(4) NUMBITS(1) [],
        EP OFFSET(8) NUMBITS(16) []
    ],
    pub EndpointControl [
        ENABLE OFFSET(0) NUMBITS(1) [],
        DIR OFFSET(1) NUMBITS(1) [
            Out = 0,
            In = 1
        ],
        TYPE OFFSET(2) NUMBITS(2) [
            Control = 0,
            Isochronous = 1,
            Bulk = 2,
            Interrupt = 3
        ],
        STALL OFFSET(4) NUMBITS(1) [],
        RSTDT OFFSET(5) NUMBITS(1) [],
        SHORT OFFSET(6) NUMBITS(1) [],
        READY OFFSET(7) NUMBITS(1) []
    ],
    pub EndpointBuffer [
        OFFSET OFFSET(0) NUMBITS(12) [],
        SIZE OFFSET(16) NUMBITS(11) []
    ],
    pub EndpointCount [
        COUNT OFFSET(0) NUMBITS(11) []
    ],
    pub EndpointEvent [
        SETUP OFFSET(0) NUMBITS(1) [],
        OUT OFFSET(1) NUMBITS(1) [],
        IN OFFSET(2) NUMBITS(1) [],
        STALLED OFFSET(3) NUMBITS(1) []
    ]
];

impl UsbdcRegisters {
    /// Copy `src` into the packet buffer starting at `offset`.
    pub fn fifo_write(&self, offset: usize, src: &[u8]) {
        for (i, b) in src.iter().enumerate() {
            self.pktbuf[offset + i].set(*b);
        }
    }

    /// Copy `len` bytes out of the packet buffer starting at `offset`.
    pub fn fifo_read(&self, offset: usize, dst: &mut [u8], len: usize) {
        for (i, b) in dst.iter_mut().take(len).enumerate() {
            *b = self.pktbuf[offset + i].get();
        }
    }

    /// Copy from a caller-owned cell slice into the packet buffer.
    pub(crate) fn fifo_write_cells(&self, offset: usize, src: &[VolatileCell<u8>], len: usize) {
        for (i, b) in src.iter().take(len).enumerate() {
            self.pktbuf[offset + i].set(b.get());
        }
    }

    /// Copy from the packet buffer into a caller-owned cell slice.
    pub(crate) fn fifo_read_cells(&self, offset: usize, dst: &[VolatileCell<u8>], len: usize) {
        for (i, b) in dst.iter().take(len).enumerate() {
            b.set(self.pktbuf[offset + i].get());
        }
    }
}
