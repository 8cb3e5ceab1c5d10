// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interface between the controller driver and the device stack above it.
//!
//! All `Client` callbacks are invoked from interrupt context with the USB
//! interrupt masked. They must not block and must not re-enter any
//! `UsbController` operation that manipulates the controller's interrupt
//! enables, or the dispatcher can deadlock against itself.

use vcell::VolatileCell;

/// Transfer direction, seen from the host.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// USB transfer types.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// A USB-visible endpoint address: endpoint number plus direction bit.
///
/// Logical addresses map onto physical FIFO slots as
/// `(number << 1) | direction`, so EP0OUT occupies slot 0, EP0IN slot 1,
/// EP1OUT slot 2, and so on. The physical index is computed once here and
/// cached by the endpoint table; nothing recomputes it per transfer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    pub const fn new(number: u8, direction: Direction) -> EndpointAddress {
        let dir = match direction {
            Direction::Out => 0,
            Direction::In => 0x80,
        };
        EndpointAddress((number & 0x0f) | dir)
    }

    /// Interpret a raw `bEndpointAddress` byte (bit 7 = IN).
    pub const fn from_raw(addr: u8) -> EndpointAddress {
        EndpointAddress(addr & 0x8f)
    }

    pub fn number(&self) -> u8 {
        self.0 & 0x0f
    }

    pub fn direction(&self) -> Direction {
        if self.0 & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Index of the physical FIFO slot backing this endpoint.
    pub fn phy_index(&self) -> usize {
        ((self.number() as usize) << 1) | (self.0 >> 7) as usize
    }
}

/// Result of a read/write request or completion poll on an endpoint.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransferStatus {
    /// The transfer has been armed but has not completed yet.
    Pending,
    /// The transfer finished; the payload carries the actual byte count.
    Complete(usize),
    /// The request was refused: bad endpoint index, wrong direction,
    /// endpoint busy or stalled, or an oversized single-packet write.
    /// The in-flight transfer (if any) is untouched.
    Invalid,
}

/// Synchronous failures reported by configuration and EP0 operations.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ErrorCode {
    /// Endpoint index out of range, wrong direction, or malformed argument.
    Invalid,
    /// A transfer is already in flight on this endpoint.
    Busy,
    /// The controller's internal packet buffer is exhausted.
    NoMem,
    /// The endpoint is halted; clear the stall first.
    Stalled,
}

/// Operations the device stack may invoke on the controller.
pub trait UsbController<'a> {
    fn set_client(&self, client: &'a dyn Client);

    /// Enable the controller and pull up the bus, making the device visible
    /// to the host. Pin-mux and clock bring-up are the platform's job and
    /// are assumed done before this call.
    fn connect(&self);

    /// Release the pull-up and disable the controller.
    fn disconnect(&self);

    /// Latch a device address received in a SET_ADDRESS request.
    ///
    /// The hardware address register is written only after the request's
    /// Status stage completes; acknowledging the Status stage at the old
    /// address is required by the USB specification.
    fn set_address(&self, addr: u8);

    /// Configure a non-control endpoint and reserve packet-buffer space for
    /// it. Fails with `NoMem` when the buffer high-water mark would exceed
    /// hardware capacity, and with `Invalid` for EP0 or bad indices.
    fn endpoint_add(
        &self,
        ep: EndpointAddress,
        max_packet: usize,
        transfer_type: TransferType,
    ) -> Result<(), ErrorCode>;

    /// Return an endpoint's slot to unused. Its packet-buffer region is not
    /// reclaimed until `unconfigure_device`.
    fn endpoint_remove(&self, ep: EndpointAddress);

    /// Tear down every endpoint configured by `endpoint_add` in one step and
    /// reset the packet-buffer high-water mark to just past EP0's fixed
    /// allocation. Models SET_CONFIGURATION discarding the old configuration.
    fn unconfigure_device(&self);

    /// Copy the most recently received 8-byte SETUP packet into `buffer`.
    fn ep0_setup(&self, buffer: &mut [u8]);

    /// Arm EP0 to accept the next OUT data packet of a control write.
    fn ep0_read(&self) -> Result<(), ErrorCode>;

    /// Copy the last EP0 OUT data packet into `buffer`, returning its size.
    fn ep0_get_read_result(&self, buffer: &mut [u8]) -> usize;

    /// Send one packet (at most EP0's max packet size; possibly zero-length)
    /// of a control read's data stage.
    fn ep0_write(&self, buffer: &[u8]) -> Result<(), ErrorCode>;

    /// Respond to the current control transfer with STALL.
    fn ep0_stall(&self);

    /// Request up to `max_size` bytes into `buffer` from an OUT endpoint.
    /// `buffer` must remain valid until completion or abort.
    fn endpoint_read(
        &self,
        ep: EndpointAddress,
        buffer: &'a [VolatileCell<u8>],
        max_size: usize,
    ) -> TransferStatus;

    /// Non-blocking completion poll for `endpoint_read`.
    fn endpoint_read_result(&self, ep: EndpointAddress) -> TransferStatus;

    /// Queue `len` bytes from `buffer` on an IN endpoint. This is a
    /// single-packet engine: `len` larger than the endpoint's max packet
    /// size is refused with `Invalid` and the caller must fragment. A write
    /// shorter than the max packet size is flagged to hardware as a short
    /// packet before the transfer is armed.
    fn endpoint_write(
        &self,
        ep: EndpointAddress,
        buffer: &[VolatileCell<u8>],
        len: usize,
    ) -> TransferStatus;

    /// Non-blocking completion poll for `endpoint_write`.
    fn endpoint_write_result(&self, ep: EndpointAddress) -> TransferStatus;

    /// Halt an endpoint. Read/write attempts are refused until
    /// `endpoint_unstall`.
    fn endpoint_stall(&self, ep: EndpointAddress);

    /// Clear a halt and reset the endpoint's data toggle to DATA0.
    fn endpoint_unstall(&self, ep: EndpointAddress);

    fn endpoint_stalled(&self, ep: EndpointAddress) -> bool;

    /// Cancel any in-flight transfer: disable the endpoint's interrupt
    /// sources, flush its FIFO state, then mark it idle. A no-op on an
    /// already-idle endpoint.
    fn endpoint_abort(&self, ep: EndpointAddress);

    /// Arm or disarm start-of-frame callbacks.
    fn sof_enable(&self);
    fn sof_disable(&self);
}

/// Callbacks delivered to the device stack.
///
/// `in_complete`/`out_complete` are delivered in hardware FIFO order within
/// one endpoint; no ordering holds across endpoints.
pub trait Client {
    /// A SETUP packet arrived on EP0. Fetch it with
    /// [`UsbController::ep0_setup`]. This event aborts whatever control
    /// transfer was in flight.
    fn ep0_setup(&self);

    /// A data-stage IN packet queued with `ep0_write` was transmitted and
    /// the transfer is not finished; queue the next packet.
    fn ep0_in(&self);

    /// A data-stage OUT packet arrived; fetch it with
    /// [`UsbController::ep0_get_read_result`].
    fn ep0_out(&self);

    /// An `endpoint_write` on `ep` completed.
    fn in_complete(&self, ep: EndpointAddress);

    /// An `endpoint_read` on `ep` completed.
    fn out_complete(&self, ep: EndpointAddress);

    /// Start-of-frame, with the 11-bit frame number.
    fn sof(&self, frame: u16);

    /// Bus suspend state changed.
    fn suspend(&self, suspended: bool);

    /// VBUS appeared or disappeared.
    fn power(&self, powered: bool);

    /// The host reset the bus. All non-control endpoints are gone and the
    /// device is back at address zero.
    fn bus_reset(&self);
}
