// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! USB 2.0 device-controller protocol engine.
//!
//! This crate implements the device-side transport layer of a USB 2.0
//! controller: the control-transfer state machine on endpoint 0, the
//! single-slot transfer engine for bulk/interrupt/isochronous endpoints,
//! the packet-buffer allocator, and the interrupt dispatcher that ties
//! them to the hardware event registers.
//!
//! The engine is written against the reference controller register block
//! declared in [`registers`]. The driver owns no global state: a
//! [`controller::Usbdc`] is constructed from a register base address, so
//! several controllers (real or RAM-backed virtual ones in a test
//! harness) can coexist in one image.
//!
//! The upper device stack (descriptor tables, request dispatch, class
//! drivers) sits above the [`hil::Client`] callback interface and is out
//! of scope here; it receives setup/data/status events and issues
//! read/write/stall commands through [`hil::UsbController`].

#![no_std]

pub mod controller;
pub mod debug;
pub mod endpoint;
pub mod hil;
pub mod protocol;
pub mod registers;
pub mod static_ref;

mod control;
mod transfer;

pub use crate::controller::{Speed, Usbdc};
pub use crate::hil::{
    Client, Direction, EndpointAddress, ErrorCode, TransferStatus, TransferType, UsbController,
};
pub use crate::protocol::SetupData;
pub use crate::static_ref::StaticRef;
