// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wire-format types for the USB 2.0 control protocol.
//!
//! The engine only decodes what the transport layer itself needs from a
//! SETUP packet: the data-stage direction and length. Interpreting the
//! request semantics is the device stack's job.

use core::fmt;

/// The datastructure sent in a SETUP handshake.
///
/// All multi-byte fields are little-endian on the wire.
#[derive(Debug, Copy, Clone)]
pub struct SetupData {
    pub request_type: DeviceRequestType,
    pub request_code: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupData {
    /// Create a `SetupData` structure from a buffer as received from the
    /// wire. Returns `None` unless the buffer holds exactly 8 bytes.
    pub fn get(buf: &[u8]) -> Option<Self> {
        if buf.len() != 8 {
            return None;
        }
        Some(SetupData {
            request_type: DeviceRequestType(buf[0]),
            request_code: buf[1],
            value: get_u16(buf[2], buf[3]),
            index: get_u16(buf[4], buf[5]),
            length: get_u16(buf[6], buf[7]),
        })
    }

    /// Direction of the data stage, from bit 7 of `bmRequestType`.
    pub fn transfer_direction(&self) -> TransferDirection {
        self.request_type.transfer_direction()
    }
}

fn get_u16(lo: u8, hi: u8) -> u16 {
    (lo as u16) | ((hi as u16) << 8)
}

#[derive(Copy, Clone)]
pub struct DeviceRequestType(pub u8);

impl DeviceRequestType {
    pub fn transfer_direction(self) -> TransferDirection {
        match self.0 & (1 << 7) {
            0 => TransferDirection::HostToDevice,
            _ => TransferDirection::DeviceToHost,
        }
    }

    pub fn request_type(self) -> RequestType {
        match (self.0 & (0b11 << 5)) >> 5 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(self) -> Recipient {
        match self.0 & 0b11111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }
}

impl fmt::Debug for DeviceRequestType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?}, {:?}, {:?}",
            self.transfer_direction(),
            self.request_type(),
            self.recipient()
        )
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}
