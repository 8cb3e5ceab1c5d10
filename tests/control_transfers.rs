// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end control transfers against a RAM-backed virtual controller.

mod common;

use common::{Event, EP0_IN, EP0_OUT, RESET_IRQ};
use tock_registers::interfaces::Readable;
use usbdc::registers::Address;

const GET_DESCRIPTOR_DEVICE: [u8; 8] = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0x00];

fn get_descriptor(wlength: u16) -> [u8; 8] {
    let [lo, hi] = wlength.to_le_bytes();
    [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, lo, hi]
}

#[test]
fn control_read_single_short_packet() {
    let (hw, usb, client) = common::setup();
    let descriptor: Vec<u8> = (0..18).collect();
    *client.in_payload.borrow_mut() = descriptor.clone();

    hw.send_setup(GET_DESCRIPTOR_DEVICE);
    usb.handle_interrupt();
    assert_eq!(client.take_events(), vec![Event::Ep0Setup]);

    // 18 bytes fit one packet; it must carry the short-packet flag.
    let (data, short) = hw.collect_in(EP0_IN);
    assert_eq!(data, descriptor);
    assert!(short);
    usb.handle_interrupt();

    // Data stage done: the engine accepts the host's zero-length Status OUT.
    assert!(hw.armed(EP0_OUT));
    hw.send_out(EP0_OUT, &[]);
    usb.handle_interrupt();

    assert!(!hw.armed(EP0_IN));
    assert!(!hw.armed(EP0_OUT));
}

#[test]
fn control_read_multiple_packets() {
    let (hw, usb, client) = common::setup();
    let descriptor: Vec<u8> = (0..128u8).map(|i| i.wrapping_mul(3)).collect();
    *client.in_payload.borrow_mut() = descriptor.clone();

    hw.send_setup(get_descriptor(128));
    usb.handle_interrupt();

    let (first, short) = hw.collect_in(EP0_IN);
    assert_eq!(first, descriptor[..64]);
    assert!(!short);
    usb.handle_interrupt();

    let (second, short) = hw.collect_in(EP0_IN);
    assert_eq!(second, descriptor[64..]);
    assert!(!short);
    usb.handle_interrupt();

    // Request satisfied exactly: Status stage, no third data packet.
    assert!(hw.armed(EP0_OUT));
    assert!(!hw.armed(EP0_IN));
    assert_eq!(
        client.take_events(),
        vec![Event::Ep0Setup, Event::Ep0In]
    );
}

#[test]
fn control_read_terminated_by_zlp() {
    let (hw, usb, client) = common::setup();
    // Device has less than wLength and the remainder divides evenly into
    // full packets, so a zero-length packet must end the data stage.
    *client.in_payload.borrow_mut() = vec![0xaa; 64];

    hw.send_setup(get_descriptor(256));
    usb.handle_interrupt();

    let (first, short) = hw.collect_in(EP0_IN);
    assert_eq!(first.len(), 64);
    assert!(!short);
    usb.handle_interrupt();

    let (zlp, short) = hw.collect_in(EP0_IN);
    assert!(zlp.is_empty());
    assert!(short);
    usb.handle_interrupt();

    assert!(hw.armed(EP0_OUT));
}

#[test]
fn control_write_data_reaches_client() {
    let (hw, usb, client) = common::setup();
    let payload = [0x10u8, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80];

    // Class request, host to device, wLength = 8.
    hw.send_setup([0x21, 0x09, 0x00, 0x02, 0x00, 0x00, 8, 0x00]);
    usb.handle_interrupt();
    assert!(hw.armed(EP0_OUT));

    hw.send_out(EP0_OUT, &payload);
    usb.handle_interrupt();
    assert_eq!(*client.out_received.borrow(), payload);

    // Device acknowledges with a zero-length Status IN.
    let (zlp, short) = hw.collect_in(EP0_IN);
    assert!(zlp.is_empty());
    assert!(short);
    usb.handle_interrupt();
    assert!(!hw.armed(EP0_IN));
}

#[test]
fn set_address_applied_only_after_status_stage() {
    let (hw, usb, client) = common::setup();

    hw.send_setup([0x00, 0x05, 42, 0x00, 0x00, 0x00, 0x00, 0x00]);
    usb.handle_interrupt();

    // The Status stage has not run: still the default address, so the
    // controller can ACK the handshake the host sends to address zero.
    assert_eq!(hw.regs.addr.read(Address::ADDR), 0);
    assert!(!hw.regs.addr.is_set(Address::ENABLE));

    let (zlp, _) = hw.collect_in(EP0_IN);
    assert!(zlp.is_empty());
    usb.handle_interrupt();

    assert_eq!(hw.regs.addr.read(Address::ADDR), 42);
    assert!(hw.regs.addr.is_set(Address::ENABLE));
    assert_eq!(client.take_events(), vec![Event::Ep0Setup]);
}

#[test]
fn new_setup_preempts_in_flight_transfer() {
    let (hw, usb, client) = common::setup();
    *client.in_payload.borrow_mut() = vec![0x11; 128];

    hw.send_setup(get_descriptor(128));
    usb.handle_interrupt();
    assert!(hw.armed(EP0_IN));

    // The host gives up and issues a different request without collecting
    // the armed packet.
    *client.in_payload.borrow_mut() = vec![0x22, 0x33, 0x44, 0x55];
    hw.send_setup(get_descriptor(4));
    usb.handle_interrupt();
    assert_eq!(client.take_events(), vec![Event::Ep0Setup, Event::Ep0Setup]);

    // What is armed now belongs entirely to the second request.
    let (data, short) = hw.collect_in(EP0_IN);
    assert_eq!(data, vec![0x22, 0x33, 0x44, 0x55]);
    assert!(short);
    usb.handle_interrupt();
    assert!(hw.armed(EP0_OUT));
}

#[test]
fn stale_data_stage_event_discarded_by_new_setup() {
    let (hw, usb, client) = common::setup();
    *client.in_payload.borrow_mut() = vec![0x11; 128];

    hw.send_setup(get_descriptor(128));
    usb.handle_interrupt();

    // The host collects the first packet but abandons the transfer: its
    // IN completion and the next SETUP land in the same dispatch pass.
    let (first, _) = hw.collect_in(EP0_IN);
    assert_eq!(first.len(), 64);
    *client.in_payload.borrow_mut() = vec![0x99; 100];
    hw.send_setup(get_descriptor(100));
    usb.handle_interrupt();

    // The completion belonged to the aborted transfer; nothing of it may
    // leak into the new one, whose data stage runs to the end.
    let (data, short) = hw.collect_in(EP0_IN);
    assert_eq!(data, vec![0x99; 64]);
    assert!(!short);
    usb.handle_interrupt();

    let (rest, short) = hw.collect_in(EP0_IN);
    assert_eq!(rest, vec![0x99; 36]);
    assert!(short);
    usb.handle_interrupt();
    assert!(hw.armed(EP0_OUT));
}

#[test]
fn bus_reset_discards_partial_control_write() {
    let (hw, usb, client) = common::setup();

    // Control write with a 128-byte data stage; only half arrives.
    hw.send_setup([0x21, 0x09, 0x00, 0x02, 0x00, 0x00, 128, 0x00]);
    usb.handle_interrupt();
    assert!(hw.armed(EP0_OUT));
    hw.send_out(EP0_OUT, &[0xab; 64]);
    usb.handle_interrupt();
    client.take_events();

    hw.raise_bus(RESET_IRQ);
    usb.handle_interrupt();
    assert_eq!(client.take_events(), vec![Event::BusReset]);

    // The dead transfer left nothing behind: no status handshake armed.
    assert!(!hw.armed(EP0_IN));
    assert!(!hw.armed(EP0_OUT));

    // The next request is serviced as if nothing had happened.
    *client.in_payload.borrow_mut() = vec![0x5a; 18];
    hw.send_setup(GET_DESCRIPTOR_DEVICE);
    usb.handle_interrupt();
    let (data, short) = hw.collect_in(EP0_IN);
    assert_eq!(data, vec![0x5a; 18]);
    assert!(short);
    usb.handle_interrupt();
    assert!(hw.armed(EP0_OUT));
    hw.send_out(EP0_OUT, &[]);
    usb.handle_interrupt();
    assert!(!hw.armed(EP0_IN));
}

#[test]
fn malformed_setup_stalls_without_callback() {
    let (hw, usb, client) = common::setup();

    hw.send_setup_raw(&[0x80, 0x06, 0x00]);
    usb.handle_interrupt();

    assert!(hw.stalled(EP0_OUT));
    assert!(hw.stalled(EP0_IN));
    assert!(client.take_events().is_empty());

    // The next well-formed SETUP clears the stall and is serviced.
    *client.in_payload.borrow_mut() = vec![0x5a; 18];
    hw.send_setup(GET_DESCRIPTOR_DEVICE);
    usb.handle_interrupt();

    assert!(!hw.stalled(EP0_OUT));
    assert!(!hw.stalled(EP0_IN));
    let (data, _) = hw.collect_in(EP0_IN);
    assert_eq!(data, vec![0x5a; 18]);
}

#[test]
fn rejected_request_stalls_until_next_setup() {
    let (hw, usb, client) = common::setup();
    client.reject_next.set(true);

    hw.send_setup(GET_DESCRIPTOR_DEVICE);
    usb.handle_interrupt();
    assert!(hw.stalled(EP0_IN));
    assert!(hw.stalled(EP0_OUT));
    assert!(!hw.armed(EP0_IN));

    *client.in_payload.borrow_mut() = vec![0x77; 18];
    hw.send_setup(GET_DESCRIPTOR_DEVICE);
    usb.handle_interrupt();
    assert!(!hw.stalled(EP0_IN));
    let (data, _) = hw.collect_in(EP0_IN);
    assert_eq!(data, vec![0x77; 18]);
}
