// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Byte-level transport between endpoint FIFOs and memory.
//!
//! These are the only functions that move packet data; everything above
//! works with counts and buffers.

use crate::hil::UsbHardware;
use crate::setup::{SetupPacket, SETUP_PACKET_SIZE};

/// Drain `buf.len()` bytes from the FIFO of endpoint `fifo`. The last byte
/// goes through the controller's last-byte read.
pub(crate) fn read<H: UsbHardware>(hw: &H, fifo: u8, buf: &mut [u8]) {
    if let Some((last, head)) = buf.split_last_mut() {
        hw.enable_fifo_read(fifo);
        for byte in head.iter_mut() {
            *byte = hw.read_fifo_byte();
        }
        *last = hw.read_last_fifo_byte(fifo);
        hw.disable_fifo_read(fifo);
    }
}

/// Push `bytes` into the FIFO of endpoint `fifo`. With `commit`, a data
/// endpoint's packet is handed to the controller for transmission; endpoint
/// 0 packets are committed by the control state machine instead.
pub(crate) fn write<H: UsbHardware>(hw: &H, fifo: u8, bytes: &[u8], commit: bool) {
    hw.enable_fifo_write(fifo);
    for byte in bytes.iter() {
        hw.write_fifo_byte(*byte);
    }
    hw.disable_fifo_write(fifo);

    if commit && fifo > 0 {
        hw.set_index(fifo);
        hw.in_set_packet_ready();
    }
}

/// Read the 8-byte SETUP packet waiting in the endpoint 0 FIFO.
pub(crate) fn read_setup<H: UsbHardware>(hw: &H) -> SetupPacket {
    let mut raw = [0; SETUP_PACKET_SIZE];
    read(hw, 0, &mut raw);
    SetupPacket::from_bytes(&raw)
}
