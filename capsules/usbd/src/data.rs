// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Packet pumps for the IN and OUT data endpoints.
//!
//! Unlike endpoint 0, data endpoints never send or expect a zero-length
//! packet after a transfer that is an exact multiple of the packet size. An
//! OUT transfer ends when the buffer is full or a short packet arrives.

use crate::device::UsbDevice;
use crate::endpoint::EndpointState;
use crate::error::TransferStatus;
use crate::fifo;
use crate::hil::UsbHardware;

impl<'a, H: UsbHardware> UsbDevice<'a, H> {
    /// Load the next packet of the transfer on IN endpoint `slot` and hand
    /// it to the controller.
    pub(crate) fn write_in_packet(&mut self, slot: usize) {
        let hw = self.hw;
        let ep = self.endpoints.get_mut(slot);
        let count = ep.remaining.min(ep.max_packet_size);
        fifo::write(hw, ep.address.number(), ep.tx_chunk(&[], count), true);
        ep.flags.in_packet_pending = false;
    }

    /// The controller finished sending a packet on IN endpoint `slot`.
    pub(crate) fn handle_in(&mut self, slot: usize) {
        let hw = self.hw;
        let ep = self.endpoints.get_mut(slot);
        hw.set_index(ep.address.number());

        if hw.in_sent_stall() {
            hw.in_clear_sent_stall();
        } else if ep.state == EndpointState::Transmitting {
            let sent = ep.remaining.min(ep.max_packet_size);
            ep.advance(sent);
            if ep.remaining > 0 {
                self.write_in_packet(slot);
            } else {
                self.finish(slot, TransferStatus::Ok);
            }
        }
    }

    /// A packet arrived on OUT endpoint `slot`, or one held earlier can now
    /// be consumed.
    pub(crate) fn handle_out(&mut self, slot: usize) {
        let hw = self.hw;
        let ep = self.endpoints.get_mut(slot);
        let number = ep.address.number();
        hw.set_index(number);

        if hw.out_sent_stall() {
            hw.out_clear_sent_stall();
            return;
        }
        if !hw.out_packet_ready() {
            return;
        }

        if ep.state != EndpointState::Receiving {
            ep.flags.out_packet_pending = true;
            log::warn!("usbd: unexpected packet on {:?}", ep.address);
            self.notify(slot, TransferStatus::EndpointError);
            return;
        }

        let count = hw.out_count();
        if count > ep.remaining {
            ep.flags.out_packet_pending = true;
            log::warn!(
                "usbd: {:?} overrun, {} > {}",
                ep.address,
                count,
                ep.remaining
            );
            self.finish(slot, TransferStatus::RxBufferOverrun);
            return;
        }

        if let Some(chunk) = ep.rx_chunk(&mut [0u8; 0], count) {
            fifo::read(hw, number, chunk);
        }
        ep.advance(count);
        let complete = ep.remaining == 0 || count != ep.max_packet_size;
        ep.flags.out_packet_pending = false;
        hw.set_index(number);
        hw.out_clear_packet_ready();

        if complete {
            self.finish(slot, TransferStatus::Ok);
        }
    }
}
