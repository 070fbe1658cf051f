// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Control transfer state machine for endpoint 0.
//!
//! One pass of [`UsbDevice::handle_ep0`] looks at the endpoint 0 status in a
//! fixed order:
//!
//! 1. A stall that went out, or a transfer the host abandoned (SetupEnd),
//!    returns the endpoint to idle.
//! 2. A received packet is either a SETUP packet (when idle), the next
//!    packet of a control write's data stage (when receiving), or held in
//!    the FIFO for later.
//! 3. When transmitting and the FIFO is free, the next packet of a control
//!    read's data stage is loaded.
//!
//! Data stages that are an exact multiple of the packet size end with a
//! zero-length packet in both directions.

use crate::config::CONFIG;
use crate::device::UsbDevice;
use crate::endpoint::{ControlEndpoint, EndpointState};
use crate::error::{RequestStatus, TransferStatus};
use crate::fifo;
use crate::hil::UsbHardware;
use crate::setup::{RequestType, SetupPacket, TransferDirection};

impl<'a, H: UsbHardware> UsbDevice<'a, H> {
    pub(crate) fn handle_ep0(&mut self) {
        let hw = self.hw;
        hw.set_index(0);

        let sent_stall = hw.ep0_sent_stall();
        let setup_end = hw.ep0_setup_end();
        if sent_stall || setup_end {
            if sent_stall {
                hw.ep0_clear_sent_stall();
            }
            if setup_end {
                hw.ep0_serviced_setup_end();
            }
            let ep0 = self.endpoints.ep0();
            ep0.state = EndpointState::Idle;
            ep0.flags.clear();
        }

        if hw.ep0_out_packet_ready() {
            let ep0 = self.endpoints.ep0();
            if ep0.flags.wait_for_read {
                ep0.flags.out_packet_pending = true;
            } else if ep0.state == EndpointState::Idle {
                self.handle_setup();
            } else if ep0.state == EndpointState::Receiving {
                self.ep0_rx();
            } else {
                ep0.flags.out_packet_pending = true;
            }
        }

        if self.endpoints.get(0).state == EndpointState::Transmitting && !hw.ep0_in_packet_ready()
        {
            self.ep0_tx();
        }
    }

    fn handle_setup(&mut self) {
        let hw = self.hw;
        let setup = fifo::read_setup(hw);

        let status = self.dispatch_setup(setup);
        if CONFIG.trace_requests {
            log::trace!("usbd: {:?} -> {:?}", setup, status);
        }

        hw.set_index(0);
        let ep0 = self.endpoints.ep0();
        match status {
            RequestStatus::Ok if setup.length == 0 => {
                // No data stage: go straight to the status stage.
                hw.ep0_serviced_last_out_packet();
                ep0.state = EndpointState::Idle;
            }
            RequestStatus::Ok => {
                hw.ep0_serviced_out_packet();
                if setup.request_type.transfer_direction() == TransferDirection::HostToDevice
                    && ep0.state != EndpointState::Receiving
                {
                    ep0.flags.wait_for_read = true;
                }
            }
            RequestStatus::RequestError | RequestStatus::Unhandled => {
                log::warn!("usbd: stalling request {:?}", setup);
                hw.ep0_send_stall();
                ep0.state = EndpointState::Stalled;
            }
        }
    }

    /// Offer the request to the setup hook, then to the standard request
    /// dispatcher.
    fn dispatch_setup(&mut self, setup: SetupPacket) -> RequestStatus {
        let mut status = RequestStatus::Unhandled;
        if let Some(hook) = self.setup_hook() {
            let mut ep0 = ControlEndpoint {
                endpoint: self.endpoints.ep0(),
                scratch: &mut self.scratch,
                setup,
            };
            status = hook.setup(&mut ep0);
        }
        if status == RequestStatus::Unhandled
            && setup.request_type.request_type() == RequestType::Standard
        {
            status = self.standard_request(&setup);
        }
        status
    }

    fn ep0_tx(&mut self) {
        let hw = self.hw;
        let ep0 = self.endpoints.ep0();
        let count = ep0.remaining.min(ep0.max_packet_size);
        fifo::write(hw, 0, ep0.tx_chunk(&self.scratch, count), false);
        ep0.advance(count);
        ep0.flags.in_packet_pending = false;

        if ep0.remaining == 0 && count != ep0.max_packet_size {
            hw.ep0_set_last_in_packet_ready();
            self.finish(0, TransferStatus::Ok);
            self.endpoints.ep0().flags.clear();
        } else {
            // A full last packet is followed by a zero-length one on the
            // next pass.
            hw.ep0_set_in_packet_ready();
        }
    }

    fn ep0_rx(&mut self) {
        let hw = self.hw;
        let count = hw.ep0_count();
        let ep0 = self.endpoints.ep0();

        if count > ep0.remaining {
            // Leave the packet in the FIFO; the host is NAKed until the
            // endpoint is serviced.
            ep0.flags.out_packet_pending = true;
            log::warn!("usbd: EP0 overrun, {} > {}", count, ep0.remaining);
            self.finish(0, TransferStatus::RxBufferOverrun);
            return;
        }

        if let Some(chunk) = ep0.rx_chunk(&mut self.scratch, count) {
            fifo::read(hw, 0, chunk);
        }
        ep0.advance(count);
        ep0.flags.out_packet_pending = false;

        if ep0.remaining == 0 && count != ep0.max_packet_size {
            hw.ep0_serviced_last_out_packet();
            self.finish(0, TransferStatus::Ok);
        } else {
            hw.ep0_serviced_out_packet();
        }
    }
}
