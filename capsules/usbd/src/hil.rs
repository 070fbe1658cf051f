// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Interfaces between the USB device engine and its collaborators.
//!
//! - [`UsbHardware`] is implemented by a chip crate for its USB device
//!   controller.
//! - [`SetupHook`] is implemented by class drivers (HID, vendor protocols)
//!   that answer control requests before the standard dispatcher sees them.
//! - [`Client`] receives notifications; every method has an empty default.

use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::config::EndpointConfig;
use crate::device::DeviceState;
use crate::endpoint::{ControlEndpoint, EndpointAddress};
use crate::error::{RequestStatus, TransferStatus};

register_bitfields![u8,
    /// Device-wide interrupt sources.
    pub CommonInterrupt [
        SUSPEND OFFSET(0) NUMBITS(1),
        RESUME OFFSET(1) NUMBITS(1),
        RESET OFFSET(2) NUMBITS(1),
        SOF OFFSET(3) NUMBITS(1)
    ]
];

/// A snapshot of the pending interrupt sources of the controller.
///
/// `in_endpoints` has bit 0 set for endpoint 0 and bit `n` for IN endpoint
/// `n`; `out_endpoints` has bit `n` set for OUT endpoint `n`. Endpoint 0
/// events of both directions are reported through `in_endpoints`.
#[derive(Clone, Copy)]
pub struct InterruptStatus {
    pub common: LocalRegisterCopy<u8, CommonInterrupt::Register>,
    pub in_endpoints: u8,
    pub out_endpoints: u8,
}

impl InterruptStatus {
    pub const fn new(common: u8, in_endpoints: u8, out_endpoints: u8) -> Self {
        InterruptStatus {
            common: LocalRegisterCopy::new(common),
            in_endpoints,
            out_endpoints,
        }
    }

    pub fn empty() -> Self {
        InterruptStatus::new(0, 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.common.get() == 0 && self.in_endpoints == 0 && self.out_endpoints == 0
    }

    pub fn ep0(&self) -> bool {
        self.in_endpoints & 1 != 0
    }

    pub fn set_ep0(&mut self) {
        self.in_endpoints |= 1;
    }

    pub fn in_endpoint(&self, number: u8) -> bool {
        number != 0 && self.in_endpoints & (1 << number) != 0
    }

    pub fn set_in_endpoint(&mut self, number: u8) {
        self.in_endpoints |= 1 << number;
    }

    pub fn out_endpoint(&self, number: u8) -> bool {
        number != 0 && self.out_endpoints & (1 << number) != 0
    }

    pub fn set_out_endpoint(&mut self, number: u8) {
        self.out_endpoints |= 1 << number;
    }
}

/// A USB device controller with per-endpoint FIFOs selected through an
/// index register.
///
/// Methods documented as operating on "the selected endpoint" act on the
/// endpoint last passed to [`set_index`](UsbHardware::set_index). The engine
/// selects index 0 before using any `ep0_*` method.
pub trait UsbHardware {
    /// Register context saved and restored around engine entry points, for
    /// controllers whose registers are banked (pages, index register).
    type Context;

    /// Bring up the controller: clocks, full speed, VBUS detection (for
    /// self-powered devices), a forced reset and device interrupt sources.
    /// Does not enable the USB interrupt line.
    fn init(&self, bus_powered: bool);

    /// Connect the pull-up resistor and enable the transceiver.
    fn attach(&self);

    /// Disconnect the pull-up resistor.
    fn detach(&self);

    fn vbus_present(&self) -> bool;

    /// Re-arm the configuration lost by a bus reset (suspend detection,
    /// device interrupt sources).
    fn reset_complete(&self);

    /// Enter low-power mode after the bus was suspended.
    fn suspend(&self);

    /// Leave low-power mode.
    fn resume(&self);

    /// Load the device address. Called after a successful SET_ADDRESS.
    fn set_address(&self, address: u8);

    /// Enable the USB interrupt line.
    fn enable_interrupt(&self);

    /// Disable the USB interrupt line, returning whether it was enabled.
    fn mask_interrupt(&self) -> bool;

    /// Re-enable the USB interrupt line if `was_enabled`.
    fn restore_interrupt(&self, was_enabled: bool);

    fn save_context(&self) -> Self::Context;

    fn restore_context(&self, context: Self::Context);

    /// Read and clear the pending interrupt sources.
    fn interrupt_status(&self) -> InterruptStatus;

    fn frame_number(&self) -> u16;

    fn index(&self) -> u8;

    fn set_index(&self, index: u8);

    fn enable_fifo_read(&self, fifo: u8);

    fn read_fifo_byte(&self) -> u8;

    /// Read the final byte of a packet. Some controllers need this to latch
    /// the end of the read.
    fn read_last_fifo_byte(&self, fifo: u8) -> u8;

    fn disable_fifo_read(&self, fifo: u8);

    fn enable_fifo_write(&self, fifo: u8);

    fn write_fifo_byte(&self, byte: u8);

    fn disable_fifo_write(&self, fifo: u8);

    fn ep0_sent_stall(&self) -> bool;

    fn ep0_clear_sent_stall(&self);

    /// The host ended a control transfer before its data stage completed.
    fn ep0_setup_end(&self) -> bool;

    fn ep0_serviced_setup_end(&self);

    fn ep0_out_packet_ready(&self) -> bool;

    /// A packet previously committed to the endpoint 0 FIFO has not been
    /// sent yet.
    fn ep0_in_packet_ready(&self) -> bool;

    /// Byte count of the packet waiting in the endpoint 0 FIFO.
    fn ep0_count(&self) -> usize;

    /// Release the received packet; more data stage packets follow.
    fn ep0_serviced_out_packet(&self);

    /// Release the received packet and end the data stage (DataEnd).
    fn ep0_serviced_last_out_packet(&self);

    fn ep0_set_in_packet_ready(&self);

    /// Commit the last packet of the data stage (InPacketReady + DataEnd).
    fn ep0_set_last_in_packet_ready(&self);

    /// Release the SETUP packet and answer the request with a STALL.
    fn ep0_send_stall(&self);

    fn in_sent_stall(&self) -> bool;

    fn in_clear_sent_stall(&self);

    /// Commit the packet written to the selected IN endpoint.
    fn in_set_packet_ready(&self);

    fn out_sent_stall(&self) -> bool;

    fn out_clear_sent_stall(&self);

    fn out_packet_ready(&self) -> bool;

    /// Byte count of the packet waiting in the selected OUT endpoint.
    fn out_count(&self) -> usize;

    fn out_clear_packet_ready(&self);

    /// Enable a data endpoint and reset its data toggle. `split` is set when
    /// the IN and OUT endpoints of the same number are both in use.
    fn activate_endpoint(&self, endpoint: &EndpointConfig, split: bool);

    /// Flush IN endpoint `number` and cancel any committed packet.
    fn abort_in_endpoint(&self, number: u8);

    /// Flush OUT endpoint `number`.
    fn abort_out_endpoint(&self, number: u8);
}

/// Handler for class and vendor control requests.
pub trait SetupHook<'a> {
    /// Handle the request in `ep0.setup()`.
    ///
    /// Return `Unhandled` to let the standard dispatcher look at the request,
    /// `RequestError` to stall it, or `Ok` after arming the data stage (if
    /// the request has one) on `ep0`.
    fn setup(&self, ep0: &mut ControlEndpoint<'_, 'a>) -> RequestStatus;
}

/// Notifications from the USB device engine.
pub trait Client {
    /// A transfer armed with a callback request ended. `transferred` counts
    /// the bytes moved by the whole transfer.
    fn transfer_complete(
        &self,
        _endpoint: EndpointAddress,
        _status: TransferStatus,
        _transferred: usize,
        _remaining: usize,
    ) {
    }

    fn state_changed(&self, _old: DeviceState, _new: DeviceState) {}

    fn bus_reset(&self) {}

    fn start_of_frame(&self, _frame: u16) {}

    /// Called before the engine processes interrupt sources.
    fn enter_handler(&self) {}

    /// Called after the engine processed interrupt sources.
    fn exit_handler(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interrupt_status_bits() {
        let mut status = InterruptStatus::empty();
        assert!(status.is_empty());
        status.set_ep0();
        status.set_in_endpoint(2);
        status.set_out_endpoint(3);
        assert!(status.ep0());
        assert!(status.in_endpoint(2));
        assert!(!status.in_endpoint(0));
        assert!(status.out_endpoint(3));
        assert!(!status.out_endpoint(2));

        let mut status = InterruptStatus::new(0, 0, 0);
        status.common.modify(CommonInterrupt::SOF::SET);
        assert!(status.common.is_set(CommonInterrupt::SOF));
        assert!(!status.common.is_set(CommonInterrupt::RESET));
        assert!(!status.is_empty());
    }
}
