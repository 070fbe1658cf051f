// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! The USB device context and its public API.
//!
//! A [`UsbDevice`] owns the endpoint table and the chapter 9 device state.
//! Applications start transfers with [`UsbDevice::write`] and
//! [`UsbDevice::read`]; the platform feeds controller events in with
//! [`UsbDevice::handle_interrupt`], either from the USB interrupt vector or,
//! in polled mode, from its main loop.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let usb = static_init!(
//!     UsbDevice<'static, nrf52::usbd::Usbd<'static>>,
//!     UsbDevice::new(&peripherals.usbd, DEVICE_CONFIG, &DESCRIPTORS).unwrap()
//! );
//! usb.set_setup_hook(&HID_CLASS);
//! usb.set_client(keyboard);
//! usb.initialize();
//! ```

use crate::config::{DeviceConfig, CONFIG};
use crate::descriptors::DescriptorSource;
use crate::endpoint::{
    Buffer, EndpointAddress, EndpointState, EndpointTable, TransferBuffer, SCRATCH_SIZE,
};
use crate::error::{TransferStatus, UsbError};
use crate::hil::{Client, CommonInterrupt, InterruptStatus, SetupHook, UsbHardware};
use crate::setup::TransferDirection;

/// Chapter 9 device states.
///
/// The order of the variants matters: leaving the states at or above
/// `Suspended` for one below it aborts every transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    Attached,
    Default,
    Addressed,
    Suspended,
    Configured,
}

/// Masks the USB interrupt line while alive.
struct InterruptGuard<'h, H: UsbHardware> {
    hw: &'h H,
    was_enabled: bool,
}

impl<'h, H: UsbHardware> InterruptGuard<'h, H> {
    fn new(hw: &'h H) -> Self {
        let was_enabled = hw.mask_interrupt();
        InterruptGuard { hw, was_enabled }
    }
}

impl<H: UsbHardware> Drop for InterruptGuard<'_, H> {
    fn drop(&mut self) {
        self.hw.restore_interrupt(self.was_enabled);
    }
}

/// Restores the controller register context (endpoint index, register
/// page) when dropped.
struct ContextGuard<'h, H: UsbHardware> {
    hw: &'h H,
    context: Option<H::Context>,
}

impl<'h, H: UsbHardware> ContextGuard<'h, H> {
    fn new(hw: &'h H) -> Self {
        ContextGuard {
            hw,
            context: Some(hw.save_context()),
        }
    }
}

impl<H: UsbHardware> Drop for ContextGuard<'_, H> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.hw.restore_context(context);
        }
    }
}

pub struct UsbDevice<'a, H: UsbHardware> {
    pub(crate) hw: &'a H,
    pub(crate) config: DeviceConfig<'a>,
    pub(crate) descriptors: &'a dyn DescriptorSource,
    setup_hook: Option<&'a dyn SetupHook<'a>>,
    client: Option<&'a dyn Client>,
    pub(crate) endpoints: EndpointTable<'a>,
    /// Backing store for endpoint 0 replies built on the fly.
    pub(crate) scratch: [u8; SCRATCH_SIZE],
    state: DeviceState,
    /// State to return to when the bus resumes.
    saved_state: DeviceState,
    pub(crate) configuration: u8,
}

impl<'a, H: UsbHardware> UsbDevice<'a, H> {
    /// Create the device context. Fails with `Illegal` if `config` does not
    /// describe a valid endpoint layout.
    pub fn new(
        hw: &'a H,
        config: DeviceConfig<'a>,
        descriptors: &'a dyn DescriptorSource,
    ) -> Result<Self, UsbError> {
        config.validate()?;
        Ok(UsbDevice {
            hw,
            config,
            descriptors,
            setup_hook: None,
            client: None,
            endpoints: EndpointTable::new(&config),
            scratch: [0; SCRATCH_SIZE],
            state: DeviceState::Attached,
            saved_state: DeviceState::Attached,
            configuration: 0,
        })
    }

    pub fn set_client(&mut self, client: &'a dyn Client) {
        self.client = Some(client);
    }

    /// Install the class or vendor request handler consulted before the
    /// standard request dispatcher.
    pub fn set_setup_hook(&mut self, hook: &'a dyn SetupHook<'a>) {
        self.setup_hook = Some(hook);
    }

    pub(crate) fn setup_hook(&self) -> Option<&'a dyn SetupHook<'a>> {
        self.setup_hook
    }

    /// Bring up the controller and connect to the bus.
    pub fn initialize(&mut self) {
        self.hw.init(self.config.bus_powered);
        self.endpoints.reset();
        self.connect();

        let state = if self.config.bus_powered || self.hw.vbus_present() {
            DeviceState::Default
        } else {
            DeviceState::Attached
        };
        self.set_state(state);

        if !self.config.polled {
            self.hw.enable_interrupt();
        }
    }

    /// Signal the device to the host by enabling the pull-up resistor.
    pub fn connect(&mut self) {
        let _guard = InterruptGuard::new(self.hw);
        let ep0 = self.endpoints.ep0();
        ep0.state = EndpointState::Idle;
        ep0.flags.clear();
        self.hw.attach();
    }

    pub fn disconnect(&mut self) {
        let _guard = InterruptGuard::new(self.hw);
        self.hw.detach();
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Current configuration value, 0 while unconfigured.
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Start sending `buffer` on an IN endpoint (or endpoint 0).
    ///
    /// The buffer stays borrowed until the transfer ends; get it back with
    /// [`take_buffer`](UsbDevice::take_buffer). With `callback`, the client's
    /// `transfer_complete` is called when the transfer ends.
    pub fn write(
        &mut self,
        endpoint: EndpointAddress,
        buffer: &'a [u8],
        callback: bool,
    ) -> Result<(), UsbError> {
        let _guard = InterruptGuard::new(self.hw);
        let _context = ContextGuard::new(self.hw);

        let configured = self.state == DeviceState::Configured;
        let slot = self
            .endpoints
            .begin_transfer(
                endpoint,
                TransferDirection::DeviceToHost,
                Buffer::Tx(buffer),
                buffer.len(),
                callback,
                configured,
            )
            .map_err(|e| self.rejected("write", endpoint, e))?;

        let ep = self.endpoints.get_mut(slot);
        if slot == 0 || ep.is_isochronous() {
            // Picked up by the endpoint 0 handler or the next SOF.
            ep.flags.in_packet_pending = true;
        } else {
            self.write_in_packet(slot);
        }
        Ok(())
    }

    /// Start receiving into `buffer` from an OUT endpoint (or the data stage
    /// of a control write on endpoint 0).
    ///
    /// A packet that arrived before the receive was armed is picked up on
    /// the next SOF.
    pub fn read(
        &mut self,
        endpoint: EndpointAddress,
        buffer: &'a mut [u8],
        callback: bool,
    ) -> Result<(), UsbError> {
        let _guard = InterruptGuard::new(self.hw);

        let configured = self.state == DeviceState::Configured;
        let held = self
            .endpoints
            .slot(endpoint)
            .is_some_and(|slot| self.endpoints.get(slot).flags.out_packet_pending);
        let length = buffer.len();
        let slot = self
            .endpoints
            .begin_transfer(
                endpoint,
                TransferDirection::HostToDevice,
                Buffer::Rx(buffer),
                length,
                callback,
                configured,
            )
            .map_err(|e| self.rejected("read", endpoint, e))?;

        self.endpoints.get_mut(slot).flags.out_packet_pending = held;
        Ok(())
    }

    /// Cancel the transfer on a data endpoint. Does nothing if the endpoint
    /// is idle or not configured.
    pub fn abort(&mut self, endpoint: EndpointAddress) -> Result<(), UsbError> {
        let slot = match self.endpoints.slot(endpoint) {
            Some(slot) if slot != 0 => slot,
            _ => return Err(self.rejected("abort", endpoint, UsbError::Illegal)),
        };
        let _guard = InterruptGuard::new(self.hw);
        let _context = ContextGuard::new(self.hw);
        self.abort_slot(slot);
        Ok(())
    }

    /// Cancel the transfers on every data endpoint.
    pub fn abort_all(&mut self) {
        let _guard = InterruptGuard::new(self.hw);
        let _context = ContextGuard::new(self.hw);
        self.abort_data_endpoints();
    }

    /// Whether the endpoint has a transfer in progress, or cannot take one.
    /// Unknown endpoints are reported busy.
    pub fn is_busy(&self, endpoint: EndpointAddress) -> bool {
        !self
            .endpoints
            .slot(endpoint)
            .is_some_and(|slot| self.endpoints.get(slot).state == EndpointState::Idle)
    }

    /// Bytes not yet moved by the transfer on the endpoint.
    pub fn remaining(&self, endpoint: EndpointAddress) -> usize {
        self.endpoints
            .slot(endpoint)
            .map_or(0, |slot| self.endpoints.get(slot).remaining)
    }

    /// Get back the buffer of the last transfer on the endpoint. Returns
    /// `None` while a transfer is in progress.
    pub fn take_buffer(&mut self, endpoint: EndpointAddress) -> Option<TransferBuffer<'a>> {
        let _guard = InterruptGuard::new(self.hw);
        let slot = self.endpoints.slot(endpoint)?;
        let ep = self.endpoints.get_mut(slot);
        match ep.state {
            EndpointState::Transmitting | EndpointState::Receiving => None,
            _ => ep.take_buffer(),
        }
    }

    /// Process every pending controller event.
    pub fn handle_interrupt(&mut self) {
        let status = self.hw.interrupt_status();
        self.handle_events(status);
    }

    /// Process the controller events in `status`.
    ///
    /// Events are handled in a fixed order: SOF, endpoint 0, data endpoints,
    /// then bus reset, resume and suspend.
    pub fn handle_events(&mut self, status: InterruptStatus) {
        if status.is_empty() {
            return;
        }
        if let Some(client) = self.client {
            client.enter_handler();
        }

        {
            let _context = ContextGuard::new(self.hw);

            if status.common.is_set(CommonInterrupt::SOF) {
                self.handle_sof();
            }

            if status.ep0() {
                self.handle_ep0();
            }

            for slot in self.endpoints.data_slots() {
                let address = self.endpoints.get(slot).address;
                if address.is_in() {
                    if status.in_endpoint(address.number()) {
                        self.handle_in(slot);
                    }
                } else if status.out_endpoint(address.number()) {
                    self.handle_out(slot);
                }
            }

            if status.common.is_set(CommonInterrupt::RESET) {
                self.handle_reset();
            }
            if status.common.is_set(CommonInterrupt::RESUME) {
                self.handle_resume();
            }
            if status.common.is_set(CommonInterrupt::SUSPEND) {
                self.handle_suspend();
            }
        }

        if let Some(client) = self.client {
            client.exit_handler();
        }
    }

    /// Move the device to `new`.
    ///
    /// Falling from `Suspended` or `Configured` to a lower state aborts all
    /// transfers; entering `Suspended` remembers the state to resume to.
    pub(crate) fn set_state(&mut self, new: DeviceState) {
        let old = self.state;

        if old >= DeviceState::Suspended && new < DeviceState::Suspended {
            self.abort_data_endpoints();
        }
        if new == DeviceState::Suspended && old != DeviceState::Suspended {
            self.saved_state = old;
        }
        self.state = new;

        if old != new {
            log::debug!("usbd: {:?} -> {:?}", old, new);
            if let Some(client) = self.client {
                client.state_changed(old, new);
            }
        }
    }

    /// Mark the transfer on `slot` as finished and report it.
    pub(crate) fn finish(&mut self, slot: usize, status: TransferStatus) {
        self.endpoints.get_mut(slot).state = EndpointState::Idle;
        self.notify(slot, status);
        self.endpoints.get_mut(slot).flags.callback = false;
    }

    /// Report the transfer on `slot` to the client if it asked for it.
    pub(crate) fn notify(&self, slot: usize, status: TransferStatus) {
        let ep = self.endpoints.get(slot);
        if !ep.flags.callback {
            return;
        }
        if let Some(client) = self.client {
            client.transfer_complete(ep.address, status, ep.position, ep.remaining);
        }
    }

    fn abort_slot(&mut self, slot: usize) {
        let hw = self.hw;
        let ep = self.endpoints.get_mut(slot);
        match ep.state {
            EndpointState::Idle | EndpointState::Halted => {}
            _ => {
                if ep.address.is_in() {
                    hw.abort_in_endpoint(ep.address.number());
                } else {
                    hw.abort_out_endpoint(ep.address.number());
                }
                ep.abort();
            }
        }
    }

    pub(crate) fn abort_data_endpoints(&mut self) {
        for slot in self.endpoints.data_slots() {
            self.abort_slot(slot);
        }
    }

    /// Log an API call that was turned down. Illegal usage is a bug in the
    /// caller and panics in debug builds.
    fn rejected(&self, operation: &str, endpoint: EndpointAddress, error: UsbError) -> UsbError {
        if error == UsbError::Illegal {
            log::error!("usbd: illegal {} on {:?}", operation, endpoint);
            if CONFIG.debug_panics {
                panic!("usbd: illegal {} on {:?}", operation, endpoint);
            }
        } else {
            log::debug!("usbd: {} on {:?} refused: {:?}", operation, endpoint, error);
        }
        error
    }

    fn handle_sof(&mut self) {
        if let Some(client) = self.client {
            client.start_of_frame(self.hw.frame_number());
        }

        let ep0 = self.endpoints.get(0);
        if (ep0.flags.out_packet_pending && ep0.state == EndpointState::Receiving)
            || (ep0.flags.in_packet_pending && ep0.state == EndpointState::Transmitting)
        {
            self.handle_ep0();
        }

        for slot in self.endpoints.data_slots() {
            let ep = self.endpoints.get(slot);
            if ep.address.is_in() {
                if ep.is_isochronous()
                    && ep.flags.in_packet_pending
                    && ep.state == EndpointState::Transmitting
                {
                    self.write_in_packet(slot);
                }
            } else if ep.flags.out_packet_pending && ep.state == EndpointState::Receiving {
                self.handle_out(slot);
            }
        }
    }

    fn handle_reset(&mut self) {
        let state = if self.config.bus_powered || self.hw.vbus_present() {
            DeviceState::Default
        } else {
            DeviceState::Attached
        };
        self.configuration = 0;
        self.set_state(state);
        self.endpoints.reset();
        self.hw.reset_complete();

        log::debug!("usbd: bus reset");
        if let Some(client) = self.client {
            client.bus_reset();
        }
    }

    fn handle_suspend(&mut self) {
        if self.state >= DeviceState::Default && self.state != DeviceState::Suspended {
            self.set_state(DeviceState::Suspended);
            self.hw.suspend();
        }
    }

    fn handle_resume(&mut self) {
        if self.state == DeviceState::Suspended {
            self.hw.resume();
            self.set_state(self.saved_state);
        }
    }
}
