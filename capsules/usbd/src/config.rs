// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Configuration of the USB device engine.
//!
//! Two kinds of configuration exist:
//!
//! - Compile-time options, stored in the [`CONFIG`] constant. Cargo features
//!   only ever set values of this constant, so that every code path is still
//!   type-checked when an option is off, and the compiler folds the disabled
//!   paths away.
//!
//! - The endpoint layout of a particular device, described at run time by a
//!   [`DeviceConfig`]. The engine consumes the table uniformly, so adding an
//!   endpoint to a board does not touch the engine.

use crate::endpoint::EndpointAddress;
use crate::error::UsbError;

/// Data structure holding compile-time configuration options.
pub(crate) struct Config {
    /// Whether every SETUP packet and the result of its dispatch is traced.
    pub(crate) trace_requests: bool,

    /// Whether illegal use of the transfer API panics after being logged.
    ///
    /// Illegal usage (unknown endpoint, wrong direction) is a programming
    /// error, so it is surfaced loudly in debug builds. Release builds, and
    /// unit tests that check the `Illegal` return path, only log it.
    pub(crate) debug_panics: bool,
}

/// The unique instance of `Config`. This is the only place in the crate where
/// cargo features are consulted.
pub(crate) const CONFIG: Config = Config {
    trace_requests: cfg!(feature = "trace_requests"),
    debug_panics: cfg!(debug_assertions) && !cfg!(test) && !cfg!(feature = "no_debug_panics"),
};

/// Highest endpoint number supported by the engine.
pub const MAX_ENDPOINT_NUMBER: u8 = 7;

/// Maximum number of data endpoints (seven IN and seven OUT).
pub const MAX_DATA_ENDPOINTS: usize = 2 * MAX_ENDPOINT_NUMBER as usize;

/// Largest packet accepted on a bulk or interrupt endpoint at full speed.
pub const MAX_BULK_PACKET_SIZE: u16 = 64;

/// Largest packet accepted on an isochronous endpoint at full speed.
pub const MAX_ISO_PACKET_SIZE: u16 = 1023;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Static description of one data endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub address: EndpointAddress,
    pub max_packet_size: u16,
    pub transfer_type: TransferType,
}

impl EndpointConfig {
    pub const fn new(
        address: EndpointAddress,
        transfer_type: TransferType,
        max_packet_size: u16,
    ) -> Self {
        EndpointConfig {
            address,
            max_packet_size,
            transfer_type,
        }
    }

    pub fn is_isochronous(&self) -> bool {
        self.transfer_type == TransferType::Isochronous
    }

    fn validate(&self) -> Result<(), UsbError> {
        let number = self.address.number();
        if number == 0 || number > MAX_ENDPOINT_NUMBER {
            return Err(UsbError::Illegal);
        }
        let limit = match self.transfer_type {
            TransferType::Control => return Err(UsbError::Illegal),
            TransferType::Isochronous => MAX_ISO_PACKET_SIZE,
            TransferType::Bulk | TransferType::Interrupt => MAX_BULK_PACKET_SIZE,
        };
        if self.max_packet_size == 0 || self.max_packet_size > limit {
            return Err(UsbError::Illegal);
        }
        Ok(())
    }
}

/// Run-time description of the device.
#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig<'a> {
    /// Max packet size for endpoint 0. Must be 8, 16, 32 or 64.
    pub ep0_max_packet_size: u8,
    /// A bus-powered device always enters the Default state on a bus reset;
    /// a self-powered one only does so while VBUS is present.
    pub bus_powered: bool,
    /// When set, the USB interrupt is left disabled and the platform calls
    /// `handle_interrupt` from its main loop.
    pub polled: bool,
    /// Data endpoints in use. Endpoint 0 is implicit and must not appear.
    pub endpoints: &'a [EndpointConfig],
}

impl<'a> DeviceConfig<'a> {
    pub const fn new(endpoints: &'a [EndpointConfig]) -> Self {
        DeviceConfig {
            ep0_max_packet_size: 64,
            bus_powered: true,
            polled: false,
            endpoints,
        }
    }

    pub fn validate(&self) -> Result<(), UsbError> {
        if !matches!(self.ep0_max_packet_size, 8 | 16 | 32 | 64) {
            return Err(UsbError::Illegal);
        }
        if self.endpoints.len() > MAX_DATA_ENDPOINTS {
            return Err(UsbError::Illegal);
        }
        for (i, ep) in self.endpoints.iter().enumerate() {
            ep.validate()?;
            if self.endpoints[..i].iter().any(|e| e.address == ep.address) {
                return Err(UsbError::Illegal);
            }
        }
        Ok(())
    }

    /// Whether an OUT endpoint shares its number with an IN endpoint. FIFO
    /// controllers need to split the endpoint buffer in that case.
    pub(crate) fn is_split(&self, address: EndpointAddress) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.address.number() == address.number() && e.address != address)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const KEYBOARD: [EndpointConfig; 3] = [
        EndpointConfig::new(EndpointAddress::new_in(1), TransferType::Interrupt, 8),
        EndpointConfig::new(EndpointAddress::new_in(2), TransferType::Interrupt, 64),
        EndpointConfig::new(EndpointAddress::new_out(2), TransferType::Interrupt, 64),
    ];

    #[test]
    fn accepts_keyboard_layout() {
        let config = DeviceConfig::new(&KEYBOARD);
        assert_eq!(config.validate(), Ok(()));
        assert!(config.is_split(EndpointAddress::new_out(2)));
        assert!(!config.is_split(EndpointAddress::new_in(1)));
    }

    #[test]
    fn rejects_bad_layouts() {
        let control = [EndpointConfig::new(
            EndpointAddress::CONTROL,
            TransferType::Control,
            64,
        )];
        assert_eq!(DeviceConfig::new(&control).validate(), Err(UsbError::Illegal));

        let duplicate = [KEYBOARD[0], KEYBOARD[0]];
        assert_eq!(
            DeviceConfig::new(&duplicate).validate(),
            Err(UsbError::Illegal)
        );

        let too_big = [EndpointConfig::new(
            EndpointAddress::new_in(3),
            TransferType::Bulk,
            128,
        )];
        assert_eq!(DeviceConfig::new(&too_big).validate(), Err(UsbError::Illegal));

        let mut bad_ep0 = DeviceConfig::new(&KEYBOARD);
        bad_ep0.ep0_max_packet_size = 12;
        assert_eq!(bad_ep0.validate(), Err(UsbError::Illegal));
    }

    #[test]
    fn isochronous_endpoints_take_large_packets() {
        let iso = [EndpointConfig::new(
            EndpointAddress::new_in(3),
            TransferType::Isochronous,
            512,
        )];
        assert_eq!(DeviceConfig::new(&iso).validate(), Ok(()));
    }
}
