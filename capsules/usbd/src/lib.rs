// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Device-side USB transfer engine for FIFO-style USB device controllers.
//!
//! The engine owns the chapter 9 device state machine, the endpoint 0
//! control-transfer sequencing and the packet pumps for the IN and OUT data
//! endpoints of a keyboard-class device. It sits on top of a
//! [`hil::UsbHardware`] implementation that exposes the controller as an
//! indexed set of endpoint FIFOs, and is driven from the USB interrupt vector
//! (or a polling loop) through [`device::UsbDevice::handle_interrupt`].
//!
//! ```text
//!            application                     platform
//!   write/read/abort/is_busy          interrupt vector / main loop
//!                 |                               |
//!                 v                               v
//!   +-------------------------------------------------------+
//!   |                  device::UsbDevice                    |
//!   |   request.rs   ctrl.rs (EP0)   data.rs (EP1..EP7)     |
//!   |                endpoint.rs      fifo.rs               |
//!   +-------------------------------------------------------+
//!                 |                               |
//!     descriptors::DescriptorSource       hil::UsbHardware
//! ```
//!
//! Class and vendor requests are answered by an optional
//! [`hil::SetupHook`], consulted before the standard request dispatcher. The
//! [`hid`] module provides the hook used by HID keyboards.

#![no_std]

pub mod config;
mod ctrl;
mod data;
pub mod descriptors;
pub mod device;
pub mod endpoint;
pub mod error;
mod fifo;
pub mod hid;
pub mod hil;
mod request;
pub mod setup;

// This is used to run the tests on a host
#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(test)]
mod test;

pub use crate::config::{DeviceConfig, EndpointConfig, TransferType};
pub use crate::device::{DeviceState, UsbDevice};
pub use crate::endpoint::EndpointAddress;
pub use crate::error::{RequestStatus, TransferStatus, UsbError};
