// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! nRF52840 USB device port of `capsules-usbd`.
//!
//! [`usbd::Usbd`] presents the EasyDMA based USBD peripheral as the
//! FIFO-style controller the transfer engine drives. [`power::Power`]
//! reports the USB supply events that power the peripheral up and down, and
//! [`descriptors::ChipDescriptors`] reports the factory device id as the
//! unique id behind the serial number string.

#![no_std]
#![crate_name = "nrf52"]
#![crate_type = "rlib"]
#![recursion_limit = "256"]

pub mod descriptors;
pub mod ficr;
pub mod nvic;
pub mod power;
mod static_ref;
pub mod usbd;

pub use crate::static_ref::StaticRef;
