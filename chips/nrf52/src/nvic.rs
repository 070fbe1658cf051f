// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Cortex-M NVIC, reduced to masking a single interrupt line.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::register_structs;

use crate::static_ref::StaticRef;

register_structs! {
    /// NVIC Registers.
    NvicRegisters {
        (0x000 => _reserved0),

        /// Interrupt Set-Enable Registers
        (0x100 => iser: [ReadWrite<u32>; 32]),

        /// Interrupt Clear-Enable Registers
        (0x180 => icer: [ReadWrite<u32>; 32]),

        (0x200 => _reserved1),

        /// Interrupt Clear-Pending Registers
        (0x280 => icpr: [ReadWrite<u32>; 32]),

        (0x300 => @END),
    }
}

/// The NVIC peripheral in MMIO space.
const NVIC: StaticRef<NvicRegisters> =
    unsafe { StaticRef::new(0xe000e000 as *const NvicRegisters) };

/// Interrupt number of the USBD peripheral.
pub const USBD_IRQ: u32 = 39;

/// An opaque wrapper for a single NVIC interrupt.
///
/// Hand these out to low-level drivers to let them control their own
/// interrupts but not others.
pub struct Nvic(u32);

impl Nvic {
    /// Creates a new `Nvic`
    ///
    /// Marked unsafe because only chip/platform configuration code should be
    /// able to create these.
    pub const unsafe fn new(idx: u32) -> Nvic {
        Nvic(idx)
    }

    fn bank(&self) -> usize {
        self.0 as usize / 32
    }

    fn bit(&self) -> u32 {
        1 << (self.0 & 31)
    }

    /// Enable the interrupt
    pub fn enable(&self) {
        NVIC.iser[self.bank()].set(self.bit());
    }

    /// Disable the interrupt
    pub fn disable(&self) {
        NVIC.icer[self.bank()].set(self.bit());
    }

    pub fn is_enabled(&self) -> bool {
        NVIC.iser[self.bank()].get() & self.bit() != 0
    }

    /// Clear pending state
    pub fn clear_pending(&self) {
        NVIC.icpr[self.bank()].set(self.bit());
    }
}
