// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Power management, USB supply detection only.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

use crate::static_ref::StaticRef;

const POWER_BASE: StaticRef<PowerRegisters> =
    unsafe { StaticRef::new(0x40000000 as *const PowerRegisters) };

register_structs! {
    PowerRegisters {
        (0x000 => _reserved0),
        /// Voltage supply detected on VBUS
        (0x11C => event_usbdetected: ReadWrite<u32, Event::Register>),
        /// Voltage supply removed from VBUS
        (0x120 => event_usbremoved: ReadWrite<u32, Event::Register>),
        /// USB 3.3V supply ready
        (0x124 => event_usbpwrrdy: ReadWrite<u32, Event::Register>),
        (0x128 => _reserved1),
        /// Enable interrupt
        (0x304 => intenset: ReadWrite<u32, Interrupt::Register>),
        /// Disable interrupt
        (0x308 => intenclr: ReadWrite<u32, Interrupt::Register>),
        (0x30C => _reserved2),
        /// USB supply status
        (0x438 => usbregstatus: ReadOnly<u32, UsbRegStatus::Register>),
        (0x43C => @END),
    }
}

register_bitfields! [u32,
    /// Read event
    Event [
        READY OFFSET(0) NUMBITS(1)
    ],

    /// Power management Interrupts
    Interrupt [
        USBDETECTED OFFSET(7) NUMBITS(1),
        USBREMOVED OFFSET(8) NUMBITS(1),
        USBPWRRDY OFFSET(9) NUMBITS(1)
    ],

    UsbRegStatus [
        VBUSDETECT OFFSET(0) NUMBITS(1),
        OUTPUTRDY OFFSET(1) NUMBITS(1)
    ]
];

/// USB supply events, in the order they occur when a cable is plugged in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbPowerEvent {
    /// VBUS went above the detection threshold.
    Detected,
    /// The USB regulator output is stable.
    Ready,
    /// VBUS went away.
    Removed,
}

pub struct Power {
    registers: StaticRef<PowerRegisters>,
}

impl Power {
    pub const fn new() -> Self {
        Power {
            registers: POWER_BASE,
        }
    }

    /// Raise the POWER_CLOCK interrupt on USB supply changes.
    pub fn enable_usb_interrupts(&self) {
        self.registers.intenset.write(
            Interrupt::USBDETECTED::SET + Interrupt::USBREMOVED::SET + Interrupt::USBPWRRDY::SET,
        );
    }

    pub fn disable_usb_interrupts(&self) {
        self.registers.intenclr.write(
            Interrupt::USBDETECTED::SET + Interrupt::USBREMOVED::SET + Interrupt::USBPWRRDY::SET,
        );
    }

    /// Consume the next pending USB supply event.
    pub fn take_usb_event(&self) -> Option<UsbPowerEvent> {
        let regs = &*self.registers;
        let events = [
            (&regs.event_usbdetected, UsbPowerEvent::Detected),
            (&regs.event_usbpwrrdy, UsbPowerEvent::Ready),
            (&regs.event_usbremoved, UsbPowerEvent::Removed),
        ];
        for (register, event) in events {
            if register.is_set(Event::READY) {
                register.write(Event::READY::CLEAR);
                return Some(event);
            }
        }
        None
    }

    pub fn is_vbus_present(&self) -> bool {
        self.registers.usbregstatus.is_set(UsbRegStatus::VBUSDETECT)
    }

    pub fn is_usb_supply_ready(&self) -> bool {
        self.registers.usbregstatus.is_set(UsbRegStatus::OUTPUTRDY)
    }
}
