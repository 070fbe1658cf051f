// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Factory Information Configuration Registers (FICR)
//!
//! Factory information configuration registers (FICR) are pre-programmed in
//! factory and cannot be erased by the user. Only the device identifier is
//! used here, as the unique id behind the USB serial number.

use tock_registers::interfaces::Readable;
use tock_registers::registers::ReadOnly;
use tock_registers::register_structs;

use crate::static_ref::StaticRef;

const FICR_BASE: StaticRef<FicrRegisters> =
    unsafe { StaticRef::new(0x10000000 as *const FicrRegisters) };

register_structs! {
    FicrRegisters {
        (0x000 => _reserved0),
        /// Device identifier
        (0x060 => deviceid0: ReadOnly<u32>),
        /// Device identifier
        (0x064 => deviceid1: ReadOnly<u32>),
        (0x068 => @END),
    }
}

/// Length of the device identifier in bytes.
pub const DEVICE_ID_LEN: usize = 8;

pub struct Ficr {
    registers: StaticRef<FicrRegisters>,
}

impl Ficr {
    pub const fn new() -> Self {
        Ficr {
            registers: FICR_BASE,
        }
    }

    /// The 64-bit factory device identifier, low word first.
    pub fn device_id(&self) -> [u8; DEVICE_ID_LEN] {
        device_id_bytes(self.registers.deviceid0.get(), self.registers.deviceid1.get())
    }
}

fn device_id_bytes(low: u32, high: u32) -> [u8; DEVICE_ID_LEN] {
    let mut id = [0; DEVICE_ID_LEN];
    id[..4].copy_from_slice(&low.to_le_bytes());
    id[4..].copy_from_slice(&high.to_le_bytes());
    id
}
