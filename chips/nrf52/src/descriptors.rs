// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Descriptor source that takes the unique id from the FICR.

use capsules_usbd::descriptors::DescriptorSource;

use crate::ficr::{Ficr, DEVICE_ID_LEN};

/// Wraps the board's descriptors and reports the factory device id as the
/// unique id, so every chip enumerates with its own serial number.
pub struct ChipDescriptors<'a> {
    descriptors: &'a dyn DescriptorSource,
    device_id: [u8; DEVICE_ID_LEN],
}

impl<'a> ChipDescriptors<'a> {
    pub fn new(descriptors: &'a dyn DescriptorSource, ficr: &Ficr) -> Self {
        ChipDescriptors {
            descriptors,
            device_id: ficr.device_id(),
        }
    }
}

impl DescriptorSource for ChipDescriptors<'_> {
    fn device_descriptor(&self) -> &[u8] {
        self.descriptors.device_descriptor()
    }

    fn configuration_descriptor(&self) -> &[u8] {
        self.descriptors.configuration_descriptor()
    }

    fn configuration_value(&self) -> u8 {
        self.descriptors.configuration_value()
    }

    fn string_descriptor(&self, index: u8) -> Option<&[u8]> {
        self.descriptors.string_descriptor(index)
    }

    fn product_name(&self) -> Option<&[u8]> {
        self.descriptors.product_name()
    }

    fn unique_id(&self) -> &[u8] {
        &self.device_id
    }
}
