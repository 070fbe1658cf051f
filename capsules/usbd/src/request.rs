// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Standard request dispatcher.
//!
//! Only the requests needed to enumerate a single-configuration device are
//! answered: SET_ADDRESS, GET_DESCRIPTOR and SET_CONFIGURATION. Every other
//! standard request is refused, and endpoint 0 stalls.

use crate::descriptors::{self, DescriptorType, STRING_PRODUCT, STRING_SERIAL};
use crate::device::{DeviceState, UsbDevice};
use crate::endpoint::{Buffer, EndpointState};
use crate::error::RequestStatus;
use crate::hil::UsbHardware;
use crate::setup::{Recipient, SetupPacket, StandardRequest};

/// `bmRequestType` of a GET_DESCRIPTOR request for a device descriptor.
const GET_DEVICE_DESCRIPTOR: u8 = 0x80;

/// Where the data stage of a GET_DESCRIPTOR reply comes from.
enum Reply<'a> {
    Static(&'a [u8]),
    Scratch(usize),
}

impl<'a, H: UsbHardware> UsbDevice<'a, H> {
    pub(crate) fn standard_request(&mut self, setup: &SetupPacket) -> RequestStatus {
        match setup.standard_request() {
            Some(StandardRequest::SetAddress) => self.set_address(setup),
            Some(StandardRequest::GetDescriptor) => self.get_descriptor(setup),
            Some(StandardRequest::SetConfiguration) => self.set_configuration(setup),
            _ => RequestStatus::RequestError,
        }
    }

    fn set_address(&mut self, setup: &SetupPacket) -> RequestStatus {
        if setup.value >= 128
            || setup.length != 0
            || setup.index != 0
            || setup.request_type.recipient() != Recipient::Device
        {
            return RequestStatus::RequestError;
        }

        let address = setup.value as u8;
        match self.state() {
            DeviceState::Default => {
                if address != 0 {
                    self.set_state(DeviceState::Addressed);
                }
            }
            DeviceState::Addressed => {
                if address == 0 {
                    self.set_state(DeviceState::Default);
                }
            }
            _ => return RequestStatus::RequestError,
        }
        self.hw.set_address(address);
        RequestStatus::Ok
    }

    fn get_descriptor(&mut self, setup: &SetupPacket) -> RequestStatus {
        if setup.request_type.0 != GET_DEVICE_DESCRIPTOR {
            return RequestStatus::RequestError;
        }

        let descriptors: &'a dyn descriptors::DescriptorSource = self.descriptors;
        let index = setup.descriptor_index();
        let reply = match DescriptorType::from_u8(setup.descriptor_type()) {
            Some(DescriptorType::Device) if index == 0 => {
                Some(Reply::Static(descriptors.device_descriptor()))
            }
            Some(DescriptorType::Configuration) if index == 0 => {
                Some(Reply::Static(descriptors.configuration_descriptor()))
            }
            Some(DescriptorType::String) => match index {
                STRING_PRODUCT => descriptors.product_name().and_then(|storage| {
                    // The length byte comes from persisted settings; don't
                    // trust it to stay inside the storage.
                    let len = *storage.first()? as usize;
                    if len < 2 || len > storage.len() {
                        log::warn!("usbd: corrupt product name ({} bytes)", len);
                        None
                    } else {
                        Some(Reply::Static(&storage[..len]))
                    }
                }),
                STRING_SERIAL => {
                    let len =
                        descriptors::write_serial_number(descriptors.unique_id(), &mut self.scratch);
                    Some(Reply::Scratch(len)).filter(|_| len > 0)
                }
                _ => descriptors.string_descriptor(index).map(Reply::Static),
            },
            _ => None,
        };

        let wanted = setup.length as usize;
        let ep0 = self.endpoints.ep0();
        match reply {
            Some(Reply::Static(data)) => {
                let length = data.len().min(wanted);
                ep0.begin(Buffer::Tx(data), length, EndpointState::Transmitting, false);
                RequestStatus::Ok
            }
            Some(Reply::Scratch(len)) => {
                let length = len.min(wanted);
                ep0.begin(Buffer::Scratch, length, EndpointState::Transmitting, false);
                RequestStatus::Ok
            }
            None => RequestStatus::Unhandled,
        }
    }

    fn set_configuration(&mut self, setup: &SetupPacket) -> RequestStatus {
        if setup.value >> 8 != 0
            || setup.length != 0
            || setup.index != 0
            || setup.request_type.recipient() != Recipient::Device
        {
            return RequestStatus::RequestError;
        }

        let value = setup.value as u8;
        let matching = value == self.descriptors.configuration_value();
        match self.state() {
            DeviceState::Addressed if value == 0 => RequestStatus::Ok,
            DeviceState::Addressed if matching => {
                self.configuration = value;
                self.activate_endpoints(true);
                self.set_state(DeviceState::Configured);
                RequestStatus::Ok
            }
            DeviceState::Configured if value == 0 => {
                self.configuration = 0;
                // Leaving Configured aborts every data endpoint back to idle.
                self.set_state(DeviceState::Addressed);
                RequestStatus::Ok
            }
            DeviceState::Configured if matching => {
                self.activate_endpoints(false);
                RequestStatus::Ok
            }
            _ => RequestStatus::RequestError,
        }
    }

    /// Enable every data endpoint of the configuration in the controller,
    /// which also resets its data toggle.
    fn activate_endpoints(&mut self, force_idle: bool) {
        let hw = self.hw;
        let config = self.config;
        for slot in self.endpoints.data_slots() {
            let ep = self.endpoints.get_mut(slot);
            if force_idle {
                ep.state = EndpointState::Idle;
                ep.flags.clear();
            }
            if let Some(endpoint) = ep.config {
                hw.activate_endpoint(&endpoint, config.is_split(endpoint.address));
            }
        }
    }
}
