// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Control requests of the HID class.
//!
//! [`HidClass`] is a [`SetupHook`] that serves the HID and report
//! descriptors of each HID interface, and keeps the idle rate and protocol
//! the host selected for it. Report content is up to the keyboard logic.

use core::cell::Cell;

use crate::descriptors::DescriptorType;
use crate::endpoint::ControlEndpoint;
use crate::error::RequestStatus;
use crate::hil::SetupHook;
use crate::setup::{Recipient, RequestType, StandardRequest, TransferDirection};

/// Most HID interfaces a single [`HidClass`] handles.
pub const MAX_HID_INTERFACES: usize = 4;

const GET_IDLE: u8 = 0x02;
const GET_PROTOCOL: u8 = 0x03;
const SET_IDLE: u8 = 0x0a;
const SET_PROTOCOL: u8 = 0x0b;

/// Class request, host to device, recipient interface.
const CLASS_OUT: u8 = 0x21;
/// Class request, device to host, recipient interface.
const CLASS_IN: u8 = 0xa1;

/// Protocol selected by SET_PROTOCOL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Boot = 0,
    Report = 1,
}

pub struct HidInterface<'a> {
    pub number: u8,
    /// The HID class descriptor, as also embedded in the configuration
    /// descriptor.
    pub hid_descriptor: &'a [u8],
    pub report_descriptor: &'a [u8],
}

pub struct HidClass<'a> {
    interfaces: &'a [HidInterface<'a>],
    idle_rate: [Cell<u8>; MAX_HID_INTERFACES],
    protocol: [Cell<Protocol>; MAX_HID_INTERFACES],
}

impl<'a> HidClass<'a> {
    /// Only the first [`MAX_HID_INTERFACES`] entries of `interfaces` are
    /// served.
    pub fn new(interfaces: &'a [HidInterface<'a>]) -> Self {
        let count = interfaces.len().min(MAX_HID_INTERFACES);
        HidClass {
            interfaces: &interfaces[..count],
            idle_rate: Default::default(),
            protocol: [
                Cell::new(Protocol::Report),
                Cell::new(Protocol::Report),
                Cell::new(Protocol::Report),
                Cell::new(Protocol::Report),
            ],
        }
    }

    /// Idle rate of `interface` in units of 4 ms, 0 for "report only on
    /// change".
    pub fn idle_rate(&self, interface: u8) -> Option<u8> {
        self.position(interface).map(|i| self.idle_rate[i].get())
    }

    pub fn protocol(&self, interface: u8) -> Option<Protocol> {
        self.position(interface).map(|i| self.protocol[i].get())
    }

    fn position(&self, interface: u8) -> Option<usize> {
        self.interfaces.iter().position(|i| i.number == interface)
    }

    fn class_request(&self, i: usize, ep0: &mut ControlEndpoint<'_, 'a>) -> RequestStatus {
        let setup = *ep0.setup();
        let request_type = setup.request_type.0;
        match setup.request_code {
            // Idle rates are kept per interface, not per report ID.
            SET_IDLE
                if request_type == CLASS_OUT && setup.length == 0 && (setup.value & 0xff) == 0 =>
            {
                self.idle_rate[i].set((setup.value >> 8) as u8);
                RequestStatus::Ok
            }
            GET_IDLE if request_type == CLASS_IN && setup.length == 1 && setup.value == 0 => {
                to_status(ep0.respond(&[self.idle_rate[i].get()]))
            }
            SET_PROTOCOL if request_type == CLASS_OUT && setup.length == 0 => {
                let protocol = match setup.value {
                    0 => Protocol::Boot,
                    1 => Protocol::Report,
                    _ => return RequestStatus::RequestError,
                };
                self.protocol[i].set(protocol);
                RequestStatus::Ok
            }
            GET_PROTOCOL if request_type == CLASS_IN && setup.length == 1 => {
                to_status(ep0.respond(&[self.protocol[i].get() as u8]))
            }
            _ => RequestStatus::Unhandled,
        }
    }
}

impl<'a> SetupHook<'a> for HidClass<'a> {
    fn setup(&self, ep0: &mut ControlEndpoint<'_, 'a>) -> RequestStatus {
        let setup = *ep0.setup();
        if setup.request_type.recipient() != Recipient::Interface || setup.index > 0xff {
            return RequestStatus::Unhandled;
        }
        let i = match self.position(setup.index as u8) {
            Some(i) => i,
            None => return RequestStatus::Unhandled,
        };

        match setup.request_type.request_type() {
            RequestType::Standard => {
                if setup.standard_request() != Some(StandardRequest::GetDescriptor)
                    || setup.request_type.transfer_direction() != TransferDirection::DeviceToHost
                {
                    return RequestStatus::Unhandled;
                }
                let interface = &self.interfaces[i];
                let data = match DescriptorType::from_u8(setup.descriptor_type()) {
                    Some(DescriptorType::Hid) => interface.hid_descriptor,
                    Some(DescriptorType::Report) => interface.report_descriptor,
                    _ => return RequestStatus::Unhandled,
                };
                to_status(ep0.write(data))
            }
            RequestType::Class => self.class_request(i, ep0),
            _ => RequestStatus::Unhandled,
        }
    }
}

fn to_status<E>(result: Result<(), E>) -> RequestStatus {
    match result {
        Ok(()) => RequestStatus::Ok,
        Err(_) => RequestStatus::RequestError,
    }
}
