// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Result codes of the USB device engine.
//!
//! Three families of results exist:
//!
//! - [`UsbError`] is returned to the application by the transfer API
//!   (`write`, `read`, `abort`). It always describes a request that was not
//!   carried out.
//! - [`TransferStatus`] is reported through the completion callback once a
//!   transfer ends, successfully or not.
//! - [`RequestStatus`] is the outcome of a control request handler. Anything
//!   other than `Ok` is resolved on the bus by stalling endpoint 0 and never
//!   reaches the application.

/// Errors returned by the transfer API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum UsbError {
    /// Unknown endpoint, or an endpoint used in the wrong direction.
    Illegal = 1,
    /// A data endpoint was used before the host selected a configuration.
    DeviceUnconfigured = 2,
    /// The endpoint already has a transfer in progress.
    EndpointBusy = 3,
    /// The endpoint is stalled.
    EndpointStalled = 4,
}

impl From<UsbError> for usize {
    fn from(err: UsbError) -> usize {
        err as usize
    }
}

impl TryFrom<usize> for UsbError {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(UsbError::Illegal),
            2 => Ok(UsbError::DeviceUnconfigured),
            3 => Ok(UsbError::EndpointBusy),
            4 => Ok(UsbError::EndpointStalled),
            _ => Err(()),
        }
    }
}

/// Outcome of a transfer, reported to the client on completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    /// The host sent more bytes than the armed buffer could hold. The packet
    /// was left in the controller and the endpoint returned to idle.
    RxBufferOverrun,
    /// A packet arrived on an OUT endpoint that had no receive armed.
    EndpointError,
}

/// Outcome of a control request handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Ok,
    /// The request was recognized but malformed or illegal in the current
    /// device state.
    RequestError,
    /// Nobody recognized the request.
    Unhandled,
}

impl RequestStatus {
    pub fn is_ok(self) -> bool {
        self == RequestStatus::Ok
    }
}
