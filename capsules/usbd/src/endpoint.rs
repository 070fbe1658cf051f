// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Endpoint state table.
//!
//! Every endpoint the device uses has one [`Endpoint`] record holding the
//! bookkeeping of the transfer in progress: the borrowed buffer, how far the
//! transfer got, and the flags the interrupt handler uses to resume work that
//! could not be done when the packet arrived. Slot 0 of the table is the
//! bidirectional control endpoint; the remaining slots follow the order of
//! [`DeviceConfig::endpoints`].
//!
//! While an endpoint is not `Idle`, its transfer owns `buffer` and
//! `remaining`; nothing else may touch them until the transfer completes or
//! is aborted.

use core::fmt;

use crate::config::{DeviceConfig, EndpointConfig, MAX_DATA_ENDPOINTS};
use crate::error::UsbError;
use crate::setup::{SetupPacket, TransferDirection};

/// Number of slots in the endpoint table, endpoint 0 included.
pub const MAX_ENDPOINTS: usize = MAX_DATA_ENDPOINTS + 1;

/// Size of the device-owned buffer used for endpoint 0 replies that are
/// synthesized on the fly, such as the serial number string descriptor.
pub const SCRATCH_SIZE: usize = 72;

/// An endpoint address, encoded as in an endpoint descriptor: bit 7 is set
/// for IN endpoints and bits 0..3 hold the endpoint number.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    pub const CONTROL: EndpointAddress = EndpointAddress(0);

    pub const fn new_in(number: u8) -> Self {
        EndpointAddress(0x80 | (number & 0x0f))
    }

    pub const fn new_out(number: u8) -> Self {
        EndpointAddress(number & 0x0f)
    }

    pub const fn from_raw(raw: u8) -> Self {
        EndpointAddress(raw & 0x8f)
    }

    pub const fn number(self) -> u8 {
        self.0 & 0x0f
    }

    pub const fn is_control(self) -> bool {
        self.number() == 0
    }

    pub const fn is_in(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Direction of data moving through the endpoint. Endpoint 0 reports the
    /// direction encoded in its address.
    pub fn direction(self) -> TransferDirection {
        if self.is_in() {
            TransferDirection::DeviceToHost
        } else {
            TransferDirection::HostToDevice
        }
    }
}

impl From<EndpointAddress> for u8 {
    fn from(address: EndpointAddress) -> u8 {
        address.0
    }
}

impl fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_control() {
            write!(f, "EP0")
        } else if self.is_in() {
            write!(f, "EP{}IN", self.number())
        } else {
            write!(f, "EP{}OUT", self.number())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Idle,
    Transmitting,
    Receiving,
    /// Not activated by the current configuration.
    Halted,
    Stalled,
}

/// Per-endpoint flags. Cleared whenever a new transfer starts or the
/// endpoint is aborted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// Notify the client when the transfer ends.
    pub callback: bool,
    /// IN data is queued but not yet written to the FIFO; picked up on SOF.
    pub in_packet_pending: bool,
    /// An OUT packet is waiting in the FIFO and was not consumed.
    pub out_packet_pending: bool,
    /// A control write was accepted but nobody armed a receive buffer yet.
    pub wait_for_read: bool,
}

impl Flags {
    pub fn clear(&mut self) {
        *self = Flags::default();
    }
}

/// A buffer handed back by [`crate::UsbDevice::take_buffer`].
#[derive(Debug)]
pub enum TransferBuffer<'a> {
    Tx(&'a [u8]),
    Rx(&'a mut [u8]),
}

/// Memory backing the transfer of one endpoint.
#[derive(Debug, Default)]
pub(crate) enum Buffer<'a> {
    #[default]
    Empty,
    Tx(&'a [u8]),
    Rx(&'a mut [u8]),
    /// The device-owned scratch area (endpoint 0 only).
    Scratch,
}

pub(crate) struct Endpoint<'a> {
    pub(crate) address: EndpointAddress,
    pub(crate) config: Option<EndpointConfig>,
    pub(crate) max_packet_size: usize,
    pub(crate) state: EndpointState,
    pub(crate) buffer: Buffer<'a>,
    /// Bytes already moved.
    pub(crate) position: usize,
    /// Bytes not yet moved to or from the hardware.
    pub(crate) remaining: usize,
    pub(crate) flags: Flags,
}

impl<'a> Endpoint<'a> {
    fn control(max_packet_size: u8) -> Self {
        Endpoint {
            address: EndpointAddress::CONTROL,
            config: None,
            max_packet_size: max_packet_size as usize,
            state: EndpointState::Idle,
            buffer: Buffer::Empty,
            position: 0,
            remaining: 0,
            flags: Flags::default(),
        }
    }

    fn data(config: EndpointConfig) -> Self {
        Endpoint {
            address: config.address,
            config: Some(config),
            max_packet_size: config.max_packet_size as usize,
            state: EndpointState::Halted,
            buffer: Buffer::Empty,
            position: 0,
            remaining: 0,
            flags: Flags::default(),
        }
    }

    /// Claim the endpoint for a new transfer.
    pub(crate) fn begin(
        &mut self,
        buffer: Buffer<'a>,
        length: usize,
        state: EndpointState,
        callback: bool,
    ) {
        self.buffer = buffer;
        self.position = 0;
        self.remaining = length;
        self.state = state;
        self.flags.clear();
        self.flags.callback = callback;
    }

    /// Account for `count` bytes moved to or from the hardware.
    pub(crate) fn advance(&mut self, count: usize) {
        let count = count.min(self.remaining);
        self.position += count;
        self.remaining -= count;
    }

    /// Return to idle, dropping whatever was left of the transfer. The buffer
    /// stays attached so the caller can take it back.
    pub(crate) fn abort(&mut self) {
        self.state = EndpointState::Idle;
        self.remaining = 0;
        self.flags.clear();
    }

    pub(crate) fn is_isochronous(&self) -> bool {
        self.config.is_some_and(|c| c.is_isochronous())
    }

    /// The next `count` bytes to transmit.
    pub(crate) fn tx_chunk<'s>(&'s self, scratch: &'s [u8], count: usize) -> &'s [u8] {
        let end = self.position + count;
        match &self.buffer {
            Buffer::Tx(buf) => buf.get(self.position..end).unwrap_or(&[]),
            Buffer::Scratch => scratch.get(self.position..end).unwrap_or(&[]),
            Buffer::Rx(_) | Buffer::Empty => &[],
        }
    }

    /// Room for the next `count` received bytes.
    pub(crate) fn rx_chunk<'s>(
        &'s mut self,
        scratch: &'s mut [u8],
        count: usize,
    ) -> Option<&'s mut [u8]> {
        let start = self.position;
        match &mut self.buffer {
            Buffer::Rx(buf) => buf.get_mut(start..start + count),
            Buffer::Scratch => scratch.get_mut(start..start + count),
            Buffer::Tx(_) | Buffer::Empty => None,
        }
    }

    pub(crate) fn take_buffer(&mut self) -> Option<TransferBuffer<'a>> {
        match core::mem::take(&mut self.buffer) {
            Buffer::Tx(buf) => Some(TransferBuffer::Tx(buf)),
            Buffer::Rx(buf) => Some(TransferBuffer::Rx(buf)),
            Buffer::Scratch | Buffer::Empty => None,
        }
    }
}

/// The statically sized table of endpoint records.
pub(crate) struct EndpointTable<'a> {
    endpoints: [Endpoint<'a>; MAX_ENDPOINTS],
    len: usize,
}

impl<'a> EndpointTable<'a> {
    pub(crate) fn new(config: &DeviceConfig) -> Self {
        let mut endpoints: [Endpoint<'a>; MAX_ENDPOINTS] =
            core::array::from_fn(|_| Endpoint::control(config.ep0_max_packet_size));
        let mut len = 1;
        for ep in config.endpoints.iter().take(MAX_DATA_ENDPOINTS) {
            endpoints[len] = Endpoint::data(*ep);
            len += 1;
        }
        EndpointTable { endpoints, len }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Slot of the endpoint with the given address. Both `0x00` and `0x80`
    /// name endpoint 0.
    pub(crate) fn slot(&self, address: EndpointAddress) -> Option<usize> {
        if address.is_control() {
            return Some(0);
        }
        (1..self.len).find(|&i| self.endpoints[i].address == address)
    }

    pub(crate) fn get(&self, slot: usize) -> &Endpoint<'a> {
        &self.endpoints[slot]
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> &mut Endpoint<'a> {
        &mut self.endpoints[slot]
    }

    pub(crate) fn ep0(&mut self) -> &mut Endpoint<'a> {
        &mut self.endpoints[0]
    }

    pub(crate) fn data_slots(&self) -> core::ops::Range<usize> {
        1..self.len
    }

    /// Check whether a transfer may start, and claim the endpoint if so.
    ///
    /// Rejections are ordered: an endpoint that does not exist or is used in
    /// the wrong direction is `Illegal`, a data endpoint before configuration
    /// is `DeviceUnconfigured`, and only then is the endpoint state looked at.
    /// A rejected request leaves the endpoint untouched.
    pub(crate) fn begin_transfer(
        &mut self,
        address: EndpointAddress,
        direction: TransferDirection,
        buffer: Buffer<'a>,
        length: usize,
        callback: bool,
        configured: bool,
    ) -> Result<usize, UsbError> {
        let slot = self.slot(address).ok_or(UsbError::Illegal)?;
        let endpoint = &mut self.endpoints[slot];
        if !address.is_control() {
            if endpoint.address.direction() != direction {
                return Err(UsbError::Illegal);
            }
            if !configured {
                return Err(UsbError::DeviceUnconfigured);
            }
        }
        match endpoint.state {
            EndpointState::Idle => {}
            EndpointState::Stalled => return Err(UsbError::EndpointStalled),
            _ => return Err(UsbError::EndpointBusy),
        }
        let state = match direction {
            TransferDirection::DeviceToHost => EndpointState::Transmitting,
            TransferDirection::HostToDevice => EndpointState::Receiving,
        };
        endpoint.begin(buffer, length, state, callback);
        Ok(slot)
    }

    /// Reset every record after a bus reset: endpoint 0 becomes idle, data
    /// endpoints are halted until the host configures the device again.
    pub(crate) fn reset(&mut self) {
        let ep0 = &mut self.endpoints[0];
        ep0.state = EndpointState::Idle;
        ep0.flags.clear();
        self.halt_data();
    }

    /// Halt every data endpoint until the next SET_CONFIGURATION.
    pub(crate) fn halt_data(&mut self) {
        for ep in self.endpoints[1..self.len].iter_mut() {
            ep.state = EndpointState::Halted;
            ep.flags.clear();
            if let Some(config) = ep.config {
                ep.max_packet_size = config.max_packet_size as usize;
            }
        }
    }
}

/// Endpoint 0 as seen by a class or vendor request handler.
///
/// The handler answers the request by arming a transmit with [`write`] or
/// [`respond`], or a receive with [`read`]. Transfers armed here never
/// request a completion callback.
///
/// [`write`]: ControlEndpoint::write
/// [`respond`]: ControlEndpoint::respond
/// [`read`]: ControlEndpoint::read
pub struct ControlEndpoint<'e, 'a> {
    pub(crate) endpoint: &'e mut Endpoint<'a>,
    pub(crate) scratch: &'e mut [u8; SCRATCH_SIZE],
    pub(crate) setup: SetupPacket,
}

impl<'a> ControlEndpoint<'_, 'a> {
    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    /// Send `data` in the data stage, truncated to the length the host asked
    /// for.
    pub fn write(&mut self, data: &'a [u8]) -> Result<(), UsbError> {
        self.check_idle()?;
        let length = data.len().min(self.setup.length as usize);
        self.endpoint
            .begin(Buffer::Tx(data), length, EndpointState::Transmitting, false);
        Ok(())
    }

    /// Send a short reply that does not outlive the handler. The bytes are
    /// copied into the device scratch area.
    pub fn respond(&mut self, data: &[u8]) -> Result<(), UsbError> {
        self.check_idle()?;
        let scratch = self
            .scratch
            .get_mut(..data.len())
            .ok_or(UsbError::Illegal)?;
        scratch.copy_from_slice(data);
        let length = data.len().min(self.setup.length as usize);
        self.endpoint
            .begin(Buffer::Scratch, length, EndpointState::Transmitting, false);
        Ok(())
    }

    /// Receive the data stage of a control write into `buffer`.
    pub fn read(&mut self, buffer: &'a mut [u8]) -> Result<(), UsbError> {
        self.check_idle()?;
        let length = buffer.len();
        self.endpoint
            .begin(Buffer::Rx(buffer), length, EndpointState::Receiving, false);
        Ok(())
    }

    fn check_idle(&self) -> Result<(), UsbError> {
        match self.endpoint.state {
            EndpointState::Idle => Ok(()),
            EndpointState::Stalled => Err(UsbError::EndpointStalled),
            _ => Err(UsbError::EndpointBusy),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TransferType;

    const LAYOUT: [EndpointConfig; 2] = [
        EndpointConfig::new(EndpointAddress::new_in(1), TransferType::Interrupt, 8),
        EndpointConfig::new(EndpointAddress::new_out(1), TransferType::Interrupt, 8),
    ];

    #[test]
    fn addresses() {
        let ep = EndpointAddress::new_in(3);
        assert_eq!(u8::from(ep), 0x83);
        assert_eq!(ep.number(), 3);
        assert!(ep.is_in());
        assert_eq!(EndpointAddress::from_raw(0x02), EndpointAddress::new_out(2));
        assert!(EndpointAddress::from_raw(0x80).is_control());
    }

    #[test]
    fn lookup_by_address() {
        let table = EndpointTable::new(&DeviceConfig::new(&LAYOUT));
        assert_eq!(table.len(), 3);
        assert_eq!(table.slot(EndpointAddress::CONTROL), Some(0));
        assert_eq!(table.slot(EndpointAddress::from_raw(0x80)), Some(0));
        assert_eq!(table.slot(EndpointAddress::new_in(1)), Some(1));
        assert_eq!(table.slot(EndpointAddress::new_out(1)), Some(2));
        assert_eq!(table.slot(EndpointAddress::new_in(2)), None);
        assert_eq!(table.get(1).state, EndpointState::Halted);
    }

    #[test]
    fn begin_transfer_rejections_leave_state_untouched() {
        let mut table = EndpointTable::new(&DeviceConfig::new(&LAYOUT));
        let data = [1u8, 2, 3];

        assert_eq!(
            table.begin_transfer(
                EndpointAddress::new_in(1),
                TransferDirection::DeviceToHost,
                Buffer::Tx(&data),
                3,
                false,
                false,
            ),
            Err(UsbError::DeviceUnconfigured)
        );
        assert_eq!(
            table.begin_transfer(
                EndpointAddress::new_out(1),
                TransferDirection::DeviceToHost,
                Buffer::Tx(&data),
                3,
                false,
                true,
            ),
            Err(UsbError::Illegal)
        );

        table.get_mut(1).state = EndpointState::Idle;
        assert_eq!(
            table.begin_transfer(
                EndpointAddress::new_in(1),
                TransferDirection::DeviceToHost,
                Buffer::Tx(&data),
                3,
                true,
                true,
            ),
            Ok(1)
        );
        assert_eq!(
            table.begin_transfer(
                EndpointAddress::new_in(1),
                TransferDirection::DeviceToHost,
                Buffer::Tx(&data[..1]),
                1,
                false,
                true,
            ),
            Err(UsbError::EndpointBusy)
        );
        let ep = table.get(1);
        assert_eq!(ep.state, EndpointState::Transmitting);
        assert_eq!(ep.remaining, 3);
        assert!(ep.flags.callback);

        table.get_mut(2).state = EndpointState::Stalled;
        let mut rx = [0u8; 8];
        assert_eq!(
            table.begin_transfer(
                EndpointAddress::new_out(1),
                TransferDirection::HostToDevice,
                Buffer::Rx(&mut rx),
                8,
                false,
                true,
            ),
            Err(UsbError::EndpointStalled)
        );
    }

    #[test]
    fn advance_and_abort() {
        let mut table = EndpointTable::new(&DeviceConfig::new(&LAYOUT));
        let data = [0u8; 20];
        table.get_mut(1).state = EndpointState::Idle;
        let slot = table
            .begin_transfer(
                EndpointAddress::new_in(1),
                TransferDirection::DeviceToHost,
                Buffer::Tx(&data),
                20,
                false,
                true,
            )
            .unwrap();
        let ep = table.get_mut(slot);
        ep.advance(8);
        assert_eq!(ep.tx_chunk(&[], 8).len(), 8);
        assert_eq!((ep.position, ep.remaining), (8, 12));
        ep.abort();
        assert_eq!(ep.state, EndpointState::Idle);
        assert_eq!(ep.remaining, 0);
        assert!(matches!(ep.take_buffer(), Some(TransferBuffer::Tx(b)) if b.len() == 20));
    }

    #[test]
    fn reset_halts_data_endpoints() {
        let mut table = EndpointTable::new(&DeviceConfig::new(&LAYOUT));
        table.get_mut(0).state = EndpointState::Stalled;
        table.get_mut(1).state = EndpointState::Idle;
        table.get_mut(1).max_packet_size = 2;
        table.reset();
        assert_eq!(table.get(0).state, EndpointState::Idle);
        assert_eq!(table.get(1).state, EndpointState::Halted);
        assert_eq!(table.get(1).max_packet_size, 8);
    }
}
