// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Scenario tests driving a [`UsbDevice`] against a simulated controller.
//!
//! `FakeController` keeps one packet per FIFO. The test plays the host: it
//! loads SETUP and OUT packets with `host_setup`/`host_out`, marks IN packets
//! as collected with `host_take_in`, and feeds the matching events to
//! `UsbDevice::handle_events`.

use core::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::vec::Vec;

use crate::config::{DeviceConfig, EndpointConfig, TransferType};
use crate::descriptors::StaticDescriptors;
use crate::device::{DeviceState, UsbDevice};
use crate::endpoint::{ControlEndpoint, EndpointAddress, TransferBuffer};
use crate::error::{RequestStatus, TransferStatus, UsbError};
use crate::hid::{HidClass, HidInterface, Protocol};
use crate::hil::{Client, CommonInterrupt, InterruptStatus, SetupHook, UsbHardware};
use crate::setup::{DeviceRequestType, SetupPacket};

const EP1_IN: EndpointAddress = EndpointAddress::new_in(1);
const EP1_OUT: EndpointAddress = EndpointAddress::new_out(1);
const EP2_IN: EndpointAddress = EndpointAddress::new_in(2);
const EP3_IN: EndpointAddress = EndpointAddress::new_in(3);
const EP4_IN: EndpointAddress = EndpointAddress::new_in(4);
const EP0: EndpointAddress = EndpointAddress::CONTROL;

static ENDPOINTS: [EndpointConfig; 5] = [
    EndpointConfig::new(EP1_IN, TransferType::Interrupt, 8),
    EndpointConfig::new(EP1_OUT, TransferType::Interrupt, 8),
    EndpointConfig::new(EP2_IN, TransferType::Bulk, 64),
    EndpointConfig::new(EP3_IN, TransferType::Bulk, 64),
    EndpointConfig::new(EP4_IN, TransferType::Isochronous, 16),
];

static DEVICE: [u8; 18] = [
    18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x66, 0x66, 0x11, 0x11, 0x01, 0x00, 1, 2, 3, 1,
];
static CONFIGURATION: [u8; 64] = configuration_block();
static LANGUAGES: [u8; 4] = [4, 3, 0x09, 0x04];
static MANUFACTURER: [u8; 6] = [6, 3, b'k', 0, b'p', 0];
static UID: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// A configuration block exactly one endpoint 0 packet long.
const fn configuration_block() -> [u8; 64] {
    let mut block = [0u8; 64];
    block[0] = 9;
    block[1] = 2;
    block[2] = 64;
    block[4] = 1;
    block[5] = 1;
    block
}

fn descriptors(product: Option<&'static [u8]>) -> StaticDescriptors<'static> {
    StaticDescriptors {
        device: &DEVICE,
        configuration: &CONFIGURATION,
        configuration_value: 1,
        languages: &LANGUAGES,
        manufacturer: &MANUFACTURER,
        product,
        strings: &[],
        unique_id: &UID,
    }
}

#[derive(Debug, PartialEq)]
struct Packet {
    fifo: u8,
    data: Vec<u8>,
    /// Committed as the last packet of an endpoint 0 data stage.
    last: bool,
}

impl Packet {
    fn new(fifo: u8, data: &[u8], last: bool) -> Self {
        Packet {
            fifo,
            data: data.to_vec(),
            last,
        }
    }
}

#[derive(Default)]
struct FakeController {
    index: Cell<u8>,
    interrupt_enabled: Cell<bool>,
    vbus: Cell<bool>,
    attached: Cell<bool>,
    suspended: Cell<bool>,
    address: Cell<Option<u8>>,
    frame: Cell<u16>,
    pending: Cell<Option<InterruptStatus>>,
    resets: Cell<usize>,

    rx: [RefCell<VecDeque<u8>>; 8],
    out_ready: [Cell<bool>; 8],
    tx: [RefCell<Vec<u8>>; 8],
    in_ready: [Cell<bool>; 8],
    reading: Cell<Option<u8>>,
    writing: Cell<Option<u8>>,
    bytes_read: Cell<usize>,
    bytes_written: Cell<usize>,
    sent: RefCell<Vec<Packet>>,

    ep0_sent_stall: Cell<bool>,
    ep0_setup_end: Cell<bool>,
    stalls: Cell<usize>,
    data_end: Cell<usize>,

    activated: RefCell<Vec<(EndpointAddress, bool)>>,
    aborted: RefCell<Vec<EndpointAddress>>,
}

impl FakeController {
    /// A SETUP packet flushes whatever endpoint 0 still had queued.
    fn host_setup(&self, packet: [u8; 8]) {
        self.in_ready[0].set(false);
        self.tx[0].borrow_mut().clear();
        self.host_out(0, &packet);
    }

    fn host_out(&self, fifo: u8, data: &[u8]) {
        *self.rx[fifo as usize].borrow_mut() = data.iter().copied().collect();
        self.out_ready[fifo as usize].set(true);
    }

    fn host_take_in(&self, fifo: u8) {
        self.in_ready[fifo as usize].set(false);
    }

    fn take_sent(&self) -> Vec<Packet> {
        self.sent.take()
    }

    fn commit(&self, fifo: u8, last: bool) {
        let data = self.tx[fifo as usize].take();
        self.sent.borrow_mut().push(Packet { fifo, data, last });
        self.in_ready[fifo as usize].set(true);
    }

    fn pop(&self, fifo: u8) -> u8 {
        self.bytes_read.set(self.bytes_read.get() + 1);
        self.rx[fifo as usize].borrow_mut().pop_front().unwrap_or(0)
    }

    fn release(&self, fifo: u8) {
        self.out_ready[fifo as usize].set(false);
        self.rx[fifo as usize].borrow_mut().clear();
    }

    fn selected(&self) -> usize {
        self.index.get() as usize
    }
}

impl UsbHardware for FakeController {
    type Context = u8;

    fn init(&self, _bus_powered: bool) {}

    fn attach(&self) {
        self.attached.set(true);
    }

    fn detach(&self) {
        self.attached.set(false);
    }

    fn vbus_present(&self) -> bool {
        self.vbus.get()
    }

    fn reset_complete(&self) {
        self.resets.set(self.resets.get() + 1);
    }

    fn suspend(&self) {
        self.suspended.set(true);
    }

    fn resume(&self) {
        self.suspended.set(false);
    }

    fn set_address(&self, address: u8) {
        self.address.set(Some(address));
    }

    fn enable_interrupt(&self) {
        self.interrupt_enabled.set(true);
    }

    fn mask_interrupt(&self) -> bool {
        self.interrupt_enabled.replace(false)
    }

    fn restore_interrupt(&self, was_enabled: bool) {
        if was_enabled {
            self.interrupt_enabled.set(true);
        }
    }

    fn save_context(&self) -> u8 {
        self.index.get()
    }

    fn restore_context(&self, context: u8) {
        self.index.set(context);
    }

    fn interrupt_status(&self) -> InterruptStatus {
        self.pending.take().unwrap_or(InterruptStatus::empty())
    }

    fn frame_number(&self) -> u16 {
        self.frame.get()
    }

    fn index(&self) -> u8 {
        self.index.get()
    }

    fn set_index(&self, index: u8) {
        self.index.set(index);
    }

    fn enable_fifo_read(&self, fifo: u8) {
        self.reading.set(Some(fifo));
    }

    fn read_fifo_byte(&self) -> u8 {
        self.pop(self.reading.get().unwrap())
    }

    fn read_last_fifo_byte(&self, fifo: u8) -> u8 {
        self.pop(fifo)
    }

    fn disable_fifo_read(&self, _fifo: u8) {
        self.reading.set(None);
    }

    fn enable_fifo_write(&self, fifo: u8) {
        self.writing.set(Some(fifo));
    }

    fn write_fifo_byte(&self, byte: u8) {
        let fifo = self.writing.get().unwrap() as usize;
        self.tx[fifo].borrow_mut().push(byte);
        self.bytes_written.set(self.bytes_written.get() + 1);
    }

    fn disable_fifo_write(&self, _fifo: u8) {
        self.writing.set(None);
    }

    fn ep0_sent_stall(&self) -> bool {
        self.ep0_sent_stall.get()
    }

    fn ep0_clear_sent_stall(&self) {
        self.ep0_sent_stall.set(false);
    }

    fn ep0_setup_end(&self) -> bool {
        self.ep0_setup_end.get()
    }

    fn ep0_serviced_setup_end(&self) {
        self.ep0_setup_end.set(false);
    }

    fn ep0_out_packet_ready(&self) -> bool {
        self.out_ready[0].get()
    }

    fn ep0_in_packet_ready(&self) -> bool {
        self.in_ready[0].get()
    }

    fn ep0_count(&self) -> usize {
        self.rx[0].borrow().len()
    }

    fn ep0_serviced_out_packet(&self) {
        self.release(0);
    }

    fn ep0_serviced_last_out_packet(&self) {
        self.release(0);
        self.data_end.set(self.data_end.get() + 1);
    }

    fn ep0_set_in_packet_ready(&self) {
        self.commit(0, false);
    }

    fn ep0_set_last_in_packet_ready(&self) {
        self.commit(0, true);
        self.data_end.set(self.data_end.get() + 1);
    }

    fn ep0_send_stall(&self) {
        self.release(0);
        self.stalls.set(self.stalls.get() + 1);
        // The host sees the stall right away.
        self.ep0_sent_stall.set(true);
    }

    fn in_sent_stall(&self) -> bool {
        false
    }

    fn in_clear_sent_stall(&self) {}

    fn in_set_packet_ready(&self) {
        self.commit(self.index.get(), false);
    }

    fn out_sent_stall(&self) -> bool {
        false
    }

    fn out_clear_sent_stall(&self) {}

    fn out_packet_ready(&self) -> bool {
        self.out_ready[self.selected()].get()
    }

    fn out_count(&self) -> usize {
        self.rx[self.selected()].borrow().len()
    }

    fn out_clear_packet_ready(&self) {
        self.release(self.index.get());
    }

    fn activate_endpoint(&self, endpoint: &EndpointConfig, split: bool) {
        self.activated.borrow_mut().push((endpoint.address, split));
    }

    fn abort_in_endpoint(&self, number: u8) {
        self.tx[number as usize].borrow_mut().clear();
        self.in_ready[number as usize].set(false);
        self.aborted.borrow_mut().push(EndpointAddress::new_in(number));
    }

    fn abort_out_endpoint(&self, number: u8) {
        self.aborted.borrow_mut().push(EndpointAddress::new_out(number));
    }
}

#[derive(Debug, PartialEq)]
enum Event {
    Transfer(EndpointAddress, TransferStatus, usize, usize),
    State(DeviceState, DeviceState),
    Reset,
    Frame(u16),
}

#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<Event>>,
    passes: Cell<usize>,
}

impl Recorder {
    fn take(&self) -> Vec<Event> {
        self.events.take()
    }

    fn transfers(&self) -> Vec<Event> {
        self.take()
            .into_iter()
            .filter(|e| matches!(e, Event::Transfer(..)))
            .collect()
    }
}

impl Client for Recorder {
    fn transfer_complete(
        &self,
        endpoint: EndpointAddress,
        status: TransferStatus,
        transferred: usize,
        remaining: usize,
    ) {
        self.events
            .borrow_mut()
            .push(Event::Transfer(endpoint, status, transferred, remaining));
    }

    fn state_changed(&self, old: DeviceState, new: DeviceState) {
        self.events.borrow_mut().push(Event::State(old, new));
    }

    fn bus_reset(&self) {
        self.events.borrow_mut().push(Event::Reset);
    }

    fn start_of_frame(&self, frame: u16) {
        self.events.borrow_mut().push(Event::Frame(frame));
    }

    fn exit_handler(&self) {
        self.passes.set(self.passes.get() + 1);
    }
}

/// Accepts every vendor request without arming a data stage.
struct VendorHook;

impl<'a> SetupHook<'a> for VendorHook {
    fn setup(&self, ep0: &mut ControlEndpoint<'_, 'a>) -> RequestStatus {
        if ep0.setup().request_type.0 & 0x60 == 0x40 {
            RequestStatus::Ok
        } else {
            RequestStatus::Unhandled
        }
    }
}

fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    SetupPacket {
        request_type: DeviceRequestType(request_type),
        request_code: request,
        value,
        index,
        length,
    }
    .to_bytes()
}

fn set_address(address: u16) -> [u8; 8] {
    setup(0x00, 5, address, 0, 0)
}

fn set_configuration(value: u16) -> [u8; 8] {
    setup(0x00, 9, value, 0, 0)
}

fn get_descriptor(descriptor_type: u8, index: u8, length: u16) -> [u8; 8] {
    setup(
        0x80,
        6,
        ((descriptor_type as u16) << 8) | index as u16,
        0,
        length,
    )
}

fn ep0_event() -> InterruptStatus {
    let mut status = InterruptStatus::empty();
    status.set_ep0();
    status
}

fn in_event(number: u8) -> InterruptStatus {
    let mut status = InterruptStatus::empty();
    status.set_in_endpoint(number);
    status
}

fn out_event(number: u8) -> InterruptStatus {
    let mut status = InterruptStatus::empty();
    status.set_out_endpoint(number);
    status
}

fn sof_event() -> InterruptStatus {
    let mut status = InterruptStatus::empty();
    status.common.modify(CommonInterrupt::SOF::SET);
    status
}

fn new_device<'a>(
    hw: &'a FakeController,
    source: &'a StaticDescriptors<'a>,
    client: &'a Recorder,
) -> UsbDevice<'a, FakeController> {
    let mut usb = UsbDevice::new(hw, DeviceConfig::new(&ENDPOINTS), source).unwrap();
    usb.set_client(client);
    usb.initialize();
    usb
}

fn control(hw: &FakeController, usb: &mut UsbDevice<'_, FakeController>, packet: [u8; 8]) {
    hw.host_setup(packet);
    usb.handle_events(ep0_event());
}

fn configure(hw: &FakeController, usb: &mut UsbDevice<'_, FakeController>, client: &Recorder) {
    control(hw, usb, set_address(5));
    control(hw, usb, set_configuration(1));
    assert_eq!(usb.state(), DeviceState::Configured);
    hw.take_sent();
    client.take();
}

#[test]
fn initialize_enters_default_state() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let usb = new_device(&hw, &source, &client);

    assert_eq!(usb.state(), DeviceState::Default);
    assert_eq!(usb.configuration(), 0);
    assert!(hw.attached.get());
    assert!(hw.interrupt_enabled.get());
    assert_eq!(
        client.take(),
        vec![Event::State(DeviceState::Attached, DeviceState::Default)]
    );
}

#[test]
fn self_powered_device_waits_for_vbus() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let mut config = DeviceConfig::new(&ENDPOINTS);
    config.bus_powered = false;
    config.polled = true;
    let mut usb = UsbDevice::new(&hw, config, &source).unwrap();
    usb.initialize();
    assert_eq!(usb.state(), DeviceState::Attached);
    assert!(!hw.interrupt_enabled.get());

    let mut reset = InterruptStatus::empty();
    reset.common.modify(CommonInterrupt::RESET::SET);
    hw.vbus.set(true);
    hw.pending.set(Some(reset));
    usb.handle_interrupt();
    assert_eq!(usb.state(), DeviceState::Default);
}

#[test]
fn rejects_invalid_layout() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let layout = [ENDPOINTS[0], ENDPOINTS[0]];
    assert!(matches!(
        UsbDevice::new(&hw, DeviceConfig::new(&layout), &source),
        Err(UsbError::Illegal)
    ));
}

#[test]
fn set_address_has_no_data_stage() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    control(&hw, &mut usb, set_address(5));
    assert_eq!(usb.state(), DeviceState::Addressed);
    assert_eq!(hw.address.get(), Some(5));
    assert_eq!(hw.data_end.get(), 1);
    assert_eq!(hw.bytes_written.get(), 0);
    // Only the SETUP packet itself was read.
    assert_eq!(hw.bytes_read.get(), 8);
    assert!(hw.take_sent().is_empty());
    assert!(!usb.is_busy(EP0));
}

#[test]
fn set_address_back_to_zero() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    control(&hw, &mut usb, set_address(0));
    assert_eq!(usb.state(), DeviceState::Default);
    control(&hw, &mut usb, set_address(9));
    control(&hw, &mut usb, set_address(0));
    assert_eq!(usb.state(), DeviceState::Default);
    assert_eq!(hw.address.get(), Some(0));
    assert_eq!(hw.stalls.get(), 0);
}

#[test]
fn set_address_above_127_is_rejected_in_every_state() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    control(&hw, &mut usb, set_address(128));
    assert_eq!(hw.stalls.get(), 1);
    assert_eq!(usb.state(), DeviceState::Default);
    assert_eq!(hw.address.get(), None);

    control(&hw, &mut usb, set_address(5));
    control(&hw, &mut usb, set_address(200));
    assert_eq!(hw.stalls.get(), 2);
    assert_eq!(usb.state(), DeviceState::Addressed);
    assert_eq!(hw.address.get(), Some(5));

    control(&hw, &mut usb, set_configuration(1));
    control(&hw, &mut usb, set_address(0x7fff));
    assert_eq!(hw.stalls.get(), 3);
    assert_eq!(usb.state(), DeviceState::Configured);

    // Even a valid address is refused once configured.
    control(&hw, &mut usb, set_address(6));
    assert_eq!(hw.stalls.get(), 4);
    assert_eq!(hw.address.get(), Some(5));
}

#[test]
fn get_device_descriptor_fits_one_packet() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    control(&hw, &mut usb, get_descriptor(1, 0, 64));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &DEVICE, true)]);
    assert!(!usb.is_busy(EP0));

    // Truncated to what the host asked for.
    control(&hw, &mut usb, get_descriptor(1, 0, 8));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &DEVICE[..8], true)]);
}

#[test]
fn exact_multiple_control_read_ends_with_zlp() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    control(&hw, &mut usb, get_descriptor(2, 0, 255));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &CONFIGURATION, false)]);
    assert!(usb.is_busy(EP0));

    // Nothing happens until the host collects the packet.
    usb.handle_events(ep0_event());
    assert!(hw.take_sent().is_empty());

    hw.host_take_in(0);
    usb.handle_events(ep0_event());
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &[], true)]);
    assert!(!usb.is_busy(EP0));
}

#[test]
fn serial_number_is_uid_in_lowercase_hex() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    let serial = [
        18, 3, b'd', 0, b'e', 0, b'a', 0, b'd', 0, b'b', 0, b'e', 0, b'e', 0, b'f', 0,
    ];
    control(&hw, &mut usb, get_descriptor(3, 3, 255));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &serial, true)]);

    // Clamped, never padded.
    control(&hw, &mut usb, get_descriptor(3, 3, 10));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &serial[..10], true)]);
}

#[test]
fn string_descriptors() {
    let hw = FakeController::default();
    let source = descriptors(Some(&[4, 3, b'K', 0, 0xff, 0xff]));
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    control(&hw, &mut usb, get_descriptor(3, 0, 255));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &LANGUAGES, true)]);
    control(&hw, &mut usb, get_descriptor(3, 1, 255));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &MANUFACTURER, true)]);
    control(&hw, &mut usb, get_descriptor(3, 2, 255));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &[4, 3, b'K', 0], true)]);

    control(&hw, &mut usb, get_descriptor(3, 9, 255));
    assert!(hw.take_sent().is_empty());
    assert_eq!(hw.stalls.get(), 1);
}

#[test]
fn corrupt_product_name_is_refused() {
    let hw = FakeController::default();
    let source = descriptors(Some(&[40, 3, b'K', 0]));
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    control(&hw, &mut usb, get_descriptor(3, 2, 255));
    assert!(hw.take_sent().is_empty());
    assert_eq!(hw.stalls.get(), 1);
    assert!(usb.is_busy(EP0));

    // The stall went out; the next request is served normally.
    control(&hw, &mut usb, get_descriptor(1, 0, 18));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &DEVICE, true)]);
}

#[test]
fn unsupported_standard_requests_stall() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    // GET_STATUS
    control(&hw, &mut usb, setup(0x80, 0, 0, 0, 2));
    // GET_CONFIGURATION
    control(&hw, &mut usb, setup(0x80, 8, 0, 0, 1));
    // SET_FEATURE
    control(&hw, &mut usb, setup(0x00, 3, 1, 0, 0));
    // Vendor request, no hook installed
    control(&hw, &mut usb, setup(0x40, 1, 0, 0, 0));
    assert_eq!(hw.stalls.get(), 4);
    assert_eq!(hw.bytes_written.get(), 0);
    assert_eq!(hw.data_end.get(), 0);
}

#[test]
fn set_configuration_activates_endpoints() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    control(&hw, &mut usb, set_address(5));
    // Configuration 0 while addressed is accepted and changes nothing.
    control(&hw, &mut usb, set_configuration(0));
    assert_eq!(usb.state(), DeviceState::Addressed);
    assert!(hw.activated.borrow().is_empty());

    control(&hw, &mut usb, set_configuration(2));
    assert_eq!(hw.stalls.get(), 1);

    control(&hw, &mut usb, set_configuration(1));
    assert_eq!(usb.state(), DeviceState::Configured);
    assert_eq!(usb.configuration(), 1);
    assert_eq!(
        *hw.activated.borrow(),
        vec![
            (EP1_IN, true),
            (EP1_OUT, true),
            (EP2_IN, false),
            (EP3_IN, false),
            (EP4_IN, false),
        ]
    );
    assert!(!usb.is_busy(EP1_IN));
}

#[test]
fn set_configuration_zero_aborts_data_endpoints() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report = [1u8, 2, 3, 4, 5];
    let bulk = [0u8; 100];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    assert_eq!(usb.write(EP1_IN, &report, true), Ok(()));
    assert_eq!(usb.write(EP2_IN, &bulk, true), Ok(()));
    assert_eq!(usb.write(EP3_IN, &bulk, true), Ok(()));
    control(&hw, &mut usb, set_configuration(0));

    assert_eq!(usb.state(), DeviceState::Addressed);
    assert_eq!(usb.configuration(), 0);
    assert_eq!(*hw.aborted.borrow(), vec![EP1_IN, EP2_IN, EP3_IN]);
    for ep in [EP1_IN, EP1_OUT, EP2_IN, EP3_IN, EP4_IN] {
        assert!(!usb.is_busy(ep));
        assert_eq!(usb.remaining(ep), 0);
    }
    // Not part of the configuration.
    assert!(usb.is_busy(EndpointAddress::new_in(6)));
    assert_eq!(usb.write(EP1_IN, &report, false), Err(UsbError::DeviceUnconfigured));
    assert!(matches!(
        usb.take_buffer(EP1_IN),
        Some(TransferBuffer::Tx(buf)) if buf == &report[..]
    ));
    // Aborted transfers are not reported.
    assert!(client.transfers().is_empty());
}

#[test]
fn reconfiguring_keeps_transfers() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report = [1u8, 2, 3];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    usb.write(EP1_IN, &report, false).unwrap();
    control(&hw, &mut usb, set_configuration(1));
    assert_eq!(usb.state(), DeviceState::Configured);
    assert_eq!(hw.activated.borrow().len(), 2 * ENDPOINTS.len());
    assert!(usb.is_busy(EP1_IN));
    assert!(hw.aborted.borrow().is_empty());
}

#[test]
fn data_endpoints_need_configuration() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report = [0u8; 8];
    let mut rx = [0u8; 8];
    let mut usb = new_device(&hw, &source, &client);

    assert_eq!(usb.write(EP1_IN, &report, false), Err(UsbError::DeviceUnconfigured));
    assert_eq!(usb.read(EP1_OUT, &mut rx, false), Err(UsbError::DeviceUnconfigured));
    assert!(hw.take_sent().is_empty());
}

#[test]
fn illegal_and_busy_requests_leave_state_untouched() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report = [1u8, 2, 3, 4, 5];
    let other = [9u8; 3];
    let mut rx = [0u8; 8];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    usb.write(EP1_IN, &report, true).unwrap();
    assert_eq!(usb.write(EP1_IN, &other, false), Err(UsbError::EndpointBusy));
    assert_eq!(usb.remaining(EP1_IN), 5);
    assert_eq!(hw.take_sent(), vec![Packet::new(1, &report, false)]);

    assert_eq!(usb.read(EP1_IN, &mut rx, false), Err(UsbError::Illegal));
    assert_eq!(usb.write(EP1_OUT, &other, false), Err(UsbError::Illegal));
    assert_eq!(
        usb.write(EndpointAddress::new_in(7), &other, false),
        Err(UsbError::Illegal)
    );
    assert_eq!(usb.abort(EP0), Err(UsbError::Illegal));

    // The original transfer still completes.
    usb.handle_events(in_event(1));
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP1_IN, TransferStatus::Ok, 5, 0)]
    );
}

#[test]
fn single_packet_in_transfer_without_zlp() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report = [0u8, 0, 4, 0, 0, 0, 0, 0];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    assert_eq!(usb.write(EP1_IN, &report, true), Ok(()));
    assert_eq!(hw.take_sent(), vec![Packet::new(1, &report, false)]);
    assert!(usb.is_busy(EP1_IN));

    usb.handle_events(in_event(1));
    assert!(hw.take_sent().is_empty());
    assert!(!usb.is_busy(EP1_IN));
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP1_IN, TransferStatus::Ok, 8, 0)]
    );
}

#[test]
fn multi_packet_in_transfer() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let data: [u8; 20] = core::array::from_fn(|i| i as u8);
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    usb.write(EP1_IN, &data, true).unwrap();
    usb.handle_events(in_event(1));
    usb.handle_events(in_event(1));
    assert_eq!(
        hw.take_sent(),
        vec![
            Packet::new(1, &data[..8], false),
            Packet::new(1, &data[8..16], false),
            Packet::new(1, &data[16..], false),
        ]
    );
    assert!(client.transfers().is_empty());

    usb.handle_events(in_event(1));
    assert!(hw.take_sent().is_empty());
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP1_IN, TransferStatus::Ok, 20, 0)]
    );
}

#[test]
fn transfers_without_callback_are_silent() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report = [7u8; 4];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    usb.write(EP1_IN, &report, false).unwrap();
    usb.handle_events(in_event(1));
    assert!(!usb.is_busy(EP1_IN));
    assert!(client.transfers().is_empty());
}

#[test]
fn out_transfer_ends_on_short_packet() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut rx = [0u8; 16];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    usb.read(EP1_OUT, &mut rx, true).unwrap();
    hw.host_out(1, &[1, 2, 3, 4, 5, 6, 7, 8]);
    usb.handle_events(out_event(1));
    assert!(usb.is_busy(EP1_OUT));
    assert!(!hw.out_ready[1].get());

    hw.host_out(1, &[9, 10, 11]);
    usb.handle_events(out_event(1));
    assert!(!usb.is_busy(EP1_OUT));
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP1_OUT, TransferStatus::Ok, 11, 5)]
    );
    match usb.take_buffer(EP1_OUT) {
        Some(TransferBuffer::Rx(buf)) => {
            assert_eq!(&buf[..11], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
            assert_eq!(&buf[11..], &[0; 5]);
        }
        _ => panic!("receive buffer not returned"),
    }
}

#[test]
fn out_overrun_leaves_buffer_intact() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut rx = [0xaau8; 4];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    usb.read(EP1_OUT, &mut rx, true).unwrap();
    let read_before = hw.bytes_read.get();
    hw.host_out(1, &[1, 2, 3, 4, 5, 6, 7, 8]);
    usb.handle_events(out_event(1));

    assert_eq!(hw.bytes_read.get(), read_before);
    // The packet stays in the controller.
    assert!(hw.out_ready[1].get());
    assert!(!usb.is_busy(EP1_OUT));
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(
            EP1_OUT,
            TransferStatus::RxBufferOverrun,
            0,
            4
        )]
    );
    assert!(matches!(
        usb.take_buffer(EP1_OUT),
        Some(TransferBuffer::Rx(buf)) if buf == &[0xaa; 4][..]
    ));
}

#[test]
fn unexpected_out_packet_is_held_until_read() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut rx = [0u8; 8];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    hw.host_out(1, &[0x02]);
    usb.handle_events(out_event(1));
    assert!(hw.out_ready[1].get());

    usb.read(EP1_OUT, &mut rx, true).unwrap();
    usb.handle_events(sof_event());
    assert!(!hw.out_ready[1].get());
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP1_OUT, TransferStatus::Ok, 1, 7)]
    );
}

#[test]
fn out_packet_after_completed_transfer_is_held_silently() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut rx = [0u8; 2];
    let mut next = [0u8; 2];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    usb.read(EP1_OUT, &mut rx, true).unwrap();
    hw.host_out(1, &[1, 2]);
    usb.handle_events(out_event(1));
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP1_OUT, TransferStatus::Ok, 2, 0)]
    );

    // The finished read no longer asks for callbacks.
    hw.host_out(1, &[3]);
    usb.handle_events(out_event(1));
    usb.handle_events(out_event(1));
    assert!(client.transfers().is_empty());
    assert!(hw.out_ready[1].get());

    usb.read(EP1_OUT, &mut next, true).unwrap();
    usb.handle_events(sof_event());
    assert!(!hw.out_ready[1].get());
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP1_OUT, TransferStatus::Ok, 1, 1)]
    );
}

#[test]
fn isochronous_in_starts_on_sof() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let samples = [0x55u8; 20];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    usb.write(EP4_IN, &samples, true).unwrap();
    assert!(hw.take_sent().is_empty());

    hw.frame.set(42);
    usb.handle_events(sof_event());
    assert_eq!(hw.take_sent(), vec![Packet::new(4, &samples[..16], false)]);
    assert_eq!(client.take(), vec![Event::Frame(42)]);

    // Only the first packet waits for a frame.
    usb.handle_events(in_event(4));
    assert_eq!(hw.take_sent(), vec![Packet::new(4, &samples[16..], false)]);
    usb.handle_events(in_event(4));
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP4_IN, TransferStatus::Ok, 20, 0)]
    );
}

#[test]
fn abort_all_stops_transmitting_endpoints() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let a = [1u8; 8];
    let b = [2u8; 64];
    let c = [3u8; 128];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);

    usb.write(EP1_IN, &a, true).unwrap();
    usb.write(EP2_IN, &b, true).unwrap();
    usb.write(EP3_IN, &c, true).unwrap();
    assert!(usb.is_busy(EP1_IN) && usb.is_busy(EP2_IN) && usb.is_busy(EP3_IN));

    usb.abort_all();
    assert_eq!(*hw.aborted.borrow(), vec![EP1_IN, EP2_IN, EP3_IN]);
    for ep in [EP1_IN, EP2_IN, EP3_IN] {
        assert!(!usb.is_busy(ep));
        assert_eq!(usb.remaining(ep), 0);
    }
    assert!(client.transfers().is_empty());

    // Aborting an idle endpoint does nothing.
    assert_eq!(usb.abort(EP1_IN), Ok(()));
    assert_eq!(hw.aborted.borrow().len(), 3);
}

#[test]
fn bus_reset_returns_to_default() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report = [1u8; 8];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);
    usb.write(EP1_IN, &report, true).unwrap();

    let mut reset = InterruptStatus::empty();
    reset.common.modify(CommonInterrupt::RESET::SET);
    usb.handle_events(reset);

    assert_eq!(usb.state(), DeviceState::Default);
    assert_eq!(usb.configuration(), 0);
    assert_eq!(hw.resets.get(), 1);
    assert_eq!(*hw.aborted.borrow(), vec![EP1_IN]);
    assert_eq!(
        client.take(),
        vec![
            Event::State(DeviceState::Configured, DeviceState::Default),
            Event::Reset,
        ]
    );
    assert_eq!(usb.write(EP1_IN, &report, false), Err(UsbError::DeviceUnconfigured));
}

#[test]
fn suspend_and_resume_keep_transfers() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report = [1u8; 8];
    let mut usb = new_device(&hw, &source, &client);
    configure(&hw, &mut usb, &client);
    usb.write(EP1_IN, &report, true).unwrap();

    let mut suspend = InterruptStatus::empty();
    suspend.common.modify(CommonInterrupt::SUSPEND::SET);
    usb.handle_events(suspend);
    assert_eq!(usb.state(), DeviceState::Suspended);
    assert!(hw.suspended.get());

    let mut resume = InterruptStatus::empty();
    resume.common.modify(CommonInterrupt::RESUME::SET);
    usb.handle_events(resume);
    assert_eq!(usb.state(), DeviceState::Configured);
    assert!(!hw.suspended.get());
    assert!(usb.is_busy(EP1_IN));
    assert!(hw.aborted.borrow().is_empty());
    assert_eq!(
        client.take(),
        vec![
            Event::State(DeviceState::Configured, DeviceState::Suspended),
            Event::State(DeviceState::Suspended, DeviceState::Configured),
        ]
    );
}

#[test]
fn reset_while_suspended_returns_to_default() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report = [1u8; 8];
    let mut usb = new_device(&hw, &source, &client);
    control(&hw, &mut usb, set_address(3));

    let mut suspend = InterruptStatus::empty();
    suspend.common.modify(CommonInterrupt::SUSPEND::SET);
    usb.handle_events(suspend);
    assert_eq!(usb.state(), DeviceState::Suspended);

    let mut reset = InterruptStatus::empty();
    reset.common.modify(CommonInterrupt::RESET::SET);
    usb.handle_events(reset);
    assert_eq!(usb.state(), DeviceState::Default);

    // Back to normal operation.
    control(&hw, &mut usb, set_address(4));
    control(&hw, &mut usb, set_configuration(1));
    assert_eq!(usb.write(EP1_IN, &report, false), Ok(()));
}

#[test]
fn handler_passes_skip_empty_status() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    usb.handle_interrupt();
    assert_eq!(client.passes.get(), 0);

    let mut status = sof_event();
    status.set_ep0();
    hw.host_setup(set_address(1));
    hw.pending.set(Some(status));
    hw.set_index(3);
    usb.handle_interrupt();
    assert_eq!(client.passes.get(), 1);
    assert_eq!(usb.state(), DeviceState::Addressed);
    // The register context survives the handler.
    assert_eq!(hw.index.get(), 3);
}

#[test]
fn control_write_waits_for_consumer_read() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let hook = VendorHook;
    let mut buf = [0u8; 64];
    let mut usb = new_device(&hw, &source, &client);
    usb.set_setup_hook(&hook);

    control(&hw, &mut usb, setup(0x40, 0x01, 0, 0, 64));
    assert_eq!(hw.stalls.get(), 0);

    // The data stage arrives before anyone is ready for it.
    hw.host_out(0, &[0x11; 64]);
    usb.handle_events(ep0_event());
    assert!(hw.out_ready[0].get());

    usb.read(EP0, &mut buf, true).unwrap();
    usb.handle_events(sof_event());
    assert!(!hw.out_ready[0].get());
    assert!(usb.is_busy(EP0));
    assert_eq!(hw.data_end.get(), 0);

    // A full packet must be followed by a zero-length one.
    hw.host_out(0, &[]);
    usb.handle_events(ep0_event());
    assert_eq!(hw.data_end.get(), 1);
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP0, TransferStatus::Ok, 64, 0)]
    );
    assert!(matches!(
        usb.take_buffer(EP0),
        Some(TransferBuffer::Rx(buf)) if buf.iter().all(|b| *b == 0x11)
    ));
}

#[test]
fn control_write_overrun() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let hook = VendorHook;
    let mut buf = [0u8; 4];
    let mut usb = new_device(&hw, &source, &client);
    usb.set_setup_hook(&hook);

    control(&hw, &mut usb, setup(0x40, 0x01, 0, 0, 8));
    usb.read(EP0, &mut buf, true).unwrap();
    hw.host_out(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
    usb.handle_events(ep0_event());
    assert_eq!(
        client.transfers(),
        vec![Event::Transfer(EP0, TransferStatus::RxBufferOverrun, 0, 4)]
    );
    assert!(hw.out_ready[0].get());
}

#[test]
fn setup_end_returns_ep0_to_idle() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let mut usb = new_device(&hw, &source, &client);

    control(&hw, &mut usb, get_descriptor(2, 0, 255));
    assert!(usb.is_busy(EP0));
    hw.take_sent();

    // The host gives up on the transfer and starts a new one.
    hw.ep0_setup_end.set(true);
    control(&hw, &mut usb, get_descriptor(1, 0, 18));
    assert!(!hw.ep0_setup_end.get());
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &DEVICE, true)]);
}

#[test]
fn hid_class_requests() {
    let hw = FakeController::default();
    let source = descriptors(None);
    let client = Recorder::default();
    let report_descriptor = [0x05u8, 0x01, 0x09, 0x06, 0xa1, 0x01, 0xc0];
    let hid_descriptor = [9u8, 0x21, 0x11, 0x01, 0, 1, 0x22, 7, 0];
    let interfaces = [HidInterface {
        number: 0,
        hid_descriptor: &hid_descriptor,
        report_descriptor: &report_descriptor,
    }];
    let hid = HidClass::new(&interfaces);
    let mut usb = new_device(&hw, &source, &client);
    usb.set_setup_hook(&hid);

    control(&hw, &mut usb, setup(0x81, 6, 0x2200, 0, 0xff));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &report_descriptor, true)]);
    control(&hw, &mut usb, setup(0x81, 6, 0x2100, 0, 0xff));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &hid_descriptor, true)]);

    // SET_IDLE, then GET_IDLE
    control(&hw, &mut usb, setup(0x21, 0x0a, 0x7d00, 0, 0));
    assert_eq!(hid.idle_rate(0), Some(0x7d));
    control(&hw, &mut usb, setup(0xa1, 0x02, 0, 0, 1));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &[0x7d], true)]);

    // SET_PROTOCOL(boot), then GET_PROTOCOL
    control(&hw, &mut usb, setup(0x21, 0x0b, 0, 0, 0));
    assert_eq!(hid.protocol(0), Some(Protocol::Boot));
    control(&hw, &mut usb, setup(0xa1, 0x03, 0, 0, 1));
    assert_eq!(hw.take_sent(), vec![Packet::new(0, &[0], true)]);
    assert_eq!(hw.stalls.get(), 0);

    // SET_REPORT is left to someone else; nobody takes it.
    control(&hw, &mut usb, setup(0x21, 0x09, 0x0200, 0, 0));
    assert_eq!(hw.stalls.get(), 1);
    // Unknown interface
    control(&hw, &mut usb, setup(0x81, 6, 0x2200, 3, 0xff));
    assert_eq!(hw.stalls.get(), 2);
    // Idle rates for a single report ID are not supported.
    control(&hw, &mut usb, setup(0x21, 0x0a, 0x2001, 0, 0));
    assert_eq!(hw.stalls.get(), 3);
    assert_eq!(hid.idle_rate(0), Some(0x7d));
    control(&hw, &mut usb, setup(0xa1, 0x02, 0x0001, 0, 1));
    assert_eq!(hw.stalls.get(), 4);
    assert!(hw.take_sent().is_empty());
    // Standard requests still reach the dispatcher.
    control(&hw, &mut usb, set_address(7));
    assert_eq!(usb.state(), DeviceState::Addressed);
}
