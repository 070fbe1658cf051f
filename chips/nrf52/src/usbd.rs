// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Universal Serial Bus Device with EasyDMA (USBD)
//!
//! The USBD peripheral moves packets between its internal buffers and RAM
//! with EasyDMA, while the transfer engine in `capsules-usbd` expects a
//! controller with byte-wide FIFOs. Each endpoint therefore gets a RAM
//! staging buffer per direction:
//!
//! - IN: the engine fills the staging buffer byte by byte, then committing
//!   the packet starts the DMA into the peripheral.
//! - OUT: when a packet arrives it is copied into the staging buffer right
//!   away, and the engine drains it byte by byte.
//!
//! SETUP packets are not DMAed at all; their eight bytes are latched from the
//! SETUP registers into the endpoint 0 OUT staging buffer.
//!
//! The peripheral tracks the device address by itself, so
//! `UsbHardware::set_address` does nothing. The isochronous endpoint pair of
//! the peripheral is mapped to whichever endpoint number the configuration
//! declares isochronous.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let power = static_init!(nrf52::power::Power, nrf52::power::Power::new());
//! let usbd = static_init!(nrf52::usbd::Usbd<'static>, nrf52::usbd::Usbd::new(power));
//!
//! // POWER_CLOCK interrupt vector
//! usbd.handle_power_interrupt();
//! // USBD interrupt vector
//! usb_device.handle_interrupt();
//! ```

use core::cell::Cell;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};
use tock_registers::{register_bitfields, register_structs};

use capsules_usbd::config::EndpointConfig;
use capsules_usbd::hil::{CommonInterrupt, InterruptStatus, UsbHardware};

use crate::nvic::{Nvic, USBD_IRQ};
use crate::power::{Power, UsbPowerEvent};
use crate::static_ref::StaticRef;

const USBD_BASE: StaticRef<UsbdRegisters> =
    unsafe { StaticRef::new(0x40027000 as *const UsbdRegisters) };

const CHIPINFO_BASE: StaticRef<ChipInfoRegisters> =
    unsafe { StaticRef::new(0x10000130 as *const ChipInfoRegisters) };

const USBERRATA_BASE: StaticRef<UsbErrataRegisters> =
    unsafe { StaticRef::new(0x4006EC00 as *const UsbErrataRegisters) };

const NUM_ENDPOINTS: usize = 8;

/// Size of the staging buffer of a bulk, interrupt or control endpoint.
const PACKET_SIZE: usize = 64;

/// Size of the staging buffer of the isochronous endpoints.
const ISO_PACKET_SIZE: usize = 1023;

/// Polling rounds before an EasyDMA transfer or the peripheral start-up is
/// considered lost.
const SPIN_LIMIT: usize = 10_000;

/// Unlock value of the errata register bank.
const ERRATA_UNLOCK: u32 = 0x9375;

register_structs! {
    ChipInfoRegisters {
        /// Undocumented register indicating the model of the chip
        (0x000 => chip_model: ReadOnly<u32, ChipModel::Register>),
        /// Undocumented register indicating the revision of the chip
        (0x004 => chip_revision: ReadOnly<u32, ChipRevision::Register>),
        (0x008 => @END),
    },

    UsbErrataRegisters {
        /// Undocumented register - unlocks the bank
        (0x000 => reg0: ReadWrite<u32>),
        (0x004 => _reserved0),
        /// Undocumented register - Errata 171
        (0x014 => reg14: WriteOnly<u32>),
        (0x018 => _reserved1),
        /// Undocumented register - Errata 187
        (0x114 => reg114: WriteOnly<u32>),
        (0x118 => @END),
    },

    UsbdRegisters {
        (0x000 => _reserved0),
        /// Captures the EPIN\[n\].PTR and EPIN\[n\].MAXCNT registers values
        /// and starts the DMA into endpoint IN n
        (0x004 => task_startepin: [WriteOnly<u32, Task::Register>; NUM_ENDPOINTS]),
        /// Captures the ISOIN.PTR and ISOIN.MAXCNT registers values and
        /// starts the DMA into the iso IN endpoint
        (0x024 => task_startisoin: WriteOnly<u32, Task::Register>),
        /// Captures the EPOUT\[n\].PTR and EPOUT\[n\].MAXCNT registers values
        /// and starts the DMA out of endpoint OUT n
        (0x028 => task_startepout: [WriteOnly<u32, Task::Register>; NUM_ENDPOINTS]),
        /// Captures the ISOOUT.PTR and ISOOUT.MAXCNT registers values and
        /// starts the DMA out of the iso OUT endpoint
        (0x048 => task_startisoout: WriteOnly<u32, Task::Register>),
        /// Allows OUT data stage on control endpoint 0
        (0x04C => task_ep0rcvout: WriteOnly<u32, Task::Register>),
        /// Allows status stage on control endpoint 0
        (0x050 => task_ep0status: WriteOnly<u32, Task::Register>),
        /// STALLs data and status stage on control endpoint 0
        (0x054 => task_ep0stall: WriteOnly<u32, Task::Register>),
        (0x058 => _reserved1),
        /// Signals that a USB reset condition has been detected on the USB
        /// lines
        (0x100 => event_usbreset: ReadWrite<u32, Event::Register>),
        (0x104 => _reserved2),
        /// The whole EPIN\[n\] buffer has been consumed.
        /// The RAM buffer can be accessed safely by software.
        (0x108 => event_endepin: [ReadWrite<u32, Event::Register>; NUM_ENDPOINTS]),
        /// An acknowledged data transfer has taken place on the control
        /// endpoint
        (0x128 => event_ep0datadone: ReadWrite<u32, Event::Register>),
        /// The whole ISOIN buffer has been consumed.
        (0x12C => event_endisoin: ReadWrite<u32, Event::Register>),
        /// The whole EPOUT\[n\] buffer has been consumed.
        (0x130 => event_endepout: [ReadWrite<u32, Event::Register>; NUM_ENDPOINTS]),
        /// The whole ISOOUT buffer has been consumed.
        (0x150 => event_endisoout: ReadWrite<u32, Event::Register>),
        /// Signals that a SOF (start of frame) condition has been detected on
        /// the USB lines
        (0x154 => event_sof: ReadWrite<u32, Event::Register>),
        /// An event or an error not covered by specific events has occurred,
        /// check EVENTCAUSE register to find the cause
        (0x158 => event_usbevent: ReadWrite<u32, Event::Register>),
        /// A valid SETUP token has been received (and acknowledged) on the
        /// control endpoint
        (0x15C => event_ep0setup: ReadWrite<u32, Event::Register>),
        /// A data transfer has occurred on a data endpoint, indicated by the
        /// EPDATASTATUS register
        (0x160 => event_epdata: ReadWrite<u32, Event::Register>),
        (0x164 => _reserved3),
        /// Shortcut register
        (0x200 => shorts: ReadWrite<u32, Shorts::Register>),
        (0x204 => _reserved4),
        /// Enable interrupt
        (0x304 => intenset: ReadWrite<u32, Interrupt::Register>),
        /// Disable interrupt
        (0x308 => intenclr: ReadWrite<u32, Interrupt::Register>),
        (0x30C => _reserved5),
        /// Details on event that caused the USBEVENT event
        (0x400 => eventcause: ReadWrite<u32, EventCause::Register>),
        (0x404 => _reserved6),
        /// Provides information on which endpoint(s) an acknowledged data
        /// transfer has occurred (EPDATA event)
        (0x46C => epdatastatus: ReadWrite<u32, EndpointStatus::Register>),
        (0x470 => _reserved7),
        /// SETUP data, byte 0, bmRequestType
        (0x480 => bmrequesttype: ReadOnly<u32, Byte::Register>),
        /// SETUP data, byte 1, bRequest
        (0x484 => brequest: ReadOnly<u32, Byte::Register>),
        /// SETUP data, byte 2, wValue LSB
        (0x488 => wvaluel: ReadOnly<u32, Byte::Register>),
        /// SETUP data, byte 3, wValue MSB
        (0x48C => wvalueh: ReadOnly<u32, Byte::Register>),
        /// SETUP data, byte 4, wIndex LSB
        (0x490 => windexl: ReadOnly<u32, Byte::Register>),
        /// SETUP data, byte 5, wIndex MSB
        (0x494 => windexh: ReadOnly<u32, Byte::Register>),
        /// SETUP data, byte 6, wLength LSB
        (0x498 => wlengthl: ReadOnly<u32, Byte::Register>),
        /// SETUP data, byte 7, wLength MSB
        (0x49C => wlengthh: ReadOnly<u32, Byte::Register>),
        /// Amount of bytes received last in the data stage of this OUT\[n\]
        /// endpoint. Writing any value releases the endpoint buffer.
        (0x4A0 => size_epout: [ReadWrite<u32, EndpointSize::Register>; NUM_ENDPOINTS]),
        /// Amount of bytes received last on the iso OUT data endpoint
        (0x4C0 => size_isoout: ReadOnly<u32, IsoEndpointSize::Register>),
        (0x4C4 => _reserved8),
        /// Enable USB
        (0x500 => enable: ReadWrite<u32, Usb::Register>),
        /// Control of the USB pull-up
        (0x504 => usbpullup: ReadWrite<u32, UsbPullup::Register>),
        (0x508 => _reserved9),
        /// Data toggle control and status
        (0x50C => dtoggle: ReadWrite<u32, Toggle::Register>),
        /// Endpoint IN enable
        (0x510 => epinen: ReadWrite<u32, EndpointEnable::Register>),
        /// Endpoint OUT enable
        (0x514 => epouten: ReadWrite<u32, EndpointEnable::Register>),
        (0x518 => _reserved10),
        /// Controls the split of ISO buffers
        (0x51C => isosplit: ReadWrite<u32, IsoSplit::Register>),
        /// Returns the current value of the start of frame counter
        (0x520 => framecntr: ReadOnly<u32, FrameCounter::Register>),
        (0x524 => _reserved11),
        /// Controls USBD peripheral low power mode during USB suspend
        (0x52C => lowpower: ReadWrite<u32, LowPower::Register>),
        /// Controls the response of the ISO IN endpoint to an IN token when
        /// no data is ready to be sent
        (0x530 => isoinconfig: ReadWrite<u32, IsoInConfig::Register>),
        (0x534 => _reserved12),
        (0x600 => epin: [EndpointRegisters; NUM_ENDPOINTS]),
        (0x6A0 => isoin: EndpointRegisters),
        (0x6B4 => _reserved13),
        (0x700 => epout: [EndpointRegisters; NUM_ENDPOINTS]),
        (0x7A0 => isoout: EndpointRegisters),
        (0x7B4 => _reserved14),
        /// Undocumented register selecting an endpoint buffer to flush
        (0x800 => flush_select: ReadWrite<u32>),
        /// Undocumented register flushing the selected endpoint buffer
        (0x804 => flush_data: ReadWrite<u32>),
        (0x808 => _reserved15),
        /// Errata 199 related register (USBD cannot receive tasks during DMA)
        (0xC1C => errata199: WriteOnly<u32>),
        (0xC20 => @END),
    },

    EndpointRegisters {
        (0x000 => ptr: ReadWrite<u32>),
        (0x004 => maxcnt: ReadWrite<u32, Count::Register>),
        (0x008 => amount: ReadOnly<u32, Count::Register>),
        (0x00C => _reserved),
        (0x014 => @END),
    }
}

register_bitfields! [u32,
    /// Start task
    Task [
        ENABLE OFFSET(0) NUMBITS(1)
    ],

    /// Read event
    Event [
        READY OFFSET(0) NUMBITS(1)
    ],

    /// Shortcuts
    Shorts [
        // Shortcut between EP0DATADONE event and EP0STATUS task
        EP0DATADONE_EP0STATUS OFFSET(2) NUMBITS(1)
    ],

    /// USB Interrupts
    Interrupt [
        USBRESET OFFSET(0) NUMBITS(1),
        EP0DATADONE OFFSET(10) NUMBITS(1),
        SOF OFFSET(21) NUMBITS(1),
        USBEVENT OFFSET(22) NUMBITS(1),
        EP0SETUP OFFSET(23) NUMBITS(1),
        EPDATA OFFSET(24) NUMBITS(1)
    ],

    /// Cause of a USBEVENT event
    EventCause [
        ISOOUTCRC OFFSET(0) NUMBITS(1),
        SUSPEND OFFSET(8) NUMBITS(1),
        RESUME OFFSET(9) NUMBITS(1),
        USBWUALLOWED OFFSET(10) NUMBITS(1),
        READY OFFSET(11) NUMBITS(1)
    ],

    /// One bit per IN endpoint in the low half, per OUT endpoint in the
    /// high half
    EndpointStatus [
        EPIN OFFSET(0) NUMBITS(8),
        EPOUT OFFSET(16) NUMBITS(8)
    ],

    Byte [
        VALUE OFFSET(0) NUMBITS(8)
    ],

    EndpointSize [
        SIZE OFFSET(0) NUMBITS(7)
    ],

    IsoEndpointSize [
        SIZE OFFSET(0) NUMBITS(10),
        ZERO OFFSET(16) NUMBITS(1)
    ],

    /// Enable USB
    Usb [
        ENABLE OFFSET(0) NUMBITS(1) [
            OFF = 0,
            ON = 1
        ]
    ],

    UsbPullup [
        CONNECT OFFSET(0) NUMBITS(1) [
            Disabled = 0,
            Enabled = 1
        ]
    ],

    Toggle [
        EP OFFSET(0) NUMBITS(3) [],
        IO OFFSET(7) NUMBITS(1) [
            Out = 0,
            In = 1
        ],
        VALUE OFFSET(8) NUMBITS(2) [
            Nop = 0,
            Data0 = 1,
            Data1 = 2
        ]
    ],

    /// Bits 0 to 7 enable the numbered endpoints, bit 8 the iso endpoint
    EndpointEnable [
        EP OFFSET(0) NUMBITS(8) [],
        ISO OFFSET(8) NUMBITS(1) []
    ],

    IsoSplit [
        SPLIT OFFSET(0) NUMBITS(16) [
            OneDir = 0x0000,
            HalfIN = 0x0080
        ]
    ],

    FrameCounter [
        FRAMECNTR OFFSET(0) NUMBITS(11)
    ],

    LowPower [
        LOWPOWER OFFSET(0) NUMBITS(1) [
            ForceNormal = 0,
            LowPower = 1
        ]
    ],

    IsoInConfig [
        RESPONSE OFFSET(0) NUMBITS(1) [
            NoResp = 0,
            ZeroData = 1
        ]
    ],

    Count [
        // 7 bits for a bulk endpoint but 10 bits for ISO EP
        MAXCNT OFFSET(0) NUMBITS(10)
    ],

    ChipModel [
        MODEL OFFSET(0) NUMBITS(32) [
            NRF52840 = 8
        ]
    ],

    ChipRevision [
        REV OFFSET(0) NUMBITS(32) [
            REVA = 0,
            REVB = 1,
            REVC = 2,
            REVD = 3
        ]
    ]
];

/// Revision of the nRF52840 we are running on, `None` on other chips.
fn chip_revision() -> Option<ChipRevision::REV::Value> {
    if CHIPINFO_BASE
        .chip_model
        .matches_all(ChipModel::MODEL::NRF52840)
    {
        CHIPINFO_BASE.chip_revision.read_as_enum(ChipRevision::REV)
    } else {
        None
    }
}

fn has_errata_171() -> bool {
    chip_revision().is_some()
}

fn has_errata_187() -> bool {
    matches!(
        chip_revision(),
        Some(ChipRevision::REV::Value::REVB)
            | Some(ChipRevision::REV::Value::REVC)
            | Some(ChipRevision::REV::Value::REVD)
    )
}

/// Write one of the undocumented errata registers, unlocking the bank
/// around the write if it is locked.
fn errata_write(write: impl Fn(&UsbErrataRegisters)) {
    let errata = &*USBERRATA_BASE;
    if errata.reg0.get() == 0 {
        errata.reg0.set(ERRATA_UNLOCK);
        write(errata);
        errata.reg0.set(ERRATA_UNLOCK);
    } else {
        write(errata);
    }
}

/// Consume an event, returning whether it was pending.
fn take_event(event: &ReadWrite<u32, Event::Register>) -> bool {
    let pending = event.is_set(Event::READY);
    if pending {
        event.write(Event::READY::CLEAR);
    }
    pending
}

/// RAM staging buffer of one endpoint direction.
struct Fifo<const N: usize> {
    buffer: Cell<[u8; N]>,
    len: Cell<usize>,
}

impl<const N: usize> Fifo<N> {
    const fn new() -> Self {
        Fifo {
            buffer: Cell::new([0; N]),
            len: Cell::new(0),
        }
    }

    fn view(&self) -> FifoView<'_> {
        let buffer: &Cell<[u8]> = &self.buffer;
        FifoView {
            cells: buffer.as_slice_of_cells(),
            len: &self.len,
        }
    }
}

/// A staging buffer with its length erased.
#[derive(Clone, Copy)]
struct FifoView<'f> {
    cells: &'f [Cell<u8>],
    len: &'f Cell<usize>,
}

impl FifoView<'_> {
    fn dma_ptr(&self) -> u32 {
        self.cells.as_ptr() as u32
    }

    fn push(&self, byte: u8) {
        let len = self.len.get();
        if let Some(cell) = self.cells.get(len) {
            cell.set(byte);
            self.len.set(len + 1);
        }
    }

    fn byte(&self, position: usize) -> u8 {
        if position < self.len.get() {
            self.cells.get(position).map_or(0, Cell::get)
        } else {
            0
        }
    }
}

pub struct Usbd<'a> {
    registers: StaticRef<UsbdRegisters>,
    power: &'a Power,
    nvic: Nvic,
    /// Endpoint selected by `set_index`.
    index: Cell<u8>,
    attach_requested: Cell<bool>,

    in_fifos: [Fifo<PACKET_SIZE>; NUM_ENDPOINTS],
    out_fifos: [Fifo<PACKET_SIZE>; NUM_ENDPOINTS],
    iso_in_fifo: Fifo<ISO_PACKET_SIZE>,
    iso_out_fifo: Fifo<ISO_PACKET_SIZE>,
    /// Endpoint numbers served by the iso endpoint pair.
    iso_in: Cell<Option<u8>>,
    iso_out: Cell<Option<u8>>,

    reading: Cell<Option<u8>>,
    read_position: Cell<usize>,
    writing: Cell<Option<u8>>,

    /// Bit n: a packet was handed to IN endpoint n and not yet acknowledged.
    in_busy: Cell<u8>,
    /// Bit n: a received packet waits in the staging buffer of OUT
    /// endpoint n.
    out_ready: Cell<u8>,

    /// Direction of the data stage of the current control transfer.
    ep0_in: Cell<bool>,
    /// A control transfer is between its SETUP and its status stage.
    ep0_open: Cell<bool>,
    ep0_sent_stall: Cell<bool>,
    ep0_setup_end: Cell<bool>,
}

impl<'a> Usbd<'a> {
    pub fn new(power: &'a Power) -> Self {
        Usbd {
            registers: USBD_BASE,
            power,
            nvic: unsafe { Nvic::new(USBD_IRQ) },
            index: Cell::new(0),
            attach_requested: Cell::new(false),
            in_fifos: [const { Fifo::new() }; NUM_ENDPOINTS],
            out_fifos: [const { Fifo::new() }; NUM_ENDPOINTS],
            iso_in_fifo: Fifo::new(),
            iso_out_fifo: Fifo::new(),
            iso_in: Cell::new(None),
            iso_out: Cell::new(None),
            reading: Cell::new(None),
            read_position: Cell::new(0),
            writing: Cell::new(None),
            in_busy: Cell::new(0),
            out_ready: Cell::new(0),
            ep0_in: Cell::new(false),
            ep0_open: Cell::new(false),
            ep0_sent_stall: Cell::new(false),
            ep0_setup_end: Cell::new(false),
        }
    }

    /// Handle the USB supply events of the POWER peripheral. Call from the
    /// POWER_CLOCK interrupt.
    pub fn handle_power_interrupt(&self) {
        while let Some(event) = self.power.take_usb_event() {
            log::debug!("usbd: supply {:?}", event);
            match event {
                UsbPowerEvent::Detected => self.enable(),
                UsbPowerEvent::Ready => {
                    if self.attach_requested.get() {
                        self.pullup(true);
                    }
                }
                UsbPowerEvent::Removed => self.disable(),
            }
        }
    }

    fn is_enabled(&self) -> bool {
        self.registers.enable.matches_all(Usb::ENABLE::ON)
    }

    /// Power up the peripheral, with the start-up workarounds the chip
    /// revision needs.
    fn enable(&self) {
        if self.is_enabled() {
            return;
        }
        let regs = &*self.registers;
        let errata_171 = has_errata_171();
        let errata_187 = has_errata_187();

        if errata_187 {
            errata_write(|e| e.reg114.set(0x3));
        }
        if errata_171 {
            errata_write(|e| e.reg14.set(0xC0));
        }

        regs.enable.write(Usb::ENABLE::ON);
        let mut ready = false;
        for _ in 0..SPIN_LIMIT {
            if regs.eventcause.is_set(EventCause::READY) {
                ready = true;
                break;
            }
        }
        regs.eventcause.write(EventCause::READY::SET);
        if !ready {
            log::warn!("usbd: peripheral did not report ready");
        }

        if errata_171 {
            errata_write(|e| e.reg14.set(0x0));
        }
        if errata_187 {
            errata_write(|e| e.reg114.set(0x0));
        }

        regs.lowpower.write(LowPower::LOWPOWER::ForceNormal);
        regs.isoinconfig.write(IsoInConfig::RESPONSE::ZeroData);
        self.clear_endpoint_state();
    }

    fn disable(&self) {
        self.pullup(false);
        self.registers.enable.write(Usb::ENABLE::OFF);
        self.clear_endpoint_state();
    }

    fn pullup(&self, connect: bool) {
        if connect {
            self.registers.usbpullup.write(UsbPullup::CONNECT::Enabled);
        } else {
            self.registers.usbpullup.write(UsbPullup::CONNECT::Disabled);
        }
    }

    fn clear_endpoint_state(&self) {
        self.in_busy.set(0);
        self.out_ready.set(0);
        self.iso_in.set(None);
        self.iso_out.set(None);
        self.ep0_open.set(false);
        self.ep0_sent_stall.set(false);
        self.ep0_setup_end.set(false);
        self.registers.shorts.write(Shorts::EP0DATADONE_EP0STATUS::CLEAR);
    }

    fn in_fifo(&self, number: u8) -> Option<FifoView<'_>> {
        if self.iso_in.get() == Some(number) {
            Some(self.iso_in_fifo.view())
        } else {
            self.in_fifos.get(number as usize).map(Fifo::view)
        }
    }

    fn out_fifo(&self, number: u8) -> Option<FifoView<'_>> {
        if self.iso_out.get() == Some(number) {
            Some(self.iso_out_fifo.view())
        } else {
            self.out_fifos.get(number as usize).map(Fifo::view)
        }
    }

    fn set_bit(cell: &Cell<u8>, number: u8, value: bool) {
        let bit = 1 << (number & 7);
        if value {
            cell.set(cell.get() | bit);
        } else {
            cell.set(cell.get() & !bit);
        }
    }

    fn bit(cell: &Cell<u8>, number: u8) -> bool {
        cell.get() & (1 << (number & 7)) != 0
    }

    /// Run an EasyDMA transfer to completion.
    fn dma(&self, start: &WriteOnly<u32, Task::Register>, end: &ReadWrite<u32, Event::Register>) {
        let regs = &*self.registers;
        regs.errata199.set(0x82);
        start.write(Task::ENABLE::SET);
        let mut done = false;
        for _ in 0..SPIN_LIMIT {
            if take_event(end) {
                done = true;
                break;
            }
        }
        regs.errata199.set(0x0);
        if !done {
            log::warn!("usbd: DMA timed out");
        }
    }

    /// Move the staged packet of IN endpoint `number` into the peripheral.
    fn transmit(&self, number: u8) {
        let regs = &*self.registers;
        let fifo = match self.in_fifo(number) {
            Some(fifo) => fifo,
            None => return,
        };
        let count = Count::MAXCNT.val(fifo.len.get() as u32);
        if self.iso_in.get() == Some(number) {
            regs.isoin.ptr.set(fifo.dma_ptr());
            regs.isoin.maxcnt.write(count);
            self.dma(&regs.task_startisoin, &regs.event_endisoin);
        } else {
            let n = number as usize;
            regs.epin[n].ptr.set(fifo.dma_ptr());
            regs.epin[n].maxcnt.write(count);
            self.dma(&regs.task_startepin[n], &regs.event_endepin[n]);
        }
        Self::set_bit(&self.in_busy, number, true);
    }

    /// Copy the packet received on OUT endpoint `number` into its staging
    /// buffer.
    fn receive(&self, number: u8) {
        let regs = &*self.registers;
        let fifo = match self.out_fifo(number) {
            Some(fifo) => fifo,
            None => return,
        };
        if self.iso_out.get() == Some(number) {
            let size = regs.size_isoout.read(IsoEndpointSize::SIZE) as usize;
            let size = size.min(fifo.cells.len());
            regs.isoout.ptr.set(fifo.dma_ptr());
            regs.isoout.maxcnt.write(Count::MAXCNT.val(size as u32));
            self.dma(&regs.task_startisoout, &regs.event_endisoout);
            fifo.len.set(regs.isoout.amount.read(Count::MAXCNT) as usize);
        } else {
            let n = number as usize;
            let size = regs.size_epout[n].read(EndpointSize::SIZE) as usize;
            let size = size.min(fifo.cells.len());
            regs.epout[n].ptr.set(fifo.dma_ptr());
            regs.epout[n].maxcnt.write(Count::MAXCNT.val(size as u32));
            self.dma(&regs.task_startepout[n], &regs.event_endepout[n]);
            fifo.len.set(size);
        }
        Self::set_bit(&self.out_ready, number, true);
    }

    /// Latch the SETUP registers into the endpoint 0 OUT staging buffer.
    fn latch_setup(&self) {
        let regs = &*self.registers;
        let bytes = [
            &regs.bmrequesttype,
            &regs.brequest,
            &regs.wvaluel,
            &regs.wvalueh,
            &regs.windexl,
            &regs.windexh,
            &regs.wlengthl,
            &regs.wlengthh,
        ];
        let fifo = self.out_fifos[0].view();
        fifo.len.set(0);
        for register in bytes {
            fifo.push(register.read(Byte::VALUE) as u8);
        }

        // A new SETUP ends whatever control transfer was in progress.
        if self.ep0_open.get() {
            self.ep0_setup_end.set(true);
        }
        self.ep0_open.set(true);
        self.ep0_in.set(fifo.byte(0) & 0x80 != 0);
        regs.shorts.modify(Shorts::EP0DATADONE_EP0STATUS::CLEAR);
        Self::set_bit(&self.in_busy, 0, false);
        Self::set_bit(&self.out_ready, 0, true);
    }

    /// End the current control transfer; `status` completes it with a
    /// status stage.
    fn close_control(&self, status: bool) {
        if status {
            self.registers.task_ep0status.write(Task::ENABLE::SET);
        }
        self.ep0_open.set(false);
    }

    fn reset_toggle(&self, number: u8, is_in: bool) {
        let regs = &*self.registers;
        let io = if is_in {
            Toggle::IO::In
        } else {
            Toggle::IO::Out
        };
        // Select the endpoint first, then force DATA0.
        regs.dtoggle
            .write(Toggle::EP.val(number as u32) + io + Toggle::VALUE::Nop);
        regs.dtoggle
            .write(Toggle::EP.val(number as u32) + io + Toggle::VALUE::Data0);
    }
}

impl UsbHardware for Usbd<'_> {
    type Context = u8;

    fn init(&self, _bus_powered: bool) {
        self.power.enable_usb_interrupts();
        if self.power.is_vbus_present() {
            self.enable();
        }
    }

    fn attach(&self) {
        self.attach_requested.set(true);
        if self.is_enabled() && self.power.is_usb_supply_ready() {
            self.pullup(true);
        }
    }

    fn detach(&self) {
        self.attach_requested.set(false);
        self.pullup(false);
    }

    fn vbus_present(&self) -> bool {
        self.power.is_vbus_present()
    }

    fn reset_complete(&self) {
        let regs = &*self.registers;
        regs.epinen.write(EndpointEnable::EP.val(1));
        regs.epouten.write(EndpointEnable::EP.val(1));
        regs.lowpower.write(LowPower::LOWPOWER::ForceNormal);
        self.clear_endpoint_state();
    }

    fn suspend(&self) {
        self.registers
            .lowpower
            .write(LowPower::LOWPOWER::LowPower);
    }

    fn resume(&self) {
        self.registers
            .lowpower
            .write(LowPower::LOWPOWER::ForceNormal);
    }

    fn set_address(&self, _address: u8) {}

    fn enable_interrupt(&self) {
        self.registers.intenset.write(
            Interrupt::USBRESET::SET
                + Interrupt::EP0DATADONE::SET
                + Interrupt::SOF::SET
                + Interrupt::USBEVENT::SET
                + Interrupt::EP0SETUP::SET
                + Interrupt::EPDATA::SET,
        );
        self.nvic.clear_pending();
        self.nvic.enable();
    }

    fn mask_interrupt(&self) -> bool {
        let was_enabled = self.nvic.is_enabled();
        self.nvic.disable();
        was_enabled
    }

    fn restore_interrupt(&self, was_enabled: bool) {
        if was_enabled {
            self.nvic.enable();
        }
    }

    fn save_context(&self) -> u8 {
        self.index.get()
    }

    fn restore_context(&self, context: u8) {
        self.index.set(context);
    }

    fn interrupt_status(&self) -> InterruptStatus {
        let regs = &*self.registers;
        let mut status = InterruptStatus::empty();

        if take_event(&regs.event_usbreset) {
            status.common.modify(CommonInterrupt::RESET::SET);
        }

        if take_event(&regs.event_usbevent) {
            let cause = regs.eventcause.extract();
            // Write one to clear.
            regs.eventcause.set(cause.get());
            if cause.is_set(EventCause::SUSPEND) {
                status.common.modify(CommonInterrupt::SUSPEND::SET);
            }
            if cause.is_set(EventCause::RESUME) {
                status.common.modify(CommonInterrupt::RESUME::SET);
            }
            if cause.is_set(EventCause::ISOOUTCRC) {
                log::warn!("usbd: iso OUT CRC error");
            }
        }

        if take_event(&regs.event_sof) {
            status.common.modify(CommonInterrupt::SOF::SET);
            // Iso traffic of the previous frame is done by now.
            if let Some(number) = self.iso_in.get() {
                if Self::bit(&self.in_busy, number) {
                    Self::set_bit(&self.in_busy, number, false);
                    status.set_in_endpoint(number);
                }
            }
            if let Some(number) = self.iso_out.get() {
                let size = regs.size_isoout.extract();
                if size.read(IsoEndpointSize::SIZE) > 0 || size.is_set(IsoEndpointSize::ZERO) {
                    self.receive(number);
                    status.set_out_endpoint(number);
                }
            }
        }

        if take_event(&regs.event_ep0setup) {
            self.latch_setup();
            status.set_ep0();
        }

        if take_event(&regs.event_ep0datadone) {
            if self.ep0_in.get() {
                Self::set_bit(&self.in_busy, 0, false);
            } else {
                self.receive(0);
            }
            status.set_ep0();
        }

        if take_event(&regs.event_epdata) {
            let data = regs.epdatastatus.extract();
            regs.epdatastatus.set(data.get());
            let done_in = data.read(EndpointStatus::EPIN) as u8;
            let done_out = data.read(EndpointStatus::EPOUT) as u8;
            for number in 1..NUM_ENDPOINTS as u8 {
                if done_in & (1 << number) != 0 {
                    Self::set_bit(&self.in_busy, number, false);
                    status.set_in_endpoint(number);
                }
                if done_out & (1 << number) != 0 {
                    self.receive(number);
                    status.set_out_endpoint(number);
                }
            }
        }

        status
    }

    fn frame_number(&self) -> u16 {
        self.registers.framecntr.read(FrameCounter::FRAMECNTR) as u16
    }

    fn index(&self) -> u8 {
        self.index.get()
    }

    fn set_index(&self, index: u8) {
        self.index.set(index);
    }

    fn enable_fifo_read(&self, fifo: u8) {
        self.reading.set(Some(fifo));
        self.read_position.set(0);
    }

    fn read_fifo_byte(&self) -> u8 {
        let fifo = match self.reading.get().and_then(|n| self.out_fifo(n)) {
            Some(fifo) => fifo,
            None => return 0,
        };
        let position = self.read_position.get();
        self.read_position.set(position + 1);
        fifo.byte(position)
    }

    fn read_last_fifo_byte(&self, fifo: u8) -> u8 {
        self.reading.set(Some(fifo));
        self.read_fifo_byte()
    }

    fn disable_fifo_read(&self, _fifo: u8) {
        self.reading.set(None);
    }

    fn enable_fifo_write(&self, fifo: u8) {
        if let Some(view) = self.in_fifo(fifo) {
            view.len.set(0);
        }
        self.writing.set(Some(fifo));
    }

    fn write_fifo_byte(&self, byte: u8) {
        if let Some(fifo) = self.writing.get().and_then(|n| self.in_fifo(n)) {
            fifo.push(byte);
        }
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
        Self::bit(&self.out_ready, 0)
    }

    fn ep0_in_packet_ready(&self) -> bool {
        Self::bit(&self.in_busy, 0)
    }

    fn ep0_count(&self) -> usize {
        self.out_fifos[0].len.get()
    }

    fn ep0_serviced_out_packet(&self) {
        Self::set_bit(&self.out_ready, 0, false);
        if !self.ep0_in.get() {
            // Accept the next packet of the data stage.
            self.registers.task_ep0rcvout.write(Task::ENABLE::SET);
        }
    }

    fn ep0_serviced_last_out_packet(&self) {
        Self::set_bit(&self.out_ready, 0, false);
        self.close_control(true);
    }

    fn ep0_set_in_packet_ready(&self) {
        self.transmit(0);
    }

    fn ep0_set_last_in_packet_ready(&self) {
        // The status stage follows once the host acknowledged the packet.
        self.registers
            .shorts
            .modify(Shorts::EP0DATADONE_EP0STATUS::SET);
        self.transmit(0);
        self.close_control(false);
    }

    fn ep0_send_stall(&self) {
        Self::set_bit(&self.out_ready, 0, false);
        self.registers.task_ep0stall.write(Task::ENABLE::SET);
        // The peripheral clears the stall by itself on the next SETUP.
        self.ep0_sent_stall.set(true);
        self.close_control(false);
    }

    fn in_sent_stall(&self) -> bool {
        false
    }

    fn in_clear_sent_stall(&self) {}

    fn in_set_packet_ready(&self) {
        self.transmit(self.index.get());
    }

    fn out_sent_stall(&self) -> bool {
        false
    }

    fn out_clear_sent_stall(&self) {}

    fn out_packet_ready(&self) -> bool {
        Self::bit(&self.out_ready, self.index.get())
    }

    fn out_count(&self) -> usize {
        self.out_fifo(self.index.get())
            .map_or(0, |fifo| fifo.len.get())
    }

    fn out_clear_packet_ready(&self) {
        let number = self.index.get();
        Self::set_bit(&self.out_ready, number, false);
        if self.iso_out.get() != Some(number) {
            if let Some(size) = self.registers.size_epout.get(number as usize) {
                // Release the peripheral buffer for the next packet.
                size.set(0);
            }
        }
    }

    fn activate_endpoint(&self, endpoint: &EndpointConfig, split: bool) {
        let regs = &*self.registers;
        let number = endpoint.address.number();
        let is_in = endpoint.address.is_in();

        if endpoint.is_isochronous() {
            if is_in {
                self.iso_in.set(Some(number));
                regs.epinen.modify(EndpointEnable::ISO::SET);
            } else {
                self.iso_out.set(Some(number));
                regs.epouten.modify(EndpointEnable::ISO::SET);
            }
            if split {
                regs.isosplit.write(IsoSplit::SPLIT::HalfIN);
            } else {
                regs.isosplit.write(IsoSplit::SPLIT::OneDir);
            }
            return;
        }

        // IN and OUT endpoints have separate buffers, so `split` does not
        // matter here.
        let bit = 1 << number;
        if is_in {
            regs.epinen
                .modify(EndpointEnable::EP.val(regs.epinen.read(EndpointEnable::EP) | bit));
        } else {
            regs.epouten
                .modify(EndpointEnable::EP.val(regs.epouten.read(EndpointEnable::EP) | bit));
            if let Some(size) = regs.size_epout.get(number as usize) {
                size.set(0);
            }
        }
        self.reset_toggle(number, is_in);
    }

    fn abort_in_endpoint(&self, number: u8) {
        Self::set_bit(&self.in_busy, number, false);
        if let Some(fifo) = self.in_fifo(number) {
            fifo.len.set(0);
        }
        if self.iso_in.get() != Some(number) && number > 0 {
            // Drop the packet waiting in the peripheral buffer.
            let regs = &*self.registers;
            regs.flush_select.set(0x7B6 + 2 * (number as u32 - 1));
            regs.flush_data.set(regs.flush_data.get() | 0x2);
        }
    }

    fn abort_out_endpoint(&self, number: u8) {
        Self::set_bit(&self.out_ready, number, false);
        if self.iso_out.get() != Some(number) {
            if let Some(size) = self.registers.size_epout.get(number as usize) {
                size.set(0);
            }
        }
    }
}
