// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! USB descriptors.
//!
//! The engine reads descriptor blocks through the [`DescriptorSource`]
//! trait. Boards usually build the blocks once at start-up with the
//! [`Descriptor`] builders below and hand them over as a
//! [`StaticDescriptors`].

use crate::config::TransferType;
use crate::endpoint::EndpointAddress;
use crate::error::UsbError;

/// String descriptor index of the language table.
pub const STRING_LANGUAGES: u8 = 0;
/// String descriptor index of the manufacturer name.
pub const STRING_MANUFACTURER: u8 = 1;
/// String descriptor index of the product name, read from persisted
/// settings.
pub const STRING_PRODUCT: u8 = 2;
/// String descriptor index of the serial number, synthesized from the
/// hardware unique id.
pub const STRING_SERIAL: u8 = 3;

/// Longest unique id used for the serial number string.
pub const MAX_UNIQUE_ID_LEN: usize = 16;

/// US English, the only language most devices report.
pub const LANGUAGE_EN_US: u16 = 0x0409;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 1,
    Configuration,
    String,
    Interface,
    Endpoint,
    DeviceQualifier,
    OtherSpeedConfiguration,
    InterfacePower,
    Hid = 0x21,
    Report = 0x22,
}

impl DescriptorType {
    pub fn from_u8(byte: u8) -> Option<DescriptorType> {
        match byte {
            1 => Some(DescriptorType::Device),
            2 => Some(DescriptorType::Configuration),
            3 => Some(DescriptorType::String),
            4 => Some(DescriptorType::Interface),
            5 => Some(DescriptorType::Endpoint),
            6 => Some(DescriptorType::DeviceQualifier),
            7 => Some(DescriptorType::OtherSpeedConfiguration),
            8 => Some(DescriptorType::InterfacePower),
            0x21 => Some(DescriptorType::Hid),
            0x22 => Some(DescriptorType::Report),
            _ => None,
        }
    }
}

/// Where the engine finds the descriptors it serves.
///
/// String indices [`STRING_PRODUCT`] and [`STRING_SERIAL`] are answered by
/// the engine from [`product_name`](DescriptorSource::product_name) and
/// [`unique_id`](DescriptorSource::unique_id); every other index is looked up
/// with [`string_descriptor`](DescriptorSource::string_descriptor).
pub trait DescriptorSource {
    fn device_descriptor(&self) -> &[u8];

    /// The configuration descriptor followed by all interface, class and
    /// endpoint descriptors of the configuration.
    fn configuration_descriptor(&self) -> &[u8];

    /// `bConfigurationValue` of the only configuration.
    fn configuration_value(&self) -> u8;

    fn string_descriptor(&self, index: u8) -> Option<&[u8]>;

    /// Storage holding the product name as a complete string descriptor.
    /// Its first byte is the descriptor length, which may be corrupt since
    /// the storage is written by the host-side configuration tool.
    fn product_name(&self) -> Option<&[u8]>;

    /// Hardware unique id of the chip.
    fn unique_id(&self) -> &[u8];
}

/// Descriptor blocks living in static memory.
pub struct StaticDescriptors<'a> {
    pub device: &'a [u8],
    pub configuration: &'a [u8],
    pub configuration_value: u8,
    pub languages: &'a [u8],
    pub manufacturer: &'a [u8],
    pub product: Option<&'a [u8]>,
    /// Further string descriptors, starting at index 4.
    pub strings: &'a [&'a [u8]],
    pub unique_id: &'a [u8],
}

impl DescriptorSource for StaticDescriptors<'_> {
    fn device_descriptor(&self) -> &[u8] {
        self.device
    }

    fn configuration_descriptor(&self) -> &[u8] {
        self.configuration
    }

    fn configuration_value(&self) -> u8 {
        self.configuration_value
    }

    fn string_descriptor(&self, index: u8) -> Option<&[u8]> {
        match index {
            STRING_LANGUAGES => Some(self.languages),
            STRING_MANUFACTURER => Some(self.manufacturer),
            STRING_PRODUCT | STRING_SERIAL => None,
            _ => self.strings.get(index as usize - 4).copied(),
        }
    }

    fn product_name(&self) -> Option<&[u8]> {
        self.product
    }

    fn unique_id(&self) -> &[u8] {
        self.unique_id
    }
}

/// Size of the serial number string descriptor built from `unique_id`.
pub fn serial_number_size(unique_id: &[u8]) -> usize {
    2 * (2 * unique_id.len().min(MAX_UNIQUE_ID_LEN) + 1)
}

/// Write the serial number string descriptor: the unique id as lowercase
/// hexadecimal digits, two per byte, encoded as UTF-16LE. Returns the number
/// of bytes written, or 0 if `buf` is too small.
pub fn write_serial_number(unique_id: &[u8], buf: &mut [u8]) -> usize {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let len = serial_number_size(unique_id);
    if buf.len() < len {
        return 0;
    }
    buf[0] = len as u8;
    buf[1] = DescriptorType::String as u8;
    let digits = unique_id
        .iter()
        .take(MAX_UNIQUE_ID_LEN)
        .flat_map(|b| [HEX[(b >> 4) as usize], HEX[(b & 0xf) as usize]]);
    for (chunk, digit) in buf[2..len].chunks_exact_mut(2).zip(digits) {
        put_u16(chunk, digit as u16);
    }
    len
}

pub trait Descriptor {
    /// Serialized size of Descriptor
    fn size(&self) -> usize;

    /// Serialize the descriptor to a buffer for transmission on the bus.
    /// Returns 0 without writing anything if `buf` is too small.
    fn write_to(&self, buf: &mut [u8]) -> usize {
        if self.size() > buf.len() {
            0
        } else {
            self.write_to_unchecked(buf)
        }
    }

    /// Same as `write_to()`, but doesn't check that `buf` is long enough
    /// before indexing into it.  This should be used only if the result
    /// of `size()` is first consulted.
    fn write_to_unchecked(&self, buf: &mut [u8]) -> usize;
}

pub struct DeviceDescriptor {
    /// Valid values include 0x0100 (USB1.0), 0x0110 (USB1.1) and 0x0200 (USB2.0)
    pub usb_release: u16,

    /// 0x00 means each interface defines its own class.
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,

    /// Max packet size for endpoint 0.  Must be 8, 16, 32 or 64
    pub max_packet_size_ep0: u8,

    pub vendor_id: u16,
    pub product_id: u16,

    /// Device release number in binary coded decimal (BCD)
    pub device_release: u16,

    pub manufacturer_string: u8,
    pub product_string: u8,
    pub serial_number_string: u8,

    pub num_configurations: u8,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        DeviceDescriptor {
            usb_release: 0x0200,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size_ep0: 64,
            vendor_id: 0x6666,
            product_id: 0x1111,
            device_release: 0x0001,
            manufacturer_string: STRING_MANUFACTURER,
            product_string: STRING_PRODUCT,
            serial_number_string: STRING_SERIAL,
            num_configurations: 1,
        }
    }
}

impl Descriptor for DeviceDescriptor {
    fn size(&self) -> usize {
        18
    }

    fn write_to_unchecked(&self, buf: &mut [u8]) -> usize {
        buf[0] = 18; // Size of descriptor
        buf[1] = DescriptorType::Device as u8;
        put_u16(&mut buf[2..4], self.usb_release);
        buf[4] = self.class;
        buf[5] = self.subclass;
        buf[6] = self.protocol;
        buf[7] = self.max_packet_size_ep0;
        put_u16(&mut buf[8..10], self.vendor_id);
        put_u16(&mut buf[10..12], self.product_id);
        put_u16(&mut buf[12..14], self.device_release);
        buf[14] = self.manufacturer_string;
        buf[15] = self.product_string;
        buf[16] = self.serial_number_string;
        buf[17] = self.num_configurations;
        18
    }
}

pub struct ConfigurationDescriptor {
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub string_index: u8,
    pub attributes: ConfigurationAttributes,
    pub max_power: u8, // in 2mA units
    pub related_descriptor_length: usize,
}

impl Default for ConfigurationDescriptor {
    fn default() -> Self {
        ConfigurationDescriptor {
            num_interfaces: 1,
            configuration_value: 1,
            string_index: 0,
            attributes: ConfigurationAttributes::new(false, true),
            max_power: 50, // 100mA
            related_descriptor_length: 0,
        }
    }
}

impl Descriptor for ConfigurationDescriptor {
    fn size(&self) -> usize {
        9
    }

    fn write_to_unchecked(&self, buf: &mut [u8]) -> usize {
        buf[0] = 9; // Size of descriptor
        buf[1] = DescriptorType::Configuration as u8;
        put_u16(&mut buf[2..4], (9 + self.related_descriptor_length) as u16);
        buf[4] = self.num_interfaces;
        buf[5] = self.configuration_value;
        buf[6] = self.string_index;
        buf[7] = From::from(self.attributes);
        buf[8] = self.max_power;
        9
    }
}

#[derive(Copy, Clone)]
pub struct ConfigurationAttributes(u8);

impl ConfigurationAttributes {
    pub fn new(is_self_powered: bool, supports_remote_wakeup: bool) -> Self {
        ConfigurationAttributes(
            (1 << 7)
                | if is_self_powered { 1 << 6 } else { 0 }
                | if supports_remote_wakeup { 1 << 5 } else { 0 },
        )
    }
}

impl From<ConfigurationAttributes> for u8 {
    fn from(ca: ConfigurationAttributes) -> u8 {
        ca.0
    }
}

pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub string_index: u8,
}

impl Default for InterfaceDescriptor {
    fn default() -> Self {
        InterfaceDescriptor {
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: 0, // (excluding default control endpoint)
            interface_class: 0x03, // HID
            interface_subclass: 0,
            interface_protocol: 0,
            string_index: 0,
        }
    }
}

impl Descriptor for InterfaceDescriptor {
    fn size(&self) -> usize {
        9
    }

    fn write_to_unchecked(&self, buf: &mut [u8]) -> usize {
        buf[0] = 9; // Size of descriptor
        buf[1] = DescriptorType::Interface as u8;
        buf[2] = self.interface_number;
        buf[3] = self.alternate_setting;
        buf[4] = self.num_endpoints;
        buf[5] = self.interface_class;
        buf[6] = self.interface_subclass;
        buf[7] = self.interface_protocol;
        buf[8] = self.string_index;
        9
    }
}

pub struct EndpointDescriptor {
    pub endpoint_address: EndpointAddress,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    // Poll for device data every `interval` frames
    pub interval: u8,
}

impl Descriptor for EndpointDescriptor {
    fn size(&self) -> usize {
        7
    }

    fn write_to_unchecked(&self, buf: &mut [u8]) -> usize {
        let len = self.size();
        buf[0] = len as u8;
        buf[1] = DescriptorType::Endpoint as u8;
        buf[2] = self.endpoint_address.into();
        // No synchronization, data endpoint
        buf[3] = self.transfer_type as u8;
        put_u16(&mut buf[4..6], self.max_packet_size & 0x7ff);
        buf[6] = self.interval;
        len
    }
}

#[derive(Copy, Clone)]
pub enum HidCountryCode {
    NotSupported = 0,
    French = 8,
    German = 9,
    InternationalIso = 13,
    JapanKatakana = 15,
    Swedish = 26,
    Uk = 32,
    Us = 33,
}

pub struct HidDescriptor<'a> {
    pub hid_class: u16,
    pub country_code: HidCountryCode,
    pub sub_descriptors: &'a [HidSubordinateDescriptor],
}

pub struct HidSubordinateDescriptor {
    pub typ: DescriptorType,
    pub len: u16,
}

impl Descriptor for HidDescriptor<'_> {
    fn size(&self) -> usize {
        6 + (3 * self.sub_descriptors.len())
    }

    fn write_to_unchecked(&self, buf: &mut [u8]) -> usize {
        let len = self.size();
        buf[0] = len as u8;
        buf[1] = DescriptorType::Hid as u8;
        put_u16(&mut buf[2..4], self.hid_class);
        buf[4] = self.country_code as u8;
        buf[5] = self.sub_descriptors.len() as u8;
        for (i, desc) in self.sub_descriptors.iter().enumerate() {
            buf[6 + 3 * i] = desc.typ as u8;
            put_u16(&mut buf[7 + (3 * i)..9 + (3 * i)], desc.len);
        }
        len
    }
}

pub struct LanguagesDescriptor<'a> {
    pub langs: &'a [u16],
}

impl Descriptor for LanguagesDescriptor<'_> {
    fn size(&self) -> usize {
        2 + (2 * self.langs.len())
    }

    fn write_to_unchecked(&self, buf: &mut [u8]) -> usize {
        let len = self.size();
        buf[0] = len as u8;
        buf[1] = DescriptorType::String as u8;
        for (i, lang) in self.langs.iter().enumerate() {
            put_u16(&mut buf[2 + (2 * i)..4 + (2 * i)], *lang);
        }
        len
    }
}

pub struct StringDescriptor<'a> {
    pub string: &'a str,
}

impl Descriptor for StringDescriptor<'_> {
    fn size(&self) -> usize {
        2 + self.string.chars().map(|ch| 2 * ch.len_utf16()).sum::<usize>()
    }

    // Encode as utf16-le
    fn write_to_unchecked(&self, buf: &mut [u8]) -> usize {
        buf[1] = DescriptorType::String as u8;
        let mut i = 2;
        for ch in self.string.chars() {
            let mut chbuf = [0; 2];
            for w in ch.encode_utf16(&mut chbuf) {
                put_u16(&mut buf[i..i + 2], *w);
                i += 2;
            }
        }
        buf[0] = i as u8;
        i
    }
}

/// One interface of a configuration, with the descriptors that follow it.
pub struct InterfaceBlock<'a> {
    pub interface: InterfaceDescriptor,
    pub hid: Option<HidDescriptor<'a>>,
    pub endpoints: &'a [EndpointDescriptor],
}

impl InterfaceBlock<'_> {
    fn size(&self) -> usize {
        self.interface.size()
            + self.hid.as_ref().map_or(0, |d| d.size())
            + self.endpoints.iter().map(|d| d.size()).sum::<usize>()
    }
}

/// Serialize a configuration descriptor and the descriptors of its
/// interfaces into `buf`, filling in the interface and endpoint counts and
/// the total length. Returns the number of bytes written.
pub fn write_configuration(
    mut configuration: ConfigurationDescriptor,
    interfaces: &mut [InterfaceBlock],
    buf: &mut [u8],
) -> Result<usize, UsbError> {
    configuration.num_interfaces = interfaces.len() as u8;
    configuration.related_descriptor_length = interfaces.iter().map(|d| d.size()).sum();
    for block in interfaces.iter_mut() {
        block.interface.num_endpoints = block.endpoints.len() as u8;
    }

    let total = configuration.size() + configuration.related_descriptor_length;
    if total > buf.len() || total > u16::MAX as usize {
        return Err(UsbError::Illegal);
    }

    let mut len = configuration.write_to_unchecked(buf);
    for block in interfaces.iter() {
        len += block.interface.write_to_unchecked(&mut buf[len..]);
        if let Some(hid) = &block.hid {
            len += hid.write_to_unchecked(&mut buf[len..]);
        }
        for endpoint in block.endpoints {
            len += endpoint.write_to_unchecked(&mut buf[len..]);
        }
    }
    Ok(len)
}

/// Write a `u16` to a buffer for transmission on the bus
fn put_u16(buf: &mut [u8], n: u16) {
    buf[0] = (n & 0xff) as u8;
    buf[1] = (n >> 8) as u8;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn device_descriptor_layout() {
        let mut buf = [0u8; 18];
        let desc = DeviceDescriptor {
            vendor_id: 0x1209,
            product_id: 0xbb00,
            ..Default::default()
        };
        assert_eq!(desc.write_to(&mut buf), 18);
        assert_eq!(&buf[..8], &[18, 1, 0x00, 0x02, 0, 0, 0, 64]);
        assert_eq!(&buf[8..12], &[0x09, 0x12, 0x00, 0xbb]);
        assert_eq!(&buf[14..], &[1, 2, 3, 1]);

        let mut short = [0u8; 10];
        assert_eq!(desc.write_to(&mut short), 0);
    }

    #[test]
    fn configuration_with_hid_interface() {
        let endpoints = [EndpointDescriptor {
            endpoint_address: EndpointAddress::new_in(1),
            transfer_type: TransferType::Interrupt,
            max_packet_size: 8,
            interval: 10,
        }];
        let sub = [HidSubordinateDescriptor {
            typ: DescriptorType::Report,
            len: 63,
        }];
        let mut interfaces = [InterfaceBlock {
            interface: InterfaceDescriptor {
                interface_subclass: 1,
                interface_protocol: 1,
                ..Default::default()
            },
            hid: Some(HidDescriptor {
                hid_class: 0x0111,
                country_code: HidCountryCode::NotSupported,
                sub_descriptors: &sub,
            }),
            endpoints: &endpoints,
        }];
        let mut buf = [0u8; 64];
        let len = write_configuration(ConfigurationDescriptor::default(), &mut interfaces, &mut buf);
        assert_eq!(len, Ok(34));
        // wTotalLength and bNumInterfaces
        assert_eq!(&buf[2..5], &[34, 0, 1]);
        // bNumEndpoints of the interface
        assert_eq!(buf[9 + 4], 1);
        // HID descriptor follows the interface
        assert_eq!(&buf[18..20], &[9, 0x21]);
        assert_eq!(&buf[27..30], &[7, 5, 0x81]);

        let mut small = [0u8; 20];
        assert_eq!(
            write_configuration(ConfigurationDescriptor::default(), &mut interfaces, &mut small),
            Err(UsbError::Illegal)
        );
    }

    #[test]
    fn string_descriptors_are_utf16le() {
        let mut buf = [0u8; 16];
        let len = StringDescriptor { string: "kb" }.write_to(&mut buf);
        assert_eq!(&buf[..len], &[6, 3, b'k', 0, b'b', 0]);

        let len = LanguagesDescriptor {
            langs: &[LANGUAGE_EN_US],
        }
        .write_to(&mut buf);
        assert_eq!(&buf[..len], &[4, 3, 0x09, 0x04]);
    }

    #[test]
    fn serial_number_is_lowercase_hex() {
        let mut buf = [0u8; 32];
        let uid = [0x1a, 0xf0];
        assert_eq!(serial_number_size(&uid), 10);
        assert_eq!(write_serial_number(&uid, &mut buf), 10);
        assert_eq!(
            &buf[..10],
            &[10, 3, b'1', 0, b'a', 0, b'f', 0, b'0', 0]
        );

        let mut tiny = [0u8; 4];
        assert_eq!(write_serial_number(&uid, &mut tiny), 0);
    }

    #[test]
    fn static_descriptor_strings() {
        let extra: [&[u8]; 1] = [&[4, 3, b'x', 0]];
        let source = StaticDescriptors {
            device: &[],
            configuration: &[],
            configuration_value: 1,
            languages: &[4, 3, 0x09, 0x04],
            manufacturer: &[2, 3],
            product: None,
            strings: &extra,
            unique_id: &[],
        };
        assert_eq!(source.string_descriptor(0), Some(&[4u8, 3, 0x09, 0x04][..]));
        assert_eq!(source.string_descriptor(STRING_SERIAL), None);
        assert_eq!(source.string_descriptor(4), Some(&[4u8, 3, b'x', 0][..]));
        assert_eq!(source.string_descriptor(5), None);
    }
}
