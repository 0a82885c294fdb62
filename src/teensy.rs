//! The Teensy board family: interface recognition, model identification,
//! serial number quirks, SEREMU serial emulation, and the glue from board
//! capabilities down to the HalfKay driver.

use std::sync::Arc;

use crate::board::{BoardFamily, BoardInterface, Capabilities, InterfaceDriver, MonitorOptions};
use crate::device::{Device, DeviceKind, SerialAttributes};
use crate::error::{Error, ErrorKind, Result};
use crate::firmware::Firmware;
use crate::halfkay;
use crate::model::Model;

pub(crate) const TEENSY_VID: u16 = 0x16C0;

const USAGE_PAGE_BOOTLOADER: u16 = 0xFF9C;
const USAGE_PAGE_SEREMU: u16 = 0xFFC9;

/// SEREMU moves data in fixed 32-byte reports; a NUL marks the end of the
/// useful bytes, so no binary transfers.
const SEREMU_PACKET_SIZE: usize = 32;

/// Magic feature report that asks a SEREMU interface to reboot into HalfKay.
const SEREMU_REBOOT_MAGIC: [u8; 5] = [0x00, 0xA9, 0x45, 0xC2, 0x6B];

/// Reprogramming a CDC interface to this baud rate reboots into HalfKay.
const SERIAL_REBOOT_RATE: u32 = 134;

/// Placeholder for boards we can see but not identify; it has no flash
/// geometry, so upload stays unavailable.
pub(crate) static UNKNOWN_MODEL: Model = Model {
    name: "Teensy",
    mcu: "",
    usage: 0,
    experimental: false,
    code_size: 0,
    halfkay_version: 0,
    block_size: 0,
    signature: [0; 8],
};

static TEENSY_PP10: Model = Model {
    name: "Teensy++ 1.0",
    mcu: "at90usb646",
    usage: 0x1A,
    experimental: true,
    code_size: 64512,
    halfkay_version: 1,
    block_size: 256,
    signature: [0x0C, 0x94, 0x00, 0x7E, 0xFF, 0xCF, 0xF8, 0x94],
};

static TEENSY_20: Model = Model {
    name: "Teensy 2.0",
    mcu: "atmega32u4",
    usage: 0x1B,
    experimental: true,
    code_size: 32256,
    halfkay_version: 1,
    block_size: 128,
    signature: [0x0C, 0x94, 0x00, 0x3F, 0xFF, 0xCF, 0xF8, 0x94],
};

static TEENSY_PP20: Model = Model {
    name: "Teensy++ 2.0",
    mcu: "at90usb1286",
    usage: 0x1C,
    experimental: true,
    code_size: 130048,
    halfkay_version: 2,
    block_size: 256,
    signature: [0x0C, 0x94, 0x00, 0xFE, 0xFF, 0xCF, 0xF8, 0x94],
};

static TEENSY_30: Model = Model {
    name: "Teensy 3.0",
    mcu: "mk20dx128",
    usage: 0x1D,
    experimental: false,
    code_size: 131072,
    halfkay_version: 3,
    block_size: 1024,
    signature: [0x38, 0x80, 0x04, 0x40, 0x82, 0x3F, 0x04, 0x00],
};

static TEENSY_31: Model = Model {
    name: "Teensy 3.1",
    mcu: "mk20dx256",
    usage: 0x1E,
    experimental: false,
    code_size: 262144,
    halfkay_version: 3,
    block_size: 1024,
    signature: [0x30, 0x80, 0x04, 0x40, 0x82, 0x3F, 0x04, 0x00],
};

static TEENSY_LC: Model = Model {
    name: "Teensy LC",
    mcu: "mkl26z64",
    usage: 0x20,
    experimental: false,
    code_size: 63488,
    halfkay_version: 3,
    block_size: 512,
    signature: [0x34, 0x80, 0x04, 0x40, 0x82, 0x3F, 0x00, 0x00],
};

pub(crate) static MODELS: &[&Model] = &[
    &TEENSY_PP10,
    &TEENSY_20,
    &TEENSY_PP20,
    &TEENSY_30,
    &TEENSY_31,
    &TEENSY_LC,
];

fn identify_model(usage: u16) -> Option<&'static Model> {
    MODELS
        .iter()
        .copied()
        .find(|model| model.usage as u16 == usage)
}

/// Leading decimal digits of a serial number string, as reported by
/// non-bootloader interfaces.
pub(crate) fn parse_decimal_serial(s: Option<&str>) -> u64 {
    let Some(s) = s else {
        return 0;
    };

    let digits: &str = s.split(|c: char| !c.is_ascii_digit()).next().unwrap_or("");
    digits.parse().unwrap_or(0)
}

/// Two quirks combine when reading the bootloader's serial number.
///
/// The bootloader reports the serial number as hexadecimal with leading
/// zeros (which would suggest octal to a C parser). In the other modes a
/// decimal value is used, but Teensyduino 1.19 added a workaround for a
/// Mac OS X CDC-ADM driver bug: if the number is < 10000000, append a 0.
/// See <https://github.com/PaulStoffregen/cores/commit/4d8a62cf65624d2dc1d861748a9bb2e90aaf194d>.
pub(crate) fn parse_bootloader_serial(s: Option<&str>) -> u64 {
    let Some(s) = s else {
        return 0;
    };

    let hex: &str = s
        .split(|c: char| !c.is_ascii_hexdigit())
        .next()
        .unwrap_or("");
    let mut serial = u64::from_str_radix(hex, 16).unwrap_or(0);
    if serial < 10_000_000 {
        serial *= 10;
    }

    serial
}

/// The Teensy family decoder; stateless, registered once in the family list.
pub(crate) struct TeensyFamily;

static TEENSY_DRIVER: TeensyDriver = TeensyDriver;

impl BoardFamily for TeensyFamily {
    fn name(&self) -> &'static str {
        "Teensy"
    }

    fn models(&self) -> &'static [&'static Model] {
        MODELS
    }

    fn open_interface(
        &self,
        dev: &Arc<Device>,
        options: &MonitorOptions,
    ) -> Result<Option<BoardInterface>> {
        if dev.vid() != TEENSY_VID {
            return Ok(None);
        }
        match dev.pid() {
            0x478 | 0x482 | 0x483 | 0x484 | 0x485 | 0x486 | 0x487 | 0x488 => {}
            _ => return Ok(None),
        }

        let mut handle = crate::backend::open_device(dev)?;

        let mut capabilities = Capabilities::empty();
        let mut model: &'static Model = &UNKNOWN_MODEL;
        let mut serial = parse_decimal_serial(dev.serial_number());
        let desc;

        match dev.kind() {
            DeviceKind::Serial => {
                // Restore a sane rate: some systems (such as Linux) keep tty
                // settings around and reuse them, and a leftover 134 would
                // put the board right back into the bootloader on open.
                let _ = handle.serial_set_attributes(&SerialAttributes::rate(115200));

                desc = "Serial";
                capabilities |= Capabilities::SERIAL | Capabilities::REBOOT;
            }

            DeviceKind::Hid => {
                let info = dev.hid_info().copied().unwrap_or_default();

                match info.usage_page {
                    USAGE_PAGE_BOOTLOADER => {
                        serial = parse_bootloader_serial(dev.serial_number());
                        desc = "HalfKay Bootloader";

                        if let Some(identified) = identify_model(info.usage) {
                            model = identified;
                            capabilities |= Capabilities::IDENTIFY
                                | Capabilities::UPLOAD
                                | Capabilities::RESET;
                        }
                    }
                    USAGE_PAGE_SEREMU => {
                        desc = "Seremu";
                        capabilities |= Capabilities::SERIAL | Capabilities::REBOOT;
                    }
                    _ => return Ok(None),
                }
            }
        }

        Ok(Some(BoardInterface::new(
            Arc::clone(dev),
            handle,
            desc,
            model,
            serial,
            capabilities,
            &TEENSY_DRIVER,
            options.experimental,
        )))
    }

    fn guess_models(&self, firmware: &Firmware) -> Vec<&'static Model> {
        let image = firmware.image();
        let mut guesses: Vec<&'static Model> = Vec::new();

        if image.len() < 8 {
            return guesses;
        }

        // Naive search with each model's signature; fine unless thousands of
        // models appear.
        for window in image.windows(8) {
            for model in MODELS {
                if window == model.signature && !guesses.iter().any(|g| std::ptr::eq(*g, *model)) {
                    guesses.push(model);
                }
            }
        }

        guesses
    }
}

/// Performs each capability on a Teensy interface, dispatching on the
/// underlying transport (CDC serial vs. HID).
struct TeensyDriver;

impl TeensyDriver {
    fn check_experimental(&self, iface: &BoardInterface, what: &str) -> Result<()> {
        if iface.model().is_experimental() && !iface.experimental_allowed() {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!(
                    "{} of {} is disabled, enable experimental support to allow it",
                    what,
                    iface.model().name()
                ),
            ));
        }
        Ok(())
    }
}

impl InterfaceDriver for TeensyDriver {
    fn serial_set_attributes(
        &self,
        iface: &BoardInterface,
        attrs: &SerialAttributes,
    ) -> Result<()> {
        if iface.device().kind() != DeviceKind::Serial {
            // SEREMU has no line settings; accept and ignore.
            return Ok(());
        }

        iface.with_handle(|handle| handle.serial_set_attributes(attrs))
    }

    fn serial_read(&self, iface: &BoardInterface, buf: &mut [u8], timeout: i32) -> Result<usize> {
        match iface.device().kind() {
            DeviceKind::Serial => iface.with_handle(|handle| handle.serial_read(buf, timeout)),

            DeviceKind::Hid => {
                let mut report = [0u8; SEREMU_PACKET_SIZE + 1];
                let r = iface.with_handle(|handle| handle.hid_read(&mut report, timeout))?;
                if r <= 1 {
                    return Ok(0);
                }

                // Everything up to the first NUL is payload.
                let data = &report[1..r];
                let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let len = len.min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
        }
    }

    fn serial_write(&self, iface: &BoardInterface, buf: &[u8]) -> Result<usize> {
        match iface.device().kind() {
            DeviceKind::Serial => iface.with_handle(|handle| handle.serial_write(buf)),

            DeviceKind::Hid => {
                let mut total = 0;
                while total < buf.len() {
                    let chunk = SEREMU_PACKET_SIZE.min(buf.len() - total);

                    let mut report = [0u8; SEREMU_PACKET_SIZE + 1];
                    report[1..1 + chunk].copy_from_slice(&buf[total..total + chunk]);

                    let r = iface.with_handle(|handle| handle.hid_write(&report))?;
                    if r == 0 {
                        break;
                    }

                    total += chunk;
                }
                Ok(total)
            }
        }
    }

    fn upload(
        &self,
        iface: &BoardInterface,
        firmware: &Firmware,
        progress: &mut dyn FnMut(usize) -> bool,
    ) -> Result<()> {
        self.check_experimental(iface, "Upload")?;

        iface.with_handle(|handle| halfkay::upload(handle, iface.model(), firmware, progress))
    }

    fn reset(&self, iface: &BoardInterface) -> Result<()> {
        self.check_experimental(iface, "Reset")?;

        iface.with_handle(|handle| halfkay::reset(handle, iface.model()))
    }

    fn reboot(&self, iface: &BoardInterface) -> Result<()> {
        match iface.device().kind() {
            DeviceKind::Serial => iface.with_handle(|handle| {
                handle.serial_set_attributes(&SerialAttributes::rate(SERIAL_REBOOT_RATE))?;

                // Don't leave the magic rate behind: some systems (such as
                // Linux) reuse the settings and the board would keep
                // rebooting when opened.
                let _ = handle.serial_set_attributes(&SerialAttributes::rate(115200));
                Ok(())
            }),

            DeviceKind::Hid => iface.with_handle(|handle| {
                let r = handle.hid_send_feature_report(&SEREMU_REBOOT_MAGIC)?;
                debug_assert_eq!(r, SEREMU_REBOOT_MAGIC.len());
                Ok(())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock;

    fn open_with(dev: Device) -> Option<BoardInterface> {
        TeensyFamily
            .open_interface(&Arc::new(dev), &MonitorOptions::default())
            .unwrap()
    }

    #[test]
    fn bootloader_serial_applies_the_hex_and_times_ten_quirks() {
        // 0x123 = 291; below ten million, so the Teensyduino workaround
        // multiplies by ten.
        assert_eq!(parse_bootloader_serial(Some("0000123")), 2910);
        // Large values stay untouched: 0x989680 = 10000000.
        assert_eq!(parse_bootloader_serial(Some("989680")), 10_000_000);
        assert_eq!(parse_bootloader_serial(None), 0);
    }

    #[test]
    fn decimal_serial_stops_at_the_first_non_digit() {
        assert_eq!(parse_decimal_serial(Some("4242")), 4242);
        assert_eq!(parse_decimal_serial(Some("4242-rev2")), 4242);
        assert_eq!(parse_decimal_serial(Some("none")), 0);
        assert_eq!(parse_decimal_serial(None), 0);
    }

    #[test]
    fn bootloader_interfaces_get_upload_and_reset() {
        let port = mock::MockPort::new();
        let iface = open_with(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port)).unwrap();

        assert_eq!(iface.model().name(), "Teensy 3.1");
        assert_eq!(iface.serial_number(), 2910);
        assert_eq!(iface.desc(), "HalfKay Bootloader");
        assert!(iface.capabilities().contains(Capabilities::UPLOAD));
        assert!(iface.capabilities().contains(Capabilities::RESET));
        assert!(iface.capabilities().contains(Capabilities::IDENTIFY));
        assert!(!iface.capabilities().contains(Capabilities::SERIAL));
    }

    #[test]
    fn unknown_bootloader_usage_keeps_upload_off() {
        let port = mock::MockPort::new();
        let iface = open_with(mock::bootloader_device("usb-1-2", "1", 0x7F, &port)).unwrap();

        assert!(!iface.model().is_real());
        assert!(iface.capabilities().is_empty());
    }

    #[test]
    fn cdc_interfaces_get_serial_and_reboot_and_a_sane_rate() {
        let port = mock::MockPort::new();
        let iface = open_with(mock::serial_device("usb-1-2", "4242", &port)).unwrap();

        assert_eq!(iface.desc(), "Serial");
        assert_eq!(iface.serial_number(), 4242);
        assert!(iface.capabilities().contains(Capabilities::SERIAL));
        assert!(iface.capabilities().contains(Capabilities::REBOOT));

        // The open forced the line back to 115200.
        assert_eq!(port.state().open_count, 1);
        let attrs = port.state().attr_history.clone();
        assert_eq!(attrs.last().unwrap().baud, 115200);
    }

    #[test]
    fn foreign_devices_are_not_recognized() {
        let port = mock::MockPort::new();
        let mut dev = mock::serial_device("usb-1-9", "1", &port);
        dev.vid = 0x0403;
        assert!(open_with(dev).is_none());
    }

    #[test]
    fn serial_reboot_pulses_the_magic_rate() {
        let port = mock::MockPort::new();
        let iface = open_with(mock::serial_device("usb-1-2", "4242", &port)).unwrap();

        TEENSY_DRIVER.reboot(&iface).unwrap();

        let rates: Vec<u32> = port.state().attr_history.iter().map(|a| a.baud).collect();
        // Open forces 115200, reboot sets 134 then restores 115200.
        assert_eq!(rates, vec![115200, 134, 115200]);
    }

    #[test]
    fn seremu_reboot_sends_the_feature_report() {
        let port = mock::MockPort::new();
        let iface = open_with(mock::seremu_device("usb-1-2", "4242", &port)).unwrap();

        TEENSY_DRIVER.reboot(&iface).unwrap();

        let reports = port.state().feature_reports.clone();
        assert_eq!(reports, vec![SEREMU_REBOOT_MAGIC.to_vec()]);
    }

    #[test]
    fn seremu_reads_stop_at_the_first_nul() {
        let port = mock::MockPort::new();
        let iface = open_with(mock::seremu_device("usb-1-2", "4242", &port)).unwrap();

        let mut report = vec![0u8; SEREMU_PACKET_SIZE + 1];
        report[1..6].copy_from_slice(b"hello");
        port.push_read(&report);

        let mut buf = [0u8; 64];
        let r = TEENSY_DRIVER.serial_read(&iface, &mut buf, 0).unwrap();
        assert_eq!(&buf[..r], b"hello");
    }

    #[test]
    fn seremu_writes_chunk_into_33_byte_reports() {
        let port = mock::MockPort::new();
        let iface = open_with(mock::seremu_device("usb-1-2", "4242", &port)).unwrap();

        let data = vec![b'x'; 70];
        let written = TEENSY_DRIVER.serial_write(&iface, &data).unwrap();
        assert_eq!(written, 70);

        let writes = port.state().hid_writes.clone();
        assert_eq!(writes.len(), 3);
        for report in &writes {
            assert_eq!(report.len(), SEREMU_PACKET_SIZE + 1);
            assert_eq!(report[0], 0);
        }
        // The last report carries the 6 remaining bytes, NUL-padded.
        assert_eq!(&writes[2][1..7], b"xxxxxx");
        assert!(writes[2][7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn firmware_guessing_scans_for_reset_vector_signatures() {
        let mut image = vec![0u8; 256];
        image[40..48].copy_from_slice(&TEENSY_31.signature);

        let firmware = Firmware::new("guess.hex", image).unwrap();
        let guesses = TeensyFamily.guess_models(&firmware);
        assert_eq!(guesses.len(), 1);
        assert_eq!(guesses[0].name(), "Teensy 3.1");

        let empty = Firmware::new("tiny.hex", vec![0; 4]).unwrap();
        assert!(TeensyFamily.guess_models(&empty).is_empty());
    }

    #[test]
    fn experimental_models_refuse_upload_by_default() {
        let port = mock::MockPort::new();
        // Usage 0x1B is the (experimental) Teensy 2.0.
        let iface = open_with(mock::bootloader_device("usb-1-2", "1", 0x1B, &port)).unwrap();

        let firmware = Firmware::new("avr.hex", vec![0; 128]).unwrap();
        let err = TEENSY_DRIVER
            .upload(&iface, &firmware, &mut |_| true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(port.state().hid_writes.is_empty());
    }
}
