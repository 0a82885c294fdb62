//! Interface-level view of USB devices: one [Device] per USB interface, and
//! [Handle] for open I/O sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::system::DescriptorSet;

/// What kind of node the OS exposes for an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Hid,
    Serial,
}

/// Top-level HID usage information, read from the report descriptor during
/// enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HidInfo {
    pub usage_page: u16,
    pub usage: u16,
    /// The interface uses numbered reports; needed to work around an old
    /// Linux kernel bug (2.6.28 to 2.6.33) that shifts input reports by one
    /// byte.
    pub numbered_reports: bool,
}

/// One USB interface as seen on this host: a `(bus, port chain,
/// interface number)` triple plus everything needed to open it.
///
/// Created by the platform backend and shared (`Arc`) between the monitor,
/// the board aggregator, and any open handle.
#[derive(Debug)]
pub struct Device {
    /// Opaque identifier, unique per host, stable for the life of the node.
    pub(crate) key: String,
    /// Printable port chain, `usb-<controller>-<port>[-<port>...]`; equal for
    /// every interface of one physical device.
    pub(crate) location: String,
    /// OS node used for I/O: a filesystem path on POSIX, a `\\.\` device
    /// name on Windows.
    pub(crate) path: String,

    pub(crate) vid: u16,
    pub(crate) pid: u16,
    pub(crate) serial: Option<String>,

    pub(crate) iface: u8,
    pub(crate) kind: DeviceKind,
    pub(crate) hid: Option<HidInfo>,

    pub(crate) connected: AtomicBool,

    #[cfg(test)]
    pub(crate) mock: Option<crate::backend::mock::MockPort>,
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: String,
        location: String,
        path: String,
        vid: u16,
        pid: u16,
        serial: Option<String>,
        iface: u8,
        kind: DeviceKind,
        hid: Option<HidInfo>,
    ) -> Device {
        Device {
            key,
            location,
            path,
            vid,
            pid,
            serial,
            iface,
            kind,
            hid,
            connected: AtomicBool::new(true),
            #[cfg(test)]
            mock: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn vid(&self) -> u16 {
        self.vid
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn interface_number(&self) -> u8 {
        self.iface
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn hid_info(&self) -> Option<&HidInfo> {
        self.hid.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// One entry of a [DeviceFilter]: a device matches when every field that is
/// set here agrees with it.
#[derive(Debug, Default, Clone)]
pub struct DeviceMatch {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub kind: Option<DeviceKind>,
}

impl DeviceMatch {
    pub fn matches(&self, device: &Device) -> bool {
        if let Some(vid) = self.vid {
            if vid != device.vid {
                return false;
            }
        }

        if let Some(pid) = self.pid {
            if pid != device.pid {
                return false;
            }
        }

        if let Some(kind) = self.kind {
            if kind != device.kind {
                return false;
            }
        }

        true
    }
}

/// A list of [DeviceMatch] entries; a device passes when any entry matches.
/// The empty filter passes everything.
#[derive(Debug, Default, Clone)]
pub struct DeviceFilter {
    matches: Vec<DeviceMatch>,
}

impl DeviceFilter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, m: DeviceMatch) {
        self.matches.push(m);
    }

    pub fn with(mut self, m: DeviceMatch) -> Self {
        self.push(m);
        self
    }

    pub fn accepts(&self, device: &Device) -> bool {
        self.matches.is_empty() || self.matches.iter().any(|m| m.matches(device))
    }
}

/// Parity setting for a serial line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// Flow control for a serial line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlowControl {
    #[default]
    None,
    XonXoff,
    RtsCts,
}

/// Recognized serial line settings.
///
/// Only the classic baud rates (110 through 115200, plus the 134 reboot
/// trigger) are guaranteed on every platform; anything else is best effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialAttributes {
    pub baud: u32,
    /// 5 to 8.
    pub data_bits: u8,
    pub parity: Parity,
    /// 1 or 2.
    pub stop_bits: u8,
    pub flow: FlowControl,
    /// Hang up (drop DTR) when the last handle closes.
    pub hupcl: bool,
}

impl Default for SerialAttributes {
    fn default() -> Self {
        SerialAttributes {
            baud: 115200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow: FlowControl::None,
            hupcl: true,
        }
    }
}

impl SerialAttributes {
    /// 8N1 at the given rate, the only shape the Teensy world uses.
    pub fn rate(baud: u32) -> Self {
        SerialAttributes {
            baud,
            ..Default::default()
        }
    }
}

/// An open I/O session on one [Device].
///
/// The handle exclusively owns its OS resources (descriptor, in-flight read
/// buffer, run-loop bridge); the parent device is shared. I/O on a handle is
/// not synchronized internally: at most one reader and one writer at a time
/// is the caller's obligation.
#[derive(Debug)]
pub struct Handle {
    pub(crate) dev: Arc<Device>,
    pub(crate) imp: HandleImpl,
}

/// Per-platform handle state. Dispatch happens through a match rather than
/// a vtable so the set of backends stays closed and the compiler keeps us
/// honest about each one's operations.
#[derive(Debug)]
pub(crate) enum HandleImpl {
    #[cfg(target_os = "linux")]
    LinuxHid(crate::backend::linux::HidHandle),
    #[cfg(unix)]
    PosixSerial(crate::backend::posix::SerialHandle),
    #[cfg(target_os = "macos")]
    MacosHid(crate::backend::macos::HidHandle),
    #[cfg(windows)]
    WindowsHid(crate::backend::windows::HidHandle),
    #[cfg(windows)]
    WindowsSerial(crate::backend::windows::SerialHandle),
    #[cfg(test)]
    Mock(crate::backend::mock::MockHandle),
}

impl Handle {
    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// Registers this handle's readiness descriptor(s) in `set`.
    pub fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        match &self.imp {
            #[cfg(target_os = "linux")]
            HandleImpl::LinuxHid(h) => h.descriptors(set, id),
            #[cfg(unix)]
            HandleImpl::PosixSerial(h) => h.descriptors(set, id),
            #[cfg(target_os = "macos")]
            HandleImpl::MacosHid(h) => h.descriptors(set, id),
            #[cfg(windows)]
            HandleImpl::WindowsHid(h) => h.descriptors(set, id),
            #[cfg(windows)]
            HandleImpl::WindowsSerial(h) => h.descriptors(set, id),
            #[cfg(test)]
            HandleImpl::Mock(h) => h.descriptors(set, id),
        }
    }

    fn expect_kind(&self, kind: DeviceKind) -> Result<()> {
        if self.dev.kind != kind {
            return Err(Error::new(
                ErrorKind::Param,
                format!(
                    "Operation not supported by device '{}' of this type",
                    self.dev.path
                ),
            ));
        }
        Ok(())
    }

    /// Applies serial line settings.
    pub fn serial_set_attributes(&mut self, attrs: &SerialAttributes) -> Result<()> {
        self.expect_kind(DeviceKind::Serial)?;

        match &mut self.imp {
            #[cfg(unix)]
            HandleImpl::PosixSerial(h) => h.set_attributes(attrs),
            #[cfg(windows)]
            HandleImpl::WindowsSerial(h) => h.set_attributes(attrs),
            #[cfg(test)]
            HandleImpl::Mock(h) => h.serial_set_attributes(attrs),
            #[allow(unreachable_patterns)]
            _ => unreachable!("serial handle of a non-serial backend"),
        }
    }

    /// Reads from a serial device. Returns 0 on timeout; `timeout < 0` waits
    /// forever, 0 polls.
    pub fn serial_read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize> {
        self.expect_kind(DeviceKind::Serial)?;

        match &mut self.imp {
            #[cfg(unix)]
            HandleImpl::PosixSerial(h) => h.read(buf, timeout),
            #[cfg(windows)]
            HandleImpl::WindowsSerial(h) => h.read(buf, timeout),
            #[cfg(test)]
            HandleImpl::Mock(h) => h.serial_read(buf, timeout),
            #[allow(unreachable_patterns)]
            _ => unreachable!("serial handle of a non-serial backend"),
        }
    }

    /// Writes to a serial device, blocking until the bytes are accepted.
    pub fn serial_write(&mut self, buf: &[u8]) -> Result<usize> {
        self.expect_kind(DeviceKind::Serial)?;

        match &mut self.imp {
            #[cfg(unix)]
            HandleImpl::PosixSerial(h) => h.write(buf),
            #[cfg(windows)]
            HandleImpl::WindowsSerial(h) => h.write(buf),
            #[cfg(test)]
            HandleImpl::Mock(h) => h.serial_write(buf),
            #[allow(unreachable_patterns)]
            _ => unreachable!("serial handle of a non-serial backend"),
        }
    }

    /// Reads one input report. `buf[0]` receives the report id (0 when the
    /// device does not number its reports). Returns 0 on timeout.
    pub fn hid_read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize> {
        self.expect_kind(DeviceKind::Hid)?;

        match &mut self.imp {
            #[cfg(target_os = "linux")]
            HandleImpl::LinuxHid(h) => h.read(buf, timeout),
            #[cfg(target_os = "macos")]
            HandleImpl::MacosHid(h) => h.read(buf, timeout),
            #[cfg(windows)]
            HandleImpl::WindowsHid(h) => h.read(buf, timeout),
            #[cfg(test)]
            HandleImpl::Mock(h) => h.hid_read(buf, timeout),
            #[allow(unreachable_patterns)]
            _ => unreachable!("HID handle of a non-HID backend"),
        }
    }

    /// Sends one output report; `buf[0]` is the report id.
    pub fn hid_write(&mut self, buf: &[u8]) -> Result<usize> {
        self.expect_kind(DeviceKind::Hid)?;

        match &mut self.imp {
            #[cfg(target_os = "linux")]
            HandleImpl::LinuxHid(h) => h.write(buf),
            #[cfg(target_os = "macos")]
            HandleImpl::MacosHid(h) => h.write(buf),
            #[cfg(windows)]
            HandleImpl::WindowsHid(h) => h.write(buf),
            #[cfg(test)]
            HandleImpl::Mock(h) => h.hid_write(buf),
            #[allow(unreachable_patterns)]
            _ => unreachable!("HID handle of a non-HID backend"),
        }
    }

    /// Sends one feature report; `buf[0]` is the report id.
    pub fn hid_send_feature_report(&mut self, buf: &[u8]) -> Result<usize> {
        self.expect_kind(DeviceKind::Hid)?;

        match &mut self.imp {
            #[cfg(target_os = "linux")]
            HandleImpl::LinuxHid(h) => h.send_feature_report(buf),
            #[cfg(target_os = "macos")]
            HandleImpl::MacosHid(h) => h.send_feature_report(buf),
            #[cfg(windows)]
            HandleImpl::WindowsHid(h) => h.send_feature_report(buf),
            #[cfg(test)]
            HandleImpl::Mock(h) => h.hid_send_feature_report(buf),
            #[allow(unreachable_patterns)]
            _ => unreachable!("HID handle of a non-HID backend"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(vid: u16, pid: u16, kind: DeviceKind) -> Device {
        Device::new(
            format!("key-{vid:04x}-{pid:04x}"),
            "usb-1-2".to_string(),
            "/dev/test".to_string(),
            vid,
            pid,
            None,
            0,
            kind,
            None,
        )
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let filter = DeviceFilter::new();
        assert!(filter.accepts(&device(0x16C0, 0x478, DeviceKind::Hid)));
        assert!(filter.accepts(&device(0xDEAD, 0xBEEF, DeviceKind::Serial)));
    }

    #[test]
    fn filter_requires_every_set_field_of_one_entry() {
        let filter = DeviceFilter::new().with(DeviceMatch {
            vid: Some(0x16C0),
            pid: Some(0x483),
            kind: Some(DeviceKind::Serial),
        });

        assert!(filter.accepts(&device(0x16C0, 0x483, DeviceKind::Serial)));
        assert!(!filter.accepts(&device(0x16C0, 0x483, DeviceKind::Hid)));
        assert!(!filter.accepts(&device(0x16C0, 0x478, DeviceKind::Serial)));
    }

    #[test]
    fn filter_entries_are_alternatives() {
        let filter = DeviceFilter::new()
            .with(DeviceMatch {
                vid: Some(0x16C0),
                pid: Some(0x478),
                kind: None,
            })
            .with(DeviceMatch {
                vid: Some(0x16C0),
                pid: Some(0x483),
                kind: None,
            });

        assert!(filter.accepts(&device(0x16C0, 0x478, DeviceKind::Hid)));
        assert!(filter.accepts(&device(0x16C0, 0x483, DeviceKind::Serial)));
        assert!(!filter.accepts(&device(0x16C0, 0x482, DeviceKind::Hid)));
    }

    #[test]
    fn default_serial_attributes_are_115200_8n1() {
        let attrs = SerialAttributes::default();
        assert_eq!(attrs.baud, 115200);
        assert_eq!(attrs.data_bits, 8);
        assert_eq!(attrs.parity, Parity::None);
        assert_eq!(attrs.stop_bits, 1);
        assert_eq!(attrs.flow, FlowControl::None);
    }
}
