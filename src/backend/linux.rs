//! Linux backend: enumeration through the kernel's sysfs USB hierarchy,
//! hotplug through a netlink uevent socket, and hidraw I/O.

use std::fs;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use crate::backend::posix::wait_readable;
use crate::backend::{Backend, HotplugEvent};
use crate::device::{Device, DeviceFilter, DeviceKind, Handle, HandleImpl, HidInfo};
use crate::error::{Error, ErrorKind, Result};
use crate::system::DescriptorSet;

pub(crate) struct LinuxBackend {
    sock: RawFd,
}

impl LinuxBackend {
    pub(crate) fn new() -> Result<LinuxBackend> {
        // Group 1 carries the kernel's own uevents; udevd's re-broadcasts
        // live in group 2 and are not for us.
        let sock = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if sock < 0 {
            return Err(Error::new(
                ErrorKind::System,
                format!(
                    "socket(NETLINK_KOBJECT_UEVENT) failed: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = 1;

        let r = unsafe {
            libc::bind(
                sock,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(sock);
            }
            return Err(Error::new(
                ErrorKind::System,
                format!("bind() on uevent socket failed: {}", err),
            ));
        }

        Ok(LinuxBackend { sock })
    }
}

impl Drop for LinuxBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.sock);
        }
    }
}

impl Backend for LinuxBackend {
    fn enumerate(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(Arc<Device>) -> Result<bool>,
    ) -> Result<()> {
        for class in ["hidraw", "tty"] {
            let entries = match fs::read_dir(format!("/sys/class/{}", class)) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            for entry in entries.flatten() {
                let node = match fs::canonicalize(entry.path()) {
                    Ok(node) => node,
                    Err(_) => continue,
                };

                match probe_node(&node) {
                    Ok(Some(dev)) => {
                        let dev = Arc::new(dev);
                        if filter.accepts(&dev) && !visit(dev)? {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!("skipping sysfs node {}: {}", node.display(), err);
                    }
                }
            }
        }

        Ok(())
    }

    fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.sock, id);
    }

    fn refresh(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(HotplugEvent) -> Result<()>,
    ) -> Result<()> {
        let mut buf = [0u8; 8192];

        loop {
            let r = unsafe { libc::recv(self.sock, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if r < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => break,
                    Some(libc::ENOBUFS) => {
                        // The kernel dropped events on us; stale entries will
                        // be cleaned up by the next removal we do see.
                        warn!("uevent socket overflowed, some hotplug events were lost");
                        continue;
                    }
                    _ => {
                        return Err(Error::new(
                            ErrorKind::System,
                            format!("recv() on uevent socket failed: {}", err),
                        ))
                    }
                }
            }
            if r == 0 {
                break;
            }

            let Some(uevent) = parse_uevent(&buf[..r as usize]) else {
                continue;
            };

            match uevent.action.as_str() {
                "add" if uevent.subsystem == "hidraw" || uevent.subsystem == "tty" => {
                    let node = PathBuf::from(format!("/sys{}", uevent.devpath));
                    if let Ok(Some(dev)) = probe_node(&node) {
                        let dev = Arc::new(dev);
                        if filter.accepts(&dev) {
                            visit(HotplugEvent::Added(dev))?;
                        }
                    }
                }
                "remove" => {
                    visit(HotplugEvent::Removed {
                        key: uevent.devpath,
                    })?;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

struct Uevent {
    action: String,
    devpath: String,
    subsystem: String,
}

/// Splits one kernel uevent datagram. Returns None for messages that did not
/// come from the kernel (udevd re-broadcasts carry a "libudev" magic instead
/// of the `action@devpath` header).
fn parse_uevent(data: &[u8]) -> Option<Uevent> {
    let mut records = data.split(|&b| b == 0);

    let header = std::str::from_utf8(records.next()?).ok()?;
    let (action, devpath) = header.split_once('@')?;

    let mut subsystem = String::new();
    for record in records {
        let Ok(record) = std::str::from_utf8(record) else {
            continue;
        };
        if let Some(value) = record.strip_prefix("SUBSYSTEM=") {
            subsystem = value.to_string();
        }
    }

    Some(Uevent {
        action: action.to_string(),
        devpath: devpath.to_string(),
        subsystem,
    })
}

/// Reads one `KEY=value` entry from a sysfs uevent file.
fn read_uevent_value(path: &Path, key: &str) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;

    text.lines()
        .find_map(|line| line.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
        .map(str::to_string)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_hex_u16(path: &Path) -> Option<u16> {
    u16::from_str_radix(read_trimmed(path)?.trim_start_matches("0x"), 16).ok()
}

/// Turns a sysfs usb_device directory name (`<bus>-<port>[.<port>...]`) into
/// the printable location string `usb-<bus>-<port>[-<port>...]`.
fn location_from_sysfs_name(name: &str) -> Option<String> {
    let (bus, chain) = name.split_once('-')?;
    if bus.is_empty() || !bus.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mut location = format!("usb-{}", bus);
    for port in chain.split('.') {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        location.push('-');
        location.push_str(port);
    }

    Some(location)
}

/// Builds a [Device] from a hidraw or tty class node, or None when the node
/// is not a usable USB interface.
fn probe_node(node: &Path) -> Result<Option<Device>> {
    let subsystem = match fs::read_link(node.join("subsystem")) {
        Ok(link) => match link.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Ok(None),
        },
        Err(_) => return Ok(None),
    };

    let kind = match subsystem.as_str() {
        "hidraw" => DeviceKind::Hid,
        "tty" => DeviceKind::Serial,
        _ => return Ok(None),
    };

    // The device node we will open for I/O. Anything we cannot stat is
    // skipped rather than reported: it may be gone already, or never have
    // had a /dev entry at all.
    let devname = match read_uevent_value(&node.join("uevent"), "DEVNAME") {
        Some(devname) => devname,
        None => match node.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Ok(None),
        },
    };
    let path = format!("/dev/{}", devname);
    if fs::metadata(&path).is_err() {
        return Ok(None);
    }

    // Walk ancestors for the owning USB interface and USB device.
    let mut iface_dir: Option<&Path> = None;
    let mut usb_dir: Option<&Path> = None;
    for ancestor in node.ancestors().skip(1) {
        if ancestor == Path::new("/sys") {
            break;
        }
        if iface_dir.is_none() && ancestor.join("bInterfaceNumber").exists() {
            iface_dir = Some(ancestor);
        } else if iface_dir.is_some() && ancestor.join("idVendor").exists() {
            usb_dir = Some(ancestor);
            break;
        }
    }
    let (Some(iface_dir), Some(usb_dir)) = (iface_dir, usb_dir) else {
        return Ok(None);
    };

    let Some(location) = usb_dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(location_from_sysfs_name)
    else {
        return Ok(None);
    };

    let (Some(vid), Some(pid)) = (
        read_hex_u16(&usb_dir.join("idVendor")),
        read_hex_u16(&usb_dir.join("idProduct")),
    ) else {
        return Ok(None);
    };
    let serial = read_trimmed(&usb_dir.join("serial"));

    let Some(iface) = read_trimmed(&iface_dir.join("bInterfaceNumber"))
        .and_then(|s| u8::from_str_radix(&s, 16).ok())
    else {
        return Ok(None);
    };

    // For HID nodes, the HID device directory between the class node and the
    // USB interface exposes the report descriptor.
    let hid = match kind {
        DeviceKind::Hid => {
            let mut info = None;
            for ancestor in node.ancestors().skip(1) {
                if ancestor == iface_dir {
                    break;
                }
                if let Ok(bytes) = fs::read(ancestor.join("report_descriptor")) {
                    info = Some(parse_report_descriptor(&bytes));
                    break;
                }
            }
            Some(info.unwrap_or_default())
        }
        DeviceKind::Serial => None,
    };

    let key = node
        .to_str()
        .and_then(|s| s.strip_prefix("/sys"))
        .map(str::to_string);
    let Some(key) = key else {
        return Ok(None);
    };

    Ok(Some(Device::new(
        key,
        location,
        path,
        vid,
        pid,
        serial,
        iface,
        kind,
        hid,
    )))
}

/// Walks a HID report descriptor item by item for the top-level usage page
/// and usage (outside any collection), and the numbered-reports flag.
pub(crate) fn parse_report_descriptor(desc: &[u8]) -> HidInfo {
    let mut info = HidInfo::default();
    let mut collection_depth = 0u32;

    let mut i = 0;
    while i < desc.len() {
        let prefix = desc[i];

        if prefix == 0xFE {
            // Long item: the next byte holds the payload size.
            if i + 1 >= desc.len() {
                break;
            }
            i += desc[i + 1] as usize + 3;
            continue;
        }

        let mut size = (prefix & 3) as usize;
        if size == 3 {
            size = 4;
        }
        let tag = prefix & 0xFC;

        if i + size >= desc.len() {
            warn!("invalid HID report descriptor (truncated item)");
            break;
        }

        // Little endian payload.
        let mut data = 0u32;
        for (shift, &byte) in desc[i + 1..i + 1 + size].iter().enumerate() {
            data |= (byte as u32) << (8 * shift);
        }

        match tag {
            // Main items.
            0xA0 => collection_depth += 1,
            0xC0 => collection_depth = collection_depth.saturating_sub(1),

            // Global items.
            0x84 => info.numbered_reports = true,
            0x04 => {
                if collection_depth == 0 {
                    info.usage_page = data as u16;
                }
            }

            // Local items.
            0x08 => {
                if collection_depth == 0 {
                    info.usage = data as u16;
                }
            }

            _ => {}
        }

        i += size + 1;
    }

    info
}

/// Kernel version as one comparable number (2.6.30 => 20630000).
pub(crate) fn kernel_version() -> u32 {
    use std::sync::OnceLock;
    static VERSION: OnceLock<u32> = OnceLock::new();

    *VERSION.get_or_init(|| {
        let mut name: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut name) } != 0 {
            return 0;
        }

        let release = unsafe { std::ffi::CStr::from_ptr(name.release.as_ptr()) };
        parse_kernel_release(&release.to_string_lossy())
    })
}

fn parse_kernel_release(release: &str) -> u32 {
    let mut fields = [0u32; 4];
    for (field, part) in fields.iter_mut().zip(release.split('.')) {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.parse() {
            Ok(n) => *field = n,
            Err(_) => break,
        }
    }

    let [major, minor, mut release, mut patch] = fields;
    if major >= 3 {
        patch = release;
        release = 0;
    }

    major * 10_000_000 + minor * 100_000 + release * 1000 + patch
}

/// Linux 2.6.28 to 2.6.33 return numbered input reports shifted by one byte,
/// see <https://git.kernel.org/cgit/linux/kernel/git/torvalds/linux.git/commit/?id=5a38f2c7c4dd53d5be097930902c108e362584a3>.
fn has_numbered_report_bug() -> bool {
    kernel_version() >= 20_628_000 && kernel_version() < 20_634_000
}

// hidraw ioctls, <linux/hidraw.h>.
const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

fn hidiocsfeature(len: usize) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, b'H', 0x06, len)
}

fn io_error(verb: &str, path: &str, err: std::io::Error) -> Error {
    Error::new(
        ErrorKind::Io,
        format!("I/O error while {} '{}': {}", verb, path, err),
    )
}

/// An open hidraw node.
#[derive(Debug)]
pub(crate) struct HidHandle {
    fd: RawFd,
    path: String,
    numbered_reports: bool,
    shift_quirk: bool,
    /// Staging buffer for the shifted-report kernels.
    quirk_buf: Vec<u8>,
}

impl HidHandle {
    pub(crate) fn open(dev: &Arc<Device>) -> Result<Handle> {
        let path = std::ffi::CString::new(dev.path()).map_err(|_| {
            Error::new(ErrorKind::Param, "device path contains a NUL byte")
        })?;

        let fd = loop {
            let fd = unsafe {
                libc::open(
                    path.as_ptr(),
                    libc::O_RDWR | libc::O_CLOEXEC | libc::O_NONBLOCK,
                )
            };
            if fd >= 0 {
                break fd;
            }

            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EACCES) => Error::new(
                    ErrorKind::Access,
                    format!("Permission denied for device '{}'", dev.path()),
                ),
                Some(libc::EIO) | Some(libc::ENXIO) | Some(libc::ENODEV) => Error::new(
                    ErrorKind::Io,
                    format!("I/O error while opening device '{}'", dev.path()),
                ),
                Some(libc::ENOENT) | Some(libc::ENOTDIR) => Error::new(
                    ErrorKind::NotFound,
                    format!("Device '{}' not found", dev.path()),
                ),
                _ => Error::new(
                    ErrorKind::System,
                    format!("open('{}') failed: {}", dev.path(), err),
                ),
            });
        };

        let numbered_reports = dev.hid_info().map(|h| h.numbered_reports).unwrap_or(false);

        Ok(Handle {
            dev: Arc::clone(dev),
            imp: HandleImpl::LinuxHid(HidHandle {
                fd,
                path: dev.path().to_string(),
                numbered_reports,
                shift_quirk: numbered_reports && has_numbered_report_bug(),
                quirk_buf: Vec::new(),
            }),
        })
    }

    pub(crate) fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.fd, id);
    }

    pub(crate) fn read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize> {
        assert!(!buf.is_empty());

        if timeout != 0 && !wait_readable(self.fd, timeout, &self.path)? {
            return Ok(0);
        }

        let r = if self.numbered_reports {
            if self.shift_quirk {
                // Read the stray byte and drop it.
                self.quirk_buf.resize(buf.len() + 1, 0);
                let r = unsafe {
                    libc::read(
                        self.fd,
                        self.quirk_buf.as_mut_ptr().cast(),
                        self.quirk_buf.len(),
                    )
                };
                if r > 0 {
                    let n = (r - 1) as usize;
                    buf[..n].copy_from_slice(&self.quirk_buf[1..=n]);
                    r - 1
                } else {
                    r
                }
            } else {
                unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) }
            }
        } else {
            // Unnumbered devices: report id 0 goes in front for the caller.
            let r = unsafe {
                libc::read(self.fd, buf[1..].as_mut_ptr().cast(), buf.len() - 1)
            };
            if r > 0 {
                buf[0] = 0;
                r + 1
            } else {
                r
            }
        };

        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(io_error("reading from", &self.path, err));
        }

        Ok(r as usize)
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Ok(0);
        }

        loop {
            // On Linux, USB requests time out after 5000 ms and O_NONBLOCK
            // is not honoured for hidraw writes.
            let r = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
            if r >= 0 {
                return Ok(r as usize);
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(io_error("writing to", &self.path, err));
        }
    }

    pub(crate) fn send_feature_report(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Ok(0);
        }

        loop {
            let r = unsafe { libc::ioctl(self.fd, hidiocsfeature(buf.len()), buf.as_ptr()) };
            if r >= 0 {
                return Ok(r as usize);
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(io_error("writing to", &self.path, err));
        }
    }
}

impl Drop for HidHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_descriptor_top_level_usage() {
        // Usage page 0xFF9C, usage 0x1E, then a collection with a report id.
        let desc = [
            0x06, 0x9C, 0xFF, // Usage Page (0xFF9C)
            0x09, 0x1E, // Usage (0x1E)
            0xA1, 0x01, // Collection (Application)
            0x85, 0x02, // Report ID (2)
            0x09, 0x55, // Usage inside the collection: ignored
            0xC0, // End Collection
        ];

        let info = parse_report_descriptor(&desc);
        assert_eq!(info.usage_page, 0xFF9C);
        assert_eq!(info.usage, 0x1E);
        assert!(info.numbered_reports);
    }

    #[test]
    fn report_descriptor_without_report_ids() {
        let desc = [
            0x06, 0xC9, 0xFF, // Usage Page (0xFFC9)
            0x09, 0x04, // Usage (4)
            0xA1, 0x5C, 0xC0, // Collection / End Collection
        ];

        let info = parse_report_descriptor(&desc);
        assert_eq!(info.usage_page, 0xFFC9);
        assert_eq!(info.usage, 0x04);
        assert!(!info.numbered_reports);
    }

    #[test]
    fn report_descriptor_skips_long_items_and_truncation() {
        // A long item (0xFE), then a truncated 2-byte item at the end.
        let desc = [0xFE, 0x02, 0x00, 0xAA, 0xBB, 0x06, 0x9C];
        let info = parse_report_descriptor(&desc);
        assert_eq!(info.usage_page, 0);
    }

    #[test]
    fn report_descriptor_four_byte_payload() {
        let desc = [
            0x07, 0x9C, 0xFF, 0x00, 0x00, // Usage Page, 4-byte payload
        ];
        assert_eq!(parse_report_descriptor(&desc).usage_page, 0xFF9C);
    }

    #[test]
    fn locations_join_the_port_chain() {
        assert_eq!(location_from_sysfs_name("3-1").as_deref(), Some("usb-3-1"));
        assert_eq!(
            location_from_sysfs_name("3-1.2").as_deref(),
            Some("usb-3-1-2")
        );
        assert_eq!(
            location_from_sysfs_name("1-1.4.2").as_deref(),
            Some("usb-1-1-4-2")
        );
        assert_eq!(location_from_sysfs_name("usb3"), None);
        assert_eq!(location_from_sysfs_name("0000:00:14.0"), None);
    }

    #[test]
    fn kernel_release_parsing() {
        // 2.6.x kernels keep four fields.
        assert_eq!(parse_kernel_release("2.6.30"), 20_630_000);
        assert_eq!(parse_kernel_release("2.6.28-rc4"), 20_628_000);
        // From 3.0 on, the third field is a patch level.
        assert_eq!(parse_kernel_release("6.8.0-45-generic"), 60_800_000);
        assert_eq!(parse_kernel_release("3.2.1"), 30_200_001);
    }

    #[test]
    fn numbered_report_bug_window() {
        assert!((20_628_000..20_634_000).contains(&parse_kernel_release("2.6.33")));
        assert!(!(20_628_000..20_634_000).contains(&parse_kernel_release("2.6.34")));
        assert!(!(20_628_000..20_634_000).contains(&parse_kernel_release("2.6.27")));
    }

    #[test]
    fn uevent_parsing_extracts_action_and_subsystem() {
        let data = b"add@/devices/pci0000:00/usb3/3-1/3-1:1.0/hidraw/hidraw2\0\
                     ACTION=add\0\
                     DEVPATH=/devices/pci0000:00/usb3/3-1/3-1:1.0/hidraw/hidraw2\0\
                     SUBSYSTEM=hidraw\0\
                     DEVNAME=hidraw2\0";

        let uevent = parse_uevent(data).unwrap();
        assert_eq!(uevent.action, "add");
        assert_eq!(uevent.subsystem, "hidraw");
        assert!(uevent.devpath.ends_with("hidraw/hidraw2"));
    }

    #[test]
    fn uevent_parsing_rejects_udevd_messages() {
        assert!(parse_uevent(b"libudev\0binary-stuff\0").is_none());
    }
}
