//! In-memory backend for the test suite: a scriptable USB "bus" whose
//! plug/unplug calls flow through the same hotplug path as the real
//! backends, plus scriptable I/O ports standing in for open handles.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{Backend, HotplugEvent};
use crate::device::{
    Device, DeviceFilter, DeviceKind, Handle, HandleImpl, HidInfo, SerialAttributes,
};
use crate::error::{Error, ErrorKind, Result};
use crate::system::DescriptorSet;

/// A fake bus shared between a test and the backend it hands out.
#[derive(Clone)]
pub(crate) struct MockBus {
    state: Arc<Mutex<BusState>>,
    /// Pipe pair; a byte per queued event keeps the read end pollable.
    wake_read: RawFd,
    wake_write: RawFd,
}

struct BusState {
    devices: Vec<Arc<Device>>,
    pending: VecDeque<HotplugEvent>,
}

impl MockBus {
    pub(crate) fn new() -> MockBus {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }

        MockBus {
            state: Arc::new(Mutex::new(BusState {
                devices: Vec::new(),
                pending: VecDeque::new(),
            })),
            wake_read: fds[0],
            wake_write: fds[1],
        }
    }

    pub(crate) fn backend(&self) -> Box<dyn Backend> {
        Box::new(MockBackend { bus: self.clone() })
    }

    fn signal(&self) {
        unsafe {
            libc::write(self.wake_write, b"!".as_ptr().cast(), 1);
        }
    }

    /// Plugs a device in: it shows up in enumeration and a hotplug Added
    /// event is queued.
    pub(crate) fn plug(&self, dev: Device) -> Arc<Device> {
        let dev = Arc::new(dev);

        let mut state = self.state.lock().unwrap();
        state.devices.push(Arc::clone(&dev));
        state.pending.push_back(HotplugEvent::Added(Arc::clone(&dev)));
        drop(state);

        self.signal();
        dev
    }

    /// Unplugs by key; queues the matching Removed event.
    pub(crate) fn unplug(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.devices.retain(|dev| dev.key() != key);
        state.pending.push_back(HotplugEvent::Removed {
            key: key.to_string(),
        });
        drop(state);

        self.signal();
    }
}

pub(crate) struct MockBackend {
    bus: MockBus,
}

impl Backend for MockBackend {
    fn enumerate(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(Arc<Device>) -> Result<bool>,
    ) -> Result<()> {
        let devices: Vec<_> = self.bus.state.lock().unwrap().devices.clone();

        for dev in devices {
            if filter.accepts(&dev) && !visit(dev)? {
                break;
            }
        }
        Ok(())
    }

    fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.bus.wake_read, id);
    }

    fn refresh(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(HotplugEvent) -> Result<()>,
    ) -> Result<()> {
        let mut drain = [0u8; 64];
        while unsafe { libc::read(self.bus.wake_read, drain.as_mut_ptr().cast(), drain.len()) } > 0
        {}

        loop {
            let event = self.bus.state.lock().unwrap().pending.pop_front();
            match event {
                Some(HotplugEvent::Added(dev)) => {
                    if filter.accepts(&dev) {
                        visit(HotplugEvent::Added(dev))?;
                    }
                }
                Some(event) => visit(event)?,
                None => break,
            }
        }
        Ok(())
    }
}

/// Scriptable I/O state for one device, shared between the test and any
/// handle opened on that device.
#[derive(Clone, Default)]
pub(crate) struct MockPort {
    state: Arc<Mutex<PortState>>,
}

#[derive(Default)]
pub(crate) struct PortState {
    /// Output reports recorded from `hid_write`, report id byte included.
    pub hid_writes: Vec<Vec<u8>>,
    /// Feature reports recorded from `hid_send_feature_report`.
    pub feature_reports: Vec<Vec<u8>>,
    /// Scripted input: one entry per HID read (or serial read chunk).
    pub reads: VecDeque<Vec<u8>>,
    /// Bytes recorded from `serial_write`.
    pub serial_writes: Vec<u8>,
    /// Every `serial_set_attributes` call, in order.
    pub attr_history: Vec<SerialAttributes>,
    /// Fail the next N HID writes with an I/O error (bootloader stall).
    pub failing_writes: usize,
    pub open_count: usize,
}

impl MockPort {
    pub(crate) fn new() -> MockPort {
        Default::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn push_read(&self, data: &[u8]) {
        self.state().reads.push_back(data.to_vec());
    }
}

/// Handle over a [MockPort].
#[derive(Debug)]
pub(crate) struct MockHandle {
    port: MockPort,
}

impl std::fmt::Debug for MockPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPort").finish()
    }
}

impl MockHandle {
    pub(crate) fn open(dev: &Arc<Device>) -> Result<Handle> {
        let port = dev
            .mock
            .as_ref()
            .expect("opening a mock handle on a device without a mock port")
            .clone();
        port.state().open_count += 1;

        Ok(Handle {
            dev: Arc::clone(dev),
            imp: HandleImpl::Mock(MockHandle { port }),
        })
    }

    pub(crate) fn descriptors(&self, _set: &mut DescriptorSet, _id: i32) {}

    pub(crate) fn hid_read(&mut self, buf: &mut [u8], _timeout: i32) -> Result<usize> {
        match self.port.state().reads.pop_front() {
            Some(report) => {
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    pub(crate) fn hid_write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut state = self.port.state();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(Error::new(ErrorKind::Io, "mock endpoint stalled"));
        }

        state.hid_writes.push(buf.to_vec());
        Ok(buf.len())
    }

    pub(crate) fn hid_send_feature_report(&mut self, buf: &[u8]) -> Result<usize> {
        self.port.state().feature_reports.push(buf.to_vec());
        Ok(buf.len())
    }

    pub(crate) fn serial_read(&mut self, buf: &mut [u8], _timeout: i32) -> Result<usize> {
        match self.port.state().reads.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    pub(crate) fn serial_write(&mut self, buf: &[u8]) -> Result<usize> {
        self.port.state().serial_writes.extend_from_slice(buf);
        Ok(buf.len())
    }

    pub(crate) fn serial_set_attributes(&mut self, attrs: &SerialAttributes) -> Result<()> {
        self.port.state().attr_history.push(*attrs);
        Ok(())
    }
}

//
// Canned Teensy devices for the tests.
//

const TEENSY_VID: u16 = 0x16C0;

fn with_port(mut dev: Device, port: &MockPort) -> Device {
    dev.mock = Some(port.clone());
    dev
}

/// A Teensy in HalfKay bootloader mode (HID, usage page 0xFF9C).
pub(crate) fn bootloader_device(
    location: &str,
    serial_hex: &str,
    usage: u8,
    port: &MockPort,
) -> Device {
    with_port(
        Device::new(
            format!("mock:{}:{}:bootloader", location, serial_hex),
            location.to_string(),
            format!("/dev/mock-halfkay-{}", location),
            TEENSY_VID,
            0x478,
            Some(serial_hex.to_string()),
            0,
            DeviceKind::Hid,
            Some(HidInfo {
                usage_page: 0xFF9C,
                usage: usage as u16,
                numbered_reports: false,
            }),
        ),
        port,
    )
}

/// A Teensy running user code with USB Serial (CDC).
pub(crate) fn serial_device(location: &str, serial: &str, port: &MockPort) -> Device {
    with_port(
        Device::new(
            format!("mock:{}:{}:serial", location, serial),
            location.to_string(),
            format!("/dev/mock-acm-{}", location),
            TEENSY_VID,
            0x483,
            Some(serial.to_string()),
            0,
            DeviceKind::Serial,
            None,
        ),
        port,
    )
}

/// A Teensy running user code with SEREMU (HID serial emulation).
pub(crate) fn seremu_device(location: &str, serial: &str, port: &MockPort) -> Device {
    with_port(
        Device::new(
            format!("mock:{}:{}:seremu", location, serial),
            location.to_string(),
            format!("/dev/mock-seremu-{}", location),
            TEENSY_VID,
            0x482,
            Some(serial.to_string()),
            1,
            DeviceKind::Hid,
            Some(HidInfo {
                usage_page: 0xFFC9,
                usage: 0x04,
                numbered_reports: false,
            }),
        ),
        port,
    )
}
