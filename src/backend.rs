//! Trait and factory for our per-OS backends.
//! Backends can (and will) contain unsafe code, but they expose a safe interface here.

use std::sync::Arc;

use crate::device::{Device, DeviceFilter, DeviceKind, Handle};
use crate::error::Result;
use crate::system::DescriptorSet;

#[cfg(target_os = "linux")]
pub(crate) mod linux;
#[cfg(target_os = "macos")]
pub(crate) mod macos;
#[cfg(test)]
pub(crate) mod mock;
#[cfg(unix)]
pub(crate) mod posix;
#[cfg(windows)]
pub(crate) mod windows;

/// One hotplug notification drained from a backend.
#[derive(Debug, Clone)]
pub(crate) enum HotplugEvent {
    Added(Arc<Device>),
    Removed { key: String },
}

/// Trait that unifies all of our OS-specific backends.
///
/// A backend knows how to walk the OS device tree and how to turn plug and
/// unplug notifications into [HotplugEvent]s; opening devices goes through
/// [Device::open] instead, since an open handle carries everything it needs.
pub(crate) trait Backend: Send {
    /// Synchronously visits every currently-plugged interface accepted by
    /// `filter`. The visitor returns `Ok(true)` to continue, `Ok(false)` to
    /// stop early.
    fn enumerate(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(Arc<Device>) -> Result<bool>,
    ) -> Result<()>;

    /// Registers the descriptor that becomes ready when hotplug
    /// notifications are queued.
    fn descriptors(&self, set: &mut DescriptorSet, id: i32);

    /// Drains queued notifications, probing added interfaces against
    /// `filter`. Removals are always forwarded; the monitor drops the ones it
    /// never knew about.
    fn refresh(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(HotplugEvent) -> Result<()>,
    ) -> Result<()>;
}

/// Creates the backend implementation for this platform.
#[cfg(target_os = "linux")]
pub(crate) fn create_default_backend() -> Result<Box<dyn Backend>> {
    Ok(Box::new(linux::LinuxBackend::new()?))
}

/// Creates the backend implementation for this platform.
#[cfg(target_os = "macos")]
pub(crate) fn create_default_backend() -> Result<Box<dyn Backend>> {
    Ok(Box::new(macos::MacosBackend::new()?))
}

/// Creates the backend implementation for this platform.
#[cfg(windows)]
pub(crate) fn create_default_backend() -> Result<Box<dyn Backend>> {
    Ok(Box::new(windows::WindowsBackend::new()?))
}

/// Opens `dev` for bidirectional I/O with whatever platform handle fits its
/// kind.
pub fn open_device(dev: &Arc<Device>) -> Result<Handle> {
    if !dev.is_connected() {
        return Err(crate::error::Error::new(
            crate::error::ErrorKind::NotFound,
            format!("Device '{}' is not connected", dev.path()),
        ));
    }

    #[cfg(test)]
    if dev.mock.is_some() {
        return mock::MockHandle::open(dev);
    }

    match dev.kind() {
        #[cfg(target_os = "linux")]
        DeviceKind::Hid => linux::HidHandle::open(dev),
        #[cfg(target_os = "macos")]
        DeviceKind::Hid => macos::HidHandle::open(dev),
        #[cfg(unix)]
        DeviceKind::Serial => posix::SerialHandle::open(dev),
        #[cfg(windows)]
        DeviceKind::Hid => windows::HidHandle::open(dev),
        #[cfg(windows)]
        DeviceKind::Serial => windows::SerialHandle::open(dev),
    }
}

/// One-shot enumeration without a monitor: visits every interface accepted
/// by `filter` that is plugged right now. The visitor returns `Ok(true)` to
/// keep going.
pub fn enumerate(
    filter: &DeviceFilter,
    mut visit: impl FnMut(Arc<Device>) -> Result<bool>,
) -> Result<()> {
    let mut backend = create_default_backend()?;
    backend.enumerate(filter, &mut visit)
}

/// Returns the first interface accepted by `filter`, if any is plugged.
pub fn find_first(filter: &DeviceFilter) -> Result<Option<Arc<Device>>> {
    let mut found = None;

    enumerate(filter, |dev| {
        found = Some(dev);
        Ok(false)
    })?;

    Ok(found)
}
