//! Deduplicated live table of USB interfaces, driven by the platform
//! backend's hotplug stream.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::backend::{create_default_backend, Backend, HotplugEvent};
use crate::device::{Device, DeviceFilter};
use crate::error::Result;
use crate::system::DescriptorSet;

/// What happened to a device between two refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Added,
    Removed,
}

/// Visitor receiving device events from [Monitor::refresh].
pub type DeviceVisitor<'a> = dyn FnMut(&Arc<Device>, DeviceEvent) -> Result<()> + 'a;

/// The live view of matching USB interfaces on this host.
///
/// The table is keyed by each interface's backend key; re-announced
/// interfaces are dropped on the floor so backends may be sloppy about
/// duplicate notifications.
pub struct Monitor {
    backend: Box<dyn Backend>,
    filter: DeviceFilter,
    devices: HashMap<String, Arc<Device>>,
}

impl Monitor {
    /// Creates a monitor over this platform's backend and performs the
    /// initial enumeration.
    pub fn new(filter: DeviceFilter) -> Result<Monitor> {
        Monitor::with_backend(create_default_backend()?, filter)
    }

    pub(crate) fn with_backend(backend: Box<dyn Backend>, filter: DeviceFilter) -> Result<Monitor> {
        let mut monitor = Monitor {
            backend,
            filter,
            devices: HashMap::new(),
        };

        // Populate the table; events start flowing on the first refresh.
        let mut initial = Vec::new();
        monitor
            .backend
            .enumerate(&monitor.filter, &mut |dev: Arc<Device>| {
                initial.push(dev);
                Ok(true)
            })?;
        for dev in initial {
            monitor.add(dev, &mut |_, _| Ok(()))?;
        }

        Ok(monitor)
    }

    /// Registers the descriptor that wakes a poller when hotplug events are
    /// waiting to be drained by [refresh](Self::refresh).
    pub fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        self.backend.descriptors(set, id);
    }

    /// All interfaces currently in the table, in no particular order.
    pub fn list(&self) -> Vec<Arc<Device>> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Inserts `dev` unless an entry with the same key and interface number
    /// already exists; the visitor sees Added exactly once per new entry.
    pub(crate) fn add(&mut self, dev: Arc<Device>, visit: &mut DeviceVisitor) -> Result<()> {
        if !self.filter.accepts(&dev) {
            return Ok(());
        }

        if let Some(existing) = self.devices.get(dev.key()) {
            if existing.interface_number() == dev.interface_number() {
                return Ok(());
            }
        }

        debug!(
            "device {:04x}:{:04x} added at {} ({})",
            dev.vid(),
            dev.pid(),
            dev.location(),
            dev.path()
        );

        self.devices.insert(dev.key().to_string(), Arc::clone(&dev));
        visit(&dev, DeviceEvent::Added)
    }

    /// Removes the entry stored under `key`, if any; the visitor sees the
    /// device after it has been marked disconnected.
    pub(crate) fn remove(&mut self, key: &str, visit: &mut DeviceVisitor) -> Result<()> {
        let Some(dev) = self.devices.remove(key) else {
            return Ok(());
        };

        debug!(
            "device {:04x}:{:04x} removed from {}",
            dev.vid(),
            dev.pid(),
            dev.location()
        );

        dev.mark_disconnected();
        visit(&dev, DeviceEvent::Removed)
    }

    /// Drains pending hotplug notifications and folds the survivors into the
    /// table, reporting each actual change to the visitor.
    pub fn refresh(&mut self, visit: &mut DeviceVisitor) -> Result<()> {
        // The borrow checker will not let the closure reach back into
        // self.devices while self.backend runs, so stage the events.
        let mut events = Vec::new();
        self.backend.refresh(&self.filter, &mut |event| {
            events.push(event);
            Ok(())
        })?;

        for event in events {
            match event {
                HotplugEvent::Added(dev) => self.add(dev, visit)?,
                HotplugEvent::Removed { key } => self.remove(&key, visit)?,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock;
    use crate::device::DeviceMatch;

    fn collect(monitor: &mut Monitor) -> Vec<(String, DeviceEvent)> {
        let mut events = Vec::new();
        monitor
            .refresh(&mut |dev, event| {
                events.push((dev.key().to_string(), event));
                Ok(())
            })
            .unwrap();
        events
    }

    #[test]
    fn initial_enumeration_fills_the_table() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port));

        let monitor = Monitor::with_backend(bus.backend(), DeviceFilter::new()).unwrap();
        assert_eq!(monitor.len(), 1);
        assert_eq!(monitor.list()[0].location(), "usb-1-2");
    }

    #[test]
    fn refresh_with_no_changes_is_a_no_op() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::serial_device("usb-1-2", "4242", &port));

        let mut monitor = Monitor::with_backend(bus.backend(), DeviceFilter::new()).unwrap();
        assert!(collect(&mut monitor).is_empty());
    }

    #[test]
    fn duplicate_add_emits_exactly_one_added() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        let dev = bus.plug(mock::serial_device("usb-1-2", "4242", &port));

        let mut monitor = Monitor::with_backend(bus.backend(), DeviceFilter::new()).unwrap();

        // Re-announce the same key and interface number.
        let mut events = Vec::new();
        monitor
            .add(Arc::clone(&dev), &mut |dev, event| {
                events.push((dev.key().to_string(), event));
                Ok(())
            })
            .unwrap();

        assert!(events.is_empty());
        assert_eq!(monitor.len(), 1);
    }

    #[test]
    fn hotplug_events_flow_through_refresh() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();

        let mut monitor = Monitor::with_backend(bus.backend(), DeviceFilter::new()).unwrap();
        assert!(monitor.is_empty());

        let dev = bus.plug(mock::serial_device("usb-1-3", "77", &port));
        let events = collect(&mut monitor);
        assert_eq!(events, vec![(dev.key().to_string(), DeviceEvent::Added)]);
        assert_eq!(monitor.len(), 1);

        bus.unplug(dev.key());
        let events = collect(&mut monitor);
        assert_eq!(events, vec![(dev.key().to_string(), DeviceEvent::Removed)]);
        assert!(monitor.is_empty());
        assert!(!dev.is_connected());
    }

    #[test]
    fn removal_of_unknown_keys_is_silent() {
        let bus = mock::MockBus::new();
        let mut monitor = Monitor::with_backend(bus.backend(), DeviceFilter::new()).unwrap();

        bus.unplug("mock:never-seen");
        assert!(collect(&mut monitor).is_empty());
    }

    #[test]
    fn filter_drops_mismatched_interfaces_before_the_table() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::serial_device("usb-1-2", "1", &port));

        let filter = DeviceFilter::new().with(DeviceMatch {
            vid: Some(0xDEAD),
            pid: None,
            kind: None,
        });
        let mut monitor = Monitor::with_backend(bus.backend(), filter).unwrap();
        assert!(monitor.is_empty());

        bus.plug(mock::serial_device("usb-1-4", "2", &port));
        assert!(collect(&mut monitor).is_empty());
    }
}
