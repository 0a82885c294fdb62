//! macOS backend: enumeration through the IOKit registry, hotplug through
//! first-match/terminated notifications on a dedicated Core Foundation run
//! loop thread, and HID I/O bridged off per-handle run loops.
//!
//! The run-loop threads are the only code allowed to touch Core Foundation;
//! everything else sees lock-protected queues and wake pipes.

use std::collections::VecDeque;
use std::ffi::{c_void, CStr, CString};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use core_foundation_sys::base::{kCFAllocatorDefault, CFRelease, CFTypeRef};
use core_foundation_sys::dictionary::CFMutableDictionaryRef;
use core_foundation_sys::number::{kCFNumberSInt64Type, CFNumberGetValue, CFNumberRef};
use core_foundation_sys::runloop::{
    kCFRunLoopDefaultMode, CFRunLoopAddSource, CFRunLoopGetCurrent, CFRunLoopRef, CFRunLoopRun,
    CFRunLoopSourceRef, CFRunLoopStop,
};
use core_foundation_sys::string::{
    kCFStringEncodingUTF8, CFStringGetCString, CFStringGetCStringPtr, CFStringRef,
};
use io_kit_sys::keys::kIOServicePlane;
use io_kit_sys::ret::{kIOReturnBusy, kIOReturnSuccess, IOReturn};
use io_kit_sys::types::{io_iterator_t, io_object_t, io_service_t};
use io_kit_sys::{
    kIOMasterPortDefault, IOIteratorNext, IOObjectRelease, IORegistryEntryCreateCFProperty,
    IORegistryEntryGetRegistryEntryID, IOServiceGetMatchingServices, IOServiceMatching, CFSTR,
};
use log::warn;

use crate::backend::posix::wait_readable;
use crate::backend::{Backend, HotplugEvent};
use crate::device::{Device, DeviceFilter, DeviceKind, Handle, HandleImpl, HidInfo};
use crate::error::{Error, ErrorKind, Result};
use crate::system::{adjust_timeout, delay, millis, DescriptorSet};

/// Older kernels expose USB devices on a different registry plane with
/// different property keys; Darwin 15 (El Capitan) is the cut.
const DARWIN_NEW_USB_STACK: u32 = 15;

/// On El Capitan and later, opening a HID device right after the arrival
/// notification can fail with kIOReturnBusy for roughly 40 ms. These were
/// tuned on El Capitan; they are not authoritative.
const OPEN_BUSY_RETRIES: u32 = 4;
const OPEN_BUSY_DELAY: u64 = 20;

/// Input reports queued per handle before the oldest are recycled.
const MAX_QUEUED_REPORTS: usize = 64;

// Notification-port and IOHIDDevice declarations the io-kit-sys crate does
// not cover; shapes follow IOKit/IOKitLib.h and IOKit/hid/IOHIDDevice.h.
#[allow(non_camel_case_types)]
mod ffi {
    use super::*;

    pub type IONotificationPortRef = *mut c_void;
    pub type IOHIDDeviceRef = *mut c_void;
    pub type IOServiceMatchingCallback =
        extern "C" fn(refcon: *mut c_void, iterator: io_iterator_t);
    pub type IOHIDReportCallback = extern "C" fn(
        context: *mut c_void,
        result: IOReturn,
        sender: *mut c_void,
        report_type: u32,
        report_id: u32,
        report: *mut u8,
        report_length: isize,
    );

    pub const kIOHIDReportTypeInput: u32 = 0;
    pub const kIOHIDReportTypeOutput: u32 = 1;
    pub const kIOHIDReportTypeFeature: u32 = 2;

    #[link(name = "IOKit", kind = "framework")]
    extern "C" {
        pub fn IONotificationPortCreate(master_port: u32) -> IONotificationPortRef;
        pub fn IONotificationPortDestroy(port: IONotificationPortRef);
        pub fn IONotificationPortGetRunLoopSource(port: IONotificationPortRef)
            -> CFRunLoopSourceRef;
        pub fn IOServiceAddMatchingNotification(
            port: IONotificationPortRef,
            notification_type: *const libc::c_char,
            matching: CFMutableDictionaryRef,
            callback: IOServiceMatchingCallback,
            refcon: *mut c_void,
            iterator: *mut io_iterator_t,
        ) -> IOReturn;

        pub fn IOHIDDeviceCreate(
            allocator: *const c_void,
            service: io_service_t,
        ) -> IOHIDDeviceRef;
        pub fn IOHIDDeviceOpen(device: IOHIDDeviceRef, options: u32) -> IOReturn;
        pub fn IOHIDDeviceClose(device: IOHIDDeviceRef, options: u32) -> IOReturn;
        pub fn IOHIDDeviceScheduleWithRunLoop(
            device: IOHIDDeviceRef,
            run_loop: CFRunLoopRef,
            mode: CFStringRef,
        );
        pub fn IOHIDDeviceRegisterInputReportCallback(
            device: IOHIDDeviceRef,
            report: *mut u8,
            report_length: isize,
            callback: IOHIDReportCallback,
            context: *mut c_void,
        );
        pub fn IOHIDDeviceSetReport(
            device: IOHIDDeviceRef,
            report_type: u32,
            report_id: isize,
            report: *const u8,
            report_length: isize,
        ) -> IOReturn;
    }

    pub const kIOFirstMatchNotification: &[u8] = b"IOServiceFirstMatch\0";
    pub const kIOTerminatedNotification: &[u8] = b"IOServiceTerminated\0";
}

/// Rustified version of the CFSTR C macro.
macro_rules! cfstr {
    ($string:expr) => {{
        let cstr = CString::new($string).unwrap();
        CFSTR(cstr.as_ptr())
    }};
}

/// Wrapper for an IOKit IO-object that automatically drops it.
#[derive(Debug)]
struct IoObject {
    object: io_object_t,
}

impl IoObject {
    fn new(object: io_object_t) -> Self {
        IoObject { object }
    }

    fn get(&self) -> io_object_t {
        self.object
    }
}

impl Drop for IoObject {
    fn drop(&mut self) {
        if self.object != 0 {
            unsafe {
                IOObjectRelease(self.object);
            }
        }
    }
}

fn darwin_major_version() -> u32 {
    use std::sync::OnceLock;
    static VERSION: OnceLock<u32> = OnceLock::new();

    *VERSION.get_or_init(|| {
        let mut name: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut name) } != 0 {
            return 0;
        }

        let release = unsafe { CStr::from_ptr(name.release.as_ptr()) };
        release
            .to_string_lossy()
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
            .unwrap_or(0)
    })
}

fn string_from_cf(string_ref: CFTypeRef) -> Option<String> {
    if string_ref.is_null() {
        return None;
    }
    let string_ref = string_ref as CFStringRef;

    unsafe {
        let fast = CFStringGetCStringPtr(string_ref, kCFStringEncodingUTF8);
        if !fast.is_null() {
            return Some(CStr::from_ptr(fast).to_string_lossy().into_owned());
        }

        let mut buf = [0 as libc::c_char; 256];
        if CFStringGetCString(string_ref, buf.as_mut_ptr(), buf.len() as _, kCFStringEncodingUTF8)
            != 0
        {
            return Some(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned());
        }
    }

    None
}

fn number_from_cf(number_ref: CFTypeRef) -> Option<u64> {
    if number_ref.is_null() {
        return None;
    }

    unsafe {
        let mut value: u64 = 0;
        let ok = CFNumberGetValue(
            number_ref as CFNumberRef,
            kCFNumberSInt64Type,
            &mut value as *mut u64 as *mut c_void,
        );
        ok.then_some(value)
    }
}

/// Reads one property from the service itself (no parent traversal).
fn service_property(service: io_service_t, property: &str) -> Option<CFTypeRef> {
    let value = unsafe {
        IORegistryEntryCreateCFProperty(service, cfstr!(property), kCFAllocatorDefault, 0)
    };
    (!value.is_null()).then_some(value as CFTypeRef)
}

fn service_number(service: io_service_t, property: &str) -> Option<u64> {
    let value = service_property(service, property)?;
    let number = number_from_cf(value);
    unsafe {
        CFRelease(value);
    }
    number
}

fn service_string(service: io_service_t, property: &str) -> Option<String> {
    let value = service_property(service, property)?;
    let string = string_from_cf(value);
    unsafe {
        CFRelease(value);
    }
    string
}

/// Builds the printable location from the 32-bit IOKit locationID: the top
/// byte is the controller, then one port per nibble until a zero nibble.
fn location_from_location_id(location_id: u32) -> String {
    let mut location = format!("usb-{}", location_id >> 24);

    let mut shift = 20;
    loop {
        let port = (location_id >> shift) & 0xF;
        if port == 0 {
            break;
        }
        location.push('-');
        location.push_str(&port.to_string());

        if shift == 0 {
            break;
        }
        shift -= 4;
    }

    location
}

/// Probes one registry service into a [Device], or None when it is not a
/// usable USB HID or serial interface.
fn probe_service(service: io_service_t, kind: DeviceKind) -> Option<Device> {
    let mut entry_id: u64 = 0;
    unsafe {
        if IORegistryEntryGetRegistryEntryID(service, &mut entry_id) != kIOReturnSuccess {
            return None;
        }
    }

    let vid = service_number(service, "idVendor").or(service_number(service, "VendorID"))? as u16;
    let pid =
        service_number(service, "idProduct").or(service_number(service, "ProductID"))? as u16;

    // Devices without a location (root hubs mostly) are not real targets.
    let location_id = service_number(service, "locationID")? as u32;
    let location = location_from_location_id(location_id);

    let serial = service_string(service, "USB Serial Number")
        .or_else(|| service_string(service, "SerialNumber"));

    let iface = service_number(service, "bInterfaceNumber")
        .or_else(|| service_number(service, "InterfaceNumber"))
        .unwrap_or(0) as u8;

    let (path, hid) = match kind {
        DeviceKind::Hid => {
            let usage_page = service_number(service, "PrimaryUsagePage").unwrap_or(0) as u16;
            let usage = service_number(service, "PrimaryUsage").unwrap_or(0) as u16;
            // The registry id doubles as the I/O path: handles reopen the
            // service by id.
            (
                format!("iokit:{:#x}", entry_id),
                Some(HidInfo {
                    usage_page,
                    usage,
                    numbered_reports: service_number(service, "ReportID").is_some(),
                }),
            )
        }
        DeviceKind::Serial => {
            let path = service_string(service, "IOCalloutDevice")?;
            (path, None)
        }
    };

    Some(Device::new(
        format!("iokit:{:#x}", entry_id),
        location,
        path,
        vid,
        pid,
        serial,
        iface,
        kind,
        hid,
    ))
}

fn matching_classes(kind: DeviceKind) -> &'static [&'static str] {
    match kind {
        // IOUSBHostHIDDevice appeared with the new USB stack.
        DeviceKind::Hid => {
            if darwin_major_version() >= DARWIN_NEW_USB_STACK {
                &["IOHIDDevice", "IOUSBHostHIDDevice"]
            } else {
                &["IOHIDDevice"]
            }
        }
        DeviceKind::Serial => &["IOSerialBSDClient"],
    }
}

fn enumerate_kind(
    kind: DeviceKind,
    filter: &DeviceFilter,
    visit: &mut dyn FnMut(Arc<Device>) -> Result<bool>,
) -> Result<bool> {
    for class in matching_classes(kind) {
        let class_name = CString::new(*class).unwrap();

        unsafe {
            let matcher = IOServiceMatching(class_name.as_ptr());
            if matcher.is_null() {
                continue;
            }

            let mut iterator: io_iterator_t = 0;
            let rc = IOServiceGetMatchingServices(kIOMasterPortDefault, matcher, &mut iterator);
            if rc != kIOReturnSuccess {
                return Err(Error::new(
                    ErrorKind::System,
                    format!("IOServiceGetMatchingServices() failed: {:#x}", rc),
                ));
            }
            let iterator = IoObject::new(iterator);

            loop {
                let service = IOIteratorNext(iterator.get());
                if service == 0 {
                    break;
                }
                let service = IoObject::new(service);

                if let Some(dev) = probe_service(service.get(), kind) {
                    let dev = Arc::new(dev);
                    if filter.accepts(&dev) && !visit(dev)? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    Ok(true)
}

enum RawNotification {
    Matched(DeviceKind, Vec<Device>),
    Terminated(Vec<String>),
}

struct NotificationQueue {
    pending: Mutex<VecDeque<RawNotification>>,
    wake_write: RawFd,
}

impl NotificationQueue {
    fn push(&self, notification: RawNotification) {
        self.pending.lock().unwrap().push_back(notification);
        unsafe {
            libc::write(self.wake_write, b"!".as_ptr().cast(), 1);
        }
    }
}

struct NotificationContext {
    queue: Arc<NotificationQueue>,
    kind: Option<DeviceKind>,
}

extern "C" fn matched_callback(refcon: *mut c_void, iterator: io_iterator_t) {
    let ctx = unsafe { &*(refcon as *const NotificationContext) };
    let kind = ctx.kind.expect("match notification without a device kind");

    let mut devices = Vec::new();
    loop {
        let service = unsafe { IOIteratorNext(iterator) };
        if service == 0 {
            break;
        }
        let service = IoObject::new(service);

        if let Some(dev) = probe_service(service.get(), kind) {
            devices.push(dev);
        }
    }

    if !devices.is_empty() {
        ctx.queue.push(RawNotification::Matched(kind, devices));
    }
}

extern "C" fn terminated_callback(refcon: *mut c_void, iterator: io_iterator_t) {
    let ctx = unsafe { &*(refcon as *const NotificationContext) };

    let mut keys = Vec::new();
    loop {
        let service = unsafe { IOIteratorNext(iterator) };
        if service == 0 {
            break;
        }
        let service = IoObject::new(service);

        let mut entry_id: u64 = 0;
        unsafe {
            if IORegistryEntryGetRegistryEntryID(service.get(), &mut entry_id) == kIOReturnSuccess
            {
                keys.push(format!("iokit:{:#x}", entry_id));
            }
        }
    }

    if !keys.is_empty() {
        ctx.queue.push(RawNotification::Terminated(keys));
    }
}

fn notification_thread(queue: Arc<NotificationQueue>, run_loop_slot: Arc<AtomicPtr<c_void>>) {
    unsafe {
        let port = ffi::IONotificationPortCreate(kIOMasterPortDefault);
        if port.is_null() {
            warn!("IONotificationPortCreate() failed, hotplug disabled");
            return;
        }

        // Contexts must outlive the run loop; keep them boxed on this stack.
        let mut contexts: Vec<Box<NotificationContext>> = Vec::new();
        let mut iterators: Vec<IoObject> = Vec::new();

        let mut register =
            |class: &str, notification: &'static [u8], kind: Option<DeviceKind>| {
                let ctx = Box::new(NotificationContext {
                    queue: Arc::clone(&queue),
                    kind,
                });
                let refcon = &*ctx as *const NotificationContext as *mut c_void;

                let class_name = CString::new(class).unwrap();
                let matcher = IOServiceMatching(class_name.as_ptr());
                if matcher.is_null() {
                    return;
                }

                let callback = match kind {
                    Some(_) => matched_callback as ffi::IOServiceMatchingCallback,
                    None => terminated_callback as ffi::IOServiceMatchingCallback,
                };

                let mut iterator: io_iterator_t = 0;
                let rc = ffi::IOServiceAddMatchingNotification(
                    port,
                    notification.as_ptr() as *const libc::c_char,
                    matcher,
                    callback,
                    refcon,
                    &mut iterator,
                );
                if rc != kIOReturnSuccess {
                    warn!("IOServiceAddMatchingNotification() failed: {:#x}", rc);
                    return;
                }

                // Arm the notification by draining the initial iterator.
                callback(refcon, iterator);

                contexts.push(ctx);
                iterators.push(IoObject::new(iterator));
            };

        for class in matching_classes(DeviceKind::Hid) {
            register(class, ffi::kIOFirstMatchNotification, Some(DeviceKind::Hid));
        }
        register(
            "IOSerialBSDClient",
            ffi::kIOFirstMatchNotification,
            Some(DeviceKind::Serial),
        );
        // One terminated notification on the USB device class covers every
        // interface of a vanished device.
        register("IOUSBDevice", ffi::kIOTerminatedNotification, None);
        if darwin_major_version() >= DARWIN_NEW_USB_STACK {
            register("IOUSBHostDevice", ffi::kIOTerminatedNotification, None);
        }
        register("IOHIDDevice", ffi::kIOTerminatedNotification, None);
        register("IOSerialBSDClient", ffi::kIOTerminatedNotification, None);

        let source = ffi::IONotificationPortGetRunLoopSource(port);
        let run_loop = CFRunLoopGetCurrent();
        CFRunLoopAddSource(run_loop, source, kCFRunLoopDefaultMode);
        run_loop_slot.store(run_loop as *mut c_void, Ordering::Release);

        CFRunLoopRun();

        run_loop_slot.store(std::ptr::null_mut(), Ordering::Release);
        ffi::IONotificationPortDestroy(port);
        drop(iterators);
        drop(contexts);
    }
}

pub(crate) struct MacosBackend {
    queue: Arc<NotificationQueue>,
    wake_read: RawFd,
    run_loop: Arc<AtomicPtr<c_void>>,
    thread: Option<JoinHandle<()>>,
}

impl MacosBackend {
    pub(crate) fn new() -> Result<MacosBackend> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::new(
                ErrorKind::System,
                format!("pipe() failed: {}", std::io::Error::last_os_error()),
            ));
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }

        let queue = Arc::new(NotificationQueue {
            pending: Mutex::new(VecDeque::new()),
            wake_write: fds[1],
        });

        let run_loop = Arc::new(AtomicPtr::new(std::ptr::null_mut()));
        let thread_queue = Arc::clone(&queue);
        let thread_run_loop = Arc::clone(&run_loop);
        let thread = std::thread::Builder::new()
            .name("tyrs-iokit".to_string())
            .spawn(move || notification_thread(thread_queue, thread_run_loop))
            .map_err(Error::from)?;

        Ok(MacosBackend {
            queue,
            wake_read: fds[0],
            run_loop,
            thread: Some(thread),
        })
    }
}

impl Drop for MacosBackend {
    fn drop(&mut self) {
        let run_loop = self.run_loop.load(Ordering::Acquire);
        if !run_loop.is_null() {
            unsafe {
                CFRunLoopStop(run_loop as CFRunLoopRef);
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        unsafe {
            libc::close(self.wake_read);
            libc::close(self.queue.wake_write);
        }
    }
}

impl Backend for MacosBackend {
    fn enumerate(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(Arc<Device>) -> Result<bool>,
    ) -> Result<()> {
        if enumerate_kind(DeviceKind::Hid, filter, visit)? {
            enumerate_kind(DeviceKind::Serial, filter, visit)?;
        }
        Ok(())
    }

    fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.wake_read, id);
    }

    fn refresh(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(HotplugEvent) -> Result<()>,
    ) -> Result<()> {
        let mut drain = [0u8; 64];
        while unsafe { libc::read(self.wake_read, drain.as_mut_ptr().cast(), drain.len()) } > 0 {}

        loop {
            let notification = self.queue.pending.lock().unwrap().pop_front();
            match notification {
                Some(RawNotification::Matched(_, devices)) => {
                    for dev in devices {
                        let dev = Arc::new(dev);
                        if filter.accepts(&dev) {
                            visit(HotplugEvent::Added(dev))?;
                        }
                    }
                }
                Some(RawNotification::Terminated(keys)) => {
                    for key in keys {
                        visit(HotplugEvent::Removed { key })?;
                    }
                }
                None => break,
            }
        }

        Ok(())
    }
}

//
// HID handles: one run-loop bridge thread per open device.
//

struct ReportQueue {
    reports: Mutex<VecDeque<Vec<u8>>>,
    wake_write: RawFd,
    open_result: Mutex<Option<IOReturn>>,
    open_cond: Condvar,
}

struct BridgeContext {
    queue: Arc<ReportQueue>,
    scratch: Vec<u8>,
}

extern "C" fn input_report_callback(
    context: *mut c_void,
    result: IOReturn,
    _sender: *mut c_void,
    _report_type: u32,
    report_id: u32,
    report: *mut u8,
    report_length: isize,
) {
    if result != kIOReturnSuccess || report_length < 0 {
        return;
    }
    let ctx = unsafe { &*(context as *const BridgeContext) };

    let mut record = Vec::with_capacity(report_length as usize + 1);
    record.push(report_id as u8);
    record.extend_from_slice(unsafe {
        std::slice::from_raw_parts(report, report_length as usize)
    });

    {
        let mut reports = ctx.queue.reports.lock().unwrap();
        // Bounded: the oldest report makes room rather than growing forever.
        if reports.len() >= MAX_QUEUED_REPORTS {
            reports.pop_front();
        }
        reports.push_back(record);
    }

    unsafe {
        libc::write(ctx.queue.wake_write, b"!".as_ptr().cast(), 1);
    }
}

fn hid_bridge_thread(
    service_id: u64,
    queue: Arc<ReportQueue>,
    run_loop_slot: Arc<AtomicPtr<c_void>>,
    device_slot: Arc<AtomicPtr<c_void>>,
) {
    unsafe {
        let service = match service_from_entry_id(service_id) {
            Some(service) => service,
            None => {
                *queue.open_result.lock().unwrap() = Some(kIOReturnBusy);
                queue.open_cond.notify_all();
                return;
            }
        };

        let device = ffi::IOHIDDeviceCreate(kCFAllocatorDefault as *const c_void, service.get());
        if device.is_null() {
            *queue.open_result.lock().unwrap() = Some(kIOReturnBusy);
            queue.open_cond.notify_all();
            return;
        }

        // Transient EBUSY right after the arrival notification.
        let mut rc = ffi::IOHIDDeviceOpen(device, 0);
        let mut retries = OPEN_BUSY_RETRIES;
        while rc == kIOReturnBusy && retries > 0 {
            delay(OPEN_BUSY_DELAY);
            rc = ffi::IOHIDDeviceOpen(device, 0);
            retries -= 1;
        }

        if rc != kIOReturnSuccess {
            CFRelease(device as CFTypeRef);
            *queue.open_result.lock().unwrap() = Some(rc);
            queue.open_cond.notify_all();
            return;
        }

        let mut ctx = Box::new(BridgeContext {
            queue: Arc::clone(&queue),
            scratch: vec![0u8; 4096],
        });
        let scratch_ptr = ctx.scratch.as_mut_ptr();
        let scratch_len = ctx.scratch.len() as isize;
        let refcon = &mut *ctx as *mut BridgeContext as *mut c_void;

        ffi::IOHIDDeviceRegisterInputReportCallback(
            device,
            scratch_ptr,
            scratch_len,
            input_report_callback,
            refcon,
        );

        let run_loop = CFRunLoopGetCurrent();
        ffi::IOHIDDeviceScheduleWithRunLoop(device, run_loop, kCFRunLoopDefaultMode);
        run_loop_slot.store(run_loop as *mut c_void, Ordering::Release);
        device_slot.store(device, Ordering::Release);

        *queue.open_result.lock().unwrap() = Some(kIOReturnSuccess);
        queue.open_cond.notify_all();

        CFRunLoopRun();

        device_slot.store(std::ptr::null_mut(), Ordering::Release);
        ffi::IOHIDDeviceClose(device, 0);
        CFRelease(device as CFTypeRef);
        drop(ctx);
    }
}

fn service_from_entry_id(entry_id: u64) -> Option<IoObject> {
    // IORegistryEntryIDMatching + IOServiceGetMatchingService would be the
    // direct route; io-kit-sys lacks the former, so scan the HID classes.
    for class in matching_classes(DeviceKind::Hid) {
        let class_name = CString::new(*class).unwrap();

        unsafe {
            let matcher = IOServiceMatching(class_name.as_ptr());
            if matcher.is_null() {
                continue;
            }

            let mut iterator: io_iterator_t = 0;
            if IOServiceGetMatchingServices(kIOMasterPortDefault, matcher, &mut iterator)
                != kIOReturnSuccess
            {
                continue;
            }
            let iterator = IoObject::new(iterator);

            loop {
                let service = IOIteratorNext(iterator.get());
                if service == 0 {
                    break;
                }

                let mut candidate_id: u64 = 0;
                if IORegistryEntryGetRegistryEntryID(service, &mut candidate_id)
                    == kIOReturnSuccess
                    && candidate_id == entry_id
                {
                    return Some(IoObject::new(service));
                }
                IOObjectRelease(service);
            }
        }
    }

    None
}

/// An open HID device, serviced by its own run-loop bridge thread.
pub(crate) struct HidHandle {
    queue: Arc<ReportQueue>,
    wake_read: RawFd,
    run_loop: Arc<AtomicPtr<c_void>>,
    device: Arc<AtomicPtr<c_void>>,
    thread: Option<JoinHandle<()>>,
    path: String,
}

// The IOHIDDeviceRef is only dereferenced behind &mut self or on the bridge
// thread; the queue does the cross-thread hand-off.
unsafe impl Send for HidHandle {}

impl std::fmt::Debug for HidHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidHandle").field("path", &self.path).finish()
    }
}

impl HidHandle {
    pub(crate) fn open(dev: &Arc<Device>) -> Result<Handle> {
        let entry_id = dev
            .key()
            .strip_prefix("iokit:0x")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .ok_or_else(|| Error::new(ErrorKind::Param, "malformed IOKit device key"))?;

        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::new(
                ErrorKind::System,
                format!("pipe() failed: {}", std::io::Error::last_os_error()),
            ));
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }

        let queue = Arc::new(ReportQueue {
            reports: Mutex::new(VecDeque::new()),
            wake_write: fds[1],
            open_result: Mutex::new(None),
            open_cond: Condvar::new(),
        });
        let run_loop = Arc::new(AtomicPtr::new(std::ptr::null_mut()));
        let device_slot = Arc::new(AtomicPtr::new(std::ptr::null_mut()));

        let thread_queue = Arc::clone(&queue);
        let thread_run_loop = Arc::clone(&run_loop);
        let thread_device = Arc::clone(&device_slot);
        let thread = std::thread::Builder::new()
            .name("tyrs-hid".to_string())
            .spawn(move || {
                hid_bridge_thread(entry_id, thread_queue, thread_run_loop, thread_device)
            })
            .map_err(Error::from)?;

        // Wait for the bridge to finish (or fail) the open.
        let rc = {
            let mut result = queue.open_result.lock().unwrap();
            while result.is_none() {
                result = queue.open_cond.wait(result).unwrap();
            }
            result.unwrap()
        };

        if rc != kIOReturnSuccess {
            let _ = thread.join();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(Error::new(
                match rc {
                    r if r == kIOReturnBusy => ErrorKind::Busy,
                    _ => ErrorKind::Io,
                },
                format!("Failed to open HID device '{}': {:#x}", dev.path(), rc),
            ));
        }

        Ok(Handle {
            dev: Arc::clone(dev),
            imp: HandleImpl::MacosHid(HidHandle {
                queue,
                wake_read: fds[0],
                run_loop,
                device: device_slot,
                thread: Some(thread),
                path: dev.path().to_string(),
            }),
        })
    }

    pub(crate) fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.wake_read, id);
    }

    pub(crate) fn read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize> {
        assert!(!buf.is_empty());

        let start = millis();
        loop {
            if let Some(report) = self.queue.reports.lock().unwrap().pop_front() {
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                return Ok(n);
            }

            if timeout == 0
                || !wait_readable(self.wake_read, adjust_timeout(timeout, start), &self.path)?
            {
                return Ok(0);
            }

            let mut drain = [0u8; 64];
            while unsafe {
                libc::read(self.wake_read, drain.as_mut_ptr().cast(), drain.len())
            } > 0
            {}
        }
    }

    fn set_report(&mut self, report_type: u32, buf: &[u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Ok(0);
        }

        let device = self.device.load(Ordering::Acquire);
        if device.is_null() {
            return Err(Error::new(
                ErrorKind::Io,
                format!("HID device '{}' is gone", self.path),
            ));
        }

        // Report id 0 means the device does not number its reports; the id
        // byte stays out of the transfer then.
        let (id, data) = (buf[0], &buf[1..]);
        let rc = unsafe {
            ffi::IOHIDDeviceSetReport(
                device as ffi::IOHIDDeviceRef,
                report_type,
                id as isize,
                data.as_ptr(),
                data.len() as isize,
            )
        };
        if rc != kIOReturnSuccess {
            return Err(Error::new(
                ErrorKind::Io,
                format!("IOHIDDeviceSetReport() failed on '{}': {:#x}", self.path, rc),
            ));
        }

        Ok(buf.len())
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.set_report(ffi::kIOHIDReportTypeOutput, buf)
    }

    pub(crate) fn send_feature_report(&mut self, buf: &[u8]) -> Result<usize> {
        self.set_report(ffi::kIOHIDReportTypeFeature, buf)
    }
}

impl Drop for HidHandle {
    fn drop(&mut self) {
        let run_loop = self.run_loop.load(Ordering::Acquire);
        if !run_loop.is_null() {
            unsafe {
                CFRunLoopStop(run_loop as CFRunLoopRef);
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        unsafe {
            libc::close(self.wake_read);
            libc::close(self.queue.wake_write);
        }
    }
}
