//! Windows backend: SetupDi enumeration of the HID and serial-port classes,
//! a WM_DEVICECHANGE notification window on a dedicated thread, and
//! overlapped I/O keeping one outstanding read per handle.
//!
//! Vista is the floor: CancelIoEx exists, so closing a handle with an
//! in-flight read needs no recovery thread, and USB locations come from the
//! LocationInformation registry property.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};
use windows_sys::core::GUID;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    CM_Get_DevNode_Registry_PropertyW, CM_Get_Device_IDW, CM_Get_Parent, SetupDiDestroyDeviceInfoList,
    SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW, SetupDiGetDeviceInterfaceDetailW,
    CM_DRP_LOCATION_INFORMATION, CR_SUCCESS, DIGCF_DEVICEINTERFACE, DIGCF_PRESENT,
    SP_DEVICE_INTERFACE_DATA, SP_DEVINFO_DATA,
};
use windows_sys::Win32::Devices::HumanInterfaceDevice::{
    HidD_FreePreparsedData, HidD_GetHidGuid, HidD_GetPreparsedData, HidD_SetFeature,
    HidP_GetCaps, HIDP_CAPS, HIDP_STATUS_SUCCESS,
};
use windows_sys::Win32::Devices::Communication::{
    GetCommState, SetCommState, SetCommTimeouts, COMMTIMEOUTS, DCB, EVENPARITY, MARKPARITY,
    NOPARITY, ODDPARITY, ONESTOPBIT, SPACEPARITY, TWOSTOPBITS,
};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING,
    HANDLE, HWND, INVALID_HANDLE_VALUE, LPARAM, LRESULT, WAIT_OBJECT_0, WAIT_TIMEOUT, WPARAM,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForSingleObject, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
    PostMessageW, RegisterClassExW, RegisterDeviceNotificationW, TranslateMessage,
    UnregisterDeviceNotification, DBT_DEVICEARRIVAL, DBT_DEVICEREMOVECOMPLETE,
    DBT_DEVTYP_DEVICEINTERFACE, DEVICE_NOTIFY_ALL_INTERFACE_CLASSES,
    DEVICE_NOTIFY_WINDOW_HANDLE, DEV_BROADCAST_DEVICEINTERFACE_W, DEV_BROADCAST_HDR,
    GWLP_USERDATA, MSG, WM_CLOSE, WM_DEVICECHANGE, WNDCLASSEXW,
};
#[cfg(target_pointer_width = "64")]
use windows_sys::Win32::UI::WindowsAndMessaging::{GetWindowLongPtrW, SetWindowLongPtrW};
#[cfg(target_pointer_width = "32")]
use windows_sys::Win32::UI::WindowsAndMessaging::{
    GetWindowLongW as GetWindowLongPtrW, SetWindowLongW as SetWindowLongPtrW,
};

use crate::backend::{Backend, HotplugEvent};
use crate::device::{
    Device, DeviceFilter, DeviceKind, FlowControl, Handle, HandleImpl, HidInfo, Parity,
    SerialAttributes,
};
use crate::error::{Error, ErrorKind, Result};
use crate::system::DescriptorSet;

/// Deeper port chains than this are refused rather than guessed at.
const MAX_USB_DEPTH: usize = 8;

const GUID_DEVINTERFACE_COMPORT: GUID = GUID {
    data1: 0x86E0D1E0,
    data2: 0x8089,
    data3: 0x11D0,
    data4: [0x9C, 0xE4, 0x08, 0x00, 0x3E, 0x30, 0x1F, 0x73],
};

const GUID_DEVINTERFACE_USB_HOST_CONTROLLER: GUID = GUID {
    data1: 0x3ABF6F2D,
    data2: 0x71C4,
    data3: 0x462A,
    data4: [0x8A, 0x92, 0x1E, 0x68, 0x61, 0xE6, 0xAF, 0x27],
};

const WINDOW_CLASS_NAME: &[u16] = &[
    b't' as u16,
    b'y' as u16,
    b'r' as u16,
    b's' as u16,
    b'_' as u16,
    b'm' as u16,
    b'o' as u16,
    b'n' as u16,
    b'i' as u16,
    b't' as u16,
    b'o' as u16,
    b'r' as u16,
    0,
];

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn from_wide(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

fn last_error(what: &str) -> Error {
    Error::new(
        ErrorKind::System,
        format!("{} failed: {}", what, std::io::Error::last_os_error()),
    )
}

fn hid_guid() -> GUID {
    let mut guid = unsafe { std::mem::zeroed() };
    unsafe {
        HidD_GetHidGuid(&mut guid);
    }
    guid
}

fn guid_eq(a: &GUID, b: &GUID) -> bool {
    a.data1 == b.data1 && a.data2 == b.data2 && a.data3 == b.data3 && a.data4 == b.data4
}

/// Device instance id for a devnode, e.g. `USB\VID_16C0&PID_0478\1297360`.
fn instance_id(devinst: u32) -> Option<String> {
    let mut buf = [0u16; 512];
    let cr = unsafe { CM_Get_Device_IDW(devinst, buf.as_mut_ptr(), buf.len() as u32, 0) };
    (cr == CR_SUCCESS).then(|| from_wide(&buf))
}

fn devnode_location_information(devinst: u32) -> Option<String> {
    let mut buf = [0u16; 256];
    let mut size = (buf.len() * 2) as u32;
    let cr = unsafe {
        CM_Get_DevNode_Registry_PropertyW(
            devinst,
            CM_DRP_LOCATION_INFORMATION,
            std::ptr::null_mut(),
            buf.as_mut_ptr() as *mut c_void,
            &mut size,
            0,
        )
    };
    (cr == CR_SUCCESS).then(|| from_wide(&buf))
}

/// Pulls the port number out of `Port_#0004.Hub_#0001`.
fn port_from_location_information(info: &str) -> Option<u8> {
    let digits = info.strip_prefix("Port_#")?;
    let digits: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().filter(|&port| port > 0)
}

/// Parses `VID_xxxx`, `PID_xxxx` and `MI_xx` fields out of an instance id.
fn parse_instance_ids(id: &str) -> (Option<u16>, Option<u16>, Option<u8>) {
    let mut vid = None;
    let mut pid = None;
    let mut mi = None;

    for part in id.split(['\\', '&', '#']) {
        if let Some(hex) = part.strip_prefix("VID_") {
            vid = u16::from_str_radix(hex, 16).ok();
        } else if let Some(hex) = part.strip_prefix("PID_") {
            pid = u16::from_str_radix(hex, 16).ok();
        } else if let Some(hex) = part.strip_prefix("MI_") {
            mi = u8::from_str_radix(hex, 16).ok();
        }
    }

    (vid, pid, mi)
}

/// The USB serial number lives in the instance id of the USB device node,
/// as its last segment; composite children carry a bus-generated id with
/// `&` in it instead.
fn serial_from_usb_instance_id(id: &str) -> Option<String> {
    let serial = id.rsplit('\\').next()?;
    (!serial.contains('&') && !serial.is_empty()).then(|| serial.to_string())
}

struct ControllerTable {
    ids: Vec<String>,
}

impl ControllerTable {
    fn populate() -> ControllerTable {
        let mut ids = Vec::new();

        unsafe {
            let set = SetupDiGetClassDevsW(
                &GUID_DEVINTERFACE_USB_HOST_CONTROLLER,
                std::ptr::null(),
                std::ptr::null_mut(),
                DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
            );
            if set == INVALID_HANDLE_VALUE {
                return ControllerTable { ids };
            }

            let mut index = 0;
            loop {
                let mut iface_data: SP_DEVICE_INTERFACE_DATA = std::mem::zeroed();
                iface_data.cbSize = std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;
                if SetupDiEnumDeviceInterfaces(
                    set,
                    std::ptr::null(),
                    &GUID_DEVINTERFACE_USB_HOST_CONTROLLER,
                    index,
                    &mut iface_data,
                ) == 0
                {
                    break;
                }
                index += 1;

                let mut devinfo: SP_DEVINFO_DATA = std::mem::zeroed();
                devinfo.cbSize = std::mem::size_of::<SP_DEVINFO_DATA>() as u32;
                if SetupDiGetDeviceInterfaceDetailW(
                    set,
                    &iface_data,
                    std::ptr::null_mut(),
                    0,
                    std::ptr::null_mut(),
                    &mut devinfo,
                ) == 0
                    && GetLastError() != 122
                {
                    // ERROR_INSUFFICIENT_BUFFER is expected when only the
                    // devinfo is requested.
                    continue;
                }

                if let Some(id) = instance_id(devinfo.DevInst) {
                    ids.push(id);
                }
            }

            SetupDiDestroyDeviceInfoList(set);
        }

        // Stable numbering across runs.
        ids.sort();
        ControllerTable { ids }
    }

    /// Small integer index (1-based) of a host controller; unseen
    /// controllers are appended.
    fn index_of(&mut self, id: &str) -> u8 {
        if let Some(pos) = self.ids.iter().position(|known| known == id) {
            return (pos + 1) as u8;
        }
        self.ids.push(id.to_string());
        self.ids.len() as u8
    }
}

/// Walks the device-instance tree up to the root hub, collecting the port
/// number at each level, and resolves the controller index.
fn resolve_location(devinst: u32, controllers: &mut ControllerTable) -> Option<String> {
    let mut ports: Vec<u8> = Vec::new();
    let mut node = devinst;

    loop {
        let id = instance_id(node)?;
        let upper = id.to_ascii_uppercase();

        if upper.contains("ROOT_HUB") {
            // The root hub's parent is the host controller.
            let mut controller = 0u32;
            if unsafe { CM_Get_Parent(&mut controller, node, 0) } != CR_SUCCESS {
                return None;
            }
            let controller_id = instance_id(controller)?;

            let mut location = format!("usb-{}", controllers.index_of(&controller_id));
            for port in ports.iter().rev() {
                location.push('-');
                location.push_str(&port.to_string());
            }
            return Some(location);
        }

        if upper.starts_with("USB\\") {
            let info = devnode_location_information(node)?;
            let port = port_from_location_information(&info)?;

            if ports.len() >= MAX_USB_DEPTH {
                debug!("USB device tree deeper than {} levels, refusing", MAX_USB_DEPTH);
                return None;
            }
            ports.push(port);
        }

        let mut parent = 0u32;
        if unsafe { CM_Get_Parent(&mut parent, node, 0) } != CR_SUCCESS {
            return None;
        }
        node = parent;
    }
}

/// Finds the USB device node above `devinst` (skipping composite-function
/// children) and returns it with its instance id.
fn usb_device_node(devinst: u32) -> Option<(u32, String)> {
    let mut node = devinst;

    loop {
        let id = instance_id(node)?;
        let upper = id.to_ascii_uppercase();

        if upper.starts_with("USB\\") && !upper.contains("MI_") {
            return Some((node, id));
        }
        if upper.contains("ROOT_HUB") {
            return None;
        }

        let mut parent = 0u32;
        if unsafe { CM_Get_Parent(&mut parent, node, 0) } != CR_SUCCESS {
            return None;
        }
        node = parent;
    }
}

/// Reads the top-level usage page and usage by opening the HID device for
/// attribute access only.
fn read_hid_caps(path: &str) -> Option<(u16, u16)> {
    let wide = to_wide(path);

    unsafe {
        let handle = CreateFileW(
            wide.as_ptr(),
            0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            0,
            std::ptr::null_mut(),
        );
        if handle == INVALID_HANDLE_VALUE {
            return None;
        }

        let mut preparsed: isize = 0;
        let caps = if HidD_GetPreparsedData(handle, &mut preparsed) != 0 {
            let mut caps: HIDP_CAPS = std::mem::zeroed();
            let ok = HidP_GetCaps(preparsed, &mut caps) == HIDP_STATUS_SUCCESS;
            HidD_FreePreparsedData(preparsed);
            ok.then_some((caps.UsagePage, caps.Usage))
        } else {
            None
        };

        CloseHandle(handle);
        caps
    }
}

/// Probes one device interface into a [Device].
fn probe_interface(
    path: &str,
    devinst: u32,
    kind: DeviceKind,
    controllers: &mut ControllerTable,
) -> Option<Device> {
    let id = instance_id(devinst)?;
    let (vid, pid, mi) = parse_instance_ids(&id);
    let (vid, pid) = (vid?, pid?);

    let (usb_node, usb_id) = usb_device_node(devinst)?;
    let serial = serial_from_usb_instance_id(&usb_id);
    let location = resolve_location(usb_node, controllers)?;

    let hid = match kind {
        DeviceKind::Hid => {
            let (usage_page, usage) = read_hid_caps(path).unwrap_or((0, 0));
            Some(HidInfo {
                usage_page,
                usage,
                numbered_reports: false,
            })
        }
        DeviceKind::Serial => None,
    };

    Some(Device::new(
        path.to_ascii_lowercase(),
        location,
        path.to_string(),
        vid,
        pid,
        serial,
        mi.unwrap_or(0),
        kind,
        hid,
    ))
}

fn enumerate_guid(
    guid: &GUID,
    kind: DeviceKind,
    controllers: &mut ControllerTable,
    filter: &DeviceFilter,
    visit: &mut dyn FnMut(Arc<Device>) -> Result<bool>,
) -> Result<bool> {
    unsafe {
        let set = SetupDiGetClassDevsW(
            guid,
            std::ptr::null(),
            std::ptr::null_mut(),
            DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
        );
        if set == INVALID_HANDLE_VALUE {
            return Err(last_error("SetupDiGetClassDevs()"));
        }

        let mut keep_going = true;
        let mut index = 0;
        while keep_going {
            let mut iface_data: SP_DEVICE_INTERFACE_DATA = std::mem::zeroed();
            iface_data.cbSize = std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;
            if SetupDiEnumDeviceInterfaces(set, std::ptr::null(), guid, index, &mut iface_data)
                == 0
            {
                break;
            }
            index += 1;

            // Detail struct with a path buffer spliced on the end.
            let mut detail = vec![0u8; 8 + 1024];
            let detail_ptr = detail.as_mut_ptr() as *mut windows_sys::Win32::Devices::DeviceAndDriverInstallation::SP_DEVICE_INTERFACE_DETAIL_DATA_W;
            (*detail_ptr).cbSize = if cfg!(target_pointer_width = "64") { 8 } else { 6 };

            let mut devinfo: SP_DEVINFO_DATA = std::mem::zeroed();
            devinfo.cbSize = std::mem::size_of::<SP_DEVINFO_DATA>() as u32;

            if SetupDiGetDeviceInterfaceDetailW(
                set,
                &iface_data,
                detail_ptr,
                detail.len() as u32,
                std::ptr::null_mut(),
                &mut devinfo,
            ) == 0
            {
                continue;
            }

            let path_ptr = std::ptr::addr_of!((*detail_ptr).DevicePath) as *const u16;
            let path = from_wide(std::slice::from_raw_parts(path_ptr, 512));

            if let Some(dev) = probe_interface(&path, devinfo.DevInst, kind, controllers) {
                let dev = Arc::new(dev);
                if filter.accepts(&dev) && !visit(dev)? {
                    keep_going = false;
                }
            }
        }

        SetupDiDestroyDeviceInfoList(set);
        Ok(keep_going)
    }
}

//
// Hotplug notification window.
//

struct NotificationQueue {
    pending: Mutex<VecDeque<(bool, DeviceKind, String)>>,
    event: HANDLE,
}

// The HANDLE is an auto-reset event, safe to signal from any thread.
unsafe impl Send for NotificationQueue {}
unsafe impl Sync for NotificationQueue {}

unsafe extern "system" fn window_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if msg == WM_DEVICECHANGE
        && (wparam as u32 == DBT_DEVICEARRIVAL || wparam as u32 == DBT_DEVICEREMOVECOMPLETE)
    {
        let header = lparam as *const DEV_BROADCAST_HDR;
        if !header.is_null() && (*header).dbch_devicetype == DBT_DEVTYP_DEVICEINTERFACE {
            let broadcast = lparam as *const DEV_BROADCAST_DEVICEINTERFACE_W;

            let queue_ptr = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *const NotificationQueue;
            if !queue_ptr.is_null() {
                let queue = &*queue_ptr;

                let name_len = ((*header).dbch_size as usize
                    - std::mem::offset_of!(DEV_BROADCAST_DEVICEINTERFACE_W, dbcc_name))
                    / 2;
                let name = from_wide(std::slice::from_raw_parts(
                    std::ptr::addr_of!((*broadcast).dbcc_name) as *const u16,
                    name_len,
                ));

                let kind = if guid_eq(&(*broadcast).dbcc_classguid, &GUID_DEVINTERFACE_COMPORT) {
                    Some(DeviceKind::Serial)
                } else if guid_eq(&(*broadcast).dbcc_classguid, &hid_guid()) {
                    Some(DeviceKind::Hid)
                } else {
                    None
                };

                if let Some(kind) = kind {
                    queue.pending.lock().unwrap().push_back((
                        wparam as u32 == DBT_DEVICEARRIVAL,
                        kind,
                        name,
                    ));
                    SetEvent(queue.event);
                }
            }
        }
        return 1;
    }

    DefWindowProcW(hwnd, msg, wparam, lparam)
}

/// Message queues are per-thread: this thread owns the message-only window
/// and is the only one that ever sees WM_DEVICECHANGE.
fn monitor_thread(queue: Arc<NotificationQueue>, hwnd_slot: Arc<AtomicIsize>) {
    unsafe {
        let mut class: WNDCLASSEXW = std::mem::zeroed();
        class.cbSize = std::mem::size_of::<WNDCLASSEXW>() as u32;
        class.lpfnWndProc = Some(window_proc);
        class.lpszClassName = WINDOW_CLASS_NAME.as_ptr();
        RegisterClassExW(&class);

        // HWND_MESSAGE parent: a message-only window.
        let hwnd = CreateWindowExW(
            0,
            WINDOW_CLASS_NAME.as_ptr(),
            std::ptr::null(),
            0,
            0,
            0,
            0,
            0,
            -3isize as HWND, // HWND_MESSAGE
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null(),
        );
        if hwnd.is_null() {
            warn!("failed to create the device notification window");
            return;
        }

        SetWindowLongPtrW(hwnd, GWLP_USERDATA, Arc::as_ptr(&queue) as isize);

        let mut broadcast: DEV_BROADCAST_DEVICEINTERFACE_W = std::mem::zeroed();
        broadcast.dbcc_size = std::mem::size_of::<DEV_BROADCAST_DEVICEINTERFACE_W>() as u32;
        broadcast.dbcc_devicetype = DBT_DEVTYP_DEVICEINTERFACE;
        let notification = RegisterDeviceNotificationW(
            hwnd as HANDLE,
            &broadcast as *const _ as *const c_void,
            DEVICE_NOTIFY_WINDOW_HANDLE | DEVICE_NOTIFY_ALL_INTERFACE_CLASSES,
        );

        hwnd_slot.store(hwnd as isize, Ordering::Release);

        let mut msg: MSG = std::mem::zeroed();
        while GetMessageW(&mut msg, hwnd, 0, 0) > 0 {
            if msg.message == WM_CLOSE {
                break;
            }
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }

        hwnd_slot.store(0, Ordering::Release);
        if !notification.is_null() {
            UnregisterDeviceNotification(notification);
        }
        DestroyWindow(hwnd);
    }
}

pub(crate) struct WindowsBackend {
    queue: Arc<NotificationQueue>,
    controllers: ControllerTable,
    hwnd: Arc<AtomicIsize>,
    thread: Option<JoinHandle<()>>,
}

unsafe impl Send for WindowsBackend {}

impl WindowsBackend {
    pub(crate) fn new() -> Result<WindowsBackend> {
        // Auto-reset: one wake-up per drain, like the POSIX pipes.
        let event = unsafe { CreateEventW(std::ptr::null(), 0, 0, std::ptr::null()) };
        if event.is_null() {
            return Err(last_error("CreateEvent()"));
        }

        let queue = Arc::new(NotificationQueue {
            pending: Mutex::new(VecDeque::new()),
            event,
        });

        let hwnd = Arc::new(AtomicIsize::new(0));
        let thread_queue = Arc::clone(&queue);
        let thread_hwnd = Arc::clone(&hwnd);
        let thread = std::thread::Builder::new()
            .name("tyrs-monitor-win".to_string())
            .spawn(move || monitor_thread(thread_queue, thread_hwnd))
            .map_err(Error::from)?;

        Ok(WindowsBackend {
            queue,
            controllers: ControllerTable::populate(),
            hwnd,
            thread: Some(thread),
        })
    }
}

impl Drop for WindowsBackend {
    fn drop(&mut self) {
        let hwnd = self.hwnd.load(Ordering::Acquire);
        if hwnd != 0 {
            unsafe {
                PostMessageW(hwnd as HWND, WM_CLOSE, 0, 0);
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        unsafe {
            CloseHandle(self.queue.event);
        }
    }
}

impl Backend for WindowsBackend {
    fn enumerate(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(Arc<Device>) -> Result<bool>,
    ) -> Result<()> {
        if enumerate_guid(
            &hid_guid(),
            DeviceKind::Hid,
            &mut self.controllers,
            filter,
            visit,
        )? {
            enumerate_guid(
                &GUID_DEVINTERFACE_COMPORT,
                DeviceKind::Serial,
                &mut self.controllers,
                filter,
                visit,
            )?;
        }
        Ok(())
    }

    fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.queue.event, id);
    }

    fn refresh(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(HotplugEvent) -> Result<()>,
    ) -> Result<()> {
        loop {
            let notification = self.queue.pending.lock().unwrap().pop_front();
            let Some((added, kind, path)) = notification else {
                break;
            };

            if !added {
                visit(HotplugEvent::Removed {
                    key: path.to_ascii_lowercase(),
                })?;
                continue;
            }

            // Re-probe the arrived interface through SetupDi.
            let mut found = None;
            let target = path.to_ascii_lowercase();
            let guid = match kind {
                DeviceKind::Hid => hid_guid(),
                DeviceKind::Serial => GUID_DEVINTERFACE_COMPORT,
            };
            enumerate_guid(
                &guid,
                kind,
                &mut self.controllers,
                filter,
                &mut |dev: Arc<Device>| {
                    if dev.key() == target {
                        found = Some(dev);
                        return Ok(false);
                    }
                    Ok(true)
                },
            )?;

            if let Some(dev) = found {
                visit(HotplugEvent::Added(dev))?;
            }
        }

        Ok(())
    }
}

//
// Overlapped I/O handles.
//

/// One outstanding overlapped read, resubmitted immediately after delivery
/// so the event stays pollable.
struct OverlappedReader {
    file: HANDLE,
    event: HANDLE,
    overlapped: Box<OVERLAPPED>,
    buf: Vec<u8>,
    /// Buffered bytes not yet taken by the caller (serial only).
    avail: usize,
    consumed: usize,
    pending: bool,
    restarted: bool,
    path: String,
}

unsafe impl Send for OverlappedReader {}

impl OverlappedReader {
    fn new(file: HANDLE, read_size: usize, path: &str) -> Result<OverlappedReader> {
        // Manual-reset: the poller must be able to see it stay signaled.
        let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if event.is_null() {
            return Err(last_error("CreateEvent()"));
        }

        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { std::mem::zeroed() });
        overlapped.hEvent = event;

        Ok(OverlappedReader {
            file,
            event,
            overlapped,
            buf: vec![0; read_size],
            avail: 0,
            consumed: 0,
            pending: false,
            restarted: false,
            path: path.to_string(),
        })
    }

    fn start(&mut self) -> Result<()> {
        unsafe {
            ResetEvent(self.event);

            let ok = ReadFile(
                self.file,
                self.buf.as_mut_ptr() as *mut c_void,
                self.buf.len() as u32,
                std::ptr::null_mut(),
                &mut *self.overlapped,
            );
            if ok == 0 && GetLastError() != ERROR_IO_PENDING {
                return Err(Error::new(
                    ErrorKind::Io,
                    format!(
                        "I/O error while reading from '{}': {}",
                        self.path,
                        std::io::Error::last_os_error()
                    ),
                ));
            }
        }

        self.pending = true;
        Ok(())
    }

    /// Waits for the outstanding read and returns the completed byte count,
    /// or None on timeout.
    fn finalize(&mut self, timeout: i32) -> Result<Option<usize>> {
        assert!(self.pending);

        let wait = unsafe {
            WaitForSingleObject(self.event, if timeout < 0 { INFINITE } else { timeout as u32 })
        };
        if wait == WAIT_TIMEOUT {
            return Ok(None);
        }
        if wait != WAIT_OBJECT_0 {
            return Err(last_error("WaitForSingleObject()"));
        }

        let mut transferred: u32 = 0;
        let ok = unsafe {
            GetOverlappedResult(self.file, &mut *self.overlapped, &mut transferred, 0)
        };
        self.pending = false;

        if ok == 0 {
            return Err(Error::new(
                ErrorKind::Io,
                format!(
                    "I/O error while reading from '{}': {}",
                    self.path,
                    std::io::Error::last_os_error()
                ),
            ));
        }

        self.restarted = false;
        Ok(Some(transferred as usize))
    }
}

impl Drop for OverlappedReader {
    fn drop(&mut self) {
        unsafe {
            if self.pending {
                CancelIoEx(self.file, &mut *self.overlapped);
                let mut transferred: u32 = 0;
                GetOverlappedResult(self.file, &mut *self.overlapped, &mut transferred, 1);
            }
            CloseHandle(self.event);
        }
    }
}

fn overlapped_write(file: HANDLE, buf: &[u8], path: &str) -> Result<usize> {
    unsafe {
        let event = CreateEventW(std::ptr::null(), 1, 0, std::ptr::null());
        if event.is_null() {
            return Err(last_error("CreateEvent()"));
        }

        let mut overlapped: OVERLAPPED = std::mem::zeroed();
        overlapped.hEvent = event;

        let ok = WriteFile(
            file,
            buf.as_ptr() as *const c_void,
            buf.len() as u32,
            std::ptr::null_mut(),
            &mut overlapped,
        );
        if ok == 0 && GetLastError() != ERROR_IO_PENDING {
            let err = std::io::Error::last_os_error();
            CloseHandle(event);
            return Err(Error::new(
                ErrorKind::Io,
                format!("I/O error while writing to '{}': {}", path, err),
            ));
        }

        let mut transferred: u32 = 0;
        let ok = GetOverlappedResult(file, &mut overlapped, &mut transferred, 1);
        CloseHandle(event);

        if ok == 0 {
            return Err(Error::new(
                ErrorKind::Io,
                format!(
                    "I/O error while writing to '{}': {}",
                    path,
                    std::io::Error::last_os_error()
                ),
            ));
        }

        Ok(transferred as usize)
    }
}

fn open_overlapped(path: &str) -> Result<HANDLE> {
    let wide = to_wide(path);

    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            0x8000_0000 | 0x4000_0000, // GENERIC_READ | GENERIC_WRITE
            0,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
            std::ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        let err = unsafe { GetLastError() };
        return Err(match err {
            ERROR_ACCESS_DENIED => Error::new(
                ErrorKind::Access,
                format!("Permission denied for device '{}'", path),
            ),
            ERROR_FILE_NOT_FOUND => {
                Error::new(ErrorKind::NotFound, format!("Device '{}' not found", path))
            }
            _ => Error::new(
                ErrorKind::System,
                format!(
                    "CreateFile('{}') failed: {}",
                    path,
                    std::io::Error::last_os_error()
                ),
            ),
        });
    }

    Ok(handle)
}

/// An open serial port. Stream-oriented: short caller buffers consume from
/// the internal read buffer and leave the rest for the next call.
#[derive(Debug)]
pub(crate) struct SerialHandle {
    file: HANDLE,
    reader: OverlappedReader,
    path: String,
}

unsafe impl Send for SerialHandle {}

impl std::fmt::Debug for OverlappedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlappedReader")
            .field("pending", &self.pending)
            .finish()
    }
}

impl SerialHandle {
    pub(crate) fn open(dev: &Arc<Device>) -> Result<Handle> {
        let file = open_overlapped(dev.path())?;

        // Overlapped semantics want reads to complete as soon as any data
        // is there.
        unsafe {
            let timeouts = COMMTIMEOUTS {
                ReadIntervalTimeout: u32::MAX,
                ReadTotalTimeoutMultiplier: u32::MAX,
                ReadTotalTimeoutConstant: u32::MAX - 1,
                WriteTotalTimeoutMultiplier: 0,
                WriteTotalTimeoutConstant: 5000,
            };
            SetCommTimeouts(file, &timeouts);
        }

        let mut reader = OverlappedReader::new(file, 8192, dev.path())?;
        reader.start()?;

        Ok(Handle {
            dev: Arc::clone(dev),
            imp: HandleImpl::WindowsSerial(SerialHandle {
                file,
                reader,
                path: dev.path().to_string(),
            }),
        })
    }

    pub(crate) fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.reader.event, id);
    }

    pub(crate) fn set_attributes(&mut self, attrs: &SerialAttributes) -> Result<()> {
        unsafe {
            let mut dcb: DCB = std::mem::zeroed();
            dcb.DCBlength = std::mem::size_of::<DCB>() as u32;
            if GetCommState(self.file, &mut dcb) == 0 {
                return Err(last_error("GetCommState()"));
            }

            dcb.BaudRate = attrs.baud;
            dcb.ByteSize = match attrs.data_bits {
                5..=8 => attrs.data_bits,
                n => {
                    return Err(Error::new(
                        ErrorKind::Param,
                        format!("Invalid serial data size {}", n),
                    ))
                }
            };
            dcb.Parity = match attrs.parity {
                Parity::None => NOPARITY,
                Parity::Even => EVENPARITY,
                Parity::Odd => ODDPARITY,
                Parity::Mark => MARKPARITY,
                Parity::Space => SPACEPARITY,
            } as u8;
            dcb.StopBits = match attrs.stop_bits {
                1 => ONESTOPBIT,
                2 => TWOSTOPBITS,
                n => {
                    return Err(Error::new(
                        ErrorKind::Param,
                        format!("Invalid serial stop bit count {}", n),
                    ))
                }
            } as u8;

            // Bitfield flags live in a packed dword on DCB; windows-sys
            // exposes it as `_bitfield`.
            const FBINARY: u32 = 1 << 0;
            const FPARITY: u32 = 1 << 1;
            const FOUTXCTSFLOW: u32 = 1 << 2;
            const FDTRCONTROL_ENABLE: u32 = 1 << 4;
            const FOUTX: u32 = 1 << 8;
            const FINX: u32 = 1 << 9;
            const FRTSCONTROL_ENABLE: u32 = 1 << 12;
            const FRTSCONTROL_HANDSHAKE: u32 = 2 << 12;

            let mut flags = FBINARY | FDTRCONTROL_ENABLE;
            if attrs.parity != Parity::None {
                flags |= FPARITY;
            }
            match attrs.flow {
                FlowControl::None => flags |= FRTSCONTROL_ENABLE,
                FlowControl::XonXoff => flags |= FOUTX | FINX | FRTSCONTROL_ENABLE,
                FlowControl::RtsCts => flags |= FOUTXCTSFLOW | FRTSCONTROL_HANDSHAKE,
            }
            dcb._bitfield = flags;

            if SetCommState(self.file, &dcb) == 0 {
                return Err(Error::new(
                    ErrorKind::System,
                    format!(
                        "Unable to change serial port settings: {}",
                        std::io::Error::last_os_error()
                    ),
                ));
            }
        }

        Ok(())
    }

    pub(crate) fn read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize> {
        assert!(!buf.is_empty());

        // Serve buffered bytes first.
        if self.reader.consumed < self.reader.avail {
            let n = (self.reader.avail - self.reader.consumed).min(buf.len());
            buf[..n]
                .copy_from_slice(&self.reader.buf[self.reader.consumed..self.reader.consumed + n]);
            self.reader.consumed += n;

            // A new read is started only once the buffer is fully drained.
            if self.reader.consumed == self.reader.avail {
                self.reader.avail = 0;
                self.reader.consumed = 0;
                self.reader.start()?;
            }
            return Ok(n);
        }

        if !self.reader.pending {
            self.reader.start()?;
        }

        let transferred = match self.reader.finalize(timeout) {
            Ok(Some(transferred)) => transferred,
            Ok(None) => return Ok(0),
            Err(err) => {
                // A transient failure gets one silent restart before the
                // caller hears about it.
                if !self.reader.restarted {
                    self.reader.restarted = true;
                    self.reader.start()?;
                    return Ok(0);
                }
                return Err(err);
            }
        };

        self.reader.avail = transferred;
        self.reader.consumed = 0;

        let n = transferred.min(buf.len());
        buf[..n].copy_from_slice(&self.reader.buf[..n]);
        self.reader.consumed = n;

        if self.reader.consumed == self.reader.avail {
            self.reader.avail = 0;
            self.reader.consumed = 0;
            self.reader.start()?;
        }

        Ok(n)
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<usize> {
        overlapped_write(self.file, buf, &self.path)
    }
}

impl Drop for SerialHandle {
    fn drop(&mut self) {
        unsafe {
            CancelIoEx(self.file, std::ptr::null_mut());
        }
        // The reader waits out its cancelled overlapped read first.
        let _ = &self.reader;
        unsafe {
            CloseHandle(self.file);
        }
    }
}

/// An open HID device. Message-oriented: each read delivers one report and
/// discards any bytes the caller's buffer cannot take.
#[derive(Debug)]
pub(crate) struct HidHandle {
    file: HANDLE,
    reader: OverlappedReader,
    path: String,
}

unsafe impl Send for HidHandle {}

impl HidHandle {
    pub(crate) fn open(dev: &Arc<Device>) -> Result<Handle> {
        let file = open_overlapped(dev.path())?;

        // Size the report buffer from the device's input report length.
        let report_len = unsafe {
            let mut preparsed: isize = 0;
            let mut len = 4096usize;
            if HidD_GetPreparsedData(file, &mut preparsed) != 0 {
                let mut caps: HIDP_CAPS = std::mem::zeroed();
                if HidP_GetCaps(preparsed, &mut caps) == HIDP_STATUS_SUCCESS
                    && caps.InputReportByteLength > 0
                {
                    len = caps.InputReportByteLength as usize;
                }
                HidD_FreePreparsedData(preparsed);
            }
            len
        };

        let mut reader = OverlappedReader::new(file, report_len, dev.path())?;
        reader.start()?;

        Ok(Handle {
            dev: Arc::clone(dev),
            imp: HandleImpl::WindowsHid(HidHandle {
                file,
                reader,
                path: dev.path().to_string(),
            }),
        })
    }

    pub(crate) fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.reader.event, id);
    }

    pub(crate) fn read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize> {
        assert!(!buf.is_empty());

        if !self.reader.pending {
            self.reader.start()?;
        }

        let transferred = match self.reader.finalize(timeout)? {
            Some(transferred) => transferred,
            None => return Ok(0),
        };

        // Message semantics: surplus bytes are discarded.
        let n = transferred.min(buf.len());
        buf[..n].copy_from_slice(&self.reader.buf[..n]);

        self.reader.start()?;
        Ok(n)
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Ok(0);
        }
        overlapped_write(self.file, buf, &self.path)
    }

    pub(crate) fn send_feature_report(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Ok(0);
        }

        let ok = unsafe { HidD_SetFeature(self.file, buf.as_ptr() as *const c_void, buf.len() as u32) };
        if ok == 0 {
            return Err(Error::new(
                ErrorKind::Io,
                format!(
                    "I/O error while writing to '{}': {}",
                    self.path,
                    std::io::Error::last_os_error()
                ),
            ));
        }

        Ok(buf.len())
    }
}

impl Drop for HidHandle {
    fn drop(&mut self) {
        unsafe {
            CancelIoEx(self.file, std::ptr::null_mut());
        }
        let _ = &self.reader;
        unsafe {
            CloseHandle(self.file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_come_out_of_location_information() {
        assert_eq!(
            port_from_location_information("Port_#0004.Hub_#0001"),
            Some(4)
        );
        assert_eq!(
            port_from_location_information("Port_#0012.Hub_#0003"),
            Some(12)
        );

        // Port 0 means "no port"; anything unnumbered is useless to us.
        assert_eq!(port_from_location_information("Port_#0000.Hub_#0001"), None);
        assert_eq!(port_from_location_information("on USB bus"), None);
        assert_eq!(port_from_location_information(""), None);
    }

    #[test]
    fn instance_ids_yield_vid_pid_and_interface() {
        assert_eq!(
            parse_instance_ids("USB\\VID_16C0&PID_0478&MI_00\\6&2D44C5B5&0&0000"),
            (Some(0x16C0), Some(0x478), Some(0))
        );
        assert_eq!(
            parse_instance_ids("HID\\VID_16C0&PID_0486&MI_01\\8&1A2B3C4D&0&0000"),
            (Some(0x16C0), Some(0x486), Some(1))
        );

        // Non-composite devices carry no MI_ segment.
        assert_eq!(
            parse_instance_ids("USB\\VID_16C0&PID_0478\\1297360"),
            (Some(0x16C0), Some(0x478), None)
        );
        assert_eq!(parse_instance_ids("ROOT\\SYSTEM\\0000"), (None, None, None));
    }

    #[test]
    fn serial_numbers_come_from_the_usb_device_instance_id() {
        assert_eq!(
            serial_from_usb_instance_id("USB\\VID_16C0&PID_0478\\1297360").as_deref(),
            Some("1297360")
        );

        // Bus-generated ids (no real serial) contain '&'.
        assert_eq!(
            serial_from_usb_instance_id("USB\\VID_16C0&PID_0483\\6&2D44C5B5&0&2"),
            None
        );
        assert_eq!(serial_from_usb_instance_id(""), None);
    }

    #[test]
    fn guids_compare_field_by_field() {
        let mut other = GUID_DEVINTERFACE_COMPORT;
        assert!(guid_eq(&other, &GUID_DEVINTERFACE_COMPORT));

        other.data4[7] ^= 1;
        assert!(!guid_eq(&other, &GUID_DEVINTERFACE_COMPORT));
    }

    #[test]
    fn wide_strings_round_trip() {
        let wide = to_wide("COM7");
        assert_eq!(wide.last(), Some(&0));
        assert_eq!(from_wide(&wide), "COM7");

        // from_wide stops at the first NUL, like the APIs that fill these
        // buffers.
        let mut padded = to_wide("\\\\.\\COM12");
        padded.extend_from_slice(&[0, 0, 0]);
        assert_eq!(from_wide(&padded), "\\\\.\\COM12");
    }
}
