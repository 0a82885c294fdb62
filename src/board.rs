//! Logical boards: aggregation of USB interfaces by location, the board
//! state machine, capability routing, and the upload/reset/reboot tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use log::warn;

#[cfg(test)]
use crate::backend::Backend;
use crate::device::{Device, DeviceFilter, Handle, SerialAttributes};
use crate::error::{allow, Error, ErrorKind, Result};
use crate::firmware::Firmware;
use crate::message::{self, LogLevel};
use crate::model::Model;
use crate::monitor::{DeviceEvent, Monitor};
use crate::system::{self, adjust_timeout, delay, millis, DescriptorSet};
use crate::task::{cond_wait, Task, TaskStatus};
use crate::timer::{Timer, TimerMode};

/// How long a Missing board may stay unplugged before it is dropped.
const DROP_BOARD_DELAY: i32 = 15000;
/// How long to wait for a reboot we triggered before asking for the button.
const MANUAL_REBOOT_DELAY: i32 = 5000;
/// Settle time after a reset, so USB re-enumeration can finish before the
/// task returns.
const RESET_SETTLE_DELAY: u64 = 600;

bitflags::bitflags! {
    /// What a board (or one of its interfaces) can do right now.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        const IDENTIFY = 1 << 0;
        const UPLOAD = 1 << 1;
        const RESET = 1 << 2;
        const SERIAL = 1 << 3;
        const REBOOT = 1 << 4;
    }
}

/// One capability bit, usable as an index into the capability map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Capability {
    Identify = 0,
    Upload,
    Reset,
    Serial,
    Reboot,
}

pub(crate) const CAPABILITY_COUNT: usize = 5;

impl Capability {
    pub(crate) const ALL: [Capability; CAPABILITY_COUNT] = [
        Capability::Identify,
        Capability::Upload,
        Capability::Reset,
        Capability::Serial,
        Capability::Reboot,
    ];

    pub fn mask(self) -> Capabilities {
        Capabilities::from_bits_truncate(1 << self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::Identify => "identify",
            Capability::Upload => "upload",
            Capability::Reset => "reset",
            Capability::Serial => "serial",
            Capability::Reboot => "reboot",
        }
    }
}

/// Lifecycle of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardState {
    /// Gone for good; terminal.
    Dropped,
    /// All interfaces vanished; the board has a grace period to come back.
    Missing,
    Online,
}

/// What observers are told about a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent {
    /// First sighting; emitted exactly once per board.
    Added,
    /// Capabilities, model or identity details changed in place.
    Changed,
    /// Transient: the board went Missing.
    Disappeared,
    /// Terminal: the board was removed from the table.
    Dropped,
}

bitflags::bitflags! {
    /// Tuning for the upload task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UploadFlags: u32 {
        /// Wait for the user to press the button instead of rebooting.
        const WAIT = 1;
        /// Skip the firmware/model compatibility check.
        const NOCHECK = 2;
        /// Leave the board in the bootloader after the transfer.
        const NORESET = 4;
    }
}

/// Options fixed at monitor construction.
#[derive(Debug, Clone, Default)]
pub struct MonitorOptions {
    /// Drive refresh from a background thread and let waiters block on a
    /// condition variable, instead of having the caller pump the monitor.
    pub parallel_wait: bool,
    /// Allow upload/reset on experimental (AVR-era) models.
    pub experimental: bool,
}

/// How one family performs capabilities on one of its interfaces.
pub(crate) trait InterfaceDriver: Send + Sync {
    fn serial_set_attributes(&self, iface: &BoardInterface, attrs: &SerialAttributes)
        -> Result<()>;
    fn serial_read(&self, iface: &BoardInterface, buf: &mut [u8], timeout: i32) -> Result<usize>;
    fn serial_write(&self, iface: &BoardInterface, buf: &[u8]) -> Result<usize>;
    fn upload(
        &self,
        iface: &BoardInterface,
        firmware: &Firmware,
        progress: &mut dyn FnMut(usize) -> bool,
    ) -> Result<()>;
    fn reset(&self, iface: &BoardInterface) -> Result<()>;
    fn reboot(&self, iface: &BoardInterface) -> Result<()>;
}

/// A board family: recognizes its interfaces and knows its models.
pub(crate) trait BoardFamily: Send + Sync {
    fn name(&self) -> &'static str;
    fn models(&self) -> &'static [&'static Model];

    /// Inspects a freshly announced interface. `Ok(None)` means "not one of
    /// mine"; errors mean the device looked right but could not be probed.
    fn open_interface(
        &self,
        dev: &Arc<Device>,
        options: &MonitorOptions,
    ) -> Result<Option<BoardInterface>>;

    /// Models this firmware image appears to be built for.
    fn guess_models(&self, firmware: &Firmware) -> Vec<&'static Model>;
}

/// Every family the engine recognizes.
pub(crate) static FAMILIES: [&dyn BoardFamily; 1] = [&crate::teensy::TeensyFamily];

/// Models across all families that `firmware` appears to be built for.
pub fn firmware_guesses(firmware: &Firmware) -> Vec<&'static Model> {
    FAMILIES
        .iter()
        .flat_map(|family| family.guess_models(firmware))
        .collect()
}

/// True when `firmware` looks compatible with `model`.
pub fn model_test_firmware(model: &'static Model, firmware: &Firmware) -> bool {
    firmware_guesses(firmware)
        .iter()
        .any(|guess| std::ptr::eq(*guess, model))
}

/// One USB interface attached to a board, with its family-derived fields and
/// an open handle.
pub struct BoardInterface {
    dev: Arc<Device>,
    handle: Mutex<Handle>,
    desc: &'static str,
    model: &'static Model,
    serial: u64,
    capabilities: Capabilities,
    driver: &'static dyn InterfaceDriver,
    experimental_allowed: bool,

    /// Never extends the board's lifetime: once the board is dropped, any
    /// outstanding reference observes None and operations return Mode.
    pub(crate) family: Option<&'static dyn BoardFamily>,
    board: Mutex<Weak<Board>>,
}

impl BoardInterface {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        dev: Arc<Device>,
        handle: Handle,
        desc: &'static str,
        model: &'static Model,
        serial: u64,
        capabilities: Capabilities,
        driver: &'static dyn InterfaceDriver,
        experimental_allowed: bool,
    ) -> BoardInterface {
        BoardInterface {
            dev,
            handle: Mutex::new(handle),
            desc,
            model,
            serial,
            capabilities,
            driver,
            experimental_allowed,
            family: None,
            board: Mutex::new(Weak::new()),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// Human description of the interface role, e.g. "HalfKay Bootloader".
    pub fn desc(&self) -> &'static str {
        self.desc
    }

    pub fn model(&self) -> &'static Model {
        self.model
    }

    pub fn serial_number(&self) -> u64 {
        self.serial
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn path(&self) -> &str {
        self.dev.path()
    }

    pub fn interface_number(&self) -> u8 {
        self.dev.interface_number()
    }

    pub(crate) fn experimental_allowed(&self) -> bool {
        self.experimental_allowed
    }

    pub(crate) fn driver(&self) -> &'static dyn InterfaceDriver {
        self.driver
    }

    /// Serializes I/O on the interface's handle.
    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(&mut Handle) -> R) -> R {
        f(&mut self.handle.lock().unwrap())
    }
}

impl std::fmt::Debug for BoardInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardInterface")
            .field("desc", &self.desc)
            .field("path", &self.dev.path())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

struct BoardInner {
    state: BoardState,
    tag: String,
    vid: u16,
    pid: u16,
    serial: u64,
    model: &'static Model,
    interfaces: Vec<Arc<BoardInterface>>,
    cap_to_iface: [Option<Arc<BoardInterface>>; CAPABILITY_COUNT],
    capabilities: Capabilities,
    missing_since: u64,
    current_task: Option<Weak<crate::task::TaskShared>>,
}

/// A logical board: every interface sharing one USB location, treated as a
/// single manageable target whose capabilities follow its current USB mode.
pub struct Board {
    monitor: Weak<MonitorShared>,
    /// Handed to waits and task bodies; never keeps the board alive on its
    /// own.
    self_weak: Weak<Board>,
    location: String,
    family: &'static dyn BoardFamily,
    inner: Mutex<BoardInner>,
}

impl Board {
    fn new(
        monitor: &Arc<MonitorShared>,
        dev: &Device,
        iface: &BoardInterface,
        family: &'static dyn BoardFamily,
    ) -> Arc<Board> {
        Arc::new_cyclic(|self_weak| Board {
            monitor: Arc::downgrade(monitor),
            self_weak: self_weak.clone(),
            location: dev.location().to_string(),
            family,
            inner: Mutex::new(BoardInner {
                state: BoardState::Online,
                tag: format!("{}-{}", iface.serial, family.name()),
                vid: dev.vid(),
                pid: dev.pid(),
                serial: iface.serial,
                model: iface.model,
                interfaces: Vec::new(),
                cap_to_iface: Default::default(),
                capabilities: Capabilities::empty(),
                missing_since: 0,
                current_task: None,
            }),
        })
    }

    fn arc(&self) -> Arc<Board> {
        self.self_weak
            .upgrade()
            .expect("board is behind an Arc for its whole life")
    }

    /// USB location; this is the board's identity.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// User-facing identifier, `<serial>-<family>`.
    pub fn tag(&self) -> String {
        self.inner.lock().unwrap().tag.clone()
    }

    pub fn state(&self) -> BoardState {
        self.inner.lock().unwrap().state
    }

    pub fn vid(&self) -> u16 {
        self.inner.lock().unwrap().vid
    }

    pub fn pid(&self) -> u16 {
        self.inner.lock().unwrap().pid
    }

    pub fn serial_number(&self) -> u64 {
        self.inner.lock().unwrap().serial
    }

    pub fn model(&self) -> &'static Model {
        self.inner.lock().unwrap().model
    }

    pub fn family_name(&self) -> &'static str {
        self.family.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.lock().unwrap().capabilities
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(capability.mask())
    }

    /// The interfaces currently attached, in arrival order.
    pub fn interfaces(&self) -> Vec<Arc<BoardInterface>> {
        self.inner.lock().unwrap().interfaces.clone()
    }

    /// The interface currently preferred for `capability`, if any.
    pub fn interface_for(&self, capability: Capability) -> Option<Arc<BoardInterface>> {
        self.inner.lock().unwrap().cap_to_iface[capability as usize].clone()
    }

    pub(crate) fn missing_since(&self) -> u64 {
        self.inner.lock().unwrap().missing_since
    }

    fn require_interface(
        &self,
        capability: Capability,
        error: &str,
    ) -> Result<Arc<BoardInterface>> {
        self.interface_for(capability)
            .ok_or_else(|| Error::new(ErrorKind::Mode, error))
    }

    /// Matches the board against `[<serial>][-<family>][@<location>]`.
    ///
    /// An empty id matches anything. The location part compares against the
    /// board's location (case-insensitively on Windows) or against any
    /// interface path, seeing through filesystem aliases on POSIX.
    pub fn matches_tag(&self, id: &str) -> bool {
        if id.is_empty() {
            return true;
        }

        let (head, location) = match id.split_once('@') {
            Some((head, location)) => (head, Some(location)),
            None => (id, None),
        };

        let digits_end = head
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(head.len());
        let serial: u64 = head[..digits_end].parse().unwrap_or(0);

        let family = match head[digits_end..].strip_prefix('-') {
            Some(family) => family,
            None if head[digits_end..].is_empty() => "",
            None => {
                let _ = Error::new(
                    ErrorKind::Param,
                    format!(
                        "Incorrect board tag '{}', use [<serial>][-<family>][@<location>]",
                        id
                    ),
                );
                return false;
            }
        };

        if serial != 0 && serial != self.serial_number() {
            return false;
        }
        if !family.is_empty() && family != self.family.name() {
            return false;
        }

        if let Some(location) = location {
            if location.is_empty() {
                return false;
            }

            let same_location = if cfg!(windows) {
                self.location.eq_ignore_ascii_case(location)
            } else {
                self.location == location
            };
            if !same_location
                && !self
                    .interfaces()
                    .iter()
                    .any(|iface| system::paths_are_same_node(iface.path(), location))
            {
                return false;
            }
        }

        true
    }

    pub fn serial_set_attributes(&self, attrs: &SerialAttributes) -> Result<()> {
        let iface = self.require_interface(
            Capability::Serial,
            "Serial transfer is not available in this mode",
        )?;
        iface.driver().serial_set_attributes(&iface, attrs)
    }

    /// Reads from the board's serial side. Returns 0 on timeout.
    pub fn serial_read(&self, buf: &mut [u8], timeout: i32) -> Result<usize> {
        let iface = self.require_interface(
            Capability::Serial,
            "Serial transfer is not available in this mode",
        )?;
        iface.driver().serial_read(&iface, buf, timeout)
    }

    pub fn serial_write(&self, buf: &[u8]) -> Result<usize> {
        let iface = self.require_interface(
            Capability::Serial,
            "Serial transfer is not available in this mode",
        )?;
        iface.driver().serial_write(&iface, buf)
    }

    /// Uploads synchronously through the bootloader interface. Most callers
    /// want the [upload](Self::upload) task instead.
    pub fn upload_now(
        &self,
        firmware: &Firmware,
        progress: &mut dyn FnMut(usize) -> bool,
    ) -> Result<()> {
        let iface = self.require_interface(
            Capability::Upload,
            "Firmware upload is not available in this mode",
        )?;

        let model = self.model();
        if firmware.size() > model.code_size() {
            return Err(Error::new(
                ErrorKind::Range,
                format!("Firmware is too big for {}", model.name()),
            ));
        }

        iface.driver().upload(&iface, firmware, progress)
    }

    /// Sends the bootloader reset frame.
    pub fn reset_now(&self) -> Result<()> {
        let iface = self.require_interface(Capability::Reset, "Cannot reset in this mode")?;
        iface.driver().reset(&iface)
    }

    /// Asks the running firmware to reboot into the bootloader.
    pub fn reboot_now(&self) -> Result<()> {
        let iface = self.require_interface(Capability::Reboot, "Cannot reboot in this mode")?;
        iface.driver().reboot(&iface)
    }

    /// Blocks until the board offers `capability`, it is dropped, or the
    /// timeout expires. Returns false on timeout.
    pub fn wait_for(&self, capability: Capability, timeout: i32) -> Result<bool> {
        let Some(shared) = self.monitor.upgrade() else {
            return Err(Error::new(ErrorKind::NotFound, "Board has disappeared"));
        };

        let board = self.arc();
        MonitorShared::wait(&shared, timeout, &mut move || {
            if board.state() == BoardState::Dropped {
                return Err(Error::new(ErrorKind::NotFound, "Board has disappeared"));
            }
            Ok(board.has_capability(capability))
        })
    }

    fn new_task(
        &self,
        name: &str,
        body: impl FnOnce(&Task) -> Result<()> + Send + 'static,
    ) -> Result<Task> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(weak) = &inner.current_task {
            if let Some(task) = Task::upgrade(weak) {
                if task.status() != TaskStatus::Finished {
                    return Err(Error::new(
                        ErrorKind::Busy,
                        format!("A task is already running for board '{}'", inner.tag),
                    ));
                }
            }
        }

        let task = Task::new(name, body);
        inner.current_task = Some(task.downgrade());
        Ok(task)
    }

    /// The task currently attached to this board, if it has not finished.
    pub fn current_task(&self) -> Option<Task> {
        let inner = self.inner.lock().unwrap();
        inner
            .current_task
            .as_ref()
            .and_then(Task::upgrade)
            .filter(|task| task.status() != TaskStatus::Finished)
    }

    /// Creates the full upload task: reboot into the bootloader if needed,
    /// wait for it, pick a compatible image, transfer, reset.
    ///
    /// The returned task is ready but not started.
    pub fn upload(&self, firmwares: Vec<Arc<Firmware>>, flags: UploadFlags) -> Result<Task> {
        if firmwares.is_empty() {
            return Err(Error::new(
                ErrorKind::Param,
                "Upload task needs at least one firmware",
            ));
        }

        let board = self.arc();
        self.new_task("upload", move |task| {
            run_upload(task, &board, &firmwares, flags)
        })
    }

    /// Creates the reset task (reboot first when the bootloader is not
    /// already up). The returned task is ready but not started.
    pub fn reset(&self) -> Result<Task> {
        let board = self.arc();
        self.new_task("reset", move |_| run_reset(&board))
    }

    /// Creates the reboot task. The returned task is ready but not started.
    pub fn reboot(&self) -> Result<Task> {
        let board = self.arc();
        self.new_task("reboot", move |_| run_reboot(&board))
    }
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("tag", &self.tag())
            .field("location", &self.location)
            .field("state", &self.state())
            .finish()
    }
}

/// Picks the firmware to flash, or explains why none fits.
fn compatible_firmware(board: &Board, firmwares: &[Arc<Firmware>]) -> Result<Arc<Firmware>> {
    let model = board.model();

    if firmwares.len() > 1 {
        for firmware in firmwares {
            if model_test_firmware(model, firmware) {
                return Ok(Arc::clone(firmware));
            }
        }

        return Err(Error::new(
            ErrorKind::Firmware,
            format!(
                "No firmware is compatible with '{}' ({})",
                board.tag(),
                model.name()
            ),
        ));
    }

    let guesses = firmware_guesses(&firmwares[0]);
    if guesses.iter().any(|guess| std::ptr::eq(*guess, model)) {
        return Ok(Arc::clone(&firmwares[0]));
    }

    if guesses.is_empty() {
        Err(Error::new(
            ErrorKind::Firmware,
            format!("This firmware is not compatible with '{}'", board.tag()),
        ))
    } else {
        let mut names = String::new();
        for (i, guess) in guesses.iter().enumerate() {
            if i > 0 {
                names.push_str(if i + 1 < guesses.len() { ", " } else { " and " });
            }
            names.push_str(guess.name());
        }

        Err(Error::new(
            ErrorKind::Firmware,
            format!("This firmware is only compatible with {}", names),
        ))
    }
}

fn run_upload(
    task: &Task,
    board: &Arc<Board>,
    firmwares: &[Arc<Firmware>],
    mut flags: UploadFlags,
) -> Result<()> {
    let mut firmware = if flags.contains(UploadFlags::NOCHECK) {
        Some(Arc::clone(&firmwares[0]))
    } else if board.model().is_real() {
        Some(compatible_firmware(board, firmwares)?)
    } else {
        // Identify the board once it shows up in bootloader mode.
        None
    };

    // Can't upload directly; reboot the board or wait for the button.
    if !board.has_capability(Capability::Upload) {
        if flags.contains(UploadFlags::WAIT) {
            message::log(
                LogLevel::Info,
                "Waiting for device (press button to reboot)...",
            );
        } else {
            message::log(LogLevel::Info, "Triggering board reboot");
            board.reboot_now()?;
        }
    }

    loop {
        let timeout = if flags.contains(UploadFlags::WAIT) {
            -1
        } else {
            MANUAL_REBOOT_DELAY
        };
        if board.wait_for(Capability::Upload, timeout)? {
            break;
        }

        message::log(LogLevel::Info, "Reboot didn't work, press button manually");
        flags |= UploadFlags::WAIT;
    }

    let firmware = match firmware.take() {
        Some(firmware) => firmware,
        None => compatible_firmware(board, firmwares)?,
    };

    message::log(LogLevel::Info, format!("Firmware: {}", firmware.name()));
    let size = firmware.size();
    let code_size = board.model().code_size();
    if code_size > 0 {
        message::log(
            LogLevel::Info,
            format!(
                "Flash usage: {} kiB ({:.1}%)",
                (size + 1023) / 1024,
                size as f64 / code_size as f64 * 100.0
            ),
        );
    }

    board.upload_now(&firmware, &mut |uploaded| {
        message::progress("Uploading", uploaded as u64, size as u64);
        true
    })?;

    if !flags.contains(UploadFlags::NORESET) {
        message::log(LogLevel::Info, "Sending reset command");
        board.reset_now()?;
        delay(RESET_SETTLE_DELAY);
    } else {
        message::log(LogLevel::Info, "Firmware uploaded, reset the board to use it");
    }

    task.set_result(firmware);
    Ok(())
}

fn run_reset(board: &Arc<Board>) -> Result<()> {
    if !board.has_capability(Capability::Reset) {
        message::log(LogLevel::Info, "Triggering board reboot");
        board.reboot_now()?;

        if !board.wait_for(Capability::Reset, MANUAL_REBOOT_DELAY)? {
            return Err(Error::new(
                ErrorKind::Timeout,
                "Reboot does not seem to work",
            ));
        }
    }

    message::log(LogLevel::Info, "Sending reset command");
    board.reset_now()?;

    delay(RESET_SETTLE_DELAY);
    Ok(())
}

fn run_reboot(board: &Arc<Board>) -> Result<()> {
    message::log(LogLevel::Info, "Triggering board reboot");
    board.reboot_now()?;

    delay(RESET_SETTLE_DELAY);
    Ok(())
}

/// Routes a fresh device through the family list.
fn open_board_interface(
    dev: &Arc<Device>,
    options: &MonitorOptions,
) -> Result<Option<BoardInterface>> {
    for family in FAMILIES.iter() {
        let r = allow(ErrorKind::NotFound, || family.open_interface(dev, options));
        match r {
            Ok(Some(mut iface)) => {
                iface.family = Some(*family);
                return Ok(Some(iface));
            }
            Ok(None) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(None)
}

type BoardCallback = Box<dyn FnMut(&Arc<Board>, BoardEvent) + Send>;

struct Callbacks {
    next_id: usize,
    entries: Vec<(usize, BoardCallback)>,
}

struct SyncState {
    monitor: Monitor,
    timer: Timer,
    enumerated: bool,
    boards: Vec<Arc<Board>>,
    /// Missing boards in the order they went missing; the head decides the
    /// timer deadline.
    missing: Vec<Arc<Board>>,
    /// Device key → attached interface, for O(1) removal routing.
    interfaces: HashMap<String, Arc<BoardInterface>>,
}

struct MonitorShared {
    options: MonitorOptions,
    sync: Mutex<SyncState>,
    /// Refresh generation; bumped (and broadcast) after every refresh so
    /// parallel-mode waiters can re-check their predicates.
    wait_generation: Mutex<u64>,
    wait_cond: std::sync::Condvar,
    callbacks: Mutex<Callbacks>,
    stop: AtomicBool,
}

/// The board aggregator: watches the device monitor and maintains the table
/// of logical boards.
///
/// Observers registered with [register_callback](Self::register_callback)
/// see every board event in the same order. Callbacks run with the monitor's
/// internal lock held and must not call back into the monitor.
pub struct BoardMonitor {
    shared: Arc<MonitorShared>,
    refresh_thread: Option<JoinHandle<()>>,
}

impl BoardMonitor {
    /// A monitor over this platform's USB backend, caller-pumped.
    pub fn new() -> Result<BoardMonitor> {
        BoardMonitor::with_options(MonitorOptions::default())
    }

    pub fn with_options(options: MonitorOptions) -> Result<BoardMonitor> {
        let monitor = Monitor::new(DeviceFilter::new())?;
        BoardMonitor::assemble(monitor, options)
    }

    #[cfg(test)]
    pub(crate) fn with_backend(
        backend: Box<dyn Backend>,
        options: MonitorOptions,
    ) -> Result<BoardMonitor> {
        let monitor = Monitor::with_backend(backend, DeviceFilter::new())?;
        BoardMonitor::assemble(monitor, options)
    }

    fn assemble(monitor: Monitor, options: MonitorOptions) -> Result<BoardMonitor> {
        let shared = Arc::new(MonitorShared {
            options,
            sync: Mutex::new(SyncState {
                monitor,
                timer: Timer::new()?,
                enumerated: false,
                boards: Vec::new(),
                missing: Vec::new(),
                interfaces: HashMap::new(),
            }),
            wait_generation: Mutex::new(0),
            wait_cond: std::sync::Condvar::new(),
            callbacks: Mutex::new(Callbacks {
                next_id: 0,
                entries: Vec::new(),
            }),
            stop: AtomicBool::new(false),
        });

        // Bring the table up before anyone looks at it.
        MonitorShared::refresh(&shared)?;

        let refresh_thread = if shared.options.parallel_wait {
            let thread_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("tyrs-monitor".to_string())
                .spawn(move || refresh_thread(thread_shared))
                .map_err(Error::from)?;
            Some(handle)
        } else {
            None
        };

        Ok(BoardMonitor {
            shared,
            refresh_thread,
        })
    }

    pub fn options(&self) -> &MonitorOptions {
        &self.shared.options
    }

    /// Registers the monitor's wake-up descriptors (hotplug + timer).
    pub fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        let sync = self.shared.sync.lock().unwrap();
        sync.monitor.descriptors(set, id);
        sync.timer.descriptors(&mut *set, id);
    }

    /// Drains hotplug events and expires missing boards, delivering board
    /// events to observers. Serial-mode clients call this from their event
    /// loop whenever the monitor's descriptors wake up.
    pub fn refresh(&self) -> Result<()> {
        MonitorShared::refresh(&self.shared)
    }

    /// Blocks until `pred` returns true, or the timeout elapses.
    pub fn wait(&self, mut pred: impl FnMut() -> Result<bool>, timeout: i32) -> Result<bool> {
        MonitorShared::wait(&self.shared, timeout, &mut pred)
    }

    /// Every tracked board (Online and Missing), in discovery order.
    pub fn list_boards(&self) -> Vec<Arc<Board>> {
        self.shared.sync.lock().unwrap().boards.clone()
    }

    /// The first board matching `tag` (see [Board::matches_tag]).
    pub fn find_board(&self, tag: &str) -> Option<Arc<Board>> {
        self.list_boards()
            .into_iter()
            .find(|board| board.matches_tag(tag))
    }

    /// Registers a board-event observer; returns an id for
    /// [deregister_callback](Self::deregister_callback).
    pub fn register_callback(
        &self,
        f: impl FnMut(&Arc<Board>, BoardEvent) + Send + 'static,
    ) -> usize {
        let mut callbacks = self.shared.callbacks.lock().unwrap();
        let id = callbacks.next_id;
        callbacks.next_id += 1;
        callbacks.entries.push((id, Box::new(f)));
        id
    }

    pub fn deregister_callback(&self, id: usize) {
        let mut callbacks = self.shared.callbacks.lock().unwrap();
        callbacks.entries.retain(|(entry_id, _)| *entry_id != id);
    }
}

impl Drop for BoardMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_thread.take() {
            self.shared.stop.store(true, Ordering::Release);
            let _ = handle.join();
        }
    }
}

fn refresh_thread(shared: Arc<MonitorShared>) {
    let set = {
        let sync = shared.sync.lock().unwrap();
        let mut set = DescriptorSet::new();
        sync.monitor.descriptors(&mut set, 1);
        sync.timer.descriptors(&mut set, 1);
        set
    };

    while !shared.stop.load(Ordering::Acquire) {
        // Bounded poll so a stop request is noticed promptly.
        match system::poll(&set, 500) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(err) => {
                warn!("board monitor poll failed: {}", err);
                break;
            }
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = MonitorShared::refresh(&shared) {
            warn!("board monitor refresh failed: {}", err);
        }
    }
}

type Events = Vec<(Arc<Board>, BoardEvent)>;

impl MonitorShared {
    fn refresh(shared: &Arc<MonitorShared>) -> Result<()> {
        let mut events: Events = Vec::new();

        let mut sync = shared.sync.lock().unwrap();
        let r = Self::refresh_locked(shared, &mut sync, &mut events);

        // Deliver even when the refresh failed half-way: observers must see
        // whatever actually happened, in order.
        shared.fire(&events);
        drop(sync);

        {
            let mut generation = shared.wait_generation.lock().unwrap();
            *generation += 1;
            shared.wait_cond.notify_all();
        }

        r
    }

    fn refresh_locked(
        shared: &Arc<MonitorShared>,
        sync: &mut SyncState,
        events: &mut Events,
    ) -> Result<()> {
        if sync.timer.rearm() > 0 {
            // Drop every board that exhausted its grace period; rearm for
            // the next one in line, if any.
            while let Some(board) = sync.missing.first().cloned() {
                let timeout = adjust_timeout(DROP_BOARD_DELAY, board.missing_since());
                if timeout > 0 {
                    sync.timer.set(timeout, TimerMode::Oneshot)?;
                    break;
                }

                Self::drop_board(sync, &board, events);
            }
        }

        if !sync.enumerated {
            sync.enumerated = true;

            for dev in sync.monitor.list() {
                Self::add_interface(shared, sync, dev, events)?;
            }
            return Ok(());
        }

        let mut device_events = Vec::new();
        sync.monitor.refresh(&mut |dev, event| {
            device_events.push((Arc::clone(dev), event));
            Ok(())
        })?;

        for (dev, event) in device_events {
            match event {
                DeviceEvent::Added => Self::add_interface(shared, sync, dev, events)?,
                DeviceEvent::Removed => Self::remove_interface(sync, dev.key(), events),
            }
        }

        Ok(())
    }

    fn fire(&self, events: &Events) {
        if events.is_empty() {
            return;
        }

        let mut callbacks = self.callbacks.lock().unwrap();
        for (board, event) in events {
            for (_, callback) in callbacks.entries.iter_mut() {
                callback(board, *event);
            }
        }
    }

    fn find_board(sync: &SyncState, location: &str) -> Option<Arc<Board>> {
        sync.boards
            .iter()
            .find(|board| board.location() == location)
            .cloned()
    }

    fn add_interface(
        shared: &Arc<MonitorShared>,
        sync: &mut SyncState,
        dev: Arc<Device>,
        events: &mut Events,
    ) -> Result<()> {
        if sync.interfaces.contains_key(dev.key()) {
            return Ok(());
        }

        let iface = match open_board_interface(&dev, &shared.options) {
            Ok(Some(iface)) => Arc::new(iface),
            Ok(None) => return Ok(()),
            // The interface vanished again, or we lack permission; neither
            // should poison the whole refresh.
            Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::Access) => {
                return Ok(())
            }
            Err(err) => return Err(err),
        };
        let family = iface.family.expect("opened interface carries its family");

        let mut board = Self::find_board(sync, dev.location());

        /* Maybe the notifications came in the wrong order, or a removal was
           dropped somewhere and we never saw it, so use heuristics to
           improve board change detection. */
        if let Some(existing) = board.clone() {
            let (incompatible, identity_changed) = {
                let inner = existing.inner.lock().unwrap();
                (
                    (iface.model.is_real()
                        && inner.model.is_real()
                        && !std::ptr::eq(iface.model, inner.model))
                        || iface.serial != inner.serial,
                    inner.vid != dev.vid() || inner.pid != dev.pid(),
                )
            };

            if incompatible {
                Self::teardown_board(sync, &existing, events);
                board = None;
            } else if identity_changed {
                let was_online = existing.state() == BoardState::Online;
                if was_online {
                    Self::close_board(sync, &existing, events);
                }

                let mut inner = existing.inner.lock().unwrap();
                inner.vid = dev.vid();
                inner.pid = dev.pid();
            }
        }

        let (board, event) = match board {
            Some(board) => {
                {
                    let mut inner = board.inner.lock().unwrap();
                    if iface.model.is_real() {
                        inner.model = iface.model;
                    }
                    if iface.serial != 0 {
                        inner.serial = iface.serial;
                    }
                    inner.tag = format!("{}-{}", inner.serial, family.name());
                }
                (board, BoardEvent::Changed)
            }
            None => {
                let board = Board::new(shared, &dev, &iface, family);
                sync.boards.push(Arc::clone(&board));
                (board, BoardEvent::Added)
            }
        };

        *iface.board.lock().unwrap() = Arc::downgrade(&board);

        {
            let mut inner = board.inner.lock().unwrap();
            inner.interfaces.push(Arc::clone(&iface));

            for capability in Capability::ALL {
                if iface.capabilities.contains(capability.mask()) {
                    inner.cap_to_iface[capability as usize] = Some(Arc::clone(&iface));
                }
            }
            inner.capabilities |= iface.capabilities;
            inner.state = BoardState::Online;
        }

        sync.interfaces.insert(dev.key().to_string(), iface);
        sync.missing.retain(|missing| !Arc::ptr_eq(missing, &board));

        events.push((board, event));
        Ok(())
    }

    fn remove_interface(sync: &mut SyncState, key: &str, events: &mut Events) {
        let Some(iface) = sync.interfaces.remove(key) else {
            return;
        };
        let Some(board) = iface.board.lock().unwrap().upgrade() else {
            return;
        };

        let emptied = {
            let mut inner = board.inner.lock().unwrap();
            inner
                .interfaces
                .retain(|attached| !Arc::ptr_eq(attached, &iface));
            Self::rebuild_capabilities(&mut inner);
            inner.interfaces.is_empty()
        };

        if emptied {
            {
                let mut inner = board.inner.lock().unwrap();
                inner.state = BoardState::Missing;
                inner.missing_since = millis();
            }
            events.push((Arc::clone(&board), BoardEvent::Disappeared));

            sync.missing.push(Arc::clone(&board));

            // Other boards may be in line already; the timer follows the
            // oldest one.
            if let Some(first) = sync.missing.first() {
                let timeout = adjust_timeout(DROP_BOARD_DELAY, first.missing_since()).max(1);
                if let Err(err) = sync.timer.set(timeout, TimerMode::Oneshot) {
                    warn!("failed to arm the drop timer: {}", err);
                }
            }
        } else {
            events.push((board, BoardEvent::Changed));
        }
    }

    /// Rebuilds the capability map from the interface list, preserving
    /// insertion order so the last interface offering a bit wins.
    fn rebuild_capabilities(inner: &mut BoardInner) {
        inner.cap_to_iface = Default::default();
        inner.capabilities = Capabilities::empty();

        for iface in &inner.interfaces {
            for capability in Capability::ALL {
                if iface.capabilities.contains(capability.mask()) {
                    inner.cap_to_iface[capability as usize] = Some(Arc::clone(iface));
                }
            }
            inner.capabilities |= iface.capabilities;
        }
    }

    /// Strips a board that is still Online (identity change): interfaces are
    /// detached and observers see Disappeared, but the board keeps its slot.
    fn close_board(sync: &mut SyncState, board: &Arc<Board>, events: &mut Events) {
        {
            let mut inner = board.inner.lock().unwrap();
            inner.state = BoardState::Missing;

            for iface in inner.interfaces.drain(..) {
                sync.interfaces.remove(iface.dev.key());
            }
            inner.cap_to_iface = Default::default();
            inner.capabilities = Capabilities::empty();
        }

        events.push((Arc::clone(board), BoardEvent::Disappeared));
    }

    /// Removes an incompatible board atomically: interfaces detached, no
    /// Disappeared, straight to the terminal event.
    fn teardown_board(sync: &mut SyncState, board: &Arc<Board>, events: &mut Events) {
        {
            let mut inner = board.inner.lock().unwrap();
            for iface in inner.interfaces.drain(..) {
                sync.interfaces.remove(iface.dev.key());
            }
            inner.cap_to_iface = Default::default();
            inner.capabilities = Capabilities::empty();
        }

        Self::drop_board(sync, board, events);
    }

    fn drop_board(sync: &mut SyncState, board: &Arc<Board>, events: &mut Events) {
        board.inner.lock().unwrap().state = BoardState::Dropped;

        sync.missing.retain(|missing| !Arc::ptr_eq(missing, board));
        sync.boards.retain(|tracked| !Arc::ptr_eq(tracked, board));

        events.push((Arc::clone(board), BoardEvent::Dropped));
    }

    fn wait(
        shared: &Arc<MonitorShared>,
        timeout: i32,
        pred: &mut dyn FnMut() -> Result<bool>,
    ) -> Result<bool> {
        let start = millis();

        if shared.options.parallel_wait {
            let mut generation = shared.wait_generation.lock().unwrap();
            loop {
                if pred()? {
                    return Ok(true);
                }

                let remaining = adjust_timeout(timeout, start);
                if timeout >= 0 && remaining == 0 {
                    return Ok(false);
                }

                let (guard, _) = cond_wait(generation, &shared.wait_cond, remaining);
                generation = guard;
            }
        } else {
            let set = {
                let sync = shared.sync.lock().unwrap();
                let mut set = DescriptorSet::new();
                sync.monitor.descriptors(&mut set, 1);
                sync.timer.descriptors(&mut set, 1);
                set
            };

            loop {
                Self::refresh(shared)?;
                if pred()? {
                    return Ok(true);
                }

                if system::poll(&set, adjust_timeout(timeout, start))? == 0 {
                    return Ok(false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock;
    use crate::message::Message;

    fn monitor_over(bus: &mock::MockBus) -> BoardMonitor {
        BoardMonitor::with_backend(bus.backend(), MonitorOptions::default()).unwrap()
    }

    fn record_events(monitor: &BoardMonitor) -> Arc<Mutex<Vec<(String, BoardEvent)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        monitor.register_callback(move |board, event| {
            sink.lock().unwrap().push((board.location().to_string(), event));
        });
        events
    }

    #[test]
    fn enumerate_then_hotplug() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port));

        let monitor = monitor_over(&bus);
        let boards = monitor.list_boards();
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].location(), "usb-1-2");
        assert_eq!(boards[0].model().name(), "Teensy 3.1");
        assert!(boards[0].has_capability(Capability::Upload));
        assert!(boards[0].has_capability(Capability::Reset));
        assert!(!boards[0].has_capability(Capability::Serial));

        // A second identical board on another port is one new Added event.
        let events = record_events(&monitor);
        let port2 = mock::MockPort::new();
        bus.plug(mock::bootloader_device("usb-1-3", "0000124", 0x1E, &port2));
        monitor.refresh().unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![("usb-1-3".to_string(), BoardEvent::Added)]
        );
        assert_eq!(monitor.list_boards().len(), 2);
    }

    #[test]
    fn refresh_without_changes_emits_nothing() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::serial_device("usb-1-2", "4242", &port));

        let monitor = monitor_over(&bus);
        let events = record_events(&monitor);

        monitor.refresh().unwrap();
        monitor.refresh().unwrap();
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn mode_switch_preserves_identity() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        let dev = bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port));

        let monitor = monitor_over(&bus);
        let events = record_events(&monitor);
        let board = monitor.list_boards().remove(0);
        assert_eq!(board.tag(), "2910-Teensy");
        assert_eq!(board.serial_number(), 2910);

        // The board resets and re-enumerates as CDC serial.
        bus.unplug(dev.key());
        monitor.refresh().unwrap();
        assert_eq!(board.state(), BoardState::Missing);
        assert!(board.missing_since() > 0);

        let port2 = mock::MockPort::new();
        bus.plug(mock::serial_device("usb-1-2", "2910", &port2));
        monitor.refresh().unwrap();

        assert_eq!(board.state(), BoardState::Online);
        assert_eq!(board.tag(), "2910-Teensy");
        assert!(board.has_capability(Capability::Serial));
        assert!(board.has_capability(Capability::Reboot));
        assert!(!board.has_capability(Capability::Upload));
        // The model survives from the bootloader sighting.
        assert_eq!(board.model().name(), "Teensy 3.1");

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ("usb-1-2".to_string(), BoardEvent::Disappeared),
                ("usb-1-2".to_string(), BoardEvent::Changed),
            ]
        );
        assert_eq!(monitor.list_boards().len(), 1);
    }

    #[test]
    fn drop_on_prolonged_absence() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        let dev = bus.plug(mock::serial_device("usb-1-2", "4242", &port));

        let monitor = monitor_over(&bus);
        let events = record_events(&monitor);
        let board = monitor.list_boards().remove(0);

        bus.unplug(dev.key());
        monitor.refresh().unwrap();
        assert_eq!(board.state(), BoardState::Missing);

        // Backdate the disappearance so the grace period has fully elapsed,
        // then let the (rearmed, short) timer fire.
        board.inner.lock().unwrap().missing_since = millis().saturating_sub(16000);
        monitor
            .shared
            .sync
            .lock()
            .unwrap()
            .timer
            .set(1, TimerMode::Oneshot)
            .unwrap();
        delay(20);
        monitor.refresh().unwrap();

        assert_eq!(board.state(), BoardState::Dropped);
        assert!(monitor.list_boards().is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ("usb-1-2".to_string(), BoardEvent::Disappeared),
                ("usb-1-2".to_string(), BoardEvent::Dropped),
            ]
        );

        // Dropped is terminal: every operation now reports the wrong mode.
        let err = board.serial_write(b"hi").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mode);
    }

    #[test]
    fn missing_board_survives_within_grace_period() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        let dev = bus.plug(mock::serial_device("usb-1-2", "4242", &port));

        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        bus.unplug(dev.key());
        monitor.refresh().unwrap();

        // The timer fires while the board is still within its grace period;
        // nothing must be dropped and the timer must be rearmed.
        monitor
            .shared
            .sync
            .lock()
            .unwrap()
            .timer
            .set(1, TimerMode::Oneshot)
            .unwrap();
        delay(20);
        monitor.refresh().unwrap();

        assert_eq!(board.state(), BoardState::Missing);
        assert_eq!(monitor.list_boards().len(), 1);
    }

    #[test]
    fn incompatible_reenumeration_replaces_the_board() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port));

        let monitor = monitor_over(&bus);
        let events = record_events(&monitor);
        let old_board = monitor.list_boards().remove(0);

        // A different serial shows up at the same location without a
        // removal ever reaching us.
        let port2 = mock::MockPort::new();
        bus.plug(mock::bootloader_device("usb-1-2", "0000999", 0x1E, &port2));
        monitor.refresh().unwrap();

        assert_eq!(old_board.state(), BoardState::Dropped);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ("usb-1-2".to_string(), BoardEvent::Dropped),
                ("usb-1-2".to_string(), BoardEvent::Added),
            ]
        );

        let boards = monitor.list_boards();
        assert_eq!(boards.len(), 1);
        assert!(!Arc::ptr_eq(&boards[0], &old_board));
        assert_eq!(boards[0].serial_number(), 0x999 * 10);
    }

    #[test]
    fn capability_map_follows_the_interface_list() {
        let bus = mock::MockBus::new();
        let cdc_port = mock::MockPort::new();
        let seremu_port = mock::MockPort::new();

        bus.plug(mock::serial_device("usb-1-2", "4242", &cdc_port));
        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        // Same product id: both interfaces belong to one composite device.
        let mut seremu_dev = mock::seremu_device("usb-1-2", "4242", &seremu_port);
        seremu_dev.pid = board.pid();
        let seremu = bus.plug(seremu_dev);
        monitor.refresh().unwrap();

        // Both interfaces belong to the one board; capabilities are the
        // union, and the capability map points at the latest provider.
        assert_eq!(board.interfaces().len(), 2);
        assert_eq!(
            board.capabilities(),
            Capabilities::SERIAL | Capabilities::REBOOT
        );
        let serial_iface = board.interface_for(Capability::Serial).unwrap();
        assert_eq!(serial_iface.desc(), "Seremu");

        // Removing the preferred interface falls back to the survivor.
        bus.unplug(seremu.key());
        monitor.refresh().unwrap();

        assert_eq!(board.state(), BoardState::Online);
        let serial_iface = board.interface_for(Capability::Serial).unwrap();
        assert_eq!(serial_iface.desc(), "Serial");
    }

    #[test]
    fn upload_task_flashes_and_resets() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port));

        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        // Embed the Teensy 3.1 reset vector so the compatibility check
        // recognizes the image.
        let mut image = vec![0u8; 8192];
        let signature = crate::model::find_model("Teensy 3.1").unwrap().signature;
        image[0..8].copy_from_slice(&signature);
        let firmware = Arc::new(Firmware::new("blink.hex", image).unwrap());

        let task = board.upload(vec![firmware], UploadFlags::empty()).unwrap();

        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);
        task.set_callback(move |msg| {
            if let Message::Progress { value, .. } = msg {
                sink.lock().unwrap().push(*value);
            }
        });

        assert!(task.wait(TaskStatus::Finished, -1).unwrap());
        task.outcome().unwrap().unwrap();

        // Eight 1024-byte frames plus the reset frame.
        let writes = port.state().hid_writes.clone();
        assert_eq!(writes.len(), 9);
        let reset_frame = writes.last().unwrap();
        assert_eq!(&reset_frame[1..4], &[0xFF, 0xFF, 0xFF]);

        assert_eq!(
            *progress.lock().unwrap(),
            vec![0, 1024, 2048, 3072, 4096, 5120, 6144, 7168, 8192]
        );

        // The chosen firmware is the task's result.
        let chosen: Arc<Firmware> = task.take_result().unwrap();
        assert_eq!(chosen.name(), "blink.hex");
    }

    #[test]
    fn firmware_exactly_filling_the_flash_fits() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        // Teensy LC: code size 63488, block size 512.
        bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x20, &port));

        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        let firmware = Firmware::new("full.hex", vec![0xFF; 63488]).unwrap();
        board.upload_now(&firmware, &mut |_| true).unwrap();
        assert_eq!(port.state().hid_writes.len(), 63488 / 512);
    }

    #[test]
    fn firmware_too_big_is_rejected_before_any_write() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port));

        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        let firmware = Firmware::new("big.hex", vec![0; 262144 + 1]).unwrap();
        let err = board.upload_now(&firmware, &mut |_| true).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Range);
        assert!(port.state().hid_writes.is_empty());
    }

    #[test]
    fn wait_for_a_capability_that_never_comes_times_out() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::serial_device("usb-1-2", "4242", &port));

        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        let start = millis();
        assert!(!board.wait_for(Capability::Upload, 200).unwrap());
        assert!(millis() - start >= 200);
    }

    #[test]
    fn wait_for_sees_the_bootloader_appear() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        let dev = bus.plug(mock::serial_device("usb-1-2", "2910", &port));

        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        let plug_bus = bus.clone();
        let plugger = std::thread::spawn(move || {
            delay(50);
            plug_bus.unplug(dev.key());
            let port2 = mock::MockPort::new();
            plug_bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port2));
        });

        assert!(board.wait_for(Capability::Upload, 2000).unwrap());
        plugger.join().unwrap();
    }

    #[test]
    fn parallel_mode_waits_on_the_background_refresh() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::serial_device("usb-1-2", "2910", &port));

        let monitor = BoardMonitor::with_backend(
            bus.backend(),
            MonitorOptions {
                parallel_wait: true,
                ..Default::default()
            },
        )
        .unwrap();
        let board = monitor.list_boards().remove(0);

        let port2 = mock::MockPort::new();
        bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port2));

        assert!(board.wait_for(Capability::Upload, 3000).unwrap());
    }

    #[test]
    fn one_task_per_board_at_a_time() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::bootloader_device("usb-1-2", "0000123", 0x1E, &port));

        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        let _pending = board.reset().unwrap();
        let err = board.reboot().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn tag_matching_grammar() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::serial_device("usb-1-2", "4242", &port));

        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        assert!(board.matches_tag(""));
        assert!(board.matches_tag("4242"));
        assert!(board.matches_tag("4242-Teensy"));
        assert!(board.matches_tag("@usb-1-2"));
        assert!(board.matches_tag("4242@usb-1-2"));

        assert!(!board.matches_tag("17"));
        assert!(!board.matches_tag("4242-Arduino"));
        assert!(!board.matches_tag("@usb-9-9"));
        assert!(!board.matches_tag("4242@usb-9-9"));
        assert!(!board.matches_tag("12x5"));

        assert!(monitor.find_board("4242-Teensy").is_some());
        assert!(monitor.find_board("17").is_none());
    }

    #[test]
    fn serial_io_routes_through_the_preferred_interface() {
        let bus = mock::MockBus::new();
        let port = mock::MockPort::new();
        bus.plug(mock::serial_device("usb-1-2", "4242", &port));

        let monitor = monitor_over(&bus);
        let board = monitor.list_boards().remove(0);

        board.serial_write(b"ping\n").unwrap();
        assert_eq!(port.state().serial_writes, b"ping\n");

        port.push_read(b"pong\n");
        let mut buf = [0u8; 16];
        let r = board.serial_read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..r], b"pong\n");

        board
            .serial_set_attributes(&SerialAttributes::rate(9600))
            .unwrap();
        assert_eq!(port.state().attr_history.last().unwrap().baud, 9600);
    }
}
