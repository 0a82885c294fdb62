//! tyrs -- tools for discovering, tracking and driving Teensy boards over
//! HID and USB-CDC serial, from Rust.
//!
//! The heart of the crate is the [BoardMonitor]: it watches the OS for USB
//! interfaces, folds them into logical [Board]s by USB location, and routes
//! serial I/O, reboot, reset and firmware upload to whichever interface
//! currently offers the capability.

pub use backend::{enumerate, find_first, open_device};
pub use board::{
    firmware_guesses, model_test_firmware, Board, BoardEvent, BoardInterface, BoardMonitor,
    BoardState, Capabilities, Capability, MonitorOptions, UploadFlags,
};
pub use device::{
    Device, DeviceFilter, DeviceKind, DeviceMatch, FlowControl, Handle, HidInfo, Parity,
    SerialAttributes,
};
pub use error::{allow, last_error_message, Error, ErrorKind, Result};
pub use firmware::{Firmware, FIRMWARE_MAX_SIZE};
pub use message::{redirect, set_verbosity, LogLevel, Message};
pub use model::{find_model, models, Model};
pub use monitor::{DeviceEvent, Monitor};
pub use task::{default_pool, Pool, Task, TaskStatus};

pub mod backend;
pub mod board;
pub mod device;
pub mod error;
pub mod firmware;
pub mod message;
pub mod model;
pub mod monitor;
pub mod system;
pub mod task;
pub mod timer;

mod halfkay;
mod teensy;
