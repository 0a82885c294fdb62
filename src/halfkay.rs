//! HalfKay bootloader protocol: fixed-size HID output reports carrying one
//! flash block each, with the target address packed into the header. Three
//! protocol versions share the frame shape and differ in header layout.

use crate::device::Handle;
use crate::error::{allow, Error, ErrorKind, Result};
use crate::firmware::Firmware;
use crate::model::Model;
use crate::system::{adjust_timeout, delay, millis};

/// Writing a frame to this address reboots into the freshly flashed code.
pub(crate) const RESET_ADDRESS: usize = 0xFF_FFFF;

/// The first block triggers a full flash erase, which stalls the bootloader
/// far longer than any later block.
const FIRST_BLOCK_TIMEOUT: i32 = 3000;
const BLOCK_TIMEOUT: i32 = 300;
const RESET_TIMEOUT: i32 = 250;
const RETRY_DELAY: u64 = 10;

/// HalfKay generates STALL if frames arrive too fast (EPIPE on Linux), and
/// the first write needs extra slack for the erase.
const FIRST_BLOCK_DELAY: u64 = 100;
const BLOCK_DELAY: u64 = 10;

/// Builds one frame, report id byte included, for the model's protocol
/// version. `data` may be shorter than the block size (last block) or empty
/// (reset).
pub(crate) fn build_frame(model: &Model, addr: usize, data: &[u8]) -> Vec<u8> {
    assert!(data.len() <= model.block_size);

    match model.halfkay_version {
        1 => {
            let mut buf = vec![0; model.block_size + 3];
            buf[1] = (addr & 255) as u8;
            buf[2] = ((addr >> 8) & 255) as u8;
            buf[3..3 + data.len()].copy_from_slice(data);
            buf
        }
        2 => {
            let mut buf = vec![0; model.block_size + 3];
            buf[1] = ((addr >> 8) & 255) as u8;
            buf[2] = ((addr >> 16) & 255) as u8;
            buf[3..3 + data.len()].copy_from_slice(data);
            buf
        }
        3 => {
            let mut buf = vec![0; model.block_size + 65];
            buf[1] = (addr & 255) as u8;
            buf[2] = ((addr >> 8) & 255) as u8;
            buf[3] = ((addr >> 16) & 255) as u8;
            buf[65..65 + data.len()].copy_from_slice(data);
            buf
        }
        version => unreachable!("unknown HalfKay version {}", version),
    }
}

/// Sends one frame, retrying while the bootloader stalls; gives up once the
/// retry budget is spent.
pub(crate) fn send(
    handle: &mut Handle,
    model: &Model,
    addr: usize,
    data: &[u8],
    timeout: i32,
) -> Result<()> {
    let frame = build_frame(model, addr, data);

    let start = millis();
    loop {
        // Stalls show up as I/O errors; keep them quiet until the budget
        // runs out.
        let r = allow(ErrorKind::Io, || handle.hid_write(&frame));
        match r {
            Ok(_) => return Ok(()),
            Err(err) => {
                if adjust_timeout(timeout, start) == 0 {
                    return Err(Error::new(err.kind(), err.message().to_string()));
                }
                delay(RETRY_DELAY);
            }
        }
    }
}

/// Writes `firmware` block by block. The progress callback sees the byte
/// count written so far, starting at 0 and ending at the image size;
/// returning false aborts the upload.
pub(crate) fn upload(
    handle: &mut Handle,
    model: &Model,
    firmware: &Firmware,
    progress: &mut dyn FnMut(usize) -> bool,
) -> Result<()> {
    if !progress(0) {
        return Ok(());
    }

    let image = firmware.image();
    let mut addr = 0;
    while addr < image.len() {
        let size = model.block_size.min(image.len() - addr);

        let timeout = if addr == 0 {
            FIRST_BLOCK_TIMEOUT
        } else {
            BLOCK_TIMEOUT
        };
        send(handle, model, addr, &image[addr..addr + size], timeout)?;

        delay(if addr == 0 { FIRST_BLOCK_DELAY } else { BLOCK_DELAY });

        if !progress(addr + size) {
            return Ok(());
        }

        addr += model.block_size;
    }

    Ok(())
}

/// One empty frame at the magic address; the board reboots into user code.
pub(crate) fn reset(handle: &mut Handle, model: &Model) -> Result<()> {
    send(handle, model, RESET_ADDRESS, &[], RESET_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock;
    use crate::model::find_model;
    use std::sync::Arc;

    fn open_mock_bootloader(port: &mock::MockPort) -> Handle {
        let dev = Arc::new(mock::bootloader_device("usb-1-2", "0000123", 0x1E, port));
        crate::backend::open_device(&dev).unwrap()
    }

    #[test]
    fn v1_frames_pack_the_address_low_high() {
        let model = find_model("Teensy 2.0").unwrap(); // v1, block 128
        let frame = build_frame(model, 0x1234, &[0xAB; 4]);

        assert_eq!(frame.len(), 128 + 3);
        assert_eq!(frame[0], 0); // report id
        assert_eq!(frame[1], 0x34);
        assert_eq!(frame[2], 0x12);
        assert_eq!(frame[3], 0xAB);
        assert_eq!(frame[7], 0); // padding after the payload
    }

    #[test]
    fn v2_frames_shift_the_address_by_eight() {
        let model = find_model("Teensy++ 2.0").unwrap(); // v2, block 256
        let frame = build_frame(model, 0x1_F600, &[0xCD; 2]);

        assert_eq!(frame.len(), 256 + 3);
        assert_eq!(frame[1], 0xF6);
        assert_eq!(frame[2], 0x01);
        assert_eq!(frame[3], 0xCD);
    }

    #[test]
    fn v3_frames_carry_24_bit_addresses_and_a_64_byte_header() {
        let model = find_model("Teensy 3.1").unwrap(); // v3, block 1024
        let frame = build_frame(model, 0x03_F4_00, &[0xEE; 8]);

        assert_eq!(frame.len(), 1024 + 65);
        assert_eq!(frame[1], 0x00);
        assert_eq!(frame[2], 0xF4);
        assert_eq!(frame[3], 0x03);
        assert_eq!(frame[64], 0);
        assert_eq!(frame[65], 0xEE);
    }

    #[test]
    fn upload_steps_by_block_size_and_reports_progress() {
        let model = find_model("Teensy 3.1").unwrap();
        let port = mock::MockPort::new();
        let mut handle = open_mock_bootloader(&port);

        let firmware = Firmware::new("test.hex", vec![0x5A; 8192]).unwrap();
        let mut seen = Vec::new();
        upload(&mut handle, model, &firmware, &mut |uploaded| {
            seen.push(uploaded);
            true
        })
        .unwrap();

        // Eight 1024-byte frames, progress reported nine times.
        assert_eq!(seen, vec![0, 1024, 2048, 3072, 4096, 5120, 6144, 7168, 8192]);

        let writes = port.state().hid_writes.clone();
        assert_eq!(writes.len(), 8);
        for (i, frame) in writes.iter().enumerate() {
            assert_eq!(frame.len(), 1024 + 65);
            let addr = i * 1024;
            assert_eq!(frame[1] as usize, addr & 255);
            assert_eq!(frame[2] as usize, (addr >> 8) & 255);
            assert_eq!(frame[3] as usize, (addr >> 16) & 255);
        }
    }

    #[test]
    fn upload_pads_the_last_short_block() {
        let model = find_model("Teensy 3.1").unwrap();
        let port = mock::MockPort::new();
        let mut handle = open_mock_bootloader(&port);

        let firmware = Firmware::new("small.hex", vec![0xA5; 100]).unwrap();
        upload(&mut handle, model, &firmware, &mut |_| true).unwrap();

        let writes = port.state().hid_writes.clone();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 1024 + 65);
        assert_eq!(writes[0][65 + 99], 0xA5);
        assert_eq!(writes[0][65 + 100], 0);
    }

    #[test]
    fn send_retries_through_bootloader_stalls() {
        let model = find_model("Teensy 3.1").unwrap();
        let port = mock::MockPort::new();
        let mut handle = open_mock_bootloader(&port);

        port.state().failing_writes = 3;
        send(&mut handle, model, 0, &[0; 16], 1000).unwrap();

        assert_eq!(port.state().hid_writes.len(), 1);
    }

    #[test]
    fn reset_sends_one_empty_frame_to_the_magic_address() {
        let model = find_model("Teensy 3.1").unwrap();
        let port = mock::MockPort::new();
        let mut handle = open_mock_bootloader(&port);

        reset(&mut handle, model).unwrap();

        let writes = port.state().hid_writes.clone();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][1], 0xFF);
        assert_eq!(writes[0][2], 0xFF);
        assert_eq!(writes[0][3], 0xFF);
        assert!(writes[0][65..].iter().all(|&b| b == 0));
    }

    #[test]
    fn aborted_uploads_stop_sending() {
        let model = find_model("Teensy 3.1").unwrap();
        let port = mock::MockPort::new();
        let mut handle = open_mock_bootloader(&port);

        let firmware = Firmware::new("abort.hex", vec![0; 4096]).unwrap();
        upload(&mut handle, model, &firmware, &mut |uploaded| uploaded < 1024).unwrap();

        assert_eq!(port.state().hid_writes.len(), 1);
    }
}
