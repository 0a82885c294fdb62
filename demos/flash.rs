//! Upload example for tyrs: flash a raw firmware image onto the first
//! matching board.
//!
//! Usage: flash <image.bin> [tag]

use std::sync::Arc;

use tyrs::{BoardMonitor, Firmware, Message, TaskStatus, UploadFlags};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: flash <image.bin> [tag]");
        std::process::exit(1);
    };
    let tag = args.next().unwrap_or_default();

    let image = std::fs::read(&path)?;
    let firmware = Arc::new(Firmware::new(path, image)?);

    let monitor = BoardMonitor::new()?;
    let Some(board) = monitor.find_board(&tag) else {
        eprintln!("no board matching '{}'", tag);
        std::process::exit(1);
    };

    println!("uploading to {} at {}", board.tag(), board.location());

    let task = board.upload(vec![firmware], UploadFlags::empty())?;
    task.set_callback(|msg| {
        if let Message::Progress { value, max, .. } = msg {
            if *max > 0 {
                print!("\ruploading... {}%", 100 * value / max);
            }
        }
    });

    task.wait(TaskStatus::Finished, -1)?;
    println!();
    task.outcome().expect("finished task has an outcome")?;

    println!("done");
    Ok(())
}
