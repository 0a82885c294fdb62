//! Enumeration example for tyrs: list every Teensy board, then watch for
//! changes until interrupted.

use tyrs::{BoardEvent, BoardMonitor, Capability};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // The monitor enumerates on construction; everything after that comes
    // in through refresh.
    let monitor = BoardMonitor::new()?;

    for board in monitor.list_boards() {
        println!(
            "{} at {} ({}){}",
            board.tag(),
            board.location(),
            board.model().name(),
            if board.has_capability(Capability::Upload) {
                " [bootloader]"
            } else {
                ""
            }
        );
    }

    monitor.register_callback(|board, event| {
        let what = match event {
            BoardEvent::Added => "added",
            BoardEvent::Changed => "changed",
            BoardEvent::Disappeared => "disappeared",
            BoardEvent::Dropped => "dropped",
        };
        println!("{} {} at {}", what, board.tag(), board.location());
    });

    // Pump the monitor forever; hotplug events show up as they happen.
    loop {
        let mut set = tyrs::system::DescriptorSet::new();
        monitor.descriptors(&mut set, 1);
        tyrs::system::poll(&set, -1)?;

        monitor.refresh()?;
    }
}
