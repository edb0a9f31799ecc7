use std::{error::Error, thread, time::Duration};

use clap::Parser;
use jailwatch::{Args, Monitor};
use log::info;
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const TICK: Duration = Duration::from_millis(100);
const PANE_LINES: usize = 200;

fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let args = Args::parse();
    info!("{args:?}");

    let mut monitor = Monitor::new(args)?;

    // Headless consumer of the query surface: pump the engine at 10 Hz and
    // stream the events pane to stdout.
    let mut printed: u64 = 0;
    loop {
        monitor.tick();
        let total = monitor.events_total();
        if total != printed {
            let fresh = (total - printed).min(PANE_LINES as u64) as usize;
            let lines = monitor.get_events_lines(PANE_LINES);
            for line in lines.iter().skip(lines.len().saturating_sub(fresh)) {
                println!("{line}");
            }
            printed = total;
        }
        thread::sleep(TICK);
    }
}
