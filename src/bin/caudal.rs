extern crate caudal;
extern crate chrono;
extern crate fern;
extern crate log;
extern crate signal_hook;

use chrono::Utc;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    let args = caudal::config::parse_args();

    let level = match args.verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    // In some running environments the logger will not initialize, such as
    // under a profiler. Carry on without it rather than dying.
    let _ = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                record.target(),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply();

    let stop = Arc::new(AtomicBool::new(false));

    // First signal starts the graceful drain; a second signal, or a ten
    // second deadline, forces the exit. A clean drain wins the race by
    // exiting the process first.
    let mut signals = Signals::new(&[SIGINT, SIGTERM]).expect("unable to install signal handler");
    {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut pending = signals.forever();
            match pending.next() {
                Some(sig) => {
                    eprintln!("Caught signal {}. Cleaning up...", sig);
                    stop.store(true, Ordering::Relaxed);
                }
                None => return,
            }
            thread::spawn(|| {
                thread::sleep(Duration::from_secs(10));
                eprintln!("Taking too long... Aborting.");
                process::exit(1);
            });
            if pending.next().is_some() {
                eprintln!("Caught second signal... Aborting.");
                process::exit(1);
            }
        });
    }

    process::exit(caudal::run::run(args, stop));
}
