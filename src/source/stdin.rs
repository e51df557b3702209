//! Standard input as a line source. None of the rotation or checkpoint
//! machinery applies; we read until EOF or until asked to stop.

use std::io;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use util;
use util::LineSnd;

pub fn run(chan: LineSnd, stop: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let locked = stdin.lock();
    for line in locked.lines() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match line {
            Ok(l) => {
                if !util::send(&chan, l.trim().to_string()) {
                    break;
                }
            }
            Err(e) => {
                debug!("stdin closed: {}", e);
                break;
            }
        }
    }
}
