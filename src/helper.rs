//! Helper utilities for Switchyard
//!
//! This module provides common utility functions used throughout the daemon.

use rand::RngCore;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default relay buffer size per copy direction
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024;

/// Default number of samples kept by a traffic monitor
pub const DEFAULT_WINDOW_SIZE: usize = 10;

/// Default outlet connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Outlet name that means "dial the destination yourself"
pub const DIRECT: &str = "direct";

/// Session ids wrap after this many connections
const MAX_SID: u32 = 0x400;

static SID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a session id such as `http-sid-0x1F`
pub fn next_session_id(prefix: &str) -> String {
    let mut current = SID_COUNTER.load(Ordering::Relaxed);
    loop {
        let next = (current + 1) % (MAX_SID + 1);
        match SID_COUNTER.compare_exchange_weak(
            current,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return format!("{}-sid-{:#X}", prefix, next),
            Err(actual) => current = actual,
        }
    }
}

/// Generate a unique tunnel id from the wall clock and four random bytes
pub fn generate_unique_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut random = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut random);
    format!("{:x}{:08x}", nanos, u32::from_be_bytes(random))
}

/// Format a byte rate for display
pub fn format_speed(speed: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    if speed >= GB {
        format!("{:.2} GB/s", speed / GB)
    } else if speed >= MB {
        format!("{:.2} MB/s", speed / MB)
    } else if speed >= KB {
        format!("{:.2} KB/s", speed / KB)
    } else {
        format!("{:.0} B/s", speed)
    }
}
