//! Bounded-wait helpers around the embassy-sync primitives
//!
//! Hot-path locks and queue sends always carry a deadline, so a stuck
//! holder degrades one operation (logged, skipped) instead of stalling
//! the whole device.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{with_timeout, Duration};

/// Raw mutex used by every shared structure in the crate
pub type RawMutex = CriticalSectionRawMutex;

/// Lock `mutex`, giving up after `timeout`
pub async fn lock_within<T>(
    mutex: &Mutex<RawMutex, T>,
    timeout: Duration,
) -> Option<MutexGuard<'_, RawMutex, T>> {
    with_timeout(timeout, mutex.lock()).await.ok()
}

/// Queue `msg`, giving up after `timeout`. Returns false if the message was dropped.
pub async fn send_within<T, const N: usize>(
    channel: &Channel<RawMutex, T, N>,
    msg: T,
    timeout: Duration,
) -> bool {
    with_timeout(timeout, channel.send(msg)).await.is_ok()
}
