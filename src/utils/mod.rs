// Utility functions

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Generate a unique ID using timestamp and random string.
pub fn generate_id() -> String {
    let now = Utc::now().timestamp_millis();
    format!("{}-{}", now, rand_string(8))
}

/// Generate a random alphanumeric string of specified length.
fn rand_string(len: usize) -> String {
    use rand::Rng;
    use std::iter;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();

    iter::repeat_with(|| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .take(len)
        .collect()
}

/// Strictly increasing wall-clock stamp in nanoseconds.
///
/// Record keys built from these stamps sort in creation order for one writer
/// even if the system clock steps backwards.
#[derive(Debug, Default)]
pub struct MonotonicStamp {
    last: AtomicI64,
}

impl MonotonicStamp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stamp, always greater than the previous one
    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Format a stamp as a fixed-width, lexically sortable key prefix
pub fn stamp_key(stamp: i64) -> String {
    format!("{:020}", stamp.max(0))
}
