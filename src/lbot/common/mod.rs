mod errors;
mod filter;

pub use self::errors::{Error, ErrorKind, Result};
pub use self::filter::{hash_topic_name, Filter};

/// Wait for an atomic counter to reach `required`, parking the calling
/// thread between checks instead of spinning. Mirrors
/// `utils::waitUntil` from the original implementation, built on
/// Rust's stable `Atomic*::wait`/`notify_*` (stabilized for exactly this
/// futex-style wait/wake pattern).
pub fn wait_until_zero(value: &std::sync::atomic::AtomicUsize) {
    use std::sync::atomic::Ordering::Acquire;
    loop {
        let current = value.load(Acquire);
        if current == 0 {
            return;
        }
        value.wait(current);
    }
}
