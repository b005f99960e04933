//! Panic hook that reports through `tracing`.
//!
//! Worker tasks run on the tokio runtime, so a panicking lane only surfaces as
//! a `JoinError` in the orchestrator. The hook makes sure the location and
//! message land in the structured log as well.

use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{error, warn};

static PANIC_HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Install the hook; later calls are no-ops.
///
/// The previously installed hook still runs after ours, so the default
/// stderr message and `RUST_BACKTRACE` handling are kept.
pub fn install_panic_hook() {
    if PANIC_HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        warn!("Panic hook already installed, skipping");
        return;
    }

    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        PANIC_COUNT.fetch_add(1, Ordering::Relaxed);

        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        let message = panic_message(info.payload());
        let thread = std::thread::current();

        error!(
            location = %location,
            thread = thread.name().unwrap_or("unnamed"),
            "Panic: {}",
            message
        );

        previous(info);
    }));

    tracing::info!("Panic hook installed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic message".to_string()
    }
}

pub fn is_panic_hook_installed() -> bool {
    PANIC_HOOK_INSTALLED.load(Ordering::SeqCst)
}

/// Panics observed since the hook was installed
pub fn panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}
