//! Runtime diagnostics for production debugging
//!
//! Installs a SIGQUIT (`kill -3`) handler that dumps scheduler statistics
//! to stderr and keeps running, in the spirit of JVM thread dumps. Wired
//! up by the first pool start when the `diagnostics` feature is on; safe
//! to call repeatedly.

use std::sync::Once;
use std::sync::atomic::Ordering;

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Install the SIGQUIT handler. Idempotent.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(all(unix, feature = "diagnostics"))]
        {
            unsafe {
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                    dump_diagnostics();
                });
            }
        }
    });
}

/// Dump runtime statistics to stderr. Also callable directly.
pub fn dump_diagnostics() {
    use std::io::Write;

    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "\n=== Alder Runtime Diagnostics ===");
    let _ = writeln!(out, "Timestamp: {:?}", std::time::SystemTime::now());

    let spawned = crate::scheduler::TOTAL_SPAWNED.load(Ordering::Relaxed);
    let completed = crate::scheduler::TOTAL_COMPLETED.load(Ordering::Relaxed);
    let peak = crate::scheduler::PEAK_IN_FLIGHT.load(Ordering::Relaxed);
    let _ = writeln!(out, "\n[Tasks]");
    let _ = writeln!(out, "  Spawned:   {}", spawned);
    let _ = writeln!(out, "  Completed: {}", completed);
    let _ = writeln!(out, "  In flight: {}", spawned.saturating_sub(completed));
    let _ = writeln!(out, "  Peak:      {}", peak);
    let _ = writeln!(out, "=================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_idempotent() {
        install_signal_handler();
        install_signal_handler();
    }

    #[test]
    fn test_dump_does_not_panic() {
        dump_diagnostics();
    }
}
