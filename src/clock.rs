//! Wall-clock helpers shared by the timer, lock leases and call records.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_now_is_monotonic_enough() {
        let a = epoch_now();
        let b = epoch_now();
        assert!(b >= a);
        assert!(a > 1_500_000_000.0);
    }
}
