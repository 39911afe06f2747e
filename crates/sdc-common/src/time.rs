//! ---
//! sdc_section: "01-shared-runtime"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Shared primitives and utilities for the collector runtime."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use chrono::Utc;

/// Current wall-clock time as fractional unix seconds. Device timestamps in
/// the wire format are unix seconds with optional fractions, so the collector
/// keeps the same representation throughout.
pub fn unix_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_now_advances() {
        let a = unix_now();
        let b = unix_now();
        assert!(b >= a);
        assert!(a > 1_600_000_000.0, "clock reads after 2020");
    }
}
