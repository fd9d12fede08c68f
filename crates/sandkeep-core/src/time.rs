/// Return the current UTC timestamp as an RFC3339Nano string, the
/// canonical timestamp format used inside audit hash chain canonical
/// JSON.
pub fn utc_now_rfc3339nano() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Unix nanoseconds since the epoch, used to key hibernation artifacts
/// (`sleep/<sandbox_id>/<unix_nanos>.mem|.disk`).
pub fn unix_nanos(now: chrono::DateTime<chrono::Utc>) -> i64 {
    now.timestamp_nanos_opt().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339nano_has_nanosecond_precision_and_utc_offset() {
        let ts = utc_now_rfc3339nano();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('.'));
    }

    #[test]
    fn unix_nanos_is_monotonic_for_increasing_instants() {
        let a = chrono::Utc::now();
        let b = a + chrono::Duration::nanoseconds(1);
        assert!(unix_nanos(b) > unix_nanos(a));
    }
}
