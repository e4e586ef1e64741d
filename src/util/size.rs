//! Byte counts for configuration and reports.

const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// `n` mebibytes in bytes.
#[inline]
pub const fn mib(n: usize) -> usize {
    n << 20
}

/// Render a byte count for a stats report.
///
/// Counts below one KiB are exact; larger ones use the biggest binary
/// unit that keeps the value at or above 1, with two decimals.
pub fn format_bytes(bytes: usize) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
