//! Human-readable formatting for transfer progress
//!
//! Sizes use binary multiples (1 KB = 1024 bytes) with two decimals.

const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// Format a byte count: `0 B`, `512 B`, `1.50 KB`, `3.25 GB`
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Format a transfer rate in bytes per second
pub fn format_speed(bytes_per_second: f64) -> String {
    let bps = if bytes_per_second.is_finite() && bytes_per_second > 0.0 {
        bytes_per_second.round() as u64
    } else {
        0
    };
    format!("{}/s", format_size(bps))
}

/// Format remaining time as `M:SS`, or `--:--` when unknown
pub fn format_eta(seconds: Option<u64>) -> String {
    match seconds {
        Some(total) => format!("{}:{:02}", total / 60, total % 60),
        None => "--:--".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 + 256 * 1024 * 1024), "3.25 GB");
    }

    #[test]
    fn test_format_size_caps_at_gb() {
        assert_eq!(format_size(2048 * 1024 * 1024 * 1024), "2048.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(2048.0), "2.00 KB/s");
        assert_eq!(format_speed(0.0), "0 B/s");
        assert_eq!(format_speed(f64::NAN), "0 B/s");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "--:--");
        assert_eq!(format_eta(Some(0)), "0:00");
        assert_eq!(format_eta(Some(75)), "1:15");
        assert_eq!(format_eta(Some(3601)), "60:01");
    }
}
