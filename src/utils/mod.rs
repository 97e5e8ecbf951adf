/// Utility functions and helpers
use std::time::Duration;

use crate::error::DriverResult;
use crate::topology::HostSpec;

/// Parse a comma-separated "host:port,host:port" list
pub fn parse_host_list(list: &str) -> DriverResult<Vec<HostSpec>> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
