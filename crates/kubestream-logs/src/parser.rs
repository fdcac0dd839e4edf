use chrono::{DateTime, Utc};

use kubestream_types::TimestampFormat;

/// Splits the kubelet's timestamp prefix off raw log lines
pub struct LogParser;

impl LogParser {
    /// Split a raw line into its timestamp (if any) and the message content
    pub fn split_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        // K8s timestamp format: 2024-01-15T10:30:00.123456789Z (30 chars)
        // Sometimes shorter: 2024-01-15T10:30:00Z (20 chars)
        if raw.len() >= 20 {
            // Find the 'Z' that ends the timestamp within first ~35 chars
            let search_end = Self::floor_char_boundary(raw, 35.min(raw.len()));
            if let Some(z_pos) = raw.get(..search_end).and_then(|s| s.find('Z')) {
                let ts_str = &raw[..=z_pos];
                if let Ok(ts) = DateTime::parse_from_rfc3339(ts_str) {
                    let rest = &raw[z_pos + 1..];
                    // Only the separating space belongs to the prefix
                    let rest = rest.strip_prefix(' ').unwrap_or(rest);
                    return (Some(ts.with_timezone(&Utc)), rest);
                }
            }
        }
        (None, raw)
    }

    /// Render the message to relay, prefixing the timestamp if requested
    pub fn render(timestamp: Option<&DateTime<Utc>>, content: &str, format: TimestampFormat) -> String {
        match timestamp.and_then(|ts| format.render(ts)) {
            Some(prefix) => format!("{} {}", prefix, content),
            None => content.to_string(),
        }
    }

    /// Find the largest valid char boundary <= the given byte index
    fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
        if idx >= s.len() {
            return s.len();
        }
        while idx > 0 && !s.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }
}
