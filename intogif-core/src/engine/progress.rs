//! Progress extraction from ffmpeg log output

use std::time::Duration;

/// Derives progress ratios from the ffmpeg log stream.
///
/// ffmpeg prints the input duration once (`Duration: 00:00:05.00, ...`) and
/// then periodic statistics lines carrying `time=`. The ratio is the reported
/// time over the input duration. Ratios are passed through unclamped: the
/// filter graph changes frame timing, so values above 1.0 or going backwards
/// are normal.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    duration: Option<Duration>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input duration seen so far, if any
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Feed one log line, returning a progress ratio if the line carries one
    pub fn observe(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();

        if let Some(value) = extract_value(line, "Duration:") {
            let value = value.trim_end_matches(',');
            if let Some(duration) = parse_ffmpeg_time(value) {
                self.duration = Some(duration);
            }
            return None;
        }

        // Final summary line, printed once the output is fully written. Since
        // ffmpeg 6.1 it carries an `[out#0/gif @ 0x...]` prefix.
        if line.contains("video:") && line.contains("audio:") {
            self.duration = None;
            return Some(1.0);
        }

        let total = self.duration?;
        if total.is_zero() {
            return None;
        }

        let time = extract_value(line, "time=").and_then(parse_ffmpeg_time)?;
        Some(time.as_secs_f64() / total.as_secs_f64())
    }
}

/// Extract the whitespace-delimited value following `key` in `line`.
///
/// Tolerates padding between the key and its value (`frame=  123`).
fn extract_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Parse ffmpeg time format (HH:MM:SS.ss)
fn parse_ffmpeg_time(time_str: &str) -> Option<Duration> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: u64 = parts[0].parse().ok()?;
    let minutes: u64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }

    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_time_parsing() {
        assert_eq!(
            parse_ffmpeg_time("00:01:30.50"),
            Some(Duration::from_millis(90500))
        );
        assert_eq!(
            parse_ffmpeg_time("01:00:00.00"),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(parse_ffmpeg_time("N/A"), None);
        assert_eq!(parse_ffmpeg_time("invalid"), None);
    }

    #[test]
    fn test_extract_value_with_padding() {
        let line = "frame=  123 fps= 45 q=-0.0 size=    1024kB time=00:00:05.12 bitrate=1.5kbits/s";
        assert_eq!(extract_value(line, "frame="), Some("123"));
        assert_eq!(extract_value(line, "time="), Some("00:00:05.12"));
        assert_eq!(extract_value(line, "missing="), None);
    }

    #[test]
    fn test_progress_requires_duration() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(
            tracker.observe("frame=   10 fps=0.0 q=-0.0 size=0kB time=00:00:01.00"),
            None
        );
    }

    #[test]
    fn test_progress_ratio_from_time() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(
            tracker.observe("  Duration: 00:00:10.00, start: 0.000000, bitrate: 1205 kb/s"),
            None
        );
        assert_eq!(tracker.duration(), Some(Duration::from_secs(10)));

        let ratio = tracker
            .observe("frame=   25 fps=0.0 q=-0.0 size=256kB time=00:00:02.50 bitrate=838.9kbits/s")
            .unwrap();
        assert!((ratio - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_progress_is_not_clamped() {
        let mut tracker = ProgressTracker::new();
        tracker.observe("Duration: 00:00:02.00, start: 0.000000");

        let over = tracker.observe("time=00:00:03.00 bitrate=N/A").unwrap();
        assert!((over - 1.5).abs() < 1e-9);

        let back = tracker.observe("time=00:00:01.00 bitrate=N/A").unwrap();
        assert!((back - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_summary_line_completes_progress() {
        let mut tracker = ProgressTracker::new();
        tracker.observe("Duration: 00:00:02.00, start: 0.000000");

        assert_eq!(
            tracker.observe("video:512kB audio:0kB subtitle:0kB other streams:0kB"),
            Some(1.0)
        );
        assert_eq!(tracker.duration(), None);

        tracker.observe("Duration: 00:00:02.00, start: 0.000000");
        assert_eq!(
            tracker.observe(
                "[out#0/gif @ 0x55d0c8a3f1c0] video:512KiB audio:0KiB subtitle:0KiB other streams:0KiB global headers:0KiB muxing overhead: 0.003815%"
            ),
            Some(1.0)
        );
        assert_eq!(tracker.duration(), None);
    }

    #[test]
    fn test_stream_description_is_not_a_summary() {
        let mut tracker = ProgressTracker::new();
        tracker.observe("Duration: 00:00:02.00, start: 0.000000");

        assert_eq!(
            tracker.observe("  Stream #0:0(und): Video: h264 (High) (avc1 / 0x31637661), yuv420p, 1280x720"),
            None
        );
        assert_eq!(tracker.duration(), Some(Duration::from_secs(2)));
    }
}
