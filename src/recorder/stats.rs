/**
 * Size and bitrate figures for a finished recording.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub size_mb: f64,
    // None when the target duration is zero
    pub bitrate_kbps: Option<f64>,
}

pub fn compute_stats(bytes_written: u64, target_duration_secs: u64) -> Stats {
    let size_mb = bytes_written as f64 / (1024.0 * 1024.0);
    let bitrate_kbps = if target_duration_secs == 0 {
        None
    } else {
        Some((size_mb * 8192.0) / target_duration_secs as f64)
    };

    Stats {
        size_mb,
        bitrate_kbps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recording_has_zero_size_and_bitrate() {
        let stats = compute_stats(0, 5400);
        assert_eq!(stats.size_mb, 0.0);
        assert_eq!(stats.bitrate_kbps, Some(0.0));
    }

    #[test]
    fn zero_duration_yields_no_bitrate() {
        let stats = compute_stats(4 * 1024 * 1024, 0);
        assert_eq!(stats.size_mb, 4.0);
        assert_eq!(stats.bitrate_kbps, None);
    }

    #[test]
    fn bitrate_of_a_128k_stream() {
        // 128 kbps for 60 seconds is 960000 bytes
        let stats = compute_stats(960_000, 60);
        let kbps = stats.bitrate_kbps.unwrap();
        assert!((kbps - 125.0).abs() < 0.01, "got {}", kbps);
    }
}
