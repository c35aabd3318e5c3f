use avformat::structs::rational::{NOPTS_VALUE, Rational};

pub fn time_str(sec: f64) -> String {
    let ms = sec * 1000f64;
    let hours = (ms / 3600000f64) as u64;
    let minutes = ((ms % 3600000f64) / 60000f64) as u64;
    let seconds = ((ms % 60000f64) / 1000f64) as u64;
    let milliseconds = (ms % 1000f64) as u64;

    format!(
        "{hours:0width$}:{minutes:02}:{seconds:02}.{milliseconds:03}",
        width = if hours >= 100 { 0 } else { 2 }
    )
}

/// `ts` in `time_base` as seconds, `None` when unset.
pub fn ts_secs(ts: i64, time_base: Rational) -> Option<f64> {
    (ts != NOPTS_VALUE && time_base.is_valid()).then(|| ts as f64 * time_base.to_f64())
}

/// A timestamp column: the raw value, or `N/A`.
pub fn ts_str(ts: i64) -> String {
    if ts == NOPTS_VALUE {
        "N/A".to_string()
    } else {
        ts.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hours_minutes_seconds() {
        assert_eq!(time_str(0.0), "00:00:00.000");
        assert_eq!(time_str(3725.5), "01:02:05.500");
        assert_eq!(time_str(360_000.0), "100:00:00.000");
    }

    #[test]
    fn unset_timestamps() {
        assert_eq!(ts_str(NOPTS_VALUE), "N/A");
        assert_eq!(ts_str(-3), "-3");
        assert_eq!(ts_secs(NOPTS_VALUE, Rational::new(1, 1000)), None);
        assert_eq!(ts_secs(1500, Rational::new(1, 1000)), Some(1.5));
    }
}
