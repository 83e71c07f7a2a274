/// Formats media time as `HH:MM:SS.mmm`. Hours widen past 99.
pub fn time_str(sec: f64) -> String {
    if !sec.is_finite() {
        return "--:--:--.---".to_string();
    }

    let total_ms = (sec.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1000) % 60;
    let milliseconds = total_ms % 1000;

    format!("{hours:02}:{minutes:02}:{seconds:02}.{milliseconds:03}")
}

#[test]
fn formats_media_time() {
    assert_eq!(time_str(0.0), "00:00:00.000");
    assert_eq!(time_str(4.04), "00:00:04.040");
    assert_eq!(time_str(3723.5), "01:02:03.500");
    assert_eq!(time_str(f64::INFINITY), "--:--:--.---");
}
