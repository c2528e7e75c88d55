/// Logs at `info` level, optionally attaching how long it took from a starting time to now.
/// ```ignore
/// info_time!("str {}, {}", 1, 2);
/// let time = Local::now();
/// info_time!(time, "str {}, {}", 1, 2);
/// ```
#[macro_export]
macro_rules! info_time {
    ($strfm:literal $(,)? $($arg:expr),*) => {{
        ::tracing::info!($strfm $(, $arg)*);
    }};
    ($time:expr, $strfm:literal $(,)? $($arg:expr),*) => {{
        let run_time = $crate::macros::secs_since($time);
        ::tracing::info!(runtime_secs = run_time, $strfm $(, $arg)*);
    }};
}

#[doc(hidden)]
pub fn secs_since(start: chrono::DateTime<chrono::Local>) -> f64 {
    (chrono::Local::now() - start)
        .num_microseconds()
        .map(|n| n as f64 / 1_000_000.0)
        .unwrap_or(0.0)
}
