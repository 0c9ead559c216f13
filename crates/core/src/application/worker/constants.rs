// Worker constants (no magic values)

/// Logged job durations kept for the floating average
pub const STATS_WINDOW_SIZE: usize = 100;
