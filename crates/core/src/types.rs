/// Agent slots are small integers handed out at process start (0, 1, 2, ...).
pub type SlotId = u32;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
