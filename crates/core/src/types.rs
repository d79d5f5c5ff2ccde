/// Jobs are keyed by time-ordered UUIDs (v7).
pub type JobId = uuid::Uuid;

/// Worker ids are chosen by the worker and treated as opaque strings.
pub type WorkerId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Elapsed wall-clock between two timestamps as a std `Duration`.
///
/// Negative spans (clock skew, `later` before `earlier`) clamp to zero.
pub fn elapsed_between(earlier: Timestamp, later: Timestamp) -> std::time::Duration {
    (later - earlier).to_std().unwrap_or_default()
}
