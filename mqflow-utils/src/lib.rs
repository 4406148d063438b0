//! Shared primitives for the mqflow crates.
//!
//! - [`Counter`]: atomic gauge that remembers its high-water mark
//! - [`timestamp_millis`]: wall-clock milliseconds used to stamp messages

#![deny(unsafe_code)]

mod counter;

pub use counter::Counter;

pub type TimestampMillis = i64;

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Local::now().timestamp_millis()
}

#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    match chrono::DateTime::from_timestamp_millis(t) {
        Some(t) => t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => "".into(),
    }
}
