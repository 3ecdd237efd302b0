//! Order number generation.

use chrono::{DateTime, Datelike, Utc};

/// Prefix of every generated order number.
pub const ORDER_NUMBER_PREFIX: &str = "ORD";

const SUFFIX_LEN: usize = 8;

/// Produces candidate order numbers.
///
/// Numbers are not guaranteed unique by construction; the store's uniqueness
/// constraint has the final word and checkout retries on collision.
pub trait OrderNumberSource: Send + Sync {
    fn next_number(&self, now: DateTime<Utc>) -> String;
}

/// `ORD-YYYYMM-XXXXXXXX`, where the suffix is the first eight hex digits of a
/// random UUID, upper-cased.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomOrderNumbers;

impl OrderNumberSource for RandomOrderNumbers {
    fn next_number(&self, now: DateTime<Utc>) -> String {
        let uuid = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        format_order_number(now, &uuid[..SUFFIX_LEN])
    }
}

/// Formats an order number from a timestamp and a suffix.
pub fn format_order_number(now: DateTime<Utc>, suffix: &str) -> String {
    format!(
        "{ORDER_NUMBER_PREFIX}-{:04}{:02}-{suffix}",
        now.year(),
        now.month()
    )
}
