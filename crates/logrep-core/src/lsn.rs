//! LSN (Log Sequence Number) and commit timestamp helpers.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Seconds between the Unix epoch and the Postgres epoch (2000-01-01 UTC).
const PG_EPOCH_OFFSET: i64 = 946_684_800;

/// Parse LSN from "X/Y" format to u64.
pub fn parse_lsn(lsn: &str) -> Result<u64> {
    let (high, low) = lsn
        .split_once('/')
        .ok_or_else(|| Error::InvalidLsn(lsn.to_string()))?;

    let high = u64::from_str_radix(high, 16).map_err(|_| Error::InvalidLsn(lsn.to_string()))?;
    let low = u64::from_str_radix(low, 16).map_err(|_| Error::InvalidLsn(lsn.to_string()))?;

    if high > u64::from(u32::MAX) || low > u64::from(u32::MAX) {
        return Err(Error::InvalidLsn(lsn.to_string()));
    }

    Ok((high << 32) | low)
}

/// Format u64 LSN to "X/Y" format.
pub fn format_lsn(lsn: u64) -> String {
    let high = lsn >> 32;
    let low = lsn & 0xFFFFFFFF;
    format!("{:X}/{:X}", high, low)
}

/// Convert a timestamp to microseconds since the Postgres epoch, the unit
/// used on the wire.
pub fn to_pg_micros(ts: DateTime<Utc>) -> i64 {
    (ts.timestamp() - PG_EPOCH_OFFSET) * 1_000_000 + i64::from(ts.timestamp_subsec_micros())
}

/// Convert microseconds since the Postgres epoch back to a timestamp.
pub fn from_pg_micros(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000) + PG_EPOCH_OFFSET;
    let nanos = (micros.rem_euclid(1_000_000) * 1000) as u32;
    DateTime::from_timestamp(secs, nanos)
}
