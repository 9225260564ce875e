//! `serde` has no blanket `Serialize` for `std::time::SystemTime`; this
//! gives every timestamp field in the crate a consistent epoch-seconds
//! wire format without pulling in a date/time crate.

use serde::Serializer;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn as_epoch_secs<S>(ts: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let secs = ts.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    serializer.serialize_u64(secs)
}
