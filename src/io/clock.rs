//! Wall-clock timestamps and collision-resistant identifiers.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current UTC time. All timestamps written by the store are produced here at
/// commit time, not at the start of a mutation.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// ISO-8601 UTC with second precision and `Z` suffix.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_iso() -> String {
    to_iso(now_utc())
}

/// Fresh run identifier: `run-<YYYYMMDD-HHMMSS>-<6 hex>`. The random suffix
/// makes collisions within one second negligible.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%d-%H%M%S");
    let suffix = rand::random::<u32>() & 0xff_ffff;
    format!("run-{stamp}-{suffix:06x}")
}

/// Supervisor identifier: host process id plus start epoch.
pub fn supervisor_id(start: DateTime<Utc>) -> String {
    format!("sup-{}-{}", std::process::id(), start.timestamp())
}
