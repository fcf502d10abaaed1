//! Formatting of file facts for MDTM, MLST and STAT replies.

use std::time::{SystemTime, UNIX_EPOCH};

use ftpost_fs::FileStat;

/// `YYYYMMDDHHMMSS` in UTC, as MDTM and the MLST `modify` fact expect.
pub fn format_timeval(t: SystemTime) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{year:04}{month:02}{day:02}{:02}{:02}{:02}",
        rem / 3600,
        rem % 3600 / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// RFC 3659 fact line, e.g. `type=file;size=12;modify=20240101000000; name`.
pub fn mlst_line(stat: &FileStat, name: &str) -> String {
    let kind = if stat.is_dir { "dir" } else { "file" };
    format!(
        "type={kind};size={};modify={}; {name}",
        stat.size,
        format_timeval(stat.modified)
    )
}
