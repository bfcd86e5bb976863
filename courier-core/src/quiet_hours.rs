use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::types::QuietHours;

/// Resolve an IANA timezone name, falling back to the configured default and
/// finally UTC. User records carry free-form strings.
pub fn resolve_tz(name: &str, fallback: &str) -> Tz {
    name.parse()
        .or_else(|_| fallback.parse())
        .unwrap_or(chrono_tz::UTC)
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Whether `now` falls inside the user's quiet window, evaluated on their
/// local clock. A window with `start >= end` wraps midnight. Missing or
/// malformed boundaries disable the window rather than blocking sends.
pub fn is_quiet(quiet: Option<&QuietHours>, tz: Tz, now: DateTime<Utc>) -> bool {
    let Some(quiet) = quiet else { return false };
    let start = quiet.start.as_deref().and_then(parse_hhmm);
    let end = quiet.end.as_deref().and_then(parse_hhmm);
    let (Some(start), Some(end)) = (start, end) else {
        return false;
    };
    let local = now.with_timezone(&tz);
    let minute = local.hour() * 60 + local.minute();
    if start < end {
        minute >= start && minute < end
    } else {
        minute >= start || minute < end
    }
}

/// UTC instant when the current quiet window ends. Computed as local wall
/// seconds until `end`, so a DST shift can skew it by an hour; callers
/// re-check `is_quiet` before sending, which corrects any drift.
pub fn quiet_until(quiet: &QuietHours, tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let end_secs = i64::from(quiet.end.as_deref().and_then(parse_hhmm).unwrap_or(0) * 60);
    let local = now.with_timezone(&tz);
    let local_secs = i64::from(local.num_seconds_from_midnight());
    let delta = (end_secs - local_secs).rem_euclid(86_400);
    now + chrono::Duration::seconds(delta.max(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(start: &str, end: &str) -> QuietHours {
        QuietHours::new(start, end)
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
    }

    #[test]
    fn plain_window_is_inclusive_start_exclusive_end() {
        let q = window("08:00", "17:00");
        assert!(is_quiet(Some(&q), chrono_tz::UTC, utc(8, 0)));
        assert!(is_quiet(Some(&q), chrono_tz::UTC, utc(12, 0)));
        assert!(!is_quiet(Some(&q), chrono_tz::UTC, utc(17, 0)));
        assert!(!is_quiet(Some(&q), chrono_tz::UTC, utc(7, 59)));
    }

    #[test]
    fn window_with_start_after_end_wraps_midnight() {
        let q = window("22:00", "07:00");
        assert!(is_quiet(Some(&q), chrono_tz::UTC, utc(23, 30)));
        assert!(is_quiet(Some(&q), chrono_tz::UTC, utc(6, 59)));
        assert!(!is_quiet(Some(&q), chrono_tz::UTC, utc(7, 0)));
        assert!(!is_quiet(Some(&q), chrono_tz::UTC, utc(12, 0)));
    }

    #[test]
    fn missing_or_malformed_boundaries_never_block() {
        assert!(!is_quiet(None, chrono_tz::UTC, utc(23, 30)));
        let q = window("8pm", "07:00");
        assert!(!is_quiet(Some(&q), chrono_tz::UTC, utc(23, 30)));
        let q = window("25:00", "07:00");
        assert!(!is_quiet(Some(&q), chrono_tz::UTC, utc(23, 30)));
        let q = QuietHours {
            start: Some("22:00".to_string()),
            end: None,
        };
        assert!(!is_quiet(Some(&q), chrono_tz::UTC, utc(23, 30)));
    }

    #[test]
    fn window_is_evaluated_on_the_local_clock() {
        // 16:30 UTC is 23:30 in Ho Chi Minh City (+07:00).
        let q = window("22:00", "07:00");
        let tz = resolve_tz("Asia/Ho_Chi_Minh", "UTC");
        assert!(is_quiet(Some(&q), tz, utc(16, 30)));
        assert!(!is_quiet(Some(&q), chrono_tz::UTC, utc(16, 30)));
    }

    #[test]
    fn unknown_timezone_falls_back() {
        let tz = resolve_tz("Mars/Olympus_Mons", "Asia/Ho_Chi_Minh");
        assert_eq!(tz, chrono_tz::Asia::Ho_Chi_Minh);
        let tz = resolve_tz("Mars/Olympus_Mons", "also-bad");
        assert_eq!(tz, chrono_tz::UTC);
    }

    #[test]
    fn quiet_until_lands_on_window_end() {
        let q = window("22:00", "07:00");
        let tz = resolve_tz("Asia/Ho_Chi_Minh", "UTC");
        // Local 23:30, window ends 07:00 local: 7.5 hours away.
        let until = quiet_until(&q, tz, utc(16, 30));
        assert_eq!(until, utc(16, 30) + chrono::Duration::hours(7) + chrono::Duration::minutes(30));
        assert!(!is_quiet(Some(&q), tz, until));
    }
}
