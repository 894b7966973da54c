//! When the scheduled daily run fires.

use chrono::{DateTime, Duration, NaiveTime, Utc};

/// The next `hour:00` UTC strictly after `now`. Hours past 23 wrap.
pub fn next_daily_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour % 24, 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// Time left until `at`, zero if it already passed.
pub fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> std::time::Duration {
    (at - now).to_std().unwrap_or_default()
}
