//! Trading-hours calendar
//!
//! Pure functions of wall-clock time. Everything is evaluated in the exchange
//! timezone so the host locale never matters. No holiday calendar is
//! consulted: a weekday is a trading day.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

/// Whether the session is running at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct MarketSchedule {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl Default for MarketSchedule {
    fn default() -> Self {
        Self::nse()
    }
}

impl MarketSchedule {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime) -> Self {
        Self { tz, open, close }
    }

    /// NSE cash/derivatives session: 09:15 to 15:30 IST, Monday to Friday
    pub fn nse() -> Self {
        Self {
            tz: chrono_tz::Asia::Kolkata,
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    #[inline]
    fn is_trading_day(date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// True on a weekday with local time inside `[open, close]` (inclusive).
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        let t = local.time();
        Self::is_trading_day(local.date_naive()) && t >= self.open && t <= self.close
    }

    pub fn status(&self, now: DateTime<Utc>) -> MarketStatus {
        if self.is_open(now) {
            MarketStatus::Open
        } else {
            MarketStatus::Closed
        }
    }

    /// Current status and whole seconds until it flips.
    pub fn next_transition(&self, now: DateTime<Utc>) -> (MarketStatus, i64) {
        match self.seconds_until_close(now) {
            Some(secs) => (MarketStatus::Open, secs),
            None => (MarketStatus::Closed, self.seconds_until_open(now)),
        }
    }

    /// Seconds until the next session open.
    ///
    /// Before today's open on a trading day this is today's open. Otherwise
    /// (during or after the session, or on a weekend) it is the open of the
    /// next trading day, so Friday evening lands on Monday.
    pub fn seconds_until_open(&self, now: DateTime<Utc>) -> i64 {
        let local = now.with_timezone(&self.tz);
        let today = local.date_naive();

        let mut day = if Self::is_trading_day(today) && local.time() < self.open {
            today
        } else {
            today + Duration::days(1)
        };
        while !Self::is_trading_day(day) {
            day += Duration::days(1);
        }

        let open_at = self.local_instant(day, self.open);
        (open_at - now).num_seconds().max(0)
    }

    /// Seconds left in today's session, `None` when the market is closed.
    pub fn seconds_until_close(&self, now: DateTime<Utc>) -> Option<i64> {
        if !self.is_open(now) {
            return None;
        }
        let today = now.with_timezone(&self.tz).date_naive();
        let close_at = self.local_instant(today, self.close);
        Some((close_at - now).num_seconds().max(0))
    }

    fn local_instant(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time);
        // Session times never fall in a DST gap for exchange timezones in use;
        // fall back to interpreting as UTC rather than panicking if one does.
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }
}

/// Render whole seconds as `HH:MM:SS` (hours may exceed 24).
pub fn format_countdown(seconds: i64) -> String {
    let s = seconds.max(0);
    format!("{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60)
}

/// One-line operator status, e.g. `MARKET CLOSED - opens in 17:45:00`
pub fn status_line(schedule: &MarketSchedule, now: DateTime<Utc>) -> String {
    match schedule.next_transition(now) {
        (MarketStatus::Open, secs) => format!("MARKET OPEN - closes in {}", format_countdown(secs)),
        (MarketStatus::Closed, secs) => {
            format!("MARKET CLOSED - opens in {}", format_countdown(secs))
        }
    }
}
