//! Clock scheduler publishing the wall-clock topics.

use bytes::Bytes;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use queue::{clock, QueueClient};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::registry::ConsumerBinding;

/// When a clock topic fires, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSchedule {
    EverySecond,
    EveryMinute,
    EveryTenMinutes,
    /// hh:19:00
    NineteenPastHour,
    /// hh:53:00
    FiftyThreePastHour,
    /// 23:49:00
    ElevenMinutesToMidnight,
    /// 00:00:00 on the first Wednesday of the month
    FirstWedOfMonth,
}

impl ClockSchedule {
    pub const ALL: [ClockSchedule; 7] = [
        Self::EverySecond,
        Self::EveryMinute,
        Self::EveryTenMinutes,
        Self::NineteenPastHour,
        Self::FiftyThreePastHour,
        Self::ElevenMinutesToMidnight,
        Self::FirstWedOfMonth,
    ];

    pub fn topic(&self) -> &'static str {
        match self {
            Self::EverySecond => clock::EVERY_SECOND,
            Self::EveryMinute => clock::EVERY_MINUTE,
            Self::EveryTenMinutes => clock::EVERY_TEN_MINUTES,
            Self::NineteenPastHour => clock::NINETEEN_PAST_HOUR,
            Self::FiftyThreePastHour => clock::FIFTY_THREE_PAST_HOUR,
            Self::ElevenMinutesToMidnight => clock::ELEVEN_MINUTES_TO_MIDNIGHT,
            Self::FirstWedOfMonth => clock::FIRST_WED_OF_MONTH,
        }
    }

    pub fn for_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.topic() == topic)
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::EverySecond => next_multiple(now, 1),
            Self::EveryMinute => next_multiple(now, 60),
            Self::EveryTenMinutes => next_multiple(now, 600),
            Self::NineteenPastHour => next_past_hour(now, 19),
            Self::FiftyThreePastHour => next_past_hour(now, 53),
            Self::ElevenMinutesToMidnight => {
                let today = at(now.date_naive(), 23, 49);
                if today > now {
                    today
                } else {
                    today + ChronoDuration::days(1)
                }
            }
            Self::FirstWedOfMonth => {
                let this_month = first_wednesday(now.year(), now.month());
                if this_month > now {
                    return this_month;
                }
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                first_wednesday(year, month)
            }
        }
    }
}

fn next_multiple(now: DateTime<Utc>, period_secs: i64) -> DateTime<Utc> {
    let next = (now.timestamp().div_euclid(period_secs) + 1) * period_secs;
    Utc.timestamp_opt(next, 0).single().unwrap_or(now)
}

fn next_past_hour(now: DateTime<Utc>, minute: u32) -> DateTime<Utc> {
    let this_hour = at(now.date_naive(), now.hour(), minute);
    if this_hour > now {
        this_hour
    } else {
        this_hour + ChronoDuration::hours(1)
    }
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let time = date.and_hms_opt(hour, minute, 0).unwrap_or_default();
    Utc.from_utc_datetime(&time)
}

fn first_wednesday(year: i32, month: u32) -> DateTime<Utc> {
    let date = NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Wed, 1).unwrap_or_default();
    at(date, 0, 0)
}

/// Schedules of the clock topics some binding consumes, in `ALL` order.
pub fn schedules_for(bindings: &[ConsumerBinding]) -> Vec<ClockSchedule> {
    ClockSchedule::ALL
        .into_iter()
        .filter(|s| bindings.iter().any(|b| b.topic() == s.topic()))
        .collect()
}

/// Publishes an empty message on each scheduled clock topic.
pub struct ClockScheduler {
    queue: Arc<dyn QueueClient>,
    schedules: Vec<ClockSchedule>,
}

impl ClockScheduler {
    pub fn with_schedules(queue: Arc<dyn QueueClient>, schedules: Vec<ClockSchedule>) -> Self {
        Self { queue, schedules }
    }

    /// Only the clock topics `bindings` consume; others would have no reader.
    pub fn for_bindings(queue: Arc<dyn QueueClient>, bindings: &[ConsumerBinding]) -> Self {
        Self::with_schedules(queue, schedules_for(bindings))
    }

    pub fn schedules(&self) -> &[ClockSchedule] {
        &self.schedules
    }

    /// Starts one publishing loop per schedule.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let handles = self
            .schedules
            .iter()
            .map(|schedule| {
                let scheduler = self.clone();
                let schedule = *schedule;
                tokio::spawn(async move { scheduler.run(schedule).await })
            })
            .collect();

        info!(schedules = self.schedules.len(), "Clock scheduler started");
        handles
    }

    async fn run(&self, schedule: ClockSchedule) {
        loop {
            let now = Utc::now();
            let next = schedule.next_after(now);
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            match self.queue.publish(schedule.topic(), Bytes::new()).await {
                Ok(()) => debug!(topic = schedule.topic(), at = %next, "Clock tick"),
                Err(e) => error!(topic = schedule.topic(), "Clock publish failed: {}", e),
            }
        }
    }
}
