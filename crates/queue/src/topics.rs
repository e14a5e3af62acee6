//! Topic names.

/// Topics carrying event data.
pub mod topic {
    pub const RAW_EVENTS: &str = "raw_events";
    pub const NORMALIZED_EVENTS: &str = "normalized_events";
    pub const UNSAVED_EVENTS: &str = "unsaved_events";
    pub const USER_REPORTING_TASK: &str = "user_reporting_task";
    pub const ENVIRONMENT_DAY: &str = "environment_day";
    pub const EMAILS: &str = "emails";
}

/// Clock topics, published on a fixed wall-clock schedule.
pub mod clock {
    pub const EVERY_SECOND: &str = "every_second";
    pub const EVERY_MINUTE: &str = "every_minute";
    pub const EVERY_TEN_MINUTES: &str = "every_ten_minutes";
    pub const NINETEEN_PAST_HOUR: &str = "nineteen_past_hour";
    pub const FIFTY_THREE_PAST_HOUR: &str = "fifty_three_past_hour";
    pub const ELEVEN_MINUTES_TO_MIDNIGHT: &str = "eleven_minutes_to_midnight";
    pub const FIRST_WED_OF_MONTH: &str = "first_wed_of_month";

    /// All clock topics.
    pub const ALL: &[&str] = &[
        EVERY_SECOND,
        EVERY_MINUTE,
        EVERY_TEN_MINUTES,
        NINETEEN_PAST_HOUR,
        FIFTY_THREE_PAST_HOUR,
        ELEVEN_MINUTES_TO_MIDNIGHT,
        FIRST_WED_OF_MONTH,
    ];
}
