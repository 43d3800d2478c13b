/// Classification of single server console lines.
///
/// The server prints one event per line in the shape
///   `D.M.YYYY HH:MM:SS [<Channel Name>] <text>`
/// e.g. `4.11.2024 21:03:17 [Server Notification] Backup complete!`.
/// Anything else (stack traces, banner output, blank lines) is opaque output.
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone};
use regex::Regex;

/// Named category of a parsed console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ServerEvent,
    ServerNotification,
    ServerChat,
}

impl Channel {
    /// The name as printed between the square brackets.
    pub fn name(self) -> &'static str {
        match self {
            Channel::ServerEvent => "Server Event",
            Channel::ServerNotification => "Server Notification",
            Channel::ServerChat => "Server Chat",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Server Event" => Some(Channel::ServerEvent),
            "Server Notification" => Some(Channel::ServerNotification),
            "Server Chat" => Some(Channel::ServerChat),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Local wall-clock time printed by the server.
    pub datetime: DateTime<Local>,
    pub channel: Channel,
    /// Message text with surrounding whitespace removed.
    pub text: String,
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(\d{1,2})\.(\d{1,2})\.(\d{4}) (\d{2}):(\d{2}):(\d{2}) \[([^\]]*)\] (.*)$",
        )
        .expect("console line pattern is a valid regex")
    })
}

/// Parses one console line.  Returns `None` for anything that is not a
/// complete, well-formed line on a known channel, including impossible
/// calendar dates.
pub fn parse_message(line: &str) -> Option<ParsedMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = line_pattern().captures(line)?;

    let field = |i: usize| caps.get(i).map_or("", |m| m.as_str());
    let number = |i: usize| field(i).parse::<u32>().ok();

    let date = NaiveDate::from_ymd_opt(field(3).parse().ok()?, number(2)?, number(1)?)?;
    let naive = date.and_hms_opt(number(4)?, number(5)?, number(6)?)?;
    let datetime = wall_clock(&Local, naive);

    let channel = Channel::from_name(field(7).trim())?;

    Some(ParsedMessage {
        datetime,
        channel,
        text: field(8).trim().to_string(),
    })
}

/// Resolves a printed wall-clock time in `tz`.  An ambiguous fall-back time
/// takes its first occurrence.  A time inside a spring-forward gap (or one
/// printed by a server in another zone) is moved past the gap instead of
/// being rejected.
fn wall_clock<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(datetime) | LocalResult::Ambiguous(datetime, _) => datetime,
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, FixedOffset, Timelike};

    #[test]
    fn parses_notification_line() {
        let msg = parse_message("4.11.2024 21:03:17 [Server Notification] Backup complete!").unwrap();
        assert_eq!(msg.channel, Channel::ServerNotification);
        assert_eq!(msg.text, "Backup complete!");
        assert_eq!(msg.datetime.day(), 4);
        assert_eq!(msg.datetime.month(), 11);
        assert_eq!(msg.datetime.year(), 2024);
        assert_eq!(msg.datetime.hour(), 21);
        assert_eq!(msg.datetime.minute(), 3);
        assert_eq!(msg.datetime.second(), 17);
    }

    #[test]
    fn parses_every_channel() {
        for channel in [Channel::ServerEvent, Channel::ServerNotification, Channel::ServerChat] {
            let line = format!("01.02.2025 08:00:00 [{channel}] hello");
            let msg = parse_message(&line).unwrap();
            assert_eq!(msg.channel, channel, "Failed for {line}");
        }
    }

    #[test]
    fn trims_text_and_line_terminators() {
        let msg = parse_message("1.2.2025 08:00:00 [Server Chat]   hi there  \r\n").unwrap();
        assert_eq!(msg.text, "hi there");
    }

    #[test]
    fn text_may_contain_brackets() {
        let msg = parse_message("1.2.2025 08:00:00 [Server Event] player [Bob] joined").unwrap();
        assert_eq!(msg.channel, Channel::ServerEvent);
        assert_eq!(msg.text, "player [Bob] joined");
    }

    #[test]
    fn rejects_unknown_channel() {
        assert!(parse_message("1.2.2025 08:00:00 [Server Warning] careful").is_none());
    }

    #[test]
    fn rejects_partial_and_prefixed_lines() {
        assert!(parse_message("").is_none());
        assert!(parse_message("Loading mods...").is_none());
        assert!(parse_message("1.2.2025 08:00 [Server Event] short time").is_none());
        assert!(parse_message("x 1.2.2025 08:00:00 [Server Event] prefixed").is_none());
        assert!(parse_message("1.2.25 08:00:00 [Server Event] two-digit year").is_none());
        assert!(parse_message("1.2.2025 8:00:00 [Server Event] one-digit hour").is_none());
        assert!(parse_message("1.2.2025 08:00:00 Server Event no brackets").is_none());
    }

    #[test]
    fn rejects_impossible_dates() {
        assert!(parse_message("31.2.2025 08:00:00 [Server Event] february").is_none());
        assert!(parse_message("1.13.2025 08:00:00 [Server Event] month 13").is_none());
        assert!(parse_message("1.2.2025 25:00:00 [Server Event] hour 25").is_none());
    }

    /// US Eastern around 10.3.2024: clocks jump from 02:00 EST to 03:00 EDT.
    #[derive(Debug, Clone, Copy)]
    struct SpringForward;

    impl SpringForward {
        fn est() -> FixedOffset {
            FixedOffset::west_opt(5 * 3600).unwrap()
        }
        fn edt() -> FixedOffset {
            FixedOffset::west_opt(4 * 3600).unwrap()
        }
        fn at(hour: u32, minute: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 3, 10)
                .unwrap()
                .and_hms_opt(hour, minute, 0)
                .unwrap()
        }
    }

    impl TimeZone for SpringForward {
        type Offset = FixedOffset;

        fn from_offset(_: &FixedOffset) -> Self {
            SpringForward
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            if *local < Self::at(2, 0) {
                LocalResult::Single(Self::est())
            } else if *local < Self::at(3, 0) {
                LocalResult::None
            } else {
                LocalResult::Single(Self::edt())
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            if *utc < Self::at(7, 0) {
                Self::est()
            } else {
                Self::edt()
            }
        }
    }

    #[test]
    fn wall_clock_keeps_ordinary_times() {
        let resolved = wall_clock(&SpringForward, SpringForward::at(1, 30));
        assert_eq!(resolved.naive_local(), SpringForward::at(1, 30));
        assert_eq!(resolved.offset(), &SpringForward::est());
    }

    #[test]
    fn wall_clock_moves_gap_times_past_the_gap() {
        let resolved = wall_clock(&SpringForward, SpringForward::at(2, 30));
        assert_eq!(resolved.naive_local(), SpringForward::at(3, 30));
        assert_eq!(resolved.naive_utc(), SpringForward::at(7, 30));
    }

    #[test]
    fn line_printed_in_a_gap_still_parses() {
        // Whatever the local zone, a valid date and time is never dropped.
        for time in ["02:00:00", "02:30:00", "02:59:59"] {
            let line = format!("10.3.2024 {time} [Server Notification] Backup complete!");
            let msg = parse_message(&line).unwrap();
            assert_eq!(msg.text, "Backup complete!", "Failed for {line}");
        }
    }

    #[test]
    fn multi_line_chunk_is_not_a_message() {
        // Multi-line chunks must be split before parsing.
        let chunk = "1.2.2025 08:00:00 [Server Event] a\n1.2.2025 08:00:01 [Server Event] b";
        assert!(parse_message(chunk).is_none());
    }

    #[test]
    fn channel_names_round_trip() {
        for channel in [Channel::ServerEvent, Channel::ServerNotification, Channel::ServerChat] {
            assert_eq!(Channel::from_name(channel.name()), Some(channel));
        }
    }
}
