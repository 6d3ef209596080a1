// Turns Places opening hour periods into the static seven line schedule we store in
// places_text_data, so pages never have to call the API for it.

use crate::places::{OpeningHours, Period};

/// Google numbers days from Sunday, we print from Monday
const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];
const PRINT_ORDER: [usize; 7] = [1, 2, 3, 4, 5, 6, 0];

pub const CLOSED: &str = "Closed";
pub const OPEN_24_HOURS: &str = "Open 24 hours";

/// "HHMM" in 24 hour time to "H:MM AM/PM". None for anything that is not a valid time.
pub fn format_time(hhmm: &str) -> Option<String> {
    if hhmm.len() != 4 || !hhmm.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = hhmm[..2].parse().ok()?;
    let minute: u32 = hhmm[2..].parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    let suffix = if hour < 12 { "AM" } else { "PM" };
    let hour12 = match hour % 12 {
        0 => 12,
        h => h,
    };
    Some(format!("{hour12}:{minute:02} {suffix}"))
}

fn is_always_open(periods: &[Period]) -> bool {
    // a single period opening Sunday at midnight without a close time
    matches!(periods, [p] if p.close.is_none() && p.open.day == 0 && p.open.time == "0000")
}

fn format_period(p: &Period) -> Option<String> {
    let open = format_time(&p.open.time)?;
    match &p.close {
        None => Some(OPEN_24_HOURS.into()),
        Some(c) if c.time == p.open.time && c.day == (p.open.day + 1) % 7 => {
            Some(OPEN_24_HOURS.into())
        }
        Some(c) => Some(format!("{} – {}", open, format_time(&c.time)?)),
    }
}

/// The text for each day, indexed like Google's day numbers (0 = Sunday)
pub fn day_texts(hours: &OpeningHours) -> [String; 7] {
    let mut out: [Vec<String>; 7] = Default::default();
    if is_always_open(&hours.periods) {
        return std::array::from_fn(|_| OPEN_24_HOURS.to_string());
    }
    for p in &hours.periods {
        let day = p.open.day as usize;
        if day > 6 {
            continue;
        }
        if let Some(text) = format_period(p) {
            out[day].push(text);
        }
    }
    out.map(|v| {
        if v.is_empty() {
            CLOSED.to_string()
        } else {
            v.join(", ")
        }
    })
}

/// Seven lines, Monday first, e.g. "Monday: 8:00 AM – 9:00 PM". Days without a period are
/// "Closed".
pub fn hours_to_text(hours: &OpeningHours) -> String {
    let texts = day_texts(hours);
    PRINT_ORDER
        .iter()
        .map(|&d| format!("{}: {}", DAY_NAMES[d], texts[d]))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::places::DayTime;

    fn period(day: u8, open: &str, close: Option<(u8, &str)>) -> Period {
        Period {
            open: DayTime {
                day,
                time: open.into(),
            },
            close: close.map(|(day, time)| DayTime {
                day,
                time: time.into(),
            }),
        }
    }

    #[test]
    fn times() {
        assert_eq!(Some("12:00 AM".into()), format_time("0000"));
        assert_eq!(Some("11:59 PM".into()), format_time("2359"));
        assert_eq!(Some("12:00 PM".into()), format_time("1200"));
        assert_eq!(Some("1:30 PM".into()), format_time("1330"));
        assert_eq!(Some("9:05 AM".into()), format_time("0905"));
        assert_eq!(None, format_time("2400"));
        assert_eq!(None, format_time("930"));
        assert_eq!(None, format_time("ab12"));
    }

    #[test]
    fn monday_only() {
        let hours = OpeningHours {
            periods: vec![period(1, "0000", Some((1, "2359")))],
            ..Default::default()
        };
        assert_eq!(
            "Monday: 12:00 AM – 11:59 PM\n\
             Tuesday: Closed\n\
             Wednesday: Closed\n\
             Thursday: Closed\n\
             Friday: Closed\n\
             Saturday: Closed\n\
             Sunday: Closed",
            hours_to_text(&hours)
        );
    }

    #[test]
    fn split_days_and_overnight() {
        let hours = OpeningHours {
            periods: vec![
                period(0, "1000", Some((0, "1400"))),
                period(0, "1600", Some((0, "2000"))),
                period(5, "0700", Some((6, "0100"))),
                period(6, "0800", Some((0, "0800"))),
            ],
            ..Default::default()
        };
        let text = hours_to_text(&hours);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(7, lines.len());
        assert_eq!("Monday: Closed", lines[0]);
        assert_eq!("Friday: 7:00 AM – 1:00 AM", lines[4]);
        assert_eq!("Saturday: Open 24 hours", lines[5]);
        assert_eq!("Sunday: 10:00 AM – 2:00 PM, 4:00 PM – 8:00 PM", lines[6]);
    }

    #[test]
    fn always_open() {
        let hours = OpeningHours {
            periods: vec![period(0, "0000", None)],
            ..Default::default()
        };
        assert!(
            hours_to_text(&hours)
                .lines()
                .all(|l| l.ends_with(": Open 24 hours"))
        );
    }

    #[test]
    fn no_periods() {
        let text = hours_to_text(&OpeningHours::default());
        assert!(text.lines().all(|l| l.ends_with(": Closed")));
        assert!(text.starts_with("Monday: "));
    }
}
