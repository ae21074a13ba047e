//! Maintenance windows. A window spec is either "always", "never", or a
//! semicolon-separated list of `days HH:MM-HH:MM` clauses, where days is a
//! range ("mon-fri") or list ("sat,sun"). Non-emergency DDL only applies
//! inside an open window.
use chrono::{
    DateTime,
    Datelike,
    Timelike,
    Utc,
    Weekday,
};
use errors::ErrorMetadata;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaintenanceWindows {
    clauses: Vec<Clause>,
    always: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Clause {
    days: Vec<Weekday>,
    start_minute: u32,
    end_minute: u32,
}

fn parse_weekday(s: &str) -> anyhow::Result<Weekday> {
    match s {
        "mon" => Ok(Weekday::Mon),
        "tue" => Ok(Weekday::Tue),
        "wed" => Ok(Weekday::Wed),
        "thu" => Ok(Weekday::Thu),
        "fri" => Ok(Weekday::Fri),
        "sat" => Ok(Weekday::Sat),
        "sun" => Ok(Weekday::Sun),
        other => anyhow::bail!(ErrorMetadata::malformed_schema(format!(
            "unknown weekday {other:?} in maintenance window"
        ))),
    }
}

fn parse_days(spec: &str) -> anyhow::Result<Vec<Weekday>> {
    if let Some((start, end)) = spec.split_once('-') {
        let start = parse_weekday(start)?;
        let end = parse_weekday(end)?;
        let mut days = Vec::new();
        let mut day = start;
        loop {
            days.push(day);
            if day == end {
                break;
            }
            day = day.succ();
            if days.len() > 7 {
                anyhow::bail!(ErrorMetadata::malformed_schema(
                    "weekday range does not terminate"
                ));
            }
        }
        return Ok(days);
    }
    spec.split(',').map(parse_weekday).collect()
}

fn parse_minute(s: &str) -> anyhow::Result<u32> {
    let (h, m) = s.split_once(':').ok_or_else(|| {
        anyhow::anyhow!(ErrorMetadata::malformed_schema(
            "window time must be HH:MM"
        ))
    })?;
    let hours: u32 = h.parse()?;
    let minutes: u32 = m.parse()?;
    if hours > 23 || minutes > 59 {
        anyhow::bail!(ErrorMetadata::malformed_schema("window time out of range"));
    }
    Ok(hours * 60 + minutes)
}

impl MaintenanceWindows {
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec.eq_ignore_ascii_case("always") {
            return Ok(Self {
                clauses: Vec::new(),
                always: true,
            });
        }
        if spec.eq_ignore_ascii_case("never") {
            return Ok(Self {
                clauses: Vec::new(),
                always: false,
            });
        }
        let mut clauses = Vec::new();
        for clause in spec.split(';').filter(|c| !c.trim().is_empty()) {
            let clause = clause.trim().to_ascii_lowercase();
            let (days, times) = clause.split_once(' ').ok_or_else(|| {
                anyhow::anyhow!(ErrorMetadata::malformed_schema(
                    "window clause must be '<days> <start>-<end>'"
                ))
            })?;
            let (start, end) = times.trim().split_once('-').ok_or_else(|| {
                anyhow::anyhow!(ErrorMetadata::malformed_schema(
                    "window times must be '<start>-<end>'"
                ))
            })?;
            clauses.push(Clause {
                days: parse_days(days)?,
                start_minute: parse_minute(start)?,
                end_minute: parse_minute(end)?,
            });
        }
        Ok(Self {
            clauses,
            always: false,
        })
    }

    pub fn from_knob() -> anyhow::Result<Self> {
        Self::parse(&common::knobs::MAINTENANCE_WINDOW)
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if self.always {
            return true;
        }
        let weekday = now.weekday();
        let minute = now.hour() * 60 + now.minute();
        self.clauses.iter().any(|clause| {
            clause.days.contains(&weekday)
                && minute >= clause.start_minute
                && minute < clause.end_minute
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{
        TimeZone,
        Utc,
    };

    use super::MaintenanceWindows;

    #[test]
    fn test_always_and_never() {
        let now = Utc::now();
        assert!(MaintenanceWindows::parse("always").unwrap().is_open(now));
        assert!(!MaintenanceWindows::parse("never").unwrap().is_open(now));
    }

    #[test]
    fn test_weekday_range_window() {
        let windows = MaintenanceWindows::parse("mon-fri 02:00-05:00").unwrap();
        // 2024-01-03 is a Wednesday.
        let inside = Utc.with_ymd_and_hms(2024, 1, 3, 3, 30, 0).unwrap();
        let outside_hours = Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap();
        let weekend = Utc.with_ymd_and_hms(2024, 1, 6, 3, 30, 0).unwrap();
        assert!(windows.is_open(inside));
        assert!(!windows.is_open(outside_hours));
        assert!(!windows.is_open(weekend));
    }

    #[test]
    fn test_day_list_and_multiple_clauses() {
        let windows =
            MaintenanceWindows::parse("mon-fri 02:00-05:00;sat,sun 00:00-06:00").unwrap();
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 1, 0, 0).unwrap();
        assert!(windows.is_open(saturday));
    }

    #[test]
    fn test_malformed_specs_are_rejected() {
        for bad in ["mon", "mon-fri", "mon-fri 9-17", "funday 02:00-05:00", "mon-fri 25:00-26:00"] {
            assert!(MaintenanceWindows::parse(bad).is_err(), "{bad}");
        }
    }
}
