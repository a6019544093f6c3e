//! Five-field cron expression parsing and evaluation.
//!
//! Supports the classic `minute hour day-of-month month day-of-week` format
//! with `*`, lists (`1,15`), ranges (`1-5`), and steps (`*/10`, `8-18/2`).
//! Day-of-week accepts 0-7, with both 0 and 7 meaning Sunday. As in classic
//! cron, when both day fields are restricted a date matching either fires.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Timelike};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CronExpr {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct Field {
    /// Set bit per allowed value, offset by the field's minimum.
    allowed: u64,
    any: bool,
}

#[derive(Debug, Eq, PartialEq)]
pub struct ParseError {
    pub expr: String,
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid cron expression '{}': {}", self.expr, self.reason)
    }
}

impl std::error::Error for ParseError {}

impl Field {
    fn parse(spec: &str, min: u32, max: u32) -> Result<Self, String> {
        let mut allowed = 0u64;
        let mut any = true;
        for part in spec.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("invalid step '{}'", step))?;
                    if step == 0 {
                        return Err("step must be positive".to_owned());
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else {
                any = false;
                match range.split_once('-') {
                    Some((start, end)) => {
                        let start: u32 = start
                            .parse()
                            .map_err(|_| format!("invalid value '{}'", start))?;
                        let end: u32 = end
                            .parse()
                            .map_err(|_| format!("invalid value '{}'", end))?;
                        (start, end)
                    }
                    None => {
                        let value: u32 = range
                            .parse()
                            .map_err(|_| format!("invalid value '{}'", range))?;
                        (value, value)
                    }
                }
            };

            if start < min || end > max || start > end {
                return Err(format!(
                    "value out of range, expected {}-{} in '{}'",
                    min, max, part
                ));
            }
            let mut value = start;
            while value <= end {
                allowed |= 1 << (value - min);
                value += step;
            }
        }
        // a stepped wildcard like */10 still restricts the field
        if spec.contains('/') {
            any = spec == "*/1";
        }
        Ok(Field { allowed, any })
    }

    fn matches(&self, value: u32, min: u32) -> bool {
        self.allowed & (1 << (value - min)) != 0
    }
}

impl CronExpr {
    /// Whether the expression fires in the minute containing `at`.
    pub fn matches(&self, at: chrono::DateTime<chrono::Utc>) -> bool {
        if !self.minutes.matches(at.minute(), 0)
            || !self.hours.matches(at.hour(), 0)
            || !self.months.matches(at.month(), 1)
        {
            return false;
        }
        let dom = self.days_of_month.matches(at.day(), 1);
        let dow = self
            .days_of_week
            .matches(at.weekday().num_days_from_sunday(), 0);
        match (self.days_of_month.any, self.days_of_week.any) {
            // both restricted: either day field matching fires
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }
}

impl FromStr for CronExpr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let error = |reason: String| ParseError {
            expr: s.to_owned(),
            reason,
        };
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(error(format!("expected 5 fields, found {}", fields.len())));
        }

        // 0 and 7 both mean Sunday in the day-of-week field
        let mut days_of_week = Field::parse(fields[4], 0, 7).map_err(&error)?;
        if days_of_week.allowed & (1 << 7) != 0 {
            days_of_week.allowed |= 1;
            days_of_week.allowed &= !(1u64 << 7);
        }

        Ok(CronExpr {
            source: s.to_owned(),
            minutes: Field::parse(fields[0], 0, 59).map_err(&error)?,
            hours: Field::parse(fields[1], 0, 23).map_err(&error)?,
            days_of_month: Field::parse(fields[2], 1, 31).map_err(&error)?,
            months: Field::parse(fields[3], 1, 12).map_err(&error)?,
            days_of_week,
        })
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn cron(s: &str) -> CronExpr {
        s.parse().unwrap()
    }

    #[test]
    fn every_minute() {
        let expr = cron("* * * * *");
        assert!(expr.matches(at(2024, 1, 1, 0, 0)));
        assert!(expr.matches(at(2024, 12, 31, 23, 59)));
    }

    #[test]
    fn fixed_time() {
        // daily warm-up at 03:30
        let expr = cron("30 3 * * *");
        assert!(expr.matches(at(2024, 6, 15, 3, 30)));
        assert!(!expr.matches(at(2024, 6, 15, 3, 31)));
        assert!(!expr.matches(at(2024, 6, 15, 4, 30)));
    }

    #[test]
    fn steps_and_ranges() {
        let expr = cron("*/15 8-18 * * *");
        assert!(expr.matches(at(2024, 6, 15, 8, 0)));
        assert!(expr.matches(at(2024, 6, 15, 18, 45)));
        assert!(!expr.matches(at(2024, 6, 15, 8, 5)));
        assert!(!expr.matches(at(2024, 6, 15, 19, 0)));

        let expr = cron("0 8-18/2 * * *");
        assert!(expr.matches(at(2024, 6, 15, 8, 0)));
        assert!(expr.matches(at(2024, 6, 15, 10, 0)));
        assert!(!expr.matches(at(2024, 6, 15, 9, 0)));
    }

    #[test]
    fn lists() {
        let expr = cron("0 9,17 * * 1,3,5");
        // 2024-06-17 is a Monday
        assert!(expr.matches(at(2024, 6, 17, 9, 0)));
        assert!(expr.matches(at(2024, 6, 19, 17, 0)));
        assert!(!expr.matches(at(2024, 6, 18, 9, 0)));
        assert!(!expr.matches(at(2024, 6, 17, 10, 0)));
    }

    #[test]
    fn day_of_week_sunday_aliases() {
        let sunday = at(2024, 6, 16, 12, 0);
        assert!(cron("0 12 * * 0").matches(sunday));
        assert!(cron("0 12 * * 7").matches(sunday));
        assert!(cron("0 12 * * 1-7").matches(sunday));
        assert!(!cron("0 12 * * 1").matches(sunday));
        assert!("0 12 * * 8".parse::<CronExpr>().is_err());
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // the 15th or a Monday
        let expr = cron("0 0 15 * 1");
        assert!(expr.matches(at(2024, 6, 15, 0, 0))); // Saturday the 15th
        assert!(expr.matches(at(2024, 6, 17, 0, 0))); // Monday the 17th
        assert!(!expr.matches(at(2024, 6, 18, 0, 0))); // Tuesday the 18th
    }

    #[test]
    fn monthly_on_first() {
        let expr = cron("0 0 1 * *");
        assert!(expr.matches(at(2024, 7, 1, 0, 0)));
        assert!(!expr.matches(at(2024, 7, 2, 0, 0)));
    }

    #[test]
    fn parse_errors() {
        assert!("* * * *".parse::<CronExpr>().is_err());
        assert!("* * * * * *".parse::<CronExpr>().is_err());
        assert!("60 * * * *".parse::<CronExpr>().is_err());
        assert!("* 24 * * *".parse::<CronExpr>().is_err());
        assert!("* * 0 * *".parse::<CronExpr>().is_err());
        assert!("* * * 13 *".parse::<CronExpr>().is_err());
        assert!("*/0 * * * *".parse::<CronExpr>().is_err());
        assert!("5-1 * * * *".parse::<CronExpr>().is_err());
        assert!("abc * * * *".parse::<CronExpr>().is_err());
    }

    #[test]
    fn display_keeps_source() {
        assert_eq!(cron("*/5 * * * *").to_string(), "*/5 * * * *");
    }
}
