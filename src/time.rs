//! Timestamp discovery and format translation.
//!
//! Parsers hand over a flat map of fields; somewhere in there is usually a
//! timestamp. The rules: an explicitly configured field/format wins, else we
//! scan a fixed list of candidate field names against a fixed list of
//! formats. Whatever field supplied the timestamp is removed from the map.
//! If nothing parses we fall back to the current wall clock, which is always
//! better than refusing the event.

use chrono::offset::LocalResult;
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::Map;
use serde_json::Value;

lazy_static! {
    /// Field names searched, in order, when no timestamp field is configured.
    static ref CANDIDATE_FIELDS: Vec<&'static str> = vec![
        "timestamp",
        "time",
        "datetime",
        "date",
        "Timestamp",
        "Time",
        "Datetime",
        "DateTime",
        "Date",
    ];

    /// Formats tried, in order, against string values. Zoned formats first,
    /// zoneless ones resolve against the configured location.
    static ref ZONED_FORMATS: Vec<&'static str> = vec![
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%d %H:%M:%S%.f %z",
        "%a %b %d %H:%M:%S%.f %z %Y",
        "%d/%b/%Y:%H:%M:%S %z",
    ];

    static ref NAIVE_FORMATS: Vec<&'static str> = vec![
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];

    // "12:34:56,789" styles; the comma plays the part of the decimal point
    static ref COMMA_FRACTION: Regex = Regex::new(r"(\d{2}),(\d{1,9})").expect("static regex");
}

/// Zone assumed for timestamps that do not carry one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeLocation {
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl TimeLocation {
    fn resolve(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        let resolved = match *self {
            TimeLocation::Utc => return Some(Utc.from_utc_datetime(&naive)),
            TimeLocation::Local => Local.from_local_datetime(&naive).map(|dt| dt.with_timezone(&Utc)),
            TimeLocation::Fixed(off) => off.from_local_datetime(&naive).map(|dt| dt.with_timezone(&Utc)),
        };
        match resolved {
            LocalResult::Single(dt) => Some(dt),
            LocalResult::Ambiguous(dt, _) => Some(dt),
            LocalResult::None => None,
        }
    }
}

impl Default for TimeLocation {
    fn default() -> TimeLocation {
        TimeLocation::Utc
    }
}

/// Translate a strftime-style format into the dialect `chrono` parses.
///
/// The dialects are near-identical; the one real difference is fractional
/// seconds, where `%f` means "digits after an explicit separator". We fold a
/// preceding `.` or `,` into chrono's `%.f`, which consumes its own leading
/// dot. Unknown specifiers pass through untouched so chrono can reject them
/// with a better message than we could produce here.
pub fn convert_time_format(format: &str) -> String {
    let mut out = String::with_capacity(format.len() + 4);
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('f') => {
                let last = out.chars().last();
                if last == Some('.') || last == Some(',') {
                    out.pop();
                }
                out.push_str("%.f");
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Find and remove the timestamp in `data`.
///
/// `field`/`format` are the configured overrides, already translated by
/// `convert_time_format` at config load. The field that supplied the
/// timestamp is deleted from `data`; when nothing parses the current wall
/// clock is returned and `data` is left alone.
pub fn get_timestamp(
    data: &mut Map<String, Value>,
    field: Option<&str>,
    format: Option<&str>,
    loc: TimeLocation,
) -> DateTime<Utc> {
    if let Some(name) = field {
        if let Some(val) = data.get(name) {
            if let Some(ts) = parse_value(val, format, loc) {
                data.remove(name);
                return ts;
            }
            debug!("configured time field {:?} did not parse: {:?}", name, val);
        }
        return now();
    }
    for name in CANDIDATE_FIELDS.iter() {
        let parsed = match data.get(*name) {
            Some(val) => parse_value(val, None, loc),
            None => None,
        };
        if let Some(ts) = parsed {
            data.remove(*name);
            return ts;
        }
    }
    now()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

fn parse_value(val: &Value, format: Option<&str>, loc: TimeLocation) -> Option<DateTime<Utc>> {
    match *val {
        Value::String(ref s) => parse_str(s, format, loc),
        Value::Number(ref n) => {
            if let Some(i) = n.as_i64() {
                Some(from_epoch_int(i))
            } else {
                n.as_f64().and_then(from_epoch_float)
            }
        }
        _ => None,
    }
}

fn parse_str(raw: &str, format: Option<&str>, loc: TimeLocation) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let s = COMMA_FRACTION.replace(trimmed, "$1.$2").into_owned();

    if let Some(fmt) = format {
        return parse_with_format(&s, fmt, loc);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ZONED_FORMATS.iter() {
        if let Ok(dt) = DateTime::parse_from_str(&s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    // "2014-04-10 19:57:38.123 -0800 PST" styles: drop the trailing zone
    // abbreviation, the numeric offset is authoritative anyway
    if let Some(stripped) = strip_zone_name(&s) {
        for fmt in ZONED_FORMATS.iter() {
            if let Ok(dt) = DateTime::parse_from_str(stripped, fmt) {
                return Some(dt.with_timezone(&Utc));
            }
        }
    }
    for fmt in NAIVE_FORMATS.iter() {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&s, fmt) {
            if let Some(dt) = loc.resolve(naive) {
                return Some(dt);
            }
        }
    }
    parse_epoch_str(&s)
}

fn parse_with_format(s: &str, fmt: &str, loc: TimeLocation) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
        return loc.resolve(naive);
    }
    parse_epoch_str(s)
}

fn strip_zone_name(s: &str) -> Option<&str> {
    let idx = s.rfind(' ')?;
    let tail = &s[idx + 1..];
    if !tail.is_empty() && tail.len() <= 5 && tail.chars().all(|c| c.is_ascii_uppercase()) {
        Some(s[..idx].trim_end())
    } else {
        None
    }
}

fn parse_epoch_str(s: &str) -> Option<DateTime<Utc>> {
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse::<i64>().ok().map(from_epoch_int);
    }
    let mut parts = s.splitn(2, '.');
    let secs = parts.next()?;
    let frac = parts.next()?;
    if secs.chars().all(|c| c.is_ascii_digit()) && frac.chars().all(|c| c.is_ascii_digit()) {
        return s.parse::<f64>().ok().and_then(from_epoch_float);
    }
    None
}

/// An integer is "clearly milliseconds" once it is too large to be a
/// plausible number of seconds (roughly the year 33658).
fn from_epoch_int(i: i64) -> DateTime<Utc> {
    if i >= 1_000_000_000_000 {
        Utc.timestamp_millis_opt(i)
            .single()
            .unwrap_or_else(Utc::now)
    } else {
        Utc.timestamp_opt(i, 0).single().unwrap_or_else(Utc::now)
    }
}

fn from_epoch_float(f: f64) -> Option<DateTime<Utc>> {
    if !f.is_finite() || f < 0.0 {
        return None;
    }
    let secs = f.trunc() as i64;
    let nanos = ((f - f.trunc()) * 1e9).round() as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

#[cfg(test)]
mod test {
    extern crate quickcheck;

    use self::quickcheck::{QuickCheck, TestResult};
    use super::*;
    use serde_json::Map;

    fn parse(s: &str) -> Option<DateTime<Utc>> {
        parse_str(s, None, TimeLocation::Utc)
    }

    #[test]
    fn test_convert_fractional_seconds() {
        assert_eq!(convert_time_format("%H:%M:%S.%f"), "%H:%M:%S%.f");
        assert_eq!(convert_time_format("%H:%M:%S,%f"), "%H:%M:%S%.f");
        assert_eq!(convert_time_format("%Y-%m-%d %H:%M:%S"), "%Y-%m-%d %H:%M:%S");
    }

    #[test]
    fn test_convert_is_identity_without_fraction() {
        fn inner(s: String) -> TestResult {
            if s.contains('%') {
                return TestResult::discard();
            }
            TestResult::from_bool(convert_time_format(&s) == s)
        }
        QuickCheck::new().quickcheck(inner as fn(String) -> TestResult);
    }

    #[test]
    fn test_convert_is_idempotent() {
        fn inner(s: String) -> bool {
            let once = convert_time_format(&s);
            convert_time_format(&once) == once
        }
        QuickCheck::new().quickcheck(inner as fn(String) -> bool);
    }

    #[test]
    fn test_rfc3339_with_and_without_fraction() {
        let a = parse("2014-04-10T19:57:38.123456789-08:00").unwrap();
        assert_eq!(a.timestamp(), 1397188658);
        assert_eq!(a.timestamp_subsec_nanos(), 123456789);
        let b = parse("2014-04-10T19:57:38Z").unwrap();
        assert_eq!(b.timestamp(), 1397159858);
    }

    #[test]
    fn test_zone_name_suffix_is_ignored() {
        let dt = parse("2014-04-10 19:57:38.123456789 -0800 PST").unwrap();
        assert_eq!(dt.timestamp(), 1397188658);
    }

    #[test]
    fn test_epoch_seconds_and_millis() {
        assert_eq!(parse("1440116565").unwrap().timestamp(), 1440116565);
        let frac = parse("1440116565.123").unwrap();
        assert_eq!(frac.timestamp(), 1440116565);
        assert!((frac.timestamp_subsec_millis() as i64 - 123).abs() <= 1);
        let millis = parse("1538860697500").unwrap();
        assert_eq!(millis.timestamp(), 1538860697);
        assert_eq!(millis.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_comma_fraction_is_a_period() {
        let a = parse("2014-07-30 07:02:15,250").unwrap();
        let b = parse("2014-07-30 07:02:15.250").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_naive_resolution_against_fixed_offset() {
        let off = FixedOffset::west_opt(7 * 3600).unwrap();
        let dt = parse_str("2014-07-30 07:02", None, TimeLocation::Fixed(off)).unwrap();
        assert_eq!(dt.timestamp(), 1406728920);
    }

    #[test]
    fn test_candidate_scan_removes_field() {
        let mut data = Map::new();
        data.insert("time".to_string(), json!("2014-04-10T19:57:38Z"));
        data.insert("status".to_string(), json!(200));
        let ts = get_timestamp(&mut data, None, None, TimeLocation::Utc);
        assert_eq!(ts.timestamp(), 1397159858);
        assert!(!data.contains_key("time"));
        assert!(data.contains_key("status"));
    }

    #[test]
    fn test_configured_field_wins() {
        let mut data = Map::new();
        data.insert("time".to_string(), json!("2014-04-10T19:57:38Z"));
        data.insert("when".to_string(), json!(1440116565));
        let ts = get_timestamp(&mut data, Some("when"), None, TimeLocation::Utc);
        assert_eq!(ts.timestamp(), 1440116565);
        assert!(data.contains_key("time"));
        assert!(!data.contains_key("when"));
    }

    #[test]
    fn test_unparsable_falls_back_to_now() {
        let mut data = Map::new();
        data.insert("time".to_string(), json!("not a time"));
        let before = Utc::now();
        let ts = get_timestamp(&mut data, None, None, TimeLocation::Utc);
        assert!(ts >= before);
        assert!(data.contains_key("time"));
    }
}
