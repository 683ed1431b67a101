//! Query parameters: entity filters, time ranges and pagination.
//!
//! Syntax accepted from callers:
//!
//! - filter: comma-separated clauses, `rating:LO..HI` and `date:LO..HI`
//! - range: `LO..HI`; either bound may be omitted, both are inclusive
//! - page token: opaque string returned as `next_page`

use serde::Serialize;
use snafu::prelude::*;

use crate::{
    model::TimeKey,
    query::{EntitySummary, QueryError, ValidationSnafu},
};

/// Page size used when the caller does not pass one.
pub const DEFAULT_PAGE_SIZE: usize = 50;
/// Largest accepted page size.
pub const MAX_PAGE_SIZE: usize = 500;

fn invalid<T>(field: &'static str, detail: impl Into<String>) -> Result<T, QueryError> {
    ValidationSnafu {
        field,
        detail: detail.into(),
    }
    .fail()
}

/// Split `LO..HI` into its optional bounds and parse each one.
fn parse_bounds<T, F>(
    field: &'static str,
    raw: &str,
    parse: F,
) -> Result<(Option<T>, Option<T>), QueryError>
where
    T: PartialOrd,
    F: Fn(&str) -> Option<T>,
{
    let Some((lo, hi)) = raw.trim().split_once("..") else {
        return invalid(field, format!("expected LO..HI, got {raw:?}"));
    };
    let bound = |s: &str| -> Result<Option<T>, QueryError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        match parse(s) {
            Some(v) => Ok(Some(v)),
            None => invalid(field, format!("cannot parse bound {s:?}")),
        }
    };
    let (lo, hi) = (bound(lo)?, bound(hi)?);
    if let (Some(l), Some(h)) = (&lo, &hi)
        && l > h
    {
        return invalid(field, "lower bound is above upper bound");
    }
    Ok((lo, hi))
}

fn parse_time(s: &str) -> Option<TimeKey> {
    TimeKey::parse(s).ok()
}

fn parse_rating(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Inclusive time range; unbounded sides are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowRange {
    /// Lower bound.
    pub from: Option<TimeKey>,
    /// Upper bound.
    pub to: Option<TimeKey>,
}

impl WindowRange {
    /// Range covering all time.
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse `LO..HI`.
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        let (from, to) = parse_bounds("window", raw, parse_time)?;
        Ok(Self { from, to })
    }
}

/// Predicates applied to entity summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntityFilter {
    /// Minimum mean rating.
    pub rating_min: Option<f64>,
    /// Maximum mean rating.
    pub rating_max: Option<f64>,
    /// Activity interval must reach this instant or later.
    pub from: Option<TimeKey>,
    /// Activity interval must start at this instant or earlier.
    pub to: Option<TimeKey>,
}

impl EntityFilter {
    /// Parse `rating:LO..HI,date:LO..HI`. An empty string matches everything.
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        let mut filter = EntityFilter::default();
        let (mut seen_rating, mut seen_date) = (false, false);

        for clause in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let Some((key, range)) = clause.split_once(':') else {
                return invalid("filter", format!("clause {clause:?} has no ':'"));
            };
            match key.trim() {
                "rating" if !seen_rating => {
                    (filter.rating_min, filter.rating_max) =
                        parse_bounds("filter", range, parse_rating)?;
                    seen_rating = true;
                }
                "date" if !seen_date => {
                    (filter.from, filter.to) = parse_bounds("filter", range, parse_time)?;
                    seen_date = true;
                }
                "rating" | "date" => {
                    return invalid("filter", format!("clause {key:?} given twice"));
                }
                other => return invalid("filter", format!("unknown filter key {other:?}")),
            }
        }
        Ok(filter)
    }

    /// Whether `summary` passes every predicate.
    pub fn matches(&self, summary: &EntitySummary) -> bool {
        let m = summary.mean_rating;
        self.rating_min.is_none_or(|lo| m >= lo)
            && self.rating_max.is_none_or(|hi| m <= hi)
            && self.from.is_none_or(|from| summary.last_ts >= from)
            && self.to.is_none_or(|to| summary.first_ts <= to)
    }
}

/// Which page of a listing to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Maximum items on the page.
    pub size: usize,
    /// Return only keys strictly after this one.
    pub after: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            size: DEFAULT_PAGE_SIZE,
            after: None,
        }
    }
}

impl PageRequest {
    /// First page of `size` items.
    pub fn first(size: usize) -> Result<Self, QueryError> {
        ensure!(
            (1..=MAX_PAGE_SIZE).contains(&size),
            ValidationSnafu {
                field: "limit",
                detail: format!("page size must be between 1 and {MAX_PAGE_SIZE}, got {size}"),
            }
        );
        Ok(Self { size, after: None })
    }

    /// Build from raw `limit` and `page` query parameters.
    pub fn from_params(limit: Option<&str>, page: Option<&str>) -> Result<Self, QueryError> {
        let size = match limit {
            None => DEFAULT_PAGE_SIZE,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(size) => size,
                Err(_) => return invalid("limit", format!("{raw:?} is not a page size")),
            },
        };
        let mut req = Self::first(size)?;
        req.after = page.map(decode_token).transpose()?;
        Ok(req)
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// Items in key order.
    pub items: Vec<T>,
    /// Token for the following page; `None` on the last page.
    pub next_page: Option<String>,
}

/// Token that resumes a listing after `key`.
pub fn encode_token(key: &str) -> String {
    key.bytes().map(|b| format!("{b:02x}")).collect()
}

/// Inverse of [`encode_token`].
pub fn decode_token(token: &str) -> Result<String, QueryError> {
    let bad = || invalid::<String>("page", format!("malformed page token {token:?}"));
    if token.is_empty() || token.len() % 2 != 0 || !token.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return bad();
    }
    let mut bytes = Vec::with_capacity(token.len() / 2);
    for pair in token.as_bytes().chunks(2) {
        let digits = std::str::from_utf8(pair).unwrap_or_default();
        match u8::from_str_radix(digits, 16) {
            Ok(b) => bytes.push(b),
            Err(_) => return bad(),
        }
    }
    String::from_utf8(bytes).or_else(|_| bad())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(mean: f64, first: i64, last: i64) -> EntitySummary {
        EntitySummary {
            entity: "A".to_string(),
            name: "A".to_string(),
            record_count: 1,
            mean_rating: mean,
            first_ts: TimeKey::from_secs(first).expect("key"),
            last_ts: TimeKey::from_secs(last).expect("key"),
            latest_rating: mean,
            latest_sentiment: 0.0,
            latest_rolling_mean: None,
            latest_rolling_sentiment: None,
        }
    }

    #[test]
    fn parses_rating_and_date_clauses() -> Result<(), QueryError> {
        let f = EntityFilter::parse("rating:3.5..5, date:2024-01-01..")?;
        assert_eq!(f.rating_min, Some(3.5));
        assert_eq!(f.rating_max, Some(5.0));
        assert_eq!(f.from, Some(TimeKey::parse("2024-01-01").expect("date")));
        assert_eq!(f.to, None);
        assert_eq!(EntityFilter::parse("")?, EntityFilter::default());
        Ok(())
    }

    #[test]
    fn rejects_malformed_filters() {
        for raw in [
            "rating",
            "rating:5",
            "rating:5..1",
            "rating:a..b",
            "colour:1..2",
            "rating:1..2,rating:2..3",
            "date:2024-02-01..2024-01-01",
        ] {
            let err = EntityFilter::parse(raw).expect_err(raw);
            assert!(matches!(err, QueryError::Validation { .. }), "{raw}");
        }
    }

    #[test]
    fn matching_uses_mean_and_activity_interval() -> Result<(), QueryError> {
        let s = summary(4.0, 10, 20);
        assert!(EntityFilter::parse("rating:4..4")?.matches(&s));
        assert!(!EntityFilter::parse("rating:..3.9")?.matches(&s));
        assert!(EntityFilter::parse("date:20..")?.matches(&s));
        assert!(EntityFilter::parse("date:..10")?.matches(&s));
        assert!(!EntityFilter::parse("date:21..30")?.matches(&s));
        Ok(())
    }

    #[test]
    fn window_range_bounds_are_optional() -> Result<(), QueryError> {
        assert_eq!(WindowRange::parse("..")?, WindowRange::all());
        let r = WindowRange::parse("1..2")?;
        assert_eq!(r.from.map(|k| k.as_millis()), Some(1_000));
        assert!(WindowRange::parse("2").is_err());
        Ok(())
    }

    #[test]
    fn page_size_limits() {
        assert_eq!(
            PageRequest::from_params(None, None).expect("default").size,
            DEFAULT_PAGE_SIZE
        );
        assert!(PageRequest::from_params(Some("0"), None).is_err());
        assert!(PageRequest::from_params(Some("501"), None).is_err());
        assert!(PageRequest::from_params(Some("-1"), None).is_err());
        assert!(PageRequest::from_params(Some("500"), None).is_ok());
    }

    #[test]
    fn tokens_round_trip_and_reject_garbage() -> Result<(), QueryError> {
        let token = encode_token("P-ä1");
        assert_eq!(decode_token(&token)?, "P-ä1");
        for bad in ["", "abc", "zz", "ff"] {
            assert!(decode_token(bad).is_err(), "{bad}");
        }
        Ok(())
    }
}
