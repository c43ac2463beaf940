//! Core record types and week-range handling for agtrack.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "agtrack-core";

/// Compact date format used in report titles and the `--from-week`/`--to-week` flags.
pub const WEEK_DATE_FORMAT: &str = "%Y%m%d";

/// Records written by the output stage expose a fixed column order shared by CSV and JSON.
pub trait TabularRecord: Serialize {
    const HEADERS: &'static [&'static str];
}

/// One candidate report found on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    title: String,
    detail_url: String,
    pdf_url: Option<String>,
    #[serde(with = "week_date")]
    week_start: Option<NaiveDate>,
    #[serde(with = "week_date")]
    week_end: Option<NaiveDate>,
}

impl ReportEntry {
    /// Builds an entry, inferring the reporting week from the title first and the links second.
    pub fn new(
        title: impl Into<String>,
        detail_url: impl Into<String>,
        pdf_url: Option<String>,
    ) -> Self {
        let title = title.into();
        let detail_url = detail_url.into();
        let week = parse_week_range(&title)
            .or_else(|| parse_week_range(&detail_url))
            .or_else(|| pdf_url.as_deref().and_then(parse_week_range));
        Self {
            title,
            detail_url,
            pdf_url,
            week_start: week.map(|(start, _)| start),
            week_end: week.map(|(_, end)| end),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn detail_url(&self) -> &str {
        &self.detail_url
    }

    pub fn pdf_url(&self) -> Option<&str> {
        self.pdf_url.as_deref()
    }

    pub fn week_start(&self) -> Option<NaiveDate> {
        self.week_start
    }

    pub fn week_end(&self) -> Option<NaiveDate> {
        self.week_end
    }

    /// Returns a copy pointing at a resolved PDF link. Week inference is kept from the
    /// listing unless the listing carried none.
    pub fn with_pdf_url(&self, pdf_url: impl Into<String>) -> Self {
        let pdf_url = pdf_url.into();
        let week = match (self.week_start, self.week_end) {
            (None, None) => parse_week_range(&pdf_url),
            (start, end) => start.zip(end).or(start.map(|s| (s, s))).or(end.map(|e| (e, e))),
        };
        Self {
            title: self.title.clone(),
            detail_url: self.detail_url.clone(),
            pdf_url: Some(pdf_url),
            week_start: week.map(|(start, _)| start),
            week_end: week.map(|(_, end)| end),
        }
    }
}

/// Where an entry sits relative to the requested week bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekPlacement {
    Within,
    /// Ends after the upper bound.
    Newer,
    /// Starts before the lower bound. Listings are newest-first, so nothing later can match.
    Older,
    Undated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeekBounds {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl WeekBounds {
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self { from, to }
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    pub fn place(&self, entry: &ReportEntry) -> WeekPlacement {
        let start = entry.week_start.or(entry.week_end);
        let end = entry.week_end.or(entry.week_start);
        let (Some(start), Some(end)) = (start, end) else {
            return if self.is_unbounded() {
                WeekPlacement::Within
            } else {
                WeekPlacement::Undated
            };
        };

        if self.from.is_some_and(|from| start < from) {
            return WeekPlacement::Older;
        }
        if self.to.is_some_and(|to| end > to) {
            return WeekPlacement::Newer;
        }
        WeekPlacement::Within
    }

    pub fn contains(&self, entry: &ReportEntry) -> bool {
        self.place(entry) == WeekPlacement::Within
    }
}

pub fn parse_week_date(value: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(value.trim(), WEEK_DATE_FORMAT)
}

/// Finds the first `YYYYMMDD-YYYYMMDD` span in free text.
pub fn parse_week_range(text: &str) -> Option<(NaiveDate, NaiveDate)> {
    static WEEK_RE: OnceLock<Regex> = OnceLock::new();
    let re = WEEK_RE.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9])(\d{8})\s*[-–—~～至到]\s*(\d{8})(?:[^0-9]|$)")
            .expect("week range pattern is valid")
    });

    re.captures_iter(text).find_map(|caps| {
        let start = parse_week_date(&caps[1]).ok()?;
        let end = parse_week_date(&caps[2]).ok()?;
        (start <= end).then_some((start, end))
    })
}

/// Silver inventory figures read from one weekly report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub title: String,
    pub pdf_url: String,
    #[serde(with = "week_date")]
    pub week_start: Option<NaiveDate>,
    #[serde(with = "week_date")]
    pub week_end: Option<NaiveDate>,
    pub last_week_inventory_kg: i64,
    pub weekly_change_kg: i64,
    pub this_week_inventory_kg: i64,
}

impl InventoryRecord {
    pub fn from_entry(
        entry: &ReportEntry,
        pdf_url: impl Into<String>,
        last_week_inventory_kg: i64,
        weekly_change_kg: i64,
        this_week_inventory_kg: i64,
    ) -> Self {
        Self {
            title: entry.title.clone(),
            pdf_url: pdf_url.into(),
            week_start: entry.week_start,
            week_end: entry.week_end,
            last_week_inventory_kg,
            weekly_change_kg,
            this_week_inventory_kg,
        }
    }
}

impl TabularRecord for InventoryRecord {
    const HEADERS: &'static [&'static str] = &[
        "title",
        "pdf_url",
        "week_start",
        "week_end",
        "last_week_inventory_kg",
        "weekly_change_kg",
        "this_week_inventory_kg",
    ];
}

/// Total silver futures open interest for one trading day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenInterestRecord {
    pub date: NaiveDate,
    pub total_open_interest: i64,
}

impl TabularRecord for OpenInterestRecord {
    const HEADERS: &'static [&'static str] = &["date", "total_open_interest"];
}

/// Monthly gold/silver withdrawal volumes from the exchange's monthly data highlights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub date: String,
    pub year: i32,
    pub month: u32,
    pub gold_withdrawal_kg: Option<f64>,
    pub silver_withdrawal_kg: Option<f64>,
    pub gold_withdrawal_ytd_kg: Option<f64>,
    pub silver_withdrawal_ytd_kg: Option<f64>,
    pub pdf_url: String,
}

impl TabularRecord for WithdrawalRecord {
    const HEADERS: &'static [&'static str] = &[
        "date",
        "year",
        "month",
        "gold_withdrawal_kg",
        "silver_withdrawal_kg",
        "gold_withdrawal_ytd_kg",
        "silver_withdrawal_ytd_kg",
        "pdf_url",
    ];
}

/// Serde adapter rendering optional dates as `YYYYMMDD`.
pub mod week_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::WEEK_DATE_FORMAT;

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDate>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => serializer.serialize_str(&date.format(WEEK_DATE_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDate>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => NaiveDate::parse_from_str(value, WEEK_DATE_FORMAT)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
