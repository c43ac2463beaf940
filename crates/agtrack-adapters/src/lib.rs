//! Source adapters: listing/detail HTML parsing plus document extractors for the
//! exchange reports and daily data files.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use agtrack_core::ReportEntry;
use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "agtrack-adapters";

pub const SGE_WEEKLY_LISTING_URL: &str = "https://www.sge.com.cn/sjzx/hqzb";
pub const SGE_MONTHLY_LOAD_URL: &str = "https://en.sge.com.cn/data_MonthlyReport_load";
pub const SHFE_BASE_URL: &str = "https://www.shfe.com.cn";
pub const SHFE_REFERER: &str = "https://www.shfe.com.cn/eng/reports/StatisticalData/DailyData/";

pub const SILVER_INVENTORY_TABLE: &str = "上交所交收库白银库存周度数据";
pub const SILVER_ROW_LABEL: &str = "白银";
pub const SHFE_SILVER_PRODUCT_ID: &str = "ag_f";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid url {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Why a document produced no figures. Callers skip the item and log the variant.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unreadable document {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
    #[error("table {0:?} not found")]
    TableNotFound(String),
    #[error("row {0:?} not found")]
    RowNotFound(String),
    #[error("value missing in column {column}")]
    MissingValue { column: &'static str },
    #[error("cannot read {raw:?} as a number in column {column}")]
    InvalidNumber { column: &'static str, raw: String },
    #[error("malformed payload: {0}")]
    Payload(String),
}

impl ExtractError {
    /// True when the document itself could not be read, as opposed to lacking the target data.
    pub fn is_unreadable(&self) -> bool {
        matches!(self, ExtractError::Unreadable { .. })
    }
}

/// Entries found on one listing page plus any page-count hint the index advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub entries: Vec<ReportEntry>,
    pub total_pages: Option<usize>,
}

/// A paginated report index. Fetching is left to the caller; adapters only parse.
pub trait ReportSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// URL of the 1-based listing page `page`.
    fn listing_url(&self, page: usize) -> String;

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<ListingPage, AdapterError>;

    /// PDF links on an entry's detail page. Defaults to the first one only.
    fn parse_detail(&self, html: &str, page_url: &str) -> Result<Vec<String>, AdapterError> {
        Ok(first_pdf_link(html, page_url)?.into_iter().collect())
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: &ElementRef<'_>) -> Option<String> {
    text_or_none(collapse_whitespace(&element.text().collect::<Vec<_>>().join(" ")))
}

/// Joins `href` onto `base`, keeping only http(s) results.
fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let joined = base.join(href).ok()?;
    matches!(joined.scheme(), "http" | "https").then_some(joined)
}

fn parse_base(page_url: &str) -> Result<Url, AdapterError> {
    Url::parse(page_url).map_err(|source| AdapterError::Url {
        url: page_url.to_string(),
        source,
    })
}

fn is_pdf_link(url: &Url) -> bool {
    url.as_str().to_ascii_lowercase().contains(".pdf")
}

fn last_path_segment(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .and_then(|s| {
            let decoded = urlencoding::decode(&s).map(|d| d.into_owned()).unwrap_or(s);
            text_or_none(decoded)
        })
}

/// Every PDF reference on a page in document order: anchors first, then embedded viewers.
pub fn pdf_links(html: &str, page_url: &str) -> Result<Vec<String>, AdapterError> {
    let base = parse_base(page_url)?;
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    let anchors = selector("a[href]")?;
    let anchor_urls = document
        .select(&anchors)
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| resolve_link(&base, href));

    let embeds = selector("iframe[src], embed[src], object[data]")?;
    let embed_urls = document
        .select(&embeds)
        .filter_map(|node| node.value().attr("src").or_else(|| node.value().attr("data")))
        .filter_map(|href| resolve_link(&base, href));

    for url in anchor_urls.chain(embed_urls) {
        if is_pdf_link(&url) && seen.insert(url.to_string()) {
            links.push(url.to_string());
        }
    }
    Ok(links)
}

pub fn first_pdf_link(html: &str, page_url: &str) -> Result<Option<String>, AdapterError> {
    Ok(pdf_links(html, page_url)?.into_iter().next())
}

/// Reads a `totalPage = N` marker from inline pagination scripts.
pub fn total_pages_hint(html: &str) -> Option<usize> {
    static TOTAL_RE: OnceLock<Regex> = OnceLock::new();
    let re = TOTAL_RE.get_or_init(|| Regex::new(r"totalPage\s*=\s*(\d+)").expect("valid pattern"));
    re.captures(html).and_then(|caps| caps[1].parse().ok())
}

fn append_page_param(base: &str, page: usize) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}p={page}")
}

/// Weekly market report index (Chinese site). Newest reports come first.
#[derive(Debug, Clone)]
pub struct SgeWeeklyReports {
    start_url: String,
}

impl SgeWeeklyReports {
    pub fn new(start_url: impl Into<String>) -> Self {
        Self {
            start_url: start_url.into(),
        }
    }
}

impl Default for SgeWeeklyReports {
    fn default() -> Self {
        Self::new(SGE_WEEKLY_LISTING_URL)
    }
}

impl ReportSource for SgeWeeklyReports {
    fn source_id(&self) -> &'static str {
        "sge-weekly"
    }

    fn listing_url(&self, page: usize) -> String {
        if page <= 1 {
            self.start_url.clone()
        } else {
            append_page_param(&self.start_url, page)
        }
    }

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<ListingPage, AdapterError> {
        let base = parse_base(page_url)?;
        let document = Html::parse_document(html);
        let anchors = selector("a[href]")?;

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for anchor in document.select(&anchors) {
            let Some(url) = anchor.value().attr("href").and_then(|h| resolve_link(&base, h)) else {
                continue;
            };
            let title = element_text(&anchor)
                .or_else(|| anchor.value().attr("title").and_then(|t| text_or_none(t.to_string())))
                .or_else(|| last_path_segment(&url))
                .unwrap_or_default();

            let pdf = is_pdf_link(&url);
            let dated = agtrack_core::parse_week_range(&title).is_some()
                || agtrack_core::parse_week_range(url.as_str()).is_some();
            if !pdf && !dated {
                continue;
            }
            if !seen.insert(url.to_string()) {
                continue;
            }

            let link = url.to_string();
            entries.push(ReportEntry::new(title, link.clone(), pdf.then_some(link)));
        }

        Ok(ListingPage {
            entries,
            total_pages: total_pages_hint(html),
        })
    }
}

/// Monthly "Data Highlights" index on the English site, served through a `_load` endpoint.
#[derive(Debug, Clone)]
pub struct SgeMonthlyReports {
    load_url: String,
}

impl SgeMonthlyReports {
    pub fn new(load_url: impl Into<String>) -> Self {
        Self {
            load_url: load_url.into(),
        }
    }
}

impl Default for SgeMonthlyReports {
    fn default() -> Self {
        Self::new(SGE_MONTHLY_LOAD_URL)
    }
}

impl ReportSource for SgeMonthlyReports {
    fn source_id(&self) -> &'static str {
        "sge-monthly"
    }

    fn listing_url(&self, page: usize) -> String {
        append_page_param(&self.load_url, page.max(1))
    }

    /// Older articles attach several PDFs; all of them are candidates.
    fn parse_detail(&self, html: &str, page_url: &str) -> Result<Vec<String>, AdapterError> {
        pdf_links(html, page_url)
    }

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<ListingPage, AdapterError> {
        static ARTICLE_RE: OnceLock<Regex> = OnceLock::new();
        let article_re = ARTICLE_RE
            .get_or_init(|| Regex::new(r"/data_MonthlyReport/\d+").expect("valid pattern"));

        let base = parse_base(page_url)?;
        let document = Html::parse_document(html);
        let anchors = selector("a[href]")?;
        let title_span = selector("span.txt")?;

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for anchor in document.select(&anchors) {
            let Some(url) = anchor.value().attr("href").and_then(|h| resolve_link(&base, h)) else {
                continue;
            };

            if is_pdf_link(&url) {
                if seen.insert(url.to_string()) {
                    let title = element_text(&anchor)
                        .or_else(|| last_path_segment(&url))
                        .unwrap_or_default();
                    let link = url.to_string();
                    entries.push(ReportEntry::new(title, link.clone(), Some(link)));
                }
                continue;
            }

            if !article_re.is_match(url.path()) {
                continue;
            }
            let title = anchor
                .select(&title_span)
                .next()
                .and_then(|span| element_text(&span))
                .or_else(|| element_text(&anchor))
                .unwrap_or_default();
            if !title.contains("Monthly Report") && !title.contains("Data Highlights") {
                continue;
            }
            if seen.insert(url.to_string()) {
                entries.push(ReportEntry::new(title, url.to_string(), None));
            }
        }

        Ok(ListingPage {
            entries,
            total_pages: None,
        })
    }
}

/// Named table and row label the inventory extractor looks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub header: String,
    pub row_label: String,
}

impl Default for TableTarget {
    fn default() -> Self {
        Self {
            header: SILVER_INVENTORY_TABLE.to_string(),
            row_label: SILVER_ROW_LABEL.to_string(),
        }
    }
}

/// The three cells of the target row, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFigures {
    pub last_week_kg: i64,
    pub weekly_change_kg: i64,
    pub this_week_kg: i64,
}

const INVENTORY_COLUMNS: [&str; 3] = [
    "last_week_inventory_kg",
    "weekly_change_kg",
    "this_week_inventory_kg",
];

fn is_cell_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, '|' | '│' | '┃')
}

fn tokenize_cells(text: &str) -> impl Iterator<Item = &str> {
    text.split(is_cell_separator).filter(|t| !t.is_empty())
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn is_dash(c: char) -> bool {
    matches!(c, '-' | '—' | '–' | '－' | '−' | '―' | '/')
}

/// Normalizes one numeric cell to whole kilograms.
///
/// Returns `Ok(None)` for dash placeholders: the figure is absent, not zero.
pub fn parse_kg_cell(raw: &str) -> Result<Option<i64>, String> {
    static NUMBER_RE: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER_RE
        .get_or_init(|| Regex::new(r"^[+-]?[0-9]+(?:\.[0-9]+)?$").expect("valid pattern"));

    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().all(is_dash) {
        return Ok(None);
    }

    let cleaned: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ',' | '，' | '_'))
        .map(|c| if matches!(c, '−' | '－') { '-' } else { c })
        .collect();
    if !re.is_match(&cleaned) {
        return Err(trimmed.to_string());
    }

    if cleaned.contains('.') {
        let value: f64 = cleaned.parse().map_err(|_| trimmed.to_string())?;
        Ok(Some(value.round() as i64))
    } else {
        cleaned.parse::<i64>().map(Some).map_err(|_| trimmed.to_string())
    }
}

/// Table text read after the header before the row search gives up, in characters.
const TABLE_SECTION_CHARS: usize = 3000;

const TABLE_TITLE_SUFFIXES: [&str; 7] = ["数据", "情况", "统计", "汇总", "一览", "概况", "报表"];

/// A digit-free caption line such as `上海金交易所成交情况`.
fn is_table_title(line: &str) -> bool {
    let compact = strip_whitespace(line);
    compact.chars().count() >= 4
        && !compact.chars().any(|c| c.is_ascii_digit())
        && TABLE_TITLE_SUFFIXES.iter().any(|suffix| compact.ends_with(suffix))
}

/// Byte offset just past `needle` in `haystack`, ignoring whitespace in the haystack.
/// `needle` must be whitespace-free.
fn find_end_ignoring_whitespace(haystack: &str, needle: &str) -> Option<usize> {
    let first = needle.chars().next()?;
    for (start, ch) in haystack.char_indices() {
        if ch != first {
            continue;
        }
        let mut wanted = needle.chars().peekable();
        for (offset, c) in haystack[start..].char_indices() {
            if c.is_whitespace() {
                continue;
            }
            match wanted.next() {
                Some(w) if w == c => {
                    if wanted.peek().is_none() {
                        return Some(start + offset + c.len_utf8());
                    }
                }
                _ => break,
            }
        }
    }
    None
}

/// Appends `text` line by line; returns false once another table's caption shows up.
fn push_until_next_table(section: &mut String, text: &str) -> bool {
    for line in text.lines() {
        if is_table_title(line) {
            return false;
        }
        section.push_str(line);
        section.push('\n');
    }
    true
}

fn has_numeric_cell(text: &str) -> bool {
    tokenize_cells(text).any(|token| matches!(parse_kg_cell(token), Ok(Some(_))))
}

/// Text of the target table, from just after its header up to the next table caption.
///
/// The following page is only read when the header closes its page before any figures.
fn table_section(pages: &[String], needle: &str) -> Option<String> {
    let page_idx = pages
        .iter()
        .position(|page| strip_whitespace(page).contains(needle))?;
    let page = &pages[page_idx];
    let body_start = find_end_ignoring_whitespace(page, needle)?;

    let mut section = String::new();
    let open = push_until_next_table(&mut section, &page[body_start..]);
    if open && !has_numeric_cell(&section) {
        if let Some(next) = pages.get(page_idx + 1) {
            push_until_next_table(&mut section, next);
        }
    }
    Some(section.chars().take(TABLE_SECTION_CHARS).collect())
}

/// Locates the target table across page texts and reads the target row's three cells.
///
/// Rows split over several text lines are handled because cells are read from the
/// token stream that follows the table header, not from a single line. The row is
/// only searched for inside the target table, never in later tables.
pub fn extract_inventory(
    pages: &[String],
    target: &TableTarget,
) -> Result<InventoryFigures, ExtractError> {
    let needle = strip_whitespace(&target.header);
    let Some(section) = table_section(pages, &needle) else {
        return Err(ExtractError::TableNotFound(target.header.clone()));
    };

    let tokens: Vec<&str> = tokenize_cells(&section).collect();
    let Some(label_idx) = tokens.iter().position(|t| *t == target.row_label) else {
        return Err(ExtractError::RowNotFound(target.row_label.clone()));
    };

    let mut values = [0i64; 3];
    for (slot, &column) in INVENTORY_COLUMNS.iter().enumerate() {
        let Some(raw) = tokens.get(label_idx + 1 + slot) else {
            return Err(ExtractError::MissingValue { column });
        };
        match parse_kg_cell(raw) {
            Ok(Some(value)) => values[slot] = value,
            Ok(None) => return Err(ExtractError::MissingValue { column }),
            // A non-numeric token here is the next row's label: the cell was blank.
            Err(raw) if !raw.chars().any(|c| c.is_ascii_digit()) => {
                return Err(ExtractError::MissingValue { column })
            }
            Err(raw) => return Err(ExtractError::InvalidNumber { column, raw }),
        }
    }

    Ok(InventoryFigures {
        last_week_kg: values[0],
        weekly_change_kg: values[1],
        this_week_kg: values[2],
    })
}

/// Text layer of a downloaded document, one string per page.
pub trait DocumentText: Send + Sync {
    fn page_texts(&self, path: &Path) -> Result<Vec<String>, ExtractError>;

    /// Page text rebuilt from glyph positions, for documents whose text objects do not
    /// follow reading order. Defaults to the plain text layer.
    fn positioned_page_texts(&self, path: &Path) -> Result<Vec<String>, ExtractError> {
        self.page_texts(path)
    }
}

/// One positioned character; `top` grows downwards from the top of the page.
#[derive(Debug, Clone, PartialEq)]
pub struct Glyph {
    pub text: String,
    pub x0: f64,
    pub x1: f64,
    pub top: f64,
}

/// Rebuilds text lines from positioned glyphs.
///
/// Glyphs sharing a rounded `top` form a line, ordered left to right. A space goes
/// wherever the horizontal gap exceeds 1.5x the line's median gap (at least 2pt).
pub fn lines_from_glyphs(glyphs: &[Glyph]) -> String {
    let mut rows: BTreeMap<i64, Vec<&Glyph>> = BTreeMap::new();
    for glyph in glyphs.iter().filter(|g| !g.text.trim().is_empty()) {
        let key = (glyph.top / 2.0).round() as i64 * 2;
        rows.entry(key).or_default().push(glyph);
    }

    let mut lines = Vec::with_capacity(rows.len());
    for mut row in rows.into_values() {
        row.sort_by(|a, b| a.x0.total_cmp(&b.x0));
        let gaps: Vec<f64> = row.windows(2).map(|pair| pair[1].x0 - pair[0].x1).collect();
        let mut sorted = gaps.clone();
        sorted.sort_by(f64::total_cmp);
        let threshold = sorted
            .get(sorted.len() / 2)
            .map_or(2.0, |median| (median * 1.5).max(2.0));

        let mut line = String::new();
        for (idx, glyph) in row.iter().enumerate() {
            if idx > 0 && gaps[idx - 1] > threshold {
                line.push(' ');
            }
            line.push_str(glyph.text.trim());
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Collects glyph boxes page by page while the decoder walks the content streams.
#[derive(Debug, Default)]
struct GlyphCollector {
    page_height: f64,
    current: Vec<Glyph>,
    pages: Vec<Vec<Glyph>>,
}

impl pdf_extract::OutputDev for GlyphCollector {
    fn begin_page(
        &mut self,
        _page_num: u32,
        media_box: &pdf_extract::MediaBox,
        _art_box: Option<(f64, f64, f64, f64)>,
    ) -> Result<(), pdf_extract::OutputError> {
        self.page_height = media_box.ury - media_box.lly;
        self.current.clear();
        Ok(())
    }

    fn end_page(&mut self) -> Result<(), pdf_extract::OutputError> {
        self.pages.push(std::mem::take(&mut self.current));
        Ok(())
    }

    fn output_character(
        &mut self,
        trm: &pdf_extract::Transform,
        width: f64,
        _spacing: f64,
        font_size: f64,
        char: &str,
    ) -> Result<(), pdf_extract::OutputError> {
        // Rendered size is the geometric mean of the transformed font box sides.
        let size_x = font_size * (trm.m11 + trm.m21);
        let size_y = font_size * (trm.m12 + trm.m22);
        let size = (size_x * size_y).abs().sqrt();
        let x0 = trm.m31;
        let baseline = self.page_height - trm.m32;
        self.current.push(Glyph {
            text: char.to_string(),
            x0,
            x1: x0 + width * size,
            top: baseline - size,
        });
        Ok(())
    }

    fn begin_word(&mut self) -> Result<(), pdf_extract::OutputError> {
        Ok(())
    }

    fn end_word(&mut self) -> Result<(), pdf_extract::OutputError> {
        Ok(())
    }

    fn end_line(&mut self) -> Result<(), pdf_extract::OutputError> {
        Ok(())
    }
}

/// Pure-Rust PDF text extraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfText;

impl PdfText {
    fn decode<T>(
        path: &Path,
        decode: impl FnOnce(&[u8]) -> Result<T, String> + std::panic::UnwindSafe,
    ) -> Result<T, ExtractError> {
        let unreadable = |message: String| ExtractError::Unreadable {
            path: path.to_path_buf(),
            message,
        };
        let bytes = std::fs::read(path).map_err(|e| unreadable(e.to_string()))?;

        // The decoder panics on some malformed streams; surface that as an unreadable file.
        match std::panic::catch_unwind(move || decode(&bytes)) {
            Ok(Ok(decoded)) => Ok(decoded),
            Ok(Err(message)) => Err(unreadable(message)),
            Err(_) => Err(unreadable("pdf decoder panicked".to_string())),
        }
    }
}

impl DocumentText for PdfText {
    fn page_texts(&self, path: &Path) -> Result<Vec<String>, ExtractError> {
        Self::decode(path, |bytes| {
            pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| e.to_string())
        })
    }

    fn positioned_page_texts(&self, path: &Path) -> Result<Vec<String>, ExtractError> {
        let pages = Self::decode(path, |bytes| {
            let doc = pdf_extract::Document::load_mem(bytes).map_err(|e| e.to_string())?;
            let mut collector = GlyphCollector::default();
            pdf_extract::output_doc(&doc, &mut collector).map_err(|e| e.to_string())?;
            Ok(collector.pages)
        })?;
        Ok(pages.iter().map(|glyphs| lines_from_glyphs(glyphs)).collect())
    }
}

pub fn shfe_daily_url(base_url: &str, date: NaiveDate) -> String {
    format!(
        "{}/data/tradedata/future/dailydata/kx{}.dat",
        base_url.trim_end_matches('/'),
        date.format("%Y%m%d")
    )
}

fn json_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => parse_kg_cell(s).ok().flatten(),
        _ => None,
    }
}

fn json_text<'a>(row: &'a JsonValue, key: &str) -> &'a str {
    row.get(key).and_then(JsonValue::as_str).unwrap_or_default().trim()
}

/// Reads the product's total open interest from a daily `kx*.dat` JSON payload.
///
/// The subtotal row wins; without one, the individual delivery months are summed.
pub fn parse_open_interest(body: &[u8], product_id: &str) -> Result<i64, ExtractError> {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    let payload: JsonValue =
        serde_json::from_slice(body).map_err(|e| ExtractError::Payload(e.to_string()))?;

    let rows = payload
        .get("o_curinstrument")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let product_rows: Vec<&JsonValue> = rows
        .iter()
        .filter(|row| json_text(row, "PRODUCTID").eq_ignore_ascii_case(product_id))
        .collect();
    if product_rows.is_empty() {
        return Err(ExtractError::RowNotFound(product_id.to_string()));
    }

    let subtotal = product_rows.iter().find(|row| {
        let month = json_text(row, "DELIVERYMONTH");
        month.contains("小计") || month.to_ascii_lowercase().starts_with("sub")
    });
    if let Some(row) = subtotal {
        return row
            .get("OPENINTEREST")
            .and_then(json_i64)
            .ok_or(ExtractError::MissingValue {
                column: "total_open_interest",
            });
    }

    let mut total = 0i64;
    let mut contracts = 0usize;
    for row in &product_rows {
        let month = json_text(row, "DELIVERYMONTH");
        if month.is_empty() || !month.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let value = row
            .get("OPENINTEREST")
            .and_then(json_i64)
            .ok_or(ExtractError::MissingValue {
                column: "total_open_interest",
            })?;
        total = total
            .checked_add(value)
            .ok_or_else(|| ExtractError::InvalidNumber {
                column: "total_open_interest",
                raw: format!("{total} + {value}"),
            })?;
        contracts += 1;
    }
    debug!(product_id, contracts, "summed contract open interest without subtotal row");

    if contracts == 0 {
        return Err(ExtractError::MissingValue {
            column: "total_open_interest",
        });
    }
    Ok(total)
}

/// Withdrawal volumes from one monthly report; each figure is optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalFigures {
    pub gold_month_kg: Option<f64>,
    pub silver_month_kg: Option<f64>,
    pub gold_ytd_kg: Option<f64>,
    pub silver_ytd_kg: Option<f64>,
}

impl WithdrawalFigures {
    pub fn has_monthly(&self) -> bool {
        self.gold_month_kg.is_some() || self.silver_month_kg.is_some()
    }
}

fn first_two_amounts(text: &str) -> Option<(f64, f64)> {
    static AMOUNT_RE: OnceLock<Regex> = OnceLock::new();
    let re = AMOUNT_RE.get_or_init(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").expect("valid pattern"));
    let mut amounts = re
        .find_iter(text)
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok());
    Some((amounts.next()?, amounts.next()?))
}

/// Scans report text for the "Withdrawal Volume" lines (gold figure, then silver).
pub fn extract_withdrawals(text: &str) -> WithdrawalFigures {
    static MONTH_LINE: OnceLock<Regex> = OnceLock::new();
    static YTD_LINE: OnceLock<Regex> = OnceLock::new();
    let month_re = MONTH_LINE.get_or_init(|| {
        Regex::new(r"(?i)Withdrawal Volume\s*\(Present Month\)").expect("valid pattern")
    });
    let ytd_re = YTD_LINE.get_or_init(|| {
        Regex::new(r"(?i)Withdrawal Volume\s*\(Accumulative Total\)").expect("valid pattern")
    });

    let mut figures = WithdrawalFigures::default();
    for raw_line in text.lines() {
        let line = collapse_whitespace(raw_line);
        if let Some(m) = month_re.find(&line) {
            if let Some((gold, silver)) = first_two_amounts(&line[m.end()..]) {
                figures.gold_month_kg = Some(gold);
                figures.silver_month_kg = Some(silver);
            }
        } else if let Some(m) = ytd_re.find(&line) {
            if let Some((gold, silver)) = first_two_amounts(&line[m.end()..]) {
                figures.gold_ytd_kg = Some(gold);
                figures.silver_ytd_kg = Some(silver);
            }
        }
    }

    // Values sometimes land on the line after their label.
    let collapsed = collapse_whitespace(text);
    if figures.gold_month_kg.is_none() {
        if let Some(m) = month_re.find(&collapsed) {
            if let Some((gold, silver)) = first_two_amounts(&collapsed[m.end()..]) {
                figures.gold_month_kg = Some(gold);
                figures.silver_month_kg = Some(silver);
            }
        }
    }
    if figures.gold_ytd_kg.is_none() {
        if let Some(m) = ytd_re.find(&collapsed) {
            if let Some((gold, silver)) = first_two_amounts(&collapsed[m.end()..]) {
                figures.gold_ytd_kg = Some(gold);
                figures.silver_ytd_kg = Some(silver);
            }
        }
    }

    figures
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name.to_ascii_lowercase().as_str() {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sept" | "sep" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Report month from a descriptive file name such as `Data Highlights--January 2026.pdf`.
pub fn report_month_from_url(url: &str) -> Option<(i32, u32)> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE
        .get_or_init(|| Regex::new(r"(?i)--\s*([a-z]+)[,\s]+(\d{4})\.pdf").expect("valid pattern"));

    let name = url.rsplit('/').next().unwrap_or(url);
    let name = urlencoding::decode(name)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| name.to_string());
    let caps = re.captures(&name)?;
    Some((caps[2].parse().ok()?, month_number(&caps[1])?))
}

/// First `Month YYYY` mention in report text, e.g. `November, 2017` or `November2018`.
pub fn report_month_from_text(text: &str) -> Option<(i32, u32)> {
    static TEXT_RE: OnceLock<Regex> = OnceLock::new();
    let re = TEXT_RE.get_or_init(|| {
        Regex::new(
            concat!(
                r"(?i)\b(january|february|march|april|may|june|july|august|september|october",
                r"|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec)",
                r"[,.\s]*(\d{4})\b",
            ),
        )
        .expect("valid pattern")
    });
    re.captures_iter(text)
        .find_map(|caps| Some((caps[2].parse().ok()?, month_number(&caps[1])?)))
}
