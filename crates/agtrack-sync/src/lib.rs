//! Pipeline orchestration: report listing, PDF download + extraction, daily
//! open-interest collection and CSV/JSON output.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agtrack_adapters::{
    extract_inventory, extract_withdrawals, parse_open_interest, report_month_from_text,
    report_month_from_url, shfe_daily_url, AdapterError, DocumentText, ExtractError, PdfText,
    ReportSource, SgeMonthlyReports, SgeWeeklyReports, TableTarget, SGE_MONTHLY_LOAD_URL,
    SGE_WEEKLY_LISTING_URL, SHFE_BASE_URL, SHFE_REFERER, SHFE_SILVER_PRODUCT_ID,
};
use agtrack_core::{
    InventoryRecord, OpenInterestRecord, ReportEntry, TabularRecord, WeekBounds, WeekPlacement,
    WithdrawalRecord,
};
use agtrack_storage::{
    BackoffPolicy, CachedFile, DownloadCache, Fetch, FetchError, HttpClientConfig, HttpFetcher,
};
use anyhow::Context;
use chrono::{Days, NaiveDate};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "agtrack-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_retries: usize,
    pub sge_weekly_url: String,
    pub sge_monthly_url: String,
    pub shfe_base_url: String,
    pub shfe_referer: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            http_timeout_secs: 30,
            http_retries: 1,
            sge_weekly_url: SGE_WEEKLY_LISTING_URL.to_string(),
            sge_monthly_url: SGE_MONTHLY_LOAD_URL.to_string(),
            shfe_base_url: SHFE_BASE_URL.to_string(),
            shfe_referer: SHFE_REFERER.to_string(),
        }
    }
}

fn default_user_agent() -> String {
    concat!(
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) ",
        "AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0 Safari/537.36"
    )
    .to_string()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            user_agent: std::env::var("AGTRACK_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("AGTRACK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            http_retries: std::env::var("AGTRACK_HTTP_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_retries),
            sge_weekly_url: std::env::var("AGTRACK_SGE_WEEKLY_URL")
                .unwrap_or(defaults.sge_weekly_url),
            sge_monthly_url: std::env::var("AGTRACK_SGE_MONTHLY_URL")
                .unwrap_or(defaults.sge_monthly_url),
            shfe_base_url: std::env::var("AGTRACK_SHFE_BASE_URL").unwrap_or(defaults.shfe_base_url),
            shfe_referer: std::env::var("AGTRACK_SHFE_REFERER").unwrap_or(defaults.shfe_referer),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Client for the daily data files: exchange referer, pool-sized concurrency.
    pub fn daily_http_config(&self, workers: usize) -> HttpClientConfig {
        HttpClientConfig {
            referer: Some(self.shfe_referer.clone()),
            global_concurrency: workers.max(1),
            per_source_concurrency: workers.max(1),
            ..self.http_config()
        }
    }
}

/// Conditions that abort a whole run.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("listing aborted after {failures} consecutive page failures (last: {last_error})")]
    ListingUnavailable { failures: usize, last_error: String },
    #[error("cannot write output {path}: {message}")]
    Output { path: PathBuf, message: String },
    #[error("{0}")]
    Setup(String),
}

/// Why a single report or day produced no record. Never aborts the run.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Network(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ExtractError),
    #[error("no pdf link on detail page {0}")]
    NoPdfLink(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("local io: {0}")]
    Io(String),
}

impl ItemError {
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::Network(_) => "network",
            ItemError::Parse(_) | ItemError::NoPdfLink(_) | ItemError::Adapter(_) => "parse",
            ItemError::Io(_) => "io",
        }
    }
}

/// Counters reported at the end of every run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub pipeline: &'static str,
    pub pages_visited: usize,
    pub candidates: usize,
    pub records: usize,
    pub downloads: usize,
    pub cache_hits: usize,
    pub network_skips: usize,
    pub parse_skips: usize,
    pub csv_out: String,
    pub json_out: String,
}

impl RunSummary {
    fn new(pipeline: &'static str) -> Self {
        Self {
            pipeline,
            ..Default::default()
        }
    }

    fn count_skip(&mut self, err: &ItemError) {
        match err {
            ItemError::Network(_) => self.network_skips += 1,
            _ => self.parse_skips += 1,
        }
    }

    fn count_file(&mut self, file: &CachedFile) {
        if file.reused {
            self.cache_hits += 1;
        } else {
            self.downloads += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListingOptions {
    pub max_pages: usize,
    /// `None` collects every matching entry.
    pub max_reports: Option<usize>,
    pub bounds: WeekBounds,
    /// Consecutive page failures tolerated before the run aborts.
    pub page_failure_limit: usize,
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            max_pages: 300,
            max_reports: None,
            bounds: WeekBounds::default(),
            page_failure_limit: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ListingStop {
    /// A page produced no entries that were not already seen.
    #[default]
    Exhausted,
    MaxPages,
    MaxReports,
    OlderThanBound,
}

#[derive(Debug, Clone, Default)]
pub struct ListingOutcome {
    pub entries: Vec<ReportEntry>,
    pub pages_visited: usize,
    pub stop: ListingStop,
}

/// Walks a paginated report index newest-first.
pub struct ReportLister<'a> {
    source: &'a dyn ReportSource,
    fetcher: &'a dyn Fetch,
}

impl<'a> ReportLister<'a> {
    pub fn new(source: &'a dyn ReportSource, fetcher: &'a dyn Fetch) -> Self {
        Self { source, fetcher }
    }

    pub async fn collect(&self, options: &ListingOptions) -> Result<ListingOutcome, FatalError> {
        let source_id = self.source.source_id();
        let mut outcome = ListingOutcome::default();
        let mut seen = HashSet::new();
        let mut consecutive_failures = 0usize;
        let mut page_limit = options.max_pages.max(1);

        let mut page = 1usize;
        loop {
            if page > page_limit {
                outcome.stop = ListingStop::MaxPages;
                break;
            }

            let url = self.source.listing_url(page);
            let response = match self.fetcher.fetch_bytes(source_id, &url).await {
                Ok(response) => {
                    consecutive_failures = 0;
                    response
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(
                        source_id,
                        page,
                        %url,
                        error = %err,
                        kind = "network",
                        "listing page failed"
                    );
                    if consecutive_failures >= options.page_failure_limit.max(1) {
                        return Err(FatalError::ListingUnavailable {
                            failures: consecutive_failures,
                            last_error: err.to_string(),
                        });
                    }
                    page += 1;
                    continue;
                }
            };
            outcome.pages_visited += 1;

            let parsed = match self.source.parse_listing(&response.text(), &url) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(
                        source_id,
                        page,
                        %url,
                        error = %err,
                        kind = "parse",
                        "skipping unparseable listing page"
                    );
                    page += 1;
                    continue;
                }
            };
            if let Some(total) = parsed.total_pages {
                page_limit = page_limit.min(total.max(1));
            }

            let mut new_entries = 0usize;
            for entry in parsed.entries {
                if !seen.insert(entry.detail_url().to_string()) {
                    continue;
                }
                new_entries += 1;

                match options.bounds.place(&entry) {
                    WeekPlacement::Within => {
                        outcome.entries.push(entry);
                        if options
                            .max_reports
                            .is_some_and(|max| outcome.entries.len() >= max)
                        {
                            outcome.stop = ListingStop::MaxReports;
                            return Ok(outcome);
                        }
                    }
                    WeekPlacement::Newer => {
                        debug!(title = entry.title(), "newer than requested range; skipping");
                    }
                    WeekPlacement::Undated => {
                        debug!(title = entry.title(), "no week range in entry; skipping");
                    }
                    WeekPlacement::Older => {
                        debug!(title = entry.title(), "older than requested range; stopping");
                        outcome.stop = ListingStop::OlderThanBound;
                        return Ok(outcome);
                    }
                }
            }

            info!(
                source_id,
                page,
                new_entries,
                collected = outcome.entries.len(),
                "listing page read"
            );
            if new_entries == 0 {
                outcome.stop = ListingStop::Exhausted;
                break;
            }
            page += 1;
        }

        Ok(outcome)
    }
}

/// Cache file name for a report: sanitized title, prefixed with the week end date.
/// Undated titles get a short digest of the PDF (or detail) link so generic titles and
/// several PDFs from one article stay distinct.
pub fn report_file_name(entry: &ReportEntry) -> String {
    let link = entry.pdf_url().unwrap_or(entry.detail_url());
    let base = if entry.title().trim().is_empty() {
        link.rsplit('/').next().unwrap_or_default()
    } else {
        entry.title()
    };
    let mut name = DownloadCache::sanitize_file_name(base);
    if name.to_ascii_lowercase().ends_with(".pdf") {
        name.truncate(name.len() - 4);
    }

    match entry.week_end() {
        Some(end) => {
            let stamp = end.format("%Y%m%d").to_string();
            if !name.contains(&stamp) {
                name = format!("{stamp}_{name}");
            }
        }
        None => {
            let digest = DownloadCache::sha256_hex(link.as_bytes());
            name = format!("{name}_{}", &digest[..8]);
        }
    }
    format!("{name}.pdf")
}

#[derive(Debug, Clone)]
pub struct FetchedReport {
    pub entry: ReportEntry,
    pub pdf_url: String,
    pub file: CachedFile,
}

/// Resolves entries to PDF links and keeps the downloads in a local cache.
pub struct ReportFetcher<'a> {
    source: &'a dyn ReportSource,
    fetcher: &'a dyn Fetch,
    cache: &'a DownloadCache,
}

impl<'a> ReportFetcher<'a> {
    pub fn new(
        source: &'a dyn ReportSource,
        fetcher: &'a dyn Fetch,
        cache: &'a DownloadCache,
    ) -> Self {
        Self {
            source,
            fetcher,
            cache,
        }
    }

    /// Every PDF an entry points at: its own link, or each PDF on its detail page.
    pub async fn resolve(&self, entry: &ReportEntry) -> Result<Vec<ReportEntry>, ItemError> {
        if entry.pdf_url().is_some() {
            return Ok(vec![entry.clone()]);
        }
        let detail = self
            .fetcher
            .fetch_bytes(self.source.source_id(), entry.detail_url())
            .await?;
        let links = self
            .source
            .parse_detail(&detail.text(), entry.detail_url())?;
        if links.is_empty() {
            return Err(ItemError::NoPdfLink(entry.detail_url().to_string()));
        }
        Ok(links
            .into_iter()
            .map(|link| entry.with_pdf_url(link))
            .collect())
    }

    /// Downloads the entry's first PDF unless it is already cached.
    ///
    /// The cache is consulted before any network access; a detail-page entry found in
    /// the cache takes its PDF link from the sidecar written when it was downloaded.
    pub async fn fetch(&self, entry: &ReportEntry) -> Result<FetchedReport, ItemError> {
        let io = |e: anyhow::Error| ItemError::Io(format!("{e:#}"));
        let file_name = report_file_name(entry);

        let cached = self.cache.lookup(&file_name).await.map_err(io)?;
        if let Some(file) = &cached {
            let known_url = match entry.pdf_url() {
                Some(url) => Some(url.to_string()),
                None => self.cache.origin(&file_name).await.map_err(io)?,
            };
            if let Some(pdf_url) = known_url {
                debug!(%pdf_url, path = %file.path.display(), "using cached pdf");
                return Ok(FetchedReport {
                    entry: entry.with_pdf_url(pdf_url.clone()),
                    pdf_url,
                    file: file.clone(),
                });
            }
        }

        let resolved = self
            .resolve(entry)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ItemError::NoPdfLink(entry.detail_url().to_string()))?;
        let pdf_url = resolved
            .pdf_url()
            .map(str::to_string)
            .ok_or_else(|| ItemError::NoPdfLink(entry.detail_url().to_string()))?;

        let file = match cached {
            Some(file) => file,
            None => {
                let response = self
                    .fetcher
                    .fetch_bytes(self.source.source_id(), &pdf_url)
                    .await?;
                let file = self
                    .cache
                    .store(&file_name, &response.body)
                    .await
                    .map_err(io)?;
                info!(
                    %pdf_url,
                    path = %file.path.display(),
                    bytes = file.byte_size,
                    sha256 = %file.content_hash,
                    "downloaded pdf"
                );
                file
            }
        };

        if entry.pdf_url().is_none() {
            if let Err(err) = self.cache.record_origin(&file_name, &pdf_url).await {
                let error = format!("{err:#}");
                warn!(%pdf_url, %error, "could not record pdf origin");
            }
        }
        Ok(FetchedReport {
            entry: resolved,
            pdf_url,
            file,
        })
    }
}

async fn extract_blocking<F>(extract: F) -> Result<Vec<String>, ItemError>
where
    F: FnOnce() -> Result<Vec<String>, ExtractError> + Send + 'static,
{
    tokio::task::spawn_blocking(extract)
        .await
        .map_err(|e| ItemError::Io(format!("text extraction task failed: {e}")))?
        .map_err(ItemError::from)
}

async fn read_page_texts(
    text: Arc<dyn DocumentText>,
    path: PathBuf,
) -> Result<Vec<String>, ItemError> {
    extract_blocking(move || text.page_texts(&path)).await
}

async fn read_positioned_page_texts(
    text: Arc<dyn DocumentText>,
    path: PathBuf,
) -> Result<Vec<String>, ItemError> {
    extract_blocking(move || text.positioned_page_texts(&path)).await
}

fn log_skip(item: &str, err: &ItemError) {
    warn!(item, kind = err.kind(), error = %err, "skipping item");
}

#[derive(Debug, Clone)]
pub struct InventoryOptions {
    pub listing: ListingOptions,
    pub pdf_dir: PathBuf,
    pub csv_out: PathBuf,
    pub json_out: PathBuf,
}

/// Weekly report listing -> PDF cache -> silver table row -> CSV/JSON.
pub struct InventoryPipeline {
    fetcher: Arc<dyn Fetch>,
    source: Box<dyn ReportSource>,
    text: Arc<dyn DocumentText>,
    target: TableTarget,
}

impl InventoryPipeline {
    pub fn new(fetcher: Arc<dyn Fetch>, source: Box<dyn ReportSource>) -> Self {
        Self {
            fetcher,
            source,
            text: Arc::new(PdfText),
            target: TableTarget::default(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, FatalError> {
        let http = HttpFetcher::new(config.http_config())
            .map_err(|e| FatalError::Setup(format!("{e:#}")))?;
        Ok(Self::new(
            Arc::new(http),
            Box::new(SgeWeeklyReports::new(config.sge_weekly_url.clone())),
        ))
    }

    pub fn with_document_text(mut self, text: Arc<dyn DocumentText>) -> Self {
        self.text = text;
        self
    }

    pub async fn collect(
        &self,
        options: &InventoryOptions,
    ) -> Result<(Vec<InventoryRecord>, RunSummary), FatalError> {
        let mut summary = RunSummary::new("inventory");
        let listing = ReportLister::new(self.source.as_ref(), self.fetcher.as_ref())
            .collect(&options.listing)
            .await?;
        summary.pages_visited = listing.pages_visited;
        summary.candidates = listing.entries.len();
        info!(
            pages = listing.pages_visited,
            reports = listing.entries.len(),
            stop = ?listing.stop,
            "report listing complete"
        );

        let cache = DownloadCache::new(options.pdf_dir.clone());
        let reports = ReportFetcher::new(self.source.as_ref(), self.fetcher.as_ref(), &cache);

        let mut records = Vec::new();
        for entry in &listing.entries {
            let span = info_span!("report", title = entry.title());
            match self.process(&reports, entry, &mut summary).instrument(span).await {
                Ok(record) => {
                    info!(
                        week_start = ?record.week_start,
                        week_end = ?record.week_end,
                        last = record.last_week_inventory_kg,
                        change = record.weekly_change_kg,
                        current = record.this_week_inventory_kg,
                        "inventory row extracted"
                    );
                    records.push(record);
                }
                Err(err) => {
                    summary.count_skip(&err);
                    log_skip(entry.title(), &err);
                }
            }
        }

        summary.records = records.len();
        Ok((records, summary))
    }

    async fn process(
        &self,
        reports: &ReportFetcher<'_>,
        entry: &ReportEntry,
        summary: &mut RunSummary,
    ) -> Result<InventoryRecord, ItemError> {
        let report = reports.fetch(entry).await?;
        summary.count_file(&report.file);
        let pages = read_page_texts(self.text.clone(), report.file.path.clone()).await?;
        let figures = extract_inventory(&pages, &self.target)?;
        Ok(InventoryRecord::from_entry(
            &report.entry,
            report.pdf_url,
            figures.last_week_kg,
            figures.weekly_change_kg,
            figures.this_week_kg,
        ))
    }

    pub async fn run(&self, options: &InventoryOptions) -> Result<RunSummary, FatalError> {
        let (records, mut summary) = self.collect(options).await?;
        if records.is_empty() {
            warn!("no inventory records extracted; writing empty outputs");
        }
        write_outputs(&options.csv_out, &options.json_out, &records)?;
        summary.csv_out = options.csv_out.display().to_string();
        summary.json_out = options.json_out.display().to_string();
        Ok(summary)
    }
}

/// Every calendar day from `start` to `end`, inclusive.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut current = start;
    while current <= end {
        days.push(current);
        match current.checked_add_days(Days::new(1)) {
            Some(next) => current = next,
            None => break,
        }
    }
    days
}

#[derive(Debug, Clone)]
pub struct OpenInterestOptions {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub workers: usize,
    pub csv_out: PathBuf,
    pub json_out: PathBuf,
}

enum DayOutcome {
    Record(OpenInterestRecord),
    NoData,
    Skipped(ItemError),
}

/// Per-day `kx*.dat` downloads through a bounded pool; output sorted by date.
pub struct OpenInterestPipeline {
    fetcher: Arc<dyn Fetch>,
    base_url: String,
    product_id: String,
}

impl OpenInterestPipeline {
    pub fn new(fetcher: Arc<dyn Fetch>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            product_id: SHFE_SILVER_PRODUCT_ID.to_string(),
        }
    }

    pub fn from_config(config: &SyncConfig, workers: usize) -> Result<Self, FatalError> {
        let http = HttpFetcher::new(config.daily_http_config(workers))
            .map_err(|e| FatalError::Setup(format!("{e:#}")))?;
        Ok(Self::new(Arc::new(http), config.shfe_base_url.clone()))
    }

    async fn fetch_day(&self, day: NaiveDate) -> DayOutcome {
        let url = shfe_daily_url(&self.base_url, day);
        let response = match self.fetcher.fetch_bytes("shfe-daily", &url).await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => {
                debug!(%day, "no daily file (non-trading day)");
                return DayOutcome::NoData;
            }
            Err(err) => return DayOutcome::Skipped(err.into()),
        };
        match parse_open_interest(&response.body, &self.product_id) {
            Ok(total_open_interest) => DayOutcome::Record(OpenInterestRecord {
                date: day,
                total_open_interest,
            }),
            Err(err) => DayOutcome::Skipped(err.into()),
        }
    }

    pub async fn collect(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        workers: usize,
    ) -> (Vec<OpenInterestRecord>, RunSummary) {
        let days = date_range(start, end);
        let total = days.len();
        info!(%start, %end, days = total, workers, "scanning daily files");

        let mut summary = RunSummary::new("open-interest");
        summary.candidates = total;

        let mut outcomes = stream::iter(
            days.into_iter()
                .map(|day| async move { (day, self.fetch_day(day).await) }),
        )
        .buffer_unordered(workers.max(1));

        let mut records = Vec::new();
        let mut checked = 0usize;
        while let Some((day, outcome)) = outcomes.next().await {
            checked += 1;
            match outcome {
                DayOutcome::Record(record) => {
                    summary.downloads += 1;
                    records.push(record);
                }
                DayOutcome::NoData => {}
                DayOutcome::Skipped(err) => {
                    // A payload that fails to parse was still downloaded.
                    if !matches!(err, ItemError::Network(_)) {
                        summary.downloads += 1;
                    }
                    summary.count_skip(&err);
                    log_skip(&day.to_string(), &err);
                }
            }
            if checked % 100 == 0 || checked == total {
                info!(checked, total, records = records.len(), "daily scan progress");
            }
        }

        records.sort_by_key(|r| r.date);
        summary.records = records.len();
        (records, summary)
    }

    pub async fn run(&self, options: &OpenInterestOptions) -> Result<RunSummary, FatalError> {
        let (records, mut summary) = self
            .collect(options.start, options.end, options.workers)
            .await;
        write_outputs(&options.csv_out, &options.json_out, &records)?;
        summary.csv_out = options.csv_out.display().to_string();
        summary.json_out = options.json_out.display().to_string();
        Ok(summary)
    }
}

#[derive(Debug, Clone)]
pub struct WithdrawalOptions {
    pub max_pages: usize,
    pub pdf_dir: PathBuf,
    pub csv_out: PathBuf,
    pub json_out: PathBuf,
}

/// Monthly report listing -> PDF cache -> withdrawal volumes -> CSV/JSON.
pub struct WithdrawalPipeline {
    fetcher: Arc<dyn Fetch>,
    source: Box<dyn ReportSource>,
    text: Arc<dyn DocumentText>,
}

impl WithdrawalPipeline {
    pub fn new(fetcher: Arc<dyn Fetch>, source: Box<dyn ReportSource>) -> Self {
        Self {
            fetcher,
            source,
            text: Arc::new(PdfText),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, FatalError> {
        let http = HttpFetcher::new(config.http_config())
            .map_err(|e| FatalError::Setup(format!("{e:#}")))?;
        Ok(Self::new(
            Arc::new(http),
            Box::new(SgeMonthlyReports::new(config.sge_monthly_url.clone())),
        ))
    }

    pub fn with_document_text(mut self, text: Arc<dyn DocumentText>) -> Self {
        self.text = text;
        self
    }

    async fn process(
        &self,
        reports: &ReportFetcher<'_>,
        entry: &ReportEntry,
        summary: &mut RunSummary,
    ) -> Result<Option<WithdrawalRecord>, ItemError> {
        let report = reports.fetch(entry).await?;
        summary.count_file(&report.file);
        let mut text = read_page_texts(self.text.clone(), report.file.path.clone())
            .await?
            .join("\n");

        if !text.contains("Withdrawal") {
            // Some reports place every glyph separately; rebuild lines from positions.
            match read_positioned_page_texts(self.text.clone(), report.file.path.clone()).await {
                Ok(pages) if pages.iter().any(|page| page.contains("Withdrawal")) => {
                    debug!(pdf_url = %report.pdf_url, "using position-based text");
                    text = pages.join("\n");
                }
                Ok(_) => {
                    debug!(pdf_url = %report.pdf_url, "report predates withdrawal figures");
                    return Ok(None);
                }
                Err(err) => {
                    debug!(pdf_url = %report.pdf_url, error = %err, "no position-based text");
                    return Ok(None);
                }
            }
        }
        let figures = extract_withdrawals(&text);
        if !figures.has_monthly() {
            let label = "Withdrawal Volume (Present Month)".to_string();
            return Err(ExtractError::RowNotFound(label).into());
        }
        let (year, month) = report_month_from_url(&report.pdf_url)
            .or_else(|| report_month_from_text(&text))
            .ok_or_else(|| {
                ExtractError::Payload(format!("no report month in {}", report.pdf_url))
            })?;

        Ok(Some(WithdrawalRecord {
            date: format!("{year}-{month:02}"),
            year,
            month,
            gold_withdrawal_kg: figures.gold_month_kg,
            silver_withdrawal_kg: figures.silver_month_kg,
            gold_withdrawal_ytd_kg: figures.gold_ytd_kg,
            silver_withdrawal_ytd_kg: figures.silver_ytd_kg,
            pdf_url: report.pdf_url,
        }))
    }

    pub async fn collect(
        &self,
        options: &WithdrawalOptions,
    ) -> Result<(Vec<WithdrawalRecord>, RunSummary), FatalError> {
        let mut summary = RunSummary::new("withdrawals");
        let listing_options = ListingOptions {
            max_pages: options.max_pages,
            ..Default::default()
        };
        let listing = ReportLister::new(self.source.as_ref(), self.fetcher.as_ref())
            .collect(&listing_options)
            .await?;
        summary.pages_visited = listing.pages_visited;

        let cache = DownloadCache::new(options.pdf_dir.clone());
        let reports = ReportFetcher::new(self.source.as_ref(), self.fetcher.as_ref(), &cache);

        // Articles may attach several PDFs; each distinct PDF is a candidate.
        let mut seen = HashSet::new();
        let mut pdfs = Vec::new();
        for entry in &listing.entries {
            match reports.resolve(entry).await {
                Ok(resolved) => pdfs.extend(resolved.into_iter().filter(|pdf| {
                    pdf.pdf_url().is_some_and(|url| seen.insert(url.to_string()))
                })),
                Err(err) => {
                    summary.count_skip(&err);
                    log_skip(entry.title(), &err);
                }
            }
        }
        summary.candidates = pdfs.len();
        info!(
            pages = listing.pages_visited,
            articles = listing.entries.len(),
            pdfs = pdfs.len(),
            "monthly report listing complete"
        );

        let mut records = Vec::new();
        for pdf in &pdfs {
            match self.process(&reports, pdf, &mut summary).await {
                Ok(Some(record)) => {
                    info!(
                        date = %record.date,
                        gold = ?record.gold_withdrawal_kg,
                        silver = ?record.silver_withdrawal_kg,
                        "withdrawal figures extracted"
                    );
                    records.push(record);
                }
                Ok(None) => {}
                Err(err) => {
                    summary.count_skip(&err);
                    log_skip(pdf.pdf_url().unwrap_or(pdf.title()), &err);
                }
            }
        }

        let records = sort_and_dedup_months(records);
        summary.records = records.len();
        Ok((records, summary))
    }

    pub async fn run(&self, options: &WithdrawalOptions) -> Result<RunSummary, FatalError> {
        let (records, mut summary) = self.collect(options).await?;
        write_outputs(&options.csv_out, &options.json_out, &records)?;
        summary.csv_out = options.csv_out.display().to_string();
        summary.json_out = options.json_out.display().to_string();
        Ok(summary)
    }
}

/// Chronological order, keeping the first record seen for each month.
pub fn sort_and_dedup_months(mut records: Vec<WithdrawalRecord>) -> Vec<WithdrawalRecord> {
    records.sort_by_key(|r| (r.year, r.month));
    let mut seen = HashSet::new();
    records.retain(|r| {
        let fresh = seen.insert((r.year, r.month));
        if !fresh {
            debug!(date = %r.date, pdf_url = %r.pdf_url, "duplicate month; keeping earlier report");
        }
        fresh
    });
    records
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

/// CSV with the record type's fixed header, written even when there are no rows.
pub fn write_csv<T: TabularRecord>(path: &Path, records: &[T]) -> anyhow::Result<()> {
    ensure_parent_dir(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writer
        .write_record(T::HEADERS)
        .with_context(|| format!("writing header to {}", path.display()))?;
    for record in records {
        writer
            .serialize(record)
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    writer.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

pub fn write_json<T: TabularRecord>(path: &Path, records: &[T]) -> anyhow::Result<()> {
    ensure_parent_dir(path)?;
    let bytes = serde_json::to_vec_pretty(records).context("serializing records")?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn write_outputs<T: TabularRecord>(
    csv_path: &Path,
    json_path: &Path,
    records: &[T],
) -> Result<(), FatalError> {
    write_csv(csv_path, records).map_err(|e| FatalError::Output {
        path: csv_path.to_path_buf(),
        message: format!("{e:#}"),
    })?;
    write_json(json_path, records).map_err(|e| FatalError::Output {
        path: json_path.to_path_buf(),
        message: format!("{e:#}"),
    })?;
    info!(
        records = records.len(),
        csv = %csv_path.display(),
        json = %json_path.display(),
        "outputs written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use agtrack_storage::{FetchedResponse, StatusCode};
    use async_trait::async_trait;
    use tempfile::tempdir;

    const LISTING: &str = "https://www.sge.com.cn/sjzx/hqzb";

    #[derive(Default)]
    struct FakeWeb {
        pages: HashMap<String, Vec<u8>>,
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeWeb {
        fn page(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.pages.insert(url.to_string(), body.into());
            self
        }

        fn failing(mut self, url: &str) -> Self {
            self.failing.insert(url.to_string());
            self
        }

        fn calls_to(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| u.as_str() == url).count()
        }
    }

    #[async_trait]
    impl Fetch for FakeWeb {
        async fn fetch_bytes(
            &self,
            _source_id: &str,
            url: &str,
        ) -> Result<FetchedResponse, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            if self.failing.contains(url) {
                return Err(FetchError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                });
            }
            match self.pages.get(url) {
                Some(body) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: url.to_string(),
                    body: body.clone(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    /// Treats cached "PDFs" as UTF-8 text with form feeds between pages.
    struct PlainText;

    impl DocumentText for PlainText {
        fn page_texts(&self, path: &Path) -> Result<Vec<String>, ExtractError> {
            let text = std::fs::read_to_string(path).map_err(|e| ExtractError::Unreadable {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            Ok(text.split('\u{c}').map(str::to_string).collect())
        }
    }

    fn listing_html(items: &[(&str, &str)]) -> String {
        let links: String = items
            .iter()
            .map(|(href, title)| format!(r#"<li><a href="{href}">{title}</a></li>"#))
            .collect();
        format!("<html><body><ul>{links}</ul></body></html>")
    }

    fn silver_report(last: &str, change: &str, current: &str) -> String {
        format!("周报\u{c}上交所交收库白银库存周度数据\n品种 上周 增减 本周\n白银 {last} {change} {current}\n")
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn weekly_site() -> FakeWeb {
        let page1 = listing_html(&[
            ("/upload/w0205.pdf", "市场周报 20240205-20240209"),
            ("/upload/w0129.pdf", "市场周报 20240129-20240202"),
            ("/sjzx/hqzb/detail/22", "市场周报 20240122-20240126"),
        ]);
        let page2 = listing_html(&[
            ("/upload/w0115.pdf", "市场周报 20240115-20240119"),
            ("/upload/w0108.pdf", "市场周报 20240108-20240112"),
            ("/upload/w0101.pdf", "市场周报 20240101-20240105"),
        ]);
        FakeWeb::default()
            .page(LISTING, page1)
            .page(&format!("{LISTING}?p=2"), page2)
            .page(
                "https://www.sge.com.cn/sjzx/hqzb/detail/22",
                r#"<a href="/upload/w0122.pdf">下载</a>"#,
            )
            .page("https://www.sge.com.cn/upload/w0205.pdf", silver_report("9", "1", "10"))
            .page(
                "https://www.sge.com.cn/upload/w0129.pdf",
                silver_report("1,234,000", "-56,000", "1,178,000"),
            )
            .page(
                "https://www.sge.com.cn/upload/w0122.pdf",
                silver_report("1,300,000", "-66,000", "1,234,000"),
            )
            .page("https://www.sge.com.cn/upload/w0115.pdf", "周报\u{c}黄金 1 2 3")
            .page("https://www.sge.com.cn/upload/w0108.pdf", silver_report("1,000", "—", "1,000"))
            .page("https://www.sge.com.cn/upload/w0101.pdf", silver_report("1", "1", "2"))
    }

    #[tokio::test]
    async fn lister_skips_newer_and_stops_at_older_entries() {
        let web = weekly_site();
        let source = SgeWeeklyReports::default();
        let options = ListingOptions {
            bounds: WeekBounds::new(Some(d(2024, 1, 8)), Some(d(2024, 2, 2))),
            ..Default::default()
        };
        let outcome = ReportLister::new(&source, &web).collect(&options).await.expect("listing");

        let titles: Vec<_> = outcome.entries.iter().map(|e| e.title().to_string()).collect();
        assert_eq!(
            titles,
            vec![
                "市场周报 20240129-20240202",
                "市场周报 20240122-20240126",
                "市场周报 20240115-20240119",
                "市场周报 20240108-20240112",
            ]
        );
        assert_eq!(outcome.stop, ListingStop::OlderThanBound);
        assert_eq!(web.calls_to(&format!("{LISTING}?p=3")), 0);
    }

    #[tokio::test]
    async fn lister_honours_max_reports_and_max_pages() {
        let web = weekly_site();
        let source = SgeWeeklyReports::default();

        let capped = ListingOptions {
            max_reports: Some(2),
            ..Default::default()
        };
        let outcome = ReportLister::new(&source, &web).collect(&capped).await.unwrap();
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.stop, ListingStop::MaxReports);

        let one_page = ListingOptions {
            max_pages: 1,
            ..Default::default()
        };
        let outcome = ReportLister::new(&source, &web).collect(&one_page).await.unwrap();
        assert_eq!(outcome.entries.len(), 3);
        assert_eq!(outcome.pages_visited, 1);
        assert_eq!(outcome.stop, ListingStop::MaxPages);
    }

    #[tokio::test]
    async fn lister_aborts_on_repeated_failures_and_stops_on_repeats() {
        let web = weekly_site();
        let source = SgeWeeklyReports::default();
        // Pages 3 and 4 both answer 404.
        let outcome = ReportLister::new(&source, &web)
            .collect(&ListingOptions::default())
            .await;
        assert!(matches!(outcome, Err(FatalError::ListingUnavailable { failures: 2, .. })));

        let repeating = weekly_site().page(
            &format!("{LISTING}?p=3"),
            listing_html(&[("/upload/w0101.pdf", "x")]),
        );
        let outcome = ReportLister::new(&source, &repeating)
            .collect(&ListingOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.stop, ListingStop::Exhausted);
        assert_eq!(outcome.entries.len(), 6);
        assert_eq!(outcome.pages_visited, 3);
    }

    #[tokio::test]
    async fn single_failed_listing_page_is_skipped() {
        let page3 = listing_html(&[("/upload/old.pdf", "市场周报 20231225-20231229")]);
        let web = weekly_site()
            .failing(&format!("{LISTING}?p=2"))
            .page(&format!("{LISTING}?p=3"), page3)
            .page(&format!("{LISTING}?p=4"), "<html></html>");
        let source = SgeWeeklyReports::default();

        let outcome = ReportLister::new(&source, &web)
            .collect(&ListingOptions::default())
            .await
            .expect("one failure is tolerated");
        assert_eq!(outcome.entries.len(), 4);
        assert_eq!(outcome.pages_visited, 3);
    }

    #[tokio::test]
    async fn total_pages_hint_caps_the_walk() {
        let page1 = format!(
            "{}<script>var totalPage = 1;</script>",
            listing_html(&[("/upload/a.pdf", "市场周报 20240108-20240112")])
        );
        let web = FakeWeb::default().page(LISTING, page1);
        let source = SgeWeeklyReports::default();
        let outcome = ReportLister::new(&source, &web)
            .collect(&ListingOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.stop, ListingStop::MaxPages);
        assert_eq!(web.calls_to(&format!("{LISTING}?p=2")), 0);
    }

    #[tokio::test]
    async fn refetching_into_populated_cache_downloads_nothing() {
        let dir = tempdir().unwrap();
        let web = weekly_site();
        let source = SgeWeeklyReports::default();
        let cache = DownloadCache::new(dir.path());
        let fetcher = ReportFetcher::new(&source, &web, &cache);
        let entry = ReportEntry::new(
            "市场周报 20240129-20240202",
            "https://www.sge.com.cn/upload/w0129.pdf",
            Some("https://www.sge.com.cn/upload/w0129.pdf".to_string()),
        );

        let first = fetcher.fetch(&entry).await.expect("first fetch");
        assert!(!first.file.reused);
        let second = fetcher.fetch(&entry).await.expect("second fetch");
        assert!(second.file.reused);
        assert_eq!(second.file.path, first.file.path);
        assert_eq!(web.calls_to("https://www.sge.com.cn/upload/w0129.pdf"), 1);
    }

    #[tokio::test]
    async fn detail_pages_resolve_to_pdf_links() {
        let dir = tempdir().unwrap();
        let web = weekly_site()
            .page("https://www.sge.com.cn/sjzx/hqzb/detail/99", "<p>nothing</p>");
        let source = SgeWeeklyReports::default();
        let cache = DownloadCache::new(dir.path());
        let fetcher = ReportFetcher::new(&source, &web, &cache);

        let entry = ReportEntry::new(
            "市场周报 20240122-20240126",
            "https://www.sge.com.cn/sjzx/hqzb/detail/22",
            None,
        );
        let report = fetcher.fetch(&entry).await.expect("resolved");
        assert_eq!(report.pdf_url, "https://www.sge.com.cn/upload/w0122.pdf");

        let orphan = ReportEntry::new(
            "市场周报 20240226-20240301",
            "https://www.sge.com.cn/sjzx/hqzb/detail/99",
            None,
        );
        let err = fetcher.fetch(&orphan).await.unwrap_err();
        assert!(matches!(err, ItemError::NoPdfLink(_)));
        assert_eq!(err.kind(), "parse");

        let gone_url = "https://www.sge.com.cn/upload/gone.pdf";
        let gone = ReportEntry::new("周报", gone_url, Some(gone_url.to_string()));
        let err = fetcher.fetch(&gone).await.unwrap_err();
        assert_eq!(err.kind(), "network");
    }

    #[tokio::test]
    async fn cached_detail_entries_skip_the_detail_page() {
        let dir = tempdir().unwrap();
        let web = weekly_site();
        let source = SgeWeeklyReports::default();
        let detail = "https://www.sge.com.cn/sjzx/hqzb/detail/22";
        let entry = ReportEntry::new("市场周报 20240122-20240126", detail, None);

        let first = {
            let cache = DownloadCache::new(dir.path());
            ReportFetcher::new(&source, &web, &cache)
                .fetch(&entry)
                .await
                .expect("first fetch")
        };
        let cache = DownloadCache::new(dir.path());
        let second = ReportFetcher::new(&source, &web, &cache)
            .fetch(&entry)
            .await
            .expect("second fetch");

        assert!(second.file.reused);
        assert_eq!(second.pdf_url, first.pdf_url);
        assert_eq!(second.entry.pdf_url(), Some("https://www.sge.com.cn/upload/w0122.pdf"));
        assert_eq!(web.calls_to(detail), 1);
        assert_eq!(web.calls_to("https://www.sge.com.cn/upload/w0122.pdf"), 1);
    }

    #[tokio::test]
    async fn cached_file_without_origin_resolves_but_does_not_download() {
        let dir = tempdir().unwrap();
        let web = weekly_site();
        let source = SgeWeeklyReports::default();
        let cache = DownloadCache::new(dir.path());
        let entry = ReportEntry::new(
            "市场周报 20240122-20240126",
            "https://www.sge.com.cn/sjzx/hqzb/detail/22",
            None,
        );
        cache
            .store(&report_file_name(&entry), b"cached body")
            .await
            .unwrap();

        let report = ReportFetcher::new(&source, &web, &cache)
            .fetch(&entry)
            .await
            .expect("fetch");
        assert!(report.file.reused);
        assert_eq!(report.pdf_url, "https://www.sge.com.cn/upload/w0122.pdf");
        assert_eq!(web.calls_to("https://www.sge.com.cn/upload/w0122.pdf"), 0);
        assert_eq!(
            cache.origin(&report_file_name(&entry)).await.unwrap().as_deref(),
            Some("https://www.sge.com.cn/upload/w0122.pdf")
        );
    }

    #[test]
    fn report_file_names_are_stable_and_distinct() {
        let dated = ReportEntry::new("市场周报 20240129-20240202", "https://x/1", None);
        assert_eq!(report_file_name(&dated), "市场周报_20240129-20240202.pdf");

        let bare = ReportEntry::new("Weekly report.PDF", "https://x/1", None)
            .with_pdf_url("https://x/20240101-20240105.pdf");
        assert_eq!(report_file_name(&bare), "20240105_Weekly_report.pdf");

        let a = ReportEntry::new("Monthly Report", "https://x/data_MonthlyReport/1", None);
        let b = ReportEntry::new("Monthly Report", "https://x/data_MonthlyReport/2", None);
        assert_ne!(report_file_name(&a), report_file_name(&b));

        let english = a.with_pdf_url("https://x/upload/report-en.pdf");
        let chinese = a.with_pdf_url("https://x/upload/report-cn.pdf");
        assert_ne!(report_file_name(&english), report_file_name(&chinese));
    }

    #[tokio::test]
    async fn inventory_run_emits_only_in_range_rows_with_values() {
        let dir = tempdir().unwrap();
        let bounds = WeekBounds::new(Some(d(2024, 1, 8)), Some(d(2024, 2, 2)));
        let options = InventoryOptions {
            listing: ListingOptions {
                bounds,
                ..Default::default()
            },
            pdf_dir: dir.path().join("pdfs"),
            csv_out: dir.path().join("out/inventory.csv"),
            json_out: dir.path().join("out/inventory.json"),
        };
        let web = Arc::new(weekly_site());
        let pipeline = InventoryPipeline::new(web.clone(), Box::new(SgeWeeklyReports::default()))
            .with_document_text(Arc::new(PlainText));

        let summary = pipeline.run(&options).await.expect("run");
        assert_eq!(summary.candidates, 4);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.parse_skips, 2);
        assert_eq!(summary.downloads, 4);

        let json: Vec<InventoryRecord> =
            serde_json::from_slice(&std::fs::read(&options.json_out).unwrap()).unwrap();
        assert_eq!(json.len(), 2);
        for record in &json {
            let start = record.week_start.unwrap();
            let end = record.week_end.unwrap();
            assert!(start >= d(2024, 1, 8) && end <= d(2024, 2, 2));
        }
        assert_eq!(json[0].last_week_inventory_kg, 1_234_000);
        assert_eq!(json[0].weekly_change_kg, -56_000);
        assert_eq!(json[0].this_week_inventory_kg, 1_178_000);
        assert_eq!(json[1].pdf_url, "https://www.sge.com.cn/upload/w0122.pdf");

        let csv = std::fs::read_to_string(&options.csv_out).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "title,pdf_url,week_start,week_end,\
             last_week_inventory_kg,weekly_change_kg,this_week_inventory_kg"
        );
        assert_eq!(
            lines[1],
            "市场周报 20240129-20240202,https://www.sge.com.cn/upload/w0129.pdf,\
             20240129,20240202,1234000,-56000,1178000"
        );
        assert_eq!(lines.len(), 3);

        let rerun = pipeline.run(&options).await.expect("rerun");
        assert_eq!(rerun.downloads, 0);
        assert_eq!(rerun.cache_hits, 4);
        assert_eq!(rerun.records, 2);
        assert_eq!(web.calls_to("https://www.sge.com.cn/sjzx/hqzb/detail/22"), 1);
    }

    fn kx_payload(total: i64) -> String {
        format!(
            r#"{{"o_curinstrument":[
                {{"PRODUCTID":"ag_f","DELIVERYMONTH":"2406","OPENINTEREST":1}},
                {{"PRODUCTID":"ag_f","DELIVERYMONTH":"小计","OPENINTEREST":{total}}}
            ]}}"#
        )
    }

    fn daily_site() -> FakeWeb {
        let base = "https://shfe.test";
        let mut web = FakeWeb::default();
        for (day, total) in [(1u32, 500i64), (2, 510), (5, 530), (6, 545), (7, 560), (8, 570)] {
            web = web.page(&shfe_daily_url(base, d(2024, 1, day)), kx_payload(total));
        }
        web.page(&shfe_daily_url(base, d(2024, 1, 9)), "<html>maintenance</html>")
            .failing(&shfe_daily_url(base, d(2024, 1, 10)))
    }

    #[tokio::test]
    async fn worker_count_does_not_change_output_bytes() {
        let dir = tempdir().unwrap();
        let mut outputs = Vec::new();
        for workers in [1usize, 8] {
            let pipeline = OpenInterestPipeline::new(Arc::new(daily_site()), "https://shfe.test");
            let options = OpenInterestOptions {
                start: d(2024, 1, 1),
                end: d(2024, 1, 12),
                workers,
                csv_out: dir.path().join(format!("oi-{workers}.csv")),
                json_out: dir.path().join(format!("oi-{workers}.json")),
            };
            let summary = pipeline.run(&options).await.expect("run");
            assert_eq!(summary.candidates, 12);
            assert_eq!(summary.records, 6);
            assert_eq!(summary.parse_skips, 1);
            assert_eq!(summary.network_skips, 1);
            // Six records plus the unparseable day 9 payload.
            assert_eq!(summary.downloads, 7);
            outputs.push((
                std::fs::read(&options.csv_out).unwrap(),
                std::fs::read(&options.json_out).unwrap(),
            ));
        }
        assert_eq!(outputs[0], outputs[1]);

        let csv = String::from_utf8(outputs[0].0.clone()).unwrap();
        assert_eq!(
            csv.lines().take(3).collect::<Vec<_>>(),
            vec!["date,total_open_interest", "2024-01-01,500", "2024-01-02,510"]
        );
        assert!(!csv.contains("2024-01-03"));
    }

    #[tokio::test]
    async fn csv_and_json_carry_the_same_rows_in_order() {
        let dir = tempdir().unwrap();
        let pipeline = OpenInterestPipeline::new(Arc::new(daily_site()), "https://shfe.test");
        let (records, _) = pipeline.collect(d(2024, 1, 1), d(2024, 1, 8), 4).await;
        let csv_path = dir.path().join("oi.csv");
        let json_path = dir.path().join("oi.json");
        write_outputs(&csv_path, &json_path, &records).unwrap();

        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let from_csv: Vec<OpenInterestRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
        let from_json: Vec<OpenInterestRecord> =
            serde_json::from_slice(&std::fs::read(&json_path).unwrap()).unwrap();
        assert_eq!(from_csv, from_json);
        assert_eq!(from_csv, records);
    }

    #[test]
    fn empty_outputs_still_carry_headers() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("nested/dir/empty.csv");
        let json_path = dir.path().join("nested/dir/empty.json");
        write_outputs::<WithdrawalRecord>(&csv_path, &json_path, &[]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&csv_path).unwrap(),
            "date,year,month,gold_withdrawal_kg,silver_withdrawal_kg,\
             gold_withdrawal_ytd_kg,silver_withdrawal_ytd_kg,pdf_url\n"
        );
        assert_eq!(std::fs::read_to_string(&json_path).unwrap(), "[]");
    }

    #[test]
    fn unwritable_output_is_fatal() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let err = write_outputs::<OpenInterestRecord>(
            &blocker.join("a.csv"),
            &blocker.join("a.json"),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, FatalError::Output { .. }));
    }

    #[test]
    fn date_range_is_inclusive() {
        assert_eq!(date_range(d(2024, 2, 28), d(2024, 3, 1)).len(), 3);
        assert_eq!(date_range(d(2024, 1, 1), d(2024, 1, 1)), vec![d(2024, 1, 1)]);
        assert!(date_range(d(2024, 1, 2), d(2024, 1, 1)).is_empty());
    }

    fn withdrawal(year: i32, month: u32, url: &str) -> WithdrawalRecord {
        WithdrawalRecord {
            date: format!("{year}-{month:02}"),
            year,
            month,
            gold_withdrawal_kg: Some(1.0),
            silver_withdrawal_kg: Some(2.0),
            gold_withdrawal_ytd_kg: None,
            silver_withdrawal_ytd_kg: None,
            pdf_url: url.to_string(),
        }
    }

    #[test]
    fn monthly_records_sort_and_keep_first_per_month() {
        let records = vec![
            withdrawal(2024, 3, "a"),
            withdrawal(2023, 12, "b"),
            withdrawal(2024, 3, "c"),
        ];
        let out = sort_and_dedup_months(records);
        let keys: Vec<_> = out.iter().map(|r| (r.date.as_str(), r.pdf_url.as_str())).collect();
        assert_eq!(keys, vec![("2023-12", "b"), ("2024-03", "a")]);
    }

    #[tokio::test]
    async fn withdrawal_run_follows_articles_and_skips_old_reports() {
        let load = "https://en.sge.com.cn/data_MonthlyReport_load";
        let page1 = r#"
            <a href="/upload/Data%20Highlights--February%202024.pdf">Feb</a>
            <a href="/data_MonthlyReport/77">
              <span class="txt">Monthly Report of Data Highlights</span>
            </a>
            <a href="/data_MonthlyReport/78"><span class="txt">Exchange notice</span></a>
            <a href="/upload/old.pdf">2016</a>
        "#;
        let web = FakeWeb::default()
            .page(&format!("{load}?p=1"), page1)
            .page(&format!("{load}?p=2"), "<html></html>")
            .page(
                "https://en.sge.com.cn/data_MonthlyReport/77",
                r#"<a href="/upload/report-77.pdf">pdf</a>"#,
            )
            .page(
                "https://en.sge.com.cn/upload/Data%20Highlights--February%202024.pdf",
                "Withdrawal Volume (Present Month) 100.5 200\n\
                 Withdrawal Volume (Accumulative Total) 300 400",
            )
            .page(
                "https://en.sge.com.cn/upload/report-77.pdf",
                "Data Highlights January, 2024\nWithdrawal Volume (Present Month) 10 20",
            )
            .page("https://en.sge.com.cn/upload/old.pdf", "Trading volume only");

        let dir = tempdir().unwrap();
        let options = WithdrawalOptions {
            max_pages: 15,
            pdf_dir: dir.path().join("monthly"),
            csv_out: dir.path().join("w.csv"),
            json_out: dir.path().join("w.json"),
        };
        let source = Box::new(SgeMonthlyReports::new(load));
        let pipeline =
            WithdrawalPipeline::new(Arc::new(web), source).with_document_text(Arc::new(PlainText));
        let (records, summary) = pipeline.collect(&options).await.expect("collect");

        assert_eq!(summary.candidates, 3);
        assert_eq!(summary.parse_skips, 0);
        let dates: Vec<_> = records.iter().map(|r| r.date.as_str()).collect();
        assert_eq!(dates, vec!["2024-01", "2024-02"]);
        assert_eq!(records[1].gold_withdrawal_kg, Some(100.5));
        assert_eq!(records[1].silver_withdrawal_ytd_kg, Some(400.0));
        assert_eq!(records[0].gold_withdrawal_ytd_kg, None);
    }

    #[tokio::test]
    async fn withdrawal_articles_contribute_every_attached_pdf() {
        let load = "https://en.sge.com.cn/data_MonthlyReport_load";
        let page1 = r#"
            <a href="/data_MonthlyReport/90"><span class="txt">Monthly Report</span></a>
            <a href="/upload/Data%20Highlights--March%202024.pdf">Mar</a>
        "#;
        let article = r#"
            <a href="/upload/Data%20Highlights--March%202024.pdf">March</a>
            <a href="/upload/Data%20Highlights--April%202024.pdf">April</a>
        "#;
        let web = FakeWeb::default()
            .page(&format!("{load}?p=1"), page1)
            .page(&format!("{load}?p=2"), "<html></html>")
            .page("https://en.sge.com.cn/data_MonthlyReport/90", article)
            .page(
                "https://en.sge.com.cn/upload/Data%20Highlights--March%202024.pdf",
                "Withdrawal Volume (Present Month) 1 2",
            )
            .page(
                "https://en.sge.com.cn/upload/Data%20Highlights--April%202024.pdf",
                "Withdrawal Volume (Present Month) 3 4",
            );
        let web = Arc::new(web);

        let dir = tempdir().unwrap();
        let options = WithdrawalOptions {
            max_pages: 15,
            pdf_dir: dir.path().join("monthly"),
            csv_out: dir.path().join("w.csv"),
            json_out: dir.path().join("w.json"),
        };
        let pipeline = WithdrawalPipeline::new(web.clone(), Box::new(SgeMonthlyReports::new(load)))
            .with_document_text(Arc::new(PlainText));
        let (records, summary) = pipeline.collect(&options).await.expect("collect");

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.downloads, 2);
        let dates: Vec<_> = records.iter().map(|r| r.date.as_str()).collect();
        assert_eq!(dates, vec!["2024-03", "2024-04"]);
        assert_eq!(records[1].silver_withdrawal_kg, Some(4.0));
        assert_eq!(
            web.calls_to("https://en.sge.com.cn/upload/Data%20Highlights--March%202024.pdf"),
            1
        );
    }

    /// Plain text without the withdrawal block; glyph-position text carries it.
    struct ScatteredGlyphs;

    impl DocumentText for ScatteredGlyphs {
        fn page_texts(&self, _path: &Path) -> Result<Vec<String>, ExtractError> {
            Ok(vec!["W i t h d r a w a l".to_string()])
        }

        fn positioned_page_texts(&self, _path: &Path) -> Result<Vec<String>, ExtractError> {
            Ok(vec![
                "Data Highlights May, 2024".to_string(),
                "Withdrawal Volume (Present Month) 7 8".to_string(),
            ])
        }
    }

    #[tokio::test]
    async fn withdrawal_text_falls_back_to_glyph_positions() {
        let load = "https://en.sge.com.cn/data_MonthlyReport_load";
        let web = FakeWeb::default()
            .page(&format!("{load}?p=1"), r#"<a href="/upload/may.pdf">May</a>"#)
            .page(&format!("{load}?p=2"), "<html></html>")
            .page("https://en.sge.com.cn/upload/may.pdf", "%PDF-1.4");

        let dir = tempdir().unwrap();
        let options = WithdrawalOptions {
            max_pages: 15,
            pdf_dir: dir.path().join("monthly"),
            csv_out: dir.path().join("w.csv"),
            json_out: dir.path().join("w.json"),
        };
        let source = Box::new(SgeMonthlyReports::new(load));
        let pipeline = WithdrawalPipeline::new(Arc::new(web), source)
            .with_document_text(Arc::new(ScatteredGlyphs));
        let (records, summary) = pipeline.collect(&options).await.expect("collect");

        assert_eq!(summary.parse_skips, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].date, "2024-05");
        assert_eq!(records[0].gold_withdrawal_kg, Some(7.0));
        assert_eq!(records[0].silver_withdrawal_kg, Some(8.0));
    }
}
