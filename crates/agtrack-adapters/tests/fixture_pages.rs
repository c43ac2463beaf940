use std::path::PathBuf;

use agtrack_adapters::{
    parse_open_interest, report_month_from_url, ReportSource, SgeMonthlyReports, SgeWeeklyReports,
    SHFE_SILVER_PRODUCT_ID,
};
use chrono::NaiveDate;

fn fixture(source: &str, name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(source)
        .join("sample")
        .join(name)
}

fn read_fixture(source: &str, name: &str) -> String {
    std::fs::read_to_string(fixture(source, name)).expect("fixture present")
}

#[test]
fn weekly_listing_fixture_yields_dated_entries_and_page_count() {
    let source = SgeWeeklyReports::default();
    let page_url = source.listing_url(1);
    let page = source
        .parse_listing(&read_fixture("sge-weekly", "listing.html"), &page_url)
        .expect("listing parses");

    assert_eq!(page.total_pages, Some(57));
    assert_eq!(page.entries.len(), 3);

    let first = &page.entries[0];
    assert_eq!(first.detail_url(), "https://www.sge.com.cn/sjzx/hqzb/1000123");
    assert_eq!(first.pdf_url(), None);
    assert_eq!(first.week_start(), NaiveDate::from_ymd_opt(2024, 2, 5));
    assert_eq!(first.week_end(), NaiveDate::from_ymd_opt(2024, 2, 9));

    let direct = &page.entries[1];
    assert_eq!(
        direct.pdf_url(),
        Some("https://www.sge.com.cn/upload/resources/file/2024/02/02/zb20240129-20240202.pdf")
    );
    assert_eq!(direct.week_end(), NaiveDate::from_ymd_opt(2024, 2, 2));
}

#[test]
fn weekly_detail_fixture_resolves_embedded_pdf() {
    let source = SgeWeeklyReports::default();
    let links = source
        .parse_detail(
            &read_fixture("sge-weekly", "detail.html"),
            "https://www.sge.com.cn/sjzx/hqzb/1000123",
        )
        .expect("detail parses");
    assert_eq!(
        links,
        vec!["https://www.sge.com.cn/upload/resources/file/2024/02/09/zb20240205-20240209.pdf"]
    );
}

#[test]
fn monthly_listing_fixture_keeps_reports_and_skips_notices() {
    let source = SgeMonthlyReports::default();
    let page = source
        .parse_listing(&read_fixture("sge-monthly", "listing.html"), &source.listing_url(1))
        .expect("listing parses");

    let urls: Vec<_> = page.entries.iter().map(|e| e.detail_url().to_string()).collect();
    assert_eq!(
        urls,
        vec![
            "https://en.sge.com.cn/data_MonthlyReport/1931".to_string(),
            concat!(
                "https://en.sge.com.cn/upload/resources/file/2024/01/08/",
                "Data%20Highlights--December%202023.pdf"
            )
            .to_string(),
        ]
    );
    assert!(page.entries[0].pdf_url().is_none());
    assert_eq!(report_month_from_url(&urls[1]), Some((2023, 12)));
}

#[test]
fn daily_file_fixtures_give_silver_totals() {
    let with_subtotal = std::fs::read(fixture("shfe-daily", "kx20240105.dat")).unwrap();
    assert_eq!(parse_open_interest(&with_subtotal, SHFE_SILVER_PRODUCT_ID).unwrap(), 635_755);

    let summed = std::fs::read(fixture("shfe-daily", "kx20240108.dat")).unwrap();
    assert_eq!(parse_open_interest(&summed, SHFE_SILVER_PRODUCT_ID).unwrap(), 639_000);
}
