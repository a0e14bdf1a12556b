use std::{
    collections::{BTreeSet, HashMap},
    env,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use aws_config::{meta::region::RegionProviderChain, BehaviorVersion, Region};
use aws_sdk_s3::Client as S3Client;
use chrono::{Days, Local, NaiveDate};
use regex::Regex;

/// Key prefix used when the source names only a bucket or a bare directory.
const DEFAULT_PREFIX: &str = "access_logs/";

/// Only objects with this extension are considered log files.
const LOG_EXT: &str = ".txt";

const DATE_FMT: &str = "%Y-%m-%d";

/// Matches the request line inside an access-log entry and captures the
/// request target, e.g. `"GET /api/reports/daily?x=1 HTTP/1.1"`.
const REQUEST_LINE_PATTERN: &str = r#""(?:GET|POST) (.*?) HTTP/1\.\d""#;

#[derive(Debug)]
struct Config {
    source: String,
    customer: Option<String>,
    start: NaiveDate,
    end: NaiveDate,
    top: Option<usize>,
    out_dir: Option<String>,
    prefix: Option<String>,
    list_customers: bool,
}

/// Why one listed key was left out of the scan. Per-item conditions are
/// recorded here instead of raised, so the pass never stops early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    NotLogFile,
    BadDate,
    AmbiguousDate,
    OutOfRange,
    CustomerMismatch,
}

/// Per-run diagnostics: how many keys were listed, how many objects made it
/// through each stage, and a tally per skip reason.
#[derive(Debug, Default, PartialEq, Eq)]
struct ScanStats {
    keys_listed: u64,
    objects_parsed: u64,
    lines_matched: u64,
    not_log_file: u64,
    bad_date: u64,
    ambiguous_date: u64,
    out_of_range: u64,
    customer_mismatch: u64,
    fetch_failed: u64,
    decode_failed: u64,
}

impl ScanStats {
    fn note_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NotLogFile => self.not_log_file += 1,
            SkipReason::BadDate => self.bad_date += 1,
            SkipReason::AmbiguousDate => self.ambiguous_date += 1,
            SkipReason::OutOfRange => self.out_of_range += 1,
            SkipReason::CustomerMismatch => self.customer_mismatch += 1,
        }
    }

    fn print_summary(&self) {
        eprintln!(
            "Parsed {} of {} listed objects, {} request lines matched",
            self.objects_parsed, self.keys_listed, self.lines_matched
        );
        let skips = [
            ("not a log file", self.not_log_file),
            ("bad date token", self.bad_date),
            ("ambiguous date token", self.ambiguous_date),
            ("outside date range", self.out_of_range),
            ("other customer", self.customer_mismatch),
            ("fetch failed", self.fetch_failed),
            ("not valid UTF-8", self.decode_failed),
        ];
        for (label, count) in skips {
            if count > 0 {
                eprintln!("  skipped {}: {}", count, label);
            }
        }
    }
}

/// The per-invocation query: inclusive date range plus an optional exact
/// customer match (`None` means all customers).
#[derive(Debug, Clone)]
struct ScanFilter {
    start: NaiveDate,
    end: NaiveDate,
    customer: Option<String>,
}

impl ScanFilter {
    fn label(&self) -> String {
        format!(
            "'{}' {}–{}",
            self.customer.as_deref().unwrap_or("All"),
            self.start,
            self.end
        )
    }
}

/// One (report, calls) row of the ranked result.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
struct ReportCount {
    report: String,
    calls: u64,
}

/// Counts per report token in first-seen order, so that ties in the final
/// ranking stay stable on insertion order.
#[derive(Debug, Default)]
struct FrequencyTable {
    counts: HashMap<String, u64>,
    order: Vec<String>,
}

impl FrequencyTable {
    fn record(&mut self, token: &str) {
        match self.counts.get_mut(token) {
            Some(count) => *count += 1,
            None => {
                self.counts.insert(token.to_string(), 1);
                self.order.push(token.to_string());
            }
        }
    }

    fn into_ranked(self) -> Vec<ReportCount> {
        let counts = self.counts;
        let mut ranked: Vec<ReportCount> = self
            .order
            .into_iter()
            .map(|report| {
                let calls = counts.get(&report).copied().unwrap_or(0);
                ReportCount { report, calls }
            })
            .collect();
        // Stable sort: equal counts keep first-seen order.
        ranked.sort_by(|a, b| b.calls.cmp(&a.calls));
        ranked
    }
}

/// Everything one Analyze invocation produces. An empty `ranked` after a
/// successful scan is the "no entries found" condition, not an error.
#[derive(Debug)]
struct ScanReport {
    label: String,
    ranked: Vec<ReportCount>,
    stats: ScanStats,
}

fn filename_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Customer segment of a key laid out as `<prefix>customer/...`: the first
/// segment after the effective prefix, valid only when at least a filename
/// follows it. Keys outside the prefix or without that extra segment carry
/// no customer.
fn customer_of<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    let (customer, remainder) = rest.split_once('/')?;
    if customer.is_empty() || remainder.is_empty() {
        return None;
    }
    Some(customer)
}

/// Distinct customer ids under the prefix, deduplicated and sorted.
fn distinct_customers(keys: &[String], prefix: &str) -> Vec<String> {
    let customers: BTreeSet<&str> = keys.iter().filter_map(|k| customer_of(k, prefix)).collect();
    customers.into_iter().map(str::to_string).collect()
}

/// Decide whether one listed key belongs to the scan. Returns the log date
/// on keep, or the reason it was left out.
///
/// The date token is the second-to-last dot-delimited segment of the
/// filename (`host_access_log.2025-04-26.txt`). A filename with more than
/// one date-like segment is ambiguous and excluded rather than guessed at.
fn classify_key(key: &str, prefix: &str, filter: &ScanFilter) -> Result<NaiveDate, SkipReason> {
    if !key.ends_with(LOG_EXT) {
        return Err(SkipReason::NotLogFile);
    }

    let name = filename_of(key);
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() < 2 {
        return Err(SkipReason::BadDate);
    }
    let date_like = segments
        .iter()
        .filter(|s| NaiveDate::parse_from_str(s, DATE_FMT).is_ok())
        .count();
    if date_like > 1 {
        return Err(SkipReason::AmbiguousDate);
    }
    let token = segments[segments.len() - 2];
    let date = NaiveDate::parse_from_str(token, DATE_FMT).map_err(|_| SkipReason::BadDate)?;

    if date < filter.start || date > filter.end {
        return Err(SkipReason::OutOfRange);
    }

    if let Some(want) = &filter.customer {
        match customer_of(key, prefix) {
            Some(customer) if customer == want => {}
            // No customer segment counts as a mismatch, not a crash.
            _ => return Err(SkipReason::CustomerMismatch),
        }
    }

    Ok(date)
}

/// Report token of one log line: the request target captured by the
/// pattern, reduced to its final path segment with any query string dropped.
fn extract_report_token(line: &str, pattern: &Regex) -> Option<String> {
    let target = pattern.captures(line)?.get(1)?.as_str();
    let tail = target.rsplit('/').next().unwrap_or(target);
    let token = tail.split('?').next().unwrap_or(tail);
    Some(token.to_string())
}

/// The object-store collaborator: list keys under a prefix (paging hidden)
/// and fetch one object's bytes. A local directory tree works the same way
/// as a bucket, with slash-joined relative paths as keys.
#[derive(Debug)]
enum LogStore {
    S3 {
        client: S3Client,
        bucket: String,
    },
    Local {
        root: PathBuf,
    },
    #[cfg(test)]
    Memory {
        objects: std::collections::BTreeMap<String, Vec<u8>>,
        fail_listing: bool,
        fail_keys: std::collections::BTreeSet<String>,
    },
}

impl LogStore {
    /// Open the source: `s3://bucket[/prefix]` or a local directory.
    /// Returns the store plus the effective key prefix.
    async fn connect(source: &str, prefix_override: Option<&str>) -> Result<(LogStore, String)> {
        if let Some(rest) = source.strip_prefix("s3://") {
            let (bucket, uri_prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                bail!("S3 source is missing a bucket name: {}", source);
            }
            if !uri_prefix.is_empty() && prefix_override.is_some() {
                bail!(
                    "--prefix conflicts with the prefix already embedded in {}",
                    source
                );
            }

            let region =
                RegionProviderChain::default_provider().or_else(Region::new("us-west-2"));
            let aws_conf = aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            let client = S3Client::new(&aws_conf);

            let prefix = if !uri_prefix.is_empty() {
                uri_prefix.to_string()
            } else {
                prefix_override.unwrap_or(DEFAULT_PREFIX).to_string()
            };
            Ok((
                LogStore::S3 {
                    client,
                    bucket: bucket.to_string(),
                },
                normalize_prefix(prefix),
            ))
        } else {
            let root = PathBuf::from(source);
            if !root.is_dir() {
                bail!("log directory not found: {}", source);
            }
            let prefix = prefix_override.unwrap_or(DEFAULT_PREFIX).to_string();
            Ok((LogStore::Local { root }, normalize_prefix(prefix)))
        }
    }

    /// List every key under `prefix`. Pagination is handled here; any store
    /// access error is propagated so a connectivity or permission problem
    /// fails the invocation instead of looking like an empty result.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            LogStore::S3 { client, bucket } => {
                let mut keys = Vec::new();
                let mut pages = client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(prefix)
                    .into_paginator()
                    .send();
                while let Some(page) = pages.next().await {
                    let page = page.with_context(|| {
                        format!("Failed to list s3://{}/{}", bucket, prefix)
                    })?;
                    for obj in page.contents() {
                        if let Some(key) = obj.key() {
                            keys.push(key.to_string());
                        }
                    }
                }
                Ok(keys)
            }
            LogStore::Local { root } => {
                let mut keys = Vec::new();
                walk_files(root, root, &mut keys)?;
                keys.retain(|k| k.starts_with(prefix));
                keys.sort();
                Ok(keys)
            }
            #[cfg(test)]
            LogStore::Memory {
                objects,
                fail_listing,
                ..
            } => {
                if *fail_listing {
                    bail!("listing refused");
                }
                Ok(objects
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect())
            }
        }
    }

    /// Fetch one object's full byte content.
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        match self {
            LogStore::S3 { client, bucket } => {
                let resp = client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .with_context(|| format!("Failed to fetch s3://{}/{}", bucket, key))?;
                let bytes = resp
                    .body
                    .collect()
                    .await
                    .with_context(|| format!("Failed to read body of {}", key))?
                    .into_bytes()
                    .to_vec();
                Ok(bytes)
            }
            LogStore::Local { root } => {
                let path = root.join(key);
                std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
            }
            #[cfg(test)]
            LogStore::Memory {
                objects, fail_keys, ..
            } => {
                if fail_keys.contains(key) {
                    bail!("access denied: {}", key);
                }
                objects
                    .get(key)
                    .cloned()
                    .with_context(|| format!("no such object: {}", key))
            }
        }
    }
}

fn normalize_prefix(mut prefix: String) -> String {
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

fn walk_files(root: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_files(root, &path, keys)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            keys.push(key.join("/"));
        }
    }
    Ok(())
}

/// One Analyze invocation: list, filter, fetch, parse, tally, rank.
///
/// A failure of the listing itself is fatal and returned as an error.
/// Everything after that is per-object: a key with a bad or out-of-range
/// date token, a fetch error, or non-UTF-8 content only removes that one
/// object from the result and the scan carries on.
async fn scan(store: &LogStore, prefix: &str, filter: &ScanFilter) -> Result<ScanReport> {
    let pattern = Regex::new(REQUEST_LINE_PATTERN).context("invalid request-line pattern")?;

    let keys = store
        .list_keys(prefix)
        .await
        .context("Listing log objects failed")?;

    let mut stats = ScanStats {
        keys_listed: keys.len() as u64,
        ..ScanStats::default()
    };
    let mut table = FrequencyTable::default();

    for key in &keys {
        if let Err(reason) = classify_key(key, prefix, filter) {
            stats.note_skip(reason);
            continue;
        }

        let bytes = match store.get_bytes(key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                stats.fetch_failed += 1;
                eprintln!("warning: skipping {}: {:#}", key, err);
                continue;
            }
        };
        let body = match String::from_utf8(bytes) {
            Ok(body) => body,
            Err(_) => {
                stats.decode_failed += 1;
                eprintln!("warning: skipping {}: not valid UTF-8", key);
                continue;
            }
        };

        stats.objects_parsed += 1;
        for line in body.lines() {
            if let Some(token) = extract_report_token(line, &pattern) {
                table.record(&token);
                stats.lines_matched += 1;
            }
        }
    }

    Ok(ScanReport {
        label: filter.label(),
        ranked: table.into_ranked(),
        stats,
    })
}

fn parse_args() -> Result<Config> {
    let mut args = env::args().skip(1);
    let source = match args.next() {
        Some(s) => s,
        None => bail!(
            "Usage: report_scan <s3://bucket[/prefix] | log_dir> [OPTIONS]\n\n\
             Options:\n  \
             --customer NAME     Only scan this customer (default: all)\n  \
             --start YYYY-MM-DD  Inclusive range start (default: 7 days ago)\n  \
             --end YYYY-MM-DD    Inclusive range end (default: today)\n  \
             --top N             Limit output to the N most-called reports\n  \
             --out DIR           Write report_usage.csv and report.html into DIR\n  \
             --prefix PREFIX     Key prefix (default: access_logs/)\n  \
             --list-customers    Print distinct customer ids and exit\n\n\
             AWS credentials and region come from the environment\n\
             (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION).\n\n\
             Examples:\n  \
             report_scan s3://data-eng-datalake-test --customer acme --start 2025-04-25 --end 2025-04-27\n  \
             report_scan ./demo_data --out ./reports\n  \
             report_scan s3://data-eng-datalake-test --list-customers"
        ),
    };

    let today = Local::now().date_naive();
    let mut customer: Option<String> = None;
    let mut start = today.checked_sub_days(Days::new(7)).unwrap_or(today);
    let mut end = today;
    let mut top: Option<usize> = None;
    let mut out_dir: Option<String> = None;
    let mut prefix: Option<String> = None;
    let mut list_customers = false;

    let rest: Vec<String> = args.collect();
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--customer" => {
                let value = rest.get(i + 1).context("--customer requires a name")?;
                customer = match value.as_str() {
                    "All" | "all" => None,
                    name => Some(name.to_string()),
                };
                i += 2;
            }
            "--start" => {
                let value = rest
                    .get(i + 1)
                    .context("--start requires a date (YYYY-MM-DD)")?;
                start = NaiveDate::parse_from_str(value, DATE_FMT)
                    .with_context(|| format!("invalid --start date '{}'", value))?;
                i += 2;
            }
            "--end" => {
                let value = rest
                    .get(i + 1)
                    .context("--end requires a date (YYYY-MM-DD)")?;
                end = NaiveDate::parse_from_str(value, DATE_FMT)
                    .with_context(|| format!("invalid --end date '{}'", value))?;
                i += 2;
            }
            "--top" => {
                let value = rest.get(i + 1).context("--top requires a numeric value")?;
                top = Some(
                    value
                        .parse::<usize>()
                        .context("invalid value for --top")?,
                );
                i += 2;
            }
            "--out" => {
                let value = rest.get(i + 1).context("--out requires a directory path")?;
                out_dir = Some(value.clone());
                i += 2;
            }
            "--prefix" => {
                let value = rest.get(i + 1).context("--prefix requires a key prefix")?;
                prefix = Some(value.clone());
                i += 2;
            }
            "--list-customers" => {
                list_customers = true;
                i += 1;
            }
            other => bail!("Unknown argument: {}", other),
        }
    }

    if start > end {
        bail!("--start {} is after --end {}", start, end);
    }

    Ok(Config {
        source,
        customer,
        start,
        end,
        top,
        out_dir,
        prefix,
        list_customers,
    })
}

/// Data embedded into the HTML report.
#[derive(serde::Serialize)]
struct HtmlReportData<'a> {
    label: &'a str,
    reports: &'a [ReportCount],
}

fn write_html_report(path: &str, report: &ScanReport) -> Result<()> {
    let data = HtmlReportData {
        label: &report.label,
        reports: &report.ranked,
    };
    let json_data = serde_json::to_string(&data).context("Failed to serialize report to JSON")?;

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Report Usage</title>
    <style>
        * {{ box-sizing: border-box; }}
        body {{ font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif; margin: 0; padding: 20px; background: #f5f5f5; }}
        .container {{ max-width: 1000px; margin: 0 auto; }}
        h1 {{ color: #333; margin-bottom: 10px; }}
        .meta {{ color: #666; margin-bottom: 20px; font-size: 14px; }}
        .controls {{ background: white; padding: 15px; border-radius: 8px; margin-bottom: 20px; box-shadow: 0 1px 3px rgba(0,0,0,0.1); display: flex; gap: 15px; align-items: center; }}
        .controls input[type="range"] {{ flex: 1; }}
        .panel {{ display: grid; grid-template-columns: 1fr 1fr; gap: 20px; }}
        .card {{ background: white; padding: 20px; border-radius: 8px; box-shadow: 0 1px 3px rgba(0,0,0,0.1); }}
        table {{ width: 100%; border-collapse: collapse; }}
        th, td {{ padding: 10px 12px; text-align: left; border-bottom: 1px solid #eee; }}
        th {{ background: #4a90a4; color: white; }}
        .legend {{ display: flex; flex-wrap: wrap; gap: 8px; margin-top: 12px; font-size: 13px; }}
        .legend span {{ display: inline-flex; align-items: center; gap: 5px; }}
        .swatch {{ width: 12px; height: 12px; border-radius: 3px; display: inline-block; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Report Usage</h1>
        <div class="meta" id="meta"></div>
        <div class="controls">
            <label>Top N reports:</label>
            <input type="range" id="topN" min="1" value="1">
            <strong id="topNValue"></strong>
        </div>
        <div class="panel">
            <div class="card">
                <svg id="pie" viewBox="-1.1 -1.1 2.2 2.2" width="100%"></svg>
                <div class="legend" id="legend"></div>
            </div>
            <div class="card">
                <table>
                    <thead><tr><th>Report</th><th>Calls</th></tr></thead>
                    <tbody id="rows"></tbody>
                </table>
            </div>
        </div>
    </div>
    <script>
        const REPORT = {json_data};
        const palette = ['#4a90a4', '#e07b39', '#7bb661', '#c94c4c', '#8e6bb0',
                         '#d4a017', '#4c7fc9', '#5bb8a0', '#b65c8a', '#999999'];
        const slider = document.getElementById('topN');
        slider.max = REPORT.reports.length;
        slider.value = Math.min(10, REPORT.reports.length);

        function arcPath(a0, a1) {{
            const x0 = Math.sin(a0), y0 = -Math.cos(a0);
            const x1 = Math.sin(a1), y1 = -Math.cos(a1);
            const large = a1 - a0 > Math.PI ? 1 : 0;
            return `M 0 0 L ${{x0}} ${{y0}} A 1 1 0 ${{large}} 1 ${{x1}} ${{y1}} Z`;
        }}

        function render() {{
            const n = parseInt(slider.value);
            const top = REPORT.reports.slice(0, n);
            const total = top.reduce((sum, r) => sum + r.calls, 0);
            document.getElementById('topNValue').textContent = n;
            document.getElementById('meta').textContent =
                `Top ${{n}} report usage for ${{REPORT.label}} · ${{total.toLocaleString()}} calls`;

            const pie = document.getElementById('pie');
            pie.innerHTML = '';
            let angle = 0;
            top.forEach((r, idx) => {{
                const sweep = total > 0 ? (r.calls / total) * 2 * Math.PI : 0;
                const path = document.createElementNS('http://www.w3.org/2000/svg', 'path');
                path.setAttribute('d', arcPath(angle, angle + sweep));
                path.setAttribute('fill', palette[idx % palette.length]);
                pie.appendChild(path);
                angle += sweep;
            }});

            document.getElementById('legend').innerHTML = top.map((r, idx) =>
                `<span><span class="swatch" style="background:${{palette[idx % palette.length]}}"></span>${{r.report}}</span>`
            ).join('');

            document.getElementById('rows').innerHTML = top.map(r =>
                `<tr><td>${{r.report}}</td><td>${{r.calls.toLocaleString()}}</td></tr>`
            ).join('');
        }}

        slider.addEventListener('input', render);
        render();
    </script>
</body>
</html>"#,
        json_data = json_data,
    );

    std::fs::write(path, html).with_context(|| format!("Failed to write {}", path))?;
    Ok(())
}

fn print_csv(ranked: &[ReportCount], top: Option<usize>) {
    println!("report,calls");
    let limit = top.unwrap_or(ranked.len());
    for row in ranked.iter().take(limit) {
        println!("{},{}", row.report, row.calls);
    }
}

fn write_outputs(out_dir: &str, report: &ScanReport, top: Option<usize>) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory: {}", out_dir))?;

    let csv_path = format!("{}/report_usage.csv", out_dir);
    let mut csv = String::from("report,calls\n");
    let limit = top.unwrap_or(report.ranked.len());
    for row in report.ranked.iter().take(limit) {
        csv.push_str(&format!("{},{}\n", row.report, row.calls));
    }
    std::fs::write(&csv_path, csv).with_context(|| format!("Failed to create {}", csv_path))?;
    eprintln!("Report usage written to: {}", csv_path);

    let html_path = format!("{}/report.html", out_dir);
    write_html_report(&html_path, report)?;
    eprintln!("HTML report written to: {}", html_path);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = parse_args()?;

    let (store, prefix) = LogStore::connect(&config.source, config.prefix.as_deref()).await?;

    if config.list_customers {
        let keys = store
            .list_keys(&prefix)
            .await
            .context("Listing log objects failed")?;
        for customer in distinct_customers(&keys, &prefix) {
            println!("{}", customer);
        }
        return Ok(());
    }

    let filter = ScanFilter {
        start: config.start,
        end: config.end,
        customer: config.customer.clone(),
    };
    eprintln!("Analyzing {}...", filter.label());

    let report = scan(&store, &prefix, &filter).await?;
    report.stats.print_summary();

    if report.ranked.is_empty() {
        eprintln!("No entries found for {}.", report.label);
        return Ok(());
    }

    print_csv(&report.ranked, config.top);

    if let Some(out_dir) = &config.out_dir {
        write_outputs(out_dir, &report, config.top)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FMT).unwrap()
    }

    fn filter(customer: Option<&str>, start: &str, end: &str) -> ScanFilter {
        ScanFilter {
            start: date(start),
            end: date(end),
            customer: customer.map(str::to_string),
        }
    }

    fn memory_store(objects: &[(&str, &str)]) -> LogStore {
        LogStore::Memory {
            objects: objects
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
            fail_listing: false,
            fail_keys: BTreeSet::new(),
        }
    }

    fn line(method: &str, target: &str) -> String {
        format!(
            "198.51.100.7 - - [26/Apr/2025:10:00:00 +0000] \"{} {} HTTP/1.1\" 200 512",
            method, target
        )
    }

    #[test]
    fn malformed_date_never_passes() {
        let f = filter(None, "2020-01-01", "2030-12-31");
        for key in [
            "access_logs/acme/host_access_log.20250426.txt",
            "access_logs/acme/host_access_log.2025_04_26.txt",
            "access_logs/acme/host_access_log.txt",
            "access_logs/acme/nodate.txt",
        ] {
            assert_eq!(classify_key(key, "access_logs/", &f), Err(SkipReason::BadDate), "{}", key);
        }
    }

    #[test]
    fn wrong_extension_rejected() {
        let f = filter(None, "2025-04-01", "2025-04-30");
        assert_eq!(
            classify_key("access_logs/acme/host_access_log.2025-04-26.gz", "access_logs/", &f),
            Err(SkipReason::NotLogFile)
        );
    }

    #[test]
    fn date_boundaries_inclusive() {
        let f = filter(None, "2025-04-25", "2025-04-27");
        assert_eq!(
            classify_key("access_logs/acme/host.2025-04-25.txt", "access_logs/", &f),
            Ok(date("2025-04-25"))
        );
        assert_eq!(
            classify_key("access_logs/acme/host.2025-04-27.txt", "access_logs/", &f),
            Ok(date("2025-04-27"))
        );
        assert_eq!(
            classify_key("access_logs/acme/host.2025-04-24.txt", "access_logs/", &f),
            Err(SkipReason::OutOfRange)
        );
        assert_eq!(
            classify_key("access_logs/acme/host.2025-04-28.txt", "access_logs/", &f),
            Err(SkipReason::OutOfRange)
        );
    }

    #[test]
    fn two_date_tokens_are_ambiguous() {
        let f = filter(None, "2020-01-01", "2030-12-31");
        assert_eq!(
            classify_key("access_logs/acme/host.2025-04-25.2025-04-26.txt", "access_logs/", &f),
            Err(SkipReason::AmbiguousDate)
        );
    }

    #[test]
    fn customer_match_is_exact_and_case_sensitive() {
        let f = filter(Some("acme"), "2025-04-01", "2025-04-30");
        assert!(classify_key("access_logs/acme/host.2025-04-26.txt", "access_logs/", &f).is_ok());
        assert_eq!(
            classify_key("access_logs/Acme/host.2025-04-26.txt", "access_logs/", &f),
            Err(SkipReason::CustomerMismatch)
        );
        assert_eq!(
            classify_key("access_logs/acme2/host.2025-04-26.txt", "access_logs/", &f),
            Err(SkipReason::CustomerMismatch)
        );
    }

    #[test]
    fn key_without_customer_segment_is_a_mismatch() {
        let f = filter(Some("acme"), "2025-04-01", "2025-04-30");
        assert_eq!(
            classify_key("access_logs/host.2025-04-26.txt", "access_logs/", &f),
            Err(SkipReason::CustomerMismatch)
        );
        // Without a requested customer the same key still scans.
        let all = filter(None, "2025-04-01", "2025-04-30");
        assert!(classify_key("access_logs/host.2025-04-26.txt", "access_logs/", &all).is_ok());
    }

    #[test]
    fn report_token_extraction() {
        let pattern = Regex::new(REQUEST_LINE_PATTERN).unwrap();
        assert_eq!(
            extract_report_token(&line("GET", "/api/reports/daily?x=1"), &pattern),
            Some("daily".to_string())
        );
        assert_eq!(
            extract_report_token(&line("POST", "/reports/summary"), &pattern),
            Some("summary".to_string())
        );
        assert_eq!(
            extract_report_token("no request line here", &pattern),
            None
        );
        assert_eq!(
            extract_report_token(&line("PUT", "/api/reports/daily"), &pattern),
            None
        );
        // HTTP/2 style version strings do not match the pattern.
        assert_eq!(
            extract_report_token("\"GET /api/reports/daily HTTP/2\"", &pattern),
            None
        );
    }

    #[test]
    fn ranking_sorts_descending_with_stable_ties() {
        let mut table = FrequencyTable::default();
        for token in ["daily", "summary", "summary", "weekly", "daily", "summary"] {
            table.record(token);
        }
        let ranked = table.into_ranked();
        assert_eq!(
            ranked,
            vec![
                ReportCount {
                    report: "summary".to_string(),
                    calls: 3
                },
                ReportCount {
                    report: "daily".to_string(),
                    calls: 2
                },
                ReportCount {
                    report: "weekly".to_string(),
                    calls: 1
                },
            ]
        );

        // Ties keep first-seen order.
        let mut table = FrequencyTable::default();
        for token in ["b", "a", "b", "a"] {
            table.record(token);
        }
        let ranked = table.into_ranked();
        assert_eq!(ranked[0].report, "b");
        assert_eq!(ranked[1].report, "a");
    }

    #[test]
    fn aggregation_is_order_independent() {
        let tokens = ["daily", "summary", "daily", "weekly", "summary", "daily"];
        let mut forward = FrequencyTable::default();
        for t in tokens {
            forward.record(t);
        }
        let mut backward = FrequencyTable::default();
        for t in tokens.iter().rev() {
            backward.record(t);
        }
        let forward: BTreeMap<String, u64> = forward
            .into_ranked()
            .into_iter()
            .map(|r| (r.report, r.calls))
            .collect();
        let backward: BTreeMap<String, u64> = backward
            .into_ranked()
            .into_iter()
            .map(|r| (r.report, r.calls))
            .collect();
        assert_eq!(forward, backward);
    }

    #[test]
    fn distinct_customers_deduped_and_sorted() {
        let keys: Vec<String> = [
            "access_logs/globex/host.2025-04-26.txt",
            "access_logs/acme/host.2025-04-26.txt",
            "access_logs/acme/host.2025-04-27.txt",
            "access_logs/orphan.txt",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(distinct_customers(&keys, "access_logs/"), vec!["acme", "globex"]);
    }

    #[tokio::test]
    async fn end_to_end_scan() {
        let in_range = [
            line("GET", "/api/reports/summary?window=7d"),
            line("GET", "/api/reports/summary"),
            line("POST", "/api/reports/daily"),
        ]
        .join("\n");
        let out_of_range = [
            line("GET", "/api/reports/summary"),
            line("GET", "/api/reports/summary"),
        ]
        .join("\n");
        let store = memory_store(&[
            ("access_logs/acme/host.2025-04-20.txt", out_of_range.as_str()),
            ("access_logs/acme/host.2025-04-26.txt", in_range.as_str()),
        ]);

        let f = filter(Some("acme"), "2025-04-25", "2025-04-27");
        let report = scan(&store, "access_logs/", &f).await.unwrap();

        assert_eq!(
            report.ranked,
            vec![
                ReportCount {
                    report: "summary".to_string(),
                    calls: 2
                },
                ReportCount {
                    report: "daily".to_string(),
                    calls: 1
                },
            ]
        );
        assert_eq!(report.stats.keys_listed, 2);
        assert_eq!(report.stats.objects_parsed, 1);
        assert_eq!(report.stats.out_of_range, 1);
        assert_eq!(report.stats.lines_matched, 3);
        assert_eq!(report.label, "'acme' 2025-04-25\u{2013}2025-04-27");
    }

    #[tokio::test]
    async fn empty_result_is_not_an_error() {
        let store = memory_store(&[(
            "access_logs/acme/host.2025-04-26.txt",
            "nothing resembling a request line",
        )]);
        let f = filter(Some("acme"), "2025-04-25", "2025-04-27");
        let report = scan(&store, "access_logs/", &f).await.unwrap();
        assert!(report.ranked.is_empty());
        assert_eq!(report.stats.objects_parsed, 1);

        // Same when the filter matches no objects at all.
        let f = filter(Some("globex"), "2025-04-25", "2025-04-27");
        let report = scan(&store, "access_logs/", &f).await.unwrap();
        assert!(report.ranked.is_empty());
        assert_eq!(report.stats.customer_mismatch, 1);
    }

    #[tokio::test]
    async fn listing_failure_is_fatal() {
        let store = LogStore::Memory {
            objects: BTreeMap::new(),
            fail_listing: true,
            fail_keys: BTreeSet::new(),
        };
        let f = filter(None, "2025-04-25", "2025-04-27");
        let err = scan(&store, "access_logs/", &f).await.unwrap_err();
        assert!(err.to_string().contains("Listing log objects failed"));
    }

    #[tokio::test]
    async fn undecodable_object_is_skipped_not_fatal() {
        let good = line("GET", "/api/reports/daily");
        let store = LogStore::Memory {
            objects: BTreeMap::from([
                (
                    "access_logs/acme/host.2025-04-26.txt".to_string(),
                    vec![0xff, 0xfe, 0x00],
                ),
                (
                    "access_logs/acme/other.2025-04-26.txt".to_string(),
                    good.into_bytes(),
                ),
            ]),
            fail_listing: false,
            fail_keys: BTreeSet::new(),
        };
        let f = filter(Some("acme"), "2025-04-25", "2025-04-27");
        let report = scan(&store, "access_logs/", &f).await.unwrap();
        assert_eq!(report.stats.decode_failed, 1);
        assert_eq!(report.stats.objects_parsed, 1);
        assert_eq!(
            report.ranked,
            vec![ReportCount {
                report: "daily".to_string(),
                calls: 1
            }]
        );
    }

    #[tokio::test]
    async fn deep_prefix_customer_derivation() {
        // The customer is the first segment after the effective prefix,
        // regardless of how many segments the prefix itself has.
        let acme_lines = line("GET", "/api/reports/daily");
        let globex_lines = line("GET", "/api/reports/summary");
        let store = memory_store(&[
            ("logs/prod/acme/host.2025-04-26.txt", acme_lines.as_str()),
            ("logs/prod/globex/host.2025-04-26.txt", globex_lines.as_str()),
        ]);

        let f = filter(Some("acme"), "2025-04-25", "2025-04-27");
        let report = scan(&store, "logs/prod/", &f).await.unwrap();
        assert_eq!(report.stats.customer_mismatch, 1);
        assert_eq!(
            report.ranked,
            vec![ReportCount {
                report: "daily".to_string(),
                calls: 1
            }]
        );

        let keys: Vec<String> = [
            "logs/prod/acme/host.2025-04-26.txt",
            "logs/prod/globex/host.2025-04-26.txt",
            "logs/prod/stray.txt",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            distinct_customers(&keys, "logs/prod/"),
            vec!["acme", "globex"]
        );
    }

    #[tokio::test]
    async fn unfetchable_object_is_skipped_not_fatal() {
        let good = line("GET", "/api/reports/summary");
        let store = LogStore::Memory {
            objects: BTreeMap::from([
                (
                    "access_logs/acme/host.2025-04-26.txt".to_string(),
                    line("GET", "/api/reports/daily").into_bytes(),
                ),
                (
                    "access_logs/acme/other.2025-04-26.txt".to_string(),
                    good.into_bytes(),
                ),
            ]),
            fail_listing: false,
            fail_keys: BTreeSet::from(["access_logs/acme/host.2025-04-26.txt".to_string()]),
        };
        let f = filter(Some("acme"), "2025-04-25", "2025-04-27");
        let report = scan(&store, "access_logs/", &f).await.unwrap();
        assert_eq!(report.stats.fetch_failed, 1);
        assert_eq!(report.stats.objects_parsed, 1);
        assert_eq!(
            report.ranked,
            vec![ReportCount {
                report: "summary".to_string(),
                calls: 1
            }]
        );
    }

    #[tokio::test]
    async fn uri_prefix_conflicts_with_prefix_flag() {
        let err = LogStore::connect("s3://bucket/logs/", Some("other/"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--prefix conflicts"));
    }

    #[test]
    fn query_string_only_target_yields_empty_token() {
        let pattern = Regex::new(REQUEST_LINE_PATTERN).unwrap();
        // A trailing slash leaves an empty final segment; it still counts.
        assert_eq!(
            extract_report_token(&line("GET", "/api/reports/"), &pattern),
            Some(String::new())
        );
    }
}
