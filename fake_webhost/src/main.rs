use std::{env, fs, path::PathBuf};

use anyhow::{Context, Result};
use aws_sdk_s3::Client as S3Client;
use chrono::{Datelike, Days, Local, NaiveDate};

enum LogDestination {
    LocalDir {
        root: PathBuf,
    },
    S3 {
        client: S3Client,
        bucket: String,
    },
}

impl LogDestination {
    async fn new_from_env() -> Result<Self> {
        let destination_type = env::var("LOG_DESTINATION").unwrap_or_else(|_| "local".to_string());

        match destination_type.as_str() {
            "s3" => {
                let bucket = env::var("S3_BUCKET")
                    .context("S3_BUCKET environment variable required when LOG_DESTINATION=s3")?;

                println!("Initializing S3 client...");
                let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .load()
                    .await;
                let client = S3Client::new(&config);

                println!("  S3 bucket: {}", bucket);

                Ok(LogDestination::S3 { client, bucket })
            }
            _ => {
                let root = env::var("OUT_DIR").unwrap_or_else(|_| "demo_data".to_string());

                println!("Using local directory output");
                println!("  Output root: {}", root);

                Ok(LogDestination::LocalDir {
                    root: PathBuf::from(root),
                })
            }
        }
    }

    async fn write_object(&self, key: &str, content: String) -> Result<()> {
        match self {
            LogDestination::LocalDir { root } => {
                let path = root.join(key);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                fs::write(&path, content)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                Ok(())
            }
            LogDestination::S3 { client, bucket } => {
                client
                    .put_object()
                    .bucket(bucket.as_str())
                    .key(key)
                    .body(content.into_bytes().into())
                    .content_type("text/plain")
                    .send()
                    .await
                    .with_context(|| format!("Failed to write to S3: s3://{}/{}", bucket, key))?;
                Ok(())
            }
        }
    }
}

/// One day's worth of access-log lines for a customer. Deterministic: the
/// same (customer, date) always produces the same file.
fn build_day_log(customer: &str, date: NaiveDate, lines_per_day: usize) -> String {
    let reports: &[&str] = &[
        "daily",
        "summary",
        "weekly",
        "inventory",
        "billing",
        "audit",
    ];
    let targets_with_query: &[&str] = &["?window=7d", "?format=csv", ""];
    let statuses: &[u32] = &[200, 200, 200, 304, 404];

    let seed = customer.bytes().map(usize::from).sum::<usize>() + date.ordinal() as usize;
    let mut out = String::new();

    for i in 0..lines_per_day {
        let hour = (i * 7) % 24;
        let minute = (i * 11) % 60;
        let ip = format!("198.51.100.{}", (seed + i * 3) % 254 + 1);
        let timestamp = format!(
            "{}:{:02}:{:02}:00 +0000",
            date.format("%d/%b/%Y"),
            hour,
            minute
        );

        // Every 9th line is traffic the scanner should not count.
        if i % 9 == 8 {
            out.push_str(&format!(
                "{} - - [{}] \"PUT /api/upload/{} HTTP/1.1\" 201 64\n",
                ip, timestamp, i
            ));
            continue;
        }

        let report = reports[(seed + i) % reports.len()];
        let query = targets_with_query[i % targets_with_query.len()];
        let method = if i % 5 == 4 { "POST" } else { "GET" };
        let status = statuses[i % statuses.len()];
        let bytes = 256 + (i * 37) % 4096;

        out.push_str(&format!(
            "{} - - [{}] \"{} /api/reports/{}{} HTTP/1.1\" {} {}\n",
            ip, timestamp, method, report, query, status, bytes
        ));
    }

    out
}

/// Fake web host: writes synthetic access-log objects shaped like the ones
/// report_scan consumes, one object per customer per day:
///
///   <prefix>/<customer>/host_access_log.YYYY-MM-DD.txt
///
/// Environment variables:
/// - LOG_DESTINATION: "local" or "s3" (default: local)
/// - OUT_DIR: local output root when using local (default: demo_data)
/// - S3_BUCKET: bucket name when using s3 destination (required for s3)
/// - S3_PREFIX: key prefix (default: access_logs)
/// - CUSTOMERS: comma-separated customer ids (default: acme,globex,initech)
/// - DAYS: how many days back to generate, ending today (default: 14)
/// - LINES_PER_DAY: log lines per object (default: 120)
#[tokio::main]
async fn main() -> Result<()> {
    let prefix = env::var("S3_PREFIX").unwrap_or_else(|_| "access_logs".to_string());
    let customers: Vec<String> = env::var("CUSTOMERS")
        .unwrap_or_else(|_| "acme,globex,initech".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let days: u64 = env::var("DAYS")
        .unwrap_or_else(|_| "14".to_string())
        .parse()
        .context("invalid DAYS value")?;
    let lines_per_day: usize = env::var("LINES_PER_DAY")
        .unwrap_or_else(|_| "120".to_string())
        .parse()
        .context("invalid LINES_PER_DAY value")?;

    println!("fake_webhost starting...");
    println!("  Customers: {}", customers.join(", "));
    println!("  Days: {}", days);

    let destination = LogDestination::new_from_env().await?;

    let today = Local::now().date_naive();
    let mut written = 0usize;

    for day_offset in 0..days {
        let date = match today.checked_sub_days(Days::new(day_offset)) {
            Some(date) => date,
            None => break,
        };

        for customer in &customers {
            let key = format!(
                "{}/{}/host_access_log.{}.txt",
                prefix.trim_end_matches('/'),
                customer,
                date.format("%Y-%m-%d")
            );
            let content = build_day_log(customer, date, lines_per_day);

            destination
                .write_object(&key, content)
                .await
                .with_context(|| format!("Failed to write log object {}", key))?;
            written += 1;
        }

        if (day_offset + 1) % 5 == 0 {
            println!("  Generated {} days...", day_offset + 1);
        }
    }

    println!("Done! Wrote {} log objects.", written);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_log_is_deterministic() {
        let date = NaiveDate::from_ymd_opt(2025, 4, 26).unwrap();
        let a = build_day_log("acme", date, 50);
        let b = build_day_log("acme", date, 50);
        assert_eq!(a, b);
        assert_eq!(a.lines().count(), 50);
    }

    #[test]
    fn day_log_mixes_matching_and_noise_lines() {
        let date = NaiveDate::from_ymd_opt(2025, 4, 26).unwrap();
        let log = build_day_log("globex", date, 120);
        let matching = log
            .lines()
            .filter(|l| l.contains("\"GET /api/reports/") || l.contains("\"POST /api/reports/"))
            .count();
        let noise = log.lines().filter(|l| l.contains("\"PUT ")).count();
        assert!(matching > 0);
        assert!(noise > 0);
        assert_eq!(matching + noise, 120);
    }
}
