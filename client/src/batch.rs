//! Batch mode
//!
//! Sends every URL of a list over one tunnel connection with a bounded
//! number of requests in flight, then prints a summary table.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use mirrorgate_shared::TunnelMessage;
use tracing::{info, warn};

use crate::tunnel::TunnelClient;

/// Outcome of one line of the batch file
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub line: usize,
    pub url: String,
    pub id: Option<u64>,
    pub status: Option<u16>,
    pub bytes: usize,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl BatchEntry {
    pub fn ok(&self) -> bool {
        self.error.is_none() && matches!(self.status, Some(200..=299))
    }
}

/// URLs from a batch file: one per line, blank lines and `#` comments skipped
pub fn read_urls(content: &str) -> Vec<(usize, String)> {
    content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
        .map(|(i, l)| (i, l.to_string()))
        .collect()
}

pub async fn run(
    client: &TunnelClient,
    urls: Vec<(usize, String)>,
    headers: &BTreeMap<String, String>,
    concurrency: usize,
) -> Vec<BatchEntry> {
    info!("Sending {} request(s), {} at a time", urls.len(), concurrency);

    let mut entries: Vec<BatchEntry> = stream::iter(urls)
        .map(|(line, url)| async move {
            let mut message = TunnelMessage::get(0, url.clone());
            message.headers = headers.clone();
            let started = Instant::now();
            let outcome = client.send(message).await;
            let elapsed = started.elapsed();
            match outcome {
                Ok(result) => BatchEntry {
                    line,
                    url,
                    id: Some(result.id),
                    status: Some(result.status),
                    bytes: result.body.len(),
                    elapsed,
                    error: result.error,
                },
                Err(e) => {
                    warn!("Line {} ({}) failed: {}", line, url, e);
                    BatchEntry {
                        line,
                        url,
                        id: None,
                        status: None,
                        bytes: 0,
                        elapsed,
                        error: Some(e.to_string()),
                    }
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    entries.sort_by_key(|e| e.line);
    entries
}

pub fn summary(entries: &[BatchEntry], finished_at: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Batch finished at {}", finished_at.to_rfc3339());
    let _ = writeln!(out, "{:>5}  {:>6}  {:>10}  {:>9}  URL", "ID", "STATUS", "BYTES", "MS");
    for e in entries {
        let id = e.id.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        let status = e.status.map(|s| s.to_string()).unwrap_or_else(|| "ERR".into());
        let _ = writeln!(
            out,
            "{:>5}  {:>6}  {:>10}  {:>9}  {}",
            id,
            status,
            e.bytes,
            e.elapsed.as_millis(),
            e.url
        );
        if let Some(err) = &e.error {
            let _ = writeln!(out, "       error: {}", err);
        }
    }
    let ok = entries.iter().filter(|e| e.ok()).count();
    let total_bytes: usize = entries.iter().map(|e| e.bytes).sum();
    let _ = write!(
        out,
        "{} ok, {} failed, {} bytes",
        ok,
        entries.len() - ok,
        total_bytes
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_read_urls_skips_comments() {
        let content = "# pages\nhttp://a.test/\n\n  http://b.test/x  \n#http://c.test/\n";
        let urls = read_urls(content);
        assert_eq!(
            urls,
            vec![(2, "http://a.test/".to_string()), (4, "http://b.test/x".to_string())]
        );
    }

    #[test]
    fn test_summary() {
        let entries = vec![
            BatchEntry {
                line: 1,
                url: "http://a.test/".into(),
                id: Some(1),
                status: Some(200),
                bytes: 120,
                elapsed: Duration::from_millis(15),
                error: None,
            },
            BatchEntry {
                line: 2,
                url: "http://b.test/".into(),
                id: Some(2),
                status: Some(502),
                bytes: 7,
                elapsed: Duration::from_millis(40),
                error: Some("refused".into()),
            },
        ];
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let text = summary(&entries, at);
        assert!(text.starts_with("Batch finished at 2024-03-01T12:00:00+00:00"));
        assert!(text.contains("error: refused"));
        assert!(text.ends_with("1 ok, 1 failed, 127 bytes"));
    }
}
