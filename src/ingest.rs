// =============================================================================
// Alert source: newline-delimited JSON alerts forwarded over an mpsc channel
// =============================================================================
//
// One alert per line.  Blank lines and `#` comments are skipped; a line that
// fails to parse is logged and dropped so one bad notice never stalls the
// stream.  Alerts are forwarded in the order they were read.
// =============================================================================

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::alert::AlertRecord;

/// Parse one line.  `Ok(None)` for lines that carry no alert.
pub fn parse_alert_line(line: &str) -> Result<Option<AlertRecord>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let alert = serde_json::from_str(trimmed).context("failed to parse alert JSON")?;
    Ok(Some(alert))
}

/// Read alerts from `path` ("-" for stdin) until EOF or the receiver goes
/// away.  Returns how many alerts were forwarded.
pub async fn run_alert_source(path: String, tx: mpsc::Sender<AlertRecord>) -> Result<usize> {
    if path == "-" {
        info!("reading alerts from stdin");
        return forward(BufReader::new(tokio::io::stdin()), &tx, "stdin").await;
    }

    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("failed to open alert source {}", path))?;
    info!(path = %path, "reading alerts from file");
    forward(BufReader::new(file), &tx, &path).await
}

async fn forward<R>(reader: R, tx: &mpsc::Sender<AlertRecord>, source: &str) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut forwarded = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("failed to read from {}", source))?
    {
        line_no += 1;
        match parse_alert_line(&line) {
            Ok(Some(alert)) => {
                debug!(trig_id = %alert.trig_id, line = line_no, "alert read");
                if tx.send(alert).await.is_err() {
                    warn!(source, "alert receiver dropped, stopping source");
                    break;
                }
                forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(source, line = line_no, error = %error, "dropping malformed alert");
            }
        }
    }

    info!(source, forwarded, "alert source exhausted");
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceType;

    const GW_LINE: &str = r#"{"telescope":"LVC","trig_id":"S240601a","event_type":"Preliminary","observed":"2024-06-01T13:59:00Z","source_type":"GW","instruments":"H1,L1","far":"1e-10"}"#;

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_alert_line("   ").unwrap().is_none());
        assert!(parse_alert_line("# replayed from broker").unwrap().is_none());
    }

    #[test]
    fn gw_line_parses() {
        let alert = parse_alert_line(GW_LINE).unwrap().unwrap();
        assert_eq!(alert.source_type(), SourceType::Gw);
        assert_eq!(alert.trig_id, "S240601a");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        assert!(parse_alert_line(r#"{"telescope":"LVC"}"#).is_err());
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_and_order_kept() {
        let second = GW_LINE.replace("S240601a", "S240601b");
        let input = format!("{}\nnot json\n\n{}\n", GW_LINE, second);
        let (tx, mut rx) = mpsc::channel(8);

        let forwarded = forward(BufReader::new(input.as_bytes()), &tx, "test")
            .await
            .unwrap();
        drop(tx);

        assert_eq!(forwarded, 2);
        assert_eq!(rx.recv().await.unwrap().trig_id, "S240601a");
        assert_eq!(rx.recv().await.unwrap().trig_id, "S240601b");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn file_source_reads_every_alert() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        std::fs::write(&path, format!("{}\n", GW_LINE)).unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let forwarded = run_alert_source(path.display().to_string(), tx)
            .await
            .unwrap();
        assert_eq!(forwarded, 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let (tx, _rx) = mpsc::channel(1);
        let err = run_alert_source("/nonexistent/alerts.jsonl".into(), tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to open alert source"));
    }
}
