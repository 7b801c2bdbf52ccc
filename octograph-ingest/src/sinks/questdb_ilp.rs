use std::{net::SocketAddr, time::Duration};

use chrono::{DateTime, Utc};
use octograph_client::{table_name, Point};
use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::pipeline::{PipelineError, PointSink};

/// Escape measurement/tag keys/tag values/field keys for ILP.
///
/// ILP requires escaping commas, spaces and equals with a backslash.
fn ilp_escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

fn push_tag(out: &mut String, key: &str, value: &str) {
    out.push(',');
    ilp_escape_ident(key, out);
    out.push('=');
    ilp_escape_ident(value, out);
}

fn push_field_f64(out: &mut String, first: &mut bool, key: &str, value: f64) {
    if *first {
        *first = false;
    } else {
        out.push(',');
    }

    ilp_escape_ident(key, out);
    out.push('=');
    out.push_str(&value.to_string());
}

fn ts_to_unix_nanos(ts: DateTime<Utc>) -> i64 {
    // Out of range only past the year 2262.
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// One ILP line for `point` in `table`, without the trailing newline.
///
/// Points without fields have no valid encoding and produce nothing.
pub fn write_ilp_line(table: &str, point: &Point, out: &mut String) -> bool {
    let fields: Vec<(&String, &f64)> = point.fields.iter().filter(|(_, v)| v.is_finite()).collect();
    if fields.is_empty() {
        return false;
    }

    ilp_escape_ident(table, out);
    for (k, v) in &point.tags {
        if !v.is_empty() {
            push_tag(out, k, v);
        }
    }

    out.push(' ');
    let mut first = true;
    for (k, v) in fields {
        push_field_f64(out, &mut first, k, *v);
    }

    out.push(' ');
    out.push_str(&ts_to_unix_nanos(point.time).to_string());
    true
}

/// Writes points to QuestDB over the ILP TCP port.
///
/// Each `write` opens a connection, sends the points in batches of
/// `batch_size` lines and reconnects with linear backoff when a batch fails.
pub struct QuestDbIlpSink {
    addr: SocketAddr,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl QuestDbIlpSink {
    pub fn new(addr: SocketAddr, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            addr,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    async fn connect(&self) -> Result<TcpStream, PipelineError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| PipelineError::Sink(format!("failed to connect to QuestDB ILP: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    fn encode_batch(&self, bucket: &str, batch: &[Point]) -> (Vec<u8>, usize) {
        // Heuristic capacity: ~200 bytes per line.
        let mut s = String::with_capacity(batch.len().saturating_mul(200));
        let mut lines = 0;
        for point in batch {
            if write_ilp_line(&table_name(bucket, &point.measurement), point, &mut s) {
                s.push('\n');
                lines += 1;
            }
        }
        (s.into_bytes(), lines)
    }

    async fn flush_batch(&self, stream: &mut TcpStream, bucket: &str, batch: &[Point]) -> Result<(), PipelineError> {
        let (payload, lines) = self.encode_batch(bucket, batch);
        if lines == 0 {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            match stream.write_all(&payload).await {
                Ok(()) => {
                    metrics::counter!("questdb_ingested_records_total").increment(lines as u64);
                    metrics::counter!("questdb_ilp_bytes_total").increment(payload.len() as u64);
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "QuestDB ILP flush failed, reconnecting and retrying"
                    );
                    metrics::counter!("questdb_ilp_retry_total").increment(1);

                    tokio::time::sleep(sleep_for).await;
                    *stream = self.connect().await?;
                }
                Err(e) => {
                    tracing::error!(error = %e, "QuestDB ILP flush failed, giving up");
                    metrics::counter!("questdb_ilp_sink_errors_total").increment(1);
                    return Err(PipelineError::Sink(format!("ilp write failed: {e}")));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl PointSink for QuestDbIlpSink {
    async fn write(&self, bucket: &str, points: Vec<Point>) -> Result<(), PipelineError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut stream = self.connect().await?;
        for batch in points.chunks(self.batch_size) {
            self.flush_batch(&mut stream, bucket, batch).await?;
        }
        stream
            .flush()
            .await
            .map_err(|e| PipelineError::Sink(format!("ilp flush failed: {e}")))?;

        // Best-effort close.
        let _ = stream.shutdown().await;

        Ok(())
    }
}
