// SPDX-License-Identifier: AGPL-3.0-only

//! Per-dispatch kernel trace.
//!
//! Every dispatch is recorded with its device start/end; every
//! `flush_batch` dispatches the records are written as trace events, one
//! JSON object per line, in the format chrome://tracing and Perfetto
//! load. Timestamps are microseconds since the first recorded dispatch.

use crate::backend::DispatchTiming;
use crate::error::{ContextError, Result};
use serde::Serialize;
use std::io::Write;

/// One complete ("X") trace event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub pid: u32,
    pub tid: u32,
    /// Start, µs since the first dispatch.
    pub ts: f64,
    /// Duration, µs.
    pub dur: f64,
    pub ph: &'static str,
    pub name: String,
}

/// Buffers dispatch timings and writes them to a sink.
pub struct KernelProfiler {
    sink: Box<dyn Write + Send>,
    pending: Vec<(String, DispatchTiming)>,
    flush_batch: usize,
    epoch_ns: Option<u64>,
    written: usize,
}

impl KernelProfiler {
    #[must_use]
    pub fn new(sink: Box<dyn Write + Send>, flush_batch: usize) -> Self {
        Self {
            sink,
            pending: Vec::new(),
            flush_batch: flush_batch.max(1),
            epoch_ns: None,
            written: 0,
        }
    }

    /// Record one dispatch, flushing when the batch is full.
    ///
    /// # Errors
    ///
    /// [`ContextError::Backend`] if the sink cannot be written.
    pub fn record(&mut self, kernel: &str, timing: DispatchTiming) -> Result<()> {
        self.pending.push((kernel.to_string(), timing));
        if self.pending.len() >= self.flush_batch {
            self.flush()?;
        }
        Ok(())
    }

    /// Events written so far.
    #[must_use]
    pub const fn written(&self) -> usize {
        self.written
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Write every pending record.
    ///
    /// # Errors
    ///
    /// [`ContextError::Backend`] if the sink cannot be written.
    #[allow(clippy::cast_precision_loss)]
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let epoch = *self
            .epoch_ns
            .get_or_insert_with(|| self.pending.first().map_or(0, |(_, t)| t.start_ns));
        let io = |e: std::io::Error| ContextError::Backend(format!("writing kernel trace: {e}"));
        for (name, t) in self.pending.drain(..) {
            let event = TraceEvent {
                pid: 1,
                tid: 1,
                ts: 0.001 * t.start_ns.saturating_sub(epoch) as f64,
                dur: 0.001 * t.end_ns.saturating_sub(t.start_ns) as f64,
                ph: "X",
                name,
            };
            let line = serde_json::to_string(&event)
                .map_err(|e| ContextError::Backend(format!("encoding trace event: {e}")))?;
            writeln!(self.sink, "{line}").map_err(io)?;
            self.written += 1;
        }
        self.sink.flush().map_err(io)?;
        log::debug!("kernel trace flushed ({} events total)", self.written);
        Ok(())
    }
}

impl Drop for KernelProfiler {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("{e}");
        }
    }
}

impl std::fmt::Debug for KernelProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelProfiler")
            .field("pending", &self.pending.len())
            .field("flush_batch", &self.flush_batch)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedSink {
        fn lines(&self) -> Vec<serde_json::Value> {
            let text = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
        }
    }

    fn timing(start_ns: u64, end_ns: u64) -> DispatchTiming {
        DispatchTiming { start_ns, end_ns }
    }

    #[test]
    fn flushes_every_batch() {
        let sink = SharedSink::default();
        let mut p = KernelProfiler::new(Box::new(sink.clone()), 3);
        p.record("a", timing(1000, 3000)).unwrap();
        p.record("b", timing(4000, 5000)).unwrap();
        assert!(sink.lines().is_empty());
        p.record("c", timing(6000, 6500)).unwrap();
        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["name"], "a");
        assert_eq!(lines[0]["ph"], "X");
        assert_eq!(lines[0]["ts"], 0.0);
        assert_eq!(lines[0]["dur"], 2.0);
        assert_eq!(lines[1]["ts"], 3.0);
        assert_eq!(p.pending(), 0);
    }

    #[test]
    fn drop_flushes_remainder() {
        let sink = SharedSink::default();
        {
            let mut p = KernelProfiler::new(Box::new(sink.clone()), 500);
            p.record("reduceForces", timing(10, 20)).unwrap();
        }
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["pid"], 1);
        assert_eq!(lines[0]["tid"], 1);
    }

    #[test]
    fn epoch_is_kept_across_flushes() {
        let sink = SharedSink::default();
        let mut p = KernelProfiler::new(Box::new(sink.clone()), 1);
        p.record("a", timing(2000, 2000)).unwrap();
        p.record("b", timing(5000, 6000)).unwrap();
        let lines = sink.lines();
        assert_eq!(lines[1]["ts"], 3.0);
        assert_eq!(p.written(), 2);
    }
}
