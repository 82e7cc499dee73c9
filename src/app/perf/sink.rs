//! Consumers of sampler output. The sampler publishes one [`PerfEvent`] at a
//! time and stops when a sink reports it is closed.

use std::fmt;
use std::io::Write;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

use crate::app::models::PerfEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

impl fmt::Display for SinkClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sample sink closed")
    }
}

impl std::error::Error for SinkClosed {}

pub trait PerfSink: Send + Sync {
    fn publish(&self, event: PerfEvent) -> Result<(), SinkClosed>;
}

pub type PerfEmitter = Arc<dyn Fn(PerfEvent) + Send + Sync>;

/// Fire-and-forget callback; never closes.
pub struct CallbackSink {
    emitter: PerfEmitter,
}

impl CallbackSink {
    pub fn new(emitter: PerfEmitter) -> Self {
        Self { emitter }
    }
}

impl PerfSink for CallbackSink {
    fn publish(&self, event: PerfEvent) -> Result<(), SinkClosed> {
        (self.emitter)(event);
        Ok(())
    }
}

/// Queue-style delivery; closes once the receiver is dropped.
pub struct ChannelSink {
    tx: Mutex<Sender<PerfEvent>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<PerfEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl PerfSink for ChannelSink {
    fn publish(&self, event: PerfEvent) -> Result<(), SinkClosed> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(event)
            .map_err(|_| SinkClosed)
    }
}

/// One JSON object per line, for log files and remote viewers.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> PerfSink for JsonLinesSink<W> {
    fn publish(&self, event: PerfEvent) -> Result<(), SinkClosed> {
        let line = serde_json::to_string(&event).map_err(|_| SinkClosed)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}").map_err(|_| SinkClosed)?;
        out.flush().map_err(|_| SinkClosed)
    }
}

pub fn table_header() -> String {
    format!(
        "{:<10} | {:<10} | {:<5} | {:<7} | {:<10} | {:<12} | {:<15} | {:<6}",
        "Timestamp", "Elapsed", "CPU", "RAM", "GPU", "Missed Vsync", "Janky", "FPS"
    )
}

/// Human-readable console table; the header is printed before the first row.
pub struct TableSink<W: Write + Send> {
    out: Mutex<(W, bool)>,
}

impl<W: Write + Send> TableSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new((out, false)),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }
}

impl<W: Write + Send> PerfSink for TableSink<W> {
    fn publish(&self, event: PerfEvent) -> Result<(), SinkClosed> {
        let mut guard = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let (out, header_written) = &mut *guard;
        match event {
            PerfEvent::Status { message, .. } => {
                writeln!(out, "{message}").map_err(|_| SinkClosed)?;
            }
            PerfEvent::Sample(sample) => {
                if !*header_written {
                    let header = table_header();
                    writeln!(out, "{header}").map_err(|_| SinkClosed)?;
                    writeln!(out, "{}", "-".repeat(header.len())).map_err(|_| SinkClosed)?;
                    *header_written = true;
                }
                writeln!(
                    out,
                    "{:<10} | {:<10} | {:<5} | {:<7} | {:<10} | {:<12} | {:<15} | {:<6}",
                    sample.clock_label(),
                    sample.elapsed_label(),
                    sample.cpu.as_str(),
                    sample.ram.as_str(),
                    sample.gpu.as_str(),
                    sample.missed_vsync.as_str(),
                    sample.jank.to_string(),
                    sample.fps.as_str(),
                )
                .map_err(|_| SinkClosed)?;
            }
        }
        out.flush().map_err(|_| SinkClosed)
    }
}
