//! Kernel logger
//!
//! Backs the `log` facade with a console sink supplied by the embedder
//! (serial port, VGA, a test buffer). Records are formatted into a fixed
//! stack buffer so logging never allocates and can run with a runqueue
//! lock held.

use core::fmt::Write;

use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use spin::Once;

/// Byte sink the logger writes to
pub trait ConsoleSink: Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

/// Line buffer size; longer records are truncated
const LINE_MAX: usize = 512;

static SINK: Once<&'static dyn ConsoleSink> = Once::new();

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(sink) = SINK.get() else {
            return;
        };

        let level_str = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        let mut buf = [0u8; LINE_MAX];
        let mut writer = BufferWriter::new(&mut buf);
        let _ = writeln!(writer, "[{}] {}", level_str, record.args());
        sink.write_bytes(writer.as_bytes());
    }

    fn flush(&self) {}
}

/// Formatter over a fixed byte buffer; drops what does not fit
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    pos: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.pos]
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }
}

impl Write for BufferWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buffer.len() - self.pos;
        let to_write = bytes.len().min(remaining);

        if to_write > 0 {
            self.buffer[self.pos..self.pos + to_write].copy_from_slice(&bytes[..to_write]);
            self.pos += to_write;
        }

        Ok(())
    }
}

static LOGGER: SimpleLogger = SimpleLogger;

/// Install the logger at `Info`
pub fn init(sink: &'static dyn ConsoleSink) -> Result<(), SetLoggerError> {
    init_with_level(sink, LevelFilter::Info)
}

/// Install the logger with an explicit level.
///
/// The first sink registered stays in place; a second call only fails.
pub fn init_with_level(sink: &'static dyn ConsoleSink, level: LevelFilter) -> Result<(), SetLoggerError> {
    SINK.call_once(|| sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    early_print("[LOGGER] ready\n");
    Ok(())
}

/// Write straight to the sink, bypassing the level filter
pub fn early_print(s: &str) {
    if let Some(sink) = SINK.get() {
        sink.write_bytes(s.as_bytes());
    }
}
