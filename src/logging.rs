use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

/// Log-line format used in run logs: `[DDMmmYY HH:MM:SS] [LEVEL: ]message`.
/// INFO lines carry no level tag; everything else is prefixed.
struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(writer, "[{}] ", crate::util::timestamp())?;
        match *event.metadata().level() {
            Level::ERROR => write!(writer, "ERROR: ")?,
            Level::WARN => write!(writer, "WARN: ")?,
            Level::DEBUG | Level::TRACE => write!(writer, "DEBUG: ")?,
            Level::INFO => {}
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Writes every log line to stdout and to the per-run log file.
#[derive(Clone)]
pub struct TeeWriter {
    file: Arc<Mutex<File>>,
}

pub struct TeeHandle {
    file: Arc<Mutex<File>>,
}

impl Write for TeeHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        if let Ok(mut file) = self.file.lock() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        if let Ok(mut file) = self.file.lock() {
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for TeeWriter {
    type Writer = TeeHandle;

    fn make_writer(&'a self) -> Self::Writer {
        TeeHandle {
            file: Arc::clone(&self.file),
        }
    }
}

/// Map a `--log-level` name to a tracing filter.
pub fn level_filter(log_level: &str) -> LevelFilter {
    match log_level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::ERROR,
        "WARN" => LevelFilter::WARN,
        "DEBUG" => LevelFilter::DEBUG,
        _ => LevelFilter::INFO,
    }
}

/// Initialize logging for a run: custom line format, teed to stdout and the
/// run log file. Returns an error if the log file cannot be created.
pub fn init(log_file: &Path, log_level: &str) -> anyhow::Result<()> {
    let file = File::create(log_file)
        .map_err(|e| anyhow::anyhow!("creating log file {:?}: {}", log_file, e))?;
    let tee = TeeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .event_format(LineFormat)
                .with_writer(tee)
                .with_filter(level_filter(log_level)),
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_mapping() {
        assert_eq!(level_filter("ERROR"), LevelFilter::ERROR);
        assert_eq!(level_filter("warn"), LevelFilter::WARN);
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("INFO"), LevelFilter::INFO);
        assert_eq!(level_filter("bogus"), LevelFilter::INFO);
    }
}
