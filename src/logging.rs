use colored::Colorize;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Formatter for the user-facing stdout layer.
///
/// Renders events the way proxy operators read them while watching
/// traffic: a `[*]` marker for routine lines, `[!]` for anything that
/// needs attention, the line tinted by severity. Timestamps, targets and
/// levels stay in the detail log; the console carries only the marker and
/// the event fields.
pub struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Fields are buffered first so the marker and tint cover the
        // whole line.
        let mut line = String::new();
        ctx.format_fields(Writer::new(&mut line), event)?;

        let rendered = match *event.metadata().level() {
            Level::ERROR => format!("[!] {line}").red(),
            Level::WARN => format!("[!] {line}").yellow(),
            Level::INFO => format!("[*] {line}").normal(),
            Level::DEBUG => format!("[-] {line}").blue(),
            Level::TRACE => format!("[-] {line}").dimmed(),
        };
        writeln!(writer, "{rendered}")
    }
}
