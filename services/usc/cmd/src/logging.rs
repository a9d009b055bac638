use anyhow::Result;
use std::fmt;
use std::fmt::Write as _;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths for alignment
const COMPONENT_WIDTH: usize = 16;
const LOG_LEVEL_WIDTH: usize = 5;

/// Crates whose events follow the `--log-level` flag
const USC_TARGETS: &[&str] = &["usc", "usc_wire", "usc_session", "usc_monitor"];

/// `[timestamp] [component] [LEVEL] message key=value` lines
pub struct UscLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl UscLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for UscLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let color = self.color_for_level(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{:<width$}{}{}] ",
            cyan,
            timestamp,
            self.format_component(visitor.component.as_deref()),
            color,
            level.as_str(),
            reset,
            cyan,
            width = LOG_LEVEL_WIDTH
        )?;
        writeln!(writer, "{}{}{}", reset, visitor.message, visitor.fields)
    }
}

/// Pulls the message and component out of an event, keeps the rest
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: String,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => self.component = Some(format!("{:?}", value).trim_matches('"').to_string()),
            name => {
                let _ = write!(self.fields, " {}={:?}", name, value);
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {}={}", name, value);
            }
        }
    }
}

/// Whether stdout looks like a color-capable terminal
fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

/// Filter from `RUST_LOG` if set, else `level` for USC crates and `info` elsewhere
pub fn env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::new("info");
    for target in USC_TARGETS {
        filter = filter.add_directive(format!("{}={}", target, level).parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber
pub fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level)?)
        .with_target(false)
        .with_ansi(true)
        .event_format(UscLogFormatter::new("usc"))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_column() {
        let formatter = UscLogFormatter {
            service_name: "usc".to_string(),
            color_enabled: false,
        };
        assert_eq!(formatter.format_component(None), format!("{:<16}", "usc"));
        assert_eq!(formatter.format_component(Some("monitor")).trim_end(), "usc-monitor");
        let long = formatter.format_component(Some("a-very-long-component"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_env_filter_accepts_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(env_filter(level).is_ok());
        }
    }
}
