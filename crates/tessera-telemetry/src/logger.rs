use fastrace::local::LocalSpan;
use fastrace::Event;
use log::{Log, Metadata, Record};

/// Writes records through the console logger and, when span events are enabled,
/// mirrors every record that passes the console filter onto the current local span.
pub struct ControlPlaneLogger {
    console: env_logger::Logger,
    span_events: bool,
}

impl ControlPlaneLogger {
    pub fn new(console: env_logger::Logger, span_events: bool) -> Self {
        Self {
            console,
            span_events,
        }
    }

    pub fn filter(&self) -> log::LevelFilter {
        self.console.filter()
    }
}

impl Log for ControlPlaneLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.console.matches(record) {
            return;
        }
        self.console.log(record);
        if self.span_events {
            let event = Event::new(record.level().as_str()).with_properties(|| {
                [
                    ("target", record.target().to_string()),
                    ("message", record.args().to_string()),
                ]
            });
            LocalSpan::add_event(event);
        }
    }

    fn flush(&self) {
        self.console.flush();
    }
}
