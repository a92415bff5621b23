use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use fastrace::collector::{Config, ConsoleReporter, Reporter, SpanRecord};
use log::debug;
use tessera_common::config::TelemetryConfig;

use crate::error::{TelemetryError, TelemetryResult};
use crate::logger::ControlPlaneLogger;

enum TelemetryStatus {
    Uninitialized,
    Initialized,
    Failed,
    Finalized,
}

static TELEMETRY_STATUS: Mutex<TelemetryStatus> = Mutex::new(TelemetryStatus::Uninitialized);

/// Installs the process-wide logger and span reporter.
/// Telemetry can be initialized at most once per process.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryResult<()> {
    let mut status = TELEMETRY_STATUS
        .lock()
        .map_err(|e| TelemetryError::internal(e.to_string()))?;

    match *status {
        TelemetryStatus::Uninitialized => match init_traces(config).and_then(|()| init_logs(config))
        {
            Ok(()) => {
                debug!("telemetry initialized");
                *status = TelemetryStatus::Initialized;
                Ok(())
            }
            Err(e) => {
                *status = TelemetryStatus::Failed;
                Err(e)
            }
        },
        TelemetryStatus::Initialized => {
            Err(TelemetryError::internal("telemetry already initialized"))
        }
        TelemetryStatus::Failed => Err(TelemetryError::internal(
            "telemetry failed to initialize previously",
        )),
        TelemetryStatus::Finalized => Err(TelemetryError::internal(
            "telemetry has been finalized and cannot be re-initialized",
        )),
    }
}

fn init_traces(config: &TelemetryConfig) -> TelemetryResult<()> {
    if config.export_traces {
        if config.traces_report_interval_secs == 0 {
            return Err(TelemetryError::invalid(
                "traces report interval must be positive",
            ));
        }
        let interval = Duration::from_secs(config.traces_report_interval_secs);
        let reporter_config = Config::default().report_interval(interval);
        fastrace::set_reporter(ConsoleReporter, reporter_config);
    } else {
        fastrace::set_reporter(NoOpReporter, Config::default().report_interval(Duration::MAX));
    }
    Ok(())
}

fn init_logs(config: &TelemetryConfig) -> TelemetryResult<()> {
    let console =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format(move |buf, record| {
                let level = record.level();
                let style = buf.default_level_style(level);
                writeln!(
                    buf,
                    "[{} {style}{level}{style:#} {}] {}",
                    buf.timestamp(),
                    record.target(),
                    record.args()
                )
            })
            .build();
    let logger = ControlPlaneLogger::new(console, config.log_span_events);
    let max_level = logger.filter();
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| TelemetryError::internal(e.to_string()))?;
    log::set_max_level(max_level);
    Ok(())
}

/// Flushes pending spans. Further calls to [`init_telemetry`] fail afterwards.
pub fn shutdown_telemetry() {
    debug!("shutting down telemetry");
    fastrace::flush();
    if let Ok(mut status) = TELEMETRY_STATUS.lock() {
        if let TelemetryStatus::Initialized = *status {
            *status = TelemetryStatus::Finalized;
        }
    }
}

/// A fastrace reporter that drops every span.
pub struct NoOpReporter;

impl Reporter for NoOpReporter {
    fn report(&mut self, _spans: Vec<SpanRecord>) {}
}

#[cfg(test)]
mod tests {
    use tessera_common::config::AppConfig;

    use super::*;

    #[test]
    fn test_telemetry_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = AppConfig::defaults()?.telemetry;
        config.log_span_events = true;
        init_telemetry(&config)?;
        assert!(init_telemetry(&config).is_err());
        shutdown_telemetry();
        assert!(init_telemetry(&config).is_err());
        Ok(())
    }
}
