// netblast: network access emulator runtime
//
// Wires the packet engine together from configuration: capture pipeline,
// interfaces with their rings and streams, and the cooperative run loop
// driving every I/O job off one timer root. The runtime owns the whole
// engine context and threads it through bring-up explicitly; nothing
// reads global state after initialization.

pub mod config;
pub mod sink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use netblast_capture::{CaptureError, CaptureSink};
use netblast_io::{
    CaptureRegistration, Interface, InterfaceReport, PacketSink, RingOpenError,
};
use netblast_stream::{Stream, StreamError, StreamTable};
use netblast_timer::{Timestamp, TimerRoot};

use crate::config::{Config, ConfigError};

/// Keep the run loop responsive to shutdown even with sparse timers.
const MAX_LOOP_SLEEP: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum BringUpError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ring(#[from] RingOpenError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Counters emitted on shutdown.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub interfaces: Vec<InterfaceReport>,
    pub capture_flush_failures: u64,
}

/// The assembled engine.
pub struct Runtime {
    root: TimerRoot,
    interfaces: Vec<Interface>,
    capture: Option<Arc<CaptureSink>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("interfaces", &self.interfaces.len())
            .finish()
    }
}

impl Runtime {
    /// Bring up every configured interface. Fails closed: the first
    /// ring or stream error aborts bring-up and already-opened
    /// interfaces are torn down by drop.
    pub fn from_config(config: &Config, sink: Arc<dyn PacketSink>) -> Result<Self, BringUpError> {
        config.validate()?;

        let capture = match &config.capture {
            Some(cap) => Some(Arc::new(CaptureSink::create(&cap.file)?)),
            None => None,
        };
        let include_streams = config
            .capture
            .as_ref()
            .map(|cap| cap.include_streams)
            .unwrap_or(false);

        let mut root = TimerRoot::new();
        let mut interfaces = Vec::with_capacity(config.interfaces.len());
        let now = Timestamp::now();
        for link in &config.interfaces {
            let mut table = StreamTable::new();
            for stream_cfg in config.streams.iter().filter(|s| s.interface == link.name) {
                table.push(Stream::new(
                    stream_cfg.name.clone(),
                    stream_cfg.template_bytes()?,
                    stream_cfg.rate_pps,
                    stream_cfg.burst,
                    stream_cfg.mutation(),
                    now,
                )?);
            }
            let registration = capture.as_ref().map(|sink| CaptureRegistration {
                sink: sink.clone(),
                include_streams,
            });
            interfaces.push(Interface::up(
                link,
                table,
                sink.clone(),
                registration,
                &mut root,
            )?);
        }

        Ok(Runtime {
            root,
            interfaces,
            capture,
        })
    }

    pub fn interfaces(&mut self) -> &mut [Interface] {
        &mut self.interfaces
    }

    /// Drive the timer root until `stop` is raised or the optional
    /// duration elapses.
    pub fn run(&mut self, stop: &AtomicBool, duration: Option<Duration>) {
        let deadline = duration.map(|d| Instant::now() + d);
        while !stop.load(Ordering::Acquire) {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
            let sleep = self.root.tick().min(MAX_LOOP_SLEEP);
            std::thread::sleep(sleep);
        }
    }

    /// Tear everything down in order and emit the final counters.
    pub fn shutdown(mut self) -> RunReport {
        let mut reports = Vec::with_capacity(self.interfaces.len());
        for interface in self.interfaces.drain(..) {
            reports.push(interface.down(&mut self.root));
        }
        let capture_flush_failures = match &self.capture {
            Some(capture) => {
                capture.flush();
                capture.flush_failures()
            }
            None => 0,
        };
        RunReport {
            interfaces: reports,
            capture_flush_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::EtherTypeSink;

    #[test]
    fn empty_config_runs_and_shuts_down() {
        let config = Config::default();
        let mut runtime =
            Runtime::from_config(&config, Arc::new(EtherTypeSink::default())).unwrap();
        let stop = AtomicBool::new(false);
        runtime.run(&stop, Some(Duration::from_millis(10)));
        let report = runtime.shutdown();
        assert!(report.interfaces.is_empty());
        assert_eq!(report.capture_flush_failures, 0);
    }

    #[test]
    fn raised_stop_flag_ends_run_immediately() {
        let config = Config::default();
        let mut runtime =
            Runtime::from_config(&config, Arc::new(EtherTypeSink::default())).unwrap();
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        runtime.run(&stop, None);
        assert!(started.elapsed() < Duration::from_millis(100));
        runtime.shutdown();
    }

    #[test]
    fn unknown_interface_fails_bring_up() {
        let config: Config = toml::from_str(
            r#"
[[interface]]
name = "netblast-does-not-exist-0"
"#,
        )
        .unwrap();
        let err = Runtime::from_config(&config, Arc::new(EtherTypeSink::default())).unwrap_err();
        assert!(matches!(err, BringUpError::Ring(_)));
    }
}
