//! Log output for the `wsb` binary.

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::security::AUDIT_TARGET;

/// Filter directives for a `-v` count. Audit events pass at every verbosity.
pub fn default_filter(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("{},{}=info", level, AUDIT_TARGET)
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity flag.
pub fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));
    subscriber(filter, std::io::stderr).init();
}

/// Targets stay visible so audit lines can be told apart from diagnostics.
fn subscriber<W>(filter: EnvFilter, writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(writer)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxId;
    use crate::security::{AuditEvent, AuditLogger, TracingAuditLogger};
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn output(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_default_filter_keeps_audit_events() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = subscriber(EnvFilter::new(default_filter(0)), move || writer.clone());

        tracing::subscriber::with_default(subscriber, || {
            TracingAuditLogger.record(AuditEvent::SandboxStopped {
                sandbox_id: SandboxId::new(),
            });
            tracing::info!("routine progress");
        });

        let output = capture.output();
        assert!(output.contains(AUDIT_TARGET), "output: {output}");
        assert!(output.contains("sandbox_stopped"), "output: {output}");
        assert!(!output.contains("routine progress"), "output: {output}");
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(default_filter(0), "warn,wsb::audit=info");
        assert_eq!(default_filter(2), "debug,wsb::audit=info");
        assert_eq!(default_filter(9), "trace,wsb::audit=info");
        for verbosity in 0..4 {
            assert!(EnvFilter::try_new(default_filter(verbosity)).is_ok());
        }
    }
}
