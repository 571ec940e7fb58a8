//! Where a run reports its outcome.

use crate::error::SyncError;
use crate::shadow::ShadowAck;

/// Receives the single outcome record of a run.
///
/// The driver owns the sink for its lifetime and calls [`ReportSink::flush`]
/// on every exit path, after the outcome has been recorded.
pub trait ReportSink {
    /// The shadow accepted the update.
    fn updated(&mut self, ack: &ShadowAck);

    /// The run failed.
    fn failed(&mut self, error: &SyncError);

    fn flush(&mut self) {}
}

impl<S: ReportSink + ?Sized> ReportSink for &mut S {
    fn updated(&mut self, ack: &ShadowAck) {
        (**self).updated(ack);
    }

    fn failed(&mut self, error: &SyncError) {
        (**self).failed(error);
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}

/// Writes outcome records through the crate's logging backend.
///
/// Duplicating records to a log file and the console is the job of the
/// installed logger.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn updated(&mut self, ack: &ShadowAck) {
        info!(
            "shadow updated: temperature={} version={}",
            ack.temperature, ack.version
        );
    }

    fn failed(&mut self, error: &SyncError) {
        error!(
            "shadow sync failed (exit code {}): {}",
            error.exit_code(),
            error
        );
    }

    fn flush(&mut self) {
        #[cfg(feature = "log")]
        ::log::logger().flush();
    }
}
