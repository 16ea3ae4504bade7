//! Status reporting for experiment lifecycles.
//!
//! Components never log through a process-wide reporter of their own. They are
//! handed an [`StatusLogger`] at construction time; [`TracingLogger`] is the
//! default and forwards everything to `tracing` with the experiment name
//! attached.

use tracing::{error, info, warn};

/// Lifecycle reporting capability injected into the harness, trainer and evaluator.
pub trait StatusLogger: Send + Sync {
    fn status(&self, message: &str);
    fn success(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// [`StatusLogger`] backed by `tracing` events.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    experiment: String,
}

impl TracingLogger {
    pub fn new(experiment: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
        }
    }
}

impl StatusLogger for TracingLogger {
    fn status(&self, message: &str) {
        info!(experiment = %self.experiment, "{message}");
    }

    fn success(&self, message: &str) {
        info!(experiment = %self.experiment, outcome = "success", "{message}");
    }

    fn warn(&self, message: &str) {
        warn!(experiment = %self.experiment, "{message}");
    }

    fn error(&self, message: &str) {
        error!(experiment = %self.experiment, "{message}");
    }
}
