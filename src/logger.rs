//! Injected logger, per §6: "logger(level, message) — injected by the host."
//!
//! The crate depends only on the `log` facade, never a concrete subscriber; installing a
//! subscriber (env_logger, syslog, tracing-log, ...) is the host process's job, listed as
//! an external collaborator in §1. [`GlobalLogger`] is the default [`Logger`] and simply
//! forwards to the `log` facade's global dispatch. A host that wants log records routed
//! somewhere other than the `log` facade (e.g. into a supervisor's own structured stream)
//! can supply a different [`Logger`] implementation via [`crate::config::Config`].

use log::Level;
use std::sync::Arc;

/// A sink for block-store log records.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
}

/// Forwards every record to the `log` crate's global dispatch.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalLogger;

impl Logger for GlobalLogger {
    fn log(&self, level: Level, message: &str) {
        log::log!(level, "{}", message);
    }
}

impl GlobalLogger {
    pub fn shared() -> Arc<dyn Logger> {
        Arc::new(Self)
    }
}
