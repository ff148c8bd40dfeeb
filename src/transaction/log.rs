use tracing::{Level, event};

/// Logging capability injected into the coordinator.
///
/// Every call carries a level, a message and the caller's optional context label.
pub trait TransactionLog: Send + Sync {
    fn log(&self, level: Level, message: &str, context: Option<&str>);
}

/// Default sink: forwards to `tracing` with the context as a structured field.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl TransactionLog for TracingLog {
    fn log(&self, level: Level, message: &str, context: Option<&str>) {
        let context = context.unwrap_or("-");
        match level {
            Level::ERROR => event!(Level::ERROR, context, "{}", message),
            Level::WARN => event!(Level::WARN, context, "{}", message),
            Level::INFO => event!(Level::INFO, context, "{}", message),
            Level::DEBUG => event!(Level::DEBUG, context, "{}", message),
            _ => event!(Level::TRACE, context, "{}", message),
        }
    }
}
