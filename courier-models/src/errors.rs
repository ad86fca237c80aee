use thiserror::Error;

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

/// Coded failure reported by binaries, e.g. `health.kafka.publish`.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct RuntimeError {
    code: String,
    message: String,
}

impl RuntimeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn boxed(self) -> SendableError {
        Box::new(self)
    }
}
