//! The structured failure a probe reports.

use std::sync::Arc;

use check_smtp_client::ClientError;
use thiserror::Error;

use crate::step::Step;

/// A failure attributed to the step that produced it.
///
/// Cloning shares the underlying cause.
#[derive(Debug, Clone, Error)]
#[error("{step} failed: {source}")]
pub struct ProbeError {
    step: Step,
    #[source]
    source: Arc<ClientError>,
}

impl ProbeError {
    pub fn new(step: Step, source: ClientError) -> Self {
        Self {
            step,
            source: Arc::new(source),
        }
    }

    pub const fn step(&self) -> Step {
        self.step
    }

    pub fn cause(&self) -> &ClientError {
        &self.source
    }
}

/// Specialized `Result` type for probe procedures.
pub type ProbeResult<T> = std::result::Result<T, ProbeError>;
