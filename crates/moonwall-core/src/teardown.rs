//! Collected outcome of a teardown.

use moonwall_proto::{Error, Result};
use tracing::{info, warn};

/// Failures gathered while tearing an environment down.
///
/// Teardown always runs to the end; each failed step lands here instead of
/// aborting the remaining steps.
#[derive(Debug, Default)]
pub struct TeardownReport {
    errors: Vec<Error>,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the failure of a step on `entity`, if it failed.
    pub fn record(&mut self, entity: &str, result: Result<()>) {
        if let Err(e) = result {
            self.errors.push(match e {
                Error::Teardown { .. } => e,
                other => Error::teardown(entity, other),
            });
        }
    }

    pub fn extend(&mut self, errors: impl IntoIterator<Item = Error>) {
        self.errors.extend(errors);
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.errors.extend(other.errors);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Logs every failure at warn level.
    pub fn log(&self, what: &str) {
        if self.errors.is_empty() {
            info!(what = %what, "Teardown complete");
            return;
        }
        for error in &self.errors {
            warn!(what = %what, error = %error, "Teardown step failed");
        }
        warn!(what = %what, failures = self.errors.len(), "Teardown completed with failures");
    }
}
