//! Runtime-configurable switches for the staging core.
//!
//! Backends resolve these once per model instance and pass the resulting
//! flags to [`InputCollector`](crate::InputCollector) and
//! [`OutputResponder`](crate::OutputResponder) constructions.

/// Master switches for batched tensor staging.
#[derive(Debug, Clone)]
pub struct StagingOptions {
    /// Stage host↔device transfers through an intermediate pinned buffer so
    /// many small copies collapse into one bulk asynchronous transfer.
    pub pinned_enabled: bool,
}

impl Default for StagingOptions {
    fn default() -> Self {
        Self {
            pinned_enabled: true,
        }
    }
}

impl StagingOptions {
    /// Load options from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `BATCHSTAGE_PINNED_ENABLED` — "0", "false", or "off" disable pinned
    ///   staging.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(v) = std::env::var("BATCHSTAGE_PINNED_ENABLED") {
            options.pinned_enabled = !matches!(v.trim(), "0" | "false" | "off");
        }

        options
    }
}
