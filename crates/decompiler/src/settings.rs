//! Engine settings and the event sink.
//!
//! Both are threaded through the driver explicitly; there is no global
//! state. Settings load from TOML so embedders can keep them in a project
//! file next to their other configuration.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Tunables and behaviour flags for the decompilation driver.
///
/// The caps are not load-bearing: they bound fixpoint loops that converge
/// far earlier on real input, and exceeding one logs a warning rather than
/// failing the procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Stop after initialisation; the procedure is left at Final undecompiled.
    pub no_decompile: bool,
    /// Do not recurse into callees (single-procedure mode).
    pub no_decode_children: bool,
    /// Never promote signatures to a known convention.
    pub no_promote: bool,
    /// Keep unused and null statements.
    pub no_remove_null: bool,
    /// Freeze signatures: no return/parameter updates.
    pub no_change_signatures: bool,
    /// Disable the preservation prover (everything treated as not preserved).
    pub no_prove: bool,
    /// Keep raw locations instead of naming parameters.
    pub no_parameter_names: bool,

    /// Middle-decompile outer pass cap.
    pub middle_pass_cap: u32,
    /// Inner update-returns iterations per middle pass.
    pub update_returns_iters: u32,
    /// Recursion budget for the preservation prover.
    pub prover_budget: u32,
    /// Propagation: max extra copies of a definition per use site.
    pub propagation_fanout: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            no_decompile: false,
            no_decode_children: false,
            no_promote: false,
            no_remove_null: false,
            no_change_signatures: false,
            no_prove: false,
            no_parameter_names: false,
            middle_pass_cap: 12,
            update_returns_iters: 3,
            prover_budget: 64,
            propagation_fanout: 1,
        }
    }
}

impl Settings {
    /// Load settings from TOML text; unknown keys are rejected, missing
    /// keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Settings, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Progress callbacks from the driver. All methods have logging defaults;
/// a GUI or test harness overrides what it cares about. Callbacks are
/// synchronous and must not re-enter the driver.
pub trait EventSink {
    fn considering(&mut self, caller: Option<&str>, name: &str) {
        info!(target: "talon::driver", "considering {name} (from {caller:?})");
    }
    fn start_decompile(&mut self, name: &str) {
        info!(target: "talon::driver", "decompiling {name}");
    }
    fn end_decompile(&mut self, name: &str) {
        info!(target: "talon::driver", "finished {name}");
    }
    fn debug_point(&mut self, name: &str, note: &str) {
        tracing::debug!(target: "talon::driver", "{name}: {note}");
    }
}

/// The default sink: everything goes to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.middle_pass_cap, 12);
        assert_eq!(s.update_returns_iters, 3);
        assert!(!s.no_decompile);
    }

    #[test]
    fn test_from_toml_overrides_some_keys() {
        let s = Settings::from_toml_str("no_prove = true\nmiddle_pass_cap = 4\n").unwrap();
        assert!(s.no_prove);
        assert_eq!(s.middle_pass_cap, 4);
        // Untouched keys keep their defaults.
        assert!(!s.no_decompile);
        assert_eq!(s.update_returns_iters, 3);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(Settings::from_toml_str("no_prove = \"yes\"").is_err());
    }
}
