//! # Engine configuration
//!
//! Instance-scoped knobs the spec leaves as implementation choices (optimizer
//! iteration bound, `ORDER_INDEX` mode, live-collection id prefix), loaded the
//! way the teacher's `Config` is: layered `figment` providers, `FLOWQUERY_`-
//! prefixed environment overrides, a working `Default` with no config file
//! present.
//!
//! ```toml
//! # flowquery.toml
//! optimizer_max_iterations = 32
//! order_index_mode = "fractional"
//! live_id_prefix = "live-query"
//! ```
//!
//! ```bash
//! FLOWQUERY_OPTIMIZER_MAX_ITERATIONS=64
//! FLOWQUERY_ORDER_INDEX_MODE=numeric
//! ```

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// `ORDER_INDEX` flavor spec.md §9 "Numeric vs string ordering" requires
/// both of: dense numeric positions, or fractional string keys that let
/// insertions avoid renumbering siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderIndexMode {
    Numeric,
    Fractional,
}

impl Default for OrderIndexMode {
    fn default() -> Self {
        OrderIndexMode::Fractional
    }
}

/// Engine-instance-scoped configuration (spec.md §4.4 rule 9, §4.5 step 7,
/// §4.6, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on the optimizer's fixpoint loop (spec.md §4.4: "applied to a
    /// fixed point, bounded by a recursion depth").
    #[serde(default = "default_max_iterations")]
    pub optimizer_max_iterations: usize,

    /// Which `ORDER_INDEX` flavor `topK` output annotates positions with.
    #[serde(default)]
    pub order_index_mode: OrderIndexMode,

    /// Prefix for auto-generated live-query ids (spec.md §4.6:
    /// `live-query-N`, monotonically counted).
    #[serde(default = "default_live_id_prefix")]
    pub live_id_prefix: String,
}

fn default_max_iterations() -> usize {
    16
}

fn default_live_id_prefix() -> String {
    "live-query".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            optimizer_max_iterations: default_max_iterations(),
            order_index_mode: OrderIndexMode::default(),
            live_id_prefix: default_live_id_prefix(),
        }
    }
}

impl EngineConfig {
    /// Loads from `flowquery.toml` (if present) layered under
    /// `FLOWQUERY_`-prefixed environment variables, falling back to
    /// `Default` entirely when neither is present.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file("flowquery.toml"))
            .merge(Env::prefixed("FLOWQUERY_"))
            .extract()
    }

    /// Loads from a specific file path, still layered under environment
    /// overrides.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FLOWQUERY_"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_works_with_no_config_file_present() {
        let config = EngineConfig::default();
        assert_eq!(config.optimizer_max_iterations, 16);
        assert_eq!(config.order_index_mode, OrderIndexMode::Fractional);
        assert_eq!(config.live_id_prefix, "live-query");
    }

    #[test]
    fn load_falls_back_to_default_without_a_config_file() {
        let config = EngineConfig::load().expect("figment extraction should not fail");
        assert_eq!(config.live_id_prefix, "live-query");
    }
}
