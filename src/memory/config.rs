//! DSL-embedded memory configuration.
//!
//! Dependency rule, validated at parse time: mid-term requires
//! short-term; long-term requires mid-term.

use serde::Deserialize;

use super::MemoryError;

pub const DEFAULT_WINDOW_SIZE: usize = 20;
pub const DEFAULT_SUMMARY_THRESHOLD: usize = 10;
pub const DEFAULT_TOKEN_THRESHOLD_RATIO: f64 = 0.70;
pub const DEFAULT_MIN_RECENT_TURNS: usize = 4;
pub const DEFAULT_CONTEXT_WINDOW_SIZE: u64 = 128_000;

/// Memory configuration of an LLM node.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub short_term: Option<ShortTermConfig>,
    #[serde(default)]
    pub mid_term: Option<MidTermConfig>,
    #[serde(default)]
    pub long_term: Option<LongTermConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ShortTermConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub window_size: Option<usize>,
    #[serde(default)]
    pub gateway_compress: Option<GatewayConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MidTermConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub summary_model: Option<SummaryModelConfig>,
    #[serde(default)]
    pub summary_threshold: Option<usize>,
}

impl MidTermConfig {
    #[must_use]
    pub fn summary_threshold(&self) -> usize {
        self.summary_threshold
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_SUMMARY_THRESHOLD)
    }
}

/// Reserved; long-term memory has no runtime behaviour yet.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LongTermConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SummaryModelConfig {
    pub provider: String,
    pub name: String,
}

/// Context-gateway compression configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub model: Option<SummaryModelConfig>,
    #[serde(default)]
    pub token_threshold_ratio: Option<f64>,
    #[serde(default)]
    pub min_recent_turns: Option<usize>,
    #[serde(default)]
    pub extract_key_facts: bool,
    #[serde(default)]
    pub context_window_size: Option<u64>,
}

impl GatewayConfig {
    #[must_use]
    pub fn token_threshold_ratio(&self) -> f64 {
        self.token_threshold_ratio
            .filter(|r| *r > 0.0)
            .unwrap_or(DEFAULT_TOKEN_THRESHOLD_RATIO)
    }

    #[must_use]
    pub fn min_recent_turns(&self) -> usize {
        self.min_recent_turns
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_MIN_RECENT_TURNS)
    }

    #[must_use]
    pub fn context_window_size(&self) -> u64 {
        self.context_window_size
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW_SIZE)
    }
}

impl MemoryConfig {
    #[must_use]
    pub fn is_short_term_enabled(&self) -> bool {
        self.short_term.as_ref().is_some_and(|c| c.enabled)
    }

    #[must_use]
    pub fn is_gateway_enabled(&self) -> bool {
        self.is_short_term_enabled()
            && self
                .short_term
                .as_ref()
                .and_then(|c| c.gateway_compress.as_ref())
                .is_some_and(|g| g.enabled)
    }

    #[must_use]
    pub fn gateway_config(&self) -> Option<&GatewayConfig> {
        self.short_term.as_ref()?.gateway_compress.as_ref()
    }

    #[must_use]
    pub fn is_mid_term_enabled(&self) -> bool {
        self.mid_term.as_ref().is_some_and(|c| c.enabled)
    }

    #[must_use]
    pub fn is_long_term_enabled(&self) -> bool {
        self.long_term.as_ref().is_some_and(|c| c.enabled)
    }

    #[must_use]
    pub fn window_size(&self) -> usize {
        self.short_term
            .as_ref()
            .and_then(|c| c.window_size)
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_WINDOW_SIZE)
    }

    /// Enforce the tier dependency rule.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.is_mid_term_enabled() && !self.is_short_term_enabled() {
            return Err(MemoryError::MidTermRequiresShortTerm);
        }
        if self.is_long_term_enabled() && !self.is_mid_term_enabled() {
            return Err(MemoryError::LongTermRequiresMidTerm);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_when_fields_absent() {
        let config: MemoryConfig =
            serde_json::from_value(json!({"short_term": {"enabled": true}})).unwrap();
        assert!(config.is_short_term_enabled());
        assert_eq!(config.window_size(), 20);
        assert!(!config.is_gateway_enabled());
    }

    #[test]
    fn gateway_accessors_fall_back() {
        let gw = GatewayConfig {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(gw.token_threshold_ratio(), 0.70);
        assert_eq!(gw.min_recent_turns(), 4);
        assert_eq!(gw.context_window_size(), 128_000);
    }

    #[test]
    fn mid_term_requires_short_term() {
        let config: MemoryConfig =
            serde_json::from_value(json!({"mid_term": {"enabled": true}})).unwrap();
        assert!(matches!(
            config.validate(),
            Err(MemoryError::MidTermRequiresShortTerm)
        ));
    }

    #[test]
    fn long_term_requires_mid_term() {
        let config: MemoryConfig = serde_json::from_value(json!({
            "short_term": {"enabled": true},
            "long_term": {"enabled": true}
        }))
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(MemoryError::LongTermRequiresMidTerm)
        ));
    }

    #[test]
    fn full_stack_validates() {
        let config: MemoryConfig = serde_json::from_value(json!({
            "short_term": {"enabled": true, "window_size": 8,
                           "gateway_compress": {"enabled": true, "token_threshold_ratio": 0.5}},
            "mid_term": {"enabled": true, "summary_threshold": 6},
            "long_term": {"enabled": true}
        }))
        .unwrap();
        assert!(config.validate().is_ok());
        assert!(config.is_gateway_enabled());
        assert_eq!(config.gateway_config().unwrap().token_threshold_ratio(), 0.5);
        assert_eq!(config.mid_term.as_ref().unwrap().summary_threshold(), 6);
    }
}
