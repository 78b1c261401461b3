use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PvsError;

/// Side length of a PVS chunk in world units. Not configurable: chunk
/// indices are persisted in the index and must stay stable for a run.
pub const CHUNK_SIZE: f32 = 8.0;

/// Replication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvsConfig {
    /// When false every session receives every entity and no leave messages are sent
    pub culling_enabled: bool,
    /// Half-extent of a viewer's view box, in world units
    pub view_range: f32,
    /// Depth of the per-session sent-history ring and of the added/dirty tick buffers
    pub dirty_buffer_size: usize,
    /// Ticks without an ack before states go out reliably. Also the
    /// minimum delay before a deleted entity's handle is recycled.
    pub force_ack_threshold: u32,
    /// Never-acknowledged entities a session may receive per tick
    pub new_entity_budget: usize,
    /// Entities entering view (not sent last tick) a session may receive per tick
    pub enter_entity_budget: usize,
    /// Chunks further than this (Chebyshev, in chunks) only send their root's direct children
    pub low_lod_distance: f32,
    /// Initial entity arena capacity
    pub entity_initial: usize,
    /// Arena growth step. 0 doubles the capacity instead.
    pub entity_growth: usize,
    /// Hard arena limit. Exceeding it is fatal.
    pub entity_max: usize,
    /// Initial session storage capacity
    pub session_initial: usize,
    /// Session storage growth step
    pub session_growth: usize,
    /// Minimum items per rayon task in parallel stages
    pub parallel_batch_size: usize,
    /// Simulation rate used by the server binary
    pub tick_rate: u32,
}

impl Default for PvsConfig {
    fn default() -> Self {
        Self {
            culling_enabled: true,
            view_range: 12.5,
            dirty_buffer_size: 20,
            force_ack_threshold: 40,
            new_entity_budget: 50,
            enter_entity_budget: 200,
            low_lod_distance: 2.0,
            entity_initial: 1 << 12,
            entity_growth: 1 << 12,
            entity_max: 1 << 24,
            session_initial: 64,
            session_growth: 16,
            parallel_batch_size: 8,
            tick_rate: 30,
        }
    }
}

/// Parse an environment variable into `target` when present and accepted by `valid`.
fn env_override<T: FromStr>(name: &str, target: &mut T, valid: impl Fn(&T) -> bool, rule: &str) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) if valid(&parsed) => *target = parsed,
        Ok(_) => tracing::warn!("{} must be {}, using default", name, rule),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", name, raw),
    }
}

impl PvsConfig {
    /// Load config from an optional JSON file (`PVS_CONFIG_FILE`), then
    /// apply environment overrides on top.
    pub fn load_or_default() -> Self {
        let mut config = match std::env::var("PVS_CONFIG_FILE") {
            Ok(path) => Self::from_json_file(&path).unwrap_or_else(|e| {
                tracing::warn!("Could not load {}: {}, using defaults", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        env_override("PVS_ENABLED", &mut config.culling_enabled, |_| true, "true/false");
        env_override("PVS_VIEW_RANGE", &mut config.view_range, |v| *v > 0.0, "> 0");
        env_override("PVS_DIRTY_BUFFER_SIZE", &mut config.dirty_buffer_size, |v| *v > 0, "> 0");
        env_override("PVS_FORCE_ACK_THRESHOLD", &mut config.force_ack_threshold, |v| *v > 0, "> 0");
        env_override("PVS_NEW_BUDGET", &mut config.new_entity_budget, |v| *v > 0, "> 0");
        env_override("PVS_ENTER_BUDGET", &mut config.enter_entity_budget, |v| *v > 0, "> 0");
        env_override("PVS_LOW_LOD_DISTANCE", &mut config.low_lod_distance, |v| *v >= 0.0, ">= 0");
        env_override("PVS_ENTITY_INITIAL", &mut config.entity_initial, |v| *v > 0, "> 0");
        env_override("PVS_ENTITY_GROWTH", &mut config.entity_growth, |_| true, "a count");
        env_override("PVS_ENTITY_MAX", &mut config.entity_max, |v| *v > 0, "> 0");
        env_override("PVS_SESSION_INITIAL", &mut config.session_initial, |v| *v > 0, "> 0");
        env_override("PVS_SESSION_GROWTH", &mut config.session_growth, |v| *v > 0, "> 0");
        env_override("PVS_BATCH_SIZE", &mut config.parallel_batch_size, |v| *v > 0, "> 0");
        env_override("TICK_RATE", &mut config.tick_rate, |v| (1..=1000).contains(v), "1-1000");

        config
    }

    /// Read a (possibly partial) JSON config. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PvsError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PvsError::InvalidConfig(e.to_string()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, PvsError> {
        serde_json::from_str(raw).map_err(|e| PvsError::InvalidConfig(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if !(self.view_range > 0.0) {
            return Err("view_range must be positive".to_string());
        }
        if self.dirty_buffer_size == 0 {
            return Err("dirty_buffer_size must be at least 1".to_string());
        }
        if self.dirty_buffer_size > self.force_ack_threshold as usize {
            return Err("dirty_buffer_size cannot exceed force_ack_threshold".to_string());
        }
        if self.new_entity_budget == 0 || self.enter_entity_budget == 0 {
            return Err("entity budgets must be at least 1".to_string());
        }
        if self.entity_initial == 0 || self.session_initial == 0 {
            return Err("initial capacities must be at least 1".to_string());
        }
        if self.entity_initial > self.entity_max {
            return Err("entity_initial cannot exceed entity_max".to_string());
        }
        if self.entity_max > u32::MAX as usize {
            return Err("entity_max must fit in a 32-bit handle".to_string());
        }
        if self.session_growth == 0 {
            return Err("session_growth must be at least 1".to_string());
        }
        if self.low_lod_distance < 0.0 {
            return Err("low_lod_distance cannot be negative".to_string());
        }
        Ok(())
    }

    /// Ticks between free-list returns for deleted entity handles
    #[inline]
    pub fn handle_return_delay(&self) -> u32 {
        self.force_ack_threshold + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PvsConfig::default();
        assert!(config.culling_enabled);
        assert_eq!(config.view_range, 12.5);
        assert_eq!(config.dirty_buffer_size, 20);
        assert_eq!(config.new_entity_budget, 50);
        assert_eq!(config.enter_entity_budget, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = PvsConfig::load_or_default();
        assert!(config.view_range > 0.0);
    }

    #[test]
    fn test_ring_deeper_than_threshold_rejected() {
        let config = PvsConfig {
            dirty_buffer_size: 50,
            force_ack_threshold: 40,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_initial_above_max_rejected() {
        let config = PvsConfig {
            entity_initial: 1024,
            entity_max: 512,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json() {
        let config = PvsConfig::from_json(r#"{ "view_range": 20.0, "culling_enabled": false }"#).unwrap();
        assert_eq!(config.view_range, 20.0);
        assert!(!config.culling_enabled);
        assert_eq!(config.dirty_buffer_size, 20);
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            PvsConfig::from_json("{ not json"),
            Err(PvsError::InvalidConfig(_))
        ));
    }
}
