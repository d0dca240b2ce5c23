//! `serde`-deserializable configuration structs: plain data the
//! embedding simulator can load from whatever format it already uses.
//! `tracecap` does not own a config file format itself.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub force_new: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    pub name: String,
    pub period: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    pub stage_a_level: u32,
    pub stage_b_level: u32,
    pub high_water_mark: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            stage_a_level: 6,
            stage_b_level: 1,
            high_water_mark: 1024,
        }
    }
}

/// The wire type of the clock driving `collect()`, mirrored into
/// `CollectionGlobals.time_type`. Kept as `tracecap`'s own
/// `serde`-deserializable enum rather than re-exporting
/// `tracecap_schema::TimeType` directly, so `tracecap-schema` doesn't have
/// to carry a `serde` dependency for the sake of one config field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeKind {
    Int,
    Real,
}

impl Default for TimeKind {
    fn default() -> Self {
        TimeKind::Int
    }
}

impl TimeKind {
    pub fn to_schema_time_type(self) -> tracecap_schema::TimeType {
        match self {
            TimeKind::Int => tracecap_schema::TimeType::Int,
            TimeKind::Real => tracecap_schema::TimeType::Real,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Two defaults appear in the original source (5 vs 10); `tracecap`
    /// settles on 5 (see DESIGN.md) but this is always explicit and
    /// recorded in `CollectionGlobals.heartbeat` at finalize, never left
    /// implicit in code.
    pub heartbeat: u16,
    #[serde(default)]
    pub time_kind: TimeKind,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub clocks: Vec<ClockConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat: 5,
            time_kind: TimeKind::default(),
            compression: CompressionConfig::default(),
            clocks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_deserializes_with_defaults_applied() {
        let json = r#"{"heartbeat": 7}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.heartbeat, 7);
        assert_eq!(config.time_kind, TimeKind::Int);
        assert_eq!(config.compression.stage_a_level, 6);
        assert!(config.clocks.is_empty());
    }
}
