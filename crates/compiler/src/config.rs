//! Compiler configuration.
//!
//! [`CompilerConfig`] carries the knobs the driver exposes: optimization
//! level, the PE timestamp (zero by default so builds are byte
//! reproducible), the preferred image base and whether to dump optimized
//! IR next to the output. A project can preset them in an `mf.toml` file.

use serde::Deserialize;

use crate::codegen::pe::DEFAULT_IMAGE_BASE;

/// Optimization levels. `O0` disables the IR optimizer; `O1` runs the
/// fixed-point pass set. `O2` and `O3` are accepted and currently behave
/// like `O1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    O0,
    #[default]
    O1,
    O2,
    O3,
}

impl OptimizationLevel {
    pub fn from_number(n: u8) -> Self {
        match n {
            0 => OptimizationLevel::O0,
            1 => OptimizationLevel::O1,
            2 => OptimizationLevel::O2,
            _ => OptimizationLevel::O3,
        }
    }

    pub fn runs_optimizer(self) -> bool {
        self != OptimizationLevel::O0
    }
}

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub optimization_level: OptimizationLevel,
    /// `TimeDateStamp` written into the PE file header.
    pub timestamp: u32,
    /// Preferred load address.
    pub image_base: u64,
    /// Write a readable listing of the optimized IR next to the output.
    pub dump_ir: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            optimization_level: OptimizationLevel::default(),
            timestamp: 0,
            image_base: DEFAULT_IMAGE_BASE,
            dump_ir: false,
        }
    }
}

/// On-disk representation of `mf.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    #[serde(rename = "optimization-level")]
    optimization_level: Option<u8>,
    timestamp: Option<u32>,
    #[serde(rename = "image-base")]
    image_base: Option<u64>,
    #[serde(rename = "dump-ir")]
    dump_ir: Option<bool>,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    pub fn with_dump_ir(mut self, dump: bool) -> Self {
        self.dump_ir = dump;
        self
    }

    /// Parse an `mf.toml` and overlay it on the defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, String> {
        let parsed: TomlConfig =
            toml::from_str(toml_str).map_err(|e| format!("failed to parse mf.toml: {}", e))?;
        let mut config = CompilerConfig::default();
        if let Some(level) = parsed.optimization_level {
            config.optimization_level = OptimizationLevel::from_number(level);
        }
        if let Some(timestamp) = parsed.timestamp {
            config.timestamp = timestamp;
        }
        if let Some(base) = parsed.image_base {
            config.image_base = base;
        }
        if let Some(dump) = parsed.dump_ir {
            config.dump_ir = dump;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_reproducible() {
        let config = CompilerConfig::default();
        assert_eq!(config.timestamp, 0);
        assert_eq!(config.image_base, DEFAULT_IMAGE_BASE);
        assert_eq!(config.optimization_level, OptimizationLevel::O1);
        assert!(!config.dump_ir);
    }

    #[test]
    fn test_builder() {
        let config = CompilerConfig::new()
            .with_optimization_level(OptimizationLevel::O0)
            .with_timestamp(42)
            .with_dump_ir(true);
        assert_eq!(config.optimization_level, OptimizationLevel::O0);
        assert_eq!(config.timestamp, 42);
        assert!(config.dump_ir);
    }

    #[test]
    fn test_from_toml() {
        let config = CompilerConfig::from_toml(
            "optimization-level = 0\ntimestamp = 7\ndump-ir = true\n",
        )
        .unwrap();
        assert_eq!(config.optimization_level, OptimizationLevel::O0);
        assert_eq!(config.timestamp, 7);
        assert!(config.dump_ir);
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        assert!(CompilerConfig::from_toml("mystery = 1\n").is_err());
    }

    #[test]
    fn test_level_mapping() {
        assert!(!OptimizationLevel::from_number(0).runs_optimizer());
        assert!(OptimizationLevel::from_number(1).runs_optimizer());
        assert_eq!(OptimizationLevel::from_number(9), OptimizationLevel::O3);
    }
}
