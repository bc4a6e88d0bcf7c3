//! Centralized configuration for intogif.
//!
//! All tunable parameters are defined here. The conversion itself (filter
//! graph, output name) is fixed and deliberately not configurable.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all intogif components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct IntogifConfig {
    pub engine: EngineConfig,
    pub simulation: SimulationConfig,
}

/// Construction-time settings of the transcoding engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Location of the engine core (ffmpeg binary)
    pub core_path: PathBuf,
    /// Mirror engine output into the application logs
    pub log: bool,
    /// Number of recent engine log lines retained for failure diagnostics
    pub log_tail_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            core_path: PathBuf::from("ffmpeg"),
            log: true,
            log_tail_lines: 200,
        }
    }
}

/// Simulation mode configuration for testing and dry runs.
///
/// When enabled, the in-memory engine replaces the ffmpeg binary.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Use the simulated engine instead of ffmpeg
    pub enabled: bool,
    /// Simulated engine load time
    pub load_delay: Duration,
    /// Simulated duration of one transcode
    pub run_delay: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            load_delay: Duration::from_millis(200),
            run_delay: Duration::from_millis(500),
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration for deterministic testing.
    pub fn deterministic_testing() -> Self {
        Self {
            enabled: true,
            load_delay: Duration::ZERO, // No delays for fast tests
            run_delay: Duration::ZERO,
        }
    }
}

impl IntogifConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("INTOGIF_FFMPEG_PATH") {
            if !path.is_empty() {
                config.engine.core_path = PathBuf::from(path);
            }
        }

        if let Ok(log) = std::env::var("INTOGIF_ENGINE_LOG") {
            config.engine.log = log.parse().unwrap_or(config.engine.log);
        }

        if let Ok(lines) = std::env::var("INTOGIF_LOG_TAIL_LINES") {
            if let Ok(count) = lines.parse::<usize>() {
                config.engine.log_tail_lines = count;
            }
        }

        if let Ok(enabled) = std::env::var("INTOGIF_SIMULATION_MODE") {
            config.simulation.enabled = enabled.parse().unwrap_or(false);
        }

        if let Ok(delay) = std::env::var("INTOGIF_SIMULATION_DELAY_MS") {
            if let Ok(millis) = delay.parse::<u64>() {
                config.simulation.run_delay = Duration::from_millis(millis);
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig {
                log: false,
                ..Default::default()
            },
            simulation: SimulationConfig::deterministic_testing(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = IntogifConfig::default();

        assert_eq!(config.engine.core_path, PathBuf::from("ffmpeg"));
        assert!(config.engine.log);
        assert_eq!(config.engine.log_tail_lines, 200);
        assert!(!config.simulation.enabled);
    }

    #[test]
    fn test_testing_preset() {
        let config = IntogifConfig::for_testing();
        assert!(config.simulation.enabled);
        assert!(!config.engine.log);
        assert_eq!(config.simulation.load_delay, Duration::ZERO);
        assert_eq!(config.simulation.run_delay, Duration::ZERO);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("INTOGIF_FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg");
            std::env::set_var("INTOGIF_ENGINE_LOG", "false");
            std::env::set_var("INTOGIF_LOG_TAIL_LINES", "50");
            std::env::set_var("INTOGIF_SIMULATION_MODE", "true");
            std::env::set_var("INTOGIF_SIMULATION_DELAY_MS", "5");
        }

        let config = IntogifConfig::from_env();

        assert_eq!(
            config.engine.core_path,
            PathBuf::from("/opt/ffmpeg/bin/ffmpeg")
        );
        assert!(!config.engine.log);
        assert_eq!(config.engine.log_tail_lines, 50);
        assert!(config.simulation.enabled);
        assert_eq!(config.simulation.run_delay, Duration::from_millis(5));

        // Cleanup
        unsafe {
            std::env::remove_var("INTOGIF_FFMPEG_PATH");
            std::env::remove_var("INTOGIF_ENGINE_LOG");
            std::env::remove_var("INTOGIF_LOG_TAIL_LINES");
            std::env::remove_var("INTOGIF_SIMULATION_MODE");
            std::env::remove_var("INTOGIF_SIMULATION_DELAY_MS");
        }
    }
}
