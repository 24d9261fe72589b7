//! Runtime configuration
//!
//! Resolved once, the first time the runtime needs it. Call [`configure`]
//! before spawning anything to set it from code; otherwise it comes from the
//! environment.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `COIL_SCHED_NUM` | CPU count | Scheduler threads (clamped to the CPU count) |
//! | `COIL_STACK_NUM` | `8` | Stack slots per scheduler (power of two) |
//! | `COIL_STACK_SIZE` | `1048576` | Bytes per stack slot (rounded up to pages) |
//!
//! Invalid values are reported with a warning and replaced by the default.

use crate::stack::page_size;
use std::sync::OnceLock;

pub const DEFAULT_STACK_NUM: usize = 8;
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
/// Smallest stack slot accepted; anything below is raised to this.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of scheduler threads.
    pub sched_num: usize,
    /// Stack slots per scheduler.
    pub stack_num: usize,
    /// Usable bytes per stack slot.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sched_num: cpu_count(),
            stack_num: DEFAULT_STACK_NUM,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from `COIL_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            sched_num: parse_sched_num(std::env::var("COIL_SCHED_NUM").ok(), cpu_count()),
            stack_num: parse_stack_num(std::env::var("COIL_STACK_NUM").ok()),
            stack_size: parse_stack_size(std::env::var("COIL_STACK_SIZE").ok()),
        }
    }

    /// Apply the same bounds the environment parser enforces.
    fn validated(self) -> Self {
        let ncpu = cpu_count();
        let sched_num = match self.sched_num {
            0 => {
                tracing::warn!("sched_num 0 is invalid, using {}", ncpu);
                ncpu
            }
            n if n > ncpu => {
                tracing::warn!("sched_num {} exceeds the {} available CPUs", n, ncpu);
                ncpu
            }
            n => n,
        };
        let stack_num = if self.stack_num.is_power_of_two() {
            self.stack_num
        } else {
            tracing::warn!(
                "stack_num {} is not a power of two, using default {}",
                self.stack_num,
                DEFAULT_STACK_NUM
            );
            DEFAULT_STACK_NUM
        };
        Self {
            sched_num,
            stack_num,
            stack_size: round_stack_size(self.stack_size),
        }
    }
}

/// Set the runtime configuration from code.
///
/// Returns `false`, changing nothing, if the configuration was already
/// resolved (by an earlier call, or because the runtime is in use).
pub fn configure(config: Config) -> bool {
    let mut applied = false;
    CONFIG.get_or_init(|| {
        applied = true;
        config.validated()
    });
    applied
}

/// The resolved configuration.
pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| Config::from_env().validated())
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_sched_num(env_value: Option<String>, ncpu: usize) -> usize {
    match env_value {
        Some(val) => match val.parse::<usize>() {
            Ok(0) => {
                tracing::warn!("COIL_SCHED_NUM=0 is invalid, using {}", ncpu);
                ncpu
            }
            Ok(n) if n > ncpu => {
                tracing::warn!("COIL_SCHED_NUM={} exceeds the {} available CPUs", n, ncpu);
                ncpu
            }
            Ok(n) => n,
            Err(_) => {
                tracing::warn!(
                    "COIL_SCHED_NUM='{}' is not a valid number, using {}",
                    val,
                    ncpu
                );
                ncpu
            }
        },
        None => ncpu,
    }
}

fn parse_stack_num(env_value: Option<String>) -> usize {
    match env_value {
        Some(val) => match val.parse::<usize>() {
            Ok(n) if n.is_power_of_two() => n,
            Ok(n) => {
                tracing::warn!(
                    "COIL_STACK_NUM={} is not a power of two, using default {}",
                    n,
                    DEFAULT_STACK_NUM
                );
                DEFAULT_STACK_NUM
            }
            Err(_) => {
                tracing::warn!(
                    "COIL_STACK_NUM='{}' is not a valid number, using default {}",
                    val,
                    DEFAULT_STACK_NUM
                );
                DEFAULT_STACK_NUM
            }
        },
        None => DEFAULT_STACK_NUM,
    }
}

fn parse_stack_size(env_value: Option<String>) -> usize {
    match env_value {
        Some(val) => match val.parse::<usize>() {
            Ok(0) => {
                tracing::warn!(
                    "COIL_STACK_SIZE=0 is invalid, using default {}",
                    DEFAULT_STACK_SIZE
                );
                DEFAULT_STACK_SIZE
            }
            Ok(size) => size,
            Err(_) => {
                tracing::warn!(
                    "COIL_STACK_SIZE='{}' is not a valid number, using default {}",
                    val,
                    DEFAULT_STACK_SIZE
                );
                DEFAULT_STACK_SIZE
            }
        },
        None => DEFAULT_STACK_SIZE,
    }
}

fn round_stack_size(size: usize) -> usize {
    let size = if size < MIN_STACK_SIZE {
        tracing::warn!("stack size {} is too small, using {}", size, MIN_STACK_SIZE);
        MIN_STACK_SIZE
    } else {
        size
    };
    let page = page_size();
    size.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sched_num() {
        assert_eq!(parse_sched_num(None, 4), 4);
        assert_eq!(parse_sched_num(Some("2".into()), 4), 2);
        assert_eq!(parse_sched_num(Some("0".into()), 4), 4);
        assert_eq!(parse_sched_num(Some("64".into()), 4), 4);
        assert_eq!(parse_sched_num(Some("many".into()), 4), 4);
    }

    #[test]
    fn test_parse_stack_num_requires_power_of_two() {
        assert_eq!(parse_stack_num(None), DEFAULT_STACK_NUM);
        assert_eq!(parse_stack_num(Some("16".into())), 16);
        assert_eq!(parse_stack_num(Some("1".into())), 1);
        assert_eq!(parse_stack_num(Some("12".into())), DEFAULT_STACK_NUM);
        assert_eq!(parse_stack_num(Some("0".into())), DEFAULT_STACK_NUM);
        assert_eq!(parse_stack_num(Some("-1".into())), DEFAULT_STACK_NUM);
    }

    #[test]
    fn test_parse_stack_size() {
        assert_eq!(parse_stack_size(None), DEFAULT_STACK_SIZE);
        assert_eq!(parse_stack_size(Some("2097152".into())), 2097152);
        assert_eq!(parse_stack_size(Some("0".into())), DEFAULT_STACK_SIZE);
        assert_eq!(parse_stack_size(Some("1MB".into())), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_validated_rounds_and_clamps() {
        let config = Config {
            sched_num: 0,
            stack_num: 6,
            stack_size: 100_001,
        }
        .validated();
        assert_eq!(config.sched_num, cpu_count());
        assert_eq!(config.stack_num, DEFAULT_STACK_NUM);
        assert_eq!(config.stack_size % page_size(), 0);
        assert!(config.stack_size >= 100_001);

        let tiny = Config {
            stack_size: 1,
            ..Config::default()
        }
        .validated();
        assert_eq!(tiny.stack_size, MIN_STACK_SIZE.div_ceil(page_size()) * page_size());
    }
}
