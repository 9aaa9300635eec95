// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults suit a general-purpose runtime. Every field can be overridden
//! from the environment (`RASK_*` variables) with [`RuntimeConfig::from_env`].

use crate::error::ConfigError;
use crate::frames::HEADER_BYTES;

const KIB: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Size of each worker's system stack.
    pub system_stack_size: usize,
    /// Size of each worker's fault (alternate signal) stack. 0 disables it.
    pub fault_stack_size: usize,
    /// Size of the fixed native stack a task's Rust code runs on.
    pub task_stack_size: usize,
    /// Initial frame-stack size for a new task.
    pub frame_stack_min: usize,
    /// Frame stacks never grow past this; reaching it is a stack overflow.
    pub frame_stack_max: usize,
    /// Bytes above a frame stack's low bound that frames may not enter.
    pub stack_guard: usize,
    /// System-stack bytes that must remain free when growth starts.
    pub system_headroom: usize,
    /// Fixed PRNG seed for reproducible runs. `None` seeds from the clock.
    pub rng_seed: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            system_stack_size: 256 * KIB,
            fault_stack_size: 32 * KIB,
            task_stack_size: 256 * KIB,
            frame_stack_min: 2 * KIB,
            frame_stack_max: 1024 * 1024 * KIB,
            stack_guard: 928,
            system_headroom: 16 * KIB,
            rng_seed: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by any `RASK_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        let size = |var: &'static str, slot: &mut usize| -> Result<(), ConfigError> {
            if let Some(raw) = lookup(var) {
                *slot = parse_size(&raw).ok_or(ConfigError::InvalidValue { var, value: raw })?;
            }
            Ok(())
        };
        size("RASK_SYSTEM_STACK", &mut config.system_stack_size)?;
        size("RASK_FAULT_STACK", &mut config.fault_stack_size)?;
        size("RASK_TASK_STACK", &mut config.task_stack_size)?;
        size("RASK_FRAME_STACK_MIN", &mut config.frame_stack_min)?;
        size("RASK_FRAME_STACK_MAX", &mut config.frame_stack_max)?;
        size("RASK_STACK_GUARD", &mut config.stack_guard)?;
        size("RASK_SYSTEM_HEADROOM", &mut config.system_headroom)?;
        if let Some(raw) = lookup("RASK_FASTRAND_SEED") {
            let seed = parse_u64(&raw).ok_or(ConfigError::InvalidValue {
                var: "RASK_FASTRAND_SEED",
                value: raw,
            })?;
            config.rng_seed = Some(seed);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_system_stack_size(mut self, size: usize) -> Self {
        self.system_stack_size = size;
        self
    }

    pub fn with_fault_stack_size(mut self, size: usize) -> Self {
        self.fault_stack_size = size;
        self
    }

    pub fn with_task_stack_size(mut self, size: usize) -> Self {
        self.task_stack_size = size;
        self
    }

    pub fn with_frame_stack(mut self, min: usize, max: usize) -> Self {
        self.frame_stack_min = min;
        self.frame_stack_max = max;
        self
    }

    pub fn with_stack_guard(mut self, guard: usize) -> Self {
        self.stack_guard = guard;
        self
    }

    pub fn with_system_headroom(mut self, headroom: usize) -> Self {
        self.system_headroom = headroom;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Check that the sizes are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("frame_stack_min", self.frame_stack_min),
            ("frame_stack_max", self.frame_stack_max),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { field, value });
            }
        }
        for (field, value, min) in [
            ("system_stack_size", self.system_stack_size, 16 * KIB),
            ("task_stack_size", self.task_stack_size, 16 * KIB),
            ("frame_stack_min", self.frame_stack_min, 2 * HEADER_BYTES),
        ] {
            if value < min {
                return Err(ConfigError::TooSmall { field, value, min });
            }
        }
        if self.frame_stack_max < self.frame_stack_min {
            return Err(ConfigError::MaxBelowMin {
                min: self.frame_stack_min,
                max: self.frame_stack_max,
            });
        }
        if self.stack_guard + HEADER_BYTES > self.frame_stack_min {
            return Err(ConfigError::GuardTooLarge {
                guard: self.stack_guard,
                size: self.frame_stack_min,
            });
        }
        if self.system_headroom >= self.system_stack_size {
            return Err(ConfigError::TooSmall {
                field: "system_stack_size",
                value: self.system_stack_size,
                min: self.system_headroom + 1,
            });
        }
        Ok(())
    }
}

/// Parse `4096`, `64k`, `2M`, `1G` (case-insensitive, optional `b`/`ib`).
fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix("ib").or_else(|| s.strip_suffix('b')).unwrap_or(s.as_str());
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], 10),
        b'm' => (&s[..s.len() - 1], 20),
        b'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: usize = digits.trim().parse().ok()?;
    n.checked_mul(1usize << shift)
}

fn parse_u64(raw: &str) -> Option<u64> {
    let s = raw.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
