//! Execution limits and server-side clamping.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest memory ceiling a request can get. Below this the dynamic loader
/// cannot map the C++ runtime under the address-space backstop.
pub const MIN_MEMORY_MB: u64 = 16;

/// Wall-clock, memory and output ceilings for one process invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Wall-clock timeout in milliseconds.
    pub timeout_ms: u64,
    /// Memory ceiling in megabytes.
    pub memory_mb: u64,
    /// Maximum captured bytes per output stream.
    pub max_output_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            memory_mb: 256,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl ExecutionLimits {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub const fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// Clamp every field into `minimum..=ceiling`. The minimum is 1, or
    /// [`MIN_MEMORY_MB`] for memory unless the ceiling is lower still.
    #[must_use]
    pub fn clamped_to(self, ceilings: &Self) -> Self {
        let memory_ceiling = ceilings.memory_mb.max(1);
        Self {
            timeout_ms: self.timeout_ms.clamp(1, ceilings.timeout_ms.max(1)),
            memory_mb: self
                .memory_mb
                .clamp(MIN_MEMORY_MB.min(memory_ceiling), memory_ceiling),
            max_output_bytes: self
                .max_output_bytes
                .clamp(1, ceilings.max_output_bytes.max(1)),
        }
    }

    /// True when no field exceeds the matching field of `ceilings`.
    pub const fn within(&self, ceilings: &Self) -> bool {
        self.timeout_ms <= ceilings.timeout_ms
            && self.memory_mb <= ceilings.memory_mb
            && self.max_output_bytes <= ceilings.max_output_bytes
    }
}

/// Limits as requested by a caller. Missing fields take server defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedLimits {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
}

impl RequestedLimits {
    /// Fill gaps from `defaults`, then clamp to `ceilings`.
    ///
    /// A caller can never exceed the ceilings, whatever it asks for.
    pub fn resolve(&self, defaults: &ExecutionLimits, ceilings: &ExecutionLimits) -> ExecutionLimits {
        ExecutionLimits {
            timeout_ms: self.timeout_ms.unwrap_or(defaults.timeout_ms),
            memory_mb: self.memory_mb.unwrap_or(defaults.memory_mb),
            max_output_bytes: self.max_output_bytes.unwrap_or(defaults.max_output_bytes),
        }
        .clamped_to(ceilings)
    }
}
