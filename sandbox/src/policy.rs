//! Sandbox policy derivation.
//!
//! Defaults, clamped by the system settings ceiling (hard-cap), then by skill
//! manifest limits, then by request overrides. Every layer may only tighten a
//! limit; attempts to widen are ignored.

use serde::{Deserialize, Serialize};

pub const CEILING_TIMEOUT_MS: u64 = 300_000;
pub const CEILING_STREAM_BYTES: u64 = 10 * 1024 * 1024;
pub const CEILING_ARTIFACTS_BYTES: u64 = 200 * 1024 * 1024;
pub const CEILING_MEMORY_MB: u64 = 4096;
pub const CEILING_CPU_CORES: f64 = 4.0;
pub const CEILING_PIDS: u64 = 512;
pub const CEILING_CONCURRENT: u64 = 16;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub timeout_ms: u64,
    pub max_stdout_bytes: u64,
    pub max_stderr_bytes: u64,
    pub max_artifacts_bytes_total: u64,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub pids: u64,
    pub max_concurrent_execs: u64,
    pub net_mode: String,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_stdout_bytes: 1024 * 1024,
            max_stderr_bytes: 1024 * 1024,
            max_artifacts_bytes_total: 50 * 1024 * 1024,
            memory_mb: 512,
            cpu_cores: 1.0,
            pids: 128,
            max_concurrent_execs: 4,
            net_mode: "none".to_string(),
        }
    }
}

/// System-level limits from settings; each field is an optional ceiling knob.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SettingsLimits {
    pub timeout_ms: Option<u64>,
    pub max_stdout_bytes: Option<u64>,
    pub max_stderr_bytes: Option<u64>,
    pub max_artifacts_bytes_total: Option<u64>,
    pub memory_mb: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub pids: Option<u64>,
}

/// Recognized override fields for skill manifests and request overrides.
/// Unrecognized JSON keys are ignored with a warning at the parse site.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PolicyOverrides {
    pub timeout_ms: Option<u64>,
    pub memory_mb: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub pids: Option<u64>,
    pub max_stdout_bytes: Option<u64>,
    pub max_stderr_bytes: Option<u64>,
    pub max_artifacts_bytes_total: Option<u64>,
}

/// Apply the settings ceiling to the built-in defaults.
pub fn policy_from_settings(limits: &SettingsLimits, max_concurrent: Option<u64>) -> SandboxPolicy {
    let mut p = SandboxPolicy::default();
    if let Some(v) = limits.timeout_ms {
        if v >= 1000 {
            p.timeout_ms = v.min(CEILING_TIMEOUT_MS);
        }
    }
    if let Some(v) = limits.max_stdout_bytes {
        p.max_stdout_bytes = v.min(CEILING_STREAM_BYTES);
    }
    if let Some(v) = limits.max_stderr_bytes {
        p.max_stderr_bytes = v.min(CEILING_STREAM_BYTES);
    }
    if let Some(v) = limits.max_artifacts_bytes_total {
        p.max_artifacts_bytes_total = v.min(CEILING_ARTIFACTS_BYTES);
    }
    if let Some(v) = limits.memory_mb {
        if v >= 1 {
            p.memory_mb = v.min(CEILING_MEMORY_MB);
        }
    }
    if let Some(v) = limits.cpu_cores {
        if v >= 0.1 {
            p.cpu_cores = v.min(CEILING_CPU_CORES);
        }
    }
    if let Some(v) = limits.pids {
        if v >= 1 {
            p.pids = v.min(CEILING_PIDS);
        }
    }
    if let Some(v) = max_concurrent {
        if v >= 1 {
            p.max_concurrent_execs = v.min(CEILING_CONCURRENT);
        }
    }
    p
}

/// Merge skill manifest limits; `base` is the hard-cap, values may only shrink.
pub fn merge_manifest_limits(base: &SandboxPolicy, limits: &PolicyOverrides) -> SandboxPolicy {
    let mut p = base.clone();
    if let Some(v) = limits.timeout_ms {
        if (1000..=base.timeout_ms).contains(&v) {
            p.timeout_ms = v;
        }
    }
    if let Some(v) = limits.memory_mb {
        if (1..=base.memory_mb).contains(&v) {
            p.memory_mb = v;
        }
    }
    if let Some(v) = limits.cpu_cores {
        if v >= 0.1 && v <= base.cpu_cores {
            p.cpu_cores = v;
        }
    }
    if let Some(v) = limits.pids {
        if (1..=base.pids).contains(&v) {
            p.pids = v;
        }
    }
    if let Some(v) = limits.max_stdout_bytes {
        if v <= base.max_stdout_bytes {
            p.max_stdout_bytes = v;
        }
    }
    if let Some(v) = limits.max_stderr_bytes {
        if v <= base.max_stderr_bytes {
            p.max_stderr_bytes = v;
        }
    }
    if let Some(v) = limits.max_artifacts_bytes_total {
        if v <= base.max_artifacts_bytes_total {
            p.max_artifacts_bytes_total = v;
        }
    }
    p
}

/// Merge request-level overrides; only timeout, memory and cpu are accepted,
/// and only when stricter than the base.
pub fn merge_policy_overrides(base: &SandboxPolicy, overrides: &PolicyOverrides) -> SandboxPolicy {
    let mut p = base.clone();
    if let Some(v) = overrides.timeout_ms {
        if (1000..=base.timeout_ms).contains(&v) {
            p.timeout_ms = v;
        }
    }
    if let Some(v) = overrides.memory_mb {
        if (1..=base.memory_mb).contains(&v) {
            p.memory_mb = v;
        }
    }
    if let Some(v) = overrides.cpu_cores {
        if v >= 0.1 && v <= base.cpu_cores {
            p.cpu_cores = v;
        }
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_are_clamped_to_ceiling() {
        let limits = SettingsLimits {
            timeout_ms: Some(9_999_999),
            max_stdout_bytes: Some(999 * 1024 * 1024),
            memory_mb: Some(100_000),
            cpu_cores: Some(64.0),
            pids: Some(100_000),
            ..Default::default()
        };
        let p = policy_from_settings(&limits, Some(99));
        assert_eq!(p.timeout_ms, CEILING_TIMEOUT_MS);
        assert_eq!(p.max_stdout_bytes, CEILING_STREAM_BYTES);
        assert_eq!(p.memory_mb, CEILING_MEMORY_MB);
        assert_eq!(p.cpu_cores, CEILING_CPU_CORES);
        assert_eq!(p.pids, CEILING_PIDS);
        assert_eq!(p.max_concurrent_execs, CEILING_CONCURRENT);
    }

    #[test]
    fn sub_second_timeout_is_ignored() {
        let limits = SettingsLimits {
            timeout_ms: Some(500),
            ..Default::default()
        };
        let p = policy_from_settings(&limits, None);
        assert_eq!(p.timeout_ms, SandboxPolicy::default().timeout_ms);
    }

    #[test]
    fn manifest_limits_may_only_tighten() {
        let base = SandboxPolicy::default();
        let tighter = merge_manifest_limits(
            &base,
            &PolicyOverrides {
                timeout_ms: Some(5_000),
                memory_mb: Some(128),
                ..Default::default()
            },
        );
        assert_eq!(tighter.timeout_ms, 5_000);
        assert_eq!(tighter.memory_mb, 128);

        let wider = merge_manifest_limits(
            &base,
            &PolicyOverrides {
                timeout_ms: Some(999_999),
                memory_mb: Some(99_999),
                ..Default::default()
            },
        );
        assert_eq!(wider.timeout_ms, base.timeout_ms);
        assert_eq!(wider.memory_mb, base.memory_mb);
    }

    #[test]
    fn request_overrides_accept_only_recognized_fields() {
        let base = SandboxPolicy::default();
        let merged = merge_policy_overrides(
            &base,
            &PolicyOverrides {
                timeout_ms: Some(2_000),
                cpu_cores: Some(0.5),
                // pids is not a request-level knob.
                pids: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(merged.timeout_ms, 2_000);
        assert_eq!(merged.cpu_cores, 0.5);
        assert_eq!(merged.pids, base.pids);
    }
}
