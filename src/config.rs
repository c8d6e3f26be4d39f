//! Runtime configuration, with every option and default enumerated in
//! spec §6, mirroring `OrchestratorConfig`/`OrchestratorBuilder` in the
//! teacher crate's `orchestrator` module.

use serde::{Deserialize, Serialize};

/// Sandbox execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Full bridge access (`llm_query`, tools); no blocklist scanning.
    Permissive,
    /// Blocklist scanning and global shadowing; bridge calls disabled.
    Strict,
}

impl Default for SandboxMode {
    fn default() -> Self {
        Self::Permissive
    }
}

/// Sub-model delegation policy: at or beyond `depth_threshold`, recursive
/// calls route to the cheaper sub-model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubLlmDelegation {
    pub enabled: bool,
    pub depth_threshold: u32,
}

impl Default for SubLlmDelegation {
    fn default() -> Self {
        Self {
            enabled: false,
            depth_threshold: 1,
        }
    }
}

/// `{provider, model}` pair identifying a model target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

const MIB: u64 = 1024 * 1024;
const DEFAULT_MAX_FRAME_BYTES: u64 = 4 * MIB;
const MAX_FRAME_BYTES_CAP: u64 = 64 * MIB;

/// Every configuration knob named in spec §6, with the documented default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub max_iterations: u32,
    pub max_depth: u32,
    pub max_llm_calls: u32,
    pub max_total_tokens: Option<u64>,
    pub concurrency: usize,
    pub event_buffer_capacity: usize,
    pub max_execution_output_chars: usize,
    pub llm_retry_count: u32,
    pub llm_retry_base_delay_ms: u64,
    pub llm_retry_jitter: bool,
    pub sub_llm_delegation: SubLlmDelegation,
    pub primary_target: ModelTarget,
    pub sub_target: Option<ModelTarget>,
    pub max_frame_bytes: u64,
    pub sandbox_mode: SandboxMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_depth: 1,
            max_llm_calls: 200,
            max_total_tokens: None,
            concurrency: 4,
            event_buffer_capacity: 4096,
            max_execution_output_chars: 8_000,
            llm_retry_count: 1,
            llm_retry_base_delay_ms: 100,
            llm_retry_jitter: true,
            sub_llm_delegation: SubLlmDelegation::default(),
            primary_target: ModelTarget::new("anthropic", "claude-sonnet"),
            sub_target: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            sandbox_mode: SandboxMode::default(),
        }
    }
}

impl RuntimeConfig {
    /// Clamp `max_frame_bytes` to the documented cap of 64 MiB.
    pub fn clamp_max_frame_bytes(mut self) -> Self {
        self.max_frame_bytes = self.max_frame_bytes.min(MAX_FRAME_BYTES_CAP);
        self
    }
}

/// Builder for [`RuntimeConfig`], following the teacher's
/// `OrchestratorBuilder` fluent-setter shape.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    pub fn max_iterations(mut self, v: u32) -> Self {
        self.config.max_iterations = v;
        self
    }

    pub fn max_depth(mut self, v: u32) -> Self {
        self.config.max_depth = v;
        self
    }

    pub fn max_llm_calls(mut self, v: u32) -> Self {
        self.config.max_llm_calls = v;
        self
    }

    pub fn max_total_tokens(mut self, v: Option<u64>) -> Self {
        self.config.max_total_tokens = v;
        self
    }

    pub fn concurrency(mut self, v: usize) -> Self {
        self.config.concurrency = v;
        self
    }

    pub fn event_buffer_capacity(mut self, v: usize) -> Self {
        self.config.event_buffer_capacity = v;
        self
    }

    pub fn max_execution_output_chars(mut self, v: usize) -> Self {
        self.config.max_execution_output_chars = v;
        self
    }

    pub fn llm_retry_count(mut self, v: u32) -> Self {
        self.config.llm_retry_count = v;
        self
    }

    pub fn llm_retry_base_delay_ms(mut self, v: u64) -> Self {
        self.config.llm_retry_base_delay_ms = v;
        self
    }

    pub fn llm_retry_jitter(mut self, v: bool) -> Self {
        self.config.llm_retry_jitter = v;
        self
    }

    pub fn sub_llm_delegation(mut self, v: SubLlmDelegation) -> Self {
        self.config.sub_llm_delegation = v;
        self
    }

    pub fn primary_target(mut self, v: ModelTarget) -> Self {
        self.config.primary_target = v;
        self
    }

    pub fn sub_target(mut self, v: Option<ModelTarget>) -> Self {
        self.config.sub_target = v;
        self
    }

    pub fn max_frame_bytes(mut self, v: u64) -> Self {
        self.config.max_frame_bytes = v;
        self
    }

    pub fn sandbox_mode(mut self, v: SandboxMode) -> Self {
        self.config.sandbox_mode = v;
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config.clamp_max_frame_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = RuntimeConfig::default();
        assert_eq!(c.max_iterations, 50);
        assert_eq!(c.max_depth, 1);
        assert_eq!(c.max_llm_calls, 200);
        assert_eq!(c.max_total_tokens, None);
        assert_eq!(c.concurrency, 4);
        assert_eq!(c.event_buffer_capacity, 4096);
        assert_eq!(c.max_execution_output_chars, 8_000);
        assert_eq!(c.llm_retry_count, 1);
        assert_eq!(c.llm_retry_base_delay_ms, 100);
        assert!(c.llm_retry_jitter);
        assert_eq!(c.max_frame_bytes, 4 * MIB);
        assert_eq!(c.sandbox_mode, SandboxMode::Permissive);
    }

    #[test]
    fn builder_clamps_max_frame_bytes_to_cap() {
        let config = RuntimeConfigBuilder::new()
            .max_frame_bytes(1000 * MIB)
            .build();
        assert_eq!(config.max_frame_bytes, MAX_FRAME_BYTES_CAP);
    }

    #[test]
    fn builder_overrides_depth_and_delegation() {
        let config = RuntimeConfigBuilder::new()
            .max_depth(3)
            .sub_llm_delegation(SubLlmDelegation {
                enabled: true,
                depth_threshold: 2,
            })
            .build();
        assert_eq!(config.max_depth, 3);
        assert!(config.sub_llm_delegation.enabled);
        assert_eq!(config.sub_llm_delegation.depth_threshold, 2);
    }
}
