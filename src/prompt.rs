//! Prompt construction (spec §6 external collaborator). Trait-only: prompt
//! templating and system-prompt wording are out of this crate's scope
//! (spec §1), matching how `rlm-core::orchestrator` depends on a prompt
//! builder abstractly rather than inlining wording into the loop.

use crate::call_registry::TranscriptEntry;
use serde_json::Value;

/// An opaque, provider-ready prompt. The core never inspects its contents;
/// it is handed directly to [`crate::llm::LanguageModelClient::generate_text`].
#[derive(Debug, Clone)]
pub struct Prompt(pub String);

/// Parameters for the REPL-turn prompt, built once per `GenerateStep`.
pub struct ReplPromptParams<'a> {
    pub system_prompt: Option<&'a str>,
    pub query: &'a str,
    pub context_length: Option<usize>,
    pub context_metadata: Option<&'a Value>,
    pub context_preview: Option<&'a str>,
    pub transcript: &'a [TranscriptEntry],
}

pub struct OneShotPromptParams<'a> {
    pub system_prompt: Option<&'a str>,
    pub query: &'a str,
    pub context: &'a str,
}

pub struct ExtractPromptParams<'a> {
    pub transcript_text: &'a str,
    pub output_json_schema: &'a Value,
}

pub trait PromptBuilder: Send + Sync {
    fn build_repl_prompt(&self, params: ReplPromptParams<'_>) -> Prompt;
    fn build_one_shot_prompt(&self, params: OneShotPromptParams<'_>) -> Prompt;
    fn build_extract_prompt(&self, params: ExtractPromptParams<'_>) -> Prompt;
}
