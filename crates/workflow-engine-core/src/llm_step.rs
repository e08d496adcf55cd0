// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM Step Factory: resolves a step's `agent` name to an
//! executable [`StepFunction`] — a deterministic parser for `tier0_*`
//! agents, or a bounded chat-completion loop against the Smart Router
//! and Tool Registry for everything else.

use crate::context::ExecutionContext;
use crate::error::{classify_error_message, ErrorKind, OrchestratorError, Result};
use crate::providers::{ChatMessage, ChatResponse, ProviderRegistry, ToolCallRequest, ToolContract};
use crate::rate_limit::RateLimitTracker;
use crate::review;
use crate::router::{ModelTier, SmartRouter};
use crate::step::{StepDefinition, StepFunction};
use crate::tool::{Tool, ToolRegistry};
use crate::value::Value;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_TOOL_ROUNDS: u32 = 8;
const MAX_TOOL_CALLS_PER_ROUND: usize = 12;
const MAX_TOOL_RESULT_CHARS: usize = 12_000;
const MAX_PROVIDERS_PER_TURN: usize = 6;

/// Per-tier response token budget. Tier 0 never reaches the model.
pub fn tier_max_tokens(tier: u8) -> u32 {
    match tier {
        0 => 0,
        1 => 4096,
        2 => 8192,
        3 => 16384,
        4 => 16384,
        _ => 32768,
    }
}

/// Splits an agent name of the form `tier{0-5}_{role}` into its tier and
/// role. Anything else (no `tierN_` prefix, tier out of range) is not a
/// recognized agent name.
pub fn parse_agent_name(name: &str) -> Option<(u8, String)> {
    let rest = name.strip_prefix("tier")?;
    let mut chars = rest.chars();
    let tier_char = chars.next()?;
    let tier = tier_char.to_digit(10)?;
    if tier > 5 {
        return None;
    }
    let rest = chars.as_str();
    let role = rest.strip_prefix('_')?;
    if role.is_empty() {
        return None;
    }
    Some((tier as u8, role.to_string()))
}

/// Binds `step`'s `agent` metadata to an executable function: a
/// deterministic [`Tier0Parser`] for tier 0, an [`LlmStepFunction`] for
/// everything else. Called once, at workflow-definition parse time.
pub fn resolve_agent(step: &mut StepDefinition) -> Result<()> {
    let agent_name = match step.metadata.get("agent") {
        Some(Value::String(name)) => name.clone(),
        _ => {
            // No explicit agent: fall back to a tier-0 parser under the
            // step's own name, matching the Python default-agent behavior.
            step.name.clone()
        }
    };

    let (tier, role) = parse_agent_name(&agent_name).ok_or_else(|| OrchestratorError::InvalidStepConfig {
        step_name: step.name.clone(),
        reason: format!("agent '{agent_name}' does not match tier{{0-5}}_{{role}}"),
    })?;

    step.metadata.insert("tier".to_string(), Value::Number(tier as f64));
    step.metadata.insert("agent_role".to_string(), Value::String(role.clone()));

    if tier == 0 {
        step.func = Some(Arc::new(Tier0Parser));
        return Ok(());
    }

    let prompt_file = match step.metadata.get("prompt_file") {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    let tool_allowlist = match step.metadata.get("tools") {
        Some(Value::List(items)) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>(),
        ),
        _ => None,
    };

    step.func = Some(Arc::new(LlmStepFunction {
        step_name: step.name.clone(),
        agent_name,
        role,
        tier,
        description: step.description.clone(),
        expected_output_keys: step.output_mapping.keys().cloned().collect(),
        prompt_file,
        tool_allowlist,
    }));
    Ok(())
}

/// Deterministic tier-0 agent: a line-oriented scan for top-level
/// function/method definitions, with no model call involved. Stands in
/// for the family of non-LLM agents (parsers, linters, formatters)
/// tier 0 is reserved for.
pub struct Tier0Parser;

#[async_trait]
impl StepFunction for Tier0Parser {
    async fn call(
        &self,
        inputs: &BTreeMap<String, Value>,
        _ctx: &Arc<ExecutionContext>,
    ) -> Result<BTreeMap<String, Value>> {
        let source = inputs
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let mut functions = Vec::new();
        let mut line_count = 0u32;
        for (idx, line) in source.lines().enumerate() {
            line_count += 1;
            let trimmed = line.trim_start();
            for prefix in ["fn ", "def ", "function "] {
                if let Some(rest) = trimmed.strip_prefix(prefix) {
                    let name: String = rest
                        .chars()
                        .take_while(|c| c.is_alphanumeric() || *c == '_')
                        .collect();
                    if !name.is_empty() {
                        functions.push(Value::Map(BTreeMap::from([
                            ("name".to_string(), Value::String(name)),
                            ("line".to_string(), Value::Number((idx + 1) as f64)),
                        ])));
                    }
                }
            }
        }

        let mut output = BTreeMap::new();
        output.insert(
            "parsed_ast".to_string(),
            Value::Map(BTreeMap::from([("functions".to_string(), Value::List(functions))])),
        );
        output.insert(
            "code_metrics".to_string(),
            Value::Map(BTreeMap::from([(
                "line_count".to_string(),
                Value::Number(line_count as f64),
            )])),
        );
        Ok(output)
    }
}

/// Reads `prompts/<override or role>.md`, falling back to
/// `prompts/default.md`. Missing files resolve to an empty persona
/// rather than failing the step — personas are an enrichment, not a
/// required input.
pub fn load_persona(role: &str, override_file: Option<&str>) -> String {
    let candidates = [
        override_file.map(|f| format!("prompts/{f}")),
        Some(format!("prompts/{role}.md")),
        Some("prompts/default.md".to_string()),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(contents) = std::fs::read_to_string(&candidate) {
            return contents;
        }
    }
    String::new()
}

const UNIVERSAL_OUTPUT_CONTRACT: &str = "Respond using the sentinel artifact format for every \
logical output:\n\n<<<ARTIFACT <key>>>\nFILE: <relative/path>\n<full file contents>\nENDFILE\n\
<<<ENDARTIFACT>>>\n\nFor structured, non-file data, omit the FILE:/ENDFILE wrapper and put a JSON \
value directly inside the artifact block instead. Emit one block per logical output. Do not \
truncate or stub content. Each of ENDFILE and <<<ENDARTIFACT>>> must be alone on its own line.";

fn assemble_prompt(
    persona: &str,
    agent_name: &str,
    description: &str,
    context_json: &str,
    expected_output_keys: &[String],
    tools: &[Arc<dyn Tool>],
) -> String {
    let mut parts = Vec::new();
    if !persona.trim().is_empty() {
        parts.push(persona.trim().to_string());
    }
    parts.push(format!("You are acting as agent '{agent_name}'. Task: {description}"));
    parts.push(format!("Context:\n{context_json}"));
    if !expected_output_keys.is_empty() {
        parts.push(format!(
            "Your response MUST include an <<<ARTIFACT>>> block for each of: {}",
            expected_output_keys.join(", ")
        ));
    }
    if !tools.is_empty() {
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        parts.push(format!(
            "Tools are available for this turn: {}. Call a tool instead of guessing its result.",
            names.join(", ")
        ));
    }
    parts.push(UNIVERSAL_OUTPUT_CONTRACT.to_string());
    parts.join("\n\n")
}

fn build_tool_parameters_schema(tool: &dyn Tool) -> serde_json::Value {
    let spec_map = tool.schema().as_map().cloned().unwrap_or_default();
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (name, prop) in &spec_map {
        let Value::Map(prop_map) = prop else { continue };
        let mut cleaned = prop_map.clone();
        let is_required = cleaned.remove("required").map(|v| v.is_truthy()).unwrap_or(false);
        if is_required {
            required.push(serde_json::Value::String(name.clone()));
        }
        properties.insert(name.clone(), Value::Map(cleaned).into());
    }
    serde_json::json!({
        "type": "object",
        "properties": serde_json::Value::Object(properties),
        "required": required,
    })
}

fn build_tool_contracts(tools: &[Arc<dyn Tool>]) -> Vec<ToolContract> {
    tools
        .iter()
        .map(|t| ToolContract {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: build_tool_parameters_schema(t.as_ref()),
        })
        .collect()
}

fn truncate_chars(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        let total = s.chars().count();
        let truncated: String = s.chars().take(limit).collect();
        format!("{truncated}... [truncated, {total} chars total]")
    }
}

fn estimate_tokens(messages: &[ChatMessage]) -> f64 {
    messages.iter().map(|m| m.content.len() as f64 / 4.0 + 1.0).sum()
}

fn parse_retry_after_from_message(message: &str) -> Option<u64> {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"(?i)retry.after\D{0,10}(\d+)").unwrap());
    re.captures(message)?.get(1)?.as_str().parse().ok()
}

/// One nested `FILE: path\n...\nENDFILE` block inside a sentinel
/// artifact.
fn artifact_file_block_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?ms)^FILE:\s*([^\r\n]+)\r?\n(.*?)^ENDFILE\s*$").unwrap())
}

/// `<<<ARTIFACT key>>> ... <<<ENDARTIFACT>>>` blocks, body captured
/// verbatim for further parsing.
fn artifact_block_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?ms)^<<<ARTIFACT\s+([A-Za-z0-9_]+)>>>\r?\n(.*?)^<<<ENDARTIFACT>>>\s*$").unwrap()
    })
}

/// Parses the sentinel artifact format out of a raw model response.
/// A key whose body contains `FILE:`/`ENDFILE` blocks becomes
/// `{key}_files`, a map of relative path to file contents; anything else
/// is parsed as JSON and stored directly under `key`, falling back to
/// the raw trimmed text when it isn't valid JSON.
fn parse_sentinel_artifacts(text: &str) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for caps in artifact_block_regex().captures_iter(text) {
        let key = caps[1].to_string();
        let body = caps[2].to_string();
        let trimmed = body.trim();

        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(json) => {
                    out.insert(key.clone(), Value::from(json));
                }
                Err(_) => {
                    out.insert(key.clone(), Value::String(trimmed.to_string()));
                }
            }
        } else {
            out.insert(key.clone(), Value::String(trimmed.to_string()));
        }

        let mut files = BTreeMap::new();
        for file_caps in artifact_file_block_regex().captures_iter(&body) {
            files.insert(file_caps[1].trim().to_string(), file_caps[2].to_string());
        }
        if !files.is_empty() {
            let map = files
                .into_iter()
                .map(|(path, content)| (path, Value::String(content)))
                .collect();
            out.insert(format!("{key}_files"), Value::Map(map));
        }
    }
    out
}

/// Parses a model's final response into a step output map: sentinel
/// artifacts first, then a whole-body JSON object, finally a bare
/// `raw_response` fallback.
fn parse_response(text: &str) -> BTreeMap<String, Value> {
    let sentinel = parse_sentinel_artifacts(text);
    if !sentinel.is_empty() {
        return sentinel;
    }

    let trimmed = text.trim();
    let json_candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(json_candidate) {
        return map.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
    }

    BTreeMap::from([("raw_response".to_string(), Value::String(text.to_string()))])
}

/// An LLM-backed step: tier >= 1. Assembles a prompt, runs a bounded
/// tool-call loop against the Smart Router's provider fallback, and
/// parses the final response into the step's output map.
pub struct LlmStepFunction {
    pub step_name: String,
    pub agent_name: String,
    pub role: String,
    pub tier: u8,
    pub description: String,
    pub expected_output_keys: Vec<String>,
    pub prompt_file: Option<String>,
    pub tool_allowlist: Option<Vec<String>>,
}

impl LlmStepFunction {
    #[allow(clippy::too_many_arguments)]
    async fn call_with_fallback(
        &self,
        router: &SmartRouter,
        providers: &ProviderRegistry,
        rate_limiter: Option<&RateLimitTracker>,
        messages: &[ChatMessage],
        max_tokens: u32,
        tools: &[ToolContract],
    ) -> Result<(ChatResponse, String)> {
        let tier = ModelTier(self.tier);
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error: Option<String> = None;

        for _ in 0..MAX_PROVIDERS_PER_TURN {
            let model = match router.get_model_for_tier_excluding(tier, &tried) {
                Ok(model) => model,
                Err(err) => {
                    return Err(match last_error {
                        Some(msg) => OrchestratorError::Provider(msg),
                        None => err,
                    });
                }
            };
            tried.insert(model.clone());

            let Some(provider) = providers.resolve(&model) else {
                warn!(model = %model, "no provider registered for model prefix; skipping");
                continue;
            };

            if let Some(limiter) = rate_limiter {
                let estimated = estimate_tokens(messages);
                if !limiter.can_request(provider.name(), estimated) {
                    debug!(model = %model, "local rate budget exhausted, trying fallback");
                    router.record_rate_limit(&model, None);
                    continue;
                }
            }

            let started = std::time::Instant::now();
            match provider.complete_chat(&model, messages, max_tokens, tools).await {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    router.record_success(&model, latency_ms, response.usage.as_ref().and_then(|u| u.total_tokens));
                    return Ok((response, model));
                }
                Err(err) => {
                    let message = err.to_string();
                    let kind = classify_error_message(&message);
                    last_error = Some(message.clone());
                    if matches!(kind, ErrorKind::RateLimit) {
                        router.record_rate_limit(&model, parse_retry_after_from_message(&message));
                    } else {
                        router.record_failure(&model, kind);
                    }
                    debug!(model = %model, error = %message, "provider call failed, trying fallback");
                }
            }
        }

        Err(OrchestratorError::AllModelsFailed {
            tier: self.tier,
            tried: tried.into_iter().collect(),
        })
    }

    /// Returns the tool-result message to feed back to the model together
    /// with whether a real tool was actually invoked — an unknown-tool call
    /// produces an error payload but is not "valid", so a round made up
    /// entirely of unknown-tool calls doesn't count as progress.
    async fn execute_tool_call(call: &ToolCallRequest, tools: &[Arc<dyn Tool>]) -> (ChatMessage, bool) {
        let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
            let payload = serde_json::json!({
                "success": false,
                "error": format!("unknown tool '{}'", call.name),
            });
            return (
                ChatMessage::tool_result(call.id.clone(), call.name.clone(), payload.to_string()),
                false,
            );
        };

        let args: BTreeMap<String, Value> = call
            .arguments
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();

        let started = std::time::Instant::now();
        let payload = match tool.call(args).await {
            Ok(mut result) => {
                if result.execution_time_ms.is_none() {
                    result.execution_time_ms = Some(started.elapsed().as_millis() as u64);
                }
                serde_json::to_value(&result).unwrap_or(serde_json::Value::Null)
            }
            Err(err) => serde_json::json!({
                "success": false,
                "data": null,
                "error": err.to_string(),
                "metadata": {},
                "execution_time_ms": started.elapsed().as_millis() as u64,
            }),
        };

        (
            ChatMessage::tool_result(
                call.id.clone(),
                call.name.clone(),
                truncate_chars(&payload.to_string(), MAX_TOOL_RESULT_CHARS),
            ),
            true,
        )
    }
}

#[async_trait]
impl StepFunction for LlmStepFunction {
    async fn call(
        &self,
        _inputs: &BTreeMap<String, Value>,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<BTreeMap<String, Value>> {
        let router = ctx
            .services
            .resolve::<SmartRouter>()
            .ok_or_else(|| OrchestratorError::other("no SmartRouter registered in service container"))?;
        let providers = ctx
            .services
            .resolve::<ProviderRegistry>()
            .ok_or_else(|| OrchestratorError::other("no ProviderRegistry registered in service container"))?;
        let tool_registry = ctx.services.resolve::<ToolRegistry>().unwrap_or_default();
        let rate_limiter = ctx.services.resolve::<RateLimitTracker>();

        let tools = tool_registry.allowed_for_tier(self.tier, self.tool_allowlist.as_deref());
        let contracts = build_tool_contracts(&tools);

        let persona = load_persona(&self.role, self.prompt_file.as_deref());
        let context_vars = ctx.all_variables().await;
        let context_json = serde_json::to_string_pretty(&serde_json::Value::from(Value::Map(context_vars)))
            .unwrap_or_default();
        let prompt = assemble_prompt(
            &persona,
            &self.agent_name,
            &self.description,
            &context_json,
            &self.expected_output_keys,
            &tools,
        );

        let mut messages = vec![ChatMessage::user(prompt)];
        let max_tokens = tier_max_tokens(self.tier);
        let mut model_used = String::new();
        let mut total_tokens: u64 = 0;
        let mut tool_call_count: u32 = 0;
        let mut final_text = String::new();

        for round in 0..MAX_TOOL_ROUNDS {
            let (response, model) = self
                .call_with_fallback(&router, &providers, rate_limiter.as_deref(), &messages, max_tokens, &contracts)
                .await?;
            model_used = model;
            if let Some(usage) = &response.usage {
                total_tokens += usage.total_tokens.unwrap_or(0);
            }

            if response.tool_calls.is_empty() {
                final_text = response.content;
                break;
            }

            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            let calls: Vec<_> = response.tool_calls.iter().take(MAX_TOOL_CALLS_PER_ROUND).collect();
            tool_call_count += calls.len() as u32;
            let mut any_valid = false;
            for call in calls {
                let (tool_message, valid) = Self::execute_tool_call(call, &tools).await;
                any_valid |= valid;
                messages.push(tool_message);
            }

            if !any_valid {
                debug!(agent = %self.agent_name, round, "no valid tool calls this round, breaking");
                final_text = response.content;
                break;
            }

            if round + 1 == MAX_TOOL_ROUNDS {
                final_text = response.content;
            }
        }

        let mut output = parse_response(&final_text);

        if self.expected_output_keys.iter().any(|k| k == "review_report")
            || self.step_name.starts_with("review")
        {
            review::normalize_review_output(&mut output);
        }

        output.insert(
            "_meta".to_string(),
            Value::Map(BTreeMap::from([
                ("model_used".to_string(), Value::String(model_used)),
                ("tokens_used".to_string(), Value::Number(total_tokens as f64)),
                ("tool_calls".to_string(), Value::Number(tool_call_count as f64)),
            ])),
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;

    struct StubProvider {
        response_text: String,
    }

    #[async_trait]
    impl crate::providers::LLMProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete_chat(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _max_tokens: u32,
            _tools: &[ToolContract],
        ) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: self.response_text.clone(),
                tool_calls: Vec::new(),
                usage: None,
                headers: BTreeMap::new(),
            })
        }

        async fn count_tokens(&self, text: &str, _model: &str) -> std::result::Result<u64, ProviderError> {
            Ok((text.len() as f64 / 4.0).ceil() as u64)
        }
    }

    fn context_with_stub_provider(response_text: &str) -> Arc<ExecutionContext> {
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let router = SmartRouter::new();
        router.register_chain(ModelTier(1), crate::router::FallbackChain::new(vec!["stub-model".to_string()]));
        let mut providers = ProviderRegistry::default();
        providers.register("stub-", Arc::new(StubProvider { response_text: response_text.to_string() }));
        ctx.services.register(Arc::new(router));
        ctx.services.register(Arc::new(providers));
        ctx
    }

    #[tokio::test]
    async fn review_prefixed_step_name_triggers_normalization_even_without_review_report_output_key() {
        // `review_security`'s own output_mapping only targets `findings`, not
        // the literal `review_report` key, so only the step-name prefix can
        // trigger normalization here.
        let step_fn = LlmStepFunction {
            step_name: "review_security".to_string(),
            agent_name: "tier2_review_security".to_string(),
            role: "review_security".to_string(),
            tier: 1,
            description: "review for security issues".to_string(),
            expected_output_keys: vec!["findings".to_string()],
            prompt_file: None,
            tool_allowlist: None,
        };
        let ctx = context_with_stub_provider("{\"overall_status\": \"pass\", \"findings\": []}");
        let output = step_fn.call(&BTreeMap::new(), &ctx).await.unwrap();
        let report = output.get("review_report").unwrap().as_map().unwrap();
        assert_eq!(
            report.get("overall_status").unwrap().as_str(),
            Some("APPROVED")
        );
    }

    #[tokio::test]
    async fn non_review_step_with_no_review_report_key_is_left_unnormalized() {
        let step_fn = LlmStepFunction {
            step_name: "summarize".to_string(),
            agent_name: "tier2_coder".to_string(),
            role: "coder".to_string(),
            tier: 1,
            description: "summarize".to_string(),
            expected_output_keys: vec!["summary".to_string()],
            prompt_file: None,
            tool_allowlist: None,
        };
        let ctx = context_with_stub_provider("{\"overall_status\": \"pass\"}");
        let output = step_fn.call(&BTreeMap::new(), &ctx).await.unwrap();
        assert!(output.get("review_report").is_none());
    }

    #[test]
    fn tier_max_tokens_matches_table() {
        assert_eq!(tier_max_tokens(0), 0);
        assert_eq!(tier_max_tokens(1), 4096);
        assert_eq!(tier_max_tokens(2), 8192);
        assert_eq!(tier_max_tokens(3), 16384);
        assert_eq!(tier_max_tokens(4), 16384);
        assert_eq!(tier_max_tokens(5), 32768);
        assert_eq!(tier_max_tokens(9), 32768);
    }

    #[test]
    fn parse_agent_name_splits_tier_and_role() {
        assert_eq!(parse_agent_name("tier0_parser"), Some((0, "parser".to_string())));
        assert_eq!(parse_agent_name("tier3_coder"), Some((3, "coder".to_string())));
        assert_eq!(parse_agent_name("tier5_architect"), Some((5, "architect".to_string())));
        assert_eq!(parse_agent_name("tier6_nope"), None);
        assert_eq!(parse_agent_name("not_an_agent"), None);
        assert_eq!(parse_agent_name("tier1_"), None);
    }

    #[tokio::test]
    async fn resolve_agent_wires_tier0_parser() {
        let mut step = StepDefinition::new("parse");
        step.metadata
            .insert("agent".to_string(), Value::String("tier0_parser".to_string()));
        resolve_agent(&mut step).unwrap();
        assert!(step.func.is_some());

        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let inputs = BTreeMap::from([("source".to_string(), Value::String("fn main() {}\ndef go():\n".to_string()))]);
        let output = step.func.unwrap().call(&inputs, &ctx).await.unwrap();
        let metrics = output.get("code_metrics").unwrap().as_map().unwrap();
        assert_eq!(metrics.get("line_count").unwrap().as_f64(), Some(2.0));
    }

    #[test]
    fn resolve_agent_rejects_unrecognized_agent_name() {
        let mut step = StepDefinition::new("weird");
        step.metadata
            .insert("agent".to_string(), Value::String("banana".to_string()));
        assert!(resolve_agent(&mut step).is_err());
    }

    #[test]
    fn sentinel_parser_extracts_files_and_json_blocks() {
        let text = "<<<ARTIFACT code>>>\nFILE: src/a.py\nprint('x')\nENDFILE\n<<<ENDARTIFACT>>>\n\
                    <<<ARTIFACT meta>>>\n{\"ok\":true}\n<<<ENDARTIFACT>>>";
        let parsed = parse_sentinel_artifacts(text);
        let files = parsed.get("code_files").unwrap().as_map().unwrap();
        assert_eq!(files.get("src/a.py").unwrap().as_str(), Some("print('x')\n"));
        assert_eq!(
            parsed.get("code").unwrap().as_str(),
            Some("FILE: src/a.py\nprint('x')\nENDFILE")
        );
        let meta = parsed.get("meta").unwrap();
        assert_eq!(meta.get("ok").unwrap(), &Value::Bool(true));
    }

    #[test]
    fn parse_response_falls_back_to_raw_text_when_nothing_matches() {
        let output = parse_response("just some prose, no structure here");
        assert_eq!(
            output.get("raw_response").unwrap().as_str(),
            Some("just some prose, no structure here")
        );
    }

    #[test]
    fn parse_response_prefers_whole_body_json_over_raw_fallback() {
        let output = parse_response("{\"summary\": \"done\"}");
        assert_eq!(output.get("summary").unwrap().as_str(), Some("done"));
    }

    struct MockTool;

    #[async_trait]
    impl crate::tool::Tool for MockTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn schema(&self) -> Value {
            Value::Map(BTreeMap::new())
        }
        async fn call(&self, args: BTreeMap<String, Value>) -> Result<crate::tool::ToolResult> {
            Ok(crate::tool::ToolResult::ok(Value::Map(args)))
        }
    }

    fn tool_call(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn execute_tool_call_reports_unknown_tools_as_invalid() {
        let tools: Vec<Arc<dyn crate::tool::Tool>> = vec![Arc::new(MockTool)];
        let (_msg, valid) = LlmStepFunction::execute_tool_call(&tool_call("1", "nonexistent"), &tools).await;
        assert!(!valid);
    }

    #[tokio::test]
    async fn execute_tool_call_reports_registered_tools_as_valid() {
        let tools: Vec<Arc<dyn crate::tool::Tool>> = vec![Arc::new(MockTool)];
        let (_msg, valid) = LlmStepFunction::execute_tool_call(&tool_call("1", "echo"), &tools).await;
        assert!(valid);
    }
}
