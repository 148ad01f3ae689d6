//! The proposer and critic roles, and their LLM-backed implementations.
//!
//! The negotiation loop only sees the [`Proposer`] and [`Critic`] traits;
//! these are constructed once (see [`crate::convert::Collaborators`]) and
//! passed in, so tests substitute scripted doubles and nothing holds a
//! process-wide client.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! avoids thundering-herd: with 500 ms base and 2 retries the wait sequence
//! is 500 ms → 1 s. Each attempt is additionally bounded by
//! `api_timeout_secs`.
//!
//! ## Role ids
//!
//! `llm-{provider}-{model}`, as reported by the resolved provider. The ids
//! are part of the instructions cache key, so switching provider or model
//! never serves text written by another model.

use crate::config::{PipelineConfig, RasterFormat};
use crate::error::{CollaboratorError, Manual2StepsError};
use crate::pipeline::crop::StepCrop;
use crate::pipeline::encode::encode_step_image;
use crate::pipeline::response::{extract_final_instruction, parse_critic_verdict, reports_no_step};
use crate::prompts;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

pub use crate::pipeline::response::CriticVerdict;

/// Default vision model when a provider is named without a model.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Sampling temperature of the first-draft self-review.
pub const REFLECTION_TEMPERATURE: f32 = 0.1;

/// A request to the proposer for one step.
#[derive(Debug, Clone, Copy)]
pub struct ProposalRequest<'a> {
    pub step: &'a StepCrop,
    /// Final text of the previous step, when prior-step context is enabled.
    pub prior_context: Option<&'a str>,
    /// Set on re-invocations after a clarification request.
    pub revision: Option<Revision<'a>>,
}

/// The draft being revised and the question that prompted the revision.
#[derive(Debug, Clone, Copy)]
pub struct Revision<'a> {
    pub previous_draft: &'a str,
    pub question: &'a str,
}

/// Drafts instructions from a step image.
#[async_trait]
pub trait Proposer: Send + Sync {
    /// Stable identifier; part of the instructions cache key.
    fn id(&self) -> &str;

    async fn propose(&self, request: ProposalRequest<'_>) -> Result<String, CollaboratorError>;
}

/// Judges draft text. Never sees the image.
#[async_trait]
pub trait Critic: Send + Sync {
    /// Stable identifier; part of the instructions cache key.
    fn id(&self) -> &str;

    async fn critique(&self, draft: &str) -> Result<CriticVerdict, CollaboratorError>;
}

/// Per-role call settings.
#[derive(Debug, Clone)]
pub struct RoleSettings {
    pub temperature: f32,
    pub max_tokens: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub api_timeout_secs: u64,
}

impl RoleSettings {
    pub fn proposer(config: &PipelineConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout_secs: config.api_timeout_secs,
        }
    }

    pub fn critic(config: &PipelineConfig) -> Self {
        Self {
            temperature: config.critic_temperature,
            ..Self::proposer(config)
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// Call `provider` with retry, backoff and a per-attempt timeout.
///
/// Empty replies count as failed attempts.
async fn chat_with_retry(
    provider: &dyn LLMProvider,
    messages: &[ChatMessage],
    settings: &RoleSettings,
    role: &str,
    label: &str,
) -> Result<String, CollaboratorError> {
    let options = settings.options();
    let mut last_err: Option<String> = None;

    for attempt in 0..=settings.max_retries {
        if attempt > 0 {
            let backoff = settings.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "{} {}: retry {}/{} after {}ms",
                role, label, attempt, settings.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        let call = provider.chat(messages, Some(&options));
        match tokio::time::timeout(Duration::from_secs(settings.api_timeout_secs), call).await {
            Ok(Ok(response)) if !response.content.trim().is_empty() => {
                debug!(
                    "{} {}: {} input tokens, {} output tokens",
                    role, label, response.prompt_tokens, response.completion_tokens
                );
                return Ok(response.content);
            }
            Ok(Ok(_)) => {
                warn!("{} {}: attempt {} returned an empty reply", role, label, attempt + 1);
                last_err = Some("empty reply".into());
            }
            Ok(Err(e)) => {
                warn!("{} {}: attempt {} failed: {}", role, label, attempt + 1, e);
                last_err = Some(e.to_string());
            }
            Err(_) => {
                warn!(
                    "{} {}: attempt {} timed out after {}s",
                    role,
                    label,
                    attempt + 1,
                    settings.api_timeout_secs
                );
                last_err = Some(format!("timed out after {}s", settings.api_timeout_secs));
            }
        }
    }

    Err(CollaboratorError::Failed {
        role: role.to_string(),
        retries: settings.max_retries,
        detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
    })
}

/// Stable id for a role backed by `provider`.
fn role_id(provider: &dyn LLMProvider) -> String {
    format!("llm-{}-{}", provider.name(), provider.model())
}

// ── Proposer ─────────────────────────────────────────────────────────────────

/// Text-only self-review applied to first drafts.
struct Reflector {
    provider: Arc<dyn LLMProvider>,
    settings: RoleSettings,
}

/// Vision-model proposer.
pub struct LlmProposer {
    provider: Arc<dyn LLMProvider>,
    id: String,
    settings: RoleSettings,
    format: RasterFormat,
    reflector: Option<Reflector>,
}

impl LlmProposer {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            id: role_id(provider.as_ref()),
            provider,
            settings: RoleSettings::proposer(config),
            format: config.format,
            reflector: None,
        }
    }

    /// Review every first draft with `provider` before it reaches the critic.
    pub fn with_reflection(mut self, provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        self.id = format!("{}+reflect-{}", self.id, role_id(provider.as_ref()));
        self.reflector = Some(Reflector {
            provider,
            settings: RoleSettings {
                temperature: REFLECTION_TEMPERATURE,
                ..RoleSettings::critic(config)
            },
        });
        self
    }

    fn messages(&self, request: &ProposalRequest<'_>, image: edgequake_llm::ImageData) -> Vec<ChatMessage> {
        match request.revision {
            None => {
                let mut messages = vec![ChatMessage::system(prompts::PROPOSER_SYSTEM_PROMPT)];
                if let Some(prior) = request.prior_context.filter(|p| !p.trim().is_empty()) {
                    messages.push(ChatMessage::system(prompts::prior_step_context(prior)));
                }
                messages.push(ChatMessage::user_with_images(
                    prompts::PROPOSER_USER_PROMPT,
                    vec![image],
                ));
                messages
            }
            Some(rev) => vec![
                ChatMessage::system(prompts::CLARIFICATION_SYSTEM_PROMPT),
                ChatMessage::user_with_images(
                    prompts::clarification_request(rev.previous_draft, rev.question),
                    vec![image],
                ),
            ],
        }
    }

    /// Self-review of a first draft. Best effort: any failure keeps the draft.
    async fn reflect(&self, draft: String, label: &str) -> String {
        let Some(reflector) = self.reflector.as_ref() else {
            return draft;
        };
        if reports_no_step(&draft) {
            return draft;
        }

        let messages = vec![
            ChatMessage::system(prompts::REFLECTION_SYSTEM_PROMPT),
            ChatMessage::user(prompts::reflection_request(&draft)),
        ];
        match chat_with_retry(
            reflector.provider.as_ref(),
            &messages,
            &reflector.settings,
            "reflection",
            label,
        )
        .await
        {
            Ok(raw) => {
                let refined = extract_final_instruction(&raw);
                let refined = refined.trim_matches('"').trim();
                if refined.is_empty() {
                    draft
                } else {
                    debug!("reflection {}: {} → {} chars", label, draft.len(), refined.len());
                    refined.to_string()
                }
            }
            Err(e) => {
                warn!("reflection {}: keeping unreviewed draft: {}", label, e);
                draft
            }
        }
    }
}

#[async_trait]
impl Proposer for LlmProposer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn propose(&self, request: ProposalRequest<'_>) -> Result<String, CollaboratorError> {
        let image = encode_step_image(&request.step.image_path, self.format)
            .await
            .map_err(|e| CollaboratorError::InputUnavailable {
                role: "proposer".into(),
                detail: format!("{}: {}", request.step.image_path.display(), e),
            })?;

        let messages = self.messages(&request, image);
        let raw = chat_with_retry(
            self.provider.as_ref(),
            &messages,
            &self.settings,
            "proposer",
            &request.step.step_id,
        )
        .await?;
        let draft = extract_final_instruction(&raw);
        if request.revision.is_some() {
            return Ok(draft);
        }
        Ok(self.reflect(draft, &request.step.step_id).await)
    }
}

// ── Critic ───────────────────────────────────────────────────────────────────

/// Text-only critic.
pub struct LlmCritic {
    provider: Arc<dyn LLMProvider>,
    id: String,
    settings: RoleSettings,
}

impl LlmCritic {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            id: role_id(provider.as_ref()),
            provider,
            settings: RoleSettings::critic(config),
        }
    }
}

/// Critic system prompt with the few-shot examples appended.
fn critic_system_message() -> String {
    let mut prompt = String::from(prompts::CRITIC_SYSTEM_PROMPT);
    prompt.push_str("\n\nExamples:");
    for (instruction, reply) in prompts::CRITIC_EXAMPLES {
        prompt.push_str(&format!("\n\n{}\n{}", prompts::critic_request(instruction), reply));
    }
    prompt
}

#[async_trait]
impl Critic for LlmCritic {
    fn id(&self) -> &str {
        &self.id
    }

    async fn critique(&self, draft: &str) -> Result<CriticVerdict, CollaboratorError> {
        let messages = vec![
            ChatMessage::system(critic_system_message()),
            ChatMessage::user(prompts::critic_request(draft)),
        ];
        let raw = chat_with_retry(self.provider.as_ref(), &messages, &self.settings, "critic", "draft")
            .await?;
        Ok(parse_critic_verdict(&raw))
    }
}

// ── Provider resolution ──────────────────────────────────────────────────────

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Manual2StepsError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Manual2StepsError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider for one role, from most- to least-specific.
///
/// 1. **Named provider + model** (`config.provider_name`): the model falls
///    back to [`DEFAULT_MODEL`].
/// 2. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`);
///    `model` overrides `EDGEQUAKE_MODEL` when given.
/// 3. **OpenAI** when `OPENAI_API_KEY` is set.
/// 4. **Full auto-detection** (`ProviderFactory::from_env`); `model` is not
///    applied here, the provider's own default is used.
pub fn resolve_provider(
    config: &PipelineConfig,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, Manual2StepsError> {
    if let Some(ref name) = config.provider_name {
        return create_provider(name, model.unwrap_or(DEFAULT_MODEL));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, model.unwrap_or(&env_model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model.unwrap_or(DEFAULT_MODEL));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Manual2StepsError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;
    if model.is_some() {
        warn!(
            "Auto-detected provider '{}' ignores the requested model; using '{}'",
            llm_provider.name(),
            llm_provider.model()
        );
    }
    Ok(llm_provider)
}

/// Build both LLM-backed roles from `config`.
///
/// With `reflect_drafts`, the proposer reviews first drafts with the
/// critic's provider.
pub fn llm_roles(
    config: &PipelineConfig,
) -> Result<(Arc<dyn Proposer>, Arc<dyn Critic>), Manual2StepsError> {
    let proposer_provider = resolve_provider(config, config.proposer_model.as_deref())?;
    let critic_model = config
        .critic_model
        .as_deref()
        .or(config.proposer_model.as_deref());
    let critic_provider = resolve_provider(config, critic_model)?;

    let mut proposer = LlmProposer::new(proposer_provider, config);
    if config.reflect_drafts {
        proposer = proposer.with_reflection(Arc::clone(&critic_provider), config);
    }
    Ok((
        Arc::new(proposer),
        Arc::new(LlmCritic::new(critic_provider, config)),
    ))
}
