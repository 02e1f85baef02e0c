//! Question pipeline
//!
//! One `AssistantSession` per conversation. A turn runs resolve, prompt,
//! generate, guard, execute, synthesize in that order and stops at the first
//! failing stage. Turns whose SQL reached the guard are remembered; a
//! conversational reply, a timeout or a generation failure leaves memory
//! untouched.
use crate::config::Config;
use crate::context_engine::{ConversationMemory, ConversationTurn, PromptBuilder, PromptBuilderConfig, TurnOutcome};
use crate::error::{AssistantError, ErrorKind, ExecutorError, GenerationError};
use crate::executor::{QueryExecutor, QueryResult};
use crate::metrics;
use crate::model_runtime::{parse_completion, Completion, GenerationEngine, GenerationSettings};
use crate::placeholders::PlaceholderResolver;
use crate::schema::SchemaDescriptor;
use crate::sql_guard::SqlGuard;
use crate::synthesizer::{ResponseSynthesizer, Synthesis, SynthesizerConfig};
use crate::utils::TextUtils;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    NoData,
    /// The model answered directly; no query ran
    Reply,
    Error(ErrorKind),
}

impl Outcome {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::NoData => "no_data",
            Outcome::Reply => "reply",
            Outcome::Error(ErrorKind::Generation) => "generation_error",
            Outcome::Error(ErrorKind::GenerationTimeout) => "generation_timeout",
            Outcome::Error(ErrorKind::Guard(_)) => "guard_rejected",
            Outcome::Error(ErrorKind::Execution) => "execution_error",
            Outcome::Error(ErrorKind::RowLimit) => "row_limit",
            Outcome::Error(ErrorKind::QueryTimeout) => "query_timeout",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

/// What the user gets back for one question
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub outcome: Outcome,
    /// The validated statement, when one ran
    pub sql: Option<String>,
}

impl Answer {
    fn from_error(error: &AssistantError) -> Self {
        Self {
            text: error.user_message(),
            outcome: Outcome::Error(error.kind()),
            sql: None,
        }
    }
}

/// Model output on its way to the guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub raw_text: String,
    /// `raw_text` with template tokens filled in
    pub resolved_text: String,
    pub validated: bool,
}

enum Generated {
    Query(CandidateQuery),
    Reply(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub memory_capacity: usize,
    pub prompt: PromptBuilderConfig,
    pub generation: GenerationSettings,
    pub synthesizer: SynthesizerConfig,
    pub phrase_answers: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 8,
            prompt: PromptBuilderConfig::default(),
            generation: GenerationSettings::default(),
            synthesizer: SynthesizerConfig::default(),
            phrase_answers: false,
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            memory_capacity: config.memory_capacity,
            prompt: config.prompt_config(),
            generation: config.generation_settings(),
            synthesizer: config.synthesizer_config(),
            phrase_answers: config.phrase_answers,
        }
    }
}

pub struct AssistantSession {
    schema: Arc<SchemaDescriptor>,
    engine: Arc<dyn GenerationEngine>,
    executor: Arc<QueryExecutor>,
    guard: SqlGuard,
    resolver: PlaceholderResolver,
    prompts: PromptBuilder,
    synthesizer: ResponseSynthesizer,
    memory: ConversationMemory,
    generation: GenerationSettings,
    phrase_answers: bool,
}

impl AssistantSession {
    pub fn new(
        schema: Arc<SchemaDescriptor>,
        engine: Arc<dyn GenerationEngine>,
        executor: Arc<QueryExecutor>,
        config: SessionConfig,
    ) -> Self {
        info!(
            "Starting session with engine '{}' (memory {}, context turns {})",
            engine.name(),
            config.memory_capacity,
            config.prompt.max_context_turns
        );
        Self {
            guard: SqlGuard::new(&schema),
            synthesizer: ResponseSynthesizer::new(Arc::clone(&schema), config.synthesizer),
            schema,
            engine,
            executor,
            resolver: PlaceholderResolver::new(),
            prompts: PromptBuilder::new(config.prompt),
            memory: ConversationMemory::new(config.memory_capacity),
            generation: config.generation,
            phrase_answers: config.phrase_answers,
        }
    }

    /// Answer `question` against the local clock.
    pub async fn ask(&mut self, question: &str) -> Answer {
        self.ask_at(question, chrono::Local::now().naive_local()).await
    }

    /// Answer `question` with relative dates resolved against `now`.
    pub async fn ask_at(&mut self, question: &str, now: NaiveDateTime) -> Answer {
        let started = Instant::now();
        info!("Question: {}", question);

        let answer = match self.run_turn(question, now.date()).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Turn failed ({:?}): {}", e.kind(), e);
                Answer::from_error(&e)
            }
        };

        metrics::inc_question(answer.outcome.label());
        metrics::observe_stage("total", started.elapsed().as_secs_f64());
        info!("Answered with {} in {:?}", answer.outcome.label(), started.elapsed());
        answer
    }

    /// Turns currently remembered, oldest first.
    pub fn history(&self) -> Vec<Arc<ConversationTurn>> {
        self.memory.context(self.memory.capacity())
    }

    pub fn clear_memory(&mut self) {
        info!("Clearing {} remembered turn(s)", self.memory.len());
        self.memory.clear();
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    async fn run_turn(&mut self, question: &str, reference: NaiveDate) -> Result<Answer, AssistantError> {
        let resolution = self.resolver.resolve(question, reference);
        if resolution.changed() {
            debug!("Resolved question: {}", resolution.text);
        }
        let resolved_question = resolution.text;

        let candidate = match self.generate(&resolved_question, reference).await? {
            Generated::Query(candidate) => candidate,
            Generated::Reply(text) => {
                debug!("Model replied without a query");
                return Ok(Answer {
                    text,
                    outcome: Outcome::Reply,
                    sql: None,
                });
            }
        };

        let sql = match self.guard.validate(&candidate.resolved_text) {
            Ok(sql) => sql,
            Err(e) => {
                metrics::inc_guard_rejection(e.reason.as_str());
                self.remember(question, &resolved_question, candidate.raw_text, e.to_string(), TurnOutcome::Rejected);
                return Err(e.into());
            }
        };
        let candidate = CandidateQuery { validated: true, ..candidate };
        debug!("Validated candidate: {:?}", candidate);

        let result = match self.execute(&sql).await {
            Ok(result) => result,
            Err(ExecutorError::Execution(e)) => {
                self.remember(question, &resolved_question, sql, e.to_string(), TurnOutcome::Failed);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let synthesis = self.synthesizer.synthesize(&resolved_question, &sql, &result);
        let text = self.phrase(question, &synthesis).await;

        let turn_outcome = match synthesis.outcome {
            Outcome::NoData => TurnOutcome::NoData,
            _ => TurnOutcome::Answered,
        };
        let summary = TextUtils::truncate_with_ellipsis(&synthesis.text, SUMMARY_CHARS).into_owned();
        self.remember(question, &resolved_question, sql.clone(), summary, turn_outcome);

        Ok(Answer {
            text,
            outcome: synthesis.outcome,
            sql: Some(sql),
        })
    }

    async fn generate(&self, resolved_question: &str, reference: NaiveDate) -> Result<Generated, GenerationError> {
        let context = self.memory.context(self.memory.capacity());
        let prompt = self.prompts.build(&self.schema, &context, resolved_question, reference);
        debug!("Prompt is {} chars", prompt.len());

        let started = Instant::now();
        let timeout = self.generation.timeout;
        let request = self.generation.request(prompt);
        let reply = match tokio::time::timeout(timeout, self.engine.generate(request)).await {
            Ok(reply) => reply,
            Err(_) => Err(GenerationError::Timeout(timeout.as_millis() as u64)),
        };
        metrics::observe_stage("generate", started.elapsed().as_secs_f64());

        let raw_text = match parse_completion(&reply?, &self.generation.stop)? {
            Completion::Sql(sql) => sql,
            Completion::Reply(text) => return Ok(Generated::Reply(text)),
        };
        let templates = self.resolver.resolve_templates(&raw_text, reference);
        if templates.changed() {
            debug!("Filled {} template token(s) in generated SQL", templates.replacements.len());
        }

        Ok(Generated::Query(CandidateQuery {
            raw_text,
            resolved_text: templates.text,
            validated: false,
        }))
    }

    async fn execute(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
        let started = Instant::now();
        let result = self.executor.execute(sql).await;
        metrics::observe_stage("execute", started.elapsed().as_secs_f64());
        result
    }

    async fn phrase(&self, question: &str, synthesis: &Synthesis) -> String {
        if !self.phrase_answers {
            return synthesis.text.clone();
        }
        let started = Instant::now();
        let text = self
            .synthesizer
            .phrase(self.engine.as_ref(), &self.generation, question, synthesis)
            .await;
        metrics::observe_stage("phrase", started.elapsed().as_secs_f64());
        text
    }

    fn remember(
        &mut self,
        question: &str,
        resolved_question: &str,
        generated_sql: String,
        result_summary: String,
        outcome: TurnOutcome,
    ) {
        self.memory.append(ConversationTurn {
            question: question.to_string(),
            resolved_question: resolved_question.to_string(),
            generated_sql,
            result_summary,
            outcome,
            timestamp: Utc::now(),
        });
    }
}
