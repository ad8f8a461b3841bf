use std::sync::Arc;

use tracing::{debug, error, instrument};

use crate::error::Result;
use crate::pipeline::PipelineCache;
use crate::prompt::{self, ContextSource, ConversationContext, Persona, SessionParameters};

/// Stages a single turn moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Retrieving,
    Assembling,
    Generating,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub reply: String,
    pub retrieved: Vec<String>,
    pub context_source: ContextSource,
    pub states: Vec<TurnState>,
}

struct TurnTracker {
    states: Vec<TurnState>,
}

impl TurnTracker {
    fn new() -> Self {
        Self {
            states: vec![TurnState::Idle],
        }
    }

    fn current(&self) -> TurnState {
        self.states.last().copied().unwrap_or(TurnState::Idle)
    }

    fn advance(&mut self, next: TurnState) {
        debug!(from = ?self.current(), to = ?next, "Turn transition");
        self.states.push(next);
    }

    fn fail<E: std::fmt::Display>(&mut self, err: E) -> E {
        error!(state = ?self.current(), error = %err, "Turn failed");
        self.states.push(TurnState::Failed);
        err
    }
}

/// Runs conversational turns for one persona against a shared cache.
///
/// Holds no per-turn state, so one runner can serve many turns concurrently.
#[derive(Clone)]
pub struct ConversationRunner {
    cache: Arc<PipelineCache>,
    persona: Persona,
    top_k: usize,
}

impl ConversationRunner {
    pub fn new(cache: Arc<PipelineCache>, persona: Persona) -> Self {
        let top_k = cache.config().top_k;
        Self {
            cache,
            persona,
            top_k,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn persona(&self) -> Persona {
        self.persona
    }

    /// Initialises the shared pipeline ahead of the first turn.
    pub async fn warm_up(&self) -> Result<()> {
        self.cache.get_or_init().await.map(|_| ())
    }

    pub async fn run_turn(
        &self,
        query: &str,
        parameters: &SessionParameters,
        transcript: Option<&ConversationContext>,
    ) -> Result<String> {
        self.run_turn_report(query, parameters, transcript)
            .await
            .map(|report| report.reply)
    }

    #[instrument(skip_all, fields(persona = %self.persona))]
    pub async fn run_turn_report(
        &self,
        query: &str,
        parameters: &SessionParameters,
        transcript: Option<&ConversationContext>,
    ) -> Result<TurnReport> {
        let mut tracker = TurnTracker::new();

        tracker.advance(TurnState::Retrieving);
        let pipeline = self.cache.get_or_init().await.map_err(|e| tracker.fail(e))?;
        let retrieved = pipeline
            .retriever
            .retrieve(query, self.top_k)
            .map_err(|e| tracker.fail(e))?;

        tracker.advance(TurnState::Assembling);
        let (prompt, context_source) =
            prompt::assemble_with_source(self.persona, query, parameters, &retrieved, transcript);
        debug!(
            retrieved = retrieved.len(),
            context_source = ?context_source,
            prompt_chars = prompt.len(),
            "Assembled prompt"
        );

        tracker.advance(TurnState::Generating);
        let reply = pipeline
            .backend
            .generate(&prompt)
            .await
            .map_err(|e| tracker.fail(e))?;

        tracker.advance(TurnState::Done);
        Ok(TurnReport {
            reply,
            retrieved,
            context_source,
            states: tracker.states,
        })
    }
}
