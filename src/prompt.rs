//! Prompt templates and the deterministic assembly of context, session
//! parameters and the user's message into a single generation prompt.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Stands in for the context block when neither retrieval nor a transcript
/// produced anything.
pub const EMPTY_CONTEXT_MARKER: &str = "[]";

/// Separator between retrieved snippets.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

pub static THERAPIST_TEMPLATE: &str = r#"
You are "Sunny", a warm, patient and non-judgmental virtual therapist.
Hold this conversation the way a caring human therapist would.

Alongside each message you receive readings from wearable sensors and facial
expression analysis describing how the user is doing physically and emotionally.
Acknowledge that state gently before responding to what they said.

Context from similar past sessions:
{context}

User emotional and physiological parameters:
{parameters}

User message:
{query}

Sunny:
1. Open by reflecting the user's current state from their parameters (mood, stress, fatigue, recovery, facial mood).
   - A low mood with high stress might sound like: "It sounds like things feel heavy and tense right now."
   - High fatigue with improving recovery might sound like: "You've been running on empty, but it seems you're slowly finding your footing."
   - Keep it natural, never clinical.

2. Respond to the user's message ({query}) thoughtfully.
   - Validate what they feel.
   - Ask a gentle, open-ended question where it helps.
   - Offer a coping idea or reflection grounded in the context above.

3. Stay warm, conversational and human throughout.
"#;

pub static COMPANION_TEMPLATE: &str = r#"
You are "{friend_name}", the user's emotionally tuned-in best friend.
Your job is to make the user feel seen, heard and understood, with warmth,
humour and honesty, whether they want to laugh, vent or open up.

### Mode
The user picked the **{mode}** mode. Let it set your vibe:
- **Caring**: gentle, nurturing, patient, validating.
- **Chill**: relaxed, casual, hanging-out energy.
- **Flirty**: playful light teasing, always respectful.
- **Funny**: jokes and light-hearted replies.
- **Deep**: reflective, introspective, thoughtful.
- **Hype**: upbeat, motivating, full of energy.
- **Real Talk**: honest and direct, still kind.

### Ground rules
- Sound like a person, not a therapist or a bot.
- Acknowledge feelings before offering any advice.
- Keep it flowing like a chat; no lectures.
- Emojis and casual language are welcome when they fit.
- Ask open questions that invite the user to share.
- Keep things safe, supportive and fun.

### Session settings
{parameters}

### Conversation so far
Pick up naturally from here and keep the emotional thread going.

{context}

User: {query}

{friend_name}:
"#;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([a-z_]+)\}").unwrap();
}

/// Response style. Each persona maps to one fixed template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    Therapist,
    Companion,
}

impl Persona {
    pub fn template(self) -> &'static str {
        match self {
            Persona::Therapist => THERAPIST_TEMPLATE,
            Persona::Companion => COMPANION_TEMPLATE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Persona::Therapist => "therapist",
            Persona::Companion => "companion",
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Persona {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "therapist" => Ok(Persona::Therapist),
            "companion" | "friend" => Ok(Persona::Companion),
            other => Err(format!(
                "unknown persona '{other}'. Expected 'therapist' or 'companion'."
            )),
        }
    }
}

/// Sensor and self-reported readings for a therapist session.
/// Field order here is the serialized order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TherapistParameters {
    pub mood: String,
    pub stress: f32,
    pub fatigue: f32,
    pub recovery: f32,
    pub fer_mood: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanionParameters {
    pub mode: String,
    pub friend_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionParameters {
    Therapist(TherapistParameters),
    Companion(CompanionParameters),
}

impl SessionParameters {
    /// Compact JSON with a fixed field order.
    pub fn to_canonical_string(&self) -> String {
        let serialized = match self {
            SessionParameters::Therapist(params) => serde_json::to_string(params),
            SessionParameters::Companion(params) => serde_json::to_string(params),
        };
        serialized.unwrap_or_default()
    }

    fn companion(&self) -> Option<&CompanionParameters> {
        match self {
            SessionParameters::Companion(params) => Some(params),
            SessionParameters::Therapist(_) => None,
        }
    }
}

impl From<TherapistParameters> for SessionParameters {
    fn from(params: TherapistParameters) -> Self {
        SessionParameters::Therapist(params)
    }
}

impl From<CompanionParameters> for SessionParameters {
    fn from(params: CompanionParameters) -> Self {
        SessionParameters::Companion(params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: String,
    pub text: String,
}

/// Running transcript of an interactive session, oldest turn first.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    turns: VecDeque<Turn>,
    max_turns: Option<usize>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps only the newest `max_turns` turns.
    pub fn with_max_turns(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns: Some(max_turns.max(1)),
        }
    }

    pub fn push(&mut self, speaker: impl Into<String>, text: impl Into<String>) {
        self.turns.push_back(Turn {
            speaker: speaker.into(),
            text: text.into(),
        });
        if let Some(max) = self.max_turns {
            while self.turns.len() > max {
                self.turns.pop_front();
            }
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push("User", text);
    }

    pub fn push_reply(&mut self, speaker: impl Into<String>, text: impl Into<String>) {
        self.push(speaker, text);
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker, turn.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Where the context block of an assembled prompt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    Retrieved,
    Transcript,
    Empty,
}

/// Retrieved text wins; the transcript is only a fallback.
pub fn select_context(
    retrieved: &[String],
    transcript: Option<&ConversationContext>,
) -> (String, ContextSource) {
    let joined = retrieved.join(CONTEXT_SEPARATOR);
    if !joined.trim().is_empty() {
        return (joined, ContextSource::Retrieved);
    }

    match transcript.filter(|t| !t.is_empty()) {
        Some(transcript) => (transcript.render(), ContextSource::Transcript),
        None => (EMPTY_CONTEXT_MARKER.to_string(), ContextSource::Empty),
    }
}

pub fn assemble(
    persona: Persona,
    query: &str,
    parameters: &SessionParameters,
    retrieved: &[String],
    transcript: Option<&ConversationContext>,
) -> String {
    assemble_with_source(persona, query, parameters, retrieved, transcript).0
}

pub fn assemble_with_source(
    persona: Persona,
    query: &str,
    parameters: &SessionParameters,
    retrieved: &[String],
    transcript: Option<&ConversationContext>,
) -> (String, ContextSource) {
    let (context, source) = select_context(retrieved, transcript);
    let serialized = parameters.to_canonical_string();
    let companion = parameters.companion();

    // Single pass, so braces inside the query or context are never expanded.
    let prompt = PLACEHOLDER
        .replace_all(persona.template(), |caps: &Captures| match &caps[1] {
            "context" => context.clone(),
            "parameters" => serialized.clone(),
            "query" => query.to_string(),
            "friend_name" => companion.map(|p| p.friend_name.clone()).unwrap_or_default(),
            "mode" => companion.map(|p| p.mode.clone()).unwrap_or_default(),
            _ => caps[0].to_string(),
        })
        .into_owned();

    (prompt, source)
}
