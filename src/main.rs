use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sunny_rag::{
    CompanionParameters, ConversationContext, ConversationRunner, Persona, PipelineCache,
    SessionParameters, TherapistParameters, get_config,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const COMPANION_MODES: [&str; 7] = [
    "Caring", "Chill", "Flirty", "Funny", "Deep", "Hype", "Real Talk",
];

/// Keeps the transcript fallback from growing without bound.
const TRANSCRIPT_TURNS: usize = 40;

#[derive(Parser)]
#[command(name = "sunny-rag", about = "Retrieval-augmented supportive chat")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chat interactively with a persona.
    Chat {
        #[arg(long, default_value = "therapist")]
        persona: Persona,
    },
    /// Rebuild the persisted index from the corpus.
    BuildIndex,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config().context("loading configuration")?;
    let cache = Arc::new(PipelineCache::new(config));

    match cli.command {
        Command::BuildIndex => {
            let documents = cache
                .rebuild_index()
                .await
                .context("rebuilding the vector index")?;
            info!(documents, path = ?cache.config().index_path, "Index rebuilt");
        }
        Command::Chat { persona } => chat(ConversationRunner::new(cache, persona)).await?,
    }

    Ok(())
}

async fn chat(runner: ConversationRunner) -> Result<()> {
    let (parameters, speaker) = match runner.persona() {
        Persona::Therapist => (read_therapist_parameters()?, "Sunny".to_string()),
        Persona::Companion => {
            let params = read_companion_parameters()?;
            let name = params.friend_name.clone();
            (SessionParameters::Companion(params), name)
        }
    };

    println!("Preparing the conversation (first run builds the index)...");
    runner.warm_up().await.context("initializing the pipeline")?;
    println!("\nYou're chatting with {speaker}. Type 'exit' to end.\n");

    let mut transcript = ConversationContext::with_max_turns(TRANSCRIPT_TURNS);
    loop {
        let Some(query) = read_line("You: ")? else {
            break; // EOF (Ctrl+D)
        };
        if query.is_empty() {
            continue;
        }
        if matches!(query.to_lowercase().as_str(), "exit" | "quit") {
            break;
        }

        match runner.run_turn(&query, &parameters, Some(&transcript)).await {
            Ok(reply) => {
                println!("{speaker}: {reply}\n");
                transcript.push_user(query);
                transcript.push_reply(&speaker, reply);
            }
            Err(e) => eprintln!("Error: {e}\n"),
        }
    }

    println!("\n{speaker}: I'm really glad we talked. Take care.");
    Ok(())
}

fn read_line(label: &str) -> Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn read_level(label: &str) -> Result<f32> {
    loop {
        let Some(raw) = read_line(label)? else {
            anyhow::bail!("input closed while reading {}", label.trim());
        };
        match raw.parse::<f32>() {
            Ok(value) if value.is_finite() && value >= 0.0 => return Ok(value),
            _ => println!("Please enter a non-negative number."),
        }
    }
}

fn read_therapist_parameters() -> Result<SessionParameters> {
    println!("Enter your current readings (levels are numbers from 0 to 1):");
    let mood = read_line("Mood (e.g. happy, sad, anxious): ")?.unwrap_or_default();
    let stress = read_level("Stress: ")?;
    let fatigue = read_level("Fatigue: ")?;
    let recovery = read_level("Recovery: ")?;
    let fer_mood = read_line("Facial mood (happy/sad/neutral): ")?
        .unwrap_or_default()
        .to_lowercase();

    Ok(TherapistParameters {
        mood: mood.to_lowercase(),
        stress,
        fatigue,
        recovery,
        fer_mood,
    }
    .into())
}

fn read_companion_parameters() -> Result<CompanionParameters> {
    let friend_name = read_line("Your best friend's name (e.g. Sunny, Alex): ")?
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Sunny".to_string());

    println!("\nChoose a mode for your friend:");
    for (i, mode) in COMPANION_MODES.iter().enumerate() {
        println!("{}. {mode}", i + 1);
    }
    let choice = read_line("Enter your choice (1-7): ")?.unwrap_or_default();
    let mode = choice
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| COMPANION_MODES.get(i))
        .copied()
        .unwrap_or(COMPANION_MODES[0]);

    Ok(CompanionParameters {
        mode: mode.to_string(),
        friend_name,
    })
}
