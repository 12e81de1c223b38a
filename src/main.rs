use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use ditch_client::build_client;
use ditch_config::DitchConfig;
use ditch_conversation::{ConversationManager, ConversationSettings};
use ditch_core::{BanterError, ConversationId};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod transport;

use transport::chunk_reply;

#[derive(Parser)]
#[command(name = "ditch")]
#[command(about = "Stateful multi-turn chat over a stateless completion API", long_about = None)]
struct Cli {
    /// Config file; defaults to $DITCH_CONFIG or ./config.yaml
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive conversation
    Chat {
        /// Conversation subject; defaults to $USER
        #[arg(short, long)]
        user: Option<String>,

        #[arg(long, default_value = "cli")]
        channel: String,
    },

    /// Send a single message and print the reply
    Ask {
        #[arg(short, long)]
        prompt: String,

        #[arg(short, long)]
        user: Option<String>,

        #[arg(long, default_value = "cli")]
        channel: String,
    },

    /// Check that the completion endpoint answers
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let config_path = cli.config.unwrap_or_else(DitchConfig::default_config_path);
    let config = if config_path.exists() {
        info!("Loading configuration from: {:?}", config_path);
        DitchConfig::from_yaml(&config_path)?
    } else {
        info!("No config file at {:?}, using defaults", config_path);
        DitchConfig::from_yaml_str("")?
    };

    let client = build_client(&config).await?;
    info!(
        provider = client.provider(),
        model = %config.model.name,
        history_budget = config.history_budget(),
        "Completion client ready"
    );

    let manager = Arc::new(ConversationManager::new(
        ConversationSettings::from_config(&config),
        client,
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    let max_chars = config.transport.max_message_chars;

    match cli.command {
        Commands::Chat { user, channel } => {
            let id = ConversationId::new(subject_or_default(user), channel);
            interactive_chat(&manager, id, max_chars, &shutdown).await?;
        }
        Commands::Ask {
            prompt,
            user,
            channel,
        } => {
            let id = ConversationId::new(subject_or_default(user), channel);
            ask(&manager, id, &prompt, max_chars, &shutdown).await?;
        }
        Commands::Test => {
            test_connectivity(&manager, &shutdown).await;
        }
    }

    Ok(())
}

fn subject_or_default(user: Option<String>) -> String {
    user.or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "local".to_string())
}

async fn interactive_chat(
    manager: &ConversationManager,
    id: ConversationId,
    max_chars: usize,
    shutdown: &CancellationToken,
) -> Result<()> {
    println!("🤖 ditch interactive chat ({id})");
    println!("Type 'exit' or 'quit' to end the conversation");
    println!("Type 'history' to see the dialog, 'usage' for token usage");
    println!("═══════════════════════════════════════\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("You> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();

        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }
        if input.eq_ignore_ascii_case("history") {
            print_history(manager, &id).await;
            continue;
        }
        if input.eq_ignore_ascii_case("usage") {
            print_usage(manager);
            continue;
        }

        match manager.banter(&id, input, &shutdown.child_token()).await {
            Ok(reply) => {
                println!();
                for chunk in chunk_reply(&reply, max_chars) {
                    println!("Assistant> {chunk}");
                }
                println!();
            }
            Err(BanterError::Cancelled) => {
                println!("\nCancelled.");
                break;
            }
            Err(e) => {
                error!("Banter error: {}", e);
                println!("\n⚠️  No reply: {}\n", e.root_cause());
            }
        }
    }

    println!("Goodbye!");
    print_usage(manager);
    Ok(())
}

async fn ask(
    manager: &ConversationManager,
    id: ConversationId,
    prompt: &str,
    max_chars: usize,
    shutdown: &CancellationToken,
) -> Result<()> {
    info!(conversation = %id, "Sending single message");

    let reply = manager.banter(&id, prompt, &shutdown.child_token()).await?;
    for chunk in chunk_reply(&reply, max_chars) {
        println!("{chunk}");
    }

    print_usage(manager);
    Ok(())
}

async fn test_connectivity(manager: &ConversationManager, shutdown: &CancellationToken) {
    println!("\n🔍 Testing completion endpoint");
    println!("═══════════════════════════════════════");

    let id = ConversationId::new("ditch-connectivity-test", "test");
    match manager
        .banter(&id, "Hello, can you hear me?", &shutdown.child_token())
        .await
    {
        Ok(reply) => {
            println!("✅ Success!");
            println!("Response: {reply}");
            let stats = manager.context().tracker().get_stats();
            println!("Token usage: {} tokens", stats.total_tokens);
        }
        Err(e) => {
            warn!("Connectivity test failed: {}", e);
            println!("❌ Failed");
            println!("Error: {e}");
        }
    }
}

async fn print_history(manager: &ConversationManager, id: &ConversationId) {
    let Some(conversation) = manager.get(id).await else {
        println!("(empty)\n");
        return;
    };

    let turns = conversation.snapshot().await;
    if turns.is_empty() {
        println!("(empty)\n");
        return;
    }
    for turn in &turns {
        println!(
            "[{} {} | {} tokens] {}",
            turn.created_at.format("%H:%M:%S"),
            turn.role.as_str(),
            turn.token_cost,
            turn.content
        );
    }
    println!("Total: {} tokens\n", conversation.total_tokens().await);
}

fn print_usage(manager: &ConversationManager) {
    let stats = manager.context().tracker().get_stats();
    let summary = manager.context().metrics().get_summary();

    println!("\n📊 Token Statistics:");
    println!("  Prompt tokens: {}", stats.prompt_tokens);
    println!("  Completion tokens: {}", stats.completion_tokens);
    println!("  Total tokens: {}", stats.total_tokens);

    let mut per_model: Vec<_> = manager
        .context()
        .tracker()
        .get_model_stats()
        .into_values()
        .collect();
    per_model.sort_by(|a, b| a.model_id.cmp(&b.model_id));
    for model in per_model {
        println!(
            "  {}: {} calls, {} prompt + {} completion tokens",
            model.model_id, model.calls, model.prompt_tokens, model.completion_tokens
        );
    }
    println!(
        "  Requests: {} ({} failed, {} attempts, {:.0}ms avg)",
        summary.total_requests,
        summary.failed_requests,
        summary.total_attempts,
        summary.average_latency_ms
    );
}

fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose { "debug" } else { "info" };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let (text_layer, json_layer) = match format {
        LogFormat::Text => (
            Some(tracing_subscriber::fmt::layer().with_writer(io::stderr)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_writer(io::stderr)),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .init();
}
