#[cfg(feature = "cli")]
use anyhow::Context;
#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use dashboard_assistant::{
    config::Config, metrics, telemetry, AssistantSession, GenerationEngine, LlamaServerEngine, QueryExecutor,
    SchemaDescriptor, ScriptedEngine, SessionConfig,
};
#[cfg(feature = "cli")]
use std::{io::Write, path::PathBuf, sync::Arc};

#[cfg(feature = "cli")]
#[derive(Parser, Debug)]
#[command(name = "dashboard-assistant", version, about = "Ask questions about your dashboard records")]
struct Cli {
    /// Answer one question and exit
    #[arg(long)]
    ask: Option<String>,

    /// Records database (overrides DB_PATH)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Replay completions from FILE, one per line, instead of calling a model
    #[arg(long, value_name = "FILE")]
    scripted: Option<PathBuf>,

    /// Print the SQL that ran after each answer
    #[arg(long)]
    show_sql: bool,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    metrics::init_metrics();

    let cli = Cli::parse();

    let cfg = Config::from_env_with(|cfg| {
        if let Some(db) = &cli.db {
            cfg.db_path = db.to_string_lossy().into_owned();
        }
        if cli.scripted.is_some() {
            cfg.llama_bin = None;
        }
    })?;
    cfg.print_config();

    let engine: Arc<dyn GenerationEngine> = match &cli.scripted {
        Some(path) => {
            let script = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read script {}", path.display()))?;
            let replies: Vec<String> = script
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from)
                .collect();
            Arc::new(ScriptedEngine::new(replies))
        }
        None => {
            let timeout = cfg.generation_settings().timeout;
            Arc::new(LlamaServerEngine::launch(&cfg.runtime_config(), timeout).await?)
        }
    };

    let executor = QueryExecutor::open(std::path::Path::new(&cfg.db_path), cfg.execution_limits())
        .context("failed to open records database")?;
    let mut session = AssistantSession::new(
        Arc::new(SchemaDescriptor::personal_records()),
        engine,
        Arc::new(executor),
        SessionConfig::from(&cfg),
    );

    if let Some(question) = &cli.ask {
        let answer = session.ask(question).await;
        print_answer(&answer, cli.show_sql);
        return Ok(());
    }

    repl(&mut session, cli.show_sql).await
}

#[cfg(feature = "cli")]
async fn repl(session: &mut AssistantSession, show_sql: bool) -> anyhow::Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    println!("Ask about your expenses, loans, leave, documents, allowances or tasks.");
    println!("Commands: :clear, :history, :metrics, :quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            ":quit" | ":q" | ":exit" => break,
            ":clear" => {
                session.clear_memory();
                println!("Conversation cleared.");
            }
            ":history" => {
                let history = session.history();
                if history.is_empty() {
                    println!("No turns yet.");
                }
                for (i, turn) in history.iter().enumerate() {
                    println!("{}. [{:?}] {}", i + 1, turn.outcome, turn.question);
                    println!("   {}", turn.generated_sql);
                }
            }
            ":metrics" => print!("{}", metrics::render()),
            question => {
                let answer = session.ask(question).await;
                print_answer(&answer, show_sql);
            }
        }
    }
    Ok(())
}

#[cfg(feature = "cli")]
fn print_answer(answer: &dashboard_assistant::Answer, show_sql: bool) {
    println!("{}", answer.text);
    if show_sql {
        if let Some(sql) = &answer.sql {
            println!("  SQL: {}", sql);
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
