mod config;
mod conversation;
mod db;
mod error;
mod extract;
mod llm;
mod queue;
mod quota;
mod session;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::conversation::{ConversationMemory, ConversationSink, SinkEntry};
use crate::extract::PromptExtractor;
use crate::llm::{Attachment, GenerationEngine, Role, Turn};
use crate::queue::{Pipeline, QueueCoordinator, QueueStatus};
use crate::quota::{QuotaGate, QuotaLedger, SqliteLedger};
use crate::session::{Session, Submission};

#[tokio::main]
async fn main() {
    // Load .env file (if present) before anything reads env vars
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    if args.iter().any(|a| a == "--default-config") {
        print!("{}", Config::default_config_contents());
        return;
    }

    // Initialize tracing.  Stdout belongs to the conversation.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config_path = flag_value(&args, "--config").map(PathBuf::from);

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            return;
        }
    };

    let actor = flag_value(&args, "--user")
        .or_else(|| std::env::var("GENQUEUE_USER").ok())
        .filter(|u| !u.trim().is_empty());

    // Open database
    let data_dir = config.data_dir();
    let db_path = data_dir.join("genqueue.db");
    let db = match db::open(&db_path) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to open database: {e}");
            return;
        }
    };
    let db = Arc::new(Mutex::new(db));

    let ledger: Arc<dyn QuotaLedger> =
        Arc::new(SqliteLedger::new(db.clone(), config.quota.initial_balance));

    // Handle --balance / --ledger
    if args.iter().any(|a| a == "--balance" || a == "--ledger") {
        let Some(actor) = actor.as_deref() else {
            error!("--balance and --ledger need --user or GENQUEUE_USER");
            return;
        };
        if let Err(e) = print_account(ledger.as_ref(), actor, args.iter().any(|a| a == "--ledger")).await {
            error!("failed to read ledger: {e}");
        }
        return;
    }

    let engine = match GenerationEngine::new(&config) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!("failed to initialize generation backend: {e}");
            return;
        }
    };

    info!(
        backend = engine.active_backend(),
        user = actor.as_deref().unwrap_or("<anonymous>"),
        db = %db_path.display(),
        pacing_ms = config.queue.pacing_delay_ms,
        cost = config.quota.cost_per_generation,
        "genqueue starting"
    );

    let gate = Arc::new(QuotaGate::new(ledger, config.quota.cost_per_generation));
    let memory = ConversationMemory::new(db.clone(), config.conversation_window);
    let sink = Arc::new(ConsoleSink { memory });
    let pipeline = Arc::new(Pipeline::new(gate, engine, sink));
    let queue = QueueCoordinator::new(pipeline, config.pacing_delay());
    let session = Session::new(
        actor,
        PromptExtractor::new(config.queue.min_prompt_chars),
        queue,
    );

    spawn_progress_printer(&session);

    if let Err(e) = run_repl(&session).await {
        error!("input error: {e}");
    }

    if session.progress().is_processing {
        info!("waiting for the in-flight item before exit");
        session.stop();
        session.queue().wait_finished().await;
    }
    info!("genqueue stopped");
}

/// Prints every conversation entry as it is stored.
struct ConsoleSink {
    memory: ConversationMemory,
}

#[async_trait::async_trait]
impl ConversationSink for ConsoleSink {
    async fn append(&self, actor: &str, entry: SinkEntry) -> error::Result<()> {
        match (entry.role, entry.is_error) {
            (Role::User, _) => {
                let attached = if entry.attachments.is_empty() {
                    String::new()
                } else {
                    format!(" [+{} image(s)]", entry.attachments.len())
                };
                println!("> {}{attached}", entry.content);
            }
            (Role::Assistant, false) => println!("{}\n", entry.content),
            (Role::Assistant, true) => println!("! {}\n", entry.content),
        }
        self.memory.append(actor, entry).await
    }

    async fn history(&self, actor: &str) -> error::Result<Vec<Turn>> {
        self.memory.history(actor).await
    }
}

fn spawn_progress_printer(session: &Session) {
    let mut rx = session.queue().subscribe();
    tokio::spawn(async move {
        let mut last = *rx.borrow_and_update();
        while rx.changed().await.is_ok() {
            let p = *rx.borrow_and_update();
            if p.is_processing && (p.current_index != last.current_index || !last.is_processing) {
                println!("[{}/{}]", p.current_index + 1, p.total_count);
            } else if !p.is_processing && last.is_processing {
                if p.stopped {
                    println!("[batch stopped]");
                } else {
                    println!("[batch done]");
                }
            }
            last = p;
        }
    });
}

async fn run_repl(session: &Session) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buffer: Vec<String> = Vec::new();
    let mut staged: Vec<Attachment> = Vec::new();
    let mut batch_mode = true;

    println!("Type prompts, then an empty line to send. /help for commands.");

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();

        if buffer.is_empty() && trimmed.starts_with('/') {
            let (cmd, arg) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
            match cmd {
                "/quit" | "/exit" => break,
                "/help" => print_commands(),
                "/batch" => match arg.trim() {
                    "on" => batch_mode = true,
                    "off" => batch_mode = false,
                    _ => println!("batch mode is {}", if batch_mode { "on" } else { "off" }),
                },
                "/image" => match Attachment::from_path(Path::new(arg.trim())) {
                    Ok(a) => {
                        println!("staged {} ({}, {} bytes)", a.name, a.mime, a.data.len());
                        staged.push(a);
                    }
                    Err(e) => println!("cannot attach {}: {e}", arg.trim()),
                },
                "/stop" => {
                    if !session.stop() {
                        println!("nothing is running");
                    }
                }
                "/clear" => {
                    session.clear();
                    println!("queue cleared");
                }
                "/status" => print_status(session).await,
                other => println!("unknown command {other}, try /help"),
            }
            continue;
        }

        if !trimmed.is_empty() {
            buffer.push(line);
            continue;
        }
        if buffer.is_empty() && staged.is_empty() {
            continue;
        }

        let text = buffer.join("\n");
        buffer.clear();
        let attachments = std::mem::take(&mut staged);

        match session.submit(&text, attachments, batch_mode).await {
            Ok(Submission::Batch { batch_id, count }) => {
                info!(%batch_id, count, "batch submitted");
                println!("queued {count} prompts");
            }
            // The sink already printed the result.
            Ok(Submission::Single(_)) => {}
            Err(e) => {
                warn!(err = %e, "submission rejected");
                println!("! {}", e.user_message());
            }
        }
    }
    Ok(())
}

async fn print_status(session: &Session) {
    let p = session.progress();
    let status = match p.status {
        QueueStatus::Idle => "idle",
        QueueStatus::Processing => "processing",
        QueueStatus::Stopping => "stopping",
    };
    println!(
        "queue: {status}, item {}/{}{}",
        if p.total_count == 0 { 0 } else { p.current_index + 1 },
        p.total_count,
        if p.stopped { " (stopped)" } else { "" }
    );
    if let Some(batch_id) = session.queue().batch_id() {
        println!("batch: {batch_id}");
    }
    match session.balance().await {
        Ok(balance) => println!("credits for {}: {balance}", session.actor().unwrap_or("?")),
        Err(e) => println!("credits: unavailable ({})", e.user_message()),
    }
}

async fn print_account(ledger: &dyn QuotaLedger, actor: &str, with_entries: bool) -> error::Result<()> {
    println!("{actor}: {} credits", ledger.balance(actor).await?);
    if with_entries {
        for entry in ledger.entries(actor, 20).await? {
            println!(
                "{}  {:+}  -> {}  {}",
                entry.created_at, entry.delta, entry.balance_after, entry.reason
            );
        }
    }
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn print_commands() {
    println!(
        "COMMANDS:
    /batch on|off     Split numbered lists into separate prompts (default on)
    /image <path>     Attach an image to the next submission
    /stop             Finish the current item and skip the rest of the batch
    /clear            Drop the batch now; a late result is discarded
    /status           Show queue progress and credit balance
    /quit             Exit"
    );
}

fn print_usage() {
    println!(
        "genqueue - sequential image-generation queue

USAGE:
    genqueue [OPTIONS]

OPTIONS:
    --config <PATH>     Path to config file (default: ~/.config/genqueue/config.toml)
    --default-config    Print default config to stdout and exit
    --user <ID>         User to act as (or GENQUEUE_USER)
    --balance           Print the user's credit balance and exit
    --ledger            Print the balance and recent ledger entries and exit
    -h, --help          Print this help message

ENVIRONMENT:
    GENQUEUE_BACKEND      \"stream\" (default) or \"chat\"
    GENQUEUE_API_KEY      Bearer token for the generation API
    GENQUEUE_BASE_URL     API base URL (default: https://api.openai.com/v1)
    GENQUEUE_MODEL        Model name
    GENQUEUE_USER         User id when --user is not given
    RUST_LOG              Optional. Tracing filter (default: info).
"
    );
}
