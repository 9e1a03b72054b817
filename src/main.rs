mod mcp;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use eoka_pilot_core::{
    AgentEvent, FileKv, KvStore, MemoryExport, MemoryStore, OpenAiCompatClient, Params, Pilot,
    PilotConfig, RunMode, RunPhase, RunState, SystemClock, RUN_STATE_KEY,
};
use eoka_pilot_host::EokaHost;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "eoka-pilot")]
#[command(about = "Goal-driven browser automation")]
#[command(version)]
struct Cli {
    /// Config file (YAML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Set a parameter (can be used multiple times)
    #[arg(short = 'P', long = "param", value_name = "KEY=VALUE", global = true)]
    params: Vec<String>,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a URL and work towards a goal
    Run {
        url: String,
        goal: String,

        /// auto, agent or script
        #[arg(long, default_value = "auto")]
        mode: RunMode,

        /// Run in headless mode (overrides config)
        #[arg(long)]
        headless: bool,

        /// Ask before steps the model marks as sensitive
        #[arg(long)]
        confirm: bool,
    },
    /// Continue an interrupted run in a fresh tab
    Resume {
        #[arg(long)]
        headless: bool,
    },
    /// Show the last run
    Status,
    /// Mark the active run as stopped
    Stop,
    /// Inspect or edit the selector and template memory
    Memory {
        #[command(subcommand)]
        action: MemoryCommand,
    },
    /// Serve the control surface over MCP on stdio
    Mcp,
}

#[derive(Subcommand)]
enum MemoryCommand {
    Stats,
    /// Write all memory as JSON (stdout by default)
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    Import {
        file: PathBuf,

        /// Replace existing memory instead of merging
        #[arg(long)]
        replace: bool,
    },
    /// Clear one domain, or everything
    Clear {
        #[arg(long)]
        domain: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    // stdout carries the MCP transport, so logs go to stderr.
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let params = Params::from_args(&cli.params)?;
    let mut config = match &cli.config {
        Some(path) => PilotConfig::load_with_params(path, &params)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PilotConfig::default(),
    };

    match cli.command {
        Command::Run {
            url,
            goal,
            mode,
            headless,
            confirm,
        } => {
            config.browser.headless |= headless;
            config.confirm_sensitive |= confirm;
            run(config, &url, &goal, mode).await
        }
        Command::Resume { headless } => {
            config.browser.headless |= headless;
            resume(config).await
        }
        Command::Status => {
            let store = FileKv::open(&config.store.dir)?;
            match load_state(&store).await? {
                Some(state) => print_state(&state),
                None => println!("No run recorded in {}", config.store.dir.display()),
            }
            Ok(())
        }
        Command::Stop => stop(&config).await,
        Command::Memory { action } => memory(&config, action).await,
        Command::Mcp => mcp::run_server(config).await,
    }
}

async fn load_state(store: &FileKv) -> anyhow::Result<Option<RunState>> {
    match store.get(RUN_STATE_KEY).await? {
        Some(value) => Ok(Some(
            serde_json::from_value(value).context("stored run state is unreadable")?,
        )),
        None => Ok(None),
    }
}

async fn run(config: PilotConfig, url: &str, goal: &str, mode: RunMode) -> anyhow::Result<()> {
    let model = Arc::new(OpenAiCompatClient::from_config(&config.model)?);
    let store = Arc::new(FileKv::open(&config.store.dir)?);
    let host = Arc::new(EokaHost::launch(&config.browser).await?);
    let tab = host.open(url).await?;

    let pilot = Arc::new(Pilot::builder(config, host.clone(), model, store).build());
    let printer = tokio::spawn(print_progress(pilot.clone(), pilot.subscribe()));
    println!("Running: {}", goal);
    pilot.start(tab, goal, mode).await?;
    finish(pilot, printer, host).await
}

async fn resume(config: PilotConfig) -> anyhow::Result<()> {
    let store = Arc::new(FileKv::open(&config.store.dir)?);
    let Some(mut state) = load_state(&store).await?.filter(|s| s.active) else {
        bail!("no active run to resume");
    };
    if state.start_url.is_empty() {
        bail!("run {} never reached a page; start it again", state.run_id);
    }

    // The previous browser is gone with its tabs; continue in a new one.
    let host = Arc::new(EokaHost::launch(&config.browser).await?);
    state.target_id = host.open(&state.start_url).await?;
    state.waiting_for_load = false;
    if matches!(
        state.phase,
        RunPhase::WaitingForLoad | RunPhase::Executing | RunPhase::Idle
    ) {
        state.phase = RunPhase::Planning;
    }
    store
        .set(RUN_STATE_KEY, serde_json::to_value(&state)?)
        .await?;

    let model = Arc::new(OpenAiCompatClient::from_config(&config.model)?);
    let pilot = Arc::new(Pilot::builder(config, host.clone(), model, store).build());
    let printer = tokio::spawn(print_progress(pilot.clone(), pilot.subscribe()));
    println!("Resuming: {}", state.goal);
    pilot.resume().await?;
    finish(pilot, printer, host).await
}

async fn finish(
    pilot: Arc<Pilot>,
    printer: tokio::task::JoinHandle<()>,
    host: Arc<EokaHost>,
) -> anyhow::Result<()> {
    let state = tokio::select! {
        state = pilot.wait() => state?,
        _ = tokio::signal::ctrl_c() => {
            pilot.stop().await?;
            pilot.get_status().await?.context("run state vanished")?
        }
    };
    printer.abort();
    let _ = printer.await;

    println!();
    print_state(&state);
    drop(pilot);
    if let Ok(host) = Arc::try_unwrap(host) {
        host.close().await?;
    }
    if state.phase != RunPhase::Finished {
        std::process::exit(1);
    }
    Ok(())
}

/// Print steps as they run and answer confirmation requests from stdin.
async fn print_progress(pilot: Arc<Pilot>, mut events: broadcast::Receiver<AgentEvent>) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            AgentEvent::StepStarted { step, .. } => {
                let what = if step.description.is_empty() {
                    format!("{} {}", step.action, step.target)
                } else {
                    step.description.clone()
                };
                println!("→ {}", what);
            }
            AgentEvent::StepFinished { result, .. } => {
                if result.success {
                    let via = match (&result.used_selector, result.used_fallback) {
                        (Some(sel), true) => format!(" (via {})", sel),
                        _ => String::new(),
                    };
                    println!("  ✓ done{}", via);
                } else {
                    println!("  ✗ {}", result.error.unwrap_or_default());
                }
            }
            AgentEvent::Status {
                phase: RunPhase::WaitingForConfirm,
                message,
                ..
            } => {
                println!("? {} [y/N]", message);
                let answer = stdin.next_line().await.ok().flatten().unwrap_or_default();
                let approved = matches!(answer.trim(), "y" | "Y" | "yes");
                if let Err(e) = pilot.confirm(approved).await {
                    eprintln!("confirmation not delivered: {}", e);
                }
            }
            _ => {}
        }
    }
}

fn print_state(state: &RunState) {
    match state.phase {
        RunPhase::Finished => println!("✓ Success"),
        phase if phase.is_terminal() => println!("✗ {:?}", phase),
        phase => println!("… {:?}", phase),
    }
    println!("  Run: {}", state.run_id);
    println!("  Goal: {}", state.goal);
    println!("  Status: {}", state.status_message);
    println!("  Iterations: {}", state.iteration_count);
    let failed = state.action_history.iter().filter(|r| !r.success).count();
    println!(
        "  Steps: {} ({} failed)",
        state.action_history.len(),
        failed
    );
}

async fn stop(config: &PilotConfig) -> anyhow::Result<()> {
    let store = FileKv::open(&config.store.dir)?;
    match load_state(&store).await? {
        Some(mut state) if state.active => {
            state.finish(RunPhase::Stopped, "stopped by user");
            store
                .set(RUN_STATE_KEY, serde_json::to_value(&state)?)
                .await?;
            println!("Stopped run {}", state.run_id);
        }
        _ => println!("No active run"),
    }
    Ok(())
}

fn memory_store(config: &PilotConfig) -> anyhow::Result<MemoryStore> {
    let kv = Arc::new(FileKv::open(&config.store.dir)?);
    Ok(MemoryStore::new(
        kv,
        Arc::new(SystemClock),
        config.memory.clone(),
    ))
}

async fn memory(config: &PilotConfig, action: MemoryCommand) -> anyhow::Result<()> {
    let memory = memory_store(config)?;
    match action {
        MemoryCommand::Stats => {
            let stats = memory.stats().await?;
            println!("Domains: {}", stats.total_domains);
            println!("Selectors: {}", stats.total_selectors);
            println!("Templates: {}", stats.total_templates);
            for d in &stats.domains {
                println!(
                    "  {}: {} selectors, {} templates",
                    d.domain, d.selectors, d.templates
                );
            }
        }
        MemoryCommand::Export { output } => {
            let json = serde_json::to_string_pretty(&memory.export().await?)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        MemoryCommand::Import { file, replace } => {
            let data = read_export(&file)?;
            let domains = data.domains.len();
            memory.import(data, !replace).await?;
            println!("Imported {} domain(s)", domains);
        }
        MemoryCommand::Clear { domain } => match domain {
            Some(domain) => {
                memory.clear_domain(&domain).await?;
                println!("Cleared {}", domain);
            }
            None => {
                memory.clear_all().await?;
                println!("Cleared all memory");
            }
        },
    }
    Ok(())
}

fn read_export(path: &Path) -> anyhow::Result<MemoryExport> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a memory export", path.display()))
}
