use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use dapp_agent_runner::classifier::execution_mode;
use dapp_agent_runner::config::{default_artifacts_dir, default_profile_dir};
use dapp_agent_runner::hands::{ChromePage, LaunchConfig};
use dapp_agent_runner::wallet::{ExtensionWallet, UnconfiguredWallet};
use dapp_agent_runner::{
    AgentConfig, AgentContext, Brain, BrowserWalletToolkit, RunEvent, RunOrchestrator,
    StepStatus, WalletSurface, load_steps, save_run_result,
};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dapp-agent", version, about = "Run recorded dApp tests against a real browser and wallet")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a list of intent steps.
    Run(RunArgs),
    /// Print how each step would be executed, without a browser.
    Classify {
        #[arg(long)]
        steps: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// JSON array of intent steps.
    #[arg(long)]
    steps: PathBuf,

    /// Where to write the run result JSON.
    #[arg(long, default_value = "run-result.json")]
    output: PathBuf,

    #[arg(long, env = "DAPP_AGENT_ARTIFACTS_DIR")]
    artifacts_dir: Option<PathBuf>,

    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Unpacked wallet extension to load into Chrome.
    #[arg(long, env = "DAPP_AGENT_EXTENSION_PATH")]
    extension_path: Option<PathBuf>,

    /// Extension id, used to find the wallet's popup windows.
    #[arg(long, env = "DAPP_AGENT_EXTENSION_ID")]
    extension_id: Option<String>,

    /// Attach to a running Chrome via its DevTools websocket URL instead of launching one.
    #[arg(long)]
    connect: Option<String>,

    #[arg(long)]
    headless: bool,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    max_api_calls: Option<u32>,

    #[arg(long)]
    max_calls_per_step: Option<u32>,

    #[arg(long)]
    step_timeout_ms: Option<u64>,

    /// Skip per-action screenshots in agent steps.
    #[arg(long)]
    no_screenshots: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(max) = self.max_api_calls {
            config.max_api_calls = max;
        }
        if let Some(max) = self.max_calls_per_step {
            config.max_calls_per_step = max;
        }
        if let Some(ms) = self.step_timeout_ms {
            config.step_timeout_ms = ms;
        }
        if self.no_screenshots {
            config.capture_step_screenshots = false;
        }
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Command::Classify { steps } => classify(steps),
        Command::Run(args) => run(args).await,
    }
}

fn classify(path: PathBuf) -> Result<ExitCode> {
    let steps = load_steps(&path)?;
    for (index, step) in steps.iter().enumerate() {
        let mode = serde_json::to_value(execution_mode(step))?;
        println!(
            "{index:>3}  {:<13} {:<20} {}",
            mode.as_str().unwrap_or_default(),
            step.step_type,
            step.description
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = AgentConfig::from_env()?;
    args.apply(&mut config);
    config.validate()?;

    let steps = load_steps(&args.steps)?;
    let brain = Brain::new(&config)?;
    let toolkit = BrowserWalletToolkit::default();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let page = match args.connect.clone() {
        Some(ws_url) => tokio::task::spawn_blocking(move || ChromePage::connect(&ws_url)).await,
        None => {
            let launch = LaunchConfig {
                chrome_path: args.chrome_path.clone(),
                headless: args.headless,
                profile_dir: Some(default_profile_dir()),
                extension_path: args.extension_path.clone(),
            };
            tokio::task::spawn_blocking(move || ChromePage::launch(&launch)).await
        }
    }
    .map_err(|e| anyhow!("Browser launch panicked: {e}"))??;

    let wallet: Arc<dyn WalletSurface> = match &args.extension_id {
        Some(id) => Arc::new(ExtensionWallet::new(page.browser(), id.clone(), cancel.clone())),
        None => {
            warn!("No --extension-id given; wallet actions will fail");
            Arc::new(UnconfiguredWallet)
        }
    };

    let artifacts_dir = args.artifacts_dir.clone().unwrap_or_else(default_artifacts_dir);
    let mut ctx = AgentContext::new(Arc::new(page), wallet, artifacts_dir, cancel);

    let (events, mut rx) = broadcast::channel(64);
    let progress = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                RunEvent::StepStarted { index, total, step_id, mode } => {
                    info!(step = %step_id, ?mode, "Step {}/{}", index + 1, total);
                }
                RunEvent::StepFinished { step_id, status: StepStatus::Failed, .. } => {
                    warn!(step = %step_id, "Step failed");
                }
                RunEvent::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    let orchestrator = RunOrchestrator::new(&config, &brain, &toolkit).with_events(events);
    let result = orchestrator.run(&steps, &mut ctx).await;
    drop(orchestrator);
    let _ = progress.await;

    save_run_result(&args.output, &result)?;
    info!(output = %args.output.display(), passed = result.passed, "{}", result.summary);

    Ok(if result.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
