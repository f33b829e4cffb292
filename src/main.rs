use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcpswitch::console::{parse_arguments, Console};
use mcpswitch::{Config, LifecycleController, ToolInvoker};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcpswitch")]
#[command(about = "Launch, switch between and call tool-serving worker processes", long_about = None)]
struct Args {
    /// Worker configuration file (TOML, or JSON for *.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level, including worker stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// List configured workers
    List,
    /// Start a worker, call one tool and stop it again
    Call {
        tool: String,
        /// Worker to use instead of the default
        #[arg(short, long)]
        worker: Option<String>,
        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Print a worker's capability descriptor
    Describe {
        #[arg(short, long)]
        worker: Option<String>,
    },
    /// Interactive console on stdin/stdout (the default)
    Console,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "mcpswitch=debug"
    } else {
        "mcpswitch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let (path, config) = Config::discover(args.config.as_deref())?;
    info!(path = %path.display(), workers = config.workers.len(), "Loaded worker configuration");

    let controller = Arc::new(LifecycleController::from_config(config));

    match args.command.unwrap_or(CliCommand::Console) {
        CliCommand::List => {
            let rows = controller.overview();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        CliCommand::Call { tool, worker, args } => {
            let arguments = parse_arguments(&args).map_err(anyhow::Error::msg)?;
            let result = one_shot(&controller, worker, |invoker| async move {
                invoker.invoke(&tool, arguments).await
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        CliCommand::Describe { worker } => {
            let caps = one_shot(&controller, worker, |invoker| async move {
                invoker.initialize().await
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&caps)?);
        }
        CliCommand::Console => {
            let console = Console::new(controller.clone());
            match console.activate_default().await {
                Ok(name) => eprintln!("active worker: {name}"),
                Err(e) => eprintln!("could not start default worker: {e}"),
            }
            console
                .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await?;
        }
    }

    Ok(())
}

/// Activate `worker` (or the default), run `f` against it and stop every
/// worker afterwards, whatever the outcome
async fn one_shot<T, F, Fut>(
    controller: &Arc<LifecycleController>,
    worker: Option<String>,
    f: F,
) -> Result<T>
where
    F: FnOnce(ToolInvoker) -> Fut,
    Fut: std::future::Future<Output = mcpswitch::WorkerResult<T>>,
{
    let name = worker.unwrap_or_else(|| controller.default_worker());
    let invoker = ToolInvoker::new(controller.clone(), controller.settings().invocation_timeout);

    let outcome = match controller.switch_to(&name).await {
        Ok(()) => f(invoker).await,
        Err(e) => Err(e),
    };

    for (worker, e) in controller.shutdown_all().await {
        eprintln!("failed to stop {worker}: {e}");
    }

    outcome.with_context(|| format!("Worker '{name}' failed"))
}
