use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use voca::config::{Config, PoolPolicy};
use voca::context::default_title_source;
use voca::executor::{ActionExecutor, ExecutorKind, LogExecutor, build_executor};
use voca::grammar::Dispatcher;
use voca::manager::{Manager, ModeState, write_output};
use voca::plugin;
use voca::pool::{Pool, WorkerCommand};
use voca::worker::Worker;

/// How long the runtime waits for blocked stdin reads on exit
const RUNTIME_SHUTDOWN: Duration = Duration::from_millis(200);

/// How long the output writer may take to flush relayed lines on exit
const OUTPUT_FLUSH: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "voca", version, about = "Dispatch spoken commands to desktop actions")]
struct Cli {
    /// Disable logging
    #[arg(long, global = true)]
    no_log: bool,

    /// Config file (default: ./voca.toml)
    #[arg(long, global = true, env = voca::config::CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read recognizer output on stdin and dispatch commands to workers
    Manage(ManageArgs),
    /// Run commands for manager envelopes read on stdin
    Worker(WorkerArgs),
    /// Print the grammar compiled from the selected plugins
    Grammar {
        /// Plugin to load (repeatable; default: the configured set)
        #[arg(short = 'i', long = "import")]
        plugins: Vec<String>,
    },
}

#[derive(Args)]
struct ManageArgs {
    /// Plugin to load in workers (repeatable; default: the configured set)
    #[arg(short = 'i', long = "import")]
    plugins: Vec<String>,

    /// Number of worker processes
    #[arg(long)]
    num_workers: Option<usize>,

    /// What happens to a worker after its job
    #[arg(long, value_enum)]
    policy: Option<PoolPolicy>,

    /// Executor the workers use
    #[arg(long, value_enum)]
    executor: Option<ExecutorKind>,
}

#[derive(Args)]
struct WorkerArgs {
    /// Plugin to load (repeatable; default: the configured set)
    #[arg(short = 'i', long = "import")]
    plugins: Vec<String>,

    /// Exit after the first message
    #[arg(long)]
    once: bool,

    #[arg(long, value_enum)]
    executor: Option<ExecutorKind>,
}

#[hotpath::main]
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    voca::logging::init(!cli.no_log);
    let config = Config::load(cli.config.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async_main(cli, config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);

    match result? {
        0 => Ok(()),
        code => std::process::exit(code),
    }
}

async fn async_main(cli: Cli, config: Config) -> anyhow::Result<i32> {
    match cli.command {
        Command::Manage(args) => {
            manage(cli.config, cli.no_log, config, args).await?;
            Ok(0)
        }
        Command::Worker(args) => work(config, args).await,
        Command::Grammar { plugins } => {
            print_grammar(&config, &plugins)?;
            Ok(0)
        }
    }
}

fn executor_name(kind: ExecutorKind) -> &'static str {
    match kind {
        ExecutorKind::Log => "log",
        ExecutorKind::Keyboard => "keyboard",
    }
}

async fn manage(
    config_path: Option<PathBuf>,
    no_log: bool,
    config: Config,
    args: ManageArgs,
) -> anyhow::Result<()> {
    let program = std::env::current_exe().context("cannot locate the voca executable")?;

    let mut global_args = Vec::new();
    if let Some(path) = &config_path {
        global_args.push("--config".to_string());
        global_args.push(path.display().to_string());
    }
    if no_log {
        global_args.push("--no-log".to_string());
    }
    let mut worker_args = Vec::new();
    if let Some(kind) = args.executor {
        worker_args.push("--executor".to_string());
        worker_args.push(executor_name(kind).to_string());
    }

    let plugins = if args.plugins.is_empty() {
        config.manager.plugins.clone()
    } else {
        args.plugins
    };
    let num_workers = args.num_workers.unwrap_or(config.manager.num_workers).max(1);
    let command = WorkerCommand {
        program,
        global_args,
        worker_args,
        plugins,
        safe_plugins: config.manager.safe_plugins.clone(),
        policy: args.policy.unwrap_or(config.manager.policy),
    };

    let (output, lines) = flume::unbounded();
    let writer = tokio::spawn(write_output(lines, tokio::io::stdout()));

    let pool = Pool::start(command, num_workers, output.clone())?;

    let (interrupt_tx, interrupt) = flume::bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("cannot install the Ctrl-C handler")?;

    let mut manager = Manager::new(
        pool,
        num_workers,
        ModeState::new(config.manager.start_strict),
        Duration::from_millis(config.manager.shutdown_grace_ms),
    );
    let result = manager.run(tokio::io::stdin(), output, interrupt).await;
    info!(strict = manager.mode().strict, "manager stopped");
    drop(manager);

    if tokio::time::timeout(OUTPUT_FLUSH, writer).await.is_err() {
        warn!("output writer did not finish");
    }
    result?;
    Ok(())
}

async fn work(config: Config, args: WorkerArgs) -> anyhow::Result<i32> {
    let executor = build_executor(
        args.executor.unwrap_or(config.worker.executor),
        config.worker.input_method,
    )
    .await?;
    let group = plugin::load(&args.plugins, &config, &executor);
    info!(plugins = ?group.names(), "worker ready");

    let mut worker = Worker::new(
        group,
        default_title_source(),
        Duration::from_millis(config.worker.context_timeout_ms),
    );
    let code = worker
        .run(tokio::io::stdin(), tokio::io::stdout(), args.once)
        .await?;
    Ok(code)
}

fn print_grammar(config: &Config, plugins: &[String]) -> anyhow::Result<()> {
    let executor: Arc<dyn ActionExecutor> = Arc::new(LogExecutor);
    let group = plugin::load(plugins, config, &executor);
    let dispatcher = Dispatcher::from_registry(&group.registry())?;

    print!("{}", dispatcher.grammar_text());
    for diagnostic in dispatcher.diagnostics() {
        eprintln!("warning: {diagnostic}");
    }
    Ok(())
}
