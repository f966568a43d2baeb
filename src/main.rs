use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use testpilot_core::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;
mod handler;
mod supervisor;
mod tui;
mod ui;

use app::App;
use supervisor::WorkerCommand;
use tui::{EventHandler, Tui, TICK_RATE};

#[derive(Parser)]
#[command(name = "testpilot")]
#[command(about = "Terminal assistant that edits code and generates verified Go unit tests", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the worker executable (defaults to testpilot-worker beside this binary)
    #[arg(long, value_name = "PATH")]
    worker: Option<PathBuf>,

    /// Directory the agent works in (defaults to TESTPILOT_WORK_DIR, then the current directory)
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,
}

/// Log to a file so the terminal UI stays intact.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_dir = Config::log_dir();
    let file = std::fs::create_dir_all(&log_dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("testpilot.log"))
    });

    match file {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init(),
        Err(_) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let work_dir = cli.work_dir.unwrap_or_else(|| config.resolve_work_dir());
    let command = WorkerCommand::resolve(
        cli.worker,
        work_dir,
        Some(Config::log_dir().join("worker.log")),
    );
    // Fail before touching the terminal.
    command.check()?;
    info!(
        worker = %command.program.display(),
        work_dir = %command.work_dir.display(),
        "Starting testpilot"
    );

    let mut app = App::new(command, &config);

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let result = run_loop(&mut terminal, &mut app).await;

    app.shutdown().await;
    tui::restore()?;
    result?;

    match app.startup_error.take() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn run_loop(terminal: &mut Tui, app: &mut App) -> Result<()> {
    let mut events = EventHandler::new(TICK_RATE);

    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        // One event at a time, from the terminal or the worker.
        tokio::select! {
            Some(event) = events.next() => handler::handle_event(app, event).await?,
            event = app.next_worker_event() => app.handle_worker_event(event),
        }
    }

    Ok(())
}
