//! Script Host - run one job under memory and instruction quotas
//!
//! Reads a job envelope from stdin, runs it inside the sandbox, streams
//! records to stdout and exits with the status of the run.

use std::mem::ManuallyDrop;

use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use script_host::{
    config::USAGE, leave, read_job, sandbox, Arena, Command, FdStream, Fatal, InterpreterHost,
    Options, Orchestrator, OutputWriter, StageTimer, StatusCode,
};

/// Install the stderr logger. Level comes from `RUST_LOG`, default `warn`.
fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Run one job. The host is never dropped: once the sandbox is active,
/// unmapping the arena is no longer permitted.
fn run(options: Options) -> Result<(), Fatal> {
    let writer = OutputWriter::new(FdStream::stdout());
    let timer = StageTimer::new(&writer);

    let job = timer.time("in", || read_job(&mut FdStream::stdin()))?;
    debug!(
        sources = job.sources().len(),
        library = job.library().is_some(),
        bytes = job.bytes_read(),
        "job read"
    );

    let arena = timer.time("mem", || Arena::new(options.memory_quota()))?;
    let host = ManuallyDrop::new(timer.time("init", || {
        InterpreterHost::new(arena, options.instruction_quota())
    })?);
    timer.time("sandbox", sandbox::install)?;

    let stats =
        Orchestrator::new(&host, &writer, &timer).run(&job, options.instruction_quota_start())?;
    info!(
        instructions = stats.instructions,
        total = stats.total_instructions,
        memory = stats.memory,
        "job complete"
    );
    Ok(())
}

fn main() {
    sandbox::reserve_heap();
    if let Err(e) = init_logging() {
        eprintln!("logging unavailable: {e}");
    }

    let options = match Options::parse(std::env::args().skip(1), |e| warn!("{e}")) {
        Command::Run(options) => options,
        Command::Help => {
            eprintln!("{USAGE}");
            leave(StatusCode::Ok);
        }
    };

    match run(options) {
        Ok(()) => leave(StatusCode::Ok),
        Err(fatal) => {
            debug!("{fatal}");
            leave(fatal.status())
        }
    }
}
