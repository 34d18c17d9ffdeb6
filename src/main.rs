use clap::Parser;
use emt_bench::collectors::ProbeKind;
use emt_bench::config::{Mode, RunConfig, parse_output_action};
use emt_bench::utils::errors::{ProcError, ProcResult};
use emt_bench::utils::logger::setup_logger;
use emt_bench::{Benchmark, EnergyProfiler, OutputAction, Task, TaskRegistry};
use log::{error, info, warn};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Benchmark a command and profile its energy use
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// What to measure
    #[arg(short, long, value_enum, default_value_t = Mode::Bench)]
    mode: Mode,

    /// Energy probe to sample with (repeatable; defaults to the platform probe)
    #[arg(short, long = "probe", value_name = "NAME", value_parser = parse_probe)]
    probes: Vec<ProbeKind>,

    /// Sampling interval in milliseconds
    #[arg(short, long, value_name = "MS", default_value_t = 1000)]
    interval: u64,

    /// Kill the command after this many seconds
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<f64>,

    /// What to do with the command's output: print, discard or store
    #[arg(short, long, default_value = "print", value_parser = parse_output)]
    output: OutputAction,

    /// File fed to the command's stdin
    #[arg(long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Command to run, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn parse_probe(s: &str) -> Result<ProbeKind, String> {
    ProbeKind::from_name(s).map_err(|e| e.to_string())
}

fn parse_output(s: &str) -> Result<OutputAction, String> {
    parse_output_action(s).map_err(|e| e.to_string())
}

impl Args {
    fn into_config(self) -> RunConfig {
        let timeout = self
            .timeout
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);

        RunConfig::new(self.command)
            .with_mode(self.mode)
            .with_interval(Duration::from_millis(self.interval))
            .with_timeout(timeout)
            .with_output(self.output)
            .with_input(self.input)
            .with_probes(self.probes)
    }
}

fn print_output(task: &Task) {
    if let Some(stdout) = task.stdout().filter(|s| !s.is_empty()) {
        println!("{}", stdout);
    }
    if let Some(stderr) = task.stderr().filter(|s| !s.is_empty()) {
        eprintln!("{}", stderr);
    }
}

fn print_benchmark(bench: &Benchmark) {
    println!("time:   {:.3} s", bench.seconds());
    println!("memory: {}", bench.max_memory_string());
}

/// Runs the configured measurement and returns the command's exit code.
fn execute(config: &RunConfig, registry: &TaskRegistry) -> ProcResult<i32> {
    let mut task = config.task(registry)?;

    let task = match config.mode {
        Mode::Run => {
            task.run(true, config.timeout)?;
            task
        }
        Mode::Bench => {
            let mut bench = Benchmark::new(task);
            bench.run(config.timeout)?;
            print_benchmark(&bench);
            bench.into_task()
        }
        Mode::Energy => {
            let probes = config.build_probes()?;
            let mut profiler = EnergyProfiler::new(Benchmark::new(task), probes)?;
            profiler.run(config.timeout)?;

            print_benchmark(profiler.workload());
            for (probe, score) in profiler.scores() {
                println!("energy: {:.3} ({})", score, probe);
            }
            println!("{}", profiler.trace()?);
            profiler.into_workload().into_task()
        }
    };

    print_output(&task);
    task.exit_code()
        .ok_or_else(|| ProcError::Other(format!("\"{}\" has no exit code", task.name())))
}

fn report(error: &ProcError) {
    error!("{}", error);
    if let Some(output) = error.partial_output() {
        eprintln!("{}", output);
    }
}

/// Exit codes above 255 or negated signal numbers map to the shell convention.
fn exit_code(code: i32) -> ExitCode {
    let code = if code < 0 { 128 - code } else { code };
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    setup_logger(args.debug);

    let config = args.into_config();
    info!("Running {:?} in {:?} mode", config.command, config.mode);

    let registry = TaskRegistry::new();
    let worker_registry = registry.clone();
    let mut run = tokio::task::spawn_blocking(move || execute(&config, &worker_registry));

    let joined = tokio::select! {
        joined = &mut run => joined,
        _ = tokio::signal::ctrl_c() => {
            let killed = registry.kill_all(Signal::SIGKILL);
            warn!("Interrupted, killed {} running task(s)", killed);
            run.await
        }
    };

    match joined {
        Ok(Ok(code)) => exit_code(code),
        Ok(Err(e)) => {
            report(&e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Measurement thread failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
