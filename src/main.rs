use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use volley::cli::config::Config;
use volley::cli::scenario::RequestScenario;
use volley::cli::{overrides, parse_output, Cli, Commands, Output};
use volley::engine::{
    parse_control_command, ControlCommand, Engine, ReqwestTransport, SharedControl, TestPlan,
};
use volley::stats::csv::CsvSink;
use volley::stats::summary::{ConsoleSummary, JsonStdout, JsonSummary};
use volley::stats::{builtin, ExitStatus, ResultsSink, SharedRegistry};

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "volley=info",
        1 => "volley=debug",
        _ => "volley=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Read control commands from stdin on a plain thread; the engine polls the
/// shared state, so commands apply without going through the runtime.
fn spawn_control_input(control: SharedControl, registry: SharedRegistry) {
    println!("Interactive mode enabled. Commands: pause, resume, tag <k>=<v>, status, stop");
    println!("   Type commands and press Enter.\n");

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            match parse_control_command(&line) {
                Some(ControlCommand::Pause) => {
                    control.pause();
                    println!("Paused");
                }
                Some(ControlCommand::Resume) => {
                    control.resume();
                    println!("Resumed");
                }
                Some(ControlCommand::Tag(k, v)) => {
                    println!("Tag {}={} added", k, v);
                    control.add_tag(k, v);
                }
                Some(ControlCommand::Status) => {
                    let vus = registry.latest(builtin::VUS).unwrap_or(0.0);
                    let iters = registry.total(builtin::ITERATIONS).unwrap_or(0.0);
                    println!(
                        "Status: {} VUs, {} iterations{}",
                        vus,
                        iters,
                        if control.is_paused() { " (paused)" } else { "" }
                    );
                }
                Some(ControlCommand::Stop) => {
                    control.abort("stopped from console");
                    break;
                }
                None if !line.trim().is_empty() => println!("Unknown command: {}", line.trim()),
                None => {}
            }
        }
    });
}

struct RunArgs {
    plan: PathBuf,
    overrides: Config,
    json: bool,
    summary_export: Option<PathBuf>,
    out: Vec<String>,
    interactive: bool,
}

fn run(args: RunArgs) -> Result<ExitStatus> {
    let mut config = Config::load(&args.plan)?;
    config.merge(args.overrides);
    let plan = TestPlan::try_from(&config)?;
    let scenario = RequestScenario::from_config(&config)?;

    let mut sinks: Vec<Box<dyn ResultsSink>> = Vec::new();
    if args.json {
        sinks.push(Box::new(JsonStdout));
    } else {
        sinks.push(Box::new(ConsoleSummary));
    }
    if let Some(path) = args.summary_export {
        sinks.push(Box::new(JsonSummary::new(path)));
    }
    for out in &args.out {
        match parse_output(out)? {
            Output::Csv(path) => sinks.push(Box::new(CsvSink::new(path))),
            Output::Json(path) => sinks.push(Box::new(JsonSummary::new(path))),
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let report = runtime.block_on(async {
        let transport = Arc::new(ReqwestTransport::new()?);
        let engine = Engine::new(plan, transport);
        let control = engine.control();
        if args.interactive {
            spawn_control_input(control.clone(), engine.registry());
        }

        let ctrl_c = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping");
                ctrl_c.abort("interrupted by user");
            }
        });

        engine.run(scenario).await.map_err(anyhow::Error::from)
    })?;

    for sink in &sinks {
        if let Err(e) = sink.publish(&report) {
            tracing::error!(error = %e, "failed to publish results");
        }
    }
    Ok(report.exit_status())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            plan,
            vus,
            duration,
            iterations,
            json,
            summary_export,
            out,
            interactive,
        } => run(RunArgs {
            plan,
            overrides: overrides(vus, duration, iterations),
            json,
            summary_export,
            out,
            interactive,
        }),
        Commands::Validate { plan } => {
            volley::cli::validate::run_validate(&plan, None).map(|_| ExitStatus::Passed)
        }
        Commands::Schema { output } => write_schema(output).map(|_| ExitStatus::Passed),
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "volley", &mut std::io::stdout());
            Ok(ExitStatus::Passed)
        }
    };

    match result {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(ExitStatus::Fatal.code())
        }
    }
}

fn write_schema(output: Option<PathBuf>) -> Result<()> {
    let schema = schemars::schema_for!(Config);
    let json = serde_json::to_string_pretty(&schema)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write schema to {}", path.display()))?;
            println!("Schema written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
