use clap::Parser;
use color_eyre::Result;
use mqttprobe::cli::Cli;
use mqttprobe::harness::{ConsoleReporter, Scenario, ScenarioRunner};
use mqttprobe::settings::ProbeSettings;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup(cli.log_level())?;

    if cli.init_config {
        let path = cli.config.clone().unwrap_or_else(ProbeSettings::default_path);
        if ProbeSettings::ensure_default(&path).await? {
            println!("Default settings written to {}", path.display());
        } else {
            println!("Settings file {} already exists", path.display());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut settings = ProbeSettings::load(cli.config.as_deref()).await?;
    cli.apply_overrides(&mut settings);
    settings.validate()?;

    let config = cli.connection_config(&settings)?;
    info!(
        "Probing {}:{} with prefix {}",
        config.host, config.port, config.topic_prefix
    );

    let scenarios = if cli.quick {
        Scenario::quick_suite()
    } else {
        Scenario::standard_suite(settings.stress_cycles, settings.stress_pause())
    };

    let reporter = ConsoleReporter::new(std::io::stdout());
    let mut runner = ScenarioRunner::new(
        config,
        settings.session_options(),
        settings.probe_request(),
        reporter,
    );
    let results = runner.run(&scenarios).await;
    let summary = runner.reporter().summary(&results);

    if summary.all_ok() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn setup(level: Level) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", level.as_str())
    }
    setup_logging_env(level);
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
