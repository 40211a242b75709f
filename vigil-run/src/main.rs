use clap::Parser;

use tracing::error;

mod logsetup;
mod notifier;
mod preflight;
mod sidecar;
mod supervisor;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct VigilRunCliArgs {
    /// Runtime configuration file (TOML).
    config_file: std::path::PathBuf,
    /// Additionally write logs to this file.
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,
}

fn main() {
    let args = VigilRunCliArgs::parse();
    if let Err(e) = logsetup::initiate_logging(args.log_file.as_deref(), false) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let launch = match preflight::check(&args.config_file) {
        Ok(launch) => launch,
        Err(e) => {
            error!("pre-flight check failed: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor::run_pipeline(launch) {
        error!("pipeline failed: {e:#}");
        std::process::exit(1);
    }
}
