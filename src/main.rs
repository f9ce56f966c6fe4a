//! Strata CLI: layered remote provisioning.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Layered remote provisioning: compiled shell tasks, cached per command, resumed from the first change"
)]
struct Cli {
    #[command(subcommand)]
    command: strata::cli::Commands,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("STRATA_LOG", "info")).init();
    let cli = Cli::parse();
    if let Err(e) = strata::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
