use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = subscriber_journal_cli::Cli::parse();
    subscriber_journal_cli::init_logging(cli.log_level());
    subscriber_journal_cli::run_cli(cli)
}
