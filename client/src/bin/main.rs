use anyhow::Result;
use instrument_client::runner;

fn main() -> Result<()> {
    runner::run_cli()
}
