//! `a3s-mirror history` command: Show the archive history ledger.

use std::path::PathBuf;

use a3s_mirror_core::config::HISTORY_DIR;
use a3s_mirror_runtime::HistoryLedger;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct HistoryArgs {
    /// Working directory of earlier mirror-to-disk runs
    #[arg(long)]
    pub working_dir: PathBuf,
    /// Only print digests
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: HistoryArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = HistoryLedger::read(args.working_dir.join(HISTORY_DIR))?;

    if args.quiet {
        for digest in ledger.digests() {
            println!("{digest}");
        }
        return Ok(());
    }

    let latest = ledger
        .latest_file()?
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<none>".to_string());

    let mut table = output::new_table(&["LEDGER", "DIGESTS"]);
    table.add_row(vec![latest, ledger.len().to_string()]);
    println!("{table}");
    Ok(())
}
