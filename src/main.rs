use anyhow::Context;
use clap::Parser;
use log::info;

use scsims::ablation::{self, AblationArgs};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = AblationArgs::parse();
    let outcome = ablation::run(&args)
        .with_context(|| format!("ablation run '{}' failed", args.run_name()))?;

    info!(
        "{}: {} epochs on {} training cells, test accuracy {:.3}, macro-F1 {:.3} (logs in {})",
        outcome.run_name,
        outcome.epochs_run,
        outcome.train_cells,
        outcome.test.accuracy,
        outcome.test.macro_f1,
        outcome.log_dir.display()
    );
    Ok(())
}
