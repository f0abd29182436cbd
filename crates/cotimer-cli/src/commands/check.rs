use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use cotimer_core::{slice_times, Count, Scenario};

use super::Output;

#[derive(Args)]
pub struct CheckArgs {
    /// Scenario file (TOML)
    #[arg(long)]
    pub config: PathBuf,
}

#[derive(Serialize)]
pub struct Checked {
    pub base_interval_secs: f64,
    pub background_mode: bool,
    pub bounded: bool,
    pub slices: Vec<CheckedSlice>,
}

#[derive(Serialize)]
pub struct CheckedSlice {
    pub tag: Option<String>,
    pub interval_secs: f64,
    pub count: Count,
    /// Base periods per slice period.
    pub times: f64,
}

pub fn run(args: CheckArgs) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = Scenario::load(&args.config)?;
    let base = scenario.scheduler.base_interval()?;

    let mut slices = Vec::with_capacity(scenario.slices.len());
    for slice in &scenario.slices {
        let times = slice_times(slice.interval()?, base)?;
        if times.fract() != 0.0 {
            tracing::info!(tag = ?slice.tag, times, "slice period is not a whole number of base periods");
        }
        slices.push(CheckedSlice {
            tag: slice.tag.clone(),
            interval_secs: slice.interval_secs,
            count: slice.count,
            times,
        });
    }

    Output::Checked(Checked {
        base_interval_secs: scenario.scheduler.base_interval_secs,
        background_mode: scenario.scheduler.background_mode,
        bounded: scenario.is_bounded(),
        slices,
    })
    .print()?;
    Ok(())
}
