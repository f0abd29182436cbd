use clap::Args;
use serde::Serialize;
use tokio::time::Instant;

use cotimer_core::{interval_from_secs, EventLoop, Timer};

use super::Output;

#[derive(Args)]
pub struct SleepArgs {
    /// Seconds to sleep
    pub secs: f64,
}

#[derive(Serialize)]
pub struct Slept {
    pub requested_secs: f64,
    pub elapsed_secs: f64,
}

pub fn run(args: SleepArgs) -> Result<(), Box<dyn std::error::Error>> {
    let duration = interval_from_secs("secs", args.secs)?;
    let runtime = super::runtime()?;

    let elapsed = runtime.block_on(async {
        let event_loop = EventLoop::new();
        let started = Instant::now();
        let sleep = Timer::sleep(&event_loop, duration)?;
        event_loop.run_until(sleep).await;
        Ok::<_, cotimer_core::CoreError>(started.elapsed())
    })?;

    Output::Slept(Slept {
        requested_secs: args.secs,
        elapsed_secs: elapsed.as_secs_f64(),
    })
    .print()?;
    Ok(())
}
