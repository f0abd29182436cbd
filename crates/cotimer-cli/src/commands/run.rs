use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use clap::Args;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use cotimer_core::{interval_from_secs, EventLoop, Scenario, Scheduler, TimerEvent, TimerSlice};

use super::Output;

#[derive(Args)]
pub struct RunArgs {
    /// Scenario file (TOML)
    #[arg(long)]
    pub config: PathBuf,
    /// Seconds to run for, overriding the scenario's run_for_secs
    #[arg(long = "for", value_name = "SECS")]
    pub for_secs: Option<f64>,
}

#[derive(Serialize)]
pub struct RunSummary {
    pub elapsed_secs: f64,
    pub events: u64,
    /// Bounded slices that emitted Done.
    pub done: usize,
    pub slices: usize,
}

/// Shared between the slice observers and the runner.
struct Progress {
    events: Cell<u64>,
    done: Cell<usize>,
    bounded: usize,
    finished: RefCell<Option<oneshot::Sender<()>>>,
}

impl Progress {
    fn record(&self, event: &TimerEvent) {
        self.events.set(self.events.get() + 1);
        if let Err(e) = Output::Event(event).print() {
            tracing::error!(error = %e, "failed to write event");
        }
    }

    fn slice_done(&self) {
        self.done.set(self.done.get() + 1);
        if self.done.get() >= self.bounded {
            if let Some(tx) = self.finished.borrow_mut().take() {
                let _ = tx.send(());
            }
        }
    }
}

pub fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = Scenario::load(&args.config)?;
    let run_for = match args.for_secs {
        Some(secs) => Some(interval_from_secs("for", secs)?),
        None => scenario.run_for(),
    };
    if run_for.is_none() && !scenario.is_bounded() {
        return Err("scenario never finishes on its own, pass --for or set run_for_secs".into());
    }

    let runtime = super::runtime()?;
    let summary = runtime.block_on(drive(&scenario, run_for))?;
    Output::Summary(summary).print()?;
    Ok(())
}

async fn drive(scenario: &Scenario, run_for: Option<Duration>) -> cotimer_core::error::Result<RunSummary> {
    let event_loop = EventLoop::new();
    let scheduler = Scheduler::new(&event_loop, &scenario.scheduler)?;

    let (tx, rx) = oneshot::channel();
    let progress = Rc::new(Progress {
        events: Cell::new(0),
        done: Cell::new(0),
        bounded: scenario.slices.iter().filter(|s| s.count.is_bounded()).count(),
        finished: RefCell::new(Some(tx)),
    });

    let mut slices: Vec<TimerSlice> = Vec::with_capacity(scenario.slices.len());
    for config in &scenario.slices {
        let slice = scheduler.add(config.interval()?, config.count, config.tag.as_deref())?;
        if let Some(radical) = config.radical {
            slice.set_radical_mode(radical);
        }
        let p = progress.clone();
        slice.on_action(move |event| p.record(event));
        let p = progress.clone();
        slice.on_done(move |event| {
            p.record(event);
            p.slice_done();
        });
        slices.push(slice);
    }

    tracing::info!(
        slices = slices.len(),
        base = ?scheduler.interval(),
        background = scheduler.background_mode(),
        "running scenario"
    );
    let started = Instant::now();
    scheduler.start()?;

    let finished = async move {
        let _ = rx.await;
    };
    match run_for {
        Some(duration) => {
            event_loop
                .run_until(async {
                    tokio::select! {
                        _ = finished => {}
                        _ = tokio::time::sleep(duration) => {}
                    }
                })
                .await
        }
        None => event_loop.run_until(finished).await,
    }

    scheduler.stop();
    scheduler.clear();
    Ok(RunSummary {
        elapsed_secs: started.elapsed().as_secs_f64(),
        events: progress.events.get(),
        done: progress.done.get(),
        slices: slices.len(),
    })
}
