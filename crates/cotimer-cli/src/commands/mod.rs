pub mod check;
pub mod run;
pub mod sleep;

use serde::Serialize;

use cotimer_core::TimerEvent;

/// One line of JSON output.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output<'a> {
    Event(&'a TimerEvent),
    Summary(run::RunSummary),
    Slept(sleep::Slept),
    Checked(check::Checked),
}

impl Output<'_> {
    pub fn print(&self) -> Result<(), serde_json::Error> {
        println!("{}", serde_json::to_string(self)?);
        Ok(())
    }
}

/// Current-thread runtime: the event loop's handles are not `Send`.
pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
}
