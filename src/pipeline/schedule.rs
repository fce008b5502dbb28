//! Fixed-interval repetition of the run.

use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::runner::{PipelineRunner, RunFailure, RunReport};
use crate::storage::NewsStore;

/// Runs immediately, then once per `period`, until `shutdown` resolves.
///
/// `open` builds the runner. It is called on the first tick and again on
/// every later tick until it succeeds, so a store that is down at startup
/// only costs the ticks it stays down. Its failures are passed to `on_run`
/// like any failed run.
///
/// `shutdown` is polled for the whole loop. If it resolves while a run is in
/// progress, that run completes and no further run starts.
///
/// Returns the runner, if one was opened, so the caller can close its store.
pub async fn run_on_interval<S, O, Fut, Sh, R>(
    period: Duration,
    mut open: O,
    shutdown: Sh,
    mut on_run: R,
) -> Option<PipelineRunner<S>>
where
    S: NewsStore,
    O: FnMut() -> Fut,
    Fut: Future<Output = Result<PipelineRunner<S>, RunFailure>>,
    Sh: Future<Output = ()>,
    R: FnMut(Result<RunReport, RunFailure>),
{
    // tokio's interval panics on a zero period.
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(shutdown);
    let mut runner: Option<PipelineRunner<S>> = None;

    loop {
        tokio::select! {
            biased;
            () = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping");
                break;
            }
            _ = ticker.tick() => {}
        }

        if runner.is_none() {
            match open().await {
                Ok(opened) => runner = Some(opened),
                Err(failure) => {
                    tracing::warn!(kind = %failure.kind, "Store not ready, retrying next tick");
                    on_run(Err(failure));
                    continue;
                }
            }
        }

        if let Some(active) = runner.as_mut() {
            on_run(active.run().await);
        }
    }

    runner
}
