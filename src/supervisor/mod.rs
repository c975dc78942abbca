//! Component Supervisor (C4) — spec §4.1.
//!
//! Grounded on the `Orchestrator`/`JobTask` pair in
//! `orchestrator/orchestrator.rs`, generalized from "per-package build
//! task" to "per-pipeline-component task": `launch_all` spawns each
//! component as its own tokio task (spec §4.1 relaxes OS-process
//! isolation to task isolation, see SPEC_FULL.md §4.1), `wait_all` joins
//! them on a one-second tick and signals stop to the rest on the first
//! failure. Callback-hook dispatch mirrors
//! `core.utils.invoke_callbacks`/the module-level
//! `before_launch_all_components` hooks in the original sources.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::report::ReportSink;

/// A stop token every component must observe at its suspension points
/// (queue reads, HTTP timeouts) — the tokio-task analogue of sending a
/// signal to an OS process (spec §5 "Cancellation").
#[derive(Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }
}

pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> (Self, StopToken) {
        let (tx, rx) = watch::channel(false);
        (StopSignal { tx }, StopToken { rx })
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

pub type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;
pub type Hook = Box<dyn Fn() -> BoxFuture + Send + Sync>;

/// Named `(event_tag, phase, handler)` registrations (spec §9 "Callback
/// dispatch by name prefix" re-expressed as an explicit event bus).
#[derive(Default)]
pub struct EventBus {
    before: HashMap<String, Vec<Hook>>,
    after: HashMap<String, Vec<Hook>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn register_before(&mut self, event: impl Into<String>, hook: Hook) {
        self.before.entry(event.into()).or_default().push(hook);
    }

    pub fn register_after(&mut self, event: impl Into<String>, hook: Hook) {
        self.after.entry(event.into()).or_default().push(hook);
    }

    /// Runs `before` hooks in registration order, then `body`, then
    /// `after` hooks in reverse registration order (spec §4.1 "Hook
    /// ordering").
    pub async fn dispatch<F, Fut>(&self, event: &str, body: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if let Some(hooks) = self.before.get(event) {
            for hook in hooks {
                hook().await?;
            }
        }

        body().await?;

        if let Some(hooks) = self.after.get(event) {
            for hook in hooks.iter().rev() {
                hook().await?;
            }
        }

        Ok(())
    }
}

pub struct ComponentHandle {
    pub name: String,
    pub handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    bar: ProgressBar,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub struct ComponentSupervisor {
    stop: StopSignal,
    progress: MultiProgress,
}

impl ComponentSupervisor {
    pub fn new() -> Self {
        let (stop, _token) = StopSignal::new();
        ComponentSupervisor {
            stop,
            progress: MultiProgress::new(),
        }
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.token()
    }

    fn track(&self, name: String, handle: tokio::task::JoinHandle<anyhow::Result<()>>) -> ComponentHandle {
        let bar = self.progress.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_message(name.clone());
        bar.enable_steady_tick(Duration::from_millis(200));
        ComponentHandle { name, handle, bar }
    }

    /// Wraps an already-spawned task (the uploader, started before the
    /// rest of the component set so it can begin draining immediately) in
    /// the same per-component progress tracking `launch_all` gives its
    /// own components.
    pub fn track_uploader(
        &self,
        name: impl Into<String>,
        handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    ) -> ComponentHandle {
        self.track(name.into(), handle)
    }

    /// Spawns each component future as its own tokio task. Each future
    /// already closes over its [`StopToken`] and checks it at its own
    /// suspension points.
    pub fn launch_all<I>(&self, components: I) -> Vec<ComponentHandle>
    where
        I: IntoIterator<Item = (String, BoxFuture)>,
    {
        components
            .into_iter()
            .map(|(name, fut)| {
                let handle = tokio::spawn(fut);
                self.track(name, handle)
            })
            .collect()
    }

    /// Polls every non-uploader component on a one-second tick (spec
    /// §4.1 "the loop wakes at least every second to re-check uploader
    /// health"), returning once they have all exited. On the first
    /// non-zero exit, signals stop to the rest and remembers that
    /// failure as the overall result. The uploader is not waited on here
    /// — it keeps draining the report queue after the other components
    /// finish, until the caller closes it and calls
    /// [`ComponentSupervisor::finish_uploader`]. A premature uploader
    /// exit is itself treated as a failure and stops the remaining
    /// components early, matching "the supervisor polls every worker and
    /// the report-uploader" (spec §4.1).
    pub async fn wait_all(&self, mut components: Vec<ComponentHandle>, uploader: &ComponentHandle) -> anyhow::Result<()> {
        let mut first_failure: Option<anyhow::Error> = None;

        loop {
            let mut still_running = Vec::new();
            for component in components {
                if component.handle.is_finished() {
                    let bar = component.bar.clone();
                    match component.handle.await {
                        Ok(Ok(())) => {
                            debug!("component {} exited cleanly", component.name);
                            bar.finish_with_message(format!("{} done", component.name));
                        }
                        Ok(Err(err)) => {
                            warn!("component {} failed: {err}", component.name);
                            bar.abandon_with_message(format!("{} failed", component.name));
                            first_failure.get_or_insert(err);
                            self.stop.stop();
                        }
                        Err(join_err) => {
                            warn!("component {} panicked: {join_err}", component.name);
                            bar.abandon_with_message(format!("{} panicked", component.name));
                            first_failure.get_or_insert(join_err.into());
                            self.stop.stop();
                        }
                    }
                } else {
                    still_running.push(component);
                }
            }
            components = still_running;

            if components.is_empty() {
                break;
            }

            if uploader.handle.is_finished() {
                warn!("report uploader exited before the rest of the pipeline finished");
                first_failure.get_or_insert_with(|| anyhow::anyhow!("report uploader exited prematurely"));
                self.stop.stop();
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Awaits the uploader after the caller has closed the report queue.
    /// Its exit code overrides `main_result` only when `main_result` was
    /// itself `Ok` (spec §5 "Cancellation": "it overrides the main exit
    /// only if main exit is zero").
    pub async fn finish_uploader(
        &self,
        uploader: ComponentHandle,
        main_result: anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let bar = uploader.bar.clone();
        let name = uploader.name.clone();
        let uploader_result = uploader.handle.await;
        match uploader_result {
            Ok(Ok(())) => {
                bar.finish_with_message(format!("{name} done"));
                main_result
            }
            Ok(Err(err)) => {
                warn!("uploader failed: {err}");
                bar.abandon_with_message(format!("{name} failed"));
                main_result.and(Err(err))
            }
            Err(join_err) => {
                bar.abandon_with_message(format!("{name} panicked"));
                main_result.and(Err(join_err.into()))
            }
        }
    }

    /// Polls `reports` for emptiness twice, one second apart, before a
    /// sub-job transitions from `draining` to `finished` (spec §4.1). The
    /// report queue's receiving end is owned by the long-lived uploader
    /// task, so this polls the shared depth counter on the sink rather
    /// than taking items off the queue itself.
    pub async fn await_drain(&self, reports: &ReportSink) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if reports.pending_count() != 0 {
                continue;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            if reports.pending_count() == 0 {
                info!("report queue drained, sub-job transitions to finished");
                return;
            }
        }
    }
}

impl Default for ComponentSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn event_bus_runs_before_after_in_correct_order() {
        let mut bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));

        let o1 = order.clone();
        bus.register_before(
            "launch",
            Box::new(move || {
                let o1 = o1.clone();
                Box::pin(async move {
                    o1.lock().unwrap().push("before1");
                    Ok(())
                })
            }),
        );
        let o2 = order.clone();
        bus.register_after(
            "launch",
            Box::new(move || {
                let o2 = o2.clone();
                Box::pin(async move {
                    o2.lock().unwrap().push("after1");
                    Ok(())
                })
            }),
        );
        let o3 = order.clone();
        bus.register_after(
            "launch",
            Box::new(move || {
                let o3 = o3.clone();
                Box::pin(async move {
                    o3.lock().unwrap().push("after2");
                    Ok(())
                })
            }),
        );

        let o4 = order.clone();
        bus.dispatch("launch", || async move {
            o4.lock().unwrap().push("body");
            Ok(())
        })
        .await
        .unwrap();

        let recorded = order.lock().unwrap().clone();
        assert_eq!(recorded, vec!["before1", "body", "after2", "after1"]);
    }

    #[tokio::test]
    async fn stop_token_observes_signal() {
        let (signal, token) = StopSignal::new();
        assert!(!token.is_stopped());
        signal.stop();
        assert!(token.is_stopped());
    }

    #[tokio::test]
    async fn wait_all_propagates_first_component_failure() {
        let supervisor = ComponentSupervisor::new();
        let failing = supervisor.track("c1".into(), tokio::spawn(async { Err(anyhow::anyhow!("boom")) }));
        let uploader = supervisor.track_uploader("uploader", tokio::spawn(async { Ok(()) }));

        let result = supervisor.wait_all(vec![failing], &uploader).await;
        assert!(result.is_err());
    }
}
