use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context;
use lotto_download::{JobRecord, JobStatus, PersistedJob, StatusPayload};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backend::DownloadBackend;
use crate::config::TrackerConfig;
use crate::error::{TrackerError, format_error_chain};
use crate::identity;
use crate::persistence::Persistence;
use crate::registry::Registry;
use crate::scheduler::{self, PollPhase, PollSeed, PollSlots, Verdict};
use crate::sink::{Notice, Sink};

const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct State {
    registry: Registry,
    slots: PollSlots,
    /// Movies shown on screen: movie id -> title.
    known_items: HashMap<String, String>,
    revision: u64,
}

/// Sink updates collected under the state lock and delivered after it is
/// released.
#[derive(Default)]
struct Outbox {
    removed: Vec<String>,
    rendered: Vec<JobRecord>,
    visible: Option<bool>,
    /// Snapshot to write once the state lock is released.
    save: Option<(u64, Vec<PersistedJob>)>,
}

impl Outbox {
    fn render(&mut self, record: &JobRecord) {
        self.rendered.push(record.clone());
    }

    fn refresh(&mut self, registry: &Registry) {
        self.visible = Some(registry.is_visible());
        self.rendered = registry.snapshot();
    }

    fn flush(self, sink: &dyn Sink) {
        for key in &self.removed {
            sink.remove_job(key);
        }
        for record in &self.rendered {
            sink.render_job(record);
        }
        if let Some(visible) = self.visible {
            sink.set_visible(visible);
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Inner<B> {
    backend: B,
    sink: Arc<dyn Sink>,
    persistence: Persistence,
    config: TrackerConfig,
    state: Mutex<State>,
    /// Revision of the last snapshot written; older snapshots are skipped.
    saved_revision: Mutex<u64>,
    shutdown: CancellationToken,
}

/// Tracks background downloads: one poll task per job, periodic
/// reconciliation with the server's active list, and a persisted list of
/// job identities for resuming after a restart.
///
/// Cloning is cheap; all clones share the same state.
pub struct TrackerService<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for TrackerService<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: DownloadBackend> TrackerService<B> {
    pub fn new(
        backend: B,
        sink: Arc<dyn Sink>,
        persistence: Persistence,
        config: TrackerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                sink,
                persistence,
                config,
                state: Mutex::new(State::default()),
                saved_revision: Mutex::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State, &mut Outbox) -> R) -> R {
        let mut outbox = Outbox::default();
        let out = {
            let mut state = self.lock();
            f(&mut state, &mut outbox)
        };
        if let Some((revision, jobs)) = outbox.save.take() {
            self.write_snapshot(revision, &jobs);
        }
        outbox.flush(&*self.inner.sink);
        out
    }

    fn persist(&self, state: &mut State, outbox: &mut Outbox) {
        state.revision += 1;
        outbox.save = Some((state.revision, state.registry.persisted()));
    }

    fn write_snapshot(&self, revision: u64, jobs: &[PersistedJob]) {
        let mut saved = self
            .inner
            .saved_revision
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if revision <= *saved {
            return;
        }
        self.inner.persistence.save(jobs);
        *saved = revision;
    }

    /// Tracks a download and starts polling it (once per key).
    pub fn register(
        &self,
        primary_id: Option<&str>,
        container_id: Option<&str>,
        display_name: &str,
    ) -> Result<JobRecord, TrackerError> {
        self.track(primary_id, container_id, display_name, false)
    }

    /// `restart` re-arms polling for a job that ended in error; only a
    /// start the server accepted passes it.
    fn track(
        &self,
        primary_id: Option<&str>,
        container_id: Option<&str>,
        display_name: &str,
        restart: bool,
    ) -> Result<JobRecord, TrackerError> {
        self.with_state(|state, outbox| -> Result<JobRecord, TrackerError> {
            let reg = state
                .registry
                .register(primary_id, container_id, display_name)?;
            let key = reg.record.key;
            if reg.inserted {
                tracing::info!(%key, "tracking download");
            }
            if restart
                && reg.record.last_status == JobStatus::Error
                && state.slots.phase(&key) == PollPhase::Terminal
            {
                tracing::info!(%key, "restarting failed download");
                state.slots.clear(&key);
                state.registry.reset_status(&key);
            }
            self.persist(state, outbox);
            outbox.refresh(&state.registry);
            self.start_polling(state, &key, PollSeed::Direct);
            state
                .registry
                .get(&key)
                .cloned()
                .ok_or(TrackerError::MissingIdentity)
        })
    }

    /// Stops polling and forgets the job. Unknown jobs are ignored.
    pub fn remove(&self, primary_id: Option<&str>, container_id: Option<&str>) -> Option<JobRecord> {
        self.with_state(|state, outbox| -> Option<JobRecord> {
            let key = state.registry.resolve(primary_id, container_id)?;
            self.remove_locked(state, outbox, &key)
        })
    }

    /// Applies a status payload; replies for jobs that are no longer
    /// tracked are dropped without touching the sink.
    pub fn update_metrics(
        &self,
        primary_id: Option<&str>,
        container_id: Option<&str>,
        payload: &StatusPayload,
    ) -> Option<JobRecord> {
        self.with_state(|state, outbox| -> Option<JobRecord> {
            let record = state
                .registry
                .update_metrics(primary_id, container_id, payload)?
                .clone();
            outbox.render(&record);
            Some(record)
        })
    }

    /// Asks the server to start downloading a movie; only an accepted
    /// request is tracked.
    pub async fn start_download(
        &self,
        primary_id: &str,
        container_id: Option<&str>,
        display_name: &str,
    ) -> Result<JobRecord, TrackerError> {
        let primary = identity::normalize(Some(primary_id)).ok_or(TrackerError::MissingIdentity)?;

        match self.inner.backend.start_download(&primary).await {
            Ok(resp) if resp.success => {
                let message = resp.message.trim();
                if !message.is_empty() {
                    self.inner.sink.notify(Notice::info(message));
                }
                self.track(Some(&primary), container_id, display_name, true)
            }
            Ok(resp) => {
                let message = non_empty_or(&resp.message, "download was not started");
                tracing::warn!(primary_id = %primary, %message, "start download rejected");
                self.inner.sink.notify(Notice::error(message.clone()));
                Err(TrackerError::Rejected {
                    action: "start download",
                    message,
                })
            }
            Err(err) => {
                let err = TrackerError::transport("start download", &err);
                tracing::warn!(primary_id = %primary, error = %err, "start download failed");
                self.inner.sink.notify(Notice::error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Deletes the job on the server, then stops tracking it. Returns
    /// `Ok(None)` when the job is not tracked.
    pub async fn cancel_download(
        &self,
        primary_id: Option<&str>,
        container_id: Option<&str>,
    ) -> Result<Option<JobRecord>, TrackerError> {
        let job_id = {
            let state = self.lock();
            state
                .registry
                .resolve(primary_id, container_id)
                .and_then(|key| state.registry.get(&key))
                .and_then(|r| r.query_id().map(str::to_string))
        };
        let Some(job_id) = job_id else {
            return Ok(None);
        };

        match self.inner.backend.delete(&job_id).await {
            Ok(resp) if resp.success => Ok(self.remove(primary_id, container_id)),
            Ok(resp) => {
                let message = non_empty_or(&resp.message, "download was not deleted");
                tracing::warn!(%job_id, %message, "delete rejected");
                self.inner.sink.notify(Notice::error(message.clone()));
                Err(TrackerError::Rejected {
                    action: "delete download",
                    message,
                })
            }
            Err(err) => {
                let err = TrackerError::transport("delete download", &err);
                tracing::warn!(%job_id, error = %err, "delete failed");
                self.inner.sink.notify(Notice::error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Re-tracks the jobs saved by a previous run and starts polling them.
    pub fn resume(&self) -> usize {
        let saved = self.inner.persistence.load();
        self.with_state(|state, outbox| {
            let mut restored = 0;
            for job in saved {
                match state.registry.register(
                    job.primary_id.as_deref(),
                    job.container_id.as_deref(),
                    &job.display_name,
                ) {
                    Ok(reg) => {
                        self.start_polling(state, &reg.record.key, PollSeed::Direct);
                        restored += 1;
                    }
                    Err(err) => tracing::warn!(key = %job.key, %err, "skipping saved download"),
                }
            }
            outbox.refresh(&state.registry);
            restored
        })
    }

    pub fn set_known_items(&self, items: HashMap<String, String>) {
        let items = items
            .into_iter()
            .filter_map(|(id, title)| {
                identity::normalize(Some(&id)).map(|id| (id, title.trim().to_string()))
            })
            .collect();
        self.lock().known_items = items;
    }

    /// Adopts downloads the server reports as active that are shown on
    /// screen but not tracked here. Returns how many were adopted.
    pub async fn reconcile_once(&self) -> anyhow::Result<usize> {
        let active = self
            .inner
            .backend
            .list_active()
            .await
            .context("list active downloads")?;

        let adopted = self.with_state(|state, outbox| {
            let mut adopted = 0;
            for download in &active.downloads {
                let Some(primary) = identity::normalize(download.primary_id.as_deref()) else {
                    continue;
                };
                let Some(title) = state.known_items.get(&primary).cloned() else {
                    continue;
                };
                if state.registry.resolve(Some(&primary), None).is_some() {
                    continue;
                }

                let title = if title.is_empty() {
                    download.status.name.clone().unwrap_or_default()
                } else {
                    title
                };
                match state.registry.register(Some(&primary), None, &title) {
                    Ok(reg) => {
                        if self.start_polling(state, &reg.record.key, PollSeed::Reconciled) {
                            tracing::info!(key = %reg.record.key, "adopted active download");
                            adopted += 1;
                        }
                    }
                    Err(err) => tracing::warn!(%err, "skipping active download"),
                }
            }
            if adopted > 0 {
                self.persist(state, outbox);
                outbox.refresh(&state.registry);
            }
            adopted
        });
        Ok(adopted)
    }

    /// Runs [`Self::reconcile_once`] on the reconcile interval until
    /// [`Self::shutdown`].
    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        let svc = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.reconcile_interval.max(MIN_TICK);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(err) = svc.reconcile_once().await {
                        tracing::warn!(error = %format_error_chain(&err), "reconciliation failed");
                    }
                }
            }
            .instrument(tracing::info_span!("reconciler")),
        )
    }

    /// Stops every poll task, the reconciler and pending removals.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.lock().registry.snapshot()
    }

    pub fn get(&self, key: &str) -> Option<JobRecord> {
        self.lock().registry.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().registry.is_empty()
    }

    pub fn poll_phase(&self, key: &str) -> PollPhase {
        self.lock().slots.phase(key)
    }

    pub fn active_polls(&self) -> usize {
        self.lock().slots.active()
    }

    fn remove_locked(&self, state: &mut State, outbox: &mut Outbox, key: &str) -> Option<JobRecord> {
        state.slots.clear(key);
        let removed = state.registry.remove_key(key)?;
        tracing::info!(%key, "stopped tracking download");
        self.persist(state, outbox);
        outbox.removed.push(key.to_string());
        outbox.visible = Some(state.registry.is_visible());
        Some(removed)
    }

    fn start_polling(&self, state: &mut State, key: &str, seed: PollSeed) -> bool {
        let Some((epoch, cancel)) = state.slots.try_start(key, seed, &self.inner.shutdown) else {
            return false;
        };
        self.spawn_poller(key.to_string(), epoch, cancel);
        true
    }

    fn spawn_poller(&self, key: String, epoch: u64, cancel: CancellationToken) {
        let svc = self.clone();
        let period = self.inner.config.poll_interval.max(MIN_TICK);
        let span = tracing::info_span!("job_poll", key = %key, epoch);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(query_id) = svc.poll_target(&key, epoch) else {
                        break;
                    };
                    let reply = svc.inner.backend.status(&query_id).await;
                    if let Flow::Stop = svc.apply_poll(&key, epoch, reply) {
                        break;
                    }
                }
                tracing::debug!("poll loop stopped");
            }
            .instrument(span),
        );
    }

    fn poll_target(&self, key: &str, epoch: u64) -> Option<String> {
        let state = self.lock();
        state.slots.current_seed(key, epoch)?;
        state.registry.get(key)?.query_id().map(str::to_string)
    }

    fn apply_poll(&self, key: &str, epoch: u64, reply: anyhow::Result<StatusPayload>) -> Flow {
        self.with_state(|state, outbox| {
            // A reply that outlived its task (cancelled, removed, or the key
            // re-registered since) must not touch the record.
            let Some(seed) = state.slots.current_seed(key, epoch) else {
                tracing::debug!("discarding stale status reply");
                return Flow::Stop;
            };
            let Some(by_container) = state
                .registry
                .get(key)
                .map(JobRecord::is_queried_by_container)
            else {
                state.slots.clear(key);
                return Flow::Stop;
            };

            let payload = match reply {
                Ok(v) => v,
                Err(err) => {
                    let message = format_error_chain(&err);
                    tracing::warn!(error = %message, "status poll failed");
                    state.slots.finish(key, epoch);
                    if let Some(r) = state.registry.set_error(key, message) {
                        outbox.render(r);
                    }
                    return Flow::Stop;
                }
            };

            match scheduler::judge(payload.job_status(), seed, by_container) {
                Verdict::Pending => {
                    tracing::debug!("not registered by the torrent client yet");
                    Flow::Continue
                }
                Verdict::Continue => {
                    if let Some(r) = state.registry.apply_payload(key, &payload) {
                        outbox.render(r);
                    }
                    Flow::Continue
                }
                Verdict::Complete => {
                    state.slots.finish(key, epoch);
                    if let Some(r) = state.registry.apply_payload(key, &payload) {
                        outbox.render(r);
                    }
                    tracing::info!("download completed");
                    self.schedule_removal(key.to_string(), epoch);
                    Flow::Stop
                }
                Verdict::Fail => {
                    state.slots.finish(key, epoch);
                    if let Some(r) = state.registry.apply_payload(key, &payload) {
                        tracing::warn!(
                            error = r.error_message.as_deref().unwrap_or_default(),
                            "download failed"
                        );
                        outbox.render(r);
                    }
                    Flow::Stop
                }
                Verdict::Gone => {
                    tracing::info!("torrent client no longer knows this download");
                    self.remove_locked(state, outbox, key);
                    Flow::Stop
                }
            }
        })
    }

    fn schedule_removal(&self, key: String, epoch: u64) {
        let svc = self.clone();
        let grace = self.inner.config.completion_grace;
        let shutdown = self.inner.shutdown.clone();
        let span = tracing::info_span!("completion_grace", key = %key);

        tokio::spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(grace) => {}
                }
                svc.with_state(|state, outbox| {
                    if state.slots.is_terminal(&key, epoch) {
                        svc.remove_locked(state, outbox, &key);
                    }
                });
            }
            .instrument(span),
        );
    }
}

fn non_empty_or(message: &str, fallback: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        fallback.to_string()
    } else {
        message.to_string()
    }
}
