//! In-process fakes for the tracker's seams.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use lotto_download::{ActionResponse, ActiveDownloads, JobRecord, StatusPayload};
use serde_json::{Value, json};

use crate::backend::DownloadBackend;
use crate::persistence::{KeyValueStore, MemoryStore};
use crate::sink::{Notice, Sink};

/// A scripted reply: a JSON body, or a transport error message.
pub(crate) type Reply = Result<Value, String>;

#[derive(Default)]
struct FakeState {
    status_replies: HashMap<String, VecDeque<Reply>>,
    status_calls: HashMap<String, usize>,
    status_delay: Option<Duration>,
    active: Vec<Value>,
    active_error: Option<String>,
    start_reply: Option<Reply>,
    delete_reply: Option<Reply>,
    started: Vec<String>,
    deleted: Vec<String>,
}

/// Backend whose replies are scripted per id. Unscripted ids report a
/// download in progress; start and delete succeed unless told otherwise.
#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Replies are used in order; the last one repeats.
    pub fn script_status(&self, id: &str, replies: Vec<Reply>) {
        self.lock()
            .status_replies
            .insert(id.to_string(), replies.into());
    }

    pub fn set_status_delay(&self, delay: Duration) {
        self.lock().status_delay = Some(delay);
    }

    pub fn status_calls(&self, id: &str) -> usize {
        self.lock().status_calls.get(id).copied().unwrap_or(0)
    }

    pub fn set_active(&self, items: Vec<Value>) {
        let mut state = self.lock();
        state.active = items;
        state.active_error = None;
    }

    pub fn fail_active(&self, message: &str) {
        self.lock().active_error = Some(message.to_string());
    }

    pub fn set_start_reply(&self, reply: Reply) {
        self.lock().start_reply = Some(reply);
    }

    pub fn set_delete_reply(&self, reply: Reply) {
        self.lock().delete_reply = Some(reply);
    }

    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }
}

fn next_status(state: &mut FakeState, id: &str) -> Reply {
    let queue = state.status_replies.entry(id.to_string()).or_default();
    if queue.len() > 1
        && let Some(reply) = queue.pop_front()
    {
        return reply;
    }
    queue
        .front()
        .cloned()
        .unwrap_or_else(|| Ok(json!({"status": "downloading", "progress": 10})))
}

fn action_reply(reply: Option<Reply>) -> anyhow::Result<ActionResponse> {
    match reply {
        None => Ok(ActionResponse {
            success: true,
            message: "ok".to_string(),
        }),
        Some(Ok(body)) => Ok(serde_json::from_value(body)?),
        Some(Err(message)) => Err(anyhow::anyhow!(message)),
    }
}

impl DownloadBackend for FakeBackend {
    fn start_download(
        &self,
        primary_id: &str,
    ) -> impl Future<Output = anyhow::Result<ActionResponse>> + Send {
        let reply = {
            let mut state = self.lock();
            state.started.push(primary_id.to_string());
            state.start_reply.clone()
        };
        async move { action_reply(reply) }
    }

    fn status(&self, id: &str) -> impl Future<Output = anyhow::Result<StatusPayload>> + Send {
        let (delay, reply) = {
            let mut state = self.lock();
            *state.status_calls.entry(id.to_string()).or_default() += 1;
            (state.status_delay, next_status(&mut state, id))
        };
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            reply
                .map(StatusPayload::from_value)
                .map_err(anyhow::Error::msg)
        }
    }

    fn list_active(&self) -> impl Future<Output = anyhow::Result<ActiveDownloads>> + Send {
        let reply = {
            let state = self.lock();
            match &state.active_error {
                Some(message) => Err(message.clone()),
                None => Ok(Value::Array(state.active.clone())),
            }
        };
        async move {
            reply
                .map(ActiveDownloads::from_value)
                .map_err(anyhow::Error::msg)
        }
    }

    fn delete(&self, job_id: &str) -> impl Future<Output = anyhow::Result<ActionResponse>> + Send {
        let reply = {
            let mut state = self.lock();
            state.deleted.push(job_id.to_string());
            state.delete_reply.clone()
        };
        async move { action_reply(reply) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkEvent {
    Render(JobRecord),
    Removed(String),
    Visible(bool),
    Notice(Notice),
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    fn push(&self, event: SinkEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn renders_of(&self, key: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Render(r) if r.key == key))
            .count()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Notice(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn last_visible(&self) -> Option<bool> {
        self.events().iter().rev().find_map(|e| match e {
            SinkEvent::Visible(v) => Some(*v),
            _ => None,
        })
    }
}

impl Sink for RecordingSink {
    fn render_job(&self, record: &JobRecord) {
        self.push(SinkEvent::Render(record.clone()));
    }

    fn set_visible(&self, visible: bool) {
        self.push(SinkEvent::Visible(visible));
    }

    fn notify(&self, notice: Notice) {
        self.push(SinkEvent::Notice(notice));
    }

    fn remove_job(&self, key: &str) {
        self.push(SinkEvent::Removed(key.to_string()));
    }
}

/// Memory store that counts writes.
#[derive(Default)]
pub(crate) struct CountingStore {
    inner: MemoryStore,
    writes: AtomicUsize,
}

impl CountingStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl KeyValueStore for CountingStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key)
    }
}
