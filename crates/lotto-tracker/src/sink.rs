use lotto_download::JobRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// One-off user feedback, e.g. a rejected start or delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Presentation layer for the tracker.
///
/// Implementations are passive: they only display what they are given and
/// never call back into the tracker.
pub trait Sink: Send + Sync {
    fn render_job(&self, record: &JobRecord);
    fn set_visible(&self, visible: bool);
    fn notify(&self, notice: Notice);

    fn remove_job(&self, _key: &str) {}
}

/// Renders tracker updates as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl Sink for LogSink {
    fn render_job(&self, record: &JobRecord) {
        let m = &record.last_metrics;
        tracing::info!(
            key = %record.key,
            title = %record.display_name,
            status = %record.last_status,
            progress = format_args!("{:.1}%", m.progress_percent),
            speed = format_args!("{:.2} MB/s", m.transfer_rate),
            eta = %m.eta_label,
            seeds = m.seeders,
            peers = m.peers,
            error = record.error_message.as_deref().unwrap_or(""),
            "download"
        );
    }

    fn set_visible(&self, visible: bool) {
        tracing::debug!(visible, "tracker visibility");
    }

    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => tracing::info!("{}", notice.message),
            NoticeLevel::Error => tracing::warn!("{}", notice.message),
        }
    }

    fn remove_job(&self, key: &str) {
        tracing::info!(%key, "download no longer tracked");
    }
}
