use serde::{Deserialize, Deserializer};

/// Placeholder shown until the first successful poll reports an ETA.
pub const ETA_PLACEHOLDER: &str = "--";

/// qBittorrent reports this ETA (100 days) for "unknown / infinite".
const ETA_INFINITE_SECS: u64 = 8_640_000;

/// Last observed lifecycle state of a tracked download.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Unknown,
    NotFound,
    InProgress,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Unknown => "unknown",
            JobStatus::NotFound => "not_found",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JobMetrics {
    /// 0..=100
    pub progress_percent: f64,
    /// MB/s
    pub transfer_rate: f64,
    pub eta_label: String,
    pub seeders: u32,
    pub peers: u32,
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self {
            progress_percent: 0.0,
            transfer_rate: 0.0,
            eta_label: ETA_PLACEHOLDER.to_string(),
            seeders: 0,
            peers: 0,
        }
    }
}

/// One tracked background download.
///
/// NOTE: `key` is assigned once at creation and never changes, even when a
/// `primary_id` is learned later for a job first registered by container.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JobRecord {
    pub key: String,
    pub primary_id: Option<String>,
    pub container_id: Option<String>,
    pub display_name: String,
    pub last_status: JobStatus,
    pub last_metrics: JobMetrics,
    pub error_message: Option<String>,
}

impl JobRecord {
    pub fn new(
        key: String,
        primary_id: Option<String>,
        container_id: Option<String>,
        display_name: String,
    ) -> Self {
        Self {
            key,
            primary_id,
            container_id,
            display_name,
            last_status: JobStatus::Unknown,
            last_metrics: JobMetrics::default(),
            error_message: None,
        }
    }

    /// Identifier sent to the status/delete endpoints: the content id when
    /// known, otherwise the container id.
    pub fn query_id(&self) -> Option<&str> {
        self.primary_id
            .as_deref()
            .or(self.container_id.as_deref())
    }

    pub fn is_queried_by_container(&self) -> bool {
        self.primary_id.is_none() && self.container_id.is_some()
    }

    pub fn persisted(&self) -> PersistedJob {
        PersistedJob {
            key: self.key.clone(),
            primary_id: self.primary_id.clone(),
            container_id: self.container_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Identity and display fields only; metrics are always re-fetched.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PersistedJob {
    pub key: String,
    #[serde(default)]
    pub primary_id: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub display_name: String,
}

/// Reply of the start-download and delete endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ActionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Body of the per-job status endpoint.
///
/// Every field is optional and decoded leniently: numbers may arrive as
/// strings, and anything malformed falls back to `None` instead of failing
/// the whole payload.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct StatusPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub progress: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub speed: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub speed_mbps: Option<f64>,
    #[serde(default, deserialize_with = "lenient_eta")]
    pub eta: Option<String>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub seeds: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub peers: Option<u32>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: Option<String>,
}

const ERROR_STATES: &[&str] = &["error", "missingfiles"];

const COMPLETED_STATES: &[&str] = &[
    "seeding",
    "completed",
    "complete",
    "finished",
    "uploading",
    "stalledup",
    "pausedup",
    "stoppedup",
    "queuedup",
    "forcedup",
    "checkingup",
];

impl StatusPayload {
    /// Decodes any JSON value; a non-object body yields an empty payload.
    pub fn from_value(value: serde_json::Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    pub fn not_found() -> Self {
        Self {
            status: Some("not_found".to_string()),
            ..Self::default()
        }
    }

    pub fn job_status(&self) -> JobStatus {
        let status = self
            .status
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if status == "not_found" {
            return JobStatus::NotFound;
        }
        if ERROR_STATES.contains(&status.as_str()) {
            return JobStatus::Error;
        }
        if COMPLETED_STATES.contains(&status.as_str())
            || self.progress.is_some_and(|p| p >= 100.0)
        {
            return JobStatus::Completed;
        }
        if status.is_empty() {
            JobStatus::Unknown
        } else {
            JobStatus::InProgress
        }
    }

    pub fn metrics(&self) -> JobMetrics {
        let progress_percent = self
            .progress
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0))
            .unwrap_or(0.0);
        let transfer_rate = self
            .speed
            .or(self.speed_mbps)
            .filter(|s| s.is_finite() && *s >= 0.0)
            .unwrap_or(0.0);

        JobMetrics {
            progress_percent,
            transfer_rate,
            eta_label: self
                .eta
                .clone()
                .unwrap_or_else(|| ETA_PLACEHOLDER.to_string()),
            seeders: self.seeds.unwrap_or(0),
            peers: self.peers.unwrap_or(0),
        }
    }
}

/// One entry of the list-active-downloads reply.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct ActiveDownload {
    #[serde(
        default,
        alias = "id",
        alias = "kinopoisk_id",
        alias = "movie_id",
        deserialize_with = "lenient_string"
    )]
    pub primary_id: Option<String>,
    #[serde(flatten)]
    pub status: StatusPayload,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveDownloads {
    pub downloads: Vec<ActiveDownload>,
}

impl ActiveDownloads {
    /// Accepts `{"downloads": [...]}` or a bare array. Entries that are not
    /// objects are skipped.
    pub fn from_value(value: serde_json::Value) -> Self {
        let items = match value {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut map) => match map.remove("downloads") {
                Some(serde_json::Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        let downloads = items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<ActiveDownload>(item).ok())
            .collect();
        Self { downloads }
    }
}

pub fn format_eta_secs(secs: u64) -> String {
    if secs >= ETA_INFINITE_SECS {
        return ETA_PLACEHOLDER.to_string();
    }
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{secs}s")
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite()))
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let v = lenient_f64(d)?;
    Ok(v.filter(|f| *f >= 0.0)
        .map(|f| f.min(u32::MAX as f64) as u32))
}

fn lenient_eta<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        }
        serde_json::Value::Number(n) => n.as_u64().map(format_eta_secs),
        _ => None,
    })
}
