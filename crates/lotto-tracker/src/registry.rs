use std::collections::BTreeMap;

use lotto_download::{JobRecord, JobStatus, PersistedJob, StatusPayload};

use crate::error::TrackerError;
use crate::identity;

const DEFAULT_ERROR_MESSAGE: &str = "download failed";

#[derive(Debug, Clone)]
pub struct Registration {
    pub record: JobRecord,
    pub inserted: bool,
}

/// In-memory set of tracked downloads, one record per composite key.
#[derive(Debug, Default)]
pub struct Registry {
    records: BTreeMap<String, JobRecord>,
}

impl Registry {
    pub fn resolve(&self, primary_id: Option<&str>, container_id: Option<&str>) -> Option<String> {
        identity::resolve_existing_key(primary_id, container_id, &self.records)
    }

    /// Inserts a job or merges into the record it resolves to.
    ///
    /// Merging fills missing identifiers and takes a non-empty display
    /// name; a known value is never replaced by an empty one.
    pub fn register(
        &mut self,
        primary_id: Option<&str>,
        container_id: Option<&str>,
        display_name: &str,
    ) -> Result<Registration, TrackerError> {
        let primary = identity::normalize(primary_id);
        let container = identity::normalize(container_id);
        let display_name = display_name.trim();

        if let Some(key) = self.resolve(primary.as_deref(), container.as_deref())
            && let Some(existing) = self.records.get_mut(&key)
        {
            if !display_name.is_empty() {
                existing.display_name = display_name.to_string();
            }
            if existing.primary_id.is_none() {
                existing.primary_id = primary;
            }
            if existing.container_id.is_none() {
                existing.container_id = container;
            }
            return Ok(Registration {
                record: existing.clone(),
                inserted: false,
            });
        }

        let key = identity::derive_key(primary.as_deref(), container.as_deref())
            .ok_or(TrackerError::MissingIdentity)?;
        let record = JobRecord::new(key.clone(), primary, container, display_name.to_string());
        self.records.insert(key, record.clone());
        Ok(Registration {
            record,
            inserted: true,
        })
    }

    pub fn remove_key(&mut self, key: &str) -> Option<JobRecord> {
        self.records.remove(key)
    }

    /// Applies a status payload to the record the identifiers resolve to.
    /// Returns `None` (and changes nothing) for unknown jobs.
    pub fn update_metrics(
        &mut self,
        primary_id: Option<&str>,
        container_id: Option<&str>,
        payload: &StatusPayload,
    ) -> Option<&JobRecord> {
        let key = self.resolve(primary_id, container_id)?;
        self.apply_payload(&key, payload)
    }

    pub fn apply_payload(&mut self, key: &str, payload: &StatusPayload) -> Option<&JobRecord> {
        let record = self.records.get_mut(key)?;
        let status = payload.job_status();

        if let Some(name) = payload.name.as_deref().filter(|n| !n.trim().is_empty()) {
            record.display_name = name.trim().to_string();
        }

        match status {
            JobStatus::NotFound => {}
            JobStatus::Error => {
                record.error_message = Some(
                    payload
                        .message
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
                );
            }
            JobStatus::Completed => {
                record.last_metrics = payload.metrics();
                record.last_metrics.progress_percent = 100.0;
                record.last_metrics.transfer_rate = 0.0;
                record.error_message = None;
            }
            JobStatus::InProgress | JobStatus::Unknown => {
                record.last_metrics = payload.metrics();
                record.error_message = None;
            }
        }
        record.last_status = status;
        Some(record)
    }

    /// Marks a job failed without a payload (transport errors).
    pub fn set_error(&mut self, key: &str, message: String) -> Option<&JobRecord> {
        let record = self.records.get_mut(key)?;
        record.last_status = JobStatus::Error;
        record.last_metrics.transfer_rate = 0.0;
        record.error_message = Some(message);
        Some(record)
    }

    /// Back to a fresh `Unknown` record, keeping identity and name.
    pub fn reset_status(&mut self, key: &str) -> Option<&JobRecord> {
        let record = self.records.get_mut(key)?;
        record.last_status = JobStatus::Unknown;
        record.last_metrics = Default::default();
        record.error_message = None;
        Some(record)
    }

    pub fn get(&self, key: &str) -> Option<&JobRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The tracker is shown while at least one job exists.
    pub fn is_visible(&self) -> bool {
        !self.records.is_empty()
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.records.values().cloned().collect()
    }

    pub fn persisted(&self) -> Vec<PersistedJob> {
        self.records.values().map(JobRecord::persisted).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_same_key_twice_keeps_one_record() {
        let mut reg = Registry::default();
        let first = reg.register(Some("42"), None, "Film A").unwrap();
        let second = reg.register(Some("42"), None, "Film A").unwrap();
        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("movie-42").unwrap().display_name, "Film A");
    }

    #[test]
    fn register_keeps_known_values() {
        let mut reg = Registry::default();
        reg.register(Some("42"), Some("L1"), "Film A").unwrap();
        let merged = reg.register(Some("42"), None, "  ").unwrap().record;
        assert_eq!(merged.display_name, "Film A");
        assert_eq!(merged.container_id.as_deref(), Some("L1"));

        let renamed = reg.register(Some("42"), None, "Film A (1980)").unwrap().record;
        assert_eq!(renamed.display_name, "Film A (1980)");
    }

    #[test]
    fn container_registration_adopts_later_primary_id() {
        let mut reg = Registry::default();
        let first = reg.register(None, Some("L1"), "").unwrap().record;
        let second = reg.register(Some("99"), Some("L1"), "Film B").unwrap().record;
        assert_eq!(reg.len(), 1);
        assert_eq!(first.key, second.key);
        assert_eq!(second.key, "lottery-L1");
        assert_eq!(second.primary_id.as_deref(), Some("99"));
        assert_eq!(reg.resolve(Some("99"), Some("L1")).as_deref(), Some("lottery-L1"));
    }

    #[test]
    fn register_without_identity_fails() {
        let mut reg = Registry::default();
        let err = reg.register(None, Some(" "), "x").unwrap_err();
        assert!(matches!(err, TrackerError::MissingIdentity));
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut reg = Registry::default();
        reg.register(Some("1"), None, "").unwrap();
        assert!(reg.remove_key("movie-2").is_none());
        assert_eq!(reg.len(), 1);
        assert!(reg.remove_key("movie-1").is_some());
        assert!(!reg.is_visible());
    }

    #[test]
    fn update_metrics_on_removed_job_does_nothing() {
        let mut reg = Registry::default();
        reg.register(Some("5"), None, "").unwrap();
        reg.remove_key("movie-5");
        let payload = StatusPayload::from_value(json!({"status": "downloading", "progress": 10}));
        assert!(reg.update_metrics(Some("5"), None, &payload).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn update_metrics_applies_payload() {
        let mut reg = Registry::default();
        reg.register(Some("5"), None, "").unwrap();
        let payload = StatusPayload::from_value(json!({
            "status": "downloading",
            "progress": 12.5,
            "speed": 3.2,
            "eta": "4m",
            "seeds": 10,
            "peers": 2,
            "name": "Some.Movie.1080p",
        }));
        let r = reg.update_metrics(Some("5"), None, &payload).unwrap();
        assert_eq!(r.last_status, JobStatus::InProgress);
        assert_eq!(r.display_name, "Some.Movie.1080p");
        assert_eq!(r.last_metrics.progress_percent, 12.5);
        assert_eq!(r.last_metrics.seeders, 10);
    }

    #[test]
    fn error_payload_sets_message() {
        let mut reg = Registry::default();
        reg.register(Some("5"), None, "").unwrap();
        let payload = StatusPayload::from_value(json!({"status": "error", "message": "tracker down"}));
        let r = reg.apply_payload("movie-5", &payload).unwrap();
        assert_eq!(r.last_status, JobStatus::Error);
        assert_eq!(r.error_message.as_deref(), Some("tracker down"));

        let r = reg
            .apply_payload("movie-5", &StatusPayload::from_value(json!({"status": "error"})))
            .unwrap();
        assert_eq!(r.error_message.as_deref(), Some(DEFAULT_ERROR_MESSAGE));
    }

    #[test]
    fn persisted_view_omits_metrics() {
        let mut reg = Registry::default();
        reg.register(Some("5"), Some("L5"), "Film").unwrap();
        let saved = reg.persisted();
        assert_eq!(
            saved,
            vec![PersistedJob {
                key: "movie-5".into(),
                primary_id: Some("5".into()),
                container_id: Some("L5".into()),
                display_name: "Film".into(),
            }]
        );
    }

    #[test]
    fn movie_id_finds_job_keyed_by_lottery() {
        let mut reg = Registry::default();
        reg.register(None, Some("L1"), "").unwrap();
        reg.register(Some("7"), Some("L1"), "Solaris").unwrap();

        let again = reg.register(Some("7"), None, "").unwrap();
        assert!(!again.inserted);
        assert_eq!(again.record.key, "lottery-L1");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reset_clears_failure() {
        let mut reg = Registry::default();
        reg.register(Some("5"), None, "Film").unwrap();
        reg.set_error("movie-5", "disk full".into());

        let r = reg.reset_status("movie-5").unwrap();
        assert_eq!(r.last_status, JobStatus::Unknown);
        assert_eq!(r.error_message, None);
        assert_eq!(r.display_name, "Film");
        assert!(reg.reset_status("movie-6").is_none());
    }
}
