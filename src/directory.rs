//! Device directory: the persistent record store queried by device id.
//!
//! The real store lives outside this crate; [`MemoryDirectory`] backs tests
//! and the simulator.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// What the directory knows about one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub udid: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub is_mock: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub present: bool,
    /// Fields this crate does not interpret.
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl DeviceRecord {
    pub fn new(udid: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            udid: udid.into(),
            ip: ip.into(),
            port,
            serial: None,
            is_mock: false,
            ready: false,
            present: true,
            extra: HashMap::new(),
        }
    }

    pub fn mock(udid: impl Into<String>) -> Self {
        Self {
            is_mock: true,
            ..Self::new(udid, "127.0.0.1", 0)
        }
    }

    /// Agent base address.
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    pub fn apply(&mut self, patch: &DeviceRecordPatch) {
        if let Some(ready) = patch.ready {
            self.ready = ready;
        }
        if let Some(present) = patch.present {
            self.present = present;
        }
    }
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecordPatch {
    pub ready: Option<bool>,
    pub present: Option<bool>,
}

impl DeviceRecordPatch {
    pub fn ready(ready: bool) -> Self {
        Self {
            ready: Some(ready),
            present: None,
        }
    }
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find_by_identifier(&self, udid: &str) -> Result<Option<DeviceRecord>, DeviceError>;

    async fn update_fields(&self, udid: &str, patch: DeviceRecordPatch) -> Result<(), DeviceError>;
}

/// In-memory directory.
#[derive(Default)]
pub struct MemoryDirectory {
    records: DashMap<String, DeviceRecord>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let dir = Self::new();
        for record in records {
            dir.insert(record);
        }
        dir
    }

    pub fn insert(&self, record: DeviceRecord) {
        self.records.insert(record.udid.clone(), record);
    }

    pub fn remove(&self, udid: &str) -> Option<DeviceRecord> {
        self.records.remove(udid).map(|(_, r)| r)
    }

    pub fn get(&self, udid: &str) -> Option<DeviceRecord> {
        self.records.get(udid).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn find_by_identifier(&self, udid: &str) -> Result<Option<DeviceRecord>, DeviceError> {
        Ok(self.get(udid))
    }

    async fn update_fields(&self, udid: &str, patch: DeviceRecordPatch) -> Result<(), DeviceError> {
        match self.records.get_mut(udid) {
            Some(mut record) => {
                record.apply(&patch);
                Ok(())
            }
            None => Err(DeviceError::NotFound(udid.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_address() {
        assert_eq!(
            DeviceRecord::new("D", "10.0.0.7", 7912).address(),
            "http://10.0.0.7:7912"
        );
    }

    #[test]
    fn test_record_deserializes_unknown_fields_into_extra() {
        let record: DeviceRecord = serde_json::from_str(
            r#"{"udid":"D","ip":"10.0.0.7","port":7912,"model":"Pixel 7"}"#,
        )
        .unwrap();
        assert!(!record.is_mock);
        assert_eq!(record.extra["model"], "Pixel 7");
    }

    #[tokio::test]
    async fn test_update_fields() {
        let dir = MemoryDirectory::with_records([DeviceRecord::new("D", "10.0.0.7", 7912)]);
        dir.update_fields("D", DeviceRecordPatch::ready(true))
            .await
            .unwrap();
        assert!(dir.get("D").unwrap().ready);

        let err = dir
            .update_fields("missing", DeviceRecordPatch::ready(true))
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::NotFound("missing".into()));
    }
}
