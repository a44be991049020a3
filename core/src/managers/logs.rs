/// Log group commands
///
/// Reads, clears and lists the device logs. Entries are returned as the
/// device sent them; message bodies stay raw CBOR values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{McuManager, McuMgrError, McuMgrResponse};
use crate::smp::{McuMgrGroup, McuMgrOperation};
use crate::transport::abstraction::McuMgrTransport;

/// Timestamp format the device expects for `ts`
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Command ids within the log group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogCommand {
    Read = 0,
    Clear = 1,
    Append = 2,
    ModuleList = 3,
    LevelList = 4,
    LogsList = 5,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct ShowRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    log_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<String>,
}

/// One log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub msg: Option<ciborium::Value>,
    #[serde(default)]
    pub ts: Option<i64>,
    #[serde(default)]
    pub level: Option<u8>,
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub module: Option<u8>,
    /// Message encoding (`str`, `cbor`, `bin`) on newer devices
    #[serde(default, rename = "type")]
    pub entry_type: Option<String>,
}

/// Entries read from one log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogResult {
    pub name: String,
    #[serde(default, rename = "type")]
    pub log_type: Option<u32>,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McuMgrLogResponse {
    #[serde(default)]
    pub rc: Option<i32>,
    /// Index to pass as `min_index` to continue reading
    #[serde(default)]
    pub next_index: Option<u64>,
    #[serde(default)]
    pub logs: Vec<LogResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleListResponse {
    #[serde(default)]
    pub rc: Option<i32>,
    #[serde(default)]
    pub module_map: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelListResponse {
    #[serde(default)]
    pub rc: Option<i32>,
    #[serde(default)]
    pub level_map: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogListResponse {
    #[serde(default)]
    pub rc: Option<i32>,
    #[serde(default)]
    pub log_list: Vec<String>,
}

pub struct LogManager<T: ?Sized> {
    manager: McuManager<T>,
}

impl<T: McuMgrTransport + ?Sized> LogManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            manager: McuManager::new(McuMgrGroup::Logs, transport),
        }
    }

    /// Read entries from `log` (all logs if `None`).
    ///
    /// Only entries past `min_index` are returned when it is given;
    /// `min_timestamp` narrows that further and is ignored without
    /// `min_index`. The device returns one batch at a time, continue from
    /// `next_index` to read everything.
    pub fn show(
        &self,
        log: Option<&str>,
        min_index: Option<u64>,
        min_timestamp: Option<DateTime<Utc>>,
    ) -> Result<McuMgrLogResponse, McuMgrError> {
        let request = ShowRequest {
            log_name: log.map(str::to_owned),
            index: min_index,
            ts: min_index
                .and(min_timestamp)
                .map(|ts| ts.format(LOG_TIMESTAMP_FORMAT).to_string()),
        };
        self.manager
            .send(McuMgrOperation::Read, LogCommand::Read as u8, Some(&request))
    }

    /// Erase every log on the device
    pub fn clear(&self) -> Result<McuMgrResponse, McuMgrError> {
        self.manager
            .send::<(), _>(McuMgrOperation::Write, LogCommand::Clear as u8, None)
    }

    pub fn module_list(&self) -> Result<ModuleListResponse, McuMgrError> {
        self.manager
            .send::<(), _>(McuMgrOperation::Read, LogCommand::ModuleList as u8, None)
    }

    pub fn level_list(&self) -> Result<LevelListResponse, McuMgrError> {
        self.manager
            .send::<(), _>(McuMgrOperation::Read, LogCommand::LevelList as u8, None)
    }

    pub fn logs_list(&self) -> Result<LogListResponse, McuMgrError> {
        self.manager
            .send::<(), _>(McuMgrOperation::Read, LogCommand::LogsList as u8, None)
    }
}
