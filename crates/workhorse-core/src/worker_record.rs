//! Worker record types.
//!
//! A worker row identifies one running worker process. Deleting it releases
//! the worker's `executing` jobs through a database trigger, so the row's
//! lifetime is the worker's lease on its claims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Postgres;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};

use crate::id::WorkerId;

/// Lifecycle state of a worker row, stored as a single character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Running,
    ShuttingDown,
    Crashed,
}

impl WorkerStatus {
    pub fn code(self) -> &'static str {
        match self {
            WorkerStatus::Initializing => "i",
            WorkerStatus::Running => "r",
            WorkerStatus::ShuttingDown => "s",
            WorkerStatus::Crashed => "c",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(WorkerStatus::Initializing),
            "r" => Some(WorkerStatus::Running),
            "s" => Some(WorkerStatus::ShuttingDown),
            "c" => Some(WorkerStatus::Crashed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerStatus::Initializing => "initializing",
            WorkerStatus::Running => "running",
            WorkerStatus::ShuttingDown => "shutting_down",
            WorkerStatus::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

impl sqlx::Type<Postgres> for WorkerStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<Postgres>>::compatible(ty)
    }
}

impl sqlx::Encode<'_, Postgres> for WorkerStatus {
    fn encode_by_ref(
        &self,
        buf: &mut PgArgumentBuffer,
    ) -> std::result::Result<IsNull, BoxDynError> {
        <&str as sqlx::Encode<'_, Postgres>>::encode_by_ref(&self.code(), buf)
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for WorkerStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let code = <&str as sqlx::Decode<'r, Postgres>>::decode(value)?;
        WorkerStatus::from_code(code.trim_end())
            .ok_or_else(|| format!("unknown worker status code {code:?}").into())
    }
}

/// A worker row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub hostname: String,
    pub pid: i32,
    pub info: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: WorkerStatus,
}
