//! Parsing of `jobs_enqueued` notification payloads.
//!
//! The enqueue-broadcast trigger emits
//! `id:<uuid>;q:<queue>;p:<priority>;t:<epoch_seconds>` so listeners can
//! filter client-side without touching the jobs table. `queue` and
//! `priority` are immutable after insert, which is what makes that filtering
//! sound.

use chrono::{DateTime, Utc};
use thiserror::Error;

use workhorse_core::JobId;

/// The global channel announcing ready (or soon-ready) jobs.
pub const JOBS_ENQUEUED_CHANNEL: &str = "jobs_enqueued";

#[derive(Debug, Error, PartialEq)]
pub enum NotificationParseError {
    #[error("missing or empty field {0:?}")]
    MissingField(&'static str),

    #[error("invalid value for field {field:?}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// A parsed `jobs_enqueued` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobNotification {
    pub id: JobId,
    pub queue: String,
    pub priority: i16,
    pub scheduled_at: DateTime<Utc>,
}

impl JobNotification {
    /// Parse a payload of `;`-separated parts, each split on the first `:`.
    pub fn parse(payload: &str) -> Result<Self, NotificationParseError> {
        let mut id = None;
        let mut queue = None;
        let mut priority = None;
        let mut scheduled_at = None;

        for part in payload.split(';') {
            let Some((key, value)) = part.split_once(':') else {
                continue;
            };
            match key {
                "id" => id = non_empty(value),
                "q" => queue = non_empty(value),
                "p" => priority = non_empty(value),
                "t" => scheduled_at = non_empty(value),
                _ => {}
            }
        }

        let id = id.ok_or(NotificationParseError::MissingField("id"))?;
        let queue = queue.ok_or(NotificationParseError::MissingField("q"))?;
        let priority = priority.ok_or(NotificationParseError::MissingField("p"))?;
        let scheduled_at = scheduled_at.ok_or(NotificationParseError::MissingField("t"))?;

        let id: JobId = id.parse().map_err(|_| NotificationParseError::InvalidField {
            field: "id",
            value: id.to_string(),
        })?;
        let priority: i16 =
            priority
                .parse()
                .map_err(|_| NotificationParseError::InvalidField {
                    field: "p",
                    value: priority.to_string(),
                })?;
        let epoch: f64 = scheduled_at
            .parse()
            .map_err(|_| NotificationParseError::InvalidField {
                field: "t",
                value: scheduled_at.to_string(),
            })?;
        let scheduled_at = DateTime::from_timestamp_micros((epoch * 1_000_000.0) as i64).ok_or(
            NotificationParseError::InvalidField {
                field: "t",
                value: epoch.to_string(),
            },
        )?;

        Ok(Self {
            id,
            queue: queue.to_string(),
            priority,
            scheduled_at,
        })
    }
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn parses_a_trigger_payload() {
        let id = Uuid::new_v4();
        let payload = format!("id:{id};q:mail;p:7;t:1700000000.25");
        let parsed = JobNotification::parse(&payload).unwrap();
        assert_eq!(parsed.id, JobId::from_uuid(id));
        assert_eq!(parsed.queue, "mail");
        assert_eq!(parsed.priority, 7);
        assert_eq!(parsed.scheduled_at.timestamp(), 1_700_000_000);
        assert_eq!(parsed.scheduled_at.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn queue_names_may_contain_the_separator_character() {
        let id = Uuid::new_v4();
        let payload = format!("id:{id};q:mail:digest;p:7;t:1700000000");
        let parsed = JobNotification::parse(&payload).unwrap();
        assert_eq!(parsed.queue, "mail:digest");
    }

    #[test]
    fn missing_or_empty_fields_are_rejected() {
        let id = Uuid::new_v4();
        assert_eq!(
            JobNotification::parse(&format!("id:{id};q:mail;p:7")),
            Err(NotificationParseError::MissingField("t"))
        );
        assert_eq!(
            JobNotification::parse(&format!("id:{id};q:;p:7;t:1700000000")),
            Err(NotificationParseError::MissingField("q"))
        );
        assert_eq!(
            JobNotification::parse(""),
            Err(NotificationParseError::MissingField("id"))
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        let id = Uuid::new_v4();
        assert!(matches!(
            JobNotification::parse(&format!("id:{id};q:mail;p:seven;t:1700000000")),
            Err(NotificationParseError::InvalidField { field: "p", .. })
        ));
        assert!(matches!(
            JobNotification::parse("id:not-a-uuid;q:mail;p:7;t:1700000000"),
            Err(NotificationParseError::InvalidField { field: "id", .. })
        ));
        assert!(matches!(
            JobNotification::parse(&format!("id:{id};q:mail;p:7;t:never")),
            Err(NotificationParseError::InvalidField { field: "t", .. })
        ));
    }
}
