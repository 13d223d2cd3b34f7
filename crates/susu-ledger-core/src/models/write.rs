use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{AccrualPeriod, EventId, EventType, Posting};

/// An event proposed for commit. Identifier and sequence number are assigned
/// by the storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub description: Arc<str>,
    pub corrects: Option<EventId>,
    pub accrual: Option<AccrualPeriod>,
    pub postings: Vec<Posting>,
}

impl NewEvent {
    pub fn new(event_type: EventType, timestamp: OffsetDateTime, description: impl Into<Arc<str>>, postings: Vec<Posting>) -> Self {
        Self {
            event_type,
            timestamp,
            description: description.into(),
            corrects: None,
            accrual: None,
            postings,
        }
    }

    pub fn correcting(mut self, original: EventId) -> Self {
        self.corrects = Some(original);
        self
    }

    pub fn covering(mut self, period: AccrualPeriod) -> Self {
        self.accrual = Some(period);
        self
    }
}
