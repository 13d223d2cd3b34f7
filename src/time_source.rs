use std::sync::{Arc, Mutex, PoisonError};

use time::{Duration, OffsetDateTime};

/// Clock used for period-closure checks and default `as_of` values.
///
/// The mock variant is settable so tests can move time across a year end.
#[derive(Clone, Debug, Default)]
pub struct TimeSource {
    mock: Option<Arc<Mutex<OffsetDateTime>>>,
}

impl TimeSource {
    pub fn system() -> Self {
        Self { mock: None }
    }

    pub fn mock(initial_time: OffsetDateTime) -> Self {
        Self {
            mock: Some(Arc::new(Mutex::new(initial_time))),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        match &self.mock {
            Some(time) => *time.lock().unwrap_or_else(PoisonError::into_inner),
            None => OffsetDateTime::now_utc(),
        }
    }

    /// No-op on the system clock.
    pub fn advance(&self, duration: Duration) {
        if let Some(time) = &self.mock {
            *time.lock().unwrap_or_else(PoisonError::into_inner) += duration;
        }
    }

    /// No-op on the system clock.
    pub fn set(&self, new_time: OffsetDateTime) {
        if let Some(time) = &self.mock {
            *time.lock().unwrap_or_else(PoisonError::into_inner) = new_time;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_mock_time_moves_only_when_told() {
        let clock = TimeSource::mock(datetime!(2024-06-01 0:00 UTC));
        assert_eq!(clock.now(), datetime!(2024-06-01 0:00 UTC));
        clock.advance(Duration::days(1));
        assert_eq!(clock.now(), datetime!(2024-06-02 0:00 UTC));
        clock.set(datetime!(2025-01-01 0:00 UTC));
        assert_eq!(clock.now(), datetime!(2025-01-01 0:00 UTC));
    }
}
