//! Injectable wall clock
//!
//! Agents never call `Utc::now()` directly; they read time through a shared
//! [`mockable::Clock`] so tests can move time forward deterministically.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Local, Utc};
use mockable::{Clock, DefaultClock};

/// Clock handle shared between the bus and the agents
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// The real system clock
pub fn system_clock() -> SharedClock {
    Arc::new(DefaultClock)
}

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at the current system time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
    }

    /// Wrap this clock for injection; clones keep sharing the same time
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_when_advanced() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.utc(), start);

        clock.advance(Duration::milliseconds(800));
        assert_eq!(clock.utc(), start + Duration::milliseconds(800));
    }

    #[test]
    fn test_shared_handle_sees_advances() {
        let clock = ManualClock::starting_now();
        let shared = clock.shared();
        let before = shared.utc();
        clock.advance(Duration::minutes(5));
        assert_eq!(shared.utc() - before, Duration::minutes(5));
    }

    #[test]
    fn test_set_overrides_time() {
        let clock = ManualClock::starting_now();
        let target = Utc::now() + Duration::days(3);
        clock.set(target);
        assert_eq!(clock.utc(), target);
    }
}
