use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Time source for throttle policies, in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += secs;
    }

    pub fn set(&self, secs: f64) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
