use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Quota {
    remaining: Mutex<Option<u64>>,
}

impl Quota {
    pub fn new() -> Self {
        Self::default()
    }

    // a new run forgets the previous window
    pub fn begin_run(&self) {
        *self.lock() = None;
    }

    pub fn observe(&self, remaining: u64) {
        let mut current = self.lock();
        *current = Some(current.map_or(remaining, |value| value.min(remaining)));
    }

    pub fn observe_header(&self, value: &str) {
        if let Ok(remaining) = value.trim().parse::<u64>() {
            self.observe(remaining);
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<u64>> {
        self.remaining.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
