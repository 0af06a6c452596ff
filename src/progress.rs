use std::sync::Mutex;

// message only, previous percent kept
pub const KEEP_PERCENT: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub message: String,
    pub percent: i32,
}

// called from worker tasks, must not block
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, i32) + Send + Sync,
{
    fn event(&self, event: ProgressEvent) {
        self(&event.message, event.percent)
    }
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    state: Mutex<TrackerState>,
}

#[derive(Debug, Clone, Copy)]
struct TrackerState {
    last: i32,
    span: (i32, i32),
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            state: Mutex::new(TrackerState {
                last: 0,
                span: (0, 100),
            }),
        }
    }

    pub fn set_span(&self, low: u8, high: u8) {
        let mut state = self.lock();
        let low = i32::from(low.min(100));
        let high = i32::from(high.min(100)).max(low);
        state.span = (low, high);
    }

    pub fn message(&self, message: impl Into<String>) {
        self.sink.event(ProgressEvent {
            message: message.into(),
            percent: KEEP_PERCENT,
        });
    }

    pub fn report(&self, message: impl Into<String>, percent: i32) {
        if percent == KEEP_PERCENT {
            self.message(message);
            return;
        }
        let percent = percent.clamp(0, 100);
        self.lock().last = percent;
        self.sink.event(ProgressEvent {
            message: message.into(),
            percent,
        });
    }

    pub fn step(&self, done: usize, total: usize, message: impl Into<String>) {
        let percent = {
            let mut state = self.lock();
            let (low, high) = state.span;
            let fraction = if total == 0 {
                1.0
            } else {
                done.min(total) as f64 / total as f64
            };
            let percent = low + ((high - low) as f64 * fraction).floor() as i32;
            if percent <= state.last && done < total {
                return;
            }
            state.last = state.last.max(percent);
            state.last
        };
        self.sink.event(ProgressEvent {
            message: message.into(),
            percent,
        });
    }

    pub fn percent(&self) -> i32 {
        self.lock().last
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for Recorder {
        fn event(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn message_only_keeps_previous_percent() {
        let recorder = Recorder::default();
        let tracker = ProgressTracker::new(&recorder);
        tracker.report("half", 50);
        tracker.message("resolving");
        assert_eq!(tracker.percent(), 50);
        let events = recorder.events.lock().unwrap();
        assert_eq!(events[1].percent, KEEP_PERCENT);
    }

    #[test]
    fn step_is_coarse_and_monotonic() {
        let recorder = Recorder::default();
        let tracker = ProgressTracker::new(&recorder);
        for done in 1..=1000 {
            tracker.step(done, 1000, format!("{done}/1000"));
        }
        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 100);
        assert!(events.windows(2).all(|pair| pair[0].percent < pair[1].percent));
        assert_eq!(events.last().unwrap().percent, 100);
    }

    #[test]
    fn span_maps_steps() {
        let recorder = Recorder::default();
        let tracker = ProgressTracker::new(&recorder);
        tracker.set_span(80, 100);
        tracker.step(1, 2, "repair");
        assert_eq!(tracker.percent(), 90);
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = |message: &str, percent: i32| {
            seen.lock().unwrap().push((message.to_string(), percent));
        };
        let tracker = ProgressTracker::new(&sink);
        tracker.report("done", 100);
        assert_eq!(seen.lock().unwrap()[0], ("done".to_string(), 100));
    }
}
