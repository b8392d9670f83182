//! State shared by every instrument of one apparatus.

use crate::recording::RecordingObserver;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Uid of the experiment segment currently executing, written by the sequencer
/// and stamped onto every recording row.
#[derive(Debug, Clone, Default)]
pub struct ActiveSegment(Arc<RwLock<Option<String>>>);

impl ActiveSegment {
    /// Create a handle with no active segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `uid` as the running segment.
    pub fn set(&self, uid: &str) {
        *self.0.write() = Some(uid.to_string());
    }

    /// No segment is running.
    pub fn clear(&self) {
        *self.0.write() = None;
    }

    /// Running segment uid, or an empty string.
    pub fn current(&self) -> String {
        self.0.read().clone().unwrap_or_default()
    }
}

/// Defaults and collaborators handed to each instrument at construction.
#[derive(Clone)]
pub struct InstrumentContext {
    /// Segment stamp for recording files
    pub active_segment: ActiveSegment,
    /// Display collaborator
    pub observer: Option<Arc<dyn RecordingObserver>>,
    /// Capacity of the per-instrument rolling display recorder
    pub rolling_samples: usize,
    /// Retention target for named recordings
    pub stored_samples: usize,
}

impl Default for InstrumentContext {
    fn default() -> Self {
        Self {
            active_segment: ActiveSegment::new(),
            observer: None,
            rolling_samples: 500,
            stored_samples: 1000,
        }
    }
}

impl fmt::Debug for InstrumentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentContext")
            .field("active_segment", &self.active_segment.current())
            .field("observer", &self.observer.is_some())
            .field("rolling_samples", &self.rolling_samples)
            .field("stored_samples", &self.stored_samples)
            .finish()
    }
}

impl InstrumentContext {
    /// Attach a display observer.
    pub fn with_observer(mut self, observer: Arc<dyn RecordingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}
