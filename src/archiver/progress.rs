use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Snapshot of a backend's progress counters. `None` means not tracked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub current_file: Option<String>,
    /// Bytes written for the files completed so far.
    pub total_written: Option<u64>,
    pub current_file_written: Option<u64>,
    pub current_file_length: Option<u64>,
}

#[derive(Debug, Default)]
struct ProgressState {
    tracking: AtomicBool,
    current_file: Mutex<Option<String>>,
    total_written: AtomicU64,
    current_file_written: AtomicU64,
    current_file_length: AtomicU64,
}

/// Counters updated by the writing thread and readable from any other.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    inner: Arc<ProgressState>,
}

impl ProgressHandle {
    pub fn new() -> ProgressHandle {
        ProgressHandle::default()
    }

    pub fn snapshot(&self) -> Progress {
        if !self.inner.tracking.load(Ordering::Acquire) {
            return Progress::default();
        }

        let current_file = match self.inner.current_file.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        Progress {
            current_file,
            total_written: Some(self.inner.total_written.load(Ordering::Acquire)),
            current_file_written: Some(self.inner.current_file_written.load(Ordering::Acquire)),
            current_file_length: Some(self.inner.current_file_length.load(Ordering::Acquire)),
        }
    }

    pub(crate) fn start_file(&self, name: &str, length: u64) {
        match self.inner.current_file.lock() {
            Ok(mut guard) => *guard = Some(name.to_owned()),
            Err(poisoned) => *poisoned.into_inner() = Some(name.to_owned()),
        }
        self.inner.current_file_written.store(0, Ordering::Release);
        self.inner.current_file_length.store(length, Ordering::Release);
        self.inner.tracking.store(true, Ordering::Release);
    }

    pub(crate) fn add_written(&self, bytes: u64) {
        self.inner
            .current_file_written
            .fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn finish_file(&self) {
        let written = self.inner.current_file_written.swap(0, Ordering::AcqRel);
        self.inner.total_written.fetch_add(written, Ordering::AcqRel);
    }
}
