use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use crate::stats::Tags;

/// Commands accepted while a test is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Hold every VU at its next iteration boundary
    Pause,
    /// Continue after a pause
    Resume,
    /// Add a tag to all subsequent samples
    Tag(String, String),
    /// Log the current state
    Status,
    /// Abort the run
    Stop,
}

/// State shared between the load controller and every VU.
pub struct ControlState {
    paused: AtomicBool,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    tags: Mutex<Arc<Tags>>,
    /// Accumulated paused time in milliseconds
    total_paused_ms: AtomicU64,
    /// Milliseconds since `reference` when the current pause began, 0 if none
    pause_started_ms: AtomicU64,
    reference: Instant,
}

pub type SharedControl = Arc<ControlState>;

impl ControlState {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            tags: Mutex::new(Arc::new(Tags::new())),
            total_paused_ms: AtomicU64::new(0),
            pause_started_ms: AtomicU64::new(0),
            reference: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        // +1 keeps a pause that starts at the reference instant distinct from "none"
        self.reference.elapsed().as_millis() as u64 + 1
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.pause_started_ms.store(self.now_ms(), Ordering::SeqCst);
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            let started = self.pause_started_ms.swap(0, Ordering::SeqCst);
            if started > 0 {
                let paused_for = self.now_ms().saturating_sub(started);
                self.total_paused_ms.fetch_add(paused_for, Ordering::SeqCst);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Time spent paused so far, including a pause still in progress.
    pub fn total_paused(&self) -> Duration {
        let mut total = self.total_paused_ms.load(Ordering::SeqCst);
        let started = self.pause_started_ms.load(Ordering::SeqCst);
        if started > 0 {
            total += self.now_ms().saturating_sub(started);
        }
        Duration::from_millis(total)
    }

    /// Request that every VU stops at its next iteration boundary. The first
    /// reason wins.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut slot = self.abort_reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().clone()
    }

    pub fn add_tag(&self, key: String, value: String) {
        let mut tags = self.tags.lock();
        let mut updated = (**tags).clone();
        updated.insert(key, value);
        *tags = Arc::new(updated);
    }

    /// Current run-wide tags. Cheap to call once per iteration.
    pub fn tags(&self) -> Arc<Tags> {
        self.tags.lock().clone()
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a control command typed on stdin.
pub fn parse_control_command(input: &str) -> Option<ControlCommand> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let first = parts.first()?;

    match first.to_lowercase().as_str() {
        "pause" => Some(ControlCommand::Pause),
        "resume" | "unpause" => Some(ControlCommand::Resume),
        "tag" => {
            let (key, value) = parts.get(1)?.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some(ControlCommand::Tag(key.to_string(), value.to_string()))
        }
        "status" | "stats" => Some(ControlCommand::Status),
        "stop" | "quit" | "exit" | "abort" => Some(ControlCommand::Stop),
        _ => None,
    }
}
