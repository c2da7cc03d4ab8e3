//! Leveled diagnostics stream for debug panels
//!
//! Keeps the most recent events in memory and mirrors each one into
//! `tracing` at the matching level.

use crate::types::now_ms;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Maximum number of events kept in memory
pub const MAX_DIAGNOSTIC_EVENTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Info => write!(f, "info"),
            DiagnosticLevel::Warn => write!(f, "warn"),
            DiagnosticLevel::Error => write!(f, "error"),
        }
    }
}

/// A single diagnostic event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEvent {
    pub id: u64,
    pub level: DiagnosticLevel,
    /// Subsystem that raised the event, e.g. "signaling" or "rendezvous"
    pub source: String,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticCounts {
    pub info: usize,
    pub warn: usize,
    pub error: usize,
}

struct DiagnosticsLog {
    next_id: u64,
    events: VecDeque<DiagnosticEvent>,
}

/// Shared handle to the diagnostics ring
#[derive(Clone)]
pub struct Diagnostics {
    log: Arc<Mutex<DiagnosticsLog>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(DiagnosticsLog {
                next_id: 1,
                events: VecDeque::with_capacity(MAX_DIAGNOSTIC_EVENTS),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DiagnosticsLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(
        &self,
        level: DiagnosticLevel,
        source: &str,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        let message = message.into();
        match level {
            DiagnosticLevel::Info => tracing::info!(source, %context, "{}", message),
            DiagnosticLevel::Warn => tracing::warn!(source, %context, "{}", message),
            DiagnosticLevel::Error => tracing::error!(source, %context, "{}", message),
        }

        let mut log = self.lock();
        let id = log.next_id;
        log.next_id += 1;
        log.events.push_back(DiagnosticEvent {
            id,
            level,
            source: source.to_string(),
            message,
            context,
            timestamp: now_ms(),
        });

        if log.events.len() > MAX_DIAGNOSTIC_EVENTS {
            log.events.pop_front();
        }
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.record(DiagnosticLevel::Info, source, message, serde_json::Value::Null);
    }

    pub fn warn(&self, source: &str, message: impl Into<String>, context: serde_json::Value) {
        self.record(DiagnosticLevel::Warn, source, message, context);
    }

    pub fn error(&self, source: &str, message: impl Into<String>, context: serde_json::Value) {
        self.record(DiagnosticLevel::Error, source, message, context);
    }

    /// Recorded events, oldest first
    pub fn entries(&self) -> Vec<DiagnosticEvent> {
        self.lock().events.iter().cloned().collect()
    }

    pub fn counts(&self) -> DiagnosticCounts {
        let log = self.lock();
        let mut counts = DiagnosticCounts::default();
        for event in &log.events {
            match event.level {
                DiagnosticLevel::Info => counts.info += 1,
                DiagnosticLevel::Warn => counts.warn += 1,
                DiagnosticLevel::Error => counts.error += 1,
            }
        }
        counts
    }

    pub fn clear(&self) {
        self.lock().events.clear();
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
