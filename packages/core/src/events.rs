// ABOUTME: Realtime event definitions and fire-and-forget fan-out sinks
// ABOUTME: Broadcast channel sink for live clients, in-memory sink for embedding and tests

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Default capacity for the broadcast channel
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 200;

/// Events pushed to clients so the UI can react without polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    SosInitiated {
        session_id: String,
        couple_id: String,
        initiated_by: String,
    },
    SosStatusChanged {
        session_id: String,
        couple_id: String,
        status: String,
    },
    SosAnalysisReady {
        session_id: String,
        analysis_id: String,
    },
    EmergencyProtocolTriggered {
        session_id: String,
        user_id: String,
        question_id: String,
    },
    ConsequenceTriggered {
        user_id: String,
        consequence_id: String,
        consequence_type: String,
        requires_consent: bool,
    },
    ScreensaverChanged {
        user_id: String,
        image_url: String,
        caption: String,
    },
    AppsBlocked {
        user_id: String,
        blocked_apps: Vec<String>,
        duration_minutes: u32,
        message: String,
    },
    SpamNotification {
        user_id: String,
        message: String,
        notification_number: u32,
        total_notifications: u32,
    },
    ChallengeAssigned {
        user_id: String,
        challenge_id: String,
        challenge_title: String,
        message: String,
    },
    ConsequenceCompleted {
        consequence_id: String,
        user_id: String,
        consequence_type: String,
    },
}

impl RealtimeEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::SosInitiated { .. } => "sos_initiated",
            Self::SosStatusChanged { .. } => "sos_status_changed",
            Self::SosAnalysisReady { .. } => "sos_analysis_ready",
            Self::EmergencyProtocolTriggered { .. } => "emergency_protocol_triggered",
            Self::ConsequenceTriggered { .. } => "consequence_triggered",
            Self::ScreensaverChanged { .. } => "screensaver_changed",
            Self::AppsBlocked { .. } => "apps_blocked",
            Self::SpamNotification { .. } => "spam_notification",
            Self::ChallengeAssigned { .. } => "challenge_assigned",
            Self::ConsequenceCompleted { .. } => "consequence_completed",
        }
    }

    /// Event body without the name
    pub fn payload(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("payload").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }
}

/// Fire-and-forget event emitter; the core never waits for acknowledgment
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RealtimeEvent);
}

/// Event sink backed by a tokio broadcast channel
pub struct BroadcastEventSink {
    event_tx: broadcast::Sender<RealtimeEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_SIZE)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: RealtimeEvent) {
        let name = event.name();
        if self.event_tx.send(event).is_err() {
            debug!("No subscribers for realtime event: {}", name);
        }
    }
}

/// Event sink that keeps every event in memory
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RealtimeEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events emitted so far
    pub fn events(&self) -> Vec<RealtimeEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Names of the events emitted so far, in order
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(RealtimeEvent::name).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: RealtimeEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
