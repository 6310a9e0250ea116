use tether_core::events::{decode_agent_event, decode_chat_event, AGENT_EVENT, CHAT_EVENT};
use tether_core::frames::EventFrame;
use tether_core::GatewayEvent;
use tracing::debug;

/// Low-urgency signals that only warrant a debounced summary refetch.
pub const SUMMARY_REFRESH_EVENTS: &[&str] =
    &["presence", "heartbeat", "health", "cron", "sessions.changed"];

#[derive(Debug, Clone, PartialEq)]
pub enum EventClass {
    SummaryRefresh,
    Run(GatewayEvent),
    Ignore,
}

pub fn classify(frame: &EventFrame) -> EventClass {
    let name = frame.event.as_str();
    if SUMMARY_REFRESH_EVENTS.contains(&name) {
        return EventClass::SummaryRefresh;
    }
    let decoded = match name {
        CHAT_EVENT => decode_chat_event(&frame.payload, frame.seq),
        AGENT_EVENT => decode_agent_event(&frame.payload, frame.seq),
        _ => return EventClass::Ignore,
    };
    match decoded {
        Ok(event) => EventClass::Run(event),
        Err(err) => {
            debug!(event = "runtime_event_undecodable", name, error = %err);
            EventClass::Ignore
        }
    }
}
