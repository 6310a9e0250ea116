pub mod events;
pub mod frames;
pub mod message;
pub mod text;
pub mod transcript;

pub use events::{GatewayEvent, StreamKind};
pub use frames::{EventFrame, GatewayFrame, HelloOk, RequestFrame, ResponseFrame};
pub use message::ChatMessage;
pub use transcript::{AgentTranscript, EntryKind, EntryMeta, EntrySource, TranscriptEntry};
