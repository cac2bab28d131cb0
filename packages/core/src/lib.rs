// ABOUTME: Core primitives shared by every Rekindle package
// ABOUTME: Identifier generation, realtime event fan-out, and injectable randomness

pub mod events;
pub mod ids;
pub mod random;

pub use events::{BroadcastEventSink, EventSink, MemoryEventSink, RealtimeEvent};
pub use ids::new_id;
pub use random::{FixedIndex, RandomSource, ThreadRandom};
