//! # chorus-core
//!
//! The realtime engine behind Chorus: connection/presence bookkeeping, the
//! call lifecycle state machine, opaque signaling relay, and receipt
//! tracking, all feeding a group-broadcast bus.
//!
//! ## Components
//!
//! - **GroupBus** - pub/sub fan-out to chat groups, single users, or all
//!   connections
//! - **ConnectionRegistry** - connection-to-user mapping with derived
//!   presence
//! - **PresenceBroadcaster** - online/offline transitions on the bus
//! - **CallStateMachine** / **CallCoordinator** - serialized-per-call
//!   lifecycle mutations and their broadcasts
//! - **SignalingRelay** - targeted pass-through of negotiation payloads
//! - **MessageDeliveryTracker** - monotonic delivered/read receipt sets
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────────┐   ┌──────────────┐
//! │ Connection │──▶│ CallCoordinator │──▶│ StateMachine │
//! │  handler   │   └────────┬────────┘   └──────────────┘
//! └─────┬──────┘            ▼
//!       │            ┌──────────┐   ┌──────────────────┐
//!       └───────────▶│ GroupBus │◀──│ SignalingRelay / │
//!                    └──────────┘   │ Presence / Rcpts │
//!                                   └──────────────────┘
//! ```

pub mod bus;
pub mod call;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod message;
pub mod presence;
pub mod receipts;
pub mod registry;
pub mod signaling;
pub mod store;

/// User identity.
pub type UserId = String;
/// Transport connection identity.
pub type ConnectionId = String;
/// Chat identity; doubles as the broadcast group name.
pub type ChatId = String;
/// Call identity.
pub type CallId = String;
/// Message identity.
pub type MessageId = String;
/// Broadcast group identity.
pub type GroupId = String;

pub use bus::{BusConfig, BusError, Delivery, GroupBus};
pub use call::{Call, CallParticipant, CallSnapshot, CallStateMachine, CallStatus, LeaveOutcome};
pub use coordinator::CallCoordinator;
pub use error::EngineError;
pub use events::ServerEvent;
pub use message::{Message, Reaction};
pub use presence::PresenceBroadcaster;
pub use receipts::{MessageDeliveryTracker, ReceiptCounts};
pub use registry::ConnectionRegistry;
pub use signaling::{SignalKind, SignalingRelay};
pub use store::{
    Authenticator, CallStore, InsecureAuthenticator, MemoryCallStore, MemoryMessageStore,
    MemoryProfileStore, MessageStore, ProfileStore, StoreError,
};
