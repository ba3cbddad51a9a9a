//! Real-time voice-to-transaction capture pipeline
//!
//! Opens a duplex audio/event session with a remote conversational agent:
//! microphone frames stream out, synthesized speech and "record this
//! expense" tool calls stream back, and accepted tool calls become staged
//! transactions handed to the caller for confirmation.
//!
//! # Pipeline
//!
//! ```text
//! microphone ──▶ AudioFramer ──▶ encode ──▶ transport ──▶ (agent)
//!                                                            │
//!                     ┌───────────── inbound events ◀────────┘
//!                     ▼
//!       ┌── transcript fragments ──▶ TranscriptAggregator
//!       ├── audio chunks ──▶ decode ──▶ PlaybackScheduler
//!       └── tool calls ──▶ ToolCallHandler ──▶ StagedTransaction list
//! ```
//!
//! The caller opens a session with [`session::Session::open`], observes it
//! through [`session::SessionCallbacks`], and collects the staged list with
//! [`session::SessionHandle::finish`].

pub mod capture;
pub mod codec;
pub mod error;
pub mod ledger;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transcript;
pub mod transport;

pub use error::SessionError;
pub use ledger::{BudgetCatalog, BudgetEntry, BudgetId, CategoryTarget, StagedTransaction};
pub use session::{AudioIo, Session, SessionCallbacks, SessionHandle, SessionState};
pub use transcript::{Speaker, TranscriptItem};
