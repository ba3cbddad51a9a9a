//! Duplex session protocol types
//!
//! JSON message contracts for the agent session. Framing is owned by the
//! transport; these are the logical messages the pipeline relies on.
//!
//! # Protocol Overview
//!
//! 1. Client streams `audio_chunk` messages (base64 PCM16 mono @16kHz)
//! 2. Server streams transcript fragments for both channels
//! 3. Server sends `tool_call_request` when the agent wants to stage an
//!    expense; client acks each one with `tool_result`
//! 4. Server streams synthesized speech back as `audio_chunk` (@24kHz)
//! 5. `turn_complete` closes out every open transcript item
//! 6. `error` / `close` are terminal

use serde::{Deserialize, Serialize};

use crate::codec;

/// Input audio sample rate expected by the agent (mono PCM16)
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Output audio sample rate produced by the agent (mono PCM16)
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

// ============================================================================
// Client Messages (sent TO the agent)
// ============================================================================

/// Messages sent from the client to the agent
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// A captured microphone frame
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        /// Base64-encoded PCM16 mono audio at 16kHz
        audio: String,
    },

    /// Acknowledgement for a received tool call
    #[serde(rename = "tool_result")]
    ToolResult {
        /// Identifier of the tool call being acked
        request_id: String,
        /// "ok" or "error"
        status: String,
        /// Result detail (staged summary on ok, reason on error)
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },

    /// Terminate the session
    #[serde(rename = "close")]
    Close,
}

impl ClientMessage {
    /// Build an audio chunk message from raw float samples
    pub fn audio_chunk(samples: &[f32]) -> Self {
        Self::AudioChunk {
            audio: codec::to_transport_text(&codec::encode_pcm16(samples)),
        }
    }
}

// ============================================================================
// Server Messages (received FROM the agent)
// ============================================================================

/// Messages received from the agent
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Incremental speech-to-text of the user's microphone audio
    #[serde(rename = "input_transcript_fragment")]
    InputTranscriptFragment { text: String },

    /// Incremental transcript of the agent's spoken reply
    #[serde(rename = "output_transcript_fragment")]
    OutputTranscriptFragment { text: String },

    /// End of the current conversational exchange
    #[serde(rename = "turn_complete")]
    TurnComplete,

    /// A chunk of synthesized speech
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        /// Base64-encoded PCM16 mono audio at 24kHz
        audio: String,
    },

    /// Request to stage an expense transaction
    #[serde(rename = "tool_call_request")]
    ToolCallRequest(ToolCallRequest),

    /// Terminal error from the agent
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },

    /// Remote-initiated close
    #[serde(rename = "close")]
    Close,

    /// Catch-all for message types we don't handle.
    /// Prevents deserialization failures for unknown types.
    #[serde(other)]
    Unknown,
}

/// Structured "record a transaction" request from the agent
///
/// Validated at the deserialization boundary by the tool call handler;
/// loosely-typed fields never reach the staging logic.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallRequest {
    /// Identifier the ack must reference
    pub request_id: String,
    /// Free-text description of the expense
    #[serde(default)]
    pub description: String,
    /// Transaction amount; must be positive to be staged
    #[serde(default)]
    pub amount: f64,
    /// Optional free-text budget category name
    #[serde(default)]
    pub category: Option<String>,
}
