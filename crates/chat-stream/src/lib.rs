//! Streaming chat client for questions about a JSON document.
//!
//! The service answers with a chunked stream of `data:` events. Decoding is
//! deliberately lenient: partial and malformed events are skipped so the
//! running answer can be shown while it arrives.

mod client;
mod decoder;
mod event;
pub mod sanitize;

pub use client::{
    ChatBackend, ChatClient, ChatClientConfig, ChatRequest, DEFAULT_BASE_URL, DEFAULT_USER,
};
pub use decoder::{ChatReply, StreamDecoder, StreamObserver, decode_stream};
pub use event::{DATA_PREFIX, EventError, EventKind, StreamEvent};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat service returned status {status}")]
    Transport { status: u16, body: String },
    #[error("chat request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("reading chat stream: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),
}
