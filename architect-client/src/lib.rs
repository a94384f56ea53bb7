//! Stream consumer for the architect generation API
//!
//! Opens `POST /api/architecture/generate`, decodes its `data:` frames
//! incrementally and publishes a [`GenerationState`] snapshot after every
//! event through a `tokio::sync::watch` channel.

pub mod consumer;
pub mod decoder;
pub mod state;

pub use consumer::StreamConsumer;
pub use decoder::{DecodeError, Frame, FrameDecoder};
pub use state::{ClientError, GenerationState, Phase};
