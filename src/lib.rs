//! # audio-stream-client
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Client-side core of an audio streaming stack: renderer and capturer
//! streams with a strict lifecycle, buffer-queue exchange with the
//! application, low-latency scheduling and audio-focus handling.
//!
//! `audio-stream-client` sits between an application and two collaborators
//! it is handed through an [`AudioContext`]: an audio server (see
//! [`server`]) that moves PCM, and a policy service (see [`policy`]) that
//! arbitrates audio focus between all clients.
//!
//! ## Quick Start
//!
//! ```rust
//! use audio_stream_client::policy::MockPolicy;
//! use audio_stream_client::server::LoopbackServer;
//! use audio_stream_client::{AudioContext, AudioStreamParams, Renderer, RendererInfo};
//!
//! let ctx = AudioContext::new(LoopbackServer::new(), MockPolicy::new());
//!
//! let renderer = Renderer::builder(&ctx)
//!     .info(RendererInfo::music())
//!     .params(AudioStreamParams::cd_quality())     // 48kHz stereo S16LE
//!     .on_event(|e| tracing::warn!(?e, "stream event"))
//!     .build()?;
//!
//! renderer.start()?;
//! renderer.write(&vec![0u8; 3840])?;
//! renderer.stop()?;
//! renderer.release()?;
//! # Ok::<(), audio_stream_client::StreamError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Control path**: lifecycle calls from any application thread,
//!   serialized on one control lock per stream
//! - **Transport**: either the blocking streaming protocol or the
//!   low-latency process ring, switchable while the stream lives
//! - **Callback thread**: one per stream in callback mode or on the process
//!   transport, sleeping until the next predicted span deadline
//!
//! Interrupts and service-death notifications arrive on policy-service
//! threads and only hold weak references to the stream.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod buffer;
mod builder;
mod capturer;
mod config;
mod context;
mod error;
mod event;
pub mod format;
mod info;
mod interrupt;
pub mod policy;
mod recovery;
mod renderer;
pub mod server;
mod session;
mod state;
mod stream;
mod timing;
mod transport;

pub use buffer::{BufferDesc, BufferQueue, BufferQueueState, EnqueueError, QueueRole, SpanStatus};
pub use builder::{CapturerBuilder, RendererBuilder};
pub use capturer::Capturer;
pub use config::{RecoveryConfig, StreamConfig, TimingConfig};
pub use context::AudioContext;
pub use error::{ErrorKind, PolicyError, ServerError, StreamError};
pub use event::{
    data_callback, event_callback, event_channel, position_callback, DataCallback, EventCallback,
    FirstFrameCallback, PositionCallback, StreamEvent,
};
pub use format::{AudioStreamParams, SampleFormat};
pub use info::{
    stream_type_for, stream_type_for_source, AppInfo, CapturerInfo, ContentType, DeviceInfo,
    DeviceType, Direction, EffectMode, InterruptMode, PrivacyType, RenderMode, RenderRate,
    RendererInfo, SourceType, StreamInfo, StreamType, StreamUsage,
};
pub use renderer::Renderer;
pub use session::{SessionId, SessionStats};
pub use state::{ChangeSource, StateCommand, StreamState};
pub use stream::AudioTimestamp;
pub use timing::{ClockTime, LinearPosTimeModel, PositionRegression, PositionTracker, WakeScheduler};
pub use transport::{ProcessBuffer, ProcessStatus, SpanStamp, TransportClass};
