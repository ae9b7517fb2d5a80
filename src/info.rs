//! Stream descriptors: usage, focus type, app identity and device info.

use std::fmt;

/// Data direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Application produces, server consumes.
    Playback,
    /// Server produces, application consumes.
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Playback => f.write_str("playback"),
            Self::Capture => f.write_str("capture"),
        }
    }
}

/// What kind of content a renderer plays.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentType {
    #[default]
    Unknown,
    Speech,
    Music,
    Movie,
    Sonification,
    Ringtone,
}

/// What a renderer's audio is used for.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamUsage {
    #[default]
    Unknown,
    Media,
    VoiceCommunication,
    VoiceAssistant,
    Alarm,
    Notification,
    NotificationRingtone,
    Game,
    Navigation,
    VoiceModemCommunication,
}

/// Where a capturer records from.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SourceType {
    #[default]
    Invalid,
    Mic,
    VoiceRecognition,
    VoiceCommunication,
    VoiceModemCommunication,
    Ultrasonic,
}

/// Audio-focus class of a stream, derived from its usage.
///
/// [`StreamType::Default`] means no class could be derived; such a stream
/// cannot be started.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamType {
    #[default]
    Default,
    Music,
    VoiceCall,
    VoiceAssistant,
    Ring,
    Alarm,
    Notification,
    Movie,
    Speech,
    Game,
    Navigation,
    Recording,
    Ultrasonic,
    VoiceModemCommunication,
}

impl StreamType {
    /// Returns `true` for a focus class a stream can be started with.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::Default
    }
}

/// Maps a renderer's `(content, usage)` pair to its focus class.
///
/// Unmapped pairs yield [`StreamType::Default`].
#[must_use]
pub fn stream_type_for(content: ContentType, usage: StreamUsage) -> StreamType {
    use ContentType as C;
    use StreamUsage as U;

    match (content, usage) {
        (_, U::VoiceModemCommunication) => StreamType::VoiceModemCommunication,
        (C::Speech | C::Unknown, U::VoiceCommunication) => StreamType::VoiceCall,
        (_, U::VoiceAssistant) => StreamType::VoiceAssistant,
        (_, U::Alarm) => StreamType::Alarm,
        (_, U::NotificationRingtone) | (C::Ringtone, _) => StreamType::Ring,
        (_, U::Notification) | (C::Sonification, U::Unknown) => StreamType::Notification,
        (_, U::Game) => StreamType::Game,
        (_, U::Navigation) => StreamType::Navigation,
        (C::Movie, U::Media | U::Unknown) => StreamType::Movie,
        (C::Speech, U::Media | U::Unknown) => StreamType::Speech,
        (C::Music | C::Unknown, U::Media) | (C::Music, U::Unknown) => StreamType::Music,
        _ => StreamType::Default,
    }
}

/// Maps a capturer's source to its focus class.
#[must_use]
pub fn stream_type_for_source(source: SourceType) -> StreamType {
    match source {
        SourceType::Mic | SourceType::VoiceRecognition => StreamType::Recording,
        SourceType::VoiceCommunication => StreamType::VoiceCall,
        SourceType::VoiceModemCommunication => StreamType::VoiceModemCommunication,
        SourceType::Ultrasonic => StreamType::Ultrasonic,
        SourceType::Invalid => StreamType::Default,
    }
}

/// Describes a renderer to the policy service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RendererInfo {
    /// Content type.
    pub content: ContentType,
    /// Usage.
    pub usage: StreamUsage,
    /// Request the low-latency process transport.
    pub low_latency: bool,
}

impl RendererInfo {
    /// Creates renderer info for a content/usage pair.
    pub fn new(content: ContentType, usage: StreamUsage) -> Self {
        Self {
            content,
            usage,
            low_latency: false,
        }
    }

    /// Music played as media.
    pub fn music() -> Self {
        Self::new(ContentType::Music, StreamUsage::Media)
    }

    /// Requests the low-latency transport.
    #[must_use]
    pub fn with_low_latency(mut self, low_latency: bool) -> Self {
        self.low_latency = low_latency;
        self
    }

    /// Focus class of this renderer.
    #[must_use]
    pub fn stream_type(&self) -> StreamType {
        stream_type_for(self.content, self.usage)
    }
}

/// Describes a capturer to the policy service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapturerInfo {
    /// Recording source.
    pub source: SourceType,
    /// Request the low-latency process transport.
    pub low_latency: bool,
}

impl CapturerInfo {
    /// Creates capturer info for a source.
    pub fn new(source: SourceType) -> Self {
        Self {
            source,
            low_latency: false,
        }
    }

    /// Requests the low-latency transport.
    #[must_use]
    pub fn with_low_latency(mut self, low_latency: bool) -> Self {
        self.low_latency = low_latency;
        self
    }

    /// Focus class of this capturer.
    #[must_use]
    pub fn stream_type(&self) -> StreamType {
        stream_type_for_source(self.source)
    }
}

/// Renderer or capturer description, whichever the stream is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInfo {
    /// A renderer.
    Renderer(RendererInfo),
    /// A capturer.
    Capturer(CapturerInfo),
}

impl StreamInfo {
    /// Data direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::Renderer(_) => Direction::Playback,
            Self::Capturer(_) => Direction::Capture,
        }
    }

    /// Focus class.
    #[must_use]
    pub fn stream_type(&self) -> StreamType {
        match self {
            Self::Renderer(info) => info.stream_type(),
            Self::Capturer(info) => info.stream_type(),
        }
    }

    /// Whether the low-latency transport was requested.
    #[must_use]
    pub fn low_latency(&self) -> bool {
        match self {
            Self::Renderer(info) => info.low_latency,
            Self::Capturer(info) => info.low_latency,
        }
    }

    /// Voice-modem streams bypass focus arbitration.
    #[must_use]
    pub fn is_voice_modem(&self) -> bool {
        self.stream_type() == StreamType::VoiceModemCommunication
    }
}

/// Identity of the application owning a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppInfo {
    /// Process id.
    pub pid: u32,
    /// User id.
    pub uid: u32,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            pid: std::process::id(),
            uid: 0,
        }
    }
}

/// Whether other apps may capture this stream's output.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivacyType {
    #[default]
    Public,
    Private,
}

/// How a stream's focus interacts with other streams of the same app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMode {
    /// Streams of one app share a focus record.
    #[default]
    Share,
    /// Every stream negotiates focus on its own.
    Independent,
}

/// Audio effect processing requested from the server.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EffectMode {
    None,
    #[default]
    Default,
}

/// How buffers are exchanged with the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    /// The application calls blocking `write`/`read`.
    #[default]
    Normal,
    /// The stream's callback thread asks the application to fill or drain
    /// buffer-queue spans.
    Callback,
}

/// Playback speed relative to the stream's sample rate.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderRate {
    #[default]
    Normal,
    Double,
    Half,
}

impl RenderRate {
    /// Rate, in Hz, the server consumes a stream of `base` Hz at.
    #[must_use]
    pub fn apply(self, base: u32) -> u32 {
        match self {
            Self::Normal => base,
            Self::Double => base.saturating_mul(2),
            Self::Half => base / 2,
        }
    }
}

impl fmt::Display for RenderRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("1x"),
            Self::Double => f.write_str("2x"),
            Self::Half => f.write_str("0.5x"),
        }
    }
}

/// Kind of audio endpoint.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    #[default]
    Speaker,
    WiredHeadset,
    BluetoothA2dp,
    UsbHeadset,
    Mic,
}

/// An audio endpoint reported by the policy service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    /// Device id.
    pub id: u32,
    /// Human-readable name.
    pub name: String,
    /// Kind of device.
    pub device_type: DeviceType,
}

impl DeviceInfo {
    /// Creates device info.
    pub fn new(id: u32, name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id,
            name: name.into(),
            device_type,
        }
    }
}
