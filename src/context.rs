//! The collaborators every stream is built against.

use std::fmt;
use std::sync::Arc;

use crate::config::StreamConfig;
use crate::policy::PolicyService;
use crate::server::AudioServer;

/// Audio server, policy service and configuration shared by the streams an
/// application creates.
///
/// Cloning is cheap; clones share the same server and policy service.
///
/// # Example
///
/// ```
/// use audio_stream_client::policy::MockPolicy;
/// use audio_stream_client::server::LoopbackServer;
/// use audio_stream_client::AudioContext;
///
/// let ctx = AudioContext::new(LoopbackServer::new(), MockPolicy::new());
/// assert_eq!(ctx.config().stall_limit, 60);
/// ```
#[derive(Clone)]
pub struct AudioContext {
    server: Arc<dyn AudioServer>,
    policy: Arc<dyn PolicyService>,
    config: StreamConfig,
}

impl AudioContext {
    /// Creates a context with the default [`StreamConfig`].
    pub fn new(server: impl AudioServer + 'static, policy: impl PolicyService + 'static) -> Self {
        Self::from_shared(Arc::new(server), Arc::new(policy))
    }

    /// Creates a context from already shared collaborators.
    pub fn from_shared(server: Arc<dyn AudioServer>, policy: Arc<dyn PolicyService>) -> Self {
        Self {
            server,
            policy,
            config: StreamConfig::default(),
        }
    }

    /// Replaces the configuration used by streams created from now on.
    #[must_use]
    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// The audio server.
    pub fn server(&self) -> &Arc<dyn AudioServer> {
        &self.server
    }

    /// The policy service.
    pub fn policy(&self) -> &Arc<dyn PolicyService> {
        &self.policy
    }

    /// Stream configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioContext")
            .field("low_latency", &self.server.supports_low_latency())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
