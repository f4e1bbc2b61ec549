//! Configuration records
//!
//! All options are plain `Clone` records with chainable setters. They are
//! captured by value when an operation starts, so mutating an options value
//! held by the caller never affects an operation already in flight. The
//! reconnect machinery relies on this: the records captured at open time are
//! replayed verbatim when topology is re-created.

use std::time::Duration;

use fe2o3_amqp_types::definitions::{Fields, ReceiverSettleMode, SenderSettleMode};
use fe2o3_amqp_types::messaging::{TerminusDurability, TerminusExpiryPolicy};
use fe2o3_amqp_types::primitives::Symbol;

use crate::connection::ReconnectOptions;
use crate::sasl_profile::SaslProfile;

/// Default maximum frame size proposed in Open
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 65_536;

/// Default session window, in transfer frames
pub const DEFAULT_SESSION_WINDOW: u32 = 2_048;

/// Default receiver credit window
pub const DEFAULT_CREDIT_WINDOW: u32 = 10;

/// Connection-level configuration
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub(crate) virtual_host: Option<String>,
    pub(crate) max_frame_size: u32,
    pub(crate) channel_max: u16,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) offered_capabilities: Vec<Symbol>,
    pub(crate) desired_capabilities: Vec<Symbol>,
    pub(crate) properties: Option<Fields>,
    pub(crate) sasl: Option<SaslProfile>,
    pub(crate) open_timeout: Duration,
    pub(crate) close_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) send_timeout: Option<Duration>,
    pub(crate) reconnect: ReconnectOptions,
    pub(crate) alternate_hosts: Vec<(String, u16)>,
    #[cfg(feature = "rustls")]
    pub(crate) tls_config: Option<std::sync::Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            virtual_host: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: u16::MAX,
            idle_timeout: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
            sasl: None,
            open_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            send_timeout: None,
            reconnect: ReconnectOptions::default(),
            alternate_hosts: Vec::new(),
            #[cfg(feature = "rustls")]
            tls_config: None,
        }
    }
}

impl ConnectionOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual host sent as the Open hostname, overriding the dialed host
    pub fn virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.virtual_host = Some(vhost.into());
        self
    }

    /// Maximum frame size proposed in Open, clamped to the AMQP minimum
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        let min = fe2o3_amqp_types::definitions::MIN_MAX_FRAME_SIZE as u32;
        self.max_frame_size = max_frame_size.max(min);
        self
    }

    /// Highest channel number the client will use
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Idle timeout this peer enforces on remote silence. Half of it is
    /// advertised in Open, per the specification's guidance.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Adds an offered capability
    pub fn add_offered_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.offered_capabilities.push(capability.into());
        self
    }

    /// Adds a desired capability
    pub fn add_desired_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.desired_capabilities.push(capability.into());
        self
    }

    /// Connection properties sent in Open
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Enables the SASL layer with the given profile
    pub fn sasl_profile(mut self, profile: SaslProfile) -> Self {
        self.sasl = Some(profile);
        self
    }

    /// Timeout for the whole open sequence, including failover attempts
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Timeout for the close handshake
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Timeout for attach, detach, drain and disposition requests
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Timeout for a blocking send waiting on credit; `None` blocks
    /// indefinitely
    pub fn send_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.send_timeout = timeout.into();
        self
    }

    /// Reconnection policy
    pub fn reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Adds a failover endpoint tried after the primary host
    pub fn add_alternate_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.alternate_hosts.push((host.into(), port));
        self
    }

    /// TLS client configuration; dialing uses `amqps` when set
    #[cfg(feature = "rustls")]
    pub fn tls_config(
        mut self,
        config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>,
    ) -> Self {
        self.tls_config = Some(config);
        self
    }
}

/// Session-level configuration
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub(crate) incoming_window: u32,
    pub(crate) outgoing_window: u32,
    pub(crate) handle_max: u32,
    pub(crate) properties: Option<Fields>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            incoming_window: DEFAULT_SESSION_WINDOW,
            outgoing_window: DEFAULT_SESSION_WINDOW,
            handle_max: u32::MAX,
            properties: None,
        }
    }
}

impl SessionOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Incoming window in transfer frames
    pub fn incoming_window(mut self, window: u32) -> Self {
        self.incoming_window = window.max(1);
        self
    }

    /// Outgoing window in transfer frames
    pub fn outgoing_window(mut self, window: u32) -> Self {
        self.outgoing_window = window.max(1);
        self
    }

    /// Highest link handle usable in the session
    pub fn handle_max(mut self, handle_max: u32) -> Self {
        self.handle_max = handle_max;
        self
    }

    /// Session properties sent in Begin
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Sender-link configuration
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub(crate) name: Option<String>,
    pub(crate) snd_settle_mode: SenderSettleMode,
    pub(crate) rcv_settle_mode: ReceiverSettleMode,
    pub(crate) auto_settle: bool,
    pub(crate) source: SourceOptions,
    pub(crate) target: TargetOptions,
    pub(crate) offered_capabilities: Vec<Symbol>,
    pub(crate) desired_capabilities: Vec<Symbol>,
    pub(crate) properties: Option<Fields>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            name: None,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            auto_settle: true,
            source: SourceOptions::default(),
            target: TargetOptions::default(),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }
}

impl SenderOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit link name; defaults to a generated one
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sender settle mode. `Settled` makes every send fire-and-forget.
    pub fn sender_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.snd_settle_mode = mode;
        self
    }

    /// Receiver settle mode requested from the peer
    pub fn receiver_settle_mode(mut self, mode: ReceiverSettleMode) -> Self {
        self.rcv_settle_mode = mode;
        self
    }

    /// Whether trackers settle locally as soon as a terminal remote state
    /// arrives
    pub fn auto_settle(mut self, auto_settle: bool) -> Self {
        self.auto_settle = auto_settle;
        self
    }

    /// Source terminus options
    pub fn source(mut self, source: SourceOptions) -> Self {
        self.source = source;
        self
    }

    /// Target terminus options
    pub fn target(mut self, target: TargetOptions) -> Self {
        self.target = target;
        self
    }

    /// Link properties sent in Attach
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Adds an offered capability
    pub fn add_offered_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.offered_capabilities.push(capability.into());
        self
    }

    /// Adds a desired capability
    pub fn add_desired_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.desired_capabilities.push(capability.into());
        self
    }
}

/// Receiver-link configuration
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub(crate) name: Option<String>,
    pub(crate) snd_settle_mode: SenderSettleMode,
    pub(crate) rcv_settle_mode: ReceiverSettleMode,
    pub(crate) credit_window: u32,
    pub(crate) source: SourceOptions,
    pub(crate) target: TargetOptions,
    pub(crate) offered_capabilities: Vec<Symbol>,
    pub(crate) desired_capabilities: Vec<Symbol>,
    pub(crate) properties: Option<Fields>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            name: None,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            credit_window: DEFAULT_CREDIT_WINDOW,
            source: SourceOptions::default(),
            target: TargetOptions::default(),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }
}

impl ReceiverOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit link name; defaults to a generated one
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Credit the engine keeps outstanding automatically; 0 disables the
    /// window so that credit is managed manually with `add_credit`
    pub fn credit_window(mut self, window: u32) -> Self {
        self.credit_window = window;
        self
    }

    /// Sender settle mode requested from the peer
    pub fn sender_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.snd_settle_mode = mode;
        self
    }

    /// Receiver settle mode
    pub fn receiver_settle_mode(mut self, mode: ReceiverSettleMode) -> Self {
        self.rcv_settle_mode = mode;
        self
    }

    /// Source terminus options
    pub fn source(mut self, source: SourceOptions) -> Self {
        self.source = source;
        self
    }

    /// Target terminus options
    pub fn target(mut self, target: TargetOptions) -> Self {
        self.target = target;
        self
    }

    /// Link properties sent in Attach
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Adds an offered capability
    pub fn add_offered_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.offered_capabilities.push(capability.into());
        self
    }

    /// Adds a desired capability
    pub fn add_desired_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.desired_capabilities.push(capability.into());
        self
    }
}

/// Source terminus configuration
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub(crate) durability: TerminusDurability,
    pub(crate) expiry_policy: TerminusExpiryPolicy,
    pub(crate) dynamic: bool,
    pub(crate) capabilities: Vec<Symbol>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            durability: TerminusDurability::None,
            expiry_policy: TerminusExpiryPolicy::SessionEnd,
            dynamic: false,
            capabilities: Vec::new(),
        }
    }
}

impl SourceOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminus durability
    pub fn durability(mut self, durability: TerminusDurability) -> Self {
        self.durability = durability;
        self
    }

    /// Terminus expiry policy
    pub fn expiry_policy(mut self, policy: TerminusExpiryPolicy) -> Self {
        self.expiry_policy = policy;
        self
    }

    /// Requests a dynamic node: the remote allocates the address and reports
    /// it back on Attach
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Adds a node capability
    pub fn add_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}

/// Target terminus configuration
#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub(crate) durability: TerminusDurability,
    pub(crate) expiry_policy: TerminusExpiryPolicy,
    pub(crate) dynamic: bool,
    pub(crate) capabilities: Vec<Symbol>,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            durability: TerminusDurability::None,
            expiry_policy: TerminusExpiryPolicy::SessionEnd,
            dynamic: false,
            capabilities: Vec::new(),
        }
    }
}

impl TargetOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminus durability
    pub fn durability(mut self, durability: TerminusDurability) -> Self {
        self.durability = durability;
        self
    }

    /// Terminus expiry policy
    pub fn expiry_policy(mut self, policy: TerminusExpiryPolicy) -> Self {
        self.expiry_policy = policy;
        self
    }

    /// Requests a dynamic node
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Adds a node capability
    pub fn add_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}
