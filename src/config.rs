//! Explicit, constructible configuration (spec §6; design notes §9 replaces
//! a "global configuration singleton" with an explicit value).
//!
//! Grounded in how `modules/ar/src/main.rs` builds its own config —
//! it reads `std::env::var` by hand into plain locals,
//! no config crate. This crate stays one step more structured than that
//! (a builder over a typed struct) but does not add an env-loading layer of
//! its own: that remains the host's job, per the Non-goal in spec.md §1.

use std::time::Duration;

/// How the consumer reads from the stream. Only `Pull` is implemented;
/// `Push` is accepted as a configuration value (spec §6 names both) but
/// rejected at `subscribe` time with a [`crate::error::BridgeError::Configuration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    Pull,
    Push,
}

/// Governs whether the connection manager auto-starts at process boot
/// (design notes §9 — replaces sniffing the process name with an explicit
/// enum driven by env flags the host reads itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStartPolicy {
    Always,
    Never,
    SkipIfInteractive,
}

/// The default backoff schedule: `1s,5s,15s,30s,60s` (spec §4.2).
pub fn default_backoff() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(5),
        Duration::from_secs(15),
        Duration::from_secs(30),
        Duration::from_secs(60),
    ]
}

/// Explicit configuration for one bridge instance, built with a fluent
/// builder rather than read from the environment by this crate.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub nats_urls: Vec<String>,
    pub env: String,
    pub app_name: String,
    pub destination_app: String,
    pub max_deliver: u32,
    pub ack_wait: Duration,
    pub backoff: Vec<Duration>,
    pub use_outbox: bool,
    pub use_inbox: bool,
    pub use_dlq: bool,
    pub consumer_mode: ConsumerMode,
    pub lazy_connect: bool,
    pub disable_js_api: bool,
    pub auto_start: AutoStartPolicy,
    pub batch_size: usize,
    pub fetch_timeout: Duration,
    pub dispatcher_poll_interval: Duration,
    pub dispatcher_batch_size: usize,
}

impl BridgeConfig {
    /// A new config with every spec §6 default: `max_deliver=5`,
    /// `ack_wait=30s`, `backoff=[1s,5s,15s,30s,60s]`, outbox/inbox/dlq
    /// disabled, pull consumer, eager connect, topology reconcile enabled.
    pub fn new(app_name: impl Into<String>, destination_app: impl Into<String>) -> Self {
        Self {
            nats_urls: vec!["nats://localhost:4222".to_string()],
            env: "dev".to_string(),
            app_name: app_name.into(),
            destination_app: destination_app.into(),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            backoff: default_backoff(),
            use_outbox: false,
            use_inbox: false,
            use_dlq: false,
            consumer_mode: ConsumerMode::Pull,
            lazy_connect: false,
            disable_js_api: false,
            auto_start: AutoStartPolicy::Always,
            batch_size: 10,
            fetch_timeout: Duration::from_secs(5),
            dispatcher_poll_interval: Duration::from_secs(1),
            dispatcher_batch_size: 25,
        }
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    pub fn with_nats_urls(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.nats_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_outbox(mut self, enabled: bool) -> Self {
        self.use_outbox = enabled;
        self
    }

    pub fn with_inbox(mut self, enabled: bool) -> Self {
        self.use_inbox = enabled;
        self
    }

    pub fn with_dlq(mut self, enabled: bool) -> Self {
        self.use_dlq = enabled;
        self
    }

    pub fn with_consumer_mode(mut self, mode: ConsumerMode) -> Self {
        self.consumer_mode = mode;
        self
    }

    pub fn with_lazy_connect(mut self, enabled: bool) -> Self {
        self.lazy_connect = enabled;
        self
    }

    pub fn with_disable_js_api(mut self, disabled: bool) -> Self {
        self.disable_js_api = disabled;
        self
    }

    pub fn with_auto_start(mut self, policy: AutoStartPolicy) -> Self {
        self.auto_start = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// The stream name this config's `env` derives: `<env>-jetstream-bridge-stream`.
    pub fn stream_name(&self) -> String {
        crate::subject::stream_name(&self.env)
    }

    /// The subject this app publishes to: `<app_name>.sync.<destination_app>`.
    pub fn publish_subject(&self) -> String {
        crate::subject::sync_subject(&self.app_name, &self.destination_app)
    }

    /// The subject this app consumes from: `<destination_app>.sync.<app_name>`.
    pub fn consume_subject(&self) -> String {
        crate::subject::sync_subject(&self.destination_app, &self.app_name)
    }
}

/// Resolve an [`AutoStartPolicy`] against the two boot-time env flags spec
/// §6 names. The host reads the raw env vars and passes their presence in;
/// this crate never calls `std::env::var` itself.
pub fn resolve_auto_start(policy: AutoStartPolicy, disable_autostart: bool, force_autostart: bool) -> bool {
    if force_autostart {
        return true;
    }
    match policy {
        AutoStartPolicy::Always => !disable_autostart,
        AutoStartPolicy::Never => false,
        AutoStartPolicy::SkipIfInteractive => !disable_autostart,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = BridgeConfig::new("api", "worker");
        assert_eq!(cfg.max_deliver, 5);
        assert_eq!(cfg.ack_wait, Duration::from_secs(30));
        assert_eq!(cfg.backoff.len(), 5);
        assert!(!cfg.use_outbox);
        assert!(!cfg.use_inbox);
        assert!(!cfg.use_dlq);
        assert_eq!(cfg.consumer_mode, ConsumerMode::Pull);
    }

    #[test]
    fn subjects_derive_from_app_names() {
        let cfg = BridgeConfig::new("api", "worker");
        assert_eq!(cfg.publish_subject(), "api.sync.worker");
        assert_eq!(cfg.consume_subject(), "worker.sync.api");
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = BridgeConfig::new("api", "worker")
            .with_outbox(true)
            .with_inbox(true)
            .with_max_deliver(3);
        assert!(cfg.use_outbox);
        assert!(cfg.use_inbox);
        assert_eq!(cfg.max_deliver, 3);
    }

    #[test]
    fn force_autostart_overrides_disable() {
        assert!(resolve_auto_start(AutoStartPolicy::Never, true, true));
        assert!(!resolve_auto_start(AutoStartPolicy::Never, false, false));
        assert!(!resolve_auto_start(AutoStartPolicy::Always, true, false));
    }
}
