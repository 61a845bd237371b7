//! Service configuration.
//!
//! A [`ServiceConfig`] is snapshotted into every call actor when it is
//! spawned; changing the configuration afterwards only affects new calls.

use std::time::Duration;

use uuid::Uuid;

/// Behaviours a service can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plugin {
    /// RFC 5626 flow handling: flow-token routes, Path synthesis, `ob`
    /// contacts.
    Outbound,
    /// REGISTER handling backed by the binding store.
    Registrar,
}

/// Per-service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service name; keys the router and the nonce table.
    pub name: String,
    /// Timeout for synchronous work submitted through the router.
    pub sync_call_time: Duration,
    /// Hard cap on concurrent call actors.
    pub max_calls: usize,
    /// Shard count of the (service, call-id) router, clamped to 1..=127.
    pub msg_routers: usize,
    /// RFC 3261 T1 (retransmission base).
    pub timer_t1: Duration,
    /// RFC 3261 T2 (retransmission cap for non-INVITE).
    pub timer_t2: Duration,
    /// RFC 3261 T4 (network clearing time).
    pub timer_t4: Duration,
    /// Proxy Timer C (INVITE with no final response).
    pub timer_c: Duration,
    /// Suppress the automatic 100 Trying on INVITE.
    pub no_100: bool,
    /// Digest nonce lifetime.
    pub nonce_timeout: Duration,
    /// Listener specifications (`<sip:all:PORT;transport=TRANSP>`), handed
    /// verbatim to the transport layer.
    pub listen: Vec<String>,
    /// Transaction sweep horizon: `check_call` drops transactions and forks
    /// older than twice this.
    pub trans_timeout: Duration,
    /// Dialog sweep horizon: dialogs untouched for twice this are dropped.
    pub dialog_timeout: Duration,
    /// Enabled behaviours.
    pub plugins: Vec<Plugin>,
    /// Option tags advertised in Supported.
    pub supported: Vec<String>,
    /// Default From for locally originated requests.
    pub from_user: String,
    /// `reg-id` for outbound REGISTERs originated by this instance.
    pub reg_id: Option<u32>,
    /// `+sip.instance` UUID of this UA instance.
    pub instance_id: String,
    /// Random id distinguishing this stack instance; feeds `NkQ` tokens.
    pub global_id: String,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ServiceConfig {
            name: name.into(),
            sync_call_time: Duration::from_secs(30),
            max_calls: 100_000,
            msg_routers: 16,
            timer_t1: Duration::from_millis(500),
            timer_t2: Duration::from_secs(4),
            timer_t4: Duration::from_secs(5),
            timer_c: Duration::from_secs(180),
            no_100: false,
            nonce_timeout: Duration::from_secs(30),
            listen: Vec::new(),
            trans_timeout: Duration::from_secs(900),
            dialog_timeout: Duration::from_secs(1800),
            plugins: Vec::new(),
            supported: vec!["outbound".to_string(), "path".to_string()],
            from_user: "sipflow".to_string(),
            reg_id: None,
            instance_id: format!("urn:uuid:{}", Uuid::new_v4()),
            global_id: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn with_t1(mut self, t1: Duration) -> Self {
        self.timer_t1 = t1;
        self
    }

    pub fn with_timer_c(mut self, c: Duration) -> Self {
        self.timer_c = c;
        self
    }

    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        if !self.plugins.contains(&plugin) {
            self.plugins.push(plugin);
        }
        self
    }

    pub fn with_from_user(mut self, user: impl Into<String>) -> Self {
        self.from_user = user.into();
        self
    }

    pub fn with_supported(mut self, tokens: &[&str]) -> Self {
        self.supported = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_reg_id(mut self, reg_id: u32) -> Self {
        self.reg_id = Some(reg_id);
        self
    }

    pub fn has_plugin(&self, plugin: Plugin) -> bool {
        self.plugins.contains(&plugin)
    }

    pub fn supports(&self, token: &str) -> bool {
        self.supported.iter().any(|t| t.eq_ignore_ascii_case(token))
    }

    /// INVITE/non-INVITE transaction timeout: 64·T1.
    pub fn timeout_64t1(&self) -> Duration {
        self.timer_t1 * 64
    }

    pub(crate) fn router_shards(&self) -> usize {
        self.msg_routers.clamp(1, 127)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_rfc_values() {
        let cfg = ServiceConfig::new("svc");
        assert_eq!(cfg.timer_t1, Duration::from_millis(500));
        assert_eq!(cfg.timer_t2, Duration::from_secs(4));
        assert_eq!(cfg.timeout_64t1(), Duration::from_secs(32));
        assert!(cfg.supports("outbound"));
    }

    #[test]
    fn shard_count_is_clamped() {
        let mut cfg = ServiceConfig::new("svc");
        cfg.msg_routers = 0;
        assert_eq!(cfg.router_shards(), 1);
        cfg.msg_routers = 4096;
        assert_eq!(cfg.router_shards(), 127);
    }
}
