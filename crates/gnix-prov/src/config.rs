//! Provider configuration

use gnix_core::env::{env_get, env_get_opt};
use gnix_core::freelist::FreelistConfig;

/// Largest VC table a NIC may grow to (ids are `u32`, `u32::MAX` is NONE)
pub const MAX_VCS_LIMIT: usize = u32::MAX as usize - 1;

/// Configuration shared by every object opened against a fabric
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// VC freelist sizing per NIC
    pub vc_freelist: FreelistConfig,

    /// Event record freelist sizing per EQ (an explicit `EqAttr::size`
    /// overrides `init_size`)
    pub eq_freelist: FreelistConfig,

    /// Messages a short-message mailbox holds before senders must retry
    pub mbox_msgs: usize,

    /// Live VCs per NIC
    pub max_vcs: usize,

    /// Wire events handled per `progress()` call
    pub progress_batch: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            vc_freelist: FreelistConfig::new(64, 16, 2, 256),
            eq_freelist: FreelistConfig::default(),
            mbox_msgs: 16,
            max_vcs: 65536,
            progress_batch: 256,
        }
    }
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `GNIX_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_env_prefixed("GNIX_")
    }

    /// Defaults overridden by `<prefix>MBOX_MSGS`, `<prefix>VC_FL_INIT`
    /// and the other keys read by `from_env`.
    pub fn from_env_prefixed(prefix: &str) -> Self {
        let key = |name: &str| format!("{}{}", prefix, name);
        let d = Self::default();
        let vc_freelist = FreelistConfig::new(
            env_get(&key("VC_FL_INIT"), d.vc_freelist.init_size),
            env_get(&key("VC_FL_REFILL"), d.vc_freelist.refill_size),
            env_get(&key("VC_FL_GROWTH"), d.vc_freelist.growth_factor),
            env_get(&key("VC_FL_MAX_REFILL"), d.vc_freelist.max_refill_size),
        );
        let mut eq_freelist = d.eq_freelist;
        if let Some(n) = env_get_opt(&key("EQ_FL_INIT")) {
            eq_freelist.init_size = n;
        }
        Self {
            vc_freelist,
            eq_freelist,
            mbox_msgs: env_get(&key("MBOX_MSGS"), d.mbox_msgs),
            max_vcs: env_get(&key("MAX_VCS"), d.max_vcs),
            progress_batch: env_get(&key("PROGRESS_BATCH"), d.progress_batch),
        }
    }

    pub fn vc_freelist(mut self, cfg: FreelistConfig) -> Self {
        self.vc_freelist = cfg;
        self
    }

    pub fn eq_freelist(mut self, cfg: FreelistConfig) -> Self {
        self.eq_freelist = cfg;
        self
    }

    pub fn mbox_msgs(mut self, n: usize) -> Self {
        self.mbox_msgs = n;
        self
    }

    pub fn max_vcs(mut self, n: usize) -> Self {
        self.max_vcs = n;
        self
    }

    pub fn progress_batch(mut self, n: usize) -> Self {
        self.progress_batch = n;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.mbox_msgs == 0 {
            return Err("mbox_msgs must be at least 1");
        }
        if self.max_vcs == 0 {
            return Err("max_vcs must be at least 1");
        }
        if self.max_vcs > MAX_VCS_LIMIT {
            return Err("max_vcs exceeds the VC id space");
        }
        if self.progress_batch == 0 {
            return Err("progress_batch must be at least 1");
        }
        Ok(())
    }
}
