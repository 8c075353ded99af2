//! Fabric: the top-level provider object
//!
//! Owns the configuration, the connection wire and the job services shared
//! by every EQ and NIC opened against it. Each of those holds a
//! `FabricRef`; the fabric cannot be closed while any is alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gnix_core::error::{CloseError, FabricError, FabricResult};
use gnix_core::id::Fid;
use gnix_core::kprint::Subsys;
use gnix_core::{gnix_debug, gnix_info, gnix_warn};

use crate::config::ProviderConfig;
use crate::job::{EnvJobServices, JobServices, RdmaCredentials};
use crate::wire::{LoopbackWire, Wire};

pub(crate) struct FabricCore {
    fid: Fid,
    name: String,
    ref_cnt: AtomicUsize,
    config: ProviderConfig,
    wire: Arc<dyn Wire>,
    job: Arc<dyn JobServices>,
    credentials: Option<RdmaCredentials>,
    pes_on_node: u32,
    nics_per_rank: u32,
}

/// Open fabric handle
pub struct Fabric {
    core: Arc<FabricCore>,
}

impl Fabric {
    /// Open a fabric over the in-process loopback wire.
    pub fn open(name: &str, config: ProviderConfig) -> FabricResult<Fabric> {
        Self::open_with(name, config, Arc::new(LoopbackWire::new()), Arc::new(EnvJobServices::new()))
    }

    pub fn open_with(
        name: &str,
        config: ProviderConfig,
        wire: Arc<dyn Wire>,
        job: Arc<dyn JobServices>,
    ) -> FabricResult<Fabric> {
        if let Err(msg) = config.validate() {
            gnix_warn!(Subsys::Fabric, "invalid config: {}", msg);
            return Err(FabricError::InvalidArgument);
        }

        // Outside a managed job there are no credentials; that only
        // matters to a hardware wire.
        let credentials = match job.rdma_credentials() {
            Ok(c) => Some(c),
            Err(e) => {
                gnix_info!(Subsys::Fabric, "no rdma credentials: {}", e);
                None
            }
        };
        let pes_on_node = job.pes_on_node()?;
        let nics_per_rank = job.nics_per_rank()?;

        let core = FabricCore {
            fid: Fid::next(),
            name: name.to_owned(),
            ref_cnt: AtomicUsize::new(0),
            config,
            wire,
            job,
            credentials,
            pes_on_node,
            nics_per_rank,
        };
        gnix_debug!(
            Subsys::Fabric,
            "open {} fid={} pes_on_node={} nics_per_rank={}",
            core.name,
            core.fid.0,
            pes_on_node,
            nics_per_rank
        );
        Ok(Fabric { core: Arc::new(core) })
    }

    pub fn fid(&self) -> Fid {
        self.core.fid
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.core.config
    }

    pub fn wire(&self) -> &Arc<dyn Wire> {
        &self.core.wire
    }

    pub fn job(&self) -> &Arc<dyn JobServices> {
        &self.core.job
    }

    pub fn credentials(&self) -> Option<RdmaCredentials> {
        self.core.credentials
    }

    pub fn pes_on_node(&self) -> u32 {
        self.core.pes_on_node
    }

    pub fn nics_per_rank(&self) -> u32 {
        self.core.nics_per_rank
    }

    /// Objects currently holding the fabric open
    pub fn ref_count(&self) -> usize {
        self.core.ref_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn reference(&self) -> FabricRef {
        FabricRef::new(&self.core)
    }

    /// Close the fabric. Fails `Busy`, handing the fabric back, while any
    /// EQ or NIC still references it.
    pub fn close(self) -> Result<(), CloseError<Fabric>> {
        let refs = self.ref_count();
        if refs != 0 {
            gnix_warn!(Subsys::Fabric, "close {}: {} references remain", self.core.name, refs);
            return Err(CloseError::new(self, FabricError::Busy));
        }
        self.core.job.cleanup();
        gnix_debug!(Subsys::Fabric, "close {}", self.core.name);
        Ok(())
    }
}

/// Counted reference to a fabric, released on drop
pub(crate) struct FabricRef {
    core: Arc<FabricCore>,
}

impl FabricRef {
    fn new(core: &Arc<FabricCore>) -> Self {
        core.ref_cnt.fetch_add(1, Ordering::AcqRel);
        FabricRef { core: Arc::clone(core) }
    }

    pub(crate) fn config(&self) -> &ProviderConfig {
        &self.core.config
    }

    pub(crate) fn wire(&self) -> &Arc<dyn Wire> {
        &self.core.wire
    }
}

impl Drop for FabricRef {
    fn drop(&mut self) {
        let prev = self.core.ref_cnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "fabric reference count underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close() {
        let fabric = Fabric::open("test", ProviderConfig::default()).unwrap();
        assert_eq!(fabric.name(), "test");
        assert_eq!(fabric.ref_count(), 0);
        assert!(fabric.close().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = ProviderConfig::default().progress_batch(0);
        assert_eq!(Fabric::open("bad", cfg).err(), Some(FabricError::InvalidArgument));
    }

    #[test]
    fn test_close_busy_while_referenced() {
        let fabric = Fabric::open("busy", ProviderConfig::default()).unwrap();
        let r = fabric.reference();
        assert_eq!(fabric.ref_count(), 1);

        let err = fabric.close().unwrap_err();
        assert_eq!(err.error, FabricError::Busy);
        let fabric = err.handle;

        drop(r);
        assert_eq!(fabric.ref_count(), 0);
        assert!(fabric.close().is_ok());
    }
}
