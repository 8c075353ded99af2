//! Job and credential services
//!
//! The provider needs a handful of answers from the job launcher: the RDMA
//! protection tag and cookie for the job, how many ranks share the node,
//! how many NICs each rank may use, and knobs to toggle the launcher's
//! CPU-affinity policy. `JobServices` is the seam; `EnvJobServices` reads
//! the launcher's environment.

use std::sync::atomic::{AtomicBool, Ordering};

use gnix_core::env::{env_get, env_get_opt, env_get_u32_radix};
use gnix_core::error::{FabricError, FabricResult};
use gnix_core::kprint::Subsys;
use gnix_core::{gnix_debug, gnix_info, gnix_warn};

/// RDMA protection domain credentials of the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaCredentials {
    pub ptag: u8,
    pub cookie: u32,
}

/// Queries and toggles provided by the job launcher
pub trait JobServices: Send + Sync {
    /// Protection tag and cookie; `NotSupported` outside a managed job.
    fn rdma_credentials(&self) -> FabricResult<RdmaCredentials>;

    fn enable_unassigned_cpus(&self) -> FabricResult<()>;

    fn disable_unassigned_cpus(&self) -> FabricResult<()>;

    fn enable_affinity_apply(&self) -> FabricResult<()>;

    fn disable_affinity_apply(&self) -> FabricResult<()>;

    /// Ranks of this job placed on the local node
    fn pes_on_node(&self) -> FabricResult<u32>;

    /// NICs each rank may open
    fn nics_per_rank(&self) -> FabricResult<u32>;

    /// Release launcher resources. Safe to call more than once.
    fn cleanup(&self);
}

/// `JobServices` backed by launcher environment variables
///
/// - `PMI_GNI_PTAG`, `PMI_GNI_COOKIE` - credentials (cookie may be hex)
/// - `PMI_NUM_PES_ON_NODE` - ranks on this node (default 1)
/// - `GNIX_NICS_PER_RANK` - NICs per rank (default 1)
///
/// `with_prefixes` replaces the `PMI_` / `GNIX_` prefixes.
pub struct EnvJobServices {
    pmi_prefix: String,
    gnix_prefix: String,
    unassigned_cpus: AtomicBool,
    affinity_apply: AtomicBool,
    cleaned: AtomicBool,
}

impl EnvJobServices {
    pub fn new() -> Self {
        Self::with_prefixes("PMI_", "GNIX_")
    }

    pub fn with_prefixes(pmi: &str, gnix: &str) -> Self {
        Self {
            pmi_prefix: pmi.to_owned(),
            gnix_prefix: gnix.to_owned(),
            unassigned_cpus: AtomicBool::new(false),
            affinity_apply: AtomicBool::new(true),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn unassigned_cpus_enabled(&self) -> bool {
        self.unassigned_cpus.load(Ordering::Acquire)
    }

    pub fn affinity_apply_enabled(&self) -> bool {
        self.affinity_apply.load(Ordering::Acquire)
    }

    fn pmi(&self, name: &str) -> String {
        format!("{}{}", self.pmi_prefix, name)
    }
}

impl Default for EnvJobServices {
    fn default() -> Self {
        Self::new()
    }
}

impl JobServices for EnvJobServices {
    fn rdma_credentials(&self) -> FabricResult<RdmaCredentials> {
        let ptag: Option<u8> = env_get_opt(&self.pmi("GNI_PTAG"));
        let cookie = env_get_u32_radix(&self.pmi("GNI_COOKIE"));
        match (ptag, cookie) {
            (Some(ptag), Some(cookie)) => Ok(RdmaCredentials { ptag, cookie }),
            _ => Err(FabricError::NotSupported),
        }
    }

    fn enable_unassigned_cpus(&self) -> FabricResult<()> {
        self.unassigned_cpus.store(true, Ordering::Release);
        gnix_debug!(Subsys::Job, "unassigned cpus enabled, {:?} cpus in mask", assigned_cpus());
        Ok(())
    }

    fn disable_unassigned_cpus(&self) -> FabricResult<()> {
        self.unassigned_cpus.store(false, Ordering::Release);
        Ok(())
    }

    fn enable_affinity_apply(&self) -> FabricResult<()> {
        self.affinity_apply.store(true, Ordering::Release);
        Ok(())
    }

    fn disable_affinity_apply(&self) -> FabricResult<()> {
        self.affinity_apply.store(false, Ordering::Release);
        gnix_debug!(Subsys::Job, "affinity apply disabled");
        Ok(())
    }

    fn pes_on_node(&self) -> FabricResult<u32> {
        let key = self.pmi("NUM_PES_ON_NODE");
        match env_get::<u32>(&key, 1) {
            0 => {
                gnix_warn!(Subsys::Job, "{} is 0", key);
                Err(FabricError::InvalidArgument)
            }
            n => Ok(n),
        }
    }

    fn nics_per_rank(&self) -> FabricResult<u32> {
        match env_get::<u32>(&format!("{}NICS_PER_RANK", self.gnix_prefix), 1) {
            0 => Err(FabricError::InvalidArgument),
            n => Ok(n),
        }
    }

    fn cleanup(&self) {
        if !self.cleaned.swap(true, Ordering::AcqRel) {
            gnix_info!(Subsys::Job, "job services cleanup");
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// CPUs in the calling thread's affinity mask
        pub fn assigned_cpus() -> Option<usize> {
            use nix::sched::{sched_getaffinity, CpuSet};
            use nix::unistd::Pid;

            let set = sched_getaffinity(Pid::from_raw(0)).ok()?;
            Some((0..CpuSet::count()).filter(|&i| set.is_set(i).unwrap_or(false)).count())
        }
    } else {
        /// CPUs available to the process
        pub fn assigned_cpus() -> Option<usize> {
            std::thread::available_parallelism().ok().map(|n| n.get())
        }
    }
}
