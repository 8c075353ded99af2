//! Connection-management payload carried by `CONNECTED` / `SHUTDOWN` events

use gnix_core::error::{FabricError, FabricResult};
use gnix_core::id::{Address, Fid, VcId};

/// Payload of a connection event
///
/// Encoded little-endian:
///
/// ```text
/// 0        8        16     20     24
/// | fid    | peer   | vc   | pad  |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmEntry {
    /// Endpoint the connection belongs to
    pub fid: Fid,
    pub vc_id: VcId,
    pub peer: Address,
}

impl CmEntry {
    pub const ENCODED_LEN: usize = 24;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&self.fid.0.to_le_bytes());
        out[8..16].copy_from_slice(&self.peer.to_u64().to_le_bytes());
        out[16..20].copy_from_slice(&self.vc_id.as_u32().to_le_bytes());
        out
    }

    /// Decode the leading `ENCODED_LEN` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> FabricResult<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(FabricError::TooSmall);
        }
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let mut vc = [0u8; 4];
        vc.copy_from_slice(&buf[16..20]);
        Ok(CmEntry {
            fid: Fid(u64_at(0)),
            peer: Address::from_u64(u64_at(8)),
            vc_id: VcId::new(u32::from_le_bytes(vc)),
        })
    }
}
