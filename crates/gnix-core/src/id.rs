//! Identifier and address types

use core::fmt;

/// Dense per-NIC virtual channel id
///
/// Indexes the NIC's VC table, so a hardware completion record carrying
/// the id resolves to its VC in O(1). `u32::MAX` is reserved for "no VC".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VcId(u32);

impl VcId {
    pub const NONE: VcId = VcId(u32::MAX);

    #[inline]
    pub const fn new(id: u32) -> Self {
        VcId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }
}

impl Default for VcId {
    fn default() -> Self {
        VcId::NONE
    }
}

impl fmt::Debug for VcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "VcId(NONE)")
        } else {
            write!(f, "VcId({})", self.0)
        }
    }
}

impl fmt::Display for VcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Fabric address of an endpoint: physical device address plus the
/// communication-domain instance on that device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    pub device_addr: u32,
    pub cdm_id: u32,
}

impl Address {
    pub const fn new(device_addr: u32, cdm_id: u32) -> Self {
        Address { device_addr, cdm_id }
    }

    /// Packed form used on the wire and in CM entries.
    #[inline]
    pub const fn to_u64(self) -> u64 {
        ((self.device_addr as u64) << 32) | self.cdm_id as u64
    }

    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Address {
            device_addr: (raw >> 32) as u32,
            cdm_id: raw as u32,
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x}:{})", self.device_addr, self.cdm_id)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.device_addr, self.cdm_id)
    }
}

/// Process-unique id of a provider object (fabric, EQ, endpoint)
///
/// Fills the `fid` field of EQ error entries and CM payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct Fid(pub u64);

impl Fid {
    /// Allocate the next id.
    pub fn next() -> Self {
        use core::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Fid(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vc_id_basics() {
        let id = VcId::new(9);
        assert_eq!(id.as_usize(), 9);
        assert!(!id.is_none());
        assert!(VcId::default().is_none());
        assert_eq!(format!("{:?}", VcId::NONE), "VcId(NONE)");
    }

    #[test]
    fn test_address_packing() {
        let a = Address::new(0xdead, 7);
        assert_eq!(Address::from_u64(a.to_u64()), a);
        assert_eq!(a.to_string(), "0xdead:7");
    }

    #[test]
    fn test_fids_are_unique() {
        let a = Fid::next();
        let b = Fid::next();
        assert_ne!(a, b);
    }
}
