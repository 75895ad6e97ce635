//! Chain membership table
//!
//! Station-side map of the devices a Reader currently manages, keyed by
//! UID and ordered by Position In Chain. Pure data: the table owns no
//! I/O and is only ever touched from its owning Reader's thread.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One known device in a chain.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    /// Universal ID of the device.
    pub uid: String,
    /// Position In Chain, 1 = head.
    pub pic: u8,
    /// Size, in bytes, of the device's SRAM.
    pub sram_size: u32,
    /// Last successful exchange with this device.
    pub last_seen: DateTime<Utc>,
}

/// Two discovery replies claimed the same UID at different positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicCollision {
    pub kept: u8,
    pub dropped: u8,
}

/// Membership table: `uid -> Device`, listed in pic order.
///
/// When consistent, pic values are unique and form `{1, 2, .., N}`
/// without gaps.
#[derive(Debug, Default)]
pub struct ChainTable {
    devices: Vec<Device>,
}

impl ChainTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Insert or refresh a device record.
    ///
    /// A second record for a UID already present refreshes `last_seen`
    /// and `sram_size`; if the positions disagree the lower pic wins and
    /// the collision is reported so the caller can log it.
    pub fn upsert(&mut self, device: Device) -> Option<PicCollision> {
        if let Some(existing) = self.devices.iter_mut().find(|d| d.uid == device.uid) {
            existing.last_seen = device.last_seen;
            existing.sram_size = device.sram_size;
            if existing.pic != device.pic {
                let collision = PicCollision {
                    kept: existing.pic.min(device.pic),
                    dropped: existing.pic.max(device.pic),
                };
                existing.pic = collision.kept;
                self.devices.sort_by_key(|d| d.pic);
                return Some(collision);
            }
            return None;
        }

        self.devices.push(device);
        self.devices.sort_by_key(|d| d.pic);
        None
    }

    pub fn remove(&mut self, uid: &str) -> Option<Device> {
        let idx = self.devices.iter().position(|d| d.uid == uid)?;
        Some(self.devices.remove(idx))
    }

    pub fn get(&self, uid: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.uid == uid)
    }

    /// Devices ordered by pic.
    pub fn list(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Refresh `last_seen` for a device after a successful exchange.
    pub fn touch(&mut self, uid: &str) {
        if let Some(device) = self.devices.iter_mut().find(|d| d.uid == uid) {
            device.last_seen = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(uid: &str, pic: u8) -> Device {
        Device {
            uid: uid.to_string(),
            pic,
            sram_size: 16384,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_list_ordered_by_pic() {
        let mut table = ChainTable::new();
        table.upsert(device("C", 3));
        table.upsert(device("A", 1));
        table.upsert(device("B", 2));

        let pics: Vec<u8> = table.list().iter().map(|d| d.pic).collect();
        assert_eq!(pics, vec![1, 2, 3]);
    }

    #[test]
    fn test_upsert_refreshes_existing() {
        let mut table = ChainTable::new();
        table.upsert(device("A", 1));
        let collision = table.upsert(device("A", 1));
        assert!(collision.is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_duplicate_uid_lower_pic_wins() {
        let mut table = ChainTable::new();
        table.upsert(device("A", 3));
        let collision = table.upsert(device("A", 1)).unwrap();
        assert_eq!(collision, PicCollision { kept: 1, dropped: 3 });
        assert_eq!(table.get("A").unwrap().pic, 1);

        // Same outcome when the lower pic was seen first.
        let mut table = ChainTable::new();
        table.upsert(device("B", 1));
        let collision = table.upsert(device("B", 4)).unwrap();
        assert_eq!(collision, PicCollision { kept: 1, dropped: 4 });
        assert_eq!(table.get("B").unwrap().pic, 1);
    }

    #[test]
    fn test_remove_and_get() {
        let mut table = ChainTable::new();
        table.upsert(device("A", 1));
        assert!(table.get("A").is_some());
        assert!(table.remove("A").is_some());
        assert!(table.get("A").is_none());
        assert!(table.is_empty());
    }
}
