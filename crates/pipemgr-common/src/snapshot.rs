//! Tagged pre-images.

use crate::sync_map::SyncMap;
use serde::{Deserialize, Serialize};

/// The state of a keyed value before a change.
///
/// `Absent` is the tombstone for "did not exist": restoring it removes
/// whatever exists live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Snapshot<T> {
    Absent,
    Present(T),
}

impl<T: Clone> Snapshot<T> {
    /// Deep-copies the current value, or records that there is none.
    pub fn capture(current: Option<&T>) -> Self {
        match current {
            Some(value) => Snapshot::Present(value.clone()),
            None => Snapshot::Absent,
        }
    }
}

impl<T> Snapshot<T> {
    /// Returns true if the value existed.
    pub fn existed(&self) -> bool {
        matches!(self, Snapshot::Present(_))
    }

    /// Returns the captured value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Snapshot::Present(value) => Some(value),
            Snapshot::Absent => None,
        }
    }

    /// Converts into the captured value, if any.
    pub fn into_option(self) -> Option<T> {
        match self {
            Snapshot::Present(value) => Some(value),
            Snapshot::Absent => None,
        }
    }

    /// Puts the pre-image back under `key`, returning the value that was
    /// live before the restore.
    pub fn restore_into<K: Ord>(self, map: &mut SyncMap<K, T>, key: K) -> Option<T> {
        match self {
            Snapshot::Present(value) => map.insert(key, value),
            Snapshot::Absent => map.remove(&key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture() {
        assert_eq!(Snapshot::<u8>::capture(None), Snapshot::Absent);
        assert_eq!(Snapshot::capture(Some(&3u8)), Snapshot::Present(3));
        assert!(Snapshot::capture(Some(&3u8)).existed());
    }

    #[test]
    fn test_restore_present_overwrites() {
        let mut map: SyncMap<u32, String> = SyncMap::new();
        map.insert(1, "old".to_string());
        let snap = Snapshot::capture(map.get(&1));
        map.insert(1, "new".to_string());

        let replaced = snap.restore_into(&mut map, 1);
        assert_eq!(replaced.as_deref(), Some("new"));
        assert_eq!(map.get(&1).map(String::as_str), Some("old"));
    }

    #[test]
    fn test_restore_present_after_delete() {
        let mut map: SyncMap<u32, u32> = SyncMap::new();
        map.insert(4, 40);
        let snap = Snapshot::capture(map.get(&4));
        map.remove(&4);

        assert_eq!(snap.restore_into(&mut map, 4), None);
        assert_eq!(map.get(&4), Some(&40));
    }
}
