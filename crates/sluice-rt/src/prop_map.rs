//! Shared, reference-counted property maps.
//!
//! A map belongs to the output PID that created it and is handed out to
//! packets and PID instances by reference. Two counts gate its life:
//!
//! - `rc`: regular holders (the PID's property list, packets in flight,
//!   PID-instance snapshots).
//! - `pck_rc`: property-reference packets, which may outlive the source
//!   filter and PID entirely.
//!
//! The map is only purged from its PID's property list when `rc` hits
//! zero; the `Arc` then keeps the storage alive for any remaining
//! property-reference packets. Maps are copy-on-write at the PID level:
//! once a packet has been dispatched under a map, the next property
//! write goes to a fresh map.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sluice_common::FourCC;

use crate::props::{keys, PropKey, PropValue};

pub struct PropMap {
    entries: RwLock<FxHashMap<PropKey, PropValue>>,
    /// Timescale shortcut, 0 while unset. Mirrors the `Timescale`
    /// property so the dispatch path avoids a map lookup per packet.
    timescale: AtomicU32,
    rc: AtomicU32,
    pck_rc: AtomicU32,
}

impl PropMap {
    /// Create an empty map with `rc == 1` for its first holder.
    pub fn new() -> Self {
        PropMap {
            entries: RwLock::new(FxHashMap::default()),
            timescale: AtomicU32::new(0),
            rc: AtomicU32::new(1),
            pck_rc: AtomicU32::new(0),
        }
    }

    /// Insert or replace a property. `None` removes the key.
    pub fn set(&self, key: PropKey, value: Option<PropValue>) {
        if let PropKey::Code(code) = key {
            if code == keys::TIMESCALE {
                let ts = value.as_ref().and_then(|v| v.as_uint()).unwrap_or(0);
                self.timescale.store(ts, Ordering::Release);
            }
        }
        let mut entries = self.entries.write();
        match value {
            Some(v) => {
                entries.remove(&key);
                entries.insert(key, v);
            }
            None => {
                entries.remove(&key);
            }
        }
    }

    pub fn get(&self, key: &PropKey) -> Option<PropValue> {
        self.entries.read().get(key).cloned()
    }

    pub fn get_code(&self, code: FourCC) -> Option<PropValue> {
        self.get(&PropKey::Code(code))
    }

    pub fn get_name(&self, name: &str) -> Option<PropValue> {
        self.get(&PropKey::resolve(name))
    }

    pub fn timescale(&self) -> u32 {
        self.timescale.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every entry. The timescale shortcut is cleared too.
    pub fn reset(&self) {
        self.entries.write().clear();
        self.timescale.store(0, Ordering::Release);
    }

    /// Copy entries of `src` not already present in `self`. `keep`
    /// filters which source entries are considered.
    pub fn merge_from(&self, src: &PropMap, keep: Option<&dyn Fn(&PropKey, &PropValue) -> bool>) {
        let src_entries = src.entries.read();
        let mut dst = self.entries.write();
        for (k, v) in src_entries.iter() {
            if let Some(keep) = keep {
                if !keep(k, v) {
                    continue;
                }
            }
            if !dst.contains_key(k) {
                if let PropKey::Code(code) = k {
                    if *code == keys::TIMESCALE {
                        let ts = v.as_uint().unwrap_or(0);
                        self.timescale.store(ts, Ordering::Release);
                    }
                }
                dst.insert(k.clone(), v.clone());
            }
        }
    }

    /// Enumerate the `idx`-th entry. Order is unspecified but stable
    /// for an unmodified map.
    pub fn nth(&self, idx: usize) -> Option<(PropKey, PropValue)> {
        self.entries
            .read()
            .iter()
            .nth(idx)
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Deep elementwise equality.
    pub fn equal(&self, other: &PropMap) -> bool {
        let a = self.entries.read();
        let b = other.entries.read();
        if a.len() != b.len() {
            return false;
        }
        a.iter().all(|(k, v)| b.get(k) == Some(v))
    }

    // -----------------------------------------------------------------
    // reference counting
    // -----------------------------------------------------------------

    /// Add a regular holder.
    pub fn acquire(&self) {
        self.rc.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a regular holder; returns `true` when this was the last
    /// one and the map must be purged from its PID's property list.
    #[must_use]
    pub fn release(&self) -> bool {
        self.rc.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Add a property-reference-packet holder.
    pub fn acquire_pck(&self) {
        self.pck_rc.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a property-reference-packet holder; returns `true` when it
    /// was the last one.
    #[must_use]
    pub fn release_pck(&self) -> bool {
        self.pck_rc.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn rc(&self) -> u32 {
        self.rc.load(Ordering::Acquire)
    }

    pub fn pck_rc(&self) -> u32 {
        self.pck_rc.load(Ordering::Acquire)
    }
}

impl Default for PropMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PropMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropMap")
            .field("len", &self.len())
            .field("timescale", &self.timescale())
            .field("rc", &self.rc())
            .field("pck_rc", &self.pck_rc())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::keys;

    #[test]
    fn set_get_remove() {
        let map = PropMap::new();
        map.set(keys::STREAM_TYPE.into(), Some(PropValue::Uint(3)));
        assert_eq!(map.get_code(keys::STREAM_TYPE), Some(PropValue::Uint(3)));
        map.set(keys::STREAM_TYPE.into(), Some(PropValue::Uint(2)));
        assert_eq!(map.get_code(keys::STREAM_TYPE), Some(PropValue::Uint(2)));
        map.set(keys::STREAM_TYPE.into(), None);
        assert_eq!(map.get_code(keys::STREAM_TYPE), None);
    }

    #[test]
    fn timescale_shortcut() {
        let map = PropMap::new();
        assert_eq!(map.timescale(), 0);
        map.set(keys::TIMESCALE.into(), Some(PropValue::Uint(90000)));
        assert_eq!(map.timescale(), 90000);
        map.set(keys::TIMESCALE.into(), None);
        assert_eq!(map.timescale(), 0);
    }

    #[test]
    fn string_and_code_keys_coexist() {
        let map = PropMap::new();
        map.set(PropKey::name("custom"), Some(PropValue::Bool(true)));
        map.set(keys::PID_ID.into(), Some(PropValue::Uint(1)));
        assert_eq!(map.get_name("custom"), Some(PropValue::Bool(true)));
        assert_eq!(map.get_code(keys::PID_ID), Some(PropValue::Uint(1)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn merge_keeps_existing() {
        let dst = PropMap::new();
        dst.set(keys::PID_ID.into(), Some(PropValue::Uint(1)));
        let src = PropMap::new();
        src.set(keys::PID_ID.into(), Some(PropValue::Uint(9)));
        src.set(keys::TIMESCALE.into(), Some(PropValue::Uint(1000)));
        dst.merge_from(&src, None);
        assert_eq!(dst.get_code(keys::PID_ID), Some(PropValue::Uint(1)));
        assert_eq!(dst.get_code(keys::TIMESCALE), Some(PropValue::Uint(1000)));
        assert_eq!(dst.timescale(), 1000);
    }

    #[test]
    fn merge_filter() {
        let dst = PropMap::new();
        let src = PropMap::new();
        src.set(keys::PID_ID.into(), Some(PropValue::Uint(9)));
        src.set(PropKey::name("drop-me"), Some(PropValue::Bool(true)));
        let keep = |k: &PropKey, _: &PropValue| !matches!(k, PropKey::Name(n) if &**n == "drop-me");
        dst.merge_from(&src, Some(&keep));
        assert_eq!(dst.len(), 1);
        assert_eq!(dst.get_code(keys::PID_ID), Some(PropValue::Uint(9)));
    }

    #[test]
    fn enumeration_is_stable() {
        let map = PropMap::new();
        map.set(keys::PID_ID.into(), Some(PropValue::Uint(1)));
        map.set(keys::TIMESCALE.into(), Some(PropValue::Uint(1000)));
        map.set(PropKey::name("lang"), Some(PropValue::String("en".into())));
        let first: Vec<_> = (0..3).map(|i| map.nth(i).unwrap().0).collect();
        let second: Vec<_> = (0..3).map(|i| map.nth(i).unwrap().0).collect();
        assert_eq!(first, second);
        assert_eq!(map.nth(3), None);
    }

    #[test]
    fn deep_equality() {
        let a = PropMap::new();
        let b = PropMap::new();
        a.set(keys::PID_ID.into(), Some(PropValue::Uint(1)));
        b.set(keys::PID_ID.into(), Some(PropValue::Uint(1)));
        assert!(a.equal(&b));
        b.set(PropKey::name("x"), Some(PropValue::Uint(2)));
        assert!(!a.equal(&b));
    }

    #[test]
    fn dual_refcounts() {
        let map = PropMap::new();
        assert_eq!(map.rc(), 1);
        map.acquire();
        map.acquire_pck();
        assert!(!map.release());
        assert!(map.release());
        assert!(map.release_pck());
        assert_eq!(map.rc(), 0);
        assert_eq!(map.pck_rc(), 0);
    }
}
