//! Capability items, bundles and matching.
//!
//! Each filter type declares a flat capability array. Contiguous items
//! form a **bundle**; [`CapSlot::Break`] entries delimit bundles. A
//! bundle is an atomic matching unit: a PID (or an upstream filter's
//! output bundle) matches a filter when it satisfies every input item
//! of one of its bundles.
//!
//! Matching semantics, per item:
//! - the PID has no property with the item's key: the item must be
//!   `excluded` (or the whole bundle fails);
//! - the PID has the property: it must equal the item's value, XOR the
//!   item being `excluded`. When several items of the bundle share a
//!   key, satisfying any one of them suffices.
//!
//! `is_static` items participate in every bundle of their register.

use crate::filter::FilterRegister;
use crate::props::{PropKey, PropValue};

/// One capability item.
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    pub key: PropKey,
    pub value: PropValue,
    pub input: bool,
    pub output: bool,
    /// Inverts the match for this item.
    pub excluded: bool,
    /// Item applies to every bundle of the register.
    pub is_static: bool,
    pub optional: bool,
    /// Item only holds once the filter is explicitly loaded.
    pub loaded_filter_only: bool,
    /// Per-item priority override; the register priority is the floor.
    pub priority: u8,
}

impl Capability {
    pub fn input(key: impl Into<PropKey>, value: PropValue) -> Self {
        Capability {
            key: key.into(),
            value,
            input: true,
            output: false,
            excluded: false,
            is_static: false,
            optional: false,
            loaded_filter_only: false,
            priority: 0,
        }
    }

    pub fn output(key: impl Into<PropKey>, value: PropValue) -> Self {
        Capability {
            output: true,
            ..Capability::input(key, value)
        }
    }

    pub fn in_out(key: impl Into<PropKey>, value: PropValue) -> Self {
        Capability {
            output: true,
            ..Capability::input(key, value)
        }
    }

    pub fn excluded(mut self) -> Self {
        self.excluded = true;
        self
    }

    pub fn is_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A slot of a capability array: an item, or a bundle delimiter.
#[derive(Debug, Clone, PartialEq)]
pub enum CapSlot {
    Item(Capability),
    Break,
}

/// Number of bundles in a capability array.
pub fn bundle_count(caps: &[CapSlot]) -> usize {
    if caps.is_empty() {
        return 0;
    }
    1 + caps.iter().filter(|s| matches!(s, CapSlot::Break)).count()
}

/// True when the register exposes at least one output capability.
pub fn has_output_caps(reg: &FilterRegister) -> bool {
    reg.caps
        .iter()
        .any(|s| matches!(s, CapSlot::Item(c) if c.output))
}

/// True when the register exposes at least one input capability.
pub fn has_input_caps(reg: &FilterRegister) -> bool {
    reg.caps
        .iter()
        .any(|s| matches!(s, CapSlot::Item(c) if c.input))
}

/// Result of matching a PID against a register's input bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidMatch {
    pub bundle_idx: usize,
    pub priority: u8,
}

/// Match a source PID's current properties (read through `get`)
/// against the input bundles of `reg`.
///
/// `for_bundle` restricts the test to one bundle index.
/// `loaded_for_reg` unlocks `loaded_filter_only` items: set it when
/// the destination is an already-loaded instance of this register.
pub fn pid_caps_match(
    get: &dyn Fn(&PropKey) -> Option<PropValue>,
    reg: &FilterRegister,
    loaded_for_reg: bool,
    for_bundle: Option<usize>,
) -> Option<PidMatch> {
    let caps = &reg.caps;
    // a register without explicit input caps accepts anything
    if !has_input_caps(reg) {
        return Some(PidMatch {
            bundle_idx: 0,
            priority: reg.priority,
        });
    }

    let mut priority = reg.priority;
    let mut bundle_idx = 0usize;
    let mut bundle_start = 0usize;
    let mut nb_subcaps = 0usize;
    let mut all_matched = true;

    let mut i = 0usize;
    while i < caps.len() {
        match &caps[i] {
            CapSlot::Break => {
                if nb_subcaps > 0 && all_matched && for_bundle.map_or(true, |b| b == bundle_idx) {
                    return Some(PidMatch {
                        bundle_idx,
                        priority,
                    });
                }
                all_matched = true;
                nb_subcaps = 0;
                bundle_idx += 1;
                bundle_start = i + 1;
                if let Some(b) = for_bundle {
                    if bundle_idx > b {
                        break;
                    }
                }
                i += 1;
                continue;
            }
            CapSlot::Item(cap) => {
                if let Some(b) = for_bundle {
                    if bundle_idx < b {
                        i += 1;
                        continue;
                    }
                }
                if !cap.input {
                    i += 1;
                    continue;
                }
                nb_subcaps += 1;
                if !all_matched {
                    i += 1;
                    continue;
                }

                let pid_prop = get(&cap.key);
                match pid_prop {
                    Some(prop) => {
                        // check every input item of this bundle (and the
                        // statics) carrying the same key; any hit wins
                        let mut prop_equal = false;
                        let mut prop_excluded = false;
                        for (j, slot) in caps.iter().enumerate() {
                            let a_cap = match slot {
                                CapSlot::Item(c) => c,
                                CapSlot::Break => continue,
                            };
                            // restrict to our bundle unless static
                            if !a_cap.is_static && !in_same_bundle(caps, bundle_start, j) {
                                continue;
                            }
                            if !a_cap.input {
                                continue;
                            }
                            if a_cap.key != cap.key {
                                continue;
                            }
                            if a_cap.loaded_filter_only && !loaded_for_reg {
                                prop_equal = false;
                                break;
                            }
                            let eq = prop == a_cap.value;
                            if cap.excluded {
                                if eq {
                                    // excluded value present: hard fail
                                    prop_equal = false;
                                    prop_excluded = false;
                                    break;
                                }
                                prop_excluded = true;
                            } else if eq {
                                prop_equal = true;
                                break;
                            }
                        }
                        if !prop_equal && !prop_excluded {
                            all_matched = false;
                        } else if priority < cap.priority {
                            priority = cap.priority;
                        }
                    }
                    None => {
                        // property absent: only excluded items tolerate it
                        if !cap.excluded {
                            all_matched = false;
                        }
                    }
                }
            }
        }
        i += 1;
    }

    if nb_subcaps > 0 && all_matched && for_bundle.map_or(true, |b| b == bundle_idx) {
        return Some(PidMatch {
            bundle_idx,
            priority,
        });
    }
    None
}

/// True when slot `j` belongs to the bundle starting at `bundle_start`.
fn in_same_bundle(caps: &[CapSlot], bundle_start: usize, j: usize) -> bool {
    if j < bundle_start {
        return false;
    }
    // a Break between bundle_start and j means j is in a later bundle
    !caps[bundle_start..=j]
        .iter()
        .any(|s| matches!(s, CapSlot::Break))
}

/// Index range of bundle `idx` (item slots only, statics excluded).
fn bundle_range(caps: &[CapSlot], idx: usize) -> Option<(usize, usize)> {
    let mut cur = 0usize;
    let mut start = 0usize;
    for (i, slot) in caps.iter().enumerate() {
        if matches!(slot, CapSlot::Break) {
            if cur == idx {
                return Some((start, i));
            }
            cur += 1;
            start = i + 1;
        }
    }
    if cur == idx {
        return Some((start, caps.len()));
    }
    None
}

/// Result of scoring a source output bundle against a destination
/// register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsToCapsMatch {
    /// Number of source output caps matched by the winning input
    /// bundle; zero means no connection is possible.
    pub score: u32,
    pub dst_bundle_idx: usize,
}

/// Score output bundle `src_bundle` of `src` against the input bundles
/// of `dst`. A destination bundle with any non-excluded unmatched
/// source cap scores zero; the best bundle is the one matching the
/// most source caps. `for_dst_bundle` restricts the test.
pub fn caps_to_caps_match(
    src: &FilterRegister,
    src_bundle: usize,
    dst: &FilterRegister,
    for_dst_bundle: Option<usize>,
) -> CapsToCapsMatch {
    let none = CapsToCapsMatch {
        score: 0,
        dst_bundle_idx: 0,
    };
    if !has_output_caps(src) {
        return none;
    }
    let nb_in_bundles = bundle_count(&dst.caps);
    if nb_in_bundles == 0 {
        // no caps at all: connection possible iff the register can
        // still receive pids
        if dst.accepts_inputs {
            return CapsToCapsMatch {
                score: 1,
                dst_bundle_idx: 0,
            };
        }
        return none;
    }

    let mut bundles_ok = vec![true; nb_in_bundles];
    let mut bundles_score = vec![0u32; nb_in_bundles];

    let Some((src_start, src_end)) = bundle_range(&src.caps, src_bundle) else {
        return none;
    };

    // every output cap key of the selected source bundle (plus statics)
    // must find a matching input cap in a destination bundle
    let out_slots: Vec<(usize, &Capability)> = src
        .caps
        .iter()
        .enumerate()
        .filter_map(|(i, s)| match s {
            CapSlot::Item(c) if c.output => {
                let in_selected = i >= src_start && i < src_end;
                if in_selected || c.is_static {
                    Some((i, c))
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect();

    let mut keys_seen: Vec<&PropKey> = Vec::new();
    for &(_, out_cap) in &out_slots {
        if keys_seen.iter().any(|k| **k == out_cap.key) {
            continue;
        }
        keys_seen.push(&out_cap.key);

        // all alternative output values for this key in the bundle
        let alternatives: Vec<&Capability> = out_slots
            .iter()
            .filter(|(_, c)| c.key == out_cap.key)
            .map(|(_, c)| *c)
            .collect();

        let mut bundles_cap_found = vec![0u32; nb_in_bundles];
        let mut any_dst_cap_for_key = false;

        for an_out in &alternatives {
            // walk destination caps bundle by bundle
            let mut cur_dst_bundle = 0usize;
            let mut matched = false;
            let mut exclude = false;
            let mut prop_found = false;
            let mut tested = 0u32;

            fn finish_bundle(
                matched: bool,
                prop_found: bool,
                tested: u32,
                cur: usize,
                found: &mut [u32],
            ) {
                // a same-key prop excluded with a different value is an
                // acceptable match
                if tested > 0 && (matched || prop_found) {
                    found[cur] += 1;
                }
            }

            for slot in dst.caps.iter() {
                match slot {
                    CapSlot::Break => {
                        finish_bundle(matched, prop_found, tested, cur_dst_bundle, &mut bundles_cap_found);
                        matched = false;
                        exclude = false;
                        prop_found = false;
                        tested = 0;
                        cur_dst_bundle += 1;
                        if let Some(b) = for_dst_bundle {
                            if cur_dst_bundle > b {
                                break;
                            }
                        }
                    }
                    CapSlot::Item(in_cap) => {
                        if !in_cap.input {
                            continue;
                        }
                        if let Some(b) = for_dst_bundle {
                            if cur_dst_bundle < b && !in_cap.is_static {
                                continue;
                            }
                        }
                        if exclude || matched {
                            continue;
                        }
                        if in_cap.key != an_out.key {
                            continue;
                        }
                        any_dst_cap_for_key = true;
                        tested += 1;
                        let eq = in_cap.value == an_out.value;
                        if in_cap.excluded != an_out.excluded {
                            if eq {
                                // one side excludes the matched value
                                matched = false;
                                exclude = true;
                                prop_found = false;
                            } else {
                                prop_found = true;
                            }
                        } else if eq {
                            matched = true;
                        }
                    }
                }
            }
            finish_bundle(matched, prop_found, tested, cur_dst_bundle, &mut bundles_cap_found);
        }

        let mut nb_matched = 0u32;
        for k in 0..nb_in_bundles {
            if bundles_cap_found[k] == 0 {
                // an excluded output cap without counterpart is
                // acceptable; anything else disqualifies the bundle
                if !out_cap.excluded {
                    bundles_ok[k] = false;
                }
            } else {
                nb_matched += bundles_cap_found[k];
                bundles_score[k] += 1;
            }
        }
        if nb_matched == 0 && !out_cap.excluded && any_dst_cap_for_key {
            // hard mismatch for this key: no bundle survives
            return none;
        }
    }

    let mut best = none;
    for k in 0..nb_in_bundles {
        if bundles_ok[k] && bundles_score[k] > best.score {
            best = CapsToCapsMatch {
                score: bundles_score[k],
                dst_bundle_idx: k,
            };
        }
    }
    best
}

/// True when bundle `bundle_idx` of `reg` declares several output caps
/// with the same key, meaning its real output cannot be known before a
/// live connection (demuxer-style registers).
pub fn out_caps_solved_by_connection(reg: &FilterRegister, bundle_idx: usize) -> bool {
    let Some((start, end)) = bundle_range(&reg.caps, bundle_idx) else {
        return false;
    };
    for i in start..end {
        let CapSlot::Item(cap) = &reg.caps[i] else {
            continue;
        };
        if !cap.output {
            continue;
        }
        let mut same_key = 0;
        for j in start..end {
            let CapSlot::Item(other) = &reg.caps[j] else {
                continue;
            };
            if other.output && other.key == cap.key {
                same_key += 1;
                if same_key > 1 {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::keys;

    fn reg(name: &str, caps: Vec<CapSlot>) -> FilterRegister {
        FilterRegister::with_caps(name, caps)
    }

    fn uint(v: u32) -> PropValue {
        PropValue::Uint(v)
    }

    #[test]
    fn bundle_counting() {
        assert_eq!(bundle_count(&[]), 0);
        let caps = vec![
            CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(2))),
            CapSlot::Break,
            CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(3))),
        ];
        assert_eq!(bundle_count(&caps), 2);
    }

    #[test]
    fn caps_to_caps_basic_match() {
        let a = reg(
            "a",
            vec![CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(3)))],
        );
        let b = reg(
            "b",
            vec![
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(3))),
                CapSlot::Item(Capability::output(keys::CODEC_ID, uint(0))),
            ],
        );
        let m = caps_to_caps_match(&a, 0, &b, None);
        assert!(m.score > 0);
        assert_eq!(m.dst_bundle_idx, 0);
    }

    #[test]
    fn caps_to_caps_mismatch() {
        let a = reg(
            "a",
            vec![CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(3)))],
        );
        let b = reg(
            "b",
            vec![CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(2)))],
        );
        assert_eq!(caps_to_caps_match(&a, 0, &b, None).score, 0);
    }

    #[test]
    fn caps_to_caps_excluded_value() {
        let a = reg(
            "a",
            vec![CapSlot::Item(Capability::output(keys::CODEC_ID, uint(1)))],
        );
        // input excludes codec 1 specifically
        let b = reg(
            "b",
            vec![CapSlot::Item(
                Capability::input(keys::CODEC_ID, uint(1)).excluded(),
            )],
        );
        assert_eq!(caps_to_caps_match(&a, 0, &b, None).score, 0);
        // but another codec passes the exclusion
        let c = reg(
            "c",
            vec![CapSlot::Item(Capability::output(keys::CODEC_ID, uint(2)))],
        );
        assert!(caps_to_caps_match(&c, 0, &b, None).score > 0);
    }

    #[test]
    fn caps_to_caps_selects_best_bundle() {
        let src = reg(
            "src",
            vec![
                CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(3))),
                CapSlot::Item(Capability::output(keys::CODEC_ID, uint(7))),
            ],
        );
        let dst = reg(
            "dst",
            vec![
                // bundle 0 matches only the stream type
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(3))),
                CapSlot::Break,
                // bundle 1 matches both caps
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(3))),
                CapSlot::Item(Capability::input(keys::CODEC_ID, uint(7))),
            ],
        );
        let m = caps_to_caps_match(&src, 0, &dst, None);
        assert_eq!(m.dst_bundle_idx, 1);
        assert_eq!(m.score, 2);
    }

    fn props(entries: Vec<(PropKey, PropValue)>) -> impl Fn(&PropKey) -> Option<PropValue> {
        move |k| entries.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone())
    }

    #[test]
    fn pid_match_direct() {
        let dst = reg(
            "dst",
            vec![CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(3)))],
        );
        let get = props(vec![(keys::STREAM_TYPE.into(), uint(3))]);
        let m = pid_caps_match(&get, &dst, false, None).expect("should match");
        assert_eq!(m.bundle_idx, 0);

        let get = props(vec![(keys::STREAM_TYPE.into(), uint(2))]);
        assert!(pid_caps_match(&get, &dst, false, None).is_none());
    }

    #[test]
    fn pid_match_missing_property_needs_excluded() {
        let dst = reg(
            "dst",
            vec![CapSlot::Item(Capability::input(keys::CODEC_ID, uint(1)))],
        );
        let get = props(vec![]);
        assert!(pid_caps_match(&get, &dst, false, None).is_none());

        let dst_excl = reg(
            "dst",
            vec![CapSlot::Item(
                Capability::input(keys::CODEC_ID, uint(1)).excluded(),
            )],
        );
        assert!(pid_caps_match(&get, &dst_excl, false, None).is_some());
    }

    #[test]
    fn pid_match_any_of_same_key() {
        // two acceptable stream types in one bundle
        let dst = reg(
            "dst",
            vec![
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(2))),
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(3))),
            ],
        );
        let get = props(vec![(keys::STREAM_TYPE.into(), uint(3))]);
        assert!(pid_caps_match(&get, &dst, false, None).is_some());
    }

    #[test]
    fn pid_match_excluded_value_rejects() {
        let dst = reg(
            "dst",
            vec![CapSlot::Item(
                Capability::input(keys::STREAM_TYPE, uint(3)).excluded(),
            )],
        );
        let get = props(vec![(keys::STREAM_TYPE.into(), uint(3))]);
        assert!(pid_caps_match(&get, &dst, false, None).is_none());
        let get = props(vec![(keys::STREAM_TYPE.into(), uint(2))]);
        assert!(pid_caps_match(&get, &dst, false, None).is_some());
    }

    #[test]
    fn pid_match_second_bundle() {
        let dst = reg(
            "dst",
            vec![
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(2))),
                CapSlot::Break,
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(3))),
            ],
        );
        let get = props(vec![(keys::STREAM_TYPE.into(), uint(3))]);
        let m = pid_caps_match(&get, &dst, false, None).expect("should match bundle 1");
        assert_eq!(m.bundle_idx, 1);
        // restricting to bundle 0 fails
        assert!(pid_caps_match(&get, &dst, false, Some(0)).is_none());
    }

    #[test]
    fn no_input_caps_accepts_anything() {
        let dst = reg(
            "sink",
            vec![CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(3)))],
        );
        let get = props(vec![]);
        assert!(pid_caps_match(&get, &dst, false, None).is_some());
    }

    #[test]
    fn bundle_match_implies_pid_acceptance() {
        // if A's output bundle matches B's inputs, a pid exposing
        // exactly A's output values must be accepted by B
        let a = reg(
            "a",
            vec![
                CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(3))),
                CapSlot::Item(Capability::output(keys::CODEC_ID, uint(7))),
            ],
        );
        let b = reg(
            "b",
            vec![
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(3))),
                CapSlot::Item(Capability::input(keys::CODEC_ID, uint(7))),
            ],
        );
        let m = caps_to_caps_match(&a, 0, &b, None);
        assert!(m.score > 0);

        let get = props(vec![
            (keys::STREAM_TYPE.into(), uint(3)),
            (keys::CODEC_ID.into(), uint(7)),
        ]);
        assert!(pid_caps_match(&get, &b, false, None).is_some());
    }

    #[test]
    fn solved_by_connection_detection() {
        let demux = reg(
            "demux",
            vec![
                CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(2))),
                CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(3))),
            ],
        );
        assert!(out_caps_solved_by_connection(&demux, 0));
        let single = reg(
            "single",
            vec![CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(3)))],
        );
        assert!(!out_caps_solved_by_connection(&single, 0));
    }
}
