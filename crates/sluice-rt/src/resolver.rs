//! Graph resolution: find the shortest weighted chain of registered
//! filter types connecting a source PID to a destination filter.
//!
//! The search walks the registry, scoring candidate last-hop registers
//! against the destination's input bundles, then recursing upstream
//! until a register directly accepts the PID. Chains are compared by
//! length first, then by accumulated weight (`255 - priority` per link
//! plus the capability bundle scores). A register named in the
//! preferred-registry list of the involved filters' argument strings
//! wins unconditionally.

use std::sync::Arc;

use log::{debug, info};

use crate::caps::{
    bundle_count, caps_to_caps_match, has_output_caps, out_caps_solved_by_connection,
    pid_caps_match,
};
use crate::filter::{Filter, FilterRegister};
use crate::pid::Pid;
use crate::props::{PropKey, PropValue};

/// One filter type of a resolved chain, with the capability bundle the
/// resolution selected.
#[derive(Clone)]
pub struct ChainLink {
    pub reg: Arc<FilterRegister>,
    pub bundle_idx: usize,
}

impl std::fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.reg.name, self.bundle_idx)
    }
}

/// Outcome of [`resolve_link`].
#[derive(Debug)]
pub enum ResolveOutcome {
    /// Ordered chain, source side first. When `load_first_only` is
    /// set, only the head can be instantiated now; its outputs depend
    /// on the live connection and the rest of the chain is deferred.
    Chain {
        links: Vec<ChainLink>,
        load_first_only: bool,
    },
    /// No chain exists, but the source filter is reassignable and a
    /// different source register should be tried.
    Reassign,
    /// No chain exists.
    NoMatch,
}

/// Inputs of a resolution, independent of live session state.
pub struct ResolveContext<'a> {
    pub registry: &'a [Arc<FilterRegister>],
    /// Registry names blacklisted for the source filter's graph.
    pub blacklist: Vec<String>,
    /// Registry names excluded as adaptation filters on the pid.
    pub adapters_blacklist: Vec<String>,
    /// Preferred-registry names gathered from the argument chains.
    pub preferred: Vec<String>,
    /// Registry of the pid's owner (re-entrancy is refused).
    pub src_reg_name: String,
    pub max_chain_len: usize,
    /// Restrict to registers able to reconfigure their output.
    pub reconfigurable_only: bool,
}

/// Scan an argument string for `freg=name1,name2` overrides.
pub(crate) fn collect_preferred(args: Option<&str>, out: &mut Vec<String>) {
    let Some(args) = args else { return };
    for part in args.split(':') {
        if let Some(names) = part.strip_prefix("freg=") {
            for name in names.split(',') {
                if !name.is_empty() {
                    out.push(name.to_string());
                }
            }
        }
    }
}

/// Resolve a chain from a live pid to a live destination filter.
pub fn resolve_link(pid: &Arc<Pid>, dst: &Arc<Filter>) -> ResolveOutcome {
    let Some(src_filter) = pid.filter() else {
        return ResolveOutcome::NoMatch;
    };
    let Some(session) = src_filter.session() else {
        return ResolveOutcome::NoMatch;
    };
    let registry: Vec<Arc<FilterRegister>> = session.registry.read().clone();

    let mut preferred = Vec::new();
    collect_preferred(src_filter.orig_args.lock().as_deref(), &mut preferred);
    collect_preferred(dst.orig_args.lock().as_deref(), &mut preferred);

    let ctx = ResolveContext {
        registry: &registry,
        blacklist: src_filter.blacklist.lock().clone(),
        adapters_blacklist: pid.adapters_blacklist.lock().clone(),
        preferred,
        src_reg_name: src_filter.reg.name.clone(),
        max_chain_len: session.cfg.max_chain_len,
        reconfigurable_only: false,
    };
    let get = |k: &PropKey| pid.get_property_key(k);
    let outcome = resolve_link_with(&ctx, &get, &dst.reg);

    if matches!(outcome, ResolveOutcome::NoMatch) {
        // a source filter with nothing connected may swap registers
        let mut can_reassign = src_filter.num_input_pids() == 0
            && !src_filter.sticky.load(std::sync::atomic::Ordering::Acquire)
            && src_filter
                .out_pid_connection_pending
                .load(std::sync::atomic::Ordering::Acquire)
                == 0;
        if can_reassign {
            for out in src_filter.outputs.lock().iter() {
                if out.num_destinations() > 0
                    || out
                        .init_task_pending
                        .load(std::sync::atomic::Ordering::Acquire)
                        > 0
                {
                    can_reassign = false;
                    break;
                }
            }
        }
        if can_reassign {
            return ResolveOutcome::Reassign;
        }
    }
    outcome
}

/// Core search over static descriptors. Also used directly by tests
/// and by capability queries.
pub fn resolve_link_with(
    ctx: &ResolveContext<'_>,
    pid_props: &dyn Fn(&PropKey) -> Option<PropValue>,
    dst_reg: &Arc<FilterRegister>,
) -> ResolveOutcome {
    let mut best: Option<(usize, u64, Vec<ChainLink>)> = None; // (len, weight, chain)
    let mut tested: Vec<String> = Vec::new();

    'regs: for reg in ctx.registry {
        if !reg.accepts_inputs {
            continue;
        }
        if reg.explicit_only {
            continue;
        }
        if ctx.reconfigurable_only && !reg.can_reconfigure_output {
            continue;
        }
        // no re-entrant registries
        if reg.name == ctx.src_reg_name || reg.name == dst_reg.name {
            continue;
        }
        if ctx.blacklist.iter().any(|n| *n == reg.name) {
            continue;
        }
        if ctx.adapters_blacklist.iter().any(|n| *n == reg.name) {
            continue;
        }
        if !has_output_caps(reg) {
            continue;
        }

        // which output bundle of this register matches the destination
        let nb_bundles = bundle_count(&reg.caps).max(1);
        let mut matched = None;
        for k in 0..nb_bundles {
            let m = caps_to_caps_match(reg, k, dst_reg, None);
            if m.score > 0 {
                matched = Some((k, m.score));
                break;
            }
        }
        let Some((last_bundle, dst_score)) = matched else {
            continue;
        };

        debug!(
            "register {} output bundle {} matches {} inputs, checking chain",
            reg.name, last_bundle, dst_reg.name
        );

        // search the chain from the pid to this last-hop register
        let mut stack = vec![ctx.src_reg_name.clone()];
        let limit = match &best {
            Some((len, _, _)) if ctx.max_chain_len == 0 => *len,
            _ => ctx.max_chain_len,
        };
        let Some((up_weight, chain)) = chain_search(
            ctx,
            pid_props,
            reg,
            last_bundle,
            &mut stack,
            &mut tested,
            0,
            limit,
        ) else {
            debug!(
                "no valid chain from pid to {} toward {}",
                reg.name, dst_reg.name
            );
            tested.push(reg.name.clone());
            continue;
        };

        let chain_priority: u64 = chain
            .iter()
            .map(|l| 255u64.saturating_sub(l.reg.priority as u64))
            .sum();
        let weight = up_weight as u64 + dst_score as u64 + chain_priority;
        let len = chain.len();

        let forced = chain
            .iter()
            .any(|l| ctx.preferred.iter().any(|p| *p == l.reg.name));

        // registers whose outputs are connection-solved are not
        // explored again in other candidate chains
        for link in &chain {
            if out_caps_solved_by_connection(&link.reg, link.bundle_idx)
                && !tested.iter().any(|n| *n == link.reg.name)
            {
                tested.push(link.reg.name.clone());
            }
        }

        let better = match &best {
            None => true,
            Some((blen, bweight, _)) => len < *blen || (len == *blen && weight > *bweight),
        };
        if better || forced {
            best = Some((len, weight, chain));
        }
        if forced {
            break 'regs;
        }
    }

    match best {
        Some((_, _, links)) => {
            info!(
                "solved filter chain to {}: {:?}",
                dst_reg.name, links
            );
            let load_first_only = links
                .first()
                .map(|l| out_caps_solved_by_connection(&l.reg, l.bundle_idx))
                .unwrap_or(false);
            ResolveOutcome::Chain {
                links,
                load_first_only,
            }
        }
        None => ResolveOutcome::NoMatch,
    }
}

/// Find the best chain ending at `reg` (selected bundle `reg_bundle`),
/// starting from a register that accepts the pid directly. Returns the
/// accumulated weight and the chain, source side first, including
/// `reg` itself.
#[allow(clippy::too_many_arguments)]
fn chain_search(
    ctx: &ResolveContext<'_>,
    pid_props: &dyn Fn(&PropKey) -> Option<PropValue>,
    reg: &Arc<FilterRegister>,
    reg_bundle: usize,
    stack: &mut Vec<String>,
    tested: &mut Vec<String>,
    rlevel: usize,
    max_chain_len: usize,
) -> Option<(u32, Vec<ChainLink>)> {
    // direct acceptance of the pid by this register's selected bundle
    if pid_caps_match(pid_props, reg, false, Some(reg_bundle)).is_some() {
        return Some((
            1,
            vec![ChainLink {
                reg: Arc::clone(reg),
                bundle_idx: reg_bundle,
            }],
        ));
    }

    if max_chain_len > 0 && rlevel + 1 >= max_chain_len {
        return None;
    }
    if tested.iter().any(|n| *n == reg.name) {
        return None;
    }

    let mut best: Option<(u32, Vec<ChainLink>)> = None;

    for cand in ctx.registry {
        if cand.name == reg.name {
            continue;
        }
        if cand.explicit_only || !cand.accepts_inputs {
            continue;
        }
        if tested.iter().any(|n| *n == cand.name) {
            continue;
        }
        if stack.iter().any(|n| *n == cand.name) {
            continue;
        }
        if ctx.blacklist.iter().any(|n| *n == cand.name) {
            continue;
        }
        if !has_output_caps(cand) {
            continue;
        }
        if max_chain_len > 0 && rlevel + 2 >= max_chain_len {
            continue;
        }

        let nb_bundles = bundle_count(&cand.caps).max(1);
        for k in 0..nb_bundles {
            let m = caps_to_caps_match(cand, k, reg, Some(reg_bundle));
            if m.score == 0 || m.dst_bundle_idx != reg_bundle {
                continue;
            }
            let link_weight = m.score * (255 - cand.priority as u32).max(1);

            stack.push(cand.name.clone());
            let sub = chain_search(
                ctx, pid_props, cand, k, stack, tested, rlevel + 1, max_chain_len,
            );
            stack.pop();

            let Some((sub_weight, mut sub_chain)) = sub else {
                if !tested.iter().any(|n| *n == cand.name) {
                    tested.push(cand.name.clone());
                }
                continue;
            };
            let weight = link_weight + sub_weight;
            sub_chain.push(ChainLink {
                reg: Arc::clone(reg),
                bundle_idx: reg_bundle,
            });

            let better = match &best {
                None => true,
                Some((bw, bc)) => {
                    sub_chain.len() < bc.len() || (sub_chain.len() == bc.len() && weight > *bw)
                }
            };
            if better {
                best = Some((weight, sub_chain));
            }
        }
    }
    best
}

/// Variant restricted to output-reconfigurable registers, used for
/// capability renegotiation; the resulting chain must be one filter.
pub fn resolve_adaptation_link(pid: &Arc<Pid>, dst: &Arc<Filter>) -> Option<ChainLink> {
    let Some(src_filter) = pid.filter() else {
        return None;
    };
    let session = src_filter.session()?;
    let registry: Vec<Arc<FilterRegister>> = session.registry.read().clone();
    let ctx = ResolveContext {
        registry: &registry,
        blacklist: src_filter.blacklist.lock().clone(),
        adapters_blacklist: pid.adapters_blacklist.lock().clone(),
        preferred: Vec::new(),
        src_reg_name: src_filter.reg.name.clone(),
        max_chain_len: 2,
        reconfigurable_only: true,
    };
    let get = |k: &PropKey| pid.get_property_key(k);
    match resolve_link_with(&ctx, &get, &dst.reg) {
        ResolveOutcome::Chain { links, .. } if links.len() == 1 => links.into_iter().next(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{CapSlot, Capability};
    use crate::props::keys;

    const VIDEO: u32 = 3;
    const CODEC_H264: u32 = 27;
    const CODEC_RAW: u32 = 0;

    fn uint(v: u32) -> PropValue {
        PropValue::Uint(v)
    }

    /// in/out caps in a single bundle
    fn transform(name: &str, in_codec: u32, out_codec: u32, priority: u8) -> Arc<FilterRegister> {
        let mut reg = FilterRegister::with_caps(
            name,
            vec![
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(VIDEO))),
                CapSlot::Item(Capability::input(keys::CODEC_ID, uint(in_codec))),
                CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(VIDEO))),
                CapSlot::Item(Capability::output(keys::CODEC_ID, uint(out_codec))),
            ],
        );
        reg.priority = priority;
        Arc::new(reg)
    }

    fn sink(name: &str, in_codec: u32) -> Arc<FilterRegister> {
        Arc::new(FilterRegister::with_caps(
            name,
            vec![
                CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(VIDEO))),
                CapSlot::Item(Capability::input(keys::CODEC_ID, uint(in_codec))),
            ],
        ))
    }

    fn h264_pid_props() -> impl Fn(&PropKey) -> Option<PropValue> {
        move |k: &PropKey| match k {
            PropKey::Code(c) if *c == keys::STREAM_TYPE => Some(uint(VIDEO)),
            PropKey::Code(c) if *c == keys::CODEC_ID => Some(uint(CODEC_H264)),
            _ => None,
        }
    }

    fn ctx<'a>(registry: &'a [Arc<FilterRegister>]) -> ResolveContext<'a> {
        ResolveContext {
            registry,
            blacklist: Vec::new(),
            adapters_blacklist: Vec::new(),
            preferred: Vec::new(),
            src_reg_name: "source".to_string(),
            max_chain_len: 6,
            reconfigurable_only: false,
        }
    }

    #[test]
    fn one_hop_chain() {
        // source emits h264, decoder h264->raw, sink wants raw
        let registry = vec![transform("vdec", CODEC_H264, CODEC_RAW, 100)];
        let dst = sink("vout", CODEC_RAW);
        let outcome = resolve_link_with(&ctx(&registry), &h264_pid_props(), &dst);
        match outcome {
            ResolveOutcome::Chain { links, load_first_only } => {
                assert_eq!(links.len(), 1);
                assert_eq!(links[0].reg.name, "vdec");
                assert!(!load_first_only);
            }
            other => panic!("expected chain, got {other:?}"),
        }
    }

    #[test]
    fn two_hop_chain_ordering() {
        // h264 -> reframe (h264->h264annexb as codec 28) -> dec (28->raw)
        let registry = vec![
            transform("dec28", 28, CODEC_RAW, 100),
            transform("reframe", CODEC_H264, 28, 100),
        ];
        let dst = sink("vout", CODEC_RAW);
        let outcome = resolve_link_with(&ctx(&registry), &h264_pid_props(), &dst);
        match outcome {
            ResolveOutcome::Chain { links, .. } => {
                let names: Vec<&str> = links.iter().map(|l| l.reg.name.as_str()).collect();
                assert_eq!(names, vec!["reframe", "dec28"]);
            }
            other => panic!("expected chain, got {other:?}"),
        }
    }

    #[test]
    fn shortest_chain_wins() {
        let registry = vec![
            // long path: h264 -> 28 -> raw
            transform("reframe", CODEC_H264, 28, 0),
            transform("dec28", 28, CODEC_RAW, 0),
            // short path: h264 -> raw directly, poor priority
            transform("directdec", CODEC_H264, CODEC_RAW, 250),
        ];
        let dst = sink("vout", CODEC_RAW);
        let outcome = resolve_link_with(&ctx(&registry), &h264_pid_props(), &dst);
        match outcome {
            ResolveOutcome::Chain { links, .. } => {
                assert_eq!(links.len(), 1);
                assert_eq!(links[0].reg.name, "directdec");
            }
            other => panic!("expected chain, got {other:?}"),
        }
    }

    #[test]
    fn priority_breaks_ties() {
        let registry = vec![
            transform("dec_slow", CODEC_H264, CODEC_RAW, 200),
            transform("dec_fast", CODEC_H264, CODEC_RAW, 10),
        ];
        let dst = sink("vout", CODEC_RAW);
        let outcome = resolve_link_with(&ctx(&registry), &h264_pid_props(), &dst);
        match outcome {
            ResolveOutcome::Chain { links, .. } => {
                assert_eq!(links[0].reg.name, "dec_fast");
            }
            other => panic!("expected chain, got {other:?}"),
        }
    }

    #[test]
    fn blacklist_excludes_register() {
        let registry = vec![transform("vdec", CODEC_H264, CODEC_RAW, 100)];
        let dst = sink("vout", CODEC_RAW);
        let mut c = ctx(&registry);
        c.blacklist.push("vdec".to_string());
        assert!(matches!(
            resolve_link_with(&c, &h264_pid_props(), &dst),
            ResolveOutcome::NoMatch
        ));
    }

    #[test]
    fn explicit_only_excluded() {
        let mut reg = transform("vdec", CODEC_H264, CODEC_RAW, 100);
        Arc::get_mut(&mut reg).unwrap().explicit_only = true;
        let registry = vec![reg];
        let dst = sink("vout", CODEC_RAW);
        assert!(matches!(
            resolve_link_with(&ctx(&registry), &h264_pid_props(), &dst),
            ResolveOutcome::NoMatch
        ));
    }

    #[test]
    fn forced_registry_wins() {
        let registry = vec![
            transform("dec_fast", CODEC_H264, CODEC_RAW, 10),
            transform("dec_forced", CODEC_H264, CODEC_RAW, 250),
        ];
        let dst = sink("vout", CODEC_RAW);
        let mut c = ctx(&registry);
        c.preferred.push("dec_forced".to_string());
        match resolve_link_with(&c, &h264_pid_props(), &dst) {
            ResolveOutcome::Chain { links, .. } => {
                assert_eq!(links[0].reg.name, "dec_forced");
            }
            other => panic!("expected chain, got {other:?}"),
        }
    }

    #[test]
    fn max_chain_len_bounds_search() {
        let registry = vec![
            transform("reframe", CODEC_H264, 28, 100),
            transform("dec28", 28, CODEC_RAW, 100),
        ];
        let dst = sink("vout", CODEC_RAW);
        let mut c = ctx(&registry);
        c.max_chain_len = 2; // needs 2 filters + the destination hop
        assert!(matches!(
            resolve_link_with(&c, &h264_pid_props(), &dst),
            ResolveOutcome::NoMatch
        ));
    }

    #[test]
    fn no_reentrant_source_registry() {
        // candidate register with the same name as the source filter
        let registry = vec![transform("source", CODEC_H264, CODEC_RAW, 100)];
        let dst = sink("vout", CODEC_RAW);
        assert!(matches!(
            resolve_link_with(&ctx(&registry), &h264_pid_props(), &dst),
            ResolveOutcome::NoMatch
        ));
    }

    #[test]
    fn preferred_collection() {
        let mut out = Vec::new();
        collect_preferred(Some("src=x:freg=a,b:other=1"), &mut out);
        collect_preferred(Some("freg=c"), &mut out);
        collect_preferred(None, &mut out);
        assert_eq!(out, vec!["a", "b", "c"]);
    }
}
