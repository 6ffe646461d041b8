//! The commit pipeline: squash, bridge, rectify, negotiate, subscribe,
//! activate.
//!
//! Control requests return wait handles; each phase issues its whole batch
//! before waiting so independent actors make progress concurrently.
//! Failures are aggregated into one error listing every failing request.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::block::BufferMode;
use crate::blocks::copier::make_copier;
use crate::blocks::network::make_bridge;
use crate::buffer::manager::{BufferManager, BufferManagerArgs, GenericBufferManager};
use crate::error::Error;
use crate::handle::BlockHandle;
use crate::topology::{Connector, Endpoint, Flow, FlowKey, TopologyInner, TopologyState};
use crate::worker_actor::{micros_since_epoch, PeerPort, PortAction};

use weir_runtime::wait::WaitHandle;

pub(crate) fn commit_topology(inner: &TopologyInner) -> Result<(), Error> {
    let mut state = inner.lock();

    // 1) Flatten hierarchy into flows between concrete blocks.
    let squashed = squash_flows(&state.flows);

    // 2) Bridge environment crossings with network blocks.
    let mut used_bridges = HashSet::new();
    let flat = insert_network_bridges(&mut state, squashed, &mut used_bridges);

    // 3) Split flows whose domains cannot share buffers.
    let mut used_adapters = HashSet::new();
    let flat = rectify_domain_flows(&mut state, flat, &mut used_adapters);

    let new_flows: Vec<Flow> = flat
        .iter()
        .filter(|flow| !state.active_flat_flows.contains(flow))
        .cloned()
        .collect();
    let old_flows: Vec<Flow> = state
        .active_flat_flows
        .iter()
        .filter(|flow| !flat.contains(flow))
        .cloned()
        .collect();

    // 4) Subscription wiring and buffer-manager installation, concurrently
    // per environment so bridge endpoints can rendezvous.
    let mut env_groups: BTreeMap<u64, (Vec<Flow>, Vec<Flow>)> = BTreeMap::new();
    for flow in &new_flows {
        if let Some(env) = flow_environment(flow) {
            env_groups.entry(env).or_default().0.push(flow.clone());
        }
    }
    for flow in &old_flows {
        if let Some(env) = flow_environment(flow) {
            env_groups.entry(env).or_default().1.push(flow.clone());
        }
    }

    let mut errors: Vec<String> = Vec::new();
    std::thread::scope(|scope| {
        let mut joins = Vec::new();
        for (new_group, old_group) in env_groups.values() {
            joins.push(scope.spawn(move || sub_commit(new_group, old_group)));
        }
        for join in joins {
            match join.join() {
                Ok(group_errors) => errors.extend(group_errors),
                Err(_) => errors.push("environment commit panicked".to_string()),
            }
        }
    });
    if !errors.is_empty() {
        return Err(Error::TopologyConnect(errors.join("\n")));
    }

    // 5) Activate blocks that joined the graph, record the new flat flows,
    // then deactivate blocks that left it.
    let mut lifecycle = Vec::new();
    let previously_active = blocks_of(&state.active_flat_flows);
    for block in blocks_of(&new_flows) {
        if previously_active.contains(&block) {
            continue;
        }
        lifecycle.push((
            format!("{}.activate()", block.name()),
            block.shared.send_activate(),
        ));
    }

    state.active_flat_flows = flat;
    state.last_commit_micros = micros_since_epoch();

    let still_active = blocks_of(&state.active_flat_flows);
    for block in blocks_of(&old_flows) {
        if still_active.contains(&block) {
            continue;
        }
        lifecycle.push((
            format!("{}.deactivate()", block.name()),
            block.shared.send_deactivate(),
        ));
    }

    let errors = collect_wait_errors(lifecycle);
    if !errors.is_empty() {
        return Err(Error::TopologyConnect(errors.join("\n")));
    }

    // Keep only the bridges and adapters still backing a live flow.
    state
        .netgress_cache
        .retain(|key, _| used_bridges.contains(key));
    state
        .adapter_cache
        .retain(|key, _| used_adapters.contains(key));
    Ok(())
}

/// Recursively expand sub-topologies into flows between concrete blocks.
pub(crate) fn squash_flows(flows: &[Flow]) -> Vec<Flow> {
    let mut result: Vec<Flow> = Vec::new();
    for flow in flows {
        for src in resolve_sources(&flow.src) {
            for dst in resolve_destinations(&flow.dst) {
                let flat = Flow {
                    src: src.clone(),
                    dst,
                };
                if !result.contains(&flat) {
                    result.push(flat);
                }
            }
        }
    }
    result
}

fn resolve_sources(endpoint: &Endpoint) -> Vec<Endpoint> {
    match &endpoint.node {
        Connector::Block(_) => vec![endpoint.clone()],
        // A pass-through port of the topology being committed has no
        // concrete producer behind it.
        Connector::SelfPort(_) => Vec::new(),
        Connector::Topology(sub) => {
            let sub_uid = sub.uid();
            let flows = sub.inner.lock().flows.clone();
            flows
                .iter()
                .filter(|flow| {
                    matches!(&flow.dst.node, Connector::SelfPort(uid) if *uid == sub_uid)
                        && flow.dst.port == endpoint.port
                })
                .flat_map(|flow| resolve_sources(&flow.src))
                .collect()
        }
    }
}

fn resolve_destinations(endpoint: &Endpoint) -> Vec<Endpoint> {
    match &endpoint.node {
        Connector::Block(_) => vec![endpoint.clone()],
        Connector::SelfPort(_) => Vec::new(),
        Connector::Topology(sub) => {
            let sub_uid = sub.uid();
            let flows = sub.inner.lock().flows.clone();
            flows
                .iter()
                .filter(|flow| {
                    matches!(&flow.src.node, Connector::SelfPort(uid) if *uid == sub_uid)
                        && flow.src.port == endpoint.port
                })
                .flat_map(|flow| resolve_destinations(&flow.dst))
                .collect()
        }
    }
}

fn flow_key(flow: &Flow) -> FlowKey {
    (
        flow.src.node.uid(),
        flow.src.port.clone(),
        flow.dst.node.uid(),
        flow.dst.port.clone(),
    )
}

fn flow_environment(flow: &Flow) -> Option<u64> {
    flow.src.block().map(BlockHandle::environment)
}

fn insert_network_bridges(
    state: &mut TopologyState,
    flows: Vec<Flow>,
    used: &mut HashSet<FlowKey>,
) -> Vec<Flow> {
    let mut result = Vec::new();
    for flow in flows {
        let (Some(src_block), Some(dst_block)) = (flow.src.block(), flow.dst.block()) else {
            continue;
        };
        if src_block.environment() == dst_block.environment() {
            result.push(flow);
            continue;
        }

        let key = flow_key(&flow);
        let dtype = src_block
            .output_info(flow.src.port())
            .map(|info| info.dtype)
            .unwrap_or_default();
        let (sink, source) = state
            .netgress_cache
            .entry(key.clone())
            .or_insert_with(|| {
                make_bridge(dtype, src_block.environment(), dst_block.environment())
            })
            .clone();
        used.insert(key);

        result.push(Flow {
            src: flow.src.clone(),
            dst: Endpoint::block_port(sink, "0"),
        });
        result.push(Flow {
            src: Endpoint::block_port(source, "0"),
            dst: flow.dst.clone(),
        });
    }
    result
}

fn domains_compatible(a: &str, b: &str) -> bool {
    a.is_empty() || b.is_empty() || a == b
}

fn rectify_domain_flows(
    state: &mut TopologyState,
    flows: Vec<Flow>,
    used: &mut HashSet<FlowKey>,
) -> Vec<Flow> {
    let mut result = Vec::new();
    for flow in flows {
        let (Some(src_block), Some(dst_block)) = (flow.src.block(), flow.dst.block()) else {
            continue;
        };
        let src_info = src_block.output_info(flow.src.port()).ok();
        let src_domain = src_info
            .as_ref()
            .map(|info| info.domain.clone())
            .unwrap_or_default();
        let dst_domain = dst_block
            .input_info(flow.dst.port())
            .map(|info| info.domain)
            .unwrap_or_default();
        if domains_compatible(&src_domain, &dst_domain) {
            result.push(flow);
            continue;
        }

        // A side that takes custody of the peer's domain keeps the direct
        // flow; otherwise a copier spans the gap.
        let src_mode = src_block.output_buffer_mode(flow.src.port(), &dst_domain);
        let dst_mode = dst_block.input_buffer_mode(flow.dst.port(), &src_domain);
        if src_mode == BufferMode::Custom || dst_mode == BufferMode::Custom {
            result.push(flow);
            continue;
        }

        let key = flow_key(&flow);
        let dtype = src_info.map(|info| info.dtype).unwrap_or_default();
        let env = src_block.environment();
        let copier = state
            .adapter_cache
            .entry(key.clone())
            .or_insert_with(|| make_copier(dtype, env))
            .clone();
        used.insert(key);

        result.push(Flow {
            src: flow.src.clone(),
            dst: Endpoint::block_port(copier.clone(), "0"),
        });
        result.push(Flow {
            src: Endpoint::block_port(copier, "0"),
            dst: flow.dst.clone(),
        });
    }
    result
}

/// Subscription wiring plus manager installation for one environment's
/// share of the diff. Returns the collected failure messages.
fn sub_commit(new_flows: &[Flow], old_flows: &[Flow]) -> Vec<String> {
    let phases: [(&str, PortAction, &[Flow], bool); 4] = [
        ("subscribe_input", PortAction::SubscribeInput, new_flows, true),
        ("subscribe_output", PortAction::SubscribeOutput, new_flows, false),
        ("unsubscribe_output", PortAction::UnsubscribeOutput, old_flows, false),
        ("unsubscribe_input", PortAction::UnsubscribeInput, old_flows, true),
    ];

    for (label, action, flows, to_source) in phases {
        let mut handles = Vec::new();
        for flow in flows {
            let (Some(src), Some(dst)) = (flow.src.block(), flow.dst.block()) else {
                continue;
            };
            let (primary, primary_port, peer, peer_port) = if to_source {
                (src, flow.src.port(), dst, flow.dst.port())
            } else {
                (dst, flow.dst.port(), src, flow.src.port())
            };
            let handle = primary.shared.send_port_subscriber(
                action,
                primary_port.to_string(),
                PeerPort {
                    shared: Arc::clone(&peer.shared),
                    port: peer_port.to_string(),
                },
            );
            handles.push((
                format!("{}.{}({})", primary.name(), label, primary_port),
                handle,
            ));
        }
        let errors = collect_wait_errors(handles);
        if !errors.is_empty() {
            return errors;
        }
    }

    install_buffer_managers(new_flows)
}

/// Negotiate and install a buffer manager on every new source port.
fn install_buffer_managers(new_flows: &[Flow]) -> Vec<String> {
    // Source port -> all of its destinations, preserving flow order.
    let mut sources: Vec<(Endpoint, Vec<Endpoint>)> = Vec::new();
    for flow in new_flows {
        if flow.src.block().is_none() || flow.dst.block().is_none() {
            continue;
        }
        match sources.iter_mut().find(|(src, _)| *src == flow.src) {
            Some((_, dsts)) => dsts.push(flow.dst.clone()),
            None => sources.push((flow.src.clone(), vec![flow.dst.clone()])),
        }
    }

    let mut errors = Vec::new();
    let mut handles = Vec::new();
    'sources: for (src, dsts) in sources {
        let src_block = src.block().expect("filtered above");
        let src_port = src.port();
        let info = match src_block.output_info(src_port) {
            Ok(info) => info,
            Err(err) => {
                errors.push(format!("{}[{}]: {}", src_block.name(), src_port, err));
                continue;
            }
        };
        // Signal ports carry messages, not buffers.
        if info.is_signal {
            continue;
        }

        let first_dst = &dsts[0];
        let first_dst_block = first_dst.block().expect("filtered above");
        let dst_domain = first_dst_block
            .input_info(first_dst.port())
            .map(|dst_info| dst_info.domain)
            .unwrap_or_default();

        let src_mode = src_block.output_buffer_mode(src_port, &dst_domain);
        let dst_mode = first_dst_block.input_buffer_mode(first_dst.port(), &info.domain);

        let manager: Arc<dyn BufferManager> = if src_mode == BufferMode::Custom {
            match src_block.make_buffer_manager(src_port, &dst_domain, false) {
                Some(manager) => manager,
                None => {
                    errors.push(format!(
                        "{}[{}]: declared a custom buffer manager but supplied none",
                        src_block.name(),
                        src_port
                    ));
                    continue;
                }
            }
        } else if dst_mode == BufferMode::Custom {
            for other in &dsts[1..] {
                let other_block = other.block().expect("filtered above");
                if other_block.input_buffer_mode(other.port(), &info.domain) != BufferMode::Abdicate
                {
                    errors.push(format!(
                        "{}[{}]: multiple destinations with custom buffer managers",
                        src_block.name(),
                        src_port
                    ));
                    continue 'sources;
                }
            }
            match first_dst_block.make_buffer_manager(first_dst.port(), &info.domain, true) {
                Some(manager) => manager,
                None => {
                    errors.push(format!(
                        "{}[{}]: destination declared a custom buffer manager but supplied none",
                        first_dst_block.name(),
                        first_dst.port()
                    ));
                    continue;
                }
            }
        } else {
            GenericBufferManager::new(BufferManagerArgs::for_dtype(info.dtype))
        };

        handles.push((
            format!(
                "{}.install_output_manager({})",
                src_block.name(),
                src_port
            ),
            src_block
                .shared
                .send_install_output_manager(src_port.to_string(), manager),
        ));
    }

    errors.extend(collect_wait_errors(handles));
    errors
}

fn collect_wait_errors(handles: Vec<(String, WaitHandle)>) -> Vec<String> {
    let mut errors = Vec::new();
    for (label, handle) in handles {
        let info = handle.wait_info();
        if !info.is_empty() {
            errors.push(format!("{label}: {info}"));
        }
    }
    errors
}

/// Unique blocks appearing in any of the flows, in first-seen order.
pub(crate) fn blocks_of(flows: &[Flow]) -> Vec<BlockHandle> {
    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    for flow in flows {
        for endpoint in [&flow.src, &flow.dst] {
            if let Some(block) = endpoint.block() {
                if seen.insert(block.uid()) {
                    blocks.push(block.clone());
                }
            }
        }
    }
    blocks
}
