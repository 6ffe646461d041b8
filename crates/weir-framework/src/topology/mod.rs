//! Topologies: hierarchical containers of data flows.
//!
//! A topology records flows between blocks (and sub-topologies). Nothing
//! executes until `commit`, which flattens the graph, negotiates buffer
//! managers, wires subscriptions, and activates blocks. Connecting a
//! topology to itself creates pass-through ports, which is how hierarchy
//! composes.

pub(crate) mod commit;
mod dot;
mod json;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::Error;
use crate::handle::{BlockHandle, PortName};
use crate::worker_actor::{micros_since_epoch, new_actor_uid};

/// Cache key identifying a user-level flow by endpoint identity.
pub(crate) type FlowKey = (u64, String, u64, String);

/// One end of a flow.
#[derive(Clone)]
pub enum Connector {
    Block(BlockHandle),
    Topology(Topology),
    /// A pass-through port surface of the topology with this uid. Recorded
    /// when a topology is connected to itself; resolved during flattening.
    SelfPort(u64),
}

impl Connector {
    pub(crate) fn uid(&self) -> u64 {
        match self {
            Connector::Block(block) => block.uid(),
            Connector::Topology(topology) => topology.uid(),
            Connector::SelfPort(uid) => *uid,
        }
    }

    pub(crate) fn display_name(&self) -> String {
        match self {
            Connector::Block(block) => block.name().to_string(),
            Connector::Topology(topology) => topology.name().to_string(),
            Connector::SelfPort(_) => "self".to_string(),
        }
    }
}

impl PartialEq for Connector {
    fn eq(&self, other: &Self) -> bool {
        self.uid() == other.uid()
    }
}

impl Eq for Connector {}

impl From<&BlockHandle> for Connector {
    fn from(block: &BlockHandle) -> Self {
        Connector::Block(block.clone())
    }
}

impl From<BlockHandle> for Connector {
    fn from(block: BlockHandle) -> Self {
        Connector::Block(block)
    }
}

impl From<&Topology> for Connector {
    fn from(topology: &Topology) -> Self {
        Connector::Topology(topology.clone())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub(crate) node: Connector,
    pub(crate) port: String,
}

impl Endpoint {
    pub(crate) fn block_port(block: BlockHandle, port: impl Into<String>) -> Endpoint {
        Endpoint {
            node: Connector::Block(block),
            port: port.into(),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// The concrete block at this endpoint, when there is one.
    pub fn block(&self) -> Option<&BlockHandle> {
        match &self.node {
            Connector::Block(block) => Some(block),
            _ => None,
        }
    }
}

/// A directed connection from an output port to an input port. Flows are
/// values compared by endpoint identity and port names.
#[derive(Clone, PartialEq, Eq)]
pub struct Flow {
    pub(crate) src: Endpoint,
    pub(crate) dst: Endpoint,
}

impl Flow {
    pub fn src(&self) -> &Endpoint {
        &self.src
    }

    pub fn dst(&self) -> &Endpoint {
        &self.dst
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}] -> {}[{}]",
            self.src.node.display_name(),
            self.src.port,
            self.dst.node.display_name(),
            self.dst.port
        )
    }
}

pub(crate) struct TopologyState {
    pub flows: Vec<Flow>,
    pub active_flat_flows: Vec<Flow>,
    /// Bridge pairs (sink, source) keyed by the user flow they replace.
    pub netgress_cache: HashMap<FlowKey, (BlockHandle, BlockHandle)>,
    /// Domain adapters keyed by the user flow they split.
    pub adapter_cache: HashMap<FlowKey, BlockHandle>,
    pub last_commit_micros: u64,
}

pub(crate) struct TopologyInner {
    pub name: String,
    pub uid: u64,
    pub state: Mutex<TopologyState>,
}

impl TopologyInner {
    pub fn lock(&self) -> MutexGuard<'_, TopologyState> {
        self.state.lock().expect("topology state poisoned")
    }
}

impl Drop for TopologyInner {
    fn drop(&mut self) {
        // Tear down every subscription before the block handles go away.
        let had_flows = {
            let mut state = self.lock();
            let had = !state.flows.is_empty() || !state.active_flat_flows.is_empty();
            state.flows.clear();
            had
        };
        if had_flows {
            if let Err(err) = commit::commit_topology(self) {
                warn!(topology = %self.name, error = %err, "teardown commit failed");
            }
        }
    }
}

#[derive(Clone)]
pub struct Topology {
    pub(crate) inner: Arc<TopologyInner>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("name", &self.inner.name)
            .field("uid", &self.inner.uid)
            .finish()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Topology::new("topology")
    }
}

impl Topology {
    pub fn new(name: impl Into<String>) -> Topology {
        Topology {
            inner: Arc::new(TopologyInner {
                name: name.into(),
                uid: new_actor_uid(),
                state: Mutex::new(TopologyState {
                    flows: Vec::new(),
                    active_flat_flows: Vec::new(),
                    netgress_cache: HashMap::new(),
                    adapter_cache: HashMap::new(),
                    last_commit_micros: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn uid(&self) -> u64 {
        self.inner.uid
    }

    fn resolve(&self, connector: Connector) -> Connector {
        match connector {
            Connector::Topology(topology) if topology.uid() == self.uid() => {
                Connector::SelfPort(self.uid())
            }
            other => other,
        }
    }

    /// Record a flow from `src[src_port]` to `dst[dst_port]`. Takes effect
    /// at the next `commit`.
    pub fn connect(
        &self,
        src: impl Into<Connector>,
        src_port: impl PortName,
        dst: impl Into<Connector>,
        dst_port: impl PortName,
    ) -> Result<(), Error> {
        let flow = Flow {
            src: Endpoint {
                node: self.resolve(src.into()),
                port: src_port.to_port_name(),
            },
            dst: Endpoint {
                node: self.resolve(dst.into()),
                port: dst_port.to_port_name(),
            },
        };
        let mut state = self.inner.lock();
        if state.flows.contains(&flow) {
            return Err(Error::TopologyConnect(format!(
                "flow already connected: {flow:?}"
            )));
        }
        state.flows.push(flow);
        Ok(())
    }

    /// Remove a previously connected flow. Takes effect at the next
    /// `commit`.
    pub fn disconnect(
        &self,
        src: impl Into<Connector>,
        src_port: impl PortName,
        dst: impl Into<Connector>,
        dst_port: impl PortName,
    ) -> Result<(), Error> {
        let flow = Flow {
            src: Endpoint {
                node: self.resolve(src.into()),
                port: src_port.to_port_name(),
            },
            dst: Endpoint {
                node: self.resolve(dst.into()),
                port: dst_port.to_port_name(),
            },
        };
        let mut state = self.inner.lock();
        let before = state.flows.len();
        state.flows.retain(|existing| existing != &flow);
        if state.flows.len() == before {
            return Err(Error::TopologyConnect(format!(
                "no such flow to disconnect: {flow:?}"
            )));
        }
        Ok(())
    }

    /// Remove every flow, optionally recursing into sub-topologies. Takes
    /// effect at the next `commit`.
    pub fn disconnect_all(&self, recursive: bool) {
        let flows = {
            let mut state = self.inner.lock();
            std::mem::take(&mut state.flows)
        };
        if recursive {
            for flow in &flows {
                for node in [&flow.src.node, &flow.dst.node] {
                    if let Connector::Topology(sub) = node {
                        sub.disconnect_all(true);
                    }
                }
            }
        }
    }

    /// Flatten, rectify, install, subscribe, and activate. See the commit
    /// pipeline for the phase breakdown.
    pub fn commit(&self) -> Result<(), Error> {
        commit::commit_topology(&self.inner)
    }

    /// The flows as the user recorded them.
    pub fn flows(&self) -> Vec<Flow> {
        self.inner.lock().flows.clone()
    }

    /// The flat flows currently executing, as of the last commit.
    pub fn active_flows(&self) -> Vec<Flow> {
        self.inner.lock().active_flat_flows.clone()
    }

    /// Block until no actor in the active graph has entered work for at
    /// least `idle_secs`, or until `timeout_secs` elapses. Returns true on
    /// quiescence.
    pub fn wait_inactive(&self, idle_secs: f64, timeout_secs: f64) -> bool {
        let idle_micros = (idle_secs.max(0.0) * 1e6) as u64;
        let deadline = Instant::now() + Duration::from_secs_f64(timeout_secs.max(0.0));
        loop {
            let (blocks, commit_micros) = {
                let state = self.inner.lock();
                (
                    commit::blocks_of(&state.active_flat_flows),
                    state.last_commit_micros,
                )
            };
            let reference = blocks
                .iter()
                .map(BlockHandle::last_work_micros)
                .max()
                .unwrap_or(0)
                .max(commit_micros);
            if micros_since_epoch().saturating_sub(reference) >= idle_micros {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Render the topology as dot markup. `config` is a JSON object with
    /// optional keys `mode` (`"flat"` or `"top"`) and `port` (`"all"` or
    /// `"connected"`); an empty string selects the defaults.
    pub fn to_dot_markup(&self, config: &str) -> Result<String, Error> {
        dot::render(self, config)
    }
}

impl PartialEq for Topology {
    fn eq(&self, other: &Self) -> bool {
        self.uid() == other.uid()
    }
}

impl Eq for Topology {}
