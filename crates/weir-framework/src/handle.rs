//! Public handles for constructing and controlling blocks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use weir_runtime::actor_interface::ActorInterface;
use weir_runtime::thread_pool::{Schedulable, ThreadPool};

use crate::arg::Arg;
use crate::block::{Block, BufferMode, CallFn};
use crate::buffer::manager::BufferManager;
use crate::dtype::DType;
use crate::error::Error;
use crate::port::input::InputPort;
use crate::port::output::OutputPort;
use crate::worker_actor::{new_actor_uid, ActorShared, ActorState, ActorStats, InboxRegistry};

/// Port identifiers may be strings or numeric indexes; numeric names are
/// their decimal spelling.
pub trait PortName {
    fn to_port_name(&self) -> String;
}

impl PortName for &str {
    fn to_port_name(&self) -> String {
        (*self).to_string()
    }
}

impl PortName for String {
    fn to_port_name(&self) -> String {
        self.clone()
    }
}

impl PortName for usize {
    fn to_port_name(&self) -> String {
        self.to_string()
    }
}

/// Work-loop statistics for one block.
#[derive(Debug, Clone, Copy)]
pub struct WorkStats {
    /// Scheduler passes that evaluated this block's readiness.
    pub tick_count: u64,
    pub work_count: u64,
    pub total_work_time: std::time::Duration,
    /// Time since the block last entered work; `None` if it never has.
    pub last_work_age: Option<std::time::Duration>,
}

/// Introspection record for one port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub dtype: DType,
    pub domain: String,
    pub is_signal: bool,
    pub is_slot: bool,
    /// Elements consumed (inputs) or produced (outputs) so far.
    pub total_elements: u64,
}

struct PortDecl {
    name: String,
    dtype: DType,
    domain: String,
    reserve: usize,
    special: bool,
}

/// Staged construction of a block and its actor.
pub struct BlockBuilder {
    name: String,
    env_id: u64,
    block: Box<dyn Block>,
    inputs: Vec<PortDecl>,
    outputs: Vec<PortDecl>,
    calls: Vec<(String, CallFn)>,
    pool: Option<Arc<ThreadPool>>,
}

impl BlockBuilder {
    pub fn new(name: impl Into<String>, block: impl Block) -> BlockBuilder {
        BlockBuilder {
            name: name.into(),
            env_id: 0,
            block: Box::new(block),
            inputs: Vec::new(),
            outputs: Vec::new(),
            calls: Vec::new(),
            pool: None,
        }
    }

    pub fn input(mut self, name: impl PortName, dtype: DType, domain: &str) -> Self {
        self.inputs.push(PortDecl {
            name: name.to_port_name(),
            dtype,
            domain: domain.to_string(),
            reserve: 0,
            special: false,
        });
        self
    }

    pub fn output(mut self, name: impl PortName, dtype: DType, domain: &str) -> Self {
        self.outputs.push(PortDecl {
            name: name.to_port_name(),
            dtype,
            domain: domain.to_string(),
            reserve: 0,
            special: false,
        });
        self
    }

    /// Minimum elements the named input must hold before work runs.
    pub fn reserve(mut self, name: impl PortName, elements: usize) -> Self {
        let name = name.to_port_name();
        if let Some(decl) = self.inputs.iter_mut().find(|decl| decl.name == name) {
            decl.reserve = elements;
        }
        self
    }

    /// Declare a signal port: control-plane one-to-many dispatch that
    /// bypasses buffer flow.
    pub fn signal(mut self, name: &str) -> Self {
        self.outputs.push(PortDecl {
            name: name.to_string(),
            dtype: DType::default(),
            domain: String::new(),
            reserve: 0,
            special: true,
        });
        self
    }

    /// Declare a slot port able to accept signal messages. Registering a
    /// call creates its slot automatically; this is for slots handled some
    /// other way.
    pub fn slot(mut self, name: &str) -> Self {
        self.inputs.push(PortDecl {
            name: name.to_string(),
            dtype: DType::default(),
            domain: String::new(),
            reserve: 0,
            special: true,
        });
        self
    }

    /// Register a named call on the block. A slot of the same name is
    /// registered along with it, so connected signals invoke the callable.
    pub fn call<B, F>(mut self, name: &str, mut f: F) -> Self
    where
        B: Block,
        F: FnMut(&mut B, &[Arg]) -> Result<Arg, Error> + Send + 'static,
    {
        let call_name = name.to_string();
        let callable: CallFn = Box::new(move |block, args| {
            let block = block
                .downcast_mut::<B>()
                .ok_or(Error::ArgCast {
                    expected: std::any::type_name::<B>(),
                    found: "block of another type",
                })?;
            f(block, args)
        });
        self.calls.push((call_name, callable));
        self
    }

    /// Environment the block executes in. Flows crossing environments are
    /// bridged with network blocks at commit time.
    pub fn environment(mut self, env_id: u64) -> Self {
        self.env_id = env_id;
        self
    }

    pub fn thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> BlockHandle {
        let (mailbox_tx, mailbox_rx) = crossbeam_channel::unbounded();
        let inboxes = Arc::new(InboxRegistry::default());

        let mut inputs = BTreeMap::new();
        for decl in self.inputs {
            let mut port = InputPort::new(
                decl.name.clone(),
                decl.dtype,
                decl.domain,
                inboxes.get(&decl.name),
            );
            port.set_reserve(decl.reserve);
            if decl.special {
                port.mark_slot();
            }
            inputs.insert(decl.name, port);
        }

        let mut outputs = BTreeMap::new();
        for decl in self.outputs {
            let mut port = OutputPort::new(decl.name.clone(), decl.dtype, decl.domain);
            if decl.special {
                port.mark_signal();
            }
            outputs.insert(decl.name, port);
        }

        let mut calls: HashMap<String, CallFn> = HashMap::new();
        for (name, callable) in self.calls {
            if !inputs.contains_key(&name) {
                let mut slot =
                    InputPort::new(name.clone(), DType::default(), String::new(), inboxes.get(&name));
                slot.mark_slot();
                inputs.insert(name.clone(), slot);
            }
            calls.insert(name, callable);
        }

        let state = ActorState {
            block: self.block,
            calls,
            inputs,
            outputs,
            mailbox_rx,
            active: false,
            yield_requested: false,
            sticky_error: None,
            work_info: Default::default(),
        };

        let pool = self.pool.unwrap_or_else(ThreadPool::default_pool);
        let shared = Arc::new_cyclic(|weak_self| ActorShared {
            name: self.name,
            uid: new_actor_uid(),
            env_id: self.env_id,
            weak_self: weak_self.clone(),
            inboxes,
            mailbox_tx,
            interface: ActorInterface::new(state),
            stats: ActorStats::default(),
            pool: Arc::clone(&pool),
        });
        pool.register(&(Arc::clone(&shared) as Arc<dyn Schedulable>));
        BlockHandle { shared }
    }
}

/// Shared handle to a running block. Cheap to clone; controls the block's
/// actor from the control plane.
#[derive(Clone)]
pub struct BlockHandle {
    pub(crate) shared: Arc<ActorShared>,
}

impl BlockHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn uid(&self) -> u64 {
        self.shared.uid
    }

    pub fn environment(&self) -> u64 {
        self.shared.env_id
    }

    /// Invoke a registered call. Serialized with the block's work function.
    pub fn call(&self, name: &str, args: &[Arg]) -> Result<Arg, Error> {
        self.shared.opaque_call(name, args)
    }

    /// Emit a signal with the given args to every subscribed slot.
    pub fn emit_signal(&self, name: &str, args: Vec<Arg>) -> Result<(), Error> {
        self.shared.emit_signal(name, args)
    }

    pub fn input_port_names(&self) -> Vec<String> {
        self.shared
            .interface
            .external_call(|state| state.inputs.keys().cloned().collect())
    }

    pub fn output_port_names(&self) -> Vec<String> {
        self.shared
            .interface
            .external_call(|state| state.outputs.keys().cloned().collect())
    }

    pub fn input_info(&self, name: impl PortName) -> Result<PortInfo, Error> {
        let name = name.to_port_name();
        self.shared.interface.external_call(|state| {
            state
                .inputs
                .get(&name)
                .map(|port| PortInfo {
                    name: port.name().to_string(),
                    dtype: port.dtype(),
                    domain: port.domain().to_string(),
                    is_signal: false,
                    is_slot: port.is_slot(),
                    total_elements: port.total_consumed(),
                })
                .ok_or(Error::PortAccess {
                    block: self.shared.name.clone(),
                    port: name.clone(),
                })
        })
    }

    pub fn output_info(&self, name: impl PortName) -> Result<PortInfo, Error> {
        let name = name.to_port_name();
        self.shared.interface.external_call(|state| {
            state
                .outputs
                .get(&name)
                .map(|port| PortInfo {
                    name: port.name().to_string(),
                    dtype: port.dtype(),
                    domain: port.domain().to_string(),
                    is_signal: port.is_signal(),
                    is_slot: false,
                    total_elements: port.total_produced(),
                })
                .ok_or(Error::PortAccess {
                    block: self.shared.name.clone(),
                    port: name.clone(),
                })
        })
    }

    pub fn work_stats(&self) -> WorkStats {
        use std::sync::atomic::Ordering;
        let last = self.shared.stats.last_work_start_micros.load(Ordering::Acquire);
        WorkStats {
            tick_count: self.shared.stats.tick_count.load(Ordering::Relaxed),
            work_count: self.shared.stats.work_count.load(Ordering::Relaxed),
            total_work_time: std::time::Duration::from_nanos(
                self.shared.stats.total_work_nanos.load(Ordering::Relaxed),
            ),
            last_work_age: (last > 0).then(|| {
                let now = crate::worker_actor::micros_since_epoch();
                std::time::Duration::from_micros(now.saturating_sub(last))
            }),
        }
    }

    /// The sticky error recorded when work failed, if any.
    pub fn work_error(&self) -> Option<String> {
        self.shared
            .interface
            .external_call(|state| state.sticky_error.clone())
    }

    pub fn is_active(&self) -> bool {
        self.shared.interface.external_call(|state| state.active)
    }

    pub(crate) fn input_buffer_mode(&self, name: &str, upstream_domain: &str) -> BufferMode {
        self.shared.input_buffer_mode(name, upstream_domain)
    }

    pub(crate) fn output_buffer_mode(&self, name: &str, downstream_domain: &str) -> BufferMode {
        self.shared.output_buffer_mode(name, downstream_domain)
    }

    pub(crate) fn make_buffer_manager(
        &self,
        name: &str,
        peer_domain: &str,
        is_input: bool,
    ) -> Option<Arc<dyn BufferManager>> {
        self.shared.make_buffer_manager(name, peer_domain, is_input)
    }

    pub(crate) fn last_work_micros(&self) -> u64 {
        self.shared.last_work_micros()
    }
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockHandle({} #{})", self.shared.name, self.shared.uid)
    }
}

impl PartialEq for BlockHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.uid == other.shared.uid
    }
}

impl Eq for BlockHandle {}
