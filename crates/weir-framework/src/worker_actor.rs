//! Per-block execution context.
//!
//! Each block is owned by one actor. The actor's state (block, ports, call
//! registry) sits behind an exclusion interface; the scheduler drives
//! `process_task`, which drains the control mailbox, runs the pre/work/post
//! pipeline, and releases. Control-plane requests arrive through the
//! mailbox and are therefore serialized with the work function.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, warn};

use weir_runtime::actor_interface::ActorInterface;
use weir_runtime::thread_pool::{Schedulable, ThreadPool};
use weir_runtime::wait::{WaitHandle, WaitToken};

use crate::arg::Arg;
use crate::block::{Block, BufferMode, CallFn, PropagateOutputs, WorkContext, WorkInfo};
use crate::buffer::manager::BufferManager;
use crate::dtype::DType;
use crate::error::Error;
use crate::port::inbox::{InputInbox, SlotCall};
use crate::port::input::InputPort;
use crate::port::output::{OutputPort, Subscriber, WakeTarget};

fn next_uid() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

pub(crate) fn micros_since_epoch() -> u64 {
    process_epoch().elapsed().as_micros() as u64
}

/// Inboxes keyed by input port name. Lives outside the actor mutex so
/// producers can resolve a destination inbox without touching the
/// destination actor's lock.
#[derive(Default)]
pub(crate) struct InboxRegistry {
    map: Mutex<HashMap<String, Arc<InputInbox>>>,
}

impl InboxRegistry {
    pub fn get(&self, name: &str) -> Arc<InputInbox> {
        let mut map = self.map.lock().expect("inbox registry poisoned");
        Arc::clone(map.entry(name.to_string()).or_insert_with(InputInbox::new))
    }
}

#[derive(Default)]
pub(crate) struct ActorStats {
    /// Passes that reached the readiness check.
    pub tick_count: AtomicU64,
    pub work_count: AtomicU64,
    pub total_work_nanos: AtomicU64,
    /// Micros since the process epoch at the last work entry; zero means
    /// the block has never worked.
    pub last_work_start_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortAction {
    SubscribeInput,
    SubscribeOutput,
    UnsubscribeInput,
    UnsubscribeOutput,
}

pub(crate) struct PeerPort {
    pub shared: Arc<ActorShared>,
    pub port: String,
}

pub(crate) enum ControlMessage {
    PortSubscriber {
        action: PortAction,
        my_port: String,
        peer: PeerPort,
        reply: WaitToken,
    },
    Activate {
        reply: WaitToken,
    },
    Deactivate {
        reply: WaitToken,
    },
    InstallOutputManager {
        port: String,
        manager: Arc<dyn BufferManager>,
        reply: WaitToken,
    },
}

pub(crate) struct ActorState {
    pub block: Box<dyn Block>,
    pub calls: HashMap<String, CallFn>,
    pub inputs: BTreeMap<String, InputPort>,
    pub outputs: BTreeMap<String, OutputPort>,
    pub mailbox_rx: Receiver<ControlMessage>,
    pub active: bool,
    pub yield_requested: bool,
    pub sticky_error: Option<String>,
    pub work_info: WorkInfo,
}

pub(crate) struct ActorShared {
    pub name: String,
    pub uid: u64,
    pub env_id: u64,
    pub weak_self: Weak<ActorShared>,
    pub inboxes: Arc<InboxRegistry>,
    pub mailbox_tx: Sender<ControlMessage>,
    pub interface: ActorInterface<ActorState>,
    pub stats: ActorStats,
    /// Keeps the dispatching pool alive as long as any handle to the block
    /// exists.
    pub pool: Arc<ThreadPool>,
}

impl WakeTarget for ActorShared {
    fn wake(&self) {
        self.interface.flag_external_change();
    }
}

impl Schedulable for ActorShared {
    fn process_task(&self) {
        let Some(acquired) = self.interface.worker_acquire() else {
            return;
        };
        let flagged = acquired.flagged;
        let mut guard = acquired.guard;
        self.drain_mailbox(&mut guard);
        if flagged {
            self.work_task(&mut guard);
        }
    }

    fn set_wait_mode(&self, enabled: bool) {
        self.interface.enable_wait_mode(enabled);
    }
}

impl ActorShared {
    pub fn send(&self, message: ControlMessage) {
        let _ = self.mailbox_tx.send(message);
        self.interface.flag_external_change();
    }

    pub fn send_port_subscriber(
        &self,
        action: PortAction,
        my_port: String,
        peer: PeerPort,
    ) -> WaitHandle {
        let (reply, handle) = WaitHandle::pair();
        self.send(ControlMessage::PortSubscriber {
            action,
            my_port,
            peer,
            reply,
        });
        handle
    }

    pub fn send_activate(&self) -> WaitHandle {
        let (reply, handle) = WaitHandle::pair();
        self.send(ControlMessage::Activate { reply });
        handle
    }

    pub fn send_deactivate(&self) -> WaitHandle {
        let (reply, handle) = WaitHandle::pair();
        self.send(ControlMessage::Deactivate { reply });
        handle
    }

    pub fn send_install_output_manager(
        &self,
        port: String,
        manager: Arc<dyn BufferManager>,
    ) -> WaitHandle {
        let (reply, handle) = WaitHandle::pair();
        self.send(ControlMessage::InstallOutputManager {
            port,
            manager,
            reply,
        });
        handle
    }

    pub fn last_work_micros(&self) -> u64 {
        self.stats.last_work_start_micros.load(Ordering::Acquire)
    }

    /// Buffer-mode negotiation query, serialized with work via the actor
    /// mutex.
    pub fn input_buffer_mode(&self, name: &str, upstream_domain: &str) -> BufferMode {
        self.interface
            .external_call(|state| state.block.input_buffer_mode(name, upstream_domain))
    }

    pub fn output_buffer_mode(&self, name: &str, downstream_domain: &str) -> BufferMode {
        self.interface
            .external_call(|state| state.block.output_buffer_mode(name, downstream_domain))
    }

    pub fn make_buffer_manager(
        &self,
        name: &str,
        peer_domain: &str,
        is_input: bool,
    ) -> Option<Arc<dyn BufferManager>> {
        self.interface.external_call(|state| {
            if is_input {
                state.block.make_input_buffer_manager(name, peer_domain)
            } else {
                state.block.make_output_buffer_manager(name, peer_domain)
            }
        })
    }

    /// Dispatch a registered call under the actor lock. Serialized with the
    /// work function; the callable's own error propagates.
    pub fn opaque_call(&self, name: &str, args: &[Arg]) -> Result<Arg, Error> {
        self.interface.external_call(|state| {
            let ActorState { block, calls, .. } = state;
            match calls.get_mut(name) {
                // Deref past the box so the downcast sees the block itself.
                Some(call) => call((**block).as_any_mut(), args),
                None => Err(Error::CallNotFound(name.to_string())),
            }
        })
    }

    /// Emit a signal from outside the work context.
    pub fn emit_signal(&self, name: &str, args: Vec<Arg>) -> Result<(), Error> {
        self.interface.external_call(|state| {
            let port = state
                .outputs
                .get_mut(name)
                .filter(|port| port.is_signal())
                .ok_or_else(|| Error::CallNotFound(name.to_string()))?;
            port.emit_signal(args);
            Ok(())
        })
    }

    fn drain_mailbox(&self, state: &mut ActorState) {
        while let Ok(message) = state.mailbox_rx.try_recv() {
            self.handle_control(state, message);
        }
    }

    fn handle_control(&self, state: &mut ActorState, message: ControlMessage) {
        match message {
            ControlMessage::PortSubscriber {
                action,
                my_port,
                peer,
                reply,
            } => {
                let result = match action {
                    PortAction::SubscribeInput => self.subscribe_input(state, &my_port, &peer),
                    PortAction::SubscribeOutput => self.subscribe_output(state, &my_port),
                    PortAction::UnsubscribeInput => self.unsubscribe_input(state, &my_port, &peer),
                    PortAction::UnsubscribeOutput => self.unsubscribe_output(state, &my_port),
                };
                match result {
                    Ok(()) => reply.ok(),
                    Err(err) => reply.fail(err.to_string()),
                }
            }
            ControlMessage::Activate { reply } => {
                state.sticky_error = None;
                match state.block.activate() {
                    Ok(()) => {
                        state.active = true;
                        reply.ok();
                    }
                    Err(err) => {
                        state.active = false;
                        reply.fail(err.to_string());
                    }
                }
            }
            ControlMessage::Deactivate { reply } => {
                state.active = false;
                match state.block.deactivate() {
                    Ok(()) => reply.ok(),
                    Err(err) => reply.fail(err.to_string()),
                }
            }
            ControlMessage::InstallOutputManager {
                port,
                manager,
                reply,
            } => match state.outputs.get_mut(&port) {
                Some(output) => {
                    let weak = self.weak_self.clone();
                    output.set_manager(
                        manager,
                        Arc::new(move || {
                            if let Some(shared) = weak.upgrade() {
                                shared.interface.flag_external_change();
                            }
                        }),
                    );
                    reply.ok();
                }
                None => reply.fail(
                    Error::PortAccess {
                        block: self.name.clone(),
                        port,
                    }
                    .to_string(),
                ),
            },
        }
    }

    /// The destination side of a new flow subscribed onto my output port.
    fn subscribe_input(
        &self,
        state: &mut ActorState,
        my_port: &str,
        peer: &PeerPort,
    ) -> Result<(), Error> {
        self.ensure_output(state, my_port)?;
        let output = state.outputs.get_mut(my_port).expect("ensured above");
        output.add_subscriber(Subscriber {
            port_name: peer.port.clone(),
            block_uid: peer.shared.uid,
            inbox: peer.shared.inboxes.get(&peer.port),
            wake: Arc::clone(&peer.shared) as Arc<dyn WakeTarget>,
        });
        Ok(())
    }

    /// A new producer feeding my input port.
    fn subscribe_output(&self, state: &mut ActorState, my_port: &str) -> Result<(), Error> {
        self.ensure_input(state, my_port)?;
        let input = state.inputs.get_mut(my_port).expect("ensured above");
        input.add_producer();
        Ok(())
    }

    fn unsubscribe_input(
        &self,
        state: &mut ActorState,
        my_port: &str,
        peer: &PeerPort,
    ) -> Result<(), Error> {
        let output = state.outputs.get_mut(my_port).ok_or(Error::PortAccess {
            block: self.name.clone(),
            port: my_port.to_string(),
        })?;
        output.remove_subscriber(peer.shared.uid, &peer.port);
        if output.is_automatic() && !output.has_subscribers() {
            state.outputs.remove(my_port);
        }
        Ok(())
    }

    fn unsubscribe_output(&self, state: &mut ActorState, my_port: &str) -> Result<(), Error> {
        let input = state.inputs.get_mut(my_port).ok_or(Error::PortAccess {
            block: self.name.clone(),
            port: my_port.to_string(),
        })?;
        input.remove_producer();
        if input.is_automatic() && input.producer_count() == 0 {
            state.inputs.remove(my_port);
        }
        Ok(())
    }

    fn ensure_output(&self, state: &mut ActorState, name: &str) -> Result<(), Error> {
        if state.outputs.contains_key(name) {
            return Ok(());
        }
        // A numeric name can be auto-allocated from the nearest lower index.
        let (dtype, domain) = self.auto_port_template(name, |index| {
            state
                .outputs
                .values()
                .filter(|port| port.index().map(|i| i < index).unwrap_or(false))
                .max_by_key(|port| port.index())
                .map(|port| (port.dtype(), port.domain().to_string()))
        })?;
        let mut port = OutputPort::new(name.to_string(), dtype, domain);
        port.mark_automatic();
        state.outputs.insert(name.to_string(), port);
        Ok(())
    }

    fn ensure_input(&self, state: &mut ActorState, name: &str) -> Result<(), Error> {
        if state.inputs.contains_key(name) {
            return Ok(());
        }
        let (dtype, domain) = self.auto_port_template(name, |index| {
            state
                .inputs
                .values()
                .filter(|port| port.index().map(|i| i < index).unwrap_or(false))
                .max_by_key(|port| port.index())
                .map(|port| (port.dtype(), port.domain().to_string()))
        })?;
        let mut port = InputPort::new(
            name.to_string(),
            dtype,
            domain,
            self.inboxes.get(name),
        );
        port.mark_automatic();
        state.inputs.insert(name.to_string(), port);
        Ok(())
    }

    /// dtype/domain for an auto-allocated port, cloned from the highest
    /// existing lower-index sibling.
    fn auto_port_template(
        &self,
        name: &str,
        lower_sibling: impl FnOnce(usize) -> Option<(DType, String)>,
    ) -> Result<(DType, String), Error> {
        let missing = || Error::PortAccess {
            block: self.name.clone(),
            port: name.to_string(),
        };
        let index = name.parse::<usize>().map_err(|_| missing())?;
        lower_sibling(index).ok_or_else(missing)
    }

    fn work_task(&self, state: &mut ActorState) {
        // Pre-work: pull ingress into port state and invoke slot calls.
        let input_names: Vec<String> = state.inputs.keys().cloned().collect();
        for name in &input_names {
            let slot_calls = {
                let input = state.inputs.get_mut(name).expect("known port");
                input.drain_inbox();
                input.take_slot_calls()
            };
            for call in slot_calls {
                self.dispatch_slot_call(state, call);
            }
        }
        for input in state.inputs.values_mut() {
            let reserve_bytes = input.reserve() * input.dtype().size();
            if reserve_bytes > 0 {
                input.merge_front(reserve_bytes);
            }
        }

        state.work_info = compute_work_info(&state.inputs, &state.outputs);
        self.stats.tick_count.fetch_add(1, Ordering::Relaxed);
        if !block_ready(state) {
            return;
        }

        // Work.
        let started = Instant::now();
        self.stats
            .last_work_start_micros
            .store(micros_since_epoch().max(1), Ordering::Release);
        self.stats.work_count.fetch_add(1, Ordering::Relaxed);

        let work_result = {
            let ActorState {
                block,
                inputs,
                outputs,
                yield_requested,
                work_info,
                ..
            } = state;
            let mut io = WorkContext {
                inputs,
                outputs,
                info: *work_info,
                yield_requested,
            };
            catch_unwind(AssertUnwindSafe(|| block.work(&mut io)))
        };
        self.stats
            .total_work_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

        match work_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let message = err.to_string();
                error!(block = %self.name, message, "work failed, deactivating block");
                state.sticky_error = Some(message);
                state.active = false;
            }
            Err(_panic) => {
                error!(block = %self.name, "work panicked, deactivating block");
                state.sticky_error = Some("work panicked".to_string());
                state.active = false;
            }
        }

        // Post-work: dispatch produced regions, then settle consumption and
        // propagate labels per consuming input.
        let mut produced_any = 0usize;
        for output in state.outputs.values_mut() {
            produced_any += output.flush();
        }

        let mut consumed_any = 0usize;
        for name in &input_names {
            let Some((consumed, labels)) = state
                .inputs
                .get_mut(name)
                .map(InputPort::finish_work)
            else {
                continue;
            };
            consumed_any += consumed;
            // Labels can surface on a pass that consumed nothing when they
            // arrive behind data that was already taken.
            if labels.is_empty() {
                continue;
            }
            let ActorState {
                block,
                inputs,
                outputs,
                ..
            } = state;
            let input = inputs.get(name).expect("known port");
            let mut propagate = PropagateOutputs { outputs };
            block.propagate_labels(input, &labels, &mut propagate);
        }

        // Progress or an explicit yield earns another pass without external
        // stimulus.
        if consumed_any > 0 || produced_any > 0 || state.yield_requested {
            state.yield_requested = false;
            self.interface.flag_internal_change();
        }
    }

    fn dispatch_slot_call(&self, state: &mut ActorState, call: SlotCall) {
        let ActorState { block, calls, .. } = state;
        match calls.get_mut(&call.name) {
            Some(callable) => {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    callable((**block).as_any_mut(), &call.args)
                }));
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        warn!(block = %self.name, slot = %call.name, error = %err, "slot call failed");
                    }
                    Err(_panic) => {
                        warn!(block = %self.name, slot = %call.name, "slot call panicked");
                    }
                }
            }
            None => {
                warn!(block = %self.name, slot = %call.name, "no callable registered for slot");
            }
        }
    }
}

fn compute_work_info(
    inputs: &BTreeMap<String, InputPort>,
    outputs: &BTreeMap<String, OutputPort>,
) -> WorkInfo {
    let mut min_in: Option<usize> = None;
    let mut min_out: Option<usize> = None;
    let mut min_all: Option<usize> = None;

    for input in inputs.values() {
        if input.is_slot() {
            continue;
        }
        let available = input.available_elements();
        min_all = Some(min_all.map_or(available, |m| m.min(available)));
        if input.index().is_some() {
            min_in = Some(min_in.map_or(available, |m| m.min(available)));
        }
    }
    for output in outputs.values() {
        if output.is_signal() {
            continue;
        }
        let available = output.elements_available();
        min_all = Some(min_all.map_or(available, |m| m.min(available)));
        if output.index().is_some() {
            min_out = Some(min_out.map_or(available, |m| m.min(available)));
        }
    }

    let min_in_elements = min_in.unwrap_or(0);
    let min_out_elements = min_out.unwrap_or(0);
    let min_elements = match (min_in, min_out) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => 0,
    };
    WorkInfo {
        min_in_elements,
        min_out_elements,
        min_elements,
        min_all_elements: min_all.unwrap_or(0),
    }
}

fn block_ready(state: &ActorState) -> bool {
    if !state.active {
        return false;
    }
    for input in state.inputs.values() {
        if input.is_slot() || input.index().is_none() {
            continue;
        }
        if input.available_elements() < input.reserve() {
            return false;
        }
    }
    for output in state.outputs.values() {
        if output.is_signal() || output.index().is_none() {
            continue;
        }
        if !output.ready() {
            return false;
        }
    }
    true
}

pub(crate) fn new_actor_uid() -> u64 {
    next_uid()
}
