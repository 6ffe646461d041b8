//! The block trait and the context handed to its work function.

use std::any::Any;
use std::collections::BTreeMap;

use crate::arg::Arg;
use crate::buffer::manager::BufferManager;
use crate::error::Error;
use crate::label::Label;
use crate::port::input::InputPort;
use crate::port::output::OutputPort;

/// Downcast support for call dispatch on type-erased blocks.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// How a block answers a buffer-manager negotiation for one of its ports
/// given the peer's memory domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Defer to the peer (or to a generic pool when both sides defer).
    Abdicate,
    /// This side supplies the manager for the edge.
    Custom,
}

/// A user-defined processing unit. Implementations read from input ports
/// and write to output ports inside `work`; everything else has a default.
pub trait Block: AsAny + Send + 'static {
    /// Called by the worker thread when input data and output space are
    /// available. Never blocks; long waits return and yield instead.
    fn work(&mut self, io: &mut WorkContext<'_>) -> Result<(), Error> {
        let _ = io;
        Ok(())
    }

    /// Hook invoked when topology execution begins for this block.
    fn activate(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Hook invoked when topology execution ends for this block.
    fn deactivate(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Forward labels from a consumed input to the output ports. The default
    /// sends every label to every output, scaled by the element-rate ratio.
    fn propagate_labels(
        &mut self,
        input: &InputPort,
        labels: &[Label],
        outputs: &mut PropagateOutputs<'_>,
    ) {
        outputs.default_propagate(input, labels);
    }

    fn input_buffer_mode(&self, name: &str, upstream_domain: &str) -> BufferMode {
        let _ = (name, upstream_domain);
        BufferMode::Abdicate
    }

    fn output_buffer_mode(&self, name: &str, downstream_domain: &str) -> BufferMode {
        let _ = (name, downstream_domain);
        BufferMode::Abdicate
    }

    /// Supply a replacement manager for the upstream side of an input port.
    /// `None` abdicates.
    fn make_input_buffer_manager(
        &self,
        name: &str,
        upstream_domain: &str,
    ) -> Option<std::sync::Arc<dyn BufferManager>> {
        let _ = (name, upstream_domain);
        None
    }

    /// Supply the manager for an output port. `None` abdicates.
    fn make_output_buffer_manager(
        &self,
        name: &str,
        downstream_domain: &str,
    ) -> Option<std::sync::Arc<dyn BufferManager>> {
        let _ = (name, downstream_domain);
        None
    }
}

/// Registered call: a closure over the type-erased block plus the opaque
/// argument list.
pub(crate) type CallFn = Box<dyn FnMut(&mut dyn Any, &[Arg]) -> Result<Arg, Error> + Send>;

/// Snapshot of per-work-call element availability. Valid only during `work`
/// and `propagate_labels`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkInfo {
    /// Minimum available elements across the indexed input ports.
    pub min_in_elements: usize,
    /// Minimum writable elements across the indexed output ports.
    pub min_out_elements: usize,
    /// Minimum of the two indexed bounds.
    pub min_elements: usize,
    /// Minimum across every streaming port, named ports included.
    pub min_all_elements: usize,
}

/// Port access for a single work invocation.
pub struct WorkContext<'a> {
    pub(crate) inputs: &'a mut BTreeMap<String, InputPort>,
    pub(crate) outputs: &'a mut BTreeMap<String, OutputPort>,
    pub(crate) info: WorkInfo,
    pub(crate) yield_requested: &'a mut bool,
}

impl WorkContext<'_> {
    pub fn info(&self) -> WorkInfo {
        self.info
    }

    /// The indexed input port `index`.
    pub fn input(&mut self, index: usize) -> Result<&mut InputPort, Error> {
        self.inputs
            .values_mut()
            .find(|port| port.index() == Some(index))
            .ok_or(Error::PortAccess {
                block: String::new(),
                port: index.to_string(),
            })
    }

    pub fn input_named(&mut self, name: &str) -> Result<&mut InputPort, Error> {
        self.inputs.get_mut(name).ok_or(Error::PortAccess {
            block: String::new(),
            port: name.to_string(),
        })
    }

    /// The indexed output port `index`.
    pub fn output(&mut self, index: usize) -> Result<&mut OutputPort, Error> {
        self.outputs
            .values_mut()
            .find(|port| port.index() == Some(index))
            .ok_or(Error::PortAccess {
                block: String::new(),
                port: index.to_string(),
            })
    }

    pub fn output_named(&mut self, name: &str) -> Result<&mut OutputPort, Error> {
        self.outputs.get_mut(name).ok_or(Error::PortAccess {
            block: String::new(),
            port: name.to_string(),
        })
    }

    /// Deliver signal args to every slot subscribed to the named signal
    /// port. Zero subscribers emit successfully and drop the args.
    pub fn emit_signal(&mut self, name: &str, args: Vec<Arg>) -> Result<(), Error> {
        let port = self
            .outputs
            .get_mut(name)
            .filter(|port| port.is_signal())
            .ok_or_else(|| Error::CallNotFound(name.to_string()))?;
        port.emit_signal(args);
        Ok(())
    }

    /// Simultaneous access to one input and one output port, for blocks
    /// that move bytes straight across.
    pub fn stream_pair(
        &mut self,
        input: usize,
        output: usize,
    ) -> Result<(&mut InputPort, &mut OutputPort), Error> {
        let WorkContext {
            inputs, outputs, ..
        } = self;
        let input_port = inputs
            .values_mut()
            .find(|port| port.index() == Some(input))
            .ok_or(Error::PortAccess {
                block: String::new(),
                port: input.to_string(),
            })?;
        let output_port = outputs
            .values_mut()
            .find(|port| port.index() == Some(output))
            .ok_or(Error::PortAccess {
                block: String::new(),
                port: output.to_string(),
            })?;
        Ok((input_port, output_port))
    }

    /// Ask the scheduler to revisit this block without external stimulus.
    /// For blocks that returned early instead of blocking inside work.
    pub fn yield_now(&mut self) {
        *self.yield_requested = true;
    }
}

/// Output-side access during label propagation.
pub struct PropagateOutputs<'a> {
    pub(crate) outputs: &'a mut BTreeMap<String, OutputPort>,
}

impl PropagateOutputs<'_> {
    /// Post a label to one output at an absolute element index.
    pub fn post(&mut self, output: &str, label: Label) -> Result<(), Error> {
        let port = self.outputs.get_mut(output).ok_or(Error::PortAccess {
            block: String::new(),
            port: output.to_string(),
        })?;
        port.post_label_absolute(label);
        Ok(())
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.keys().cloned().collect()
    }

    /// Forward every label to every streaming output, scaling the index by
    /// the ratio of produced to consumed elements.
    pub fn default_propagate(&mut self, input: &InputPort, labels: &[Label]) {
        let consumed = input.total_consumed();
        for port in self.outputs.values_mut() {
            if port.is_signal() {
                continue;
            }
            let produced = port.total_produced();
            for label in labels {
                let index = if consumed > 0 {
                    label.index * produced / consumed
                } else {
                    label.index
                };
                port.post_label_absolute(label.at_index(index));
            }
        }
    }
}
