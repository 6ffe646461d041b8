//! Topology construction from a JSON description.
//!
//! ```json
//! {
//!     "blocks": [
//!         {"id": "a", "path": "/test/src", "args": [], "calls": [["setFoo", 1]]},
//!         {"id": "b", "path": "/test/snk"}
//!     ],
//!     "connections": [["a", "0", "b", "0"]]
//! }
//! ```
//!
//! The ids `self`, `this`, and the empty string alias the enclosing
//! topology. Shape errors name the offending array index.

use std::collections::HashMap;

use serde_json::Value;

use crate::arg::Arg;
use crate::error::Error;
use crate::registry;
use crate::topology::{Connector, Topology};

impl Topology {
    /// Build a topology from a JSON string or the path of a JSON file.
    pub fn from_json(json: &str) -> Result<Topology, Error> {
        let text = if std::path::Path::new(json).exists() {
            std::fs::read_to_string(json)
                .map_err(|err| Error::DataFormat(format!("failed to read '{json}': {err}")))?
        } else {
            json.to_string()
        };
        let root: Value = serde_json::from_str(&text)
            .map_err(|err| Error::DataFormat(format!("invalid JSON: {err}")))?;
        let root = root
            .as_object()
            .ok_or_else(|| Error::DataFormat("topology description must be an object".into()))?;

        let topology = Topology::new("topology");
        let mut connectors: HashMap<String, Connector> = HashMap::new();
        for alias in ["self", "this", ""] {
            connectors.insert(alias.to_string(), Connector::from(&topology));
        }

        if let Some(blocks) = root.get("blocks") {
            let blocks = blocks
                .as_array()
                .ok_or_else(|| Error::DataFormat("'blocks' must be an array".into()))?;
            for (i, entry) in blocks.iter().enumerate() {
                let block = parse_block(entry, i)?;
                connectors.insert(block.0, Connector::Block(block.1));
            }
        }

        if let Some(connections) = root.get("connections") {
            let connections = connections
                .as_array()
                .ok_or_else(|| Error::DataFormat("'connections' must be an array".into()))?;
            for (i, entry) in connections.iter().enumerate() {
                let Some(fields) = entry.as_array().filter(|fields| fields.len() == 4) else {
                    return Err(Error::DataFormat(format!(
                        "connections[{i}] must be an array of size 4"
                    )));
                };
                let mut strings = Vec::with_capacity(4);
                for field in fields {
                    let Some(text) = field.as_str() else {
                        return Err(Error::DataFormat(format!(
                            "connections[{i}] entries must be strings"
                        )));
                    };
                    strings.push(text.to_string());
                }
                let src = connectors.get(&strings[0]).ok_or_else(|| {
                    Error::DataFormat(format!("connections[{i}] no such id: {}", strings[0]))
                })?;
                let dst = connectors.get(&strings[2]).ok_or_else(|| {
                    Error::DataFormat(format!("connections[{i}] no such id: {}", strings[2]))
                })?;
                topology.connect(src.clone(), strings[1].clone(), dst.clone(), strings[3].clone())?;
            }
        }

        Ok(topology)
    }
}

fn parse_block(entry: &Value, index: usize) -> Result<(String, crate::handle::BlockHandle), Error> {
    let object = entry
        .as_object()
        .ok_or_else(|| Error::DataFormat(format!("blocks[{index}] must be an object")))?;
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::DataFormat(format!("blocks[{index}] missing 'id' field")))?
        .to_string();
    let path = object
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::DataFormat(format!("blocks[{index}] missing 'path' field")))?;

    let args = match object.get("args") {
        None => Vec::new(),
        Some(args) => args
            .as_array()
            .ok_or_else(|| Error::DataFormat(format!("blocks[{index}] 'args' must be an array")))?
            .iter()
            .map(|value| Arg::new(value.clone()))
            .collect(),
    };

    let handle = registry::make_block(path, &args)?;

    if let Some(calls) = object.get("calls") {
        let calls = calls
            .as_array()
            .ok_or_else(|| Error::DataFormat(format!("blocks[{index}] 'calls' must be an array")))?;
        for call in calls {
            let Some(fields) = call.as_array().filter(|fields| !fields.is_empty()) else {
                return Err(Error::DataFormat(format!(
                    "blocks[{index}] 'calls' entries must be non-empty arrays"
                )));
            };
            let Some(name) = fields[0].as_str() else {
                return Err(Error::DataFormat(format!(
                    "blocks[{index}] call names must be strings"
                )));
            };
            let call_args: Vec<Arg> = fields[1..]
                .iter()
                .map(|value| Arg::new(value.clone()))
                .collect();
            handle.call(name, &call_args)?;
        }
    }

    Ok((id, handle))
}
