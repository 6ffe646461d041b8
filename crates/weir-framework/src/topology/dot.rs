//! Dot markup rendering of a topology.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::Error;
use crate::handle::BlockHandle;
use crate::topology::{Connector, Flow, Topology};

#[derive(Deserialize)]
#[serde(default)]
struct DotConfig {
    mode: String,
    port: String,
}

impl Default for DotConfig {
    fn default() -> Self {
        DotConfig {
            mode: "top".to_string(),
            port: "connected".to_string(),
        }
    }
}

pub(crate) fn render(topology: &Topology, config: &str) -> Result<String, Error> {
    let config: DotConfig = if config.trim().is_empty() {
        DotConfig::default()
    } else {
        serde_json::from_str(config)
            .map_err(|err| Error::DataFormat(format!("invalid dot config: {err}")))?
    };
    match config.mode.as_str() {
        "top" | "flat" => {}
        other => {
            return Err(Error::DataFormat(format!(
                "unknown dot mode '{other}', expected 'top' or 'flat'"
            )))
        }
    }
    let all_ports = match config.port.as_str() {
        "all" => true,
        "connected" => false,
        other => {
            return Err(Error::DataFormat(format!(
                "unknown dot port option '{other}', expected 'all' or 'connected'"
            )))
        }
    };

    // Flat mode shows the committed graph with bridges and adapters; top
    // mode shows the flows as the user recorded them.
    let flows: Vec<Flow> = if config.mode == "flat" {
        topology.inner.lock().active_flat_flows.clone()
    } else {
        topology.inner.lock().flows.clone()
    };

    let mut nodes: BTreeMap<u64, String> = BTreeMap::new();
    for flow in &flows {
        for endpoint in [&flow.src, &flow.dst] {
            let label = match &endpoint.node {
                Connector::Block(block) if all_ports => block_label_with_ports(block),
                node => node.display_name(),
            };
            nodes.entry(endpoint.node.uid()).or_insert(label);
        }
    }

    let mut out = String::new();
    out.push_str("digraph topology {\n");
    out.push_str("    rankdir=LR;\n");
    out.push_str("    node [shape=box, fontsize=10];\n");
    for (uid, label) in &nodes {
        out.push_str(&format!("    n{uid} [label=\"{}\"];\n", escape(label)));
    }
    for flow in &flows {
        out.push_str(&format!(
            "    n{} -> n{} [label=\"{}:{}\"];\n",
            flow.src.node.uid(),
            flow.dst.node.uid(),
            escape(&flow.src.port),
            escape(&flow.dst.port)
        ));
    }
    out.push_str("}\n");
    Ok(out)
}

fn block_label_with_ports(block: &BlockHandle) -> String {
    let inputs = block.input_port_names().join(",");
    let outputs = block.output_port_names().join(",");
    format!("{}\\nin: [{}]\\nout: [{}]", block.name(), inputs, outputs)
}

fn escape(text: &str) -> String {
    text.replace('"', "\\\"")
}
