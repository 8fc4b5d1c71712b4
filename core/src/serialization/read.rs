use std::collections::HashMap;

use roxmltree::{Document, Node as XmlNode};

use crate::attributes::{AddressInfo, AddressRange, AttrKey, AttrMap, AttrValue};
use crate::cfg::{Cfg, Instruction, Loop, Node};
use crate::context::{ContextId, ContextTree};
use crate::{CfgId, EdgeId, NodeId, Program};

// ERRORS
// ================================================================================================

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("expected <{0}> element")]
    MissingElement(&'static str),
    #[error("missing attribute '{attr}' on <{element}>")]
    MissingAttribute { element: &'static str, attr: &'static str },
    #[error("invalid value '{value}' for attribute '{attr}' on <{element}>")]
    InvalidValue { element: &'static str, attr: &'static str, value: String },
    #[error("reference to unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown attribute type '{0}'")]
    UnknownAttrType(String),
    #[error("reference to unknown {entity} {index} in CFG '{cfg}'")]
    DanglingReference { cfg: String, entity: &'static str, index: u32 },
}

// READER
// ================================================================================================

/// Deserializes a program from its XML form.
///
/// References between entities (the entry point, call targets, context functions) are stored
/// as names in the file and resolved in a second pass once every CFG is known.
pub fn read_program(xml: &str) -> Result<Program, ReadError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();
    if root.tag_name().name() != "PROGRAM" {
        return Err(ReadError::MissingElement("PROGRAM"));
    }

    let name = required(root, "PROGRAM", "name")?;
    let mut program = Program::new(name);

    // First pass: collect CFG names so call targets can be resolved while nodes are built.
    let mut cfg_ids = HashMap::new();
    let mut index = 0u32;
    for child in root.children().filter(|c| c.has_tag_name("CFG")) {
        let cfg_name = required(child, "CFG", "name")?;
        cfg_ids.insert(cfg_name.to_string(), CfgId::new(index));
        index += 1;
    }

    for child in root.children().filter(|c| c.has_tag_name("CFG")) {
        let cfg = read_cfg(child, &cfg_ids)?;
        program.add_cfg(cfg);
    }

    if let Some(entry) = root.attribute("entry") {
        program
            .set_entry_point(entry)
            .ok_or_else(|| ReadError::UnknownFunction(entry.to_string()))?;
    }

    if let Some(tree_node) = root.children().find(|c| c.has_tag_name("CONTEXTTREE")) {
        program.set_contexts(read_context_tree(tree_node, &cfg_ids)?);
    }

    if let Some(attrs) = direct_attrs_list(root) {
        *program.attrs_mut() = read_attrs(attrs)?;
    }

    Ok(program)
}

fn read_cfg(element: XmlNode<'_, '_>, cfg_ids: &HashMap<String, CfgId>) -> Result<Cfg, ReadError> {
    let name = required(element, "CFG", "name")?;
    let mut cfg = if element.attribute("external") == Some("true") {
        Cfg::external(name)
    } else {
        Cfg::new(name)
    };

    for child in element.children().filter(|c| c.is_element()) {
        match child.tag_name().name() {
            "NODE" => {
                let mut instructions = Vec::new();
                for instr_node in child.children().filter(|c| c.has_tag_name("INSTRUCTION")) {
                    let code = required(instr_node, "INSTRUCTION", "code")?;
                    let mut instr = Instruction::new(code);
                    if let Some(attrs) = direct_attrs_list(instr_node) {
                        *instr.attrs_mut() = read_attrs(attrs)?;
                    }
                    instructions.push(instr);
                }
                let mut node = match child.attribute("callee") {
                    Some(callee_name) => {
                        let callee = *cfg_ids
                            .get(callee_name)
                            .ok_or_else(|| ReadError::UnknownFunction(callee_name.to_string()))?;
                        Node::call(callee, instructions)
                    },
                    None => Node::basic(instructions),
                };
                if child.attribute("isolatednop") == Some("true") {
                    node.set_isolated_nop(true);
                }
                if let Some(attrs) = direct_attrs_list(child) {
                    *node.attrs_mut() = read_attrs(attrs)?;
                }
                cfg.add_node(node);
            },
            "EDGE" => {
                let source = parse_index::<NodeId>(child, "EDGE", "source")?;
                let target = parse_index::<NodeId>(child, "EDGE", "target")?;
                let edge = cfg.add_edge(source, target);
                if let Some(attrs) = direct_attrs_list(child) {
                    *cfg.edge_mut(edge).attrs_mut() = read_attrs(attrs)?;
                }
            },
            "LOOP" => {
                let head = parse_index::<NodeId>(child, "LOOP", "head")?;
                let nodes = parse_id_list(child, "LOOP", "nodes")?
                    .into_iter()
                    .map(NodeId::new)
                    .collect();
                let back_edges = parse_id_list(child, "LOOP", "backedges")?
                    .into_iter()
                    .map(EdgeId::new)
                    .collect();
                let mut l = Loop::new(head, nodes, back_edges);
                if let Some(attrs) = direct_attrs_list(child) {
                    *l.attrs_mut() = read_attrs(attrs)?;
                }
                cfg.add_loop(l);
            },
            "ATTRS_LIST" => {
                *cfg.attrs_mut() = read_attrs(child)?;
            },
            _ => {},
        }
    }

    // Edges and loops may reference forward node ids; check them before the adjacency
    // tables are built.
    let num_nodes = cfg.num_nodes() as u32;
    let num_edges = cfg.edge_ids().count() as u32;
    let dangling = |entity: &'static str, index: u32| ReadError::DanglingReference {
        cfg: cfg.name().to_string(),
        entity,
        index,
    };
    for (_, edge) in cfg.edges() {
        for node in [edge.source(), edge.target()] {
            if node.as_u32() >= num_nodes {
                return Err(dangling("node", node.as_u32()));
            }
        }
    }
    for (_, l) in cfg.loops() {
        for node in l.nodes().iter().chain(std::iter::once(&l.head())) {
            if node.as_u32() >= num_nodes {
                return Err(dangling("node", node.as_u32()));
            }
        }
        for edge in l.back_edges() {
            if edge.as_u32() >= num_edges {
                return Err(dangling("edge", edge.as_u32()));
            }
        }
    }

    cfg.finalize();
    Ok(cfg)
}

fn read_context_tree(
    element: XmlNode<'_, '_>,
    cfg_ids: &HashMap<String, CfgId>,
) -> Result<ContextTree, ReadError> {
    let mut entries = Vec::new();
    for child in element.children().filter(|c| c.has_tag_name("CONTEXT")) {
        let id = parse_u32(child, "CONTEXT", "id")?;
        let function_name = required(child, "CONTEXT", "function")?;
        let function = *cfg_ids
            .get(function_name)
            .ok_or_else(|| ReadError::UnknownFunction(function_name.to_string()))?;
        let caller = match (child.attribute("predecessor_id"), child.attribute("call")) {
            (Some(pred), Some(call)) => {
                let pred = pred.parse::<u32>().map_err(|_| ReadError::InvalidValue {
                    element: "CONTEXT",
                    attr: "predecessor_id",
                    value: pred.to_string(),
                })?;
                let call = call.parse::<u32>().map_err(|_| ReadError::InvalidValue {
                    element: "CONTEXT",
                    attr: "call",
                    value: call.to_string(),
                })?;
                Some((ContextId::new(pred), NodeId::new(call)))
            },
            _ => None,
        };
        entries.push((id, function, caller));
    }
    entries.sort_by_key(|(id, _, _)| *id);
    Ok(ContextTree::from_entries(
        entries.into_iter().map(|(_, function, caller)| (function, caller)).collect(),
    ))
}

fn read_attrs(element: XmlNode<'_, '_>) -> Result<AttrMap, ReadError> {
    let mut attrs = AttrMap::new();
    for child in element.children().filter(|c| c.has_tag_name("ATTR")) {
        let ty = required(child, "ATTR", "type")?;
        let name = required(child, "ATTR", "name")?;
        let key = AttrKey::from_serialized(name);
        let value = match ty {
            "int" => AttrValue::Int(parse_scalar(child, "value")?),
            "unsignedlong" => AttrValue::UInt(parse_scalar(child, "value")?),
            "float" => AttrValue::Float(parse_scalar(child, "value")?),
            "string" => AttrValue::Str(required(child, "ATTR", "value")?.to_string()),
            "hexa" => AttrValue::Hex(parse_hex(required(child, "ATTR", "value")?)?),
            "contextlist" => {
                let ids = parse_id_list(child, "ATTR", "value")?
                    .into_iter()
                    .map(ContextId::new)
                    .collect();
                AttrValue::ContextList(ids)
            },
            "address" => AttrValue::Address(read_address_infos(child)?),
            other => return Err(ReadError::UnknownAttrType(other.to_string())),
        };
        attrs.set(key, value);
    }
    Ok(attrs)
}

fn read_address_infos(element: XmlNode<'_, '_>) -> Result<Vec<AddressInfo>, ReadError> {
    let mut infos = Vec::new();
    for info_node in element.children().filter(|c| c.has_tag_name("ADDRINFO")) {
        let segment = required(info_node, "ADDRINFO", "segment")?.to_string();
        let mut ranges = Vec::new();
        for range_node in info_node.children().filter(|c| c.has_tag_name("RANGE")) {
            let start = parse_hex(required(range_node, "RANGE", "start")?)?;
            let size = parse_scalar(range_node, "size")?;
            ranges.push(AddressRange::new(start, size));
        }
        infos.push(AddressInfo { segment, ranges });
    }
    Ok(infos)
}

// PARSING HELPERS
// ================================================================================================

fn direct_attrs_list<'a>(element: XmlNode<'a, 'a>) -> Option<XmlNode<'a, 'a>> {
    element.children().find(|c| c.has_tag_name("ATTRS_LIST"))
}

fn required<'a>(
    element: XmlNode<'a, '_>,
    element_name: &'static str,
    attr: &'static str,
) -> Result<&'a str, ReadError> {
    element
        .attribute(attr)
        .ok_or(ReadError::MissingAttribute { element: element_name, attr })
}

fn parse_u32(
    element: XmlNode<'_, '_>,
    element_name: &'static str,
    attr: &'static str,
) -> Result<u32, ReadError> {
    let raw = required(element, element_name, attr)?;
    raw.parse().map_err(|_| ReadError::InvalidValue {
        element: element_name,
        attr,
        value: raw.to_string(),
    })
}

fn parse_index<T: From<u32>>(
    element: XmlNode<'_, '_>,
    element_name: &'static str,
    attr: &'static str,
) -> Result<T, ReadError> {
    parse_u32(element, element_name, attr).map(T::from)
}

fn parse_id_list(
    element: XmlNode<'_, '_>,
    element_name: &'static str,
    attr: &'static str,
) -> Result<Vec<u32>, ReadError> {
    let raw = required(element, element_name, attr)?;
    raw.split_whitespace()
        .map(|token| {
            token.parse().map_err(|_| ReadError::InvalidValue {
                element: element_name,
                attr,
                value: raw.to_string(),
            })
        })
        .collect()
}

fn parse_scalar<T: std::str::FromStr>(
    element: XmlNode<'_, '_>,
    attr: &'static str,
) -> Result<T, ReadError> {
    let raw = required(element, "ATTR", attr)?;
    raw.parse().map_err(|_| ReadError::InvalidValue {
        element: "ATTR",
        attr,
        value: raw.to_string(),
    })
}

fn parse_hex(raw: &str) -> Result<u64, ReadError> {
    let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")).unwrap_or(raw);
    u64::from_str_radix(digits, 16).map_err(|_| ReadError::InvalidValue {
        element: "ATTR",
        attr: "value",
        value: raw.to_string(),
    })
}
