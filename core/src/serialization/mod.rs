//! XML round-trip for programs.
//!
//! The schema mirrors what the loader produces: a `<PROGRAM>` element holding `<CFG>` elements
//! with `<NODE>`, `<EDGE>` and `<LOOP>` children; every entity carries an `<ATTRS_LIST>` of
//! typed `<ATTR>` entries. Contextual attributes serialize under the `base#ctx` naming
//! convention, references to other entities serialize as string ids resolved on read, and
//! scratch attributes are skipped entirely, so a program round-trips through
//! [`write_program`] / [`read_program`] up to its serializable attributes.

mod read;
pub use read::{read_program, ReadError};

use std::fmt::Write as _;

use itertools::Itertools;

use crate::attributes::{AttrMap, AttrValue};
use crate::cfg::Cfg;
use crate::Program;

// WRITER
// ================================================================================================

/// Serializes `program` to its XML form.
pub fn write_program(program: &Program) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = write!(out, "<PROGRAM name=\"{}\"", escape(program.name()));
    if let Some(entry) = program.entry_point() {
        let _ = write!(out, " entry=\"{}\"", escape(program.cfg(entry).name()));
    }
    out.push_str(">\n");

    for (_, cfg) in program.cfgs() {
        write_cfg(&mut out, program, cfg);
    }

    if let Some(tree) = program.contexts() {
        out.push_str("  <CONTEXTTREE>\n");
        for id in tree.ids() {
            let ctx = tree.context(id);
            let _ = write!(
                out,
                "    <CONTEXT id=\"{}\" function=\"{}\"",
                id,
                escape(program.cfg(ctx.function()).name())
            );
            if let (Some(parent), Some(call)) = (ctx.parent(), ctx.caller_node()) {
                let _ = write!(out, " predecessor_id=\"{parent}\" call=\"{call}\"");
            }
            out.push_str("/>\n");
        }
        out.push_str("  </CONTEXTTREE>\n");
    }

    write_attrs(&mut out, program.attrs(), 1);
    out.push_str("</PROGRAM>\n");
    out
}

fn write_cfg(out: &mut String, program: &Program, cfg: &Cfg) {
    let _ = write!(out, "  <CFG name=\"{}\"", escape(cfg.name()));
    if cfg.is_external() {
        out.push_str(" external=\"true\"");
    }
    out.push_str(">\n");

    for (_, node) in cfg.nodes() {
        match node.callee() {
            Some(callee) => {
                let _ = write!(
                    out,
                    "    <NODE type=\"call\" callee=\"{}\"",
                    escape(program.cfg(callee).name())
                );
            },
            None => {
                let _ = write!(out, "    <NODE type=\"bb\"");
            },
        }
        if node.is_isolated_nop() {
            out.push_str(" isolatednop=\"true\"");
        }
        out.push_str(">\n");
        for instr in node.instructions() {
            let _ = write!(out, "      <INSTRUCTION code=\"{}\">\n", escape(instr.code()));
            write_attrs(out, instr.attrs(), 4);
            out.push_str("      </INSTRUCTION>\n");
        }
        write_attrs(out, node.attrs(), 3);
        out.push_str("    </NODE>\n");
    }

    for (_, edge) in cfg.edges() {
        let _ = write!(out, "    <EDGE source=\"{}\" target=\"{}\"", edge.source(), edge.target());
        if edge.attrs().iter().any(|(_, v)| v.is_serializable()) {
            out.push_str(">\n");
            write_attrs(out, edge.attrs(), 3);
            out.push_str("    </EDGE>\n");
        } else {
            out.push_str("/>\n");
        }
    }

    for (_, l) in cfg.loops() {
        let nodes = l.nodes().iter().join(" ");
        let backs = l.back_edges().iter().join(" ");
        let _ = write!(
            out,
            "    <LOOP head=\"{}\" nodes=\"{}\" backedges=\"{}\">\n",
            l.head(),
            nodes,
            backs
        );
        write_attrs(out, l.attrs(), 3);
        out.push_str("    </LOOP>\n");
    }

    write_attrs(out, cfg.attrs(), 2);
    out.push_str("  </CFG>\n");
}

fn write_attrs(out: &mut String, attrs: &AttrMap, depth: usize) {
    if !attrs.iter().any(|(_, v)| v.is_serializable()) {
        return;
    }
    let pad = "  ".repeat(depth);
    let _ = write!(out, "{pad}<ATTRS_LIST>\n");
    for (key, value) in attrs.iter() {
        let name = escape(&key.to_string());
        match value {
            AttrValue::Int(v) => {
                let _ = write!(out, "{pad}  <ATTR type=\"int\" name=\"{name}\" value=\"{v}\"/>\n");
            },
            AttrValue::UInt(v) => {
                let _ = write!(
                    out,
                    "{pad}  <ATTR type=\"unsignedlong\" name=\"{name}\" value=\"{v}\"/>\n"
                );
            },
            AttrValue::Hex(v) => {
                let _ = write!(
                    out,
                    "{pad}  <ATTR type=\"hexa\" name=\"{name}\" value=\"0x{v:x}\"/>\n"
                );
            },
            AttrValue::Float(v) => {
                let _ =
                    write!(out, "{pad}  <ATTR type=\"float\" name=\"{name}\" value=\"{v}\"/>\n");
            },
            AttrValue::Str(v) => {
                let _ = write!(
                    out,
                    "{pad}  <ATTR type=\"string\" name=\"{name}\" value=\"{}\"/>\n",
                    escape(v)
                );
            },
            AttrValue::Address(infos) => {
                let _ = write!(out, "{pad}  <ATTR type=\"address\" name=\"{name}\">\n");
                for info in infos {
                    let _ = write!(
                        out,
                        "{pad}    <ADDRINFO segment=\"{}\">\n",
                        escape(&info.segment)
                    );
                    for range in &info.ranges {
                        let _ = write!(
                            out,
                            "{pad}      <RANGE start=\"0x{:x}\" size=\"{}\"/>\n",
                            range.start, range.size
                        );
                    }
                    let _ = write!(out, "{pad}    </ADDRINFO>\n");
                }
                let _ = write!(out, "{pad}  </ATTR>\n");
            },
            AttrValue::ContextList(ids) => {
                let list = ids.iter().join(" ");
                let _ = write!(
                    out,
                    "{pad}  <ATTR type=\"contextlist\" name=\"{name}\" value=\"{list}\"/>\n"
                );
            },
            AttrValue::Scratch(_) => {},
        }
    }
    let _ = write!(out, "{pad}</ATTRS_LIST>\n");
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttrValue;
    use crate::cfg::{Cfg, Instruction, Loop, Node};
    use crate::context::compute_contexts;
    use crate::{CfgId, NodeId};

    fn sample_program() -> Program {
        let mut program = Program::new("sample");
        let f = CfgId::new(1);

        let mut main_cfg = Cfg::new("main");
        let mut i0 = Instruction::new("lw $2, 0($3)");
        i0.set_address(0x4000);
        i0.attrs_mut().set_plain("extra", AttrValue::Str("x < y".into()));
        let b0 = main_cfg.add_node(Node::basic(vec![i0]));
        let mut i1 = Instruction::new("jal f");
        i1.set_address(0x4004);
        let call = main_cfg.add_node(Node::call(f, vec![i1]));
        let mut i2 = Instruction::new("jr $31");
        i2.set_address(0x4008);
        let b2 = main_cfg.add_node(Node::basic(vec![i2]));
        main_cfg.add_edge(b0, call);
        let e1 = main_cfg.add_edge(call, b0);
        main_cfg.add_edge(b0, b2);
        let mut l = Loop::new(b0, vec![b0, call], vec![e1]);
        l.set_max_iterations(10);
        main_cfg.add_loop(l);
        main_cfg.finalize();

        let mut f_cfg = Cfg::new("f");
        let mut fi = Instruction::new("addu $5, $6, $7");
        fi.set_address(0x5000);
        f_cfg.add_node(Node::basic(vec![fi]));
        f_cfg.finalize();

        program.add_cfg(main_cfg);
        program.add_cfg(f_cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();
        program
    }

    #[test]
    fn round_trip_preserves_program() {
        let program = sample_program();
        let xml = write_program(&program);
        let restored = read_program(&xml).unwrap();
        assert_eq!(program, restored);
    }

    #[test]
    fn round_trip_is_idempotent() {
        let program = sample_program();
        let xml = write_program(&program);
        let restored = read_program(&xml).unwrap();
        assert_eq!(xml, write_program(&restored));
    }

    #[test]
    fn scratch_attributes_are_dropped() {
        let mut program = sample_program();
        program
            .cfg_mut(CfgId::new(0))
            .node_mut(NodeId::new(0))
            .attrs_mut()
            .set_plain("id", AttrValue::Scratch(7));
        let xml = write_program(&program);
        assert!(!xml.contains("\"id\""));
    }

    #[test]
    fn contextual_attributes_use_hash_names() {
        let mut program = sample_program();
        let ctx = program.cfg(CfgId::new(0)).context_list()[0];
        program
            .cfg_mut(CfgId::new(0))
            .node_mut(NodeId::new(0))
            .instructions_mut()[0]
            .attrs_mut()
            .set_in_ctx("CHMCL1Code", ctx, AttrValue::Str("AH".into()));

        let xml = write_program(&program);
        assert!(xml.contains("name=\"CHMCL1Code#0\""));
        let restored = read_program(&xml).unwrap();
        assert_eq!(program, restored);
    }
}
