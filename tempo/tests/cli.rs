//! End-to-end runs of the `tempo` binary on generated programs and configurations.
//!
//! The path analysis needs an external LP solver, so these tests drive everything up to and
//! around it: loading, checking, context construction, both cache analyses, printers, and
//! the failure paths that must abort with a non-zero exit code.

use assert_cmd::Command;
use predicates::prelude::*;
use tempo_core::attributes::{AddressInfo, AddressRange};
use tempo_core::cfg::{Cfg, Instruction, Loop, Node};
use tempo_core::serialization::write_program;
use tempo_core::{AttrValue, CfgId, Program};

fn instr_at(code: &str, addr: u64) -> Instruction {
    let mut i = Instruction::new(code);
    i.set_address(addr);
    i
}

fn load_at(code_addr: u64, data_start: u64, size: u64) -> Instruction {
    let mut i = Instruction::new("lw $2, 0($3)");
    i.attrs_mut().set_plain(
        "address",
        AttrValue::Address(vec![
            AddressInfo { segment: "code".into(), ranges: vec![AddressRange::new(code_addr, 4)] },
            AddressInfo { segment: "data".into(), ranges: vec![AddressRange::new(data_start, size)] },
        ]),
    );
    i
}

/// main: pre -> loop(head, body with a load) -> exit, calling f from the body.
fn sample_program(bounded: bool) -> Program {
    let mut program = Program::new("sample");
    let f = CfgId::new(1);

    let mut main_cfg = Cfg::new("main");
    let pre = main_cfg.add_node(Node::basic(vec![instr_at("addiu $2, $0, 0", 0x1000)]));
    let head = main_cfg.add_node(Node::basic(vec![instr_at("slti $3, $2, 8", 0x1040)]));
    let body = main_cfg.add_node(Node::call(f, vec![instr_at("jal f", 0x1080)]));
    let exit = main_cfg.add_node(Node::basic(vec![instr_at("jr $31", 0x10c0)]));
    main_cfg.add_edge(pre, head);
    main_cfg.add_edge(head, body);
    let back = main_cfg.add_edge(body, head);
    main_cfg.add_edge(head, exit);
    let mut l = Loop::new(head, vec![head, body], vec![back]);
    if bounded {
        l.set_max_iterations(8);
    }
    main_cfg.add_loop(l);
    main_cfg.finalize();

    let mut f_cfg = Cfg::new("f");
    f_cfg.add_node(Node::basic(vec![
        load_at(0x2000, 0x8000, 4),
        instr_at("jr $31", 0x2004),
    ]));
    f_cfg.finalize();

    program.add_cfg(main_cfg);
    program.add_cfg(f_cfg);
    program
}

fn config_xml(passes: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<CONFIGURATION>
  <INPUTOUTPUTDIR name="."/>
  <ARCHITECTURE>
    <TARGET NAME="MIPS" ENDIANNESS="BIG"/>
    <CACHE type="icache" level="1" nbsets="16" nbways="2" cachelinesize="32"
           replacement_policy="LRU" latency="1"/>
    <CACHE type="dcache" level="1" nbsets="16" nbways="2" cachelinesize="32"
           replacement_policy="LRU" latency="1"/>
    <MEMORY load_latency="100" store_latency="100"/>
  </ARCHITECTURE>
  <ANALYSIS>
{passes}
  </ANALYSIS>
</CONFIGURATION>"#
    )
}

fn write_workspace(dir: &std::path::Path, program: &Program, passes: &str) -> std::path::PathBuf {
    std::fs::write(dir.join("program.xml"), write_program(program)).unwrap();
    let config_path = dir.join("config.xml");
    std::fs::write(&config_path, config_xml(passes)).unwrap();
    config_path
}

#[test]
fn cache_analyses_and_printers_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(
        dir.path(),
        &sample_program(true),
        r#"    <ENTRYPOINT entrypointname="main" input_file="program.xml"/>
    <ICACHE level="1" must="on" persistence="on" may="on" keepresults="on"/>
    <DCACHE level="1" must="on" persistence="off" may="off" keepresults="on"/>
    <DOTPRINT/>
    <DUMMYANALYSIS output_file="analyzed.xml" keepresults="on"/>
    <SIMPLEPRINT printcallgraph="on" printloopnest="on" printcfg="on" printWCETinfo="on"/>"#,
    );

    Command::cargo_bin("tempo")
        .unwrap()
        .arg(&config)
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Function main calls f"))
        .stdout(predicate::str::contains("WCET: -1"));

    // The serialized result carries the contextual classifications of both analyses.
    let analyzed = std::fs::read_to_string(dir.path().join("analyzed.xml")).unwrap();
    assert!(analyzed.contains("CHMCL1Code#"));
    assert!(analyzed.contains("CHMCL1Data#"));
    assert!(analyzed.contains("DataBlockCountL1#"));

    // The Graphviz rendering of the program was produced alongside.
    let dot = std::fs::read_to_string(dir.path().join("sample.dot")).unwrap();
    assert!(dot.contains("digraph program"));
}

#[test]
fn discarded_results_do_not_leak_into_later_passes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(
        dir.path(),
        &sample_program(true),
        r#"    <ENTRYPOINT entrypointname="main" input_file="program.xml"/>
    <ICACHE level="1" must="on" persistence="off" may="off" keepresults="off"/>
    <DUMMYANALYSIS output_file="analyzed.xml" keepresults="on"/>"#,
    );

    Command::cargo_bin("tempo").unwrap().arg(&config).current_dir(dir.path()).assert().success();

    let analyzed = std::fs::read_to_string(dir.path().join("analyzed.xml")).unwrap();
    assert!(!analyzed.contains("CHMCL1Code#"));
}

#[test]
fn unbounded_loop_aborts_the_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(
        dir.path(),
        &sample_program(false),
        r#"    <ENTRYPOINT entrypointname="main" input_file="program.xml"/>
    <ICACHE level="1" must="on" persistence="off" may="off"/>"#,
    );

    Command::cargo_bin("tempo")
        .unwrap()
        .arg(&config)
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("loop without iteration bound"));
}

#[test]
fn bad_entry_point_aborts_the_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(
        dir.path(),
        &sample_program(true),
        r#"    <ENTRYPOINT entrypointname="missing" input_file="program.xml"/>"#,
    );

    Command::cargo_bin("tempo")
        .unwrap()
        .arg(&config)
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad entry point name 'missing'"));
}

#[test]
fn unknown_pass_aborts_before_any_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_workspace(
        dir.path(),
        &sample_program(true),
        r#"    <ENTRYPOINT entrypointname="main" input_file="program.xml"/>
    <FREQUENCYPRINT/>"#,
    );

    Command::cargo_bin("tempo")
        .unwrap()
        .arg(&config)
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown analysis type"));
}

#[test]
fn missing_configuration_file_fails() {
    Command::cargo_bin("tempo")
        .unwrap()
        .arg("no-such-config.xml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read"));
}
