//! Analysis configuration: the architecture description and the ordered pass list, read from
//! a single XML file.

use std::path::PathBuf;

use roxmltree::{Document, Node as XmlNode};
use tempo_analysis::config::{
    ArchitectureConfig, ArchitectureError, CacheConfig, CacheKind, MemoryConfig,
    ReplacementPolicy,
};
use tempo_analysis::SolverKind;
use tempo_core::arch::{Arch, Target};

// ERRORS
// ================================================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed configuration XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("configuration should have a single ARCHITECTURE section")]
    MissingArchitecture,
    #[error("configuration should have a TARGET tag")]
    MissingTarget,
    #[error("unsupported target architecture: {0}")]
    UnknownTarget(String),
    #[error("unsupported endianness (should be BIG or LITTLE): {0}")]
    UnknownEndianness(String),
    #[error("configuration should have one unique MEMORY tag")]
    BadMemory,
    #[error("unknown replacement policy: {0}")]
    UnknownPolicy(String),
    #[error("unknown cache type: {0}")]
    UnknownCacheType(String),
    #[error("unknown architectural element: {0}")]
    UnknownArchElement(String),
    #[error("configuration should have a single ANALYSIS section")]
    MissingAnalysis,
    #[error("unknown analysis type: {0}")]
    UnknownPass(String),
    #[error("missing attribute '{attr}' on <{element}>")]
    MissingAttribute { element: String, attr: &'static str },
    #[error("invalid value '{value}' for attribute '{attr}' on <{element}>")]
    InvalidValue { element: String, attr: &'static str, value: String },
    #[error(transparent)]
    Architecture(#[from] ArchitectureError),
}

// PASS DESCRIPTIONS
// ================================================================================================

/// Parameters common to every pass directive.
#[derive(Debug, Clone, Default)]
pub struct PassCommon {
    pub input_file: Option<String>,
    pub output_file: Option<String>,
    pub keep_results: bool,
}

#[derive(Debug, Clone)]
pub enum PassKind {
    EntryPoint {
        name: String,
    },
    ICache {
        level: u32,
        must: bool,
        persistence: bool,
        may: bool,
        keep_age: bool,
    },
    DCache {
        level: u32,
        must: bool,
        persistence: bool,
        may: bool,
    },
    DataAddress {
        stack_pointer: u64,
    },
    Pipeline,
    Ipet {
        solver: SolverKind,
        pipeline: bool,
        attach_wcet_info: bool,
        generate_node_freq: bool,
    },
    DotPrint,
    SimplePrint {
        print_call_graph: bool,
        print_loop_nests: bool,
        print_cfg: bool,
        print_wcet_info: bool,
    },
    CodeLine {
        binary_file: String,
        addr2line_command: String,
    },
    Dummy,
}

#[derive(Debug, Clone)]
pub struct PassConfig {
    pub kind: PassKind,
    pub common: PassCommon,
}

// CONFIGURATION
// ================================================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub input_output_dir: PathBuf,
    pub architecture: ArchitectureConfig,
    pub passes: Vec<PassConfig>,
}

impl Config {
    /// Parses and validates a configuration file's contents.
    pub fn from_xml(text: &str) -> Result<Self, ConfigError> {
        let doc = Document::parse(text)?;
        let root = doc.root_element();

        let input_output_dir = root
            .children()
            .find(|c| c.has_tag_name("INPUTOUTPUTDIR"))
            .and_then(|c| c.attribute("name"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let architecture = parse_architecture(
            root.children()
                .find(|c| c.has_tag_name("ARCHITECTURE"))
                .ok_or(ConfigError::MissingArchitecture)?,
        )?;

        let analysis = root
            .children()
            .find(|c| c.has_tag_name("ANALYSIS"))
            .ok_or(ConfigError::MissingAnalysis)?;
        let mut passes = Vec::new();
        for child in analysis.children().filter(|c| c.is_element()) {
            if child.has_tag_name("comment") {
                continue;
            }
            passes.push(parse_pass(child)?);
        }

        Ok(Self { input_output_dir, architecture, passes })
    }
}

// ARCHITECTURE PARSING
// ================================================================================================

fn parse_architecture(element: XmlNode<'_, '_>) -> Result<ArchitectureConfig, ConfigError> {
    let mut target = None;
    let mut memory = None;
    let mut caches = Vec::new();

    for child in element.children().filter(|c| c.is_element()) {
        match child.tag_name().name() {
            "TARGET" => {
                let name = required(child, "NAME")?;
                let endianness = required(child, "ENDIANNESS")?;
                let big_endian = match endianness {
                    "BIG" => true,
                    "LITTLE" => false,
                    other => return Err(ConfigError::UnknownEndianness(other.to_string())),
                };
                let target_kind = Target::from_name(name)
                    .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))?;
                target = Some(Arch::new(target_kind, big_endian));
            },
            "CACHE" => {
                let kind_name = required(child, "type")?;
                let kind = CacheKind::from_name(kind_name)
                    .ok_or_else(|| ConfigError::UnknownCacheType(kind_name.to_string()))?;
                let policy_name = required(child, "replacement_policy")?;
                let policy = ReplacementPolicy::from_name(policy_name)
                    .ok_or_else(|| ConfigError::UnknownPolicy(policy_name.to_string()))?;
                caches.push(CacheConfig {
                    kind,
                    level: parse_number(child, "level")?,
                    sets: parse_number(child, "nbsets")?,
                    ways: parse_number(child, "nbways")?,
                    line_size: parse_number(child, "cachelinesize")?,
                    policy,
                    latency: parse_number(child, "latency")?,
                });
            },
            "MEMORY" => {
                if memory.is_some() {
                    return Err(ConfigError::BadMemory);
                }
                memory = Some(MemoryConfig {
                    load_latency: parse_number(child, "load_latency")?,
                    store_latency: parse_number(child, "store_latency")?,
                });
            },
            "comment" => {},
            other => return Err(ConfigError::UnknownArchElement(other.to_string())),
        }
    }

    let mut config = ArchitectureConfig {
        arch: target.ok_or(ConfigError::MissingTarget)?,
        caches,
        memory: memory.ok_or(ConfigError::BadMemory)?,
    };
    config.validate()?;
    Ok(config)
}

// PASS PARSING
// ================================================================================================

fn parse_pass(element: XmlNode<'_, '_>) -> Result<PassConfig, ConfigError> {
    let common = PassCommon {
        input_file: element.attribute("input_file").map(str::to_string),
        output_file: element.attribute("output_file").map(str::to_string),
        keep_results: element.attribute("keepresults") == Some("on"),
    };

    let kind = match element.tag_name().name() {
        "ENTRYPOINT" => PassKind::EntryPoint { name: required(element, "entrypointname")?.to_string() },
        "ICACHE" => PassKind::ICache {
            level: parse_number(element, "level")?,
            must: parse_switch(element, "must", false)?,
            persistence: parse_switch(element, "persistence", false)?,
            may: parse_switch(element, "may", false)?,
            keep_age: parse_switch(element, "keep_age", false)?,
        },
        "DCACHE" => PassKind::DCache {
            level: parse_number(element, "level")?,
            must: parse_switch(element, "must", false)?,
            persistence: parse_switch(element, "persistence", false)?,
            may: parse_switch(element, "may", false)?,
        },
        "DATAADDRESS" => {
            let raw = required(element, "sp")?;
            let digits = raw.strip_prefix("0x").unwrap_or(raw);
            let stack_pointer =
                u64::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidValue {
                    element: element.tag_name().name().to_string(),
                    attr: "sp",
                    value: raw.to_string(),
                })?;
            PassKind::DataAddress { stack_pointer }
        },
        "PIPELINE" => PassKind::Pipeline,
        "IPET" => {
            let solver_name = required(element, "solver")?;
            let solver = SolverKind::from_name(solver_name).ok_or_else(|| {
                ConfigError::InvalidValue {
                    element: "IPET".to_string(),
                    attr: "solver",
                    value: solver_name.to_string(),
                }
            })?;
            PassKind::Ipet {
                solver,
                pipeline: parse_switch(element, "pipeline", false)?,
                attach_wcet_info: parse_switch(element, "attach_WCET_info", false)?,
                generate_node_freq: parse_switch(element, "generate_node_freq", false)?,
            }
        },
        "DOTPRINT" => PassKind::DotPrint,
        "SIMPLEPRINT" => PassKind::SimplePrint {
            print_call_graph: parse_switch(element, "printcallgraph", false)?,
            print_loop_nests: parse_switch(element, "printloopnest", false)?,
            print_cfg: parse_switch(element, "printcfg", false)?,
            print_wcet_info: parse_switch(element, "printWCETinfo", false)?,
        },
        "CODELINE" => PassKind::CodeLine {
            binary_file: required(element, "binaryfile")?.to_string(),
            addr2line_command: required(element, "addr2lineCommand")?.to_string(),
        },
        "DUMMYANALYSIS" => PassKind::Dummy,
        other => return Err(ConfigError::UnknownPass(other.to_string())),
    };

    Ok(PassConfig { kind, common })
}

// PARSING HELPERS
// ================================================================================================

fn required<'a>(element: XmlNode<'a, '_>, attr: &'static str) -> Result<&'a str, ConfigError> {
    element.attribute(attr).ok_or_else(|| ConfigError::MissingAttribute {
        element: element.tag_name().name().to_string(),
        attr,
    })
}

fn parse_number<T: std::str::FromStr>(
    element: XmlNode<'_, '_>,
    attr: &'static str,
) -> Result<T, ConfigError> {
    let raw = required(element, attr)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        element: element.tag_name().name().to_string(),
        attr,
        value: raw.to_string(),
    })
}

/// Parses an `on`/`off` switch; an absent attribute takes the default.
fn parse_switch(
    element: XmlNode<'_, '_>,
    attr: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match element.attribute(attr) {
        None | Some("") => Ok(default),
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            element: element.tag_name().name().to_string(),
            attr,
            value: other.to_string(),
        }),
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<CONFIGURATION>
  <INPUTOUTPUTDIR name="bench"/>
  <ARCHITECTURE>
    <TARGET NAME="MIPS" ENDIANNESS="BIG"/>
    <CACHE type="icache" level="1" nbsets="64" nbways="4" cachelinesize="32"
           replacement_policy="LRU" latency="1"/>
    <CACHE type="dcache" level="1" nbsets="64" nbways="4" cachelinesize="32"
           replacement_policy="LRU" latency="1"/>
    <MEMORY load_latency="100" store_latency="100"/>
  </ARCHITECTURE>
  <ANALYSIS>
    <ENTRYPOINT entrypointname="main" input_file="program.xml"/>
    <ICACHE level="1" must="on" persistence="on" may="on" keep_age="off"/>
    <DCACHE level="1" must="on" persistence="off" may="off"/>
    <IPET solver="lp_solve" pipeline="off" attach_WCET_info="on" generate_node_freq="on"
          keepresults="on"/>
  </ANALYSIS>
</CONFIGURATION>"#;

    #[test]
    fn sample_configuration_parses() {
        let config = Config::from_xml(SAMPLE).unwrap();
        assert_eq!(config.input_output_dir, PathBuf::from("bench"));
        assert_eq!(config.architecture.caches.len(), 2);
        assert_eq!(config.architecture.memory.load_latency, 100);
        assert_eq!(config.passes.len(), 4);

        assert!(matches!(&config.passes[0].kind, PassKind::EntryPoint { name } if name == "main"));
        assert_eq!(config.passes[0].common.input_file.as_deref(), Some("program.xml"));
        assert!(matches!(
            config.passes[1].kind,
            PassKind::ICache { level: 1, must: true, persistence: true, may: true, keep_age: false }
        ));
        assert!(config.passes[3].common.keep_results);
    }

    #[test]
    fn unknown_pass_is_rejected() {
        let bad = SAMPLE.replace("<DCACHE", "<WRONGPASS");
        assert!(matches!(Config::from_xml(&bad), Err(ConfigError::UnknownPass(_))));
    }

    #[test]
    fn missing_target_is_rejected() {
        let bad = SAMPLE.replace(r#"<TARGET NAME="MIPS" ENDIANNESS="BIG"/>"#, "");
        assert!(matches!(Config::from_xml(&bad), Err(ConfigError::MissingTarget)));
    }

    #[test]
    fn duplicate_memory_is_rejected() {
        let bad = SAMPLE.replace(
            r#"<MEMORY load_latency="100" store_latency="100"/>"#,
            r#"<MEMORY load_latency="100" store_latency="100"/>
               <MEMORY load_latency="10" store_latency="10"/>"#,
        );
        assert!(matches!(Config::from_xml(&bad), Err(ConfigError::BadMemory)));
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let bad = SAMPLE.replace("\"LRU\"", "\"LFU\"");
        assert!(matches!(Config::from_xml(&bad), Err(ConfigError::UnknownPolicy(_))));
    }
}
