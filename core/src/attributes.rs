use std::collections::BTreeMap;
use std::fmt;

use crate::context::ContextId;

// ATTRIBUTE NAMES
// ================================================================================================

/// Well-known attribute names shared between the loader and the analyses.
///
/// Cache-related names embed the cache level and the side (code/data) they refer to; helpers
/// below build the final name. Contextual variants of any of these are keyed separately, see
/// [`AttrKey`].
pub mod names {
    /// Per-instruction address information, attached by the external loader.
    pub const ADDRESS: &str = "address";
    /// Loop iteration bound, required on every loop before any cache analysis runs.
    pub const MAXITER: &str = "maxiter";
    /// List of execution contexts of a CFG.
    pub const CONTEXT_LIST: &str = "ContextList";
    /// WCET of the entry point, attached by the IPET pass.
    pub const WCET: &str = "WCET";
    /// Execution frequency along the worst-case path. Contrary to the other contextual
    /// attributes, the context is encoded with a `_c` suffix so that the attribute name equals
    /// the ILP variable suffix.
    pub const FREQUENCY: &str = "frequency";
    /// Source line information attached by the addr2line pass.
    pub const CODE_LINE: &str = "CodeLine";

    /// First-execution time of a node, per context (pipeline pass).
    pub const NODE_EXEC_TIME_FIRST: &str = "NodeExecTimeFirst";
    /// Next-execution time of a node, per context (pipeline pass).
    pub const NODE_EXEC_TIME_NEXT: &str = "NodeExecTimeNext";
    /// Edge timing corrections, per context (pipeline pass).
    pub const DELTA_FF: &str = "DeltaFF";
    pub const DELTA_FN: &str = "DeltaFN";
    pub const DELTA_NF: &str = "DeltaNF";
    pub const DELTA_NN: &str = "DeltaNN";
    /// Call/return timing corrections stored on the call node, per context.
    pub const CALL_DELTA_FIRST: &str = "CallDeltaFirst";
    pub const CALL_DELTA_NEXT: &str = "CallDeltaNext";
    pub const RETURN_DELTA_FIRST: &str = "ReturnDeltaFirst";
    pub const RETURN_DELTA_NEXT: &str = "ReturnDeltaNext";

    /// Hit/miss classification of an instruction fetch at cache level `level`.
    pub fn chmc_code(level: u32) -> String {
        format!("CHMCL{level}Code")
    }

    /// Hit/miss classification of a data access at cache level `level`.
    pub fn chmc_data(level: u32) -> String {
        format!("CHMCL{level}Data")
    }

    /// Access classification of an instruction fetch at cache level `level`.
    pub fn cac_code(level: u32) -> String {
        format!("CACL{level}Code")
    }

    /// Access classification of a data access at cache level `level`.
    pub fn cac_data(level: u32) -> String {
        format!("CACL{level}Data")
    }

    /// Number of memory blocks a load may touch at cache level `level`.
    pub fn data_block_count(level: u32) -> String {
        format!("DataBlockCountL{level}")
    }

    /// Age recorded by the Must analysis when `keep_age` is set.
    pub fn age_must_code(level: u32) -> String {
        format!("AGEL{level}Code_MUST")
    }

    /// Age recorded by the persistence analysis when `keep_age` is set.
    pub fn age_ps_code(level: u32) -> String {
        format!("AGEL{level}Code_PS")
    }

    /// Name of the frequency attribute for one context (`frequency_c<ctx>`).
    pub fn frequency_in(ctx: super::ContextId) -> String {
        format!("{FREQUENCY}_c{}", ctx.as_u32())
    }
}

// ATTRIBUTE KEY
// ================================================================================================

/// Key of one attribute: a base name plus an optional execution context.
///
/// The textual convention `base#ctx` only exists at the XML boundary; in memory the context is
/// part of the key so lookups never go through string concatenation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AttrKey {
    base: String,
    ctx: Option<ContextId>,
}

impl AttrKey {
    /// Returns a non-contextual key.
    pub fn plain(base: impl Into<String>) -> Self {
        Self { base: base.into(), ctx: None }
    }

    /// Returns a key bound to one execution context.
    pub fn in_ctx(base: impl Into<String>, ctx: ContextId) -> Self {
        Self { base: base.into(), ctx: Some(ctx) }
    }

    /// Parses the serialized `base#ctx` form.
    pub fn from_serialized(name: &str) -> Self {
        match name.rsplit_once('#') {
            Some((base, ctx)) => match ctx.parse::<u32>() {
                Ok(id) => Self::in_ctx(base, ContextId::new(id)),
                Err(_) => Self::plain(name),
            },
            None => Self::plain(name),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn context(&self) -> Option<ContextId> {
        self.ctx
    }
}

impl fmt::Display for AttrKey {
    /// Formats the key in its serialized `base#ctx` form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ctx {
            Some(ctx) => write!(f, "{}#{}", self.base, ctx.as_u32()),
            None => f.write_str(&self.base),
        }
    }
}

// ATTRIBUTE VALUES
// ================================================================================================

/// One address range `[start, start + size)` accessed by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub size: u64,
}

impl AddressRange {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }
}

/// Address information for one memory segment touched by an instruction.
///
/// The `code` segment holds the instruction's own address; other segments (`data`, `bss`,
/// `stack`, ...) hold the ranges a load or store may access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub segment: String,
    pub ranges: Vec<AddressRange>,
}

/// A typed attribute value.
///
/// `Scratch` values are pass-internal integers; the serializer skips them so they can never
/// leak into an output file.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    UInt(u64),
    Hex(u64),
    Float(f64),
    Str(String),
    Address(Vec<AddressInfo>),
    ContextList(Vec<ContextId>),
    Scratch(i64),
}

impl AttrValue {
    /// Returns true when the value survives serialization.
    pub fn is_serializable(&self) -> bool {
        !matches!(self, AttrValue::Scratch(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) | AttrValue::Scratch(v) => Some(*v),
            AttrValue::UInt(v) | AttrValue::Hex(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<&[AddressInfo]> {
        match self {
            AttrValue::Address(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_context_list(&self) -> Option<&[ContextId]> {
        match self {
            AttrValue::ContextList(v) => Some(v),
            _ => None,
        }
    }
}

// ATTRIBUTE MAP
// ================================================================================================

/// Attribute dictionary carried by every entity of the program model.
///
/// Iteration order is the lexicographic key order, which keeps serialization and all
/// attribute-driven traversals deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrMap {
    entries: BTreeMap<AttrKey, AttrValue>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an attribute, overwriting any previous value under the same key.
    pub fn set(&mut self, key: AttrKey, value: AttrValue) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &AttrKey) -> Option<&AttrValue> {
        self.entries.get(key)
    }

    pub fn has(&self, key: &AttrKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &AttrKey) -> Option<AttrValue> {
        self.entries.remove(key)
    }

    /// Removes every attribute whose key satisfies `pred`.
    pub fn remove_matching(&mut self, mut pred: impl FnMut(&AttrKey) -> bool) {
        self.entries.retain(|key, _| !pred(key));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttrKey, &AttrValue)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // CONVENIENCE ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn set_plain(&mut self, base: impl Into<String>, value: AttrValue) {
        self.set(AttrKey::plain(base), value);
    }

    pub fn set_in_ctx(&mut self, base: impl Into<String>, ctx: ContextId, value: AttrValue) {
        self.set(AttrKey::in_ctx(base, ctx), value);
    }

    pub fn get_plain(&self, base: &str) -> Option<&AttrValue> {
        self.get(&AttrKey::plain(base))
    }

    pub fn get_in_ctx(&self, base: &str, ctx: ContextId) -> Option<&AttrValue> {
        self.get(&AttrKey::in_ctx(base, ctx))
    }

    pub fn int_in_ctx(&self, base: &str, ctx: ContextId) -> Option<i64> {
        self.get_in_ctx(base, ctx).and_then(AttrValue::as_int)
    }

    pub fn str_in_ctx(&self, base: &str, ctx: ContextId) -> Option<&str> {
        self.get_in_ctx(base, ctx).and_then(AttrValue::as_str)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contextual_keys_are_distinct() {
        let mut attrs = AttrMap::new();
        attrs.set_plain("CHMCL1Code", AttrValue::Str("AH".into()));
        attrs.set_in_ctx("CHMCL1Code", ContextId::new(1), AttrValue::Str("AM".into()));

        assert_eq!(attrs.get_plain("CHMCL1Code").unwrap().as_str(), Some("AH"));
        assert_eq!(
            attrs.get_in_ctx("CHMCL1Code", ContextId::new(1)).unwrap().as_str(),
            Some("AM")
        );
        assert!(attrs.get_in_ctx("CHMCL1Code", ContextId::new(2)).is_none());
    }

    #[test]
    fn serialized_name_round_trips() {
        let key = AttrKey::in_ctx("CACL2Code", ContextId::new(7));
        assert_eq!(key.to_string(), "CACL2Code#7");
        assert_eq!(AttrKey::from_serialized("CACL2Code#7"), key);
        assert_eq!(AttrKey::from_serialized("maxiter"), AttrKey::plain("maxiter"));
    }

    #[test]
    fn scratch_values_are_not_serializable() {
        assert!(!AttrValue::Scratch(3).is_serializable());
        assert!(AttrValue::Int(3).is_serializable());
    }

    proptest::proptest! {
        #[test]
        fn any_contextual_key_survives_serialization(
            base in "[A-Za-z][A-Za-z0-9_]{0,24}",
            ctx in 0u32..10_000,
        ) {
            let key = AttrKey::in_ctx(base.clone(), ContextId::new(ctx));
            proptest::prop_assert_eq!(AttrKey::from_serialized(&key.to_string()), key);

            let plain = AttrKey::plain(base);
            proptest::prop_assert_eq!(AttrKey::from_serialized(&plain.to_string()), plain);
        }
    }
}
