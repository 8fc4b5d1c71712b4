use crate::attributes::AttrMap;
use crate::cfg::Cfg;
use crate::context::ContextTree;
use crate::CfgId;

// PROGRAM
// ================================================================================================

/// The program under analysis: a set of CFGs, a designated entry CFG, the context tree built
/// for that entry point, and the program-level attribute map.
///
/// A fresh program has no entry point and no contexts; both are installed by the orchestrator
/// before any analysis runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    name: String,
    cfgs: Vec<Cfg>,
    entry: Option<CfgId>,
    contexts: Option<ContextTree>,
    attrs: AttrMap,
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cfgs: Vec::new(),
            entry: None,
            contexts: None,
            attrs: AttrMap::new(),
        }
    }

    // CONSTRUCTION
    // --------------------------------------------------------------------------------------------

    pub fn add_cfg(&mut self, cfg: Cfg) -> CfgId {
        let id = CfgId::new(self.cfgs.len() as u32);
        self.cfgs.push(cfg);
        id
    }

    /// Selects the entry point by function name.
    pub fn set_entry_point(&mut self, name: &str) -> Option<CfgId> {
        let id = self.cfg_by_name(name)?;
        self.entry = Some(id);
        Some(id)
    }

    pub fn set_contexts(&mut self, tree: ContextTree) {
        self.contexts = Some(tree);
    }

    pub fn take_contexts(&mut self) -> Option<ContextTree> {
        self.contexts.take()
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_point(&self) -> Option<CfgId> {
        self.entry
    }

    pub fn contexts(&self) -> Option<&ContextTree> {
        self.contexts.as_ref()
    }

    pub fn num_cfgs(&self) -> usize {
        self.cfgs.len()
    }

    pub fn cfg(&self, id: CfgId) -> &Cfg {
        &self.cfgs[id.to_usize()]
    }

    pub fn cfg_mut(&mut self, id: CfgId) -> &mut Cfg {
        &mut self.cfgs[id.to_usize()]
    }

    pub fn cfg_ids(&self) -> impl Iterator<Item = CfgId> + '_ {
        (0..self.cfgs.len() as u32).map(CfgId::new)
    }

    pub fn cfgs(&self) -> impl Iterator<Item = (CfgId, &Cfg)> {
        self.cfgs.iter().enumerate().map(|(i, c)| (CfgId::new(i as u32), c))
    }

    pub fn cfg_by_name(&self, name: &str) -> Option<CfgId> {
        self.cfgs
            .iter()
            .position(|c| c.name() == name)
            .map(|i| CfgId::new(i as u32))
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut AttrMap {
        &mut self.attrs
    }
}
