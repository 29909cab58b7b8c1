use std::collections::HashMap;

use thiserror::Error;

use crate::module::TraceModule;

/// Arena handle for a module in a [`ModuleTable`].
///
/// Modules reference each other (relocation sources) by id, never by
/// pointer, so tearing a module down cannot leave dangling references: a
/// lookup of a released id simply returns `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(u32);

impl ModuleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("duplicate module name '{0}'")]
    DuplicateName(String),
}

/// Owning table of every module in one trace.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: Vec<Option<TraceModule>>,
    by_name: HashMap<String, ModuleId>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-released) modules.
    pub fn len(&self) -> usize {
        self.modules.iter().filter(|m| m.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&mut self, module: TraceModule) -> Result<ModuleId, TableError> {
        if self.by_name.contains_key(module.name()) {
            return Err(TableError::DuplicateName(module.name().to_string()));
        }
        let id = ModuleId(self.modules.len() as u32);
        self.by_name.insert(module.name().to_string(), id);
        self.modules.push(Some(module));
        Ok(id)
    }

    pub fn get(&self, id: ModuleId) -> Option<&TraceModule> {
        self.modules.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut TraceModule> {
        self.modules.get_mut(id.index())?.as_mut()
    }

    pub fn by_name(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).copied()
    }

    /// Live module ids in insertion order. Insertion order is the trace
    /// declaration order, which fixes the deterministic relocation and
    /// download order.
    pub fn ids(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.modules
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_some())
            .map(|(i, _)| ModuleId(i as u32))
    }

    /// The first live module of the given kind, in insertion order.
    pub fn first_of_kind(&self, kind: crate::ContentKind) -> Option<ModuleId> {
        self.ids()
            .find(|id| self.get(*id).is_some_and(|m| m.kind() == kind))
    }

    /// Tear down a module: frees its slot and detaches it from every other
    /// module that referenced it as a relocation source.
    ///
    /// Returns the released module, or `None` if `id` was already released.
    pub fn release(&mut self, id: ModuleId) -> Option<TraceModule> {
        let module = self.modules.get_mut(id.index())?.take()?;
        self.by_name.remove(module.name());
        for slot in self.modules.iter_mut().flatten() {
            slot.retain_relocs_not_sourcing(&[id]);
        }
        Some(module)
    }
}
