/// Identity of one code module (executable or shared library) loaded in
/// the crashed process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Path of the mapped file, as seen in the process.
    pub code_file: String,
    /// Name of the matching debug file, often equal to `code_file`.
    pub debug_file: String,
    /// The debug identifier matching this build, as found in `MODULE`
    /// records.
    pub debug_id: String,
    /// Address the module is mapped at.
    pub base_address: u64,
    /// Size of the mapping in bytes.
    pub size: u64,
}

impl ModuleInfo {
    pub fn new(code_file: impl Into<String>, base_address: u64, size: u64) -> Self {
        let code_file = code_file.into();
        Self {
            debug_file: code_file.clone(),
            debug_id: String::new(),
            code_file,
            base_address,
            size,
        }
    }

    pub fn with_debug_info(
        mut self,
        debug_file: impl Into<String>,
        debug_id: impl Into<String>,
    ) -> Self {
        self.debug_file = debug_file.into();
        self.debug_id = debug_id.into();
        self
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address - self.base_address < self.size
    }

    /// The key the symbol database files this module under.
    pub(crate) fn key(&self) -> &str {
        &self.code_file
    }
}

/// The modules loaded in the process, sorted by base address.
#[derive(Default, Debug, Clone)]
pub struct ModuleList {
    /// sorted by base_address
    modules: Vec<ModuleInfo>,
}

impl ModuleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_modules(mut modules: Vec<ModuleInfo>) -> Self {
        modules.sort_by_key(|m| m.base_address);
        Self { modules }
    }

    pub fn add(&mut self, module: ModuleInfo) {
        let index = match self
            .modules
            .binary_search_by_key(&module.base_address, |m| m.base_address)
        {
            Ok(i) | Err(i) => i,
        };
        self.modules.insert(index, module);
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }

    /// The module whose mapping covers `address`.
    pub fn module_at(&self, address: u64) -> Option<&ModuleInfo> {
        let index = match self
            .modules
            .binary_search_by_key(&address, |m| m.base_address)
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let module = &self.modules[index];
        module.contains(address).then_some(module)
    }

    /// One past the highest mapped code address, or 0 with no modules.
    pub fn max_known_address(&self) -> u64 {
        self.modules
            .iter()
            .map(|m| m.base_address + m.size)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup() {
        let list = ModuleList::from_modules(vec![
            ModuleInfo::new("b", 0x5000_0000, 0x10000),
            ModuleInfo::new("a", 0x4000_0000, 0x10000),
        ]);
        assert_eq!(list.module_at(0x4000_0000).unwrap().code_file, "a");
        assert_eq!(list.module_at(0x4000_ffff).unwrap().code_file, "a");
        assert!(list.module_at(0x4001_0000).is_none());
        assert_eq!(list.module_at(0x5000_1234).unwrap().code_file, "b");
        assert!(list.module_at(0x3fff_ffff).is_none());
        assert_eq!(list.max_known_address(), 0x5001_0000);
    }
}
