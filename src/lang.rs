use gimli::constants as dw;

/// The source language family of a compilation unit, as far as name
/// qualification is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SourceLanguage {
    /// C, C++, Objective-C, and anything unrecognized: qualify with `::`.
    #[default]
    CFamily,
    /// Java and Kotlin: qualify with `.`.
    JavaFamily,
    /// Mangled names pass straight through to the demangler, unqualified.
    Swift,
    /// Mangled names pass straight through to the demangler, unqualified.
    Rust,
    /// Assembler-only units emit no names at all.
    Assembler,
}

impl SourceLanguage {
    pub fn from_dwarf(language: dw::DwLang) -> Self {
        match language {
            dw::DW_LANG_Java | dw::DW_LANG_Kotlin => SourceLanguage::JavaFamily,
            dw::DW_LANG_Swift => SourceLanguage::Swift,
            dw::DW_LANG_Rust => SourceLanguage::Rust,
            dw::DW_LANG_Mips_Assembler => SourceLanguage::Assembler,
            _ => SourceLanguage::CFamily,
        }
    }

    /// Whether names in this language are used raw and resolved through
    /// the demangler instead of scope concatenation.
    pub fn uses_mangled_names(self) -> bool {
        matches!(self, SourceLanguage::Swift | SourceLanguage::Rust)
    }

    /// Join an enclosing scope and a name. `None` means this language
    /// emits no name for the entity.
    pub fn qualify(self, scope: Option<&str>, name: &str) -> Option<String> {
        let separator = match self {
            SourceLanguage::CFamily => "::",
            SourceLanguage::JavaFamily => ".",
            // Mangled names already encode their full path.
            SourceLanguage::Swift | SourceLanguage::Rust => return Some(name.to_string()),
            SourceLanguage::Assembler => return None,
        };
        match scope {
            Some(scope) if !scope.is_empty() => Some(format!("{scope}{separator}{name}")),
            _ => Some(name.to_string()),
        }
    }
}
