use std::fmt::Write;

/// The mangling scheme a symbol name appears to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManglingScheme {
    /// Itanium C++ ABI (`_Z…`, `__Z…`).
    Itanium,
    /// Rust legacy (`_ZN…17h<hash>E`) or v0 (`_R…`).
    Rust,
    /// Swift (`_T…`, `$s…`, `$S…`). Passed through verbatim.
    Swift,
    /// MSVC C++ (`?…`). Passed through verbatim; MSVC toolchains ship
    /// pre-demangled names in their debug info.
    Msvc,
    /// Not a recognized mangled name.
    Plain,
}

pub fn detect_scheme(name: &str) -> ManglingScheme {
    if name.starts_with("_R") || (name.starts_with("_ZN") && looks_like_rust_legacy(name)) {
        ManglingScheme::Rust
    } else if name.starts_with("_Z") || name.starts_with("__Z") {
        ManglingScheme::Itanium
    } else if name.starts_with("_T")
        || name.starts_with("$s")
        || name.starts_with("$S")
        || name.starts_with("_$s")
    {
        ManglingScheme::Swift
    } else if name.starts_with('?') {
        ManglingScheme::Msvc
    } else {
        ManglingScheme::Plain
    }
}

/// Rust legacy symbols are valid Itanium names whose last path element is
/// a `17h<16 hex digits>` hash.
fn looks_like_rust_legacy(name: &str) -> bool {
    let Some(rest) = name.strip_suffix('E') else {
        return false;
    };
    match rest.rfind("17h") {
        Some(pos) => {
            let hash = &rest[pos + 3..];
            hash.len() == 16 && hash.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// Attempt to demangle `name`.
///
/// `Ok(Some(_))` is the demangled form; `Ok(None)` means the name is not
/// subject to demangling and should be used as-is (plain names, and Swift
/// and MSVC names which pass through by policy); `Err(())` means the name
/// looked mangled but could not be demangled, and the caller should keep
/// the mangled form and report the failure.
pub fn demangle(name: &str) -> Result<Option<String>, ()> {
    match detect_scheme(name) {
        ManglingScheme::Rust => {
            let demangled = rustc_demangle::try_demangle(name).map_err(|_| ())?;
            // The alternate form drops the trailing disambiguator hash.
            let mut out = String::new();
            write!(out, "{demangled:#}").map_err(|_| ())?;
            Ok(Some(out))
        }
        ManglingScheme::Itanium => {
            let symbol = cpp_demangle::Symbol::new(name.as_bytes()).map_err(|_| ())?;
            let options = cpp_demangle::DemangleOptions::default();
            symbol.demangle(&options).map(Some).map_err(|_| ())
        }
        ManglingScheme::Swift | ManglingScheme::Msvc | ManglingScheme::Plain => Ok(None),
    }
}

/// Demangle `name` when possible, otherwise keep it unchanged.
pub fn demangle_or_keep(name: &str) -> String {
    match demangle(name) {
        Ok(Some(demangled)) => demangled,
        _ => name.to_string(),
    }
}
