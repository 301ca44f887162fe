/// The CPU architecture of the crashed process.
///
/// This selects the stack walker variant and the register name table used
/// for CFI evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum CpuArch {
    X86,
    X86_64,
    Arm,
    Arm64,
    Ppc,
    Ppc64,
    Mips,
    Riscv,
}

impl CpuArch {
    /// Parse the architecture field of a `MODULE` record or a minidump
    /// system-info stream.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x86" => Some(CpuArch::X86),
            "x86_64" | "amd64" => Some(CpuArch::X86_64),
            "arm" => Some(CpuArch::Arm),
            "arm64" | "aarch64" => Some(CpuArch::Arm64),
            "ppc" => Some(CpuArch::Ppc),
            "ppc64" => Some(CpuArch::Ppc64),
            "mips" => Some(CpuArch::Mips),
            "riscv" | "riscv64" => Some(CpuArch::Riscv),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CpuArch::X86 => "x86",
            CpuArch::X86_64 => "x86_64",
            CpuArch::Arm => "arm",
            CpuArch::Arm64 => "arm64",
            CpuArch::Ppc => "ppc",
            CpuArch::Ppc64 => "ppc64",
            CpuArch::Mips => "mips",
            CpuArch::Riscv => "riscv",
        }
    }

    /// The pointer width in bytes.
    pub fn word_size(self) -> u8 {
        match self {
            CpuArch::X86 | CpuArch::Arm | CpuArch::Ppc | CpuArch::Mips => 4,
            CpuArch::X86_64 | CpuArch::Arm64 | CpuArch::Ppc64 | CpuArch::Riscv => 8,
        }
    }
}

/// The operating system the snapshot was captured on.
///
/// Only a few walker decisions depend on this (the ARM frame-pointer
/// register, for one); `Unknown` is always safe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Os {
    Linux,
    MacOs,
    Ios,
    Windows,
    Android,
    #[default]
    Unknown,
}

impl Os {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Linux" | "linux" => Os::Linux,
            "mac" | "macos" => Os::MacOs,
            "ios" => Os::Ios,
            "windows" | "Windows" | "windows_msvc" => Os::Windows,
            "android" => Os::Android,
            _ => Os::Unknown,
        }
    }
}

/// Identifying information about the system that produced the snapshot.
#[derive(Clone, Debug)]
pub struct SystemInfo {
    pub os: Os,
    pub cpu: CpuArch,
}

impl SystemInfo {
    pub fn new(os: Os, cpu: CpuArch) -> Self {
        Self { os, cpu }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arch_names_round_trip() {
        for arch in [
            CpuArch::X86,
            CpuArch::X86_64,
            CpuArch::Arm,
            CpuArch::Arm64,
            CpuArch::Ppc,
            CpuArch::Ppc64,
            CpuArch::Mips,
            CpuArch::Riscv,
        ] {
            assert_eq!(CpuArch::from_name(arch.name()), Some(arch));
        }
        assert_eq!(CpuArch::from_name("aarch64"), Some(CpuArch::Arm64));
        assert_eq!(CpuArch::from_name("sparc"), None);
    }
}
