use tracing::warn;

/// Receiver for anomalies found while assembling debug information.
///
/// Nothing in this crate aborts on malformed input; every oddity is
/// delivered here and processing continues. Implementations decide
/// whether to log, count, or ignore.
pub trait Reporter {
    /// The name of the compilation unit currently being processed.
    fn cu_name(&mut self, _name: &str) {}

    /// A DIE's `specification` points at an offset with no known entry.
    fn unknown_specification(&mut self, die_offset: u64, target: u64);

    /// A DIE's `abstract_origin` points at an offset with no known entry.
    fn unknown_abstract_origin(&mut self, die_offset: u64, target: u64);

    /// A required section is absent from the object file.
    fn missing_section(&mut self, section_name: &str);

    /// `stmt_list` pointed outside the line-number program section.
    fn bad_line_info_offset(&mut self, offset: u64);

    /// A function's code range is not fully covered by line records.
    fn uncovered_function(&mut self, name: &str, start_address: u64);

    /// A line record's range is not fully covered by functions.
    fn uncovered_line(&mut self, address: u64, line_number: u32);

    /// A subprogram with code has no name attribute anywhere in its
    /// reference chain.
    fn unnamed_function(&mut self, die_offset: u64);

    /// A mangled name could not be demangled; the mangled form is kept.
    fn demangle_error(&mut self, name: &str);

    /// A reference points into another compilation unit but inter-CU
    /// handling is disabled.
    fn unhandled_inter_cu_reference(&mut self, die_offset: u64, target: u64);

    /// Whether uncovered-function/line sweeps should be performed at all.
    fn uncovered_warnings_enabled(&self) -> bool {
        true
    }
}

/// A [`Reporter`] that forwards everything to `tracing` warnings.
///
/// Uncovered-function/line warnings are off by default; they are common
/// and harmless with some toolchains.
pub struct LogReporter {
    filename: String,
    cu_name: Option<String>,
    report_uncovered: bool,
}

impl LogReporter {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            cu_name: None,
            report_uncovered: false,
        }
    }

    pub fn set_report_uncovered(&mut self, enabled: bool) {
        self.report_uncovered = enabled;
    }

    fn where_(&self) -> String {
        match &self.cu_name {
            Some(cu) => format!("{}, in CU {}", self.filename, cu),
            None => self.filename.clone(),
        }
    }
}

impl Reporter for LogReporter {
    fn cu_name(&mut self, name: &str) {
        self.cu_name = Some(name.to_string());
    }

    fn unknown_specification(&mut self, die_offset: u64, target: u64) {
        warn!(
            "{}: DIE at offset 0x{:x} has a specification attribute referring to the DIE at offset 0x{:x}, which was not marked as a declaration",
            self.where_(), die_offset, target
        );
    }

    fn unknown_abstract_origin(&mut self, die_offset: u64, target: u64) {
        warn!(
            "{}: DIE at offset 0x{:x} has an abstract_origin attribute referring to the DIE at offset 0x{:x}, which was not marked as an inline",
            self.where_(), die_offset, target
        );
    }

    fn missing_section(&mut self, section_name: &str) {
        warn!("{}: the {} section is missing", self.where_(), section_name);
    }

    fn bad_line_info_offset(&mut self, offset: u64) {
        warn!(
            "{}: line number data offset 0x{:x} is out of range",
            self.where_(),
            offset
        );
    }

    fn uncovered_function(&mut self, name: &str, start_address: u64) {
        warn!(
            "{}: function {} at 0x{:x} has no line number data",
            self.where_(),
            name,
            start_address
        );
    }

    fn uncovered_line(&mut self, address: u64, line_number: u32) {
        warn!(
            "{}: line {} at 0x{:x} has no enclosing function",
            self.where_(),
            line_number,
            address
        );
    }

    fn unnamed_function(&mut self, die_offset: u64) {
        warn!(
            "{}: function DIE at offset 0x{:x} has no name",
            self.where_(),
            die_offset
        );
    }

    fn demangle_error(&mut self, name: &str) {
        warn!("{}: failed to demangle {}", self.where_(), name);
    }

    fn unhandled_inter_cu_reference(&mut self, die_offset: u64, target: u64) {
        warn!(
            "{}: DIE at offset 0x{:x} refers to the DIE at offset 0x{:x} in another CU, but inter-CU references are disabled",
            self.where_(), die_offset, target
        );
    }

    fn uncovered_warnings_enabled(&self) -> bool {
        self.report_uncovered
    }
}
