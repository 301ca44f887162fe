use std::collections::BTreeMap;

use crate::module::{Function, Line, SymbolModule};
use crate::reporter::Reporter;

/// Why a line-number program could not be read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineReadError {
    /// The named section is absent from the object file.
    MissingSection(&'static str),
    /// The `stmt_list` offset points outside the section.
    BadOffset,
}

/// Reads DWARF line-number programs on behalf of the CU assembler.
///
/// Implemented by the host's DWARF reader; invoked once per CU when the
/// root DIE carries `stmt_list`. `files` receives the mapping from the
/// program's file indices to the module file ids it interned, which the
/// assembler needs to resolve inline call-site files.
pub trait LineToModule {
    /// A new compilation unit is starting.
    fn start_cu(&mut self, compilation_dir: &str);

    /// Read the line program at `offset`, appending line records to
    /// `lines` and interning files into `module`.
    fn read_program(
        &mut self,
        offset: u64,
        module: &mut SymbolModule,
        lines: &mut Vec<Line>,
        files: &mut BTreeMap<u64, u32>,
    ) -> Result<(), LineReadError>;
}

/// Attach line records to the functions whose ranges they overlap.
///
/// Both inputs must be sorted by address. Each maximal overlap
/// contributes the intersected sub-line to the function. Coverage gaps
/// are reported at most once per function and once per line; a gap in a
/// line's coverage that sits between the part already attributed to a
/// function and the start of the next function is alignment padding and
/// stays silent.
pub(crate) fn pair_lines_with_functions(
    functions: &mut [Function],
    lines: &[Line],
    reporter: &mut dyn Reporter,
) {
    let warn = reporter.uncovered_warnings_enabled();

    for function in functions.iter_mut() {
        let mut covered = 0u64;
        let mut total = 0u64;
        for &(fstart, fend) in &function.ranges {
            total += fend - fstart;
            let mut index = lines.partition_point(|line| line.end() <= fstart);
            while index < lines.len() && lines[index].address < fend {
                let line = &lines[index];
                let start = line.address.max(fstart);
                let end = line.end().min(fend);
                if start < end {
                    function.lines.push(Line {
                        address: start,
                        size: end - start,
                        file_id: line.file_id,
                        line: line.line,
                    });
                    covered += end - start;
                }
                index += 1;
            }
        }
        if warn && covered < total {
            reporter.uncovered_function(&function.name, function.entry());
        }
    }

    if !warn {
        return;
    }

    // Flattened, sorted code ranges for the line sweep.
    let mut ranges: Vec<(u64, u64)> = functions
        .iter()
        .flat_map(|f| f.ranges.iter().copied())
        .filter(|&(start, end)| start < end)
        .collect();
    ranges.sort_unstable();

    for line in lines {
        if line.size == 0 {
            continue;
        }
        let line_end = line.end();
        let mut cursor = line.address;
        let mut warned = false;
        let mut index = ranges.partition_point(|&(_, end)| end <= line.address);
        while index < ranges.len() && ranges[index].0 < line_end {
            let (rstart, rend) = ranges[index];
            if rstart > cursor && cursor == line.address {
                // Uncovered stretch at the start of the line: no earlier
                // part of this line was attributed, so it is not padding.
                warned = true;
            }
            cursor = cursor.max(rend.min(line_end));
            index += 1;
        }
        if cursor < line_end {
            // Trailing stretch. Tolerated as compiler alignment padding
            // when some earlier part of the line reached a function and
            // another function starts at or after the stretch.
            let padding = cursor > line.address
                && ranges
                    .binary_search_by(|&(start, _)| start.cmp(&line_end))
                    .map_or_else(|i| i < ranges.len(), |_| true);
            if !padding {
                warned = true;
            }
        }
        if warned {
            reporter.uncovered_line(line.address, line.line);
        }
    }
}
