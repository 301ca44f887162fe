//! `STACK WIN` frame descriptors and their program-string evaluator.
//!
//! x86 Windows toolchains describe unwinding with per-range frame data
//! rather than CFI. A record either gives fixed frame dimensions (FPO) or
//! a little postfix program that computes the caller's registers
//! (FrameData). The program grammar matches the CFI expression grammar
//! plus `=` assignment over named variables.

use std::collections::HashMap;

use tracing::debug;

use crate::memory::MemoryRegion;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowsFrameType {
    Fpo,
    FrameData,
    Unknown,
}

impl WindowsFrameType {
    /// The numeric type field of a `STACK WIN` record.
    pub fn from_record_type(value: u32) -> Self {
        match value {
            0 => WindowsFrameType::Fpo,
            4 => WindowsFrameType::FrameData,
            _ => WindowsFrameType::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowsFrameInfo {
    pub frame_type: WindowsFrameType,
    /// Module-relative start of the covered code.
    pub rva: u64,
    pub code_size: u64,
    pub prolog_size: u32,
    pub epilog_size: u32,
    pub parameter_size: u32,
    pub saved_register_size: u32,
    pub local_size: u32,
    pub max_stack_size: u32,
    pub allocates_base_pointer: bool,
    pub program_string: Option<String>,
}

impl WindowsFrameInfo {
    /// local_size + saved_register_size + the parameters our callee
    /// pushed for its call to us.
    pub fn frame_size(&self, grand_callee_parameter_size: u32) -> u32 {
        self.local_size + self.saved_register_size + grand_callee_parameter_size
    }
}

/// The callee registers a program string may read.
#[derive(Clone, Copy, Debug, Default)]
pub struct WinCalleeRegs {
    pub esp: u32,
    pub ebp: u32,
    pub ebx: Option<u32>,
}

enum Value<'a> {
    Var(&'a str),
    Int(u32),
    Undef,
}

impl<'a> Value<'a> {
    fn into_var(self) -> Option<&'a str> {
        match self {
            Value::Var(var) => Some(var),
            _ => None,
        }
    }

    fn into_int(self, vars: &HashMap<&'a str, u32>) -> Option<u32> {
        match self {
            Value::Var(var) => vars.get(var).copied(),
            Value::Int(int) => Some(int),
            Value::Undef => None,
        }
    }
}

/// Run a `STACK WIN` program string and return the caller registers it
/// produced, keyed by bare register name (`eip`, `esp`, …).
///
/// Returns `None` when the program is malformed or a needed input is
/// unavailable.
pub fn eval_program_string(
    info: &WindowsFrameInfo,
    program: &str,
    callee: WinCalleeRegs,
    grand_callee_parameter_size: u32,
    memory: &dyn MemoryRegion,
) -> Option<HashMap<&'static str, u32>> {
    let mut vars: HashMap<&str, u32> = HashMap::new();
    vars.insert("$esp", callee.esp);
    vars.insert("$ebp", callee.ebp);
    if let Some(ebx) = callee.ebx {
        vars.insert("$ebx", ebx);
    }

    let frame_size = info.frame_size(grand_callee_parameter_size);
    let search_start = callee.esp.wrapping_add(frame_size);
    vars.insert(".cbParams", info.parameter_size);
    vars.insert(".cbCalleeParams", grand_callee_parameter_size);
    vars.insert(".cbSavedRegs", info.saved_register_size);
    vars.insert(".cbLocals", info.local_size);
    vars.insert(".raSearch", search_start);
    vars.insert(".raSearchStart", search_start);

    let mut stack: Vec<Value> = Vec::new();
    for token in program.split_ascii_whitespace() {
        match token {
            "+" | "-" | "*" | "/" | "%" | "@" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                let result = match token {
                    "+" => lhs.wrapping_add(rhs),
                    "-" => lhs.wrapping_sub(rhs),
                    "*" => lhs.wrapping_mul(rhs),
                    "/" | "%" if rhs == 0 => return None,
                    "/" => lhs.wrapping_div(rhs),
                    "%" => lhs.wrapping_rem(rhs),
                    // Align: truncate lhs to a multiple of rhs.
                    "@" if rhs == 0 => return None,
                    _ => lhs.wrapping_div(rhs).wrapping_mul(rhs),
                };
                stack.push(Value::Int(result));
            }
            "=" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?.into_var()?;
                match rhs {
                    Value::Undef => {
                        vars.remove(lhs);
                    }
                    rhs => {
                        let value = rhs.into_int(&vars)?;
                        vars.insert(lhs, value);
                    }
                }
            }
            "^" => {
                let address = stack.pop()?.into_int(&vars)?;
                let word = memory.read_u32(address as u64)?;
                stack.push(Value::Int(word));
            }
            ".undef" => stack.push(Value::Undef),
            _ => {
                if token.starts_with('$') || token.starts_with('.') {
                    stack.push(Value::Var(token));
                } else if let Ok(value) = token.parse::<i32>() {
                    stack.push(Value::Int(value as u32));
                } else {
                    debug!(token, "bad token in STACK WIN program string");
                    return None;
                }
            }
        }
    }

    let mut out = HashMap::new();
    for (var, name) in [
        ("$eip", "eip"),
        ("$esp", "esp"),
        ("$ebp", "ebp"),
        ("$ebx", "ebx"),
        ("$esi", "esi"),
        ("$edi", "edi"),
    ] {
        if let Some(&value) = vars.get(var) {
            out.insert(name, value);
        }
    }
    Some(out)
}
