//! Parsing and evaluation of `STACK CFI` register-recovery rules.
//!
//! A rule set maps caller registers to postfix expressions evaluated
//! against the callee's register values and stack memory, e.g.
//!
//! ```text
//! .cfa: $esp 4 +  .ra: .cfa 4 - ^  $ebp: $ebp
//! ```
//!
//! `.cfa` (canonical frame address) and `.ra` (return address) are
//! synthetic registers that must be recoverable at every covered address.
//! Expressions may refer to them, so rules are evaluated on demand and
//! memoized; a cyclic reference fails the registers involved.

use std::collections::HashMap;

use arrayvec::ArrayVec;
use tracing::debug;

use crate::memory::MemoryRegion;

const CFA: &str = ".cfa";
const RA: &str = ".ra";

/// Postfix expressions never legitimately get deep; a stack this size
/// only overflows on garbage input.
const VALUE_STACK_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Literal(u64),
    /// A register value from the callee's frame.
    CalleeReg(String),
    /// A dotted name: the computed value of another rule in this set.
    RuleRef(String),
    Undef,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Align,
    Deref,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expr {
    tokens: Vec<Token>,
}

fn is_identifier(token: &str) -> bool {
    let mut bytes = token.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic() || b == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn parse_expr(input: &str) -> Option<Expr> {
    let mut tokens = Vec::new();
    for token in input.split_ascii_whitespace() {
        let parsed = match token {
            "+" => Token::Add,
            "-" => Token::Sub,
            "*" => Token::Mul,
            "/" => Token::Div,
            "%" => Token::Rem,
            "@" => Token::Align,
            "^" => Token::Deref,
            ".undef" => Token::Undef,
            _ => {
                if let Some(reg) = token.strip_prefix('$') {
                    Token::CalleeReg(reg.to_string())
                } else if token.starts_with('.') {
                    Token::RuleRef(token.to_string())
                } else if let Some(hex) = token.strip_prefix("0x") {
                    Token::Literal(u64::from_str_radix(hex, 16).ok()?)
                } else if let Ok(value) = token.parse::<i64>() {
                    Token::Literal(value as u64)
                } else if is_identifier(token) {
                    // ARM-family symbol files name registers without the
                    // `$` sigil.
                    Token::CalleeReg(token.to_string())
                } else {
                    return None;
                }
            }
        };
        tokens.push(parsed);
    }
    if tokens.is_empty() {
        return None;
    }
    Some(Expr { tokens })
}

/// The effective rule set for one address: each caller register paired
/// with its pre-parsed recovery expression.
///
/// Construction parses each expression once; evaluation can then run for
/// any number of register snapshots.
#[derive(Clone, Debug, PartialEq)]
pub struct CfiFrameInfo {
    /// `.cfa` and `.ra` are stored like any other rule; their presence
    /// is checked at construction.
    rules: Vec<(String, Expr)>,
}

impl CfiFrameInfo {
    /// Build the effective rules from an `INIT` string and the delta
    /// strings that apply at the queried address, in order. Later rules
    /// for a register replace earlier ones.
    ///
    /// Returns `None` when `.cfa` or `.ra` ends up missing or
    /// unparseable, which makes the whole rule set unusable.
    pub fn from_rule_strings<'s>(
        rule_strings: impl IntoIterator<Item = &'s str>,
    ) -> Option<CfiFrameInfo> {
        let mut raw: Vec<(String, String)> = Vec::new();
        for rules in rule_strings {
            parse_rule_set(rules, &mut raw)?;
        }

        let mut parsed = Vec::with_capacity(raw.len());
        for (register, expr) in raw {
            match parse_expr(&expr) {
                Some(expr) => parsed.push((register, expr)),
                // A broken rule for an ordinary register just leaves it
                // unrecovered.
                None if register == CFA || register == RA => return None,
                None => debug!(%register, %expr, "dropping unparseable CFI rule"),
            }
        }

        let has = |name| parsed.iter().any(|(reg, _)| reg == name);
        if !has(CFA) || !has(RA) {
            return None;
        }
        Some(CfiFrameInfo { rules: parsed })
    }

    /// Recover the caller's registers from the callee's.
    ///
    /// The result maps `.cfa`, `.ra`, and every register with a
    /// successful rule to its caller value. Returns `None` when `.cfa`
    /// or `.ra` cannot be computed; other failed rules are simply
    /// absent.
    pub fn find_caller_regs(
        &self,
        callee: &HashMap<&str, u64>,
        word_size: u8,
        memory: &dyn MemoryRegion,
    ) -> Option<HashMap<String, u64>> {
        let mut evaluator = Evaluator {
            info: self,
            callee,
            word_size,
            memory,
            states: vec![None; self.rules.len()],
        };

        let cfa = evaluator.rule_value(CFA)?;
        let ra = evaluator.rule_value(RA)?;

        let mut out = HashMap::new();
        out.insert(CFA.to_string(), cfa);
        out.insert(RA.to_string(), ra);
        for (register, _) in &self.rules {
            if register == CFA || register == RA {
                continue;
            }
            if let Some(value) = evaluator.rule_value(register) {
                out.insert(register.clone(), value);
            }
        }
        Some(out)
    }
}

/// Split `reg: expr reg: expr …` into pairs, appending to `out` with
/// later entries replacing earlier ones for the same register.
fn parse_rule_set(input: &str, out: &mut Vec<(String, String)>) -> Option<()> {
    let mut current: Option<(String, String)> = None;
    let mut commit = |entry: Option<(String, String)>, out: &mut Vec<(String, String)>| {
        if let Some((register, expr)) = entry {
            match out.iter_mut().find(|(existing, _)| *existing == register) {
                Some(slot) => slot.1 = expr,
                None => out.push((register, expr)),
            }
        }
    };

    for token in input.split_ascii_whitespace() {
        if let Some(register) = token.strip_suffix(':') {
            commit(current.take(), out);
            let register = register.strip_prefix('$').unwrap_or(register);
            if register.is_empty() {
                debug!(token, "bad register in CFI rule set");
                return None;
            }
            current = Some((register.to_string(), String::new()));
        } else {
            match current {
                Some((_, ref mut expr)) => {
                    if !expr.is_empty() {
                        expr.push(' ');
                    }
                    expr.push_str(token);
                }
                // An expression with no register to assign to.
                None => return None,
            }
        }
    }
    commit(current.take(), out);
    Some(())
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    InProgress,
    Done(u64),
    Failed,
}

struct Evaluator<'a> {
    info: &'a CfiFrameInfo,
    callee: &'a HashMap<&'a str, u64>,
    word_size: u8,
    memory: &'a dyn MemoryRegion,
    states: Vec<Option<State>>,
}

impl<'a> Evaluator<'a> {
    fn rule_value(&mut self, register: &str) -> Option<u64> {
        let index = self
            .info
            .rules
            .iter()
            .position(|(name, _)| name == register)?;
        match self.states[index] {
            Some(State::Done(value)) => return Some(value),
            Some(State::Failed) => return None,
            Some(State::InProgress) => {
                debug!(register, "cyclic CFI rule reference");
                self.states[index] = Some(State::Failed);
                return None;
            }
            None => {}
        }
        self.states[index] = Some(State::InProgress);
        let result = self.eval_expr(index);
        self.states[index] = Some(match result {
            Some(value) => State::Done(value),
            None => State::Failed,
        });
        result
    }

    fn eval_expr(&mut self, rule_index: usize) -> Option<u64> {
        let info = self.info;
        let expr = &info.rules[rule_index].1;
        let mut stack: ArrayVec<u64, VALUE_STACK_DEPTH> = ArrayVec::new();
        for token in &expr.tokens {
            match token {
                Token::Literal(value) => stack.try_push(*value).ok()?,
                Token::CalleeReg(name) => {
                    let value = *self.callee.get(name.as_str())?;
                    stack.try_push(value).ok()?;
                }
                Token::RuleRef(name) => {
                    let value = self.rule_value(name)?;
                    stack.try_push(value).ok()?;
                }
                Token::Undef => return None,
                Token::Deref => {
                    let address = stack.pop()?;
                    let value = self.memory.read_word(address, self.word_size)?;
                    stack.try_push(value).ok()?;
                }
                Token::Add | Token::Sub | Token::Mul | Token::Div | Token::Rem | Token::Align => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?;
                    let value = match token {
                        Token::Add => lhs.wrapping_add(rhs),
                        Token::Sub => lhs.wrapping_sub(rhs),
                        Token::Mul => lhs.wrapping_mul(rhs),
                        Token::Div | Token::Rem | Token::Align if rhs == 0 => return None,
                        Token::Div => lhs.wrapping_div(rhs),
                        Token::Rem => lhs.wrapping_rem(rhs),
                        _ => lhs.wrapping_div(rhs).wrapping_mul(rhs),
                    };
                    stack.try_push(value).ok()?;
                }
            }
        }
        if stack.len() == 1 {
            stack.pop()
        } else {
            None
        }
    }
}
