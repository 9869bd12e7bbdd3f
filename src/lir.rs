//! The low-level IR that the optimizer works on.
//!
//! A [Program] is a set of functions; a [Function] is an ordered list of
//! [BasicBlock]s.  Instructions live in a per-function arena and blocks refer
//! to them by [InstId], so erasing an instruction leaves a tombstone in the
//! arena and never shifts the ids of its neighbors.  The function also owns
//! the use-lists: for every instruction, the set of instructions that consume
//! its result.  The two mutation primitives the optimizer relies on,
//! [Function::replace_all_uses_with] and [Function::erase], keep the
//! use-lists in sync; nothing else is allowed to edit them.
//!
//! Programs have a textual form (`FromStr` to parse, `Display` to print):
//!
//! ```text
//! fn max(i32, i32) -> i32 {
//! entry:
//!   %c = icmp sgt i32 %arg0, %arg1
//!   cbr i1 %c, then, else
//! then:
//!   ret i32 %arg0
//! else:
//!   ret i32 %arg1
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::commons::{Map, Set, Valid};

pub mod interp;
pub mod parser;

#[cfg(test)]
mod tests;

pub use interp::RuntimeError;
pub use parser::{parse, ParseError};

// SECTION: identifiers

/// Index of an instruction in its function's arena.
pub type InstId = usize;

/// A basic block label.
#[derive(Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BbId(String);

pub fn bb_id(name: &str) -> BbId {
    BbId(name.to_string())
}

/// A function name.
#[derive(Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FuncId(String);

pub fn func_id(name: &str) -> FuncId {
    FuncId(name.to_string())
}

// SECTION: types and constants

/// The integer bit widths the IR supports.
#[derive(
    Clone, Copy, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub enum Width {
    #[display(fmt = "i1")]
    I1,
    #[display(fmt = "i8")]
    I8,
    #[display(fmt = "i16")]
    I16,
    #[display(fmt = "i32")]
    I32,
    #[display(fmt = "i64")]
    I64,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::I1 => 1,
            Width::I8 => 8,
            Width::I16 => 16,
            Width::I32 => 32,
            Width::I64 => 64,
        }
    }

    /// Mask selecting the low `bits()` bits of a 64-bit value.
    pub fn mask(self) -> u64 {
        u64::MAX >> (64 - self.bits())
    }

    /// The unsigned reading of `value` at this width.
    pub fn unsigned(self, value: i64) -> u64 {
        value as u64 & self.mask()
    }
}

/// An immutable integer constant: a bit width and a signed value.
///
/// Two constants are equal iff both the width and the value match.  The
/// stored value is always in canonical form for the width (sign-extended,
/// except `i1` which stores `0` or `1`), so equality on the fields is the
/// right notion.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Constant {
    width: Width,
    value: i64,
}

impl Constant {
    /// Build a constant, wrapping `value` to `width` with two's-complement
    /// truncation and sign extension.  Construction never fails.
    ///
    /// `i1` is the exception: it keeps the low bit unsigned, so a true
    /// condition is the 1-bit value `1` and prints as `1`.
    pub fn new(width: Width, value: i64) -> Constant {
        let bits = width.bits();
        let value = if bits == 64 {
            value
        } else if width == Width::I1 {
            value & 1
        } else {
            // truncate to the low bits, then sign-extend back to 64.
            (value << (64 - bits)) >> (64 - bits)
        };
        Constant { width, value }
    }

    pub fn width(self) -> Width {
        self.width
    }

    pub fn value(self) -> i64 {
        self.value
    }

    pub fn is_true(self) -> bool {
        self.value != 0
    }
}

impl fmt::Display for Constant {
    // the width is printed by the enclosing instruction, not the operand.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

// SECTION: instructions

/// A comparison predicate.  The optimizer folds only the signed subset; the
/// unsigned predicates exist so that programs using them are representable
/// (and provably left alone).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Predicate {
    #[display(fmt = "eq")]
    Eq,
    #[display(fmt = "ne")]
    Ne,
    #[display(fmt = "sgt")]
    Sgt,
    #[display(fmt = "sge")]
    Sge,
    #[display(fmt = "slt")]
    Slt,
    #[display(fmt = "sle")]
    Sle,
    #[display(fmt = "ugt")]
    Ugt,
    #[display(fmt = "uge")]
    Uge,
    #[display(fmt = "ult")]
    Ult,
    #[display(fmt = "ule")]
    Ule,
}

/// What an instruction does.  Branch targets ride along with the opcode
/// because they are labels, not values, and must not appear in operand lists.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    SDiv,
    And,
    Or,
    Xor,
    ICmp(Predicate),
    Br(BbId),
    Cbr(BbId, BbId),
    Ret,
}

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::SDiv => "sdiv",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::ICmp(_) => "icmp",
            Opcode::Br(_) => "br",
            Opcode::Cbr(_, _) => "cbr",
            Opcode::Ret => "ret",
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Opcode::Br(_) | Opcode::Cbr(_, _) | Opcode::Ret)
    }

    /// How many operands an instruction with this opcode takes.
    pub fn arity(&self) -> usize {
        match self {
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::SDiv
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::ICmp(_) => 2,
            Opcode::Cbr(_, _) | Opcode::Ret => 1,
            Opcode::Br(_) => 0,
        }
    }

    /// Whether an instruction with this opcode defines a result value.
    pub fn has_result(&self) -> bool {
        !self.is_terminator()
    }
}

/// One operand slot of an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// An embedded constant.
    Const(Constant),
    /// A reference to the result of another instruction.
    Inst(InstId),
    /// A reference to a function argument.
    Arg(usize),
}

/// One IR instruction.
///
/// `ty` is the type of the operands: for arithmetic it is also the result
/// type, for `icmp` the result is always `i1`, and a plain `br` has no type
/// at all.  `result` is the value name the instruction defines, if any.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub ty: Option<Width>,
    pub operands: Vec<Operand>,
    pub result: Option<String>,
}

impl Instruction {
    /// The width of the value this instruction defines, if it defines one.
    pub fn result_width(&self) -> Option<Width> {
        match self.opcode {
            Opcode::ICmp(_) => Some(Width::I1),
            _ if self.opcode.has_result() => self.ty,
            _ => None,
        }
    }
}

// SECTION: blocks, functions, programs

/// A maximal straight-line run of instructions: one entry, one exit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BbId,
    pub insts: Vec<InstId>,
}

/// A function: an ordered list of basic blocks plus the instruction arena
/// and use-lists backing them.  The first block is the entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Function {
    pub id: FuncId,
    pub params: Vec<Width>,
    pub ret_ty: Width,
    pub body: Vec<BasicBlock>,
    insts: Vec<Option<Instruction>>,
    uses: Map<InstId, Set<InstId>>,
}

impl Function {
    pub fn new(id: FuncId, params: Vec<Width>, ret_ty: Width) -> Function {
        Function {
            id,
            params,
            ret_ty,
            body: Vec::new(),
            insts: Vec::new(),
            uses: Map::new(),
        }
    }

    /// Append an empty block and return its index in `body`.
    pub fn add_block(&mut self, id: BbId) -> usize {
        self.body.push(BasicBlock {
            id,
            insts: Vec::new(),
        });
        self.body.len() - 1
    }

    /// Append an instruction to the block with the given index, recording a
    /// use for every instruction reference among its operands.
    pub fn push_inst(&mut self, block: usize, inst: Instruction) -> InstId {
        let id = self.insts.len();
        for op in &inst.operands {
            if let Operand::Inst(src) = op {
                self.uses.entry(*src).or_default().insert(id);
            }
        }
        self.insts.push(Some(inst));
        self.body[block].insts.push(id);
        id
    }

    /// The instruction with the given id, or `None` if it has been erased.
    pub fn get_inst(&self, id: InstId) -> Option<&Instruction> {
        self.insts.get(id).and_then(|slot| slot.as_ref())
    }

    /// The instructions that consume `id`'s result.
    pub fn uses_of(&self, id: InstId) -> impl Iterator<Item = InstId> + '_ {
        self.uses.get(&id).into_iter().flatten().copied()
    }

    /// All live instruction ids in program order.
    pub fn inst_order(&self) -> impl Iterator<Item = InstId> + '_ {
        self.body.iter().flat_map(|bb| bb.insts.iter().copied())
    }

    /// Rewrite every operand slot referencing `id`'s result to embed the
    /// given constant instead.  Returns the instructions that were rewritten
    /// and clears `id`'s use-list.
    pub fn replace_all_uses_with(&mut self, id: InstId, constant: Constant) -> Vec<InstId> {
        let users: Vec<InstId> = self.uses.remove(&id).into_iter().flatten().collect();
        for &user in &users {
            if let Some(inst) = self.insts[user].as_mut() {
                for op in &mut inst.operands {
                    if *op == Operand::Inst(id) {
                        *op = Operand::Const(constant);
                    }
                }
            }
        }
        users
    }

    /// Remove the instruction from its block and tombstone its arena slot.
    /// The caller must have redirected or dropped all uses of its result.
    pub fn erase(&mut self, id: InstId) {
        if let Some(inst) = self.insts[id].take() {
            // drop the back-references its operands registered.
            for op in &inst.operands {
                if let Operand::Inst(src) = op {
                    if let Some(users) = self.uses.get_mut(src) {
                        users.remove(&id);
                    }
                }
            }
        }
        for bb in &mut self.body {
            bb.insts.retain(|&i| i != id);
        }
        self.uses.remove(&id);
    }

    fn operand_string(&self, op: &Operand) -> String {
        match op {
            Operand::Const(c) => c.to_string(),
            Operand::Arg(n) => format!("%arg{n}"),
            Operand::Inst(id) => match self.get_inst(*id).and_then(|i| i.result.as_ref()) {
                Some(name) => format!("%{name}"),
                None => "%?".to_string(),
            },
        }
    }

    /// Render one instruction the way `Display` does, for diagnostics.
    pub fn inst_string(&self, id: InstId) -> String {
        let Some(inst) = self.get_inst(id) else {
            return "<erased>".to_string();
        };

        let mut s = String::new();
        if let Some(name) = &inst.result {
            s.push_str(&format!("%{name} = "));
        }
        s.push_str(inst.opcode.name());
        if let Opcode::ICmp(pred) = &inst.opcode {
            s.push_str(&format!(" {pred}"));
        }
        if let Some(ty) = inst.ty {
            s.push_str(&format!(" {ty}"));
        }
        let ops: Vec<String> = inst.operands.iter().map(|op| self.operand_string(op)).collect();
        match &inst.opcode {
            Opcode::Br(target) => s.push_str(&format!(" {target}")),
            Opcode::Cbr(tt, ff) => s.push_str(&format!(" {}, {tt}, {ff}", ops[0])),
            _ if !ops.is_empty() => s.push_str(&format!(" {}", ops.join(", "))),
            _ => {}
        }
        s
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        writeln!(f, "fn {}({}) -> {} {{", self.id, params.join(", "), self.ret_ty)?;
        for bb in &self.body {
            writeln!(f, "{}:", bb.id)?;
            for &id in &bb.insts {
                writeln!(f, "  {}", self.inst_string(id))?;
            }
        }
        writeln!(f, "}}")
    }
}

/// A whole program: a set of named functions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Program {
    pub functions: Map<FuncId, Function>,
}

impl FromStr for Program {
    type Err = ParseError;

    fn from_str(code: &str) -> Result<Program, ParseError> {
        parse(code)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, func) in self.functions.values().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{func}")?;
        }
        Ok(())
    }
}

// SECTION: validation

/// A validation error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ValidationError(pub String);
impl std::error::Error for ValidationError {}

impl Program {
    /// Check well-formedness and wrap the program as [Valid].
    pub fn validate(self) -> Result<Valid<Program>, ValidationError> {
        for func in self.functions.values() {
            validate_function(func)?;
        }
        Ok(Valid(self))
    }
}

fn validate_function(func: &Function) -> Result<(), ValidationError> {
    let err = |msg: String| Err(ValidationError(format!("function {}: {msg}", func.id)));

    if func.body.is_empty() {
        return err("no basic blocks".to_string());
    }

    let mut labels = Set::new();
    for bb in &func.body {
        if !labels.insert(&bb.id) {
            return err(format!("duplicate block label {}", bb.id));
        }
    }

    // every live arena slot must sit in exactly one block.
    let mut seen: Set<InstId> = Set::new();
    for bb in &func.body {
        for &id in &bb.insts {
            if func.get_inst(id).is_none() {
                return err(format!("block {} lists an erased instruction", bb.id));
            }
            if !seen.insert(id) {
                return err(format!("instruction {id} appears in two positions"));
            }
        }
    }
    for (id, slot) in func.insts.iter().enumerate() {
        if slot.is_some() && !seen.contains(&id) {
            return err(format!("instruction {id} belongs to no block"));
        }
    }

    let mut names = Set::new();
    for id in func.inst_order() {
        let inst = func.get_inst(id).unwrap();

        match (&inst.result, inst.opcode.has_result()) {
            (Some(name), true) => {
                let shadows_arg = name
                    .strip_prefix("arg")
                    .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()));
                if shadows_arg {
                    return err(format!("result name %{name} shadows an argument"));
                }
                if !names.insert(name.clone()) {
                    return err(format!("duplicate result name %{name}"));
                }
            }
            (Some(name), false) => {
                return err(format!("%{name} defined by a terminator"));
            }
            (None, true) => {
                return err(format!("{} instruction without a result", inst.opcode.name()));
            }
            (None, false) => {}
        }

        if inst.operands.len() != inst.opcode.arity() {
            return err(format!(
                "{} expects {} operands, got {}",
                inst.opcode.name(),
                inst.opcode.arity(),
                inst.operands.len()
            ));
        }

        let ty = match inst.opcode {
            Opcode::Br(_) => None,
            Opcode::Cbr(_, _) => {
                if inst.ty != Some(Width::I1) {
                    return err("cbr condition must be i1".to_string());
                }
                Some(Width::I1)
            }
            Opcode::Ret => {
                if inst.ty != Some(func.ret_ty) {
                    return err(format!("ret type must be {}", func.ret_ty));
                }
                Some(func.ret_ty)
            }
            _ => match inst.ty {
                Some(ty) => Some(ty),
                None => return err(format!("{} without a type", inst.opcode.name())),
            },
        };

        for op in &inst.operands {
            let found = match op {
                Operand::Const(c) => c.width(),
                Operand::Arg(n) => match func.params.get(*n) {
                    Some(w) => *w,
                    None => return err(format!("argument %arg{n} out of range")),
                },
                Operand::Inst(src) => {
                    let Some(src_inst) = func.get_inst(*src) else {
                        return err(format!("operand references erased instruction {src}"));
                    };
                    match src_inst.result_width() {
                        Some(w) => w,
                        None => return err(format!("operand references instruction {src} with no result")),
                    }
                }
            };
            if Some(found) != ty {
                return err(format!(
                    "operand of {} has width {found}, expected {}",
                    inst.opcode.name(),
                    ty.map(|t| t.to_string()).unwrap_or_default()
                ));
            }
        }

        if let Opcode::Br(target) | Opcode::Cbr(target, _) = &inst.opcode {
            if !labels.contains(target) {
                return err(format!("branch to unknown block {target}"));
            }
        }
        if let Opcode::Cbr(_, ff) = &inst.opcode {
            if !labels.contains(ff) {
                return err(format!("branch to unknown block {ff}"));
            }
        }
    }

    for bb in &func.body {
        let Some((&last, rest)) = bb.insts.split_last() else {
            return err(format!("block {} is empty", bb.id));
        };
        if !func.get_inst(last).unwrap().opcode.is_terminator() {
            return err(format!("block {} does not end with a terminator", bb.id));
        }
        for &id in rest {
            if func.get_inst(id).unwrap().opcode.is_terminator() {
                return err(format!("terminator in the middle of block {}", bb.id));
            }
        }
    }

    Ok(())
}
