// ll(1) parser for the textual IR.
//
// The lexer is generated by logos; the parser is a hand-written descent over
// the token stream.  Value references must be defined before use, which lets
// the parser resolve names to instruction ids (and build the use-lists) in a
// single pass.

use std::ops::Range;

use derive_more::Display;
use logos::Logos;

use super::*;

// SECTION: interface

pub fn parse(code: &str) -> Result<Program, ParseError> {
    let mut parser = Parser::new(code)?;
    program_r(&mut parser)
}

/// A parse error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ParseError(pub String);
impl std::error::Error for ParseError {}

// SECTION: tokens

#[derive(Logos, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
pub enum TokenKind {
    #[display(fmt = "fn")]
    #[token("fn")]
    Fn,

    // opcodes, predicates, and types all lex as plain identifiers; the
    // parser tells them apart.
    #[display(fmt = "id")]
    #[regex(r"[A-Za-z_][A-Za-z0-9_.]*")]
    Id,

    // a `%`-prefixed value reference, e.g. `%a` or `%arg0`.
    #[display(fmt = "value")]
    #[regex(r"%[A-Za-z_][A-Za-z0-9_.]*")]
    Value,

    #[display(fmt = "num")]
    #[regex(r"-?[0-9]+")]
    Num,

    #[display(fmt = "->")]
    #[token("->")]
    Arrow,

    #[display(fmt = "=")]
    #[token("=")]
    Gets,

    #[display(fmt = ":")]
    #[token(":")]
    Colon,

    #[display(fmt = ",")]
    #[token(",")]
    Comma,

    #[display(fmt = "(")]
    #[token("(")]
    OpenParen,

    #[display(fmt = ")")]
    #[token(")")]
    CloseParen,

    #[display(fmt = "{{")]
    #[token("{")]
    OpenBrace,

    #[display(fmt = "}}")]
    #[token("}")]
    CloseBrace,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Range<usize>,
}

// SECTION: parser functionality

#[derive(Clone, Debug)]
struct Parser<'a> {
    code: &'a str,      // the source code being parsed
    tokens: Vec<Token>, // the token stream
    pos: usize,         // the position in the token stream
}

// utility functions for traversing the token stream and creating error
// messages.
impl<'a> Parser<'a> {
    // always use this to create new Parsers.
    fn new(code: &'a str) -> Result<Self, ParseError> {
        let mut tokens = Vec::new();
        for (result, span) in TokenKind::lexer(code).spanned() {
            match result {
                Ok(kind) => tokens.push(Token { kind, span }),
                Err(()) => {
                    let (row, col) = position(code, span.start);
                    return Err(ParseError(format!(
                        "lex error at line {row}, column {col}: unrecognized character"
                    )));
                }
            }
        }
        if tokens.is_empty() {
            Err(ParseError("empty token stream".to_string()))
        } else {
            Ok(Parser {
                code,
                tokens,
                pos: 0,
            })
        }
    }

    // if the next token has the given kind advances the iterator and returns
    // true, otherwise returns false.
    fn eat(&mut self, kind: TokenKind) -> bool {
        match self.peek() {
            Some(k) if k == kind => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    // returns an Ok or Err result depending on whether the next token has the
    // given kind, advancing the iterator on an Ok result.
    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.eat(kind) {
            Ok(())
        } else {
            self.error_next(&format!("expected `{kind}`"))
        }
    }

    // returns the next token (if it exists) without advancing the iterator.
    fn peek(&self) -> Option<TokenKind> {
        self.tokens.get(self.pos).map(|t| t.kind)
    }

    // returns whether the next token has the given kind, without advancing
    // the iterator.
    fn next_is(&self, kind: TokenKind) -> bool {
        self.peek() == Some(kind)
    }

    // returns whether we're at the end of the token stream.
    fn end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // returns the lexeme of the token immediately prior to the current token.
    fn slice_prev(&self) -> &str {
        &self.code[self.tokens[self.pos - 1].span.clone()]
    }

    // returns a parse error blaming the token we just advanced past.
    fn error_prev<T>(&self, msg: &str) -> Result<T, ParseError> {
        self.error(self.pos - 1, msg)
    }

    // returns a parse error blaming the next token to be inspected.
    fn error_next<T>(&self, msg: &str) -> Result<T, ParseError> {
        if self.end() {
            Err(ParseError(format!(
                "parse error: unexpected end of input ({msg})"
            )))
        } else {
            self.error(self.pos, msg)
        }
    }

    // constructs a parse error given the position of the error-causing token
    // in the token stream.
    fn error<T>(&self, pos: usize, msg: &str) -> Result<T, ParseError> {
        let span = &self.tokens[pos].span;
        let (row, col) = position(self.code, span.start);
        let lexeme = &self.code[span.clone()];
        Err(ParseError(format!(
            "parse error at line {row}, column {col}: {msg} (found `{lexeme}`)"
        )))
    }
}

// 1-based line and column of a byte offset in the source.
fn position(code: &str, offset: usize) -> (usize, usize) {
    let mut row = 1;
    let mut row_start = 0;
    for (idx, _) in code[..offset].match_indices('\n') {
        row += 1;
        row_start = idx + 1;
    }
    (row, offset - row_start + 1)
}

// SECTION: grammar

// program ::= fn+
fn program_r(parser: &mut Parser) -> Result<Program, ParseError> {
    let mut functions = Map::new();

    while !parser.end() {
        let func = function_r(parser)?;
        if functions.contains_key(&func.id) {
            return parser.error_prev(&format!("redefinition of function {}", func.id));
        }
        functions.insert(func.id.clone(), func);
    }

    Ok(Program { functions })
}

// fn ::= "fn" id "(" (width ("," width)*)? ")" "->" width "{" block+ "}"
fn function_r(parser: &mut Parser) -> Result<Function, ParseError> {
    parser.expect(TokenKind::Fn)?;
    parser.expect(TokenKind::Id)?;
    let id = func_id(parser.slice_prev());

    parser.expect(TokenKind::OpenParen)?;
    let mut params = Vec::new();
    if !parser.next_is(TokenKind::CloseParen) {
        loop {
            params.push(width_r(parser)?);
            if !parser.eat(TokenKind::Comma) {
                break;
            }
        }
    }
    parser.expect(TokenKind::CloseParen)?;
    parser.expect(TokenKind::Arrow)?;
    let ret_ty = width_r(parser)?;

    let mut func = Function::new(id, params, ret_ty);
    // names of results defined so far, for operand resolution.
    let mut defined: Map<String, InstId> = Map::new();

    parser.expect(TokenKind::OpenBrace)?;
    while !parser.eat(TokenKind::CloseBrace) {
        block_r(parser, &mut func, &mut defined)?;
    }

    Ok(func)
}

// block ::= id ":" inst+
fn block_r(
    parser: &mut Parser,
    func: &mut Function,
    defined: &mut Map<String, InstId>,
) -> Result<(), ParseError> {
    parser.expect(TokenKind::Id)?;
    let label = bb_id(parser.slice_prev());
    parser.expect(TokenKind::Colon)?;

    let block = func.add_block(label);

    loop {
        let inst = inst_r(parser, func, defined)?;
        let done = inst.opcode.is_terminator();
        let result = inst.result.clone();
        let id = func.push_inst(block, inst);
        if let Some(name) = result {
            defined.insert(name, id);
        }
        if done {
            return Ok(());
        }
    }
}

// inst ::= (value "=")? op
fn inst_r(
    parser: &mut Parser,
    func: &Function,
    defined: &Map<String, InstId>,
) -> Result<Instruction, ParseError> {
    let result = if parser.next_is(TokenKind::Value) {
        parser.expect(TokenKind::Value)?;
        let name = parser.slice_prev()[1..].to_string();
        parser.expect(TokenKind::Gets)?;
        Some(name)
    } else {
        None
    };

    parser.expect(TokenKind::Id)?;
    let opcode_name = parser.slice_prev().to_string();

    let (opcode, ty, operands) = match opcode_name.as_str() {
        "add" | "sub" | "mul" | "sdiv" | "and" | "or" | "xor" => {
            let opcode = match opcode_name.as_str() {
                "add" => Opcode::Add,
                "sub" => Opcode::Sub,
                "mul" => Opcode::Mul,
                "sdiv" => Opcode::SDiv,
                "and" => Opcode::And,
                "or" => Opcode::Or,
                _ => Opcode::Xor,
            };
            let ty = width_r(parser)?;
            let lhs = operand_r(parser, ty, func, defined)?;
            parser.expect(TokenKind::Comma)?;
            let rhs = operand_r(parser, ty, func, defined)?;
            (opcode, Some(ty), vec![lhs, rhs])
        }
        "icmp" => {
            parser.expect(TokenKind::Id)?;
            let pred = match parser.slice_prev() {
                "eq" => Predicate::Eq,
                "ne" => Predicate::Ne,
                "sgt" => Predicate::Sgt,
                "sge" => Predicate::Sge,
                "slt" => Predicate::Slt,
                "sle" => Predicate::Sle,
                "ugt" => Predicate::Ugt,
                "uge" => Predicate::Uge,
                "ult" => Predicate::Ult,
                "ule" => Predicate::Ule,
                _ => return parser.error_prev("expected a comparison predicate"),
            };
            let ty = width_r(parser)?;
            let lhs = operand_r(parser, ty, func, defined)?;
            parser.expect(TokenKind::Comma)?;
            let rhs = operand_r(parser, ty, func, defined)?;
            (Opcode::ICmp(pred), Some(ty), vec![lhs, rhs])
        }
        "br" => {
            parser.expect(TokenKind::Id)?;
            (Opcode::Br(bb_id(parser.slice_prev())), None, vec![])
        }
        "cbr" => {
            let ty = width_r(parser)?;
            let cond = operand_r(parser, ty, func, defined)?;
            parser.expect(TokenKind::Comma)?;
            parser.expect(TokenKind::Id)?;
            let tt = bb_id(parser.slice_prev());
            parser.expect(TokenKind::Comma)?;
            parser.expect(TokenKind::Id)?;
            let ff = bb_id(parser.slice_prev());
            (Opcode::Cbr(tt, ff), Some(ty), vec![cond])
        }
        "ret" => {
            let ty = width_r(parser)?;
            let op = operand_r(parser, ty, func, defined)?;
            (Opcode::Ret, Some(ty), vec![op])
        }
        _ => return parser.error_prev("expected an opcode"),
    };

    if result.is_some() && !opcode.has_result() {
        return parser.error_prev(&format!("{} does not define a value", opcode.name()));
    }
    if result.is_none() && opcode.has_result() {
        return parser.error_prev(&format!("{} must define a value", opcode.name()));
    }

    Ok(Instruction {
        opcode,
        ty,
        operands,
        result,
    })
}

// width ::= "i1" | "i8" | "i16" | "i32" | "i64"
fn width_r(parser: &mut Parser) -> Result<Width, ParseError> {
    parser.expect(TokenKind::Id)?;
    match parser.slice_prev() {
        "i1" => Ok(Width::I1),
        "i8" => Ok(Width::I8),
        "i16" => Ok(Width::I16),
        "i32" => Ok(Width::I32),
        "i64" => Ok(Width::I64),
        _ => parser.error_prev("expected a type"),
    }
}

// operand ::= num | value
//
// A numeric operand becomes an embedded constant of the instruction's
// operand type; `%argN` resolves to an argument, any other `%name` to the
// instruction that defined it.
fn operand_r(
    parser: &mut Parser,
    ty: Width,
    func: &Function,
    defined: &Map<String, InstId>,
) -> Result<Operand, ParseError> {
    if parser.eat(TokenKind::Num) {
        let value: i64 = parser
            .slice_prev()
            .parse()
            .or_else(|_| parser.error_prev("integer literal out of range"))?;
        return Ok(Operand::Const(Constant::new(ty, value)));
    }

    parser.expect(TokenKind::Value)?;
    let name = &parser.slice_prev()[1..];

    if let Some(rest) = name.strip_prefix("arg") {
        if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
            let n: usize = rest
                .parse()
                .or_else(|_| parser.error_prev("argument index out of range"))?;
            if n >= func.params.len() {
                return parser.error_prev(&format!("function has {} arguments", func.params.len()));
            }
            return Ok(Operand::Arg(n));
        }
    }

    match defined.get(name) {
        Some(&id) => Ok(Operand::Inst(id)),
        None => parser.error_prev(&format!("use of undefined value %{name}")),
    }
}
