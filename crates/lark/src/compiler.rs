//! Single-pass compiler: token stream → bytecode.
//!
//! There is no AST. A Pratt parser drives code generation directly: every
//! token kind maps to optional prefix/infix handlers plus a precedence,
//! and each handler emits into the chunk of the function currently being
//! built. Nested [`FunctionState`]s form the compiler chain; the VM
//! treats their chunks as GC roots because constants in an unfinished
//! chunk are not yet reachable from the heap.
//!
//! Errors use panic-mode recovery: the first diagnostic in a statement is
//! recorded, the rest are suppressed until `synchronize` skips to the
//! next statement boundary.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::chunk::{Chunk, OpCode};
use crate::object::{Function, ObjRef};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;
use crate::vm::Vm;

/// Local and upvalue slots are addressed with 16-bit operands.
const MAX_SLOTS: usize = u16::MAX as usize + 1;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum Precedence {
    None,
    Comma,      // ,
    Assignment, // =
    Ternary,    // ?:
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Power,      // ^
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn one_higher(self) -> Precedence {
        Precedence::try_from(u8::from(self) + 1).unwrap_or(Precedence::Primary)
    }
}

/// Expression handlers, dispatched by [`Parser::apply`]. An enum rather
/// than function pointers so the table stays free of higher-ranked
/// lifetime noise.
#[derive(Clone, Copy)]
enum Handler {
    Grouping,
    Call,
    List,
    Subscript,
    Comma,
    Dot,
    Unary,
    Binary,
    Conditional,
    Variable,
    String,
    Number,
    And,
    Or,
    Literal,
    FunctionExpr,
    Super,
    This,
}

struct ParseRule {
    prefix: Option<Handler>,
    infix: Option<Handler>,
    precedence: Precedence,
}

fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let (prefix, infix, precedence) = match kind {
        LeftParen => (Some(Handler::Grouping), Some(Handler::Call), Precedence::Call),
        LeftBracket => (Some(Handler::List), Some(Handler::Subscript), Precedence::Call),
        Comma => (None, Some(Handler::Comma), Precedence::Comma),
        Dot => (None, Some(Handler::Dot), Precedence::Call),
        Minus => (Some(Handler::Unary), Some(Handler::Binary), Precedence::Term),
        Plus => (None, Some(Handler::Binary), Precedence::Term),
        Slash | Star => (None, Some(Handler::Binary), Precedence::Factor),
        Caret => (None, Some(Handler::Binary), Precedence::Power),
        Question => (None, Some(Handler::Conditional), Precedence::Ternary),
        Bang => (Some(Handler::Unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(Handler::Binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(Handler::Binary), Precedence::Comparison)
        }
        Identifier => (Some(Handler::Variable), None, Precedence::None),
        String => (Some(Handler::String), None, Precedence::None),
        Number => (Some(Handler::Number), None, Precedence::None),
        And => (None, Some(Handler::And), Precedence::And),
        Or => (None, Some(Handler::Or), Precedence::Or),
        False | Nil | True => (Some(Handler::Literal), None, Precedence::None),
        Fun => (Some(Handler::FunctionExpr), None, Precedence::Primary),
        Super => (Some(Handler::Super), None, Precedence::None),
        This => (Some(Handler::This), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

/// What kind of body is being compiled; drives `this`/`return` rules,
/// slot 0, and the implicit return.
#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Expression,
    Method,
    Initializer,
    Getter,
}

struct Local<'src> {
    name: &'src str,
    /// −1 until the initializer finishes; reads before that are errors.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u16,
    is_local: bool,
}

/// One in-progress function. The chain of these (innermost last) is the
/// compiler's contribution to the GC root set.
pub(crate) struct FunctionState<'src> {
    pub(crate) function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    /// Bytecode offset `continue` loops back to, or −1 outside a loop.
    loop_start: i32,
    /// Scope depth at the innermost loop; locals above it are popped by
    /// `break`/`continue`.
    loop_scope: i32,
    /// Operand offset of the innermost loop's exit jump, or −1.
    exit_jump: i32,
}

struct ClassState {
    has_superclass: bool,
}

pub(crate) struct Parser<'src, 'vm> {
    vm: &'vm mut Vm,
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<String>,
    compilers: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

/// Compile a whole script. On success the returned function has arity 0
/// and no name; on failure every diagnostic is returned, already
/// formatted for stderr.
pub(crate) fn compile(source: &str, vm: &mut Vm) -> Result<ObjRef, Vec<String>> {
    let placeholder = Token {
        kind: TokenKind::Eof,
        lexeme: "",
        line: 1,
    };
    let mut parser = Parser {
        vm,
        scanner: Scanner::new(source),
        current: placeholder,
        previous: placeholder,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        compilers: Vec::new(),
        classes: Vec::new(),
    };
    parser.begin_function(FunctionKind::Script);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let state = parser.end_function();
    if parser.had_error {
        Err(parser.errors)
    } else {
        Ok(parser.vm.alloc_function(state.function, &parser.compilers))
    }
}

impl<'src, 'vm> Parser<'src, 'vm> {
    // -----------------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            // error tokens carry the diagnostic as their lexeme
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        let token = self.current;
        self.error_at(token, message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors
            .push(format!("[line {}] Error{}: {}", token.line, location, message));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -----------------------------------------------------------------------
    // Emitters
    // -----------------------------------------------------------------------

    fn state(&self) -> &FunctionState<'src> {
        self.compilers.last().unwrap()
    }

    fn state_mut(&mut self) -> &mut FunctionState<'src> {
        self.compilers.last_mut().unwrap()
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.state_mut().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_u16(&mut self, value: u16) {
        self.emit_byte((value >> 8) as u8);
        self.emit_byte(value as u8);
    }

    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            // an initializer always hands back the instance in slot 0
            self.emit_op(OpCode::GetLocal);
            self.emit_u16(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        if !self.current_chunk().write_constant(value, line) {
            self.error("Too many constants in one chunk.");
        }
    }

    /// Emit a jump with a placeholder offset; returns the operand offset
    /// for [`Parser::patch_jump`].
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, operand_offset: usize) {
        // −2 skips the operand itself
        let jump = self.current_chunk().code.len() - operand_offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.current_chunk().code;
        code[operand_offset] = (jump >> 8) as u8;
        code[operand_offset + 1] = jump as u8;
    }

    fn emit_loop(&mut self, target: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - target + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    /// Index of the chunk constant naming `name`, reusing an existing
    /// string constant when the pool already holds one.
    fn identifier_constant(&mut self, name: &str) -> u16 {
        {
            let chunk = &self.state().function.chunk;
            for (index, value) in chunk.constants.iter().enumerate() {
                if let Value::Obj(r) = *value {
                    if self.vm.heap().as_string(r) == Some(name) {
                        return index as u16;
                    }
                }
            }
        }
        let interned = self.vm.intern_in(name, &self.compilers);
        let index = self.current_chunk().add_constant(Value::Obj(interned));
        if index > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u16
    }

    fn emit_global_access(&mut self, short: OpCode, long: OpCode, arg: u16) {
        if arg < 256 {
            self.emit_op(short);
            self.emit_byte(arg as u8);
        } else {
            self.emit_op(long);
            self.emit_u16(arg);
        }
    }

    // -----------------------------------------------------------------------
    // Function and scope lifecycle
    // -----------------------------------------------------------------------

    fn begin_function(&mut self, kind: FunctionKind) {
        let mut function = Function::new();
        match kind {
            FunctionKind::Script => {}
            FunctionKind::Expression => {
                function.name = Some(self.vm.intern_in("", &self.compilers));
            }
            _ => {
                let name = self.previous.lexeme;
                function.name = Some(self.vm.intern_in(name, &self.compilers));
            }
        }
        let mut state = FunctionState {
            function,
            kind,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            loop_start: -1,
            loop_scope: -1,
            exit_jump: -1,
        };
        // slot 0 belongs to the VM: the receiver in class bodies,
        // unnameable everywhere else
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer | FunctionKind::Getter => "this",
            _ => "",
        };
        state.locals.push(Local {
            name: slot_zero,
            depth: 0,
            is_captured: false,
        });
        self.compilers.push(state);
    }

    fn end_function(&mut self) -> FunctionState<'src> {
        self.emit_return();
        self.compilers.pop().unwrap()
    }

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Pop every local belonging to the closed scope, closing the ones
    /// that were captured.
    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let op = {
                let state = self.state();
                match state.locals.last() {
                    Some(local) if local.depth > state.scope_depth => {
                        if local.is_captured {
                            OpCode::CloseUpvalue
                        } else {
                            OpCode::Pop
                        }
                    }
                    _ => break,
                }
            };
            self.emit_op(op);
            self.state_mut().locals.pop();
        }
    }

    // -----------------------------------------------------------------------
    // Variable resolution
    // -----------------------------------------------------------------------

    fn resolve_local(&mut self, compiler: usize, name: &str) -> Option<u16> {
        let mut found = None;
        for (index, local) in self.compilers[compiler].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((index, local.depth));
                break;
            }
        }
        let (index, depth) = found?;
        if depth == -1 {
            self.error("Can't read variable in its own initializer.");
        }
        Some(index as u16)
    }

    fn resolve_upvalue(&mut self, compiler: usize, name: &str) -> Option<u16> {
        if compiler == 0 {
            return None;
        }
        let enclosing = compiler - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.compilers[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(compiler, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(compiler, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, compiler: usize, index: u16, is_local: bool) -> u16 {
        let desc = UpvalueDesc { index, is_local };
        if let Some(existing) = self.compilers[compiler]
            .upvalues
            .iter()
            .position(|upvalue| *upvalue == desc)
        {
            return existing as u16;
        }
        let count = self.compilers[compiler].upvalues.len();
        if count == MAX_SLOTS {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.compilers[compiler].upvalues.push(desc);
        self.compilers[compiler].function.upvalue_count = count + 1;
        count as u16
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let state = self.state();
            for local in state.locals.iter().rev() {
                if local.depth != -1 && local.depth < state.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Variable with this name already declared in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() == MAX_SLOTS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u16) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_global_access(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global);
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn apply(&mut self, handler: Handler, can_assign: bool) {
        match handler {
            Handler::Grouping => self.grouping(),
            Handler::Call => self.call(),
            Handler::List => self.list(),
            Handler::Subscript => self.subscript(can_assign),
            Handler::Comma => self.comma(),
            Handler::Dot => self.dot(can_assign),
            Handler::Unary => self.unary(),
            Handler::Binary => self.binary(),
            Handler::Conditional => self.conditional(),
            Handler::Variable => self.variable(can_assign),
            Handler::String => self.string(),
            Handler::Number => self.number(),
            Handler::And => self.and_operator(),
            Handler::Or => self.or_operator(),
            Handler::Literal => self.literal(),
            Handler::FunctionExpr => self.function(FunctionKind::Expression),
            Handler::Super => self.super_expression(),
            Handler::This => self.this_expression(can_assign),
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        // only low-precedence expressions may be assignment targets
        let can_assign = precedence <= Precedence::Assignment;
        self.apply(prefix, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let Some(infix) = rule(self.previous.kind).infix else {
                self.error("Expect expression.");
                return;
            };
            self.apply(infix, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Comma);
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let chars = &lexeme[1..lexeme.len() - 1];
        let interned = self.vm.intern_in(chars, &self.compilers);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        // `^` recurses at its own level so it nests rightward; everything
        // else is left-associative
        let next = if operator == TokenKind::Caret {
            Precedence::Power
        } else {
            rule(operator).precedence.one_higher()
        };
        self.parse_precedence(next);
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Caret => self.emit_op(OpCode::Power),
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn and_operator(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_operator(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn conditional(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.consume(TokenKind::Colon, "Expect ':' after ?: expression.");
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(end_jump);
    }

    fn comma(&mut self) {
        // the left value is discarded
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Comma);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                // arguments sit above the comma operator
                self.parse_precedence(Precedence::Assignment);
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.parse_precedence(Precedence::Assignment);
            self.emit_op(OpCode::SetProperty);
            self.emit_u16(name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_u16(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_u16(name);
        }
    }

    fn list(&mut self) {
        let mut length: usize = 0;
        while !self.check(TokenKind::RightBracket) {
            self.parse_precedence(Precedence::Assignment);
            length += 1;
            if length > u16::MAX as usize {
                self.error("Too many elements in list.");
            }
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list declaration.");
        self.emit_op(OpCode::MakeList);
        self.emit_u16(length.min(u16::MAX as usize) as u16);
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after subscript.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.parse_precedence(Precedence::Assignment);
            self.emit_op(OpCode::SetElement);
        } else {
            self.emit_op(OpCode::GetElement);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let token = self.previous;
        self.named_variable(token, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let compiler = self.compilers.len() - 1;
        if let Some(slot) = self.resolve_local(compiler, name.lexeme) {
            self.slot_access(OpCode::GetLocal, OpCode::SetLocal, slot, can_assign);
        } else if let Some(index) = self.resolve_upvalue(compiler, name.lexeme) {
            self.slot_access(OpCode::GetUpvalue, OpCode::SetUpvalue, index, can_assign);
        } else {
            let arg = self.identifier_constant(name.lexeme);
            if can_assign && self.match_token(TokenKind::Equal) {
                self.parse_precedence(Precedence::Assignment);
                self.emit_global_access(OpCode::SetGlobal, OpCode::SetGlobalLong, arg);
            } else {
                self.emit_global_access(OpCode::GetGlobal, OpCode::GetGlobalLong, arg);
            }
        }
    }

    fn slot_access(&mut self, get: OpCode, set: OpCode, slot: u16, can_assign: bool) {
        if can_assign && self.match_token(TokenKind::Equal) {
            self.parse_precedence(Precedence::Assignment);
            self.emit_op(set);
        } else {
            self.emit_op(get);
        }
        self.emit_u16(slot);
    }

    fn synthetic(&self, name: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Identifier,
            lexeme: name,
            line: self.current.line,
        }
    }

    fn this_expression(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expression(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);
        let this_token = self.synthetic("this");
        self.named_variable(this_token, false);
        let super_token = self.synthetic("super");
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_op(OpCode::InvokeSuper);
            self.emit_u16(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(super_token, false);
            self.emit_op(OpCode::GetSuper);
            self.emit_u16(name);
        }
    }

    // -----------------------------------------------------------------------
    // Functions and classes
    // -----------------------------------------------------------------------

    fn function(&mut self, kind: FunctionKind) {
        self.begin_function(kind);
        self.begin_scope();
        if kind == FunctionKind::Getter {
            // getters have no parameter list; negative arity marks them
            self.state_mut().function.arity = -1;
        } else {
            self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
            if !self.check(TokenKind::RightParen) {
                loop {
                    self.state_mut().function.arity += 1;
                    if self.state().function.arity > 255 {
                        self.error_at_current("Can't have more than 255 parameters.");
                    }
                    let constant = self.parse_variable("Expect parameter name.");
                    self.define_variable(constant);
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        }
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let FunctionState {
            function, upvalues, ..
        } = self.end_function();
        // the finished function must reach the constant pool before
        // anything else allocates, or a collection could reclaim it
        let function_ref = self.vm.alloc_function(function, &self.compilers);
        let constant = self.current_chunk().add_constant(Value::Obj(function_ref));
        if constant > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
        }
        self.emit_op(OpCode::Closure);
        self.emit_u16(constant as u16);
        for upvalue in &upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_u16(upvalue.index);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        let mut kind = FunctionKind::Method;
        if !self.check(TokenKind::LeftParen) {
            kind = FunctionKind::Getter;
        }
        if self.previous.lexeme == "init" {
            kind = FunctionKind::Initializer;
        }
        self.function(kind);
        self.emit_op(OpCode::Method);
        self.emit_u16(constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name = self.previous;
        let name_constant = self.identifier_constant(name.lexeme);
        self.declare_variable();
        self.emit_op(OpCode::Class);
        self.emit_u16(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // the superclass stays on the stack as a scoped local named
            // `super`, which method bodies capture
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);
        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn fun_declaration(&mut self) {
        if self.check(TokenKind::Identifier) {
            let global = self.parse_variable("Expect function name.");
            // initialized up front so the body can recurse
            self.mark_initialized();
            self.function(FunctionKind::Function);
            self.define_variable(global);
        } else {
            self.function(FunctionKind::Expression);
            self.emit_op(OpCode::Pop);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.parse_precedence(Precedence::Assignment);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    /// Save the surrounding loop record and install this loop's.
    fn enter_loop(&mut self) -> (i32, i32, i32) {
        let state = self.state_mut();
        let saved = (state.loop_start, state.loop_scope, state.exit_jump);
        state.loop_scope = state.scope_depth;
        saved
    }

    fn leave_loop(&mut self, saved: (i32, i32, i32)) {
        let state = self.state_mut();
        state.loop_start = saved.0;
        state.loop_scope = saved.1;
        state.exit_jump = saved.2;
    }

    fn while_statement(&mut self) {
        let saved = self.enter_loop();
        let loop_start = self.current_chunk().code.len();
        self.state_mut().loop_start = loop_start as i32;

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.state_mut().exit_jump = exit_jump as i32;
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.leave_loop(saved);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let saved = self.enter_loop();
        let loop_start = self.current_chunk().code.len();
        self.state_mut().loop_start = loop_start as i32;

        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.state_mut().exit_jump = exit_jump as i32;
            self.emit_op(OpCode::Pop);
        } else {
            // no condition; `break` still needs a falsey value to target
            self.emit_op(OpCode::True);
            let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.state_mut().exit_jump = exit_jump as i32;
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // the increment runs after the body: jump over it now, loop
            // back to it from the body's end
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            let start = self.state().loop_start as usize;
            self.emit_loop(start);
            self.state_mut().loop_start = increment_start as i32;
            self.patch_jump(body_jump);
        }

        self.statement();
        let start = self.state().loop_start as usize;
        self.emit_loop(start);

        let exit_jump = self.state().exit_jump as usize;
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.leave_loop(saved);
        self.end_scope();
    }

    /// Emit a `Pop` for every local declared inside the innermost loop.
    fn pop_loop_locals(&mut self) {
        let count = {
            let state = self.state();
            state
                .locals
                .iter()
                .rev()
                .take_while(|local| local.depth > state.loop_scope)
                .count()
        };
        for _ in 0..count {
            self.emit_op(OpCode::Pop);
        }
    }

    fn continue_statement(&mut self) {
        if self.state().loop_start == -1 {
            self.error("Can't use 'continue' outside of a loop.");
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        self.pop_loop_locals();
        let start = self.state().loop_start;
        if start >= 0 {
            self.emit_loop(start as usize);
        }
    }

    fn break_statement(&mut self) {
        if self.state().exit_jump == -1 {
            self.error("Can't use 'break' outside of a loop.");
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        self.pop_loop_locals();
        // loop back to the exit's JumpIfFalse with a falsey value on top
        self.emit_op(OpCode::False);
        let exit_jump = self.state().exit_jump;
        if exit_jump >= 1 {
            self.emit_loop((exit_jump - 1) as usize);
        }
    }

    fn return_statement(&mut self) {
        let kind = self.state().kind;
        if kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else if kind == FunctionKind::Initializer {
            self.error("Can't return a value from an initializer.");
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}
