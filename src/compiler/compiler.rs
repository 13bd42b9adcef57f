use super::ast::{AssignTarget, AstNode, FunDecl, Literal};
use super::token::{Token, TokenKind};
use super::{CompileError, Result, MAX_CONSTANTS, MAX_LOCALS, MAX_UPVALUES};
use crate::debug::{self, LOG_COMPILED_CODE};
use crate::memory::{Function, Gc, Object, GC};
use crate::vm::{instruction::OpCode, value::Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local {
    name: Token,
    depth: i32,
    is_captured: bool,
}

#[derive(Debug)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Tracks whether the innermost class being compiled has a superclass, so
/// `this` and `super` can be validated.
struct ClassState {
    has_superclass: bool,
}

/// Per-function compilation state. A nested function declaration pushes a
/// fresh state; upvalue resolution walks the stack of states outward.
struct FunctionState {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
}

impl FunctionState {
    fn script() -> Self {
        Self {
            function: Function::script(),
            kind: FunctionKind::Script,
            locals: vec![Local {
                name: Token::new_empty(),
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    fn new(name: Gc<Object>, kind: FunctionKind, arity: u8) -> Self {
        // Slot 0 holds the callee; methods alias it as `this`.
        let reserved = match kind {
            FunctionKind::Method | FunctionKind::Initializer => {
                Token::new(TokenKind::This, "this".to_owned(), 0)
            }
            _ => Token::new_empty(),
        };
        Self {
            function: Function::new(name, arity),
            kind,
            locals: vec![Local {
                name: reserved,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    fn emit(&mut self, op: OpCode, line: u64) {
        self.function.chunk.write(op, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u64) {
        self.function.chunk.write_byte(byte, line);
    }

    fn emit_bytes(&mut self, op: OpCode, index: u8, line: u64) {
        self.function.chunk.write_index(op, index, line);
    }

    /// A function body that falls off the end returns `nil`; an initializer
    /// returns the receiver instead.
    fn emit_return(&mut self, line: u64) {
        if self.kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal, 0, line);
        } else {
            self.emit(OpCode::Nil, line);
        }
        self.emit(OpCode::Return, line);
    }

    /// Emits a jump with a placeholder offset and returns the offset's
    /// position for patching.
    fn emit_jump(&mut self, op: OpCode, line: u64) -> usize {
        self.emit(op, line);
        self.emit_byte(0xff, line);
        self.emit_byte(0xff, line);
        self.function.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize, token: &Token) -> Result<()> {
        // The jump lands after the two offset bytes.
        let jump = self.function.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err(CompileError::JumpLimitExceeded(token.clone()));
        }
        self.function.chunk.code[offset] = (jump >> 8) as u8;
        self.function.chunk.code[offset + 1] = (jump & 0xff) as u8;
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize, token: &Token) -> Result<()> {
        self.emit(OpCode::Loop, token.line);

        // The two offset bytes are part of the distance jumped back over.
        let offset = self.function.chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(CompileError::LoopLimitExceeded(token.clone()));
        }
        self.emit_byte((offset >> 8) as u8, token.line);
        self.emit_byte((offset & 0xff) as u8, token.line);
        Ok(())
    }

    fn resolve_local(&self, name: &Token) -> Option<u8> {
        self.locals
            .iter()
            .rposition(|local| local.name.data == name.data)
            .map(|slot| slot as u8)
    }

    fn add_local(&mut self, name: Token) -> Result<()> {
        for local in self.locals.iter().rev() {
            if local.depth < self.scope_depth {
                break;
            }
            if local.name.data == name.data {
                return Err(CompileError::RedefinedVariableInSameScope(name));
            }
        }

        if self.locals.len() == MAX_LOCALS {
            return Err(CompileError::LocalVariableLimitExceeded(name));
        }

        self.locals.push(Local {
            name,
            depth: self.scope_depth,
            is_captured: false,
        });
        Ok(())
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool, token: &Token) -> Result<u8> {
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }

        if self.upvalues.len() == MAX_UPVALUES {
            return Err(CompileError::UpvalueLimitExceeded(token.clone()));
        }

        self.upvalues.push(UpvalueRef { index, is_local });
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Lowers a sequence of declarations to a function whose chunk realizes the
/// script's semantics. Compilation aborts on the first error.
pub struct Compiler<'gc> {
    gc: &'gc mut GC,
    states: Vec<FunctionState>,
    classes: Vec<ClassState>,
}

impl<'gc> Compiler<'gc> {
    pub fn new(gc: &'gc mut GC) -> Self {
        Self {
            gc,
            states: Vec::new(),
            classes: Vec::new(),
        }
    }

    pub fn compile(mut self, declarations: &[AstNode]) -> Result<Function> {
        self.states.push(FunctionState::script());

        for node in declarations {
            self.node(node)?;
        }

        let mut state = self.states.pop().expect("script state was just pushed");
        state.emit_return(0);

        if LOG_COMPILED_CODE {
            debug::disassemble_chunk(&state.function.chunk, state.function.name());
        }

        Ok(state.function)
    }

    fn state(&mut self) -> &mut FunctionState {
        self.states.last_mut().expect("a function is being compiled")
    }

    fn state_ref(&self) -> &FunctionState {
        self.states.last().expect("a function is being compiled")
    }

    fn node(&mut self, node: &AstNode) -> Result<()> {
        match node {
            AstNode::Binary { op, left, right } => {
                self.node(left)?;
                match op.kind {
                    TokenKind::And => return self.and_expression(op, right),
                    TokenKind::Or => return self.or_expression(op, right),
                    _ => {}
                }
                self.node(right)?;

                let line = op.line;
                let state = self.state();
                match op.kind {
                    TokenKind::Plus => state.emit(OpCode::Add, line),
                    TokenKind::Minus => state.emit(OpCode::Subtract, line),
                    TokenKind::Star => state.emit(OpCode::Multiply, line),
                    TokenKind::Slash => state.emit(OpCode::Divide, line),
                    TokenKind::EqualEqual => state.emit(OpCode::Equal, line),
                    TokenKind::BangEqual => {
                        state.emit(OpCode::Equal, line);
                        state.emit(OpCode::Not, line);
                    }
                    TokenKind::Greater => state.emit(OpCode::Greater, line),
                    TokenKind::Less => state.emit(OpCode::Less, line),
                    TokenKind::GreaterEqual => {
                        state.emit(OpCode::Less, line);
                        state.emit(OpCode::Not, line);
                    }
                    TokenKind::LessEqual => {
                        state.emit(OpCode::Greater, line);
                        state.emit(OpCode::Not, line);
                    }
                    _ => unreachable!("parser only builds binary nodes for binary operators"),
                }
            }
            AstNode::Unary { op, right } => {
                self.node(right)?;
                match op.kind {
                    TokenKind::Minus => self.state().emit(OpCode::Negate, op.line),
                    TokenKind::Bang => self.state().emit(OpCode::Not, op.line),
                    _ => unreachable!("parser only builds unary nodes for unary operators"),
                }
            }
            AstNode::Grouping { expr } => self.node(expr)?,
            AstNode::Literal { token, value } => match value {
                Literal::Number(number) => {
                    let index = self.make_constant(Value::Number(*number), token)?;
                    self.state().emit_bytes(OpCode::Constant, index, token.line);
                }
                Literal::Str(string) => {
                    let string = self.gc.track_string(string.clone());
                    let index = self.make_constant(string.into(), token)?;
                    self.state().emit_bytes(OpCode::Constant, index, token.line);
                }
                Literal::Bool(true) => self.state().emit(OpCode::True, token.line),
                Literal::Bool(false) => self.state().emit(OpCode::False, token.line),
                Literal::Nil => self.state().emit(OpCode::Nil, token.line),
            },
            AstNode::Variable { name } => self.named_variable(name)?,
            AstNode::Assign { target, value } => match target {
                AssignTarget::Variable { name } => {
                    self.node(value)?;
                    let (index, set_op, _) = self.resolve_variable(name)?;
                    self.state().emit_bytes(set_op, index, name.line);
                }
                AssignTarget::Property { object, name } => {
                    self.node(object)?;
                    self.node(value)?;
                    let index = self.identifier_constant(name)?;
                    self.state().emit_bytes(OpCode::SetProperty, index, name.line);
                }
            },
            AstNode::Call {
                callee,
                paren,
                args,
            } => self.call(callee, paren, args)?,
            AstNode::Property { object, name } => {
                self.node(object)?;
                let index = self.identifier_constant(name)?;
                self.state().emit_bytes(OpCode::GetProperty, index, name.line);
            }
            AstNode::Super { keyword, method } => {
                self.check_super(keyword)?;
                let index = self.identifier_constant(method)?;
                self.named_variable(&Token::new(
                    TokenKind::This,
                    "this".to_owned(),
                    keyword.line,
                ))?;
                self.named_variable(&Token::new(
                    TokenKind::Super,
                    "super".to_owned(),
                    keyword.line,
                ))?;
                self.state().emit_bytes(OpCode::GetSuper, index, keyword.line);
            }
            AstNode::ExprStmt { semicolon, expr } => {
                self.node(expr)?;
                self.state().emit(OpCode::Pop, semicolon.line);
            }
            AstNode::PrintStmt { keyword, expr } => {
                // Lowered to a call of the `print` native.
                let index = self.identifier_constant(keyword)?;
                self.state().emit_bytes(OpCode::GetGlobal, index, keyword.line);
                self.node(expr)?;
                self.state().emit_bytes(OpCode::Call, 1, keyword.line);
                self.state().emit(OpCode::Pop, keyword.line);
            }
            AstNode::Block {
                end_brace,
                statements,
            } => {
                self.begin_scope();
                for statement in statements {
                    self.node(statement)?;
                }
                self.end_scope(end_brace);
            }
            AstNode::If {
                keyword,
                else_keyword,
                condition,
                then_branch,
                else_branch,
            } => {
                self.node(condition)?;

                let then_jump = self.state().emit_jump(OpCode::JumpIfFalse, keyword.line);
                self.state().emit(OpCode::Pop, keyword.line);
                self.node(then_branch)?;

                let else_line = else_keyword.as_ref().map_or(keyword.line, |tok| tok.line);
                let else_jump = self.state().emit_jump(OpCode::Jump, else_line);

                self.state().patch_jump(then_jump, keyword)?;
                self.state().emit(OpCode::Pop, keyword.line);

                if let Some(else_branch) = else_branch {
                    self.node(else_branch)?;
                }
                self.state()
                    .patch_jump(else_jump, else_keyword.as_ref().unwrap_or(keyword))?;
            }
            AstNode::While {
                keyword,
                condition,
                body,
            } => {
                let loop_start = self.state_ref().function.chunk.code.len();
                self.node(condition)?;

                let exit_jump = self.state().emit_jump(OpCode::JumpIfFalse, keyword.line);
                self.state().emit(OpCode::Pop, keyword.line);

                self.node(body)?;
                self.state().emit_loop(loop_start, keyword)?;

                self.state().patch_jump(exit_jump, keyword)?;
                self.state().emit(OpCode::Pop, keyword.line);
            }
            AstNode::Return { keyword, value } => {
                if self.state_ref().kind == FunctionKind::Script {
                    return Err(CompileError::ReturnOutsideFunction(keyword.clone()));
                }
                match value {
                    Some(value) => {
                        if self.state_ref().kind == FunctionKind::Initializer {
                            return Err(CompileError::ReturnInsideInitializer(keyword.clone()));
                        }
                        self.node(value)?;
                        self.state().emit(OpCode::Return, keyword.line);
                    }
                    None => self.state().emit_return(keyword.line),
                }
            }
            AstNode::VarDecl { name, initializer } => {
                match initializer {
                    Some(initializer) => self.node(initializer)?,
                    None => self.state().emit(OpCode::Nil, name.line),
                }
                self.define_variable(name)?;
            }
            AstNode::Fun(decl) => {
                self.function(decl, FunctionKind::Function)?;
                self.define_variable(&decl.name)?;
            }
            AstNode::ClassDecl {
                name,
                superclass,
                methods,
                end_brace,
            } => {
                self.classes.push(ClassState {
                    has_superclass: false,
                });
                let result = self.class_declaration(name, superclass, methods, end_brace);
                self.classes.pop();
                result?;
            }
        }
        Ok(())
    }

    fn class_declaration(
        &mut self,
        name: &Token,
        superclass: &Option<Token>,
        methods: &[FunDecl],
        end_brace: &Token,
    ) -> Result<()> {
        let index = self.identifier_constant(name)?;
        self.state().emit_bytes(OpCode::Class, index, name.line);
        self.define_variable(name)?;

        if let Some(superclass) = superclass {
            if superclass.data == name.data {
                return Err(CompileError::CyclicInheritance(name.clone()));
            }

            // The superclass survives this scope as a hidden local named
            // `super`, captured as an upvalue by the methods that need it.
            self.begin_scope();
            let super_token = Token::new(TokenKind::Super, "super".to_owned(), name.line);
            self.define_variable(&super_token)?;

            self.named_variable(superclass)?;
            self.named_variable(name)?;
            self.state().emit(OpCode::Inherit, name.line);

            self.classes
                .last_mut()
                .expect("a class is being compiled")
                .has_superclass = true;
        }

        // Keep the class on the stack while its methods are bound.
        self.named_variable(name)?;
        for method in methods {
            let kind = if method.name.data == "init" {
                FunctionKind::Initializer
            } else {
                FunctionKind::Method
            };
            self.function(method, kind)?;
            let index = self.identifier_constant(&method.name)?;
            self.state()
                .emit_bytes(OpCode::Method, index, method.name.line);
        }
        self.state().emit(OpCode::Pop, end_brace.line);

        if self
            .classes
            .last()
            .expect("a class is being compiled")
            .has_superclass
        {
            self.end_scope(end_brace);
        }

        Ok(())
    }

    /// Compiles a nested function and emits the `Closure` instruction plus
    /// its upvalue operand pairs into the enclosing function.
    fn function(&mut self, decl: &FunDecl, kind: FunctionKind) -> Result<()> {
        let name = self.gc.track_string(decl.name.data.clone());
        self.states
            .push(FunctionState::new(name, kind, decl.params.len() as u8));
        self.begin_scope();

        for param in &decl.params {
            self.define_variable(param)?;
        }
        for node in &decl.body {
            self.node(node)?;
        }

        let line = decl.name.line;
        self.state().emit_return(line);

        let state = self.states.pop().expect("function state was just pushed");
        if LOG_COMPILED_CODE {
            debug::disassemble_chunk(&state.function.chunk, state.function.name());
        }

        let function = self.gc.track_function(state.function);
        let index = self.make_constant(function.into(), &decl.name)?;

        let enclosing = self.state();
        enclosing.emit_bytes(OpCode::Closure, index, line);
        for upvalue in &state.upvalues {
            enclosing.emit_byte(u8::from(upvalue.is_local), line);
            enclosing.emit_byte(upvalue.index, line);
        }

        Ok(())
    }

    fn call(&mut self, callee: &AstNode, paren: &Token, args: &[AstNode]) -> Result<()> {
        match callee {
            // Calling a property directly fuses the lookup and the call so
            // no bound method needs to be allocated.
            AstNode::Property { object, name } => {
                self.node(object)?;
                for arg in args {
                    self.node(arg)?;
                }
                let index = self.identifier_constant(name)?;
                self.state().emit_bytes(OpCode::Invoke, index, paren.line);
                self.state().emit_byte(args.len() as u8, paren.line);
            }
            AstNode::Super { keyword, method } => {
                self.check_super(keyword)?;
                self.named_variable(&Token::new(
                    TokenKind::This,
                    "this".to_owned(),
                    keyword.line,
                ))?;
                for arg in args {
                    self.node(arg)?;
                }
                let index = self.identifier_constant(method)?;
                self.named_variable(&Token::new(
                    TokenKind::Super,
                    "super".to_owned(),
                    keyword.line,
                ))?;
                self.state()
                    .emit_bytes(OpCode::SuperInvoke, index, method.line);
                self.state().emit_byte(args.len() as u8, paren.line);
            }
            _ => {
                self.node(callee)?;
                for arg in args {
                    self.node(arg)?;
                }
                self.state()
                    .emit_bytes(OpCode::Call, args.len() as u8, paren.line);
            }
        }
        Ok(())
    }

    fn and_expression(&mut self, op: &Token, right: &AstNode) -> Result<()> {
        let end_jump = self.state().emit_jump(OpCode::JumpIfFalse, op.line);
        self.state().emit(OpCode::Pop, op.line);
        self.node(right)?;
        self.state().patch_jump(end_jump, op)
    }

    fn or_expression(&mut self, op: &Token, right: &AstNode) -> Result<()> {
        let end_jump = self.state().emit_jump(OpCode::JumpIfTrue, op.line);
        self.state().emit(OpCode::Pop, op.line);
        self.node(right)?;
        self.state().patch_jump(end_jump, op)
    }

    fn named_variable(&mut self, name: &Token) -> Result<()> {
        let (index, _, get_op) = self.resolve_variable(name)?;
        self.state().emit_bytes(get_op, index, name.line);
        Ok(())
    }

    /// Resolves a name against locals, then enclosing functions' locals as
    /// upvalues, and finally as a global.
    fn resolve_variable(&mut self, name: &Token) -> Result<(u8, OpCode, OpCode)> {
        if name.kind == TokenKind::This && self.classes.is_empty() {
            return Err(CompileError::ThisOutsideClass(name.clone()));
        }

        if let Some(slot) = self.state_ref().resolve_local(name) {
            return Ok((slot, OpCode::SetLocal, OpCode::GetLocal));
        }

        if let Some(index) = self.resolve_upvalue(self.states.len() - 1, name)? {
            return Ok((index, OpCode::SetUpvalue, OpCode::GetUpvalue));
        }

        let index = self.identifier_constant(name)?;
        Ok((index, OpCode::SetGlobal, OpCode::GetGlobal))
    }

    /// Looks for `name` in the locals of the function enclosing `state_index`,
    /// marking the local as captured, or recurses outward and threads the
    /// capture through every function in between.
    fn resolve_upvalue(&mut self, state_index: usize, name: &Token) -> Result<Option<u8>> {
        if state_index == 0 {
            return Ok(None);
        }
        let parent = state_index - 1;

        if let Some(local) = self.states[parent].resolve_local(name) {
            self.states[parent].locals[local as usize].is_captured = true;
            let index = self.states[state_index].add_upvalue(local, true, name)?;
            return Ok(Some(index));
        }

        if let Some(upvalue) = self.resolve_upvalue(parent, name)? {
            let index = self.states[state_index].add_upvalue(upvalue, false, name)?;
            return Ok(Some(index));
        }

        Ok(None)
    }

    fn define_variable(&mut self, name: &Token) -> Result<()> {
        if self.state_ref().scope_depth == 0 {
            let index = self.identifier_constant(name)?;
            self.state()
                .emit_bytes(OpCode::DefineGlobal, index, name.line);
            Ok(())
        } else {
            self.state().add_local(name.clone())
        }
    }

    fn identifier_constant(&mut self, name: &Token) -> Result<u8> {
        let string = self.gc.track_string(name.data.clone());
        self.make_constant(string.into(), name)
    }

    fn make_constant(&mut self, value: Value, token: &Token) -> Result<u8> {
        let index = self.state().function.chunk.add_constant(value);
        if index >= MAX_CONSTANTS {
            return Err(CompileError::ChunkConstantLimitExceeded(token.clone()));
        }
        Ok(index as u8)
    }

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    /// Discards the scope's locals, closing over the captured ones.
    fn end_scope(&mut self, token: &Token) {
        let state = self.state();
        state.scope_depth -= 1;

        while state
            .locals
            .last()
            .map_or(false, |local| local.depth > state.scope_depth)
        {
            let captured = state
                .locals
                .pop()
                .map_or(false, |local| local.is_captured);
            let op = if captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            state.emit(op, token.line);
        }
    }

    fn check_super(&self, keyword: &Token) -> Result<()> {
        match self.classes.last() {
            None => Err(CompileError::SuperUsedOutsideClass(keyword.clone())),
            Some(class) if !class.has_superclass => Err(
                CompileError::SuperUsedInClassWithNoSuperClass(keyword.clone()),
            ),
            Some(_) => Ok(()),
        }
    }
}
