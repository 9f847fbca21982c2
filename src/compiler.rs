// File: src/compiler.rs
//
// Bytecode compiler for Ardan. Walks the parsed AST and lowers it into
// register instructions, resolving lexical scopes, upvalue captures, class
// property visibility, loop control flow and exception regions. Nested
// functions compile through a stack of function states linked by index.

use crate::ast::*;
use crate::bytecode::{Instruction, Op};
use crate::errors::ArdanError;
use crate::lexer::tokenize;
use crate::module::{Chunk, Module};
use crate::parser::Parser;
use crate::runtime::value::{FunctionObject, Value};
use ahash::AHashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

type CResult<T> = Result<T, ArdanError>;

const REGISTER_FILE: usize = 256;

/// One local binding in the function being compiled
#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: u32,
    is_captured: bool,
    slot: u8,
    kind: BindingKind,
}

/// A module-level binding declared at the top level
#[derive(Debug, Clone)]
struct Global {
    name: String,
    kind: BindingKind,
}

/// Upvalue descriptor collected while compiling a nested function
#[derive(Debug, Clone)]
struct UpvalueMeta {
    is_local: bool,
    index: u8,
    kind: BindingKind,
}

/// Visibility and binding data of one class member, used to rewrite bare
/// identifiers inside method bodies to `this.<name>` / `super.<name>`
#[derive(Debug, Clone, Copy)]
struct PropertyMeta {
    visibility: Visibility,
    kind: BindingKind,
    #[allow(dead_code)]
    is_static: bool,
}

#[derive(Debug, Clone, Default)]
struct ClassInfo {
    #[allow(dead_code)]
    name: String,
    super_class_name: Option<String>,
    fields: AHashMap<String, PropertyMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakableKind {
    Loop,
    Switch,
}

/// Pending jumps of one enclosing loop or switch
struct Breakable {
    kind: BreakableKind,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

/// Per-function compilation state
struct FunctionState {
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueMeta>,
    scope_depth: u32,
    scratch: u8,
    breakables: Vec<Breakable>,
    is_async: bool,
}

impl FunctionState {
    fn new(name: &str, is_async: bool) -> Self {
        Self {
            chunk: Chunk::new(name),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            scratch: 0,
            breakables: Vec::new(),
            is_async,
        }
    }
}

pub struct Compiler<'m> {
    module: &'m mut Module,
    states: Vec<FunctionState>,
    globals: Vec<Global>,
    class_info: Option<ClassInfo>,
    classes: AHashMap<String, ClassInfo>,
    loaded_modules: Vec<PathBuf>,
}

/// Compile a program into `module`, returning the entry chunk index.
pub fn compile_program(module: &mut Module, program: &[Stmt]) -> CResult<u32> {
    Compiler::new(module).compile(program)
}

impl<'m> Compiler<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Self {
            module,
            states: Vec::new(),
            globals: Vec::new(),
            class_info: None,
            classes: AHashMap::new(),
            loaded_modules: Vec::new(),
        }
    }

    pub fn compile(mut self, program: &[Stmt]) -> CResult<u32> {
        self.states.push(FunctionState::new("<script>", false));

        for stmt in program {
            self.statement(stmt)?;
        }
        self.emit(Op::Halt, 0, 0, 0);

        let state = self.states.pop().expect("script state");
        let index = self.module.add_chunk(state.chunk);
        self.module.entry_chunk_index = index;
        Ok(index)
    }

    // ---- state & emission helpers ----

    fn state(&mut self) -> &mut FunctionState {
        self.states.last_mut().expect("active function state")
    }

    fn here(&mut self) -> usize {
        self.state().chunk.size()
    }

    fn emit(&mut self, op: Op, a: u8, b: u8, c: u8) -> usize {
        self.state().chunk.emit(Instruction::new(op, a, b, c))
    }

    fn const_index(&mut self, value: Value) -> CResult<u8> {
        let index = self.state().chunk.add_constant(value);
        if index >= REGISTER_FILE {
            return Err(ArdanError::compile_error(
                "Too many constants in one chunk".to_string(),
            ));
        }
        Ok(index as u8)
    }

    /// Allocate a scratch register above the live locals
    fn alloc(&mut self) -> CResult<u8> {
        let state = self.state();
        let floor = state.locals.len() as u8;
        if state.scratch < floor {
            state.scratch = floor;
        }
        let reg = state.scratch;
        if reg as usize >= REGISTER_FILE - 1 {
            return Err(ArdanError::compile_error(
                "Expression too complex: register file exhausted".to_string(),
            ));
        }
        state.scratch += 1;
        Ok(reg)
    }

    /// Reset the scratch allocator at a statement boundary
    fn reset_scratch(&mut self) {
        let floor = self.state().locals.len() as u8;
        self.state().scratch = floor;
    }

    fn load_const(&mut self, value: Value) -> CResult<u8> {
        let k = self.const_index(value)?;
        let reg = self.alloc()?;
        self.emit(Op::LoadConst, reg, k, 0);
        Ok(reg)
    }

    /// Emit a forward jump with a placeholder offset; returns its index
    fn emit_jump(&mut self, op: Op, cond_reg: u8) -> usize {
        match op {
            Op::JumpIfFalse => self.emit(op, cond_reg, 0, 0),
            _ => self.emit(op, 0, 0, 0),
        }
    }

    /// Point a previously emitted forward jump at the current position
    fn patch_jump(&mut self, at: usize) -> CResult<()> {
        let target = self.here();
        self.patch_jump_to(at, target)
    }

    fn patch_jump_to(&mut self, at: usize, target: usize) -> CResult<()> {
        let offset = target - (at + 1);
        if offset > u16::MAX as usize {
            return Err(ArdanError::compile_error("Jump distance too large".to_string()));
        }
        let [lo, hi] = (offset as u16).to_le_bytes();
        let instr = &mut self.states.last_mut().expect("state").chunk.code[at];
        match instr.op {
            Op::Jump | Op::Loop => {
                instr.a = lo;
                instr.b = hi;
            }
            Op::JumpIfFalse => {
                instr.b = lo;
                instr.c = hi;
            }
            _ => unreachable!("patching a non-jump instruction"),
        }
        Ok(())
    }

    /// Emit a backward jump to `loop_start`
    fn emit_loop(&mut self, loop_start: usize) -> CResult<()> {
        let offset = self.here() + 1 - loop_start;
        if offset > u16::MAX as usize {
            return Err(ArdanError::compile_error("Loop body too large".to_string()));
        }
        let [lo, hi] = (offset as u16).to_le_bytes();
        self.emit(Op::Loop, lo, hi, 0);
        Ok(())
    }

    // ---- scopes & bindings ----

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    /// Close captured locals of the departing scope and drop the rest
    fn end_scope(&mut self) {
        let depth = self.state().scope_depth;
        loop {
            let Some(local) = self.state().locals.last().cloned() else { break };
            if local.depth != depth {
                break;
            }
            if local.is_captured {
                self.emit(Op::CloseUpvalue, local.slot, 0, 0);
            }
            self.state().locals.pop();
        }
        self.state().scope_depth -= 1;
    }

    fn declare_local(&mut self, name: &str, kind: BindingKind, depth: u32) -> CResult<u8> {
        for local in self.state().locals.iter().rev() {
            if local.depth < depth {
                break;
            }
            if local.name == name {
                return Err(ArdanError::compile_error(format!(
                    "Variable '{}' already declared in this scope",
                    name
                )));
            }
        }
        let slot = self.state().locals.len();
        if slot >= REGISTER_FILE - 1 {
            return Err(ArdanError::compile_error("Too many locals in function".to_string()));
        }
        let slot = slot as u8;
        self.state().locals.push(Local {
            name: name.to_string(),
            depth,
            is_captured: false,
            slot,
            kind,
        });
        let live = self.state().locals.len() as u32;
        if live > self.state().chunk.max_locals {
            self.state().chunk.max_locals = live;
        }
        Ok(slot)
    }

    fn declare_global(&mut self, name: &str, kind: BindingKind) -> CResult<()> {
        if self.globals.iter().any(|global| global.name == name) {
            return Err(ArdanError::compile_error(format!(
                "Variable '{}' already declared in this scope",
                name
            )));
        }
        self.globals.push(Global { name: name.to_string(), kind });
        Ok(())
    }

    fn resolve_local_in(&self, state: usize, name: &str) -> Option<usize> {
        self.states[state]
            .locals
            .iter()
            .rposition(|local| local.name == name)
    }

    fn resolve_local(&self, name: &str) -> Option<usize> {
        self.resolve_local_in(self.states.len() - 1, name)
    }

    fn add_upvalue(&mut self, state: usize, is_local: bool, index: u8, kind: BindingKind) -> usize {
        let upvalues = &mut self.states[state].upvalues;
        if let Some(existing) = upvalues
            .iter()
            .position(|uv| uv.is_local == is_local && uv.index == index)
        {
            return existing;
        }
        upvalues.push(UpvalueMeta { is_local, index, kind });
        upvalues.len() - 1
    }

    /// Walk outward through enclosing function states, capturing the binding
    /// as an upvalue chain.
    fn resolve_upvalue(&mut self, state: usize, name: &str) -> Option<usize> {
        if state == 0 {
            return None;
        }
        let parent = state - 1;
        if let Some(local_index) = self.resolve_local_in(parent, name) {
            let local = &mut self.states[parent].locals[local_index];
            local.is_captured = true;
            let slot = local.slot;
            let kind = local.kind;
            return Some(self.add_upvalue(state, true, slot, kind));
        }
        if let Some(up_index) = self.resolve_upvalue(parent, name) {
            let kind = self.states[parent].upvalues[up_index].kind;
            return Some(self.add_upvalue(state, false, up_index as u8, kind));
        }
        None
    }

    fn lookup_global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().rev().find(|global| global.name == name)
    }

    /// Class field lookup for bare identifiers inside method bodies:
    /// level 1 = this class, level 2 = superclass.
    fn lookup_class_property(&self, name: &str) -> Option<(u8, PropertyMeta)> {
        let info = self.class_info.as_ref()?;
        if let Some(meta) = info.fields.get(name) {
            return Some((1, *meta));
        }
        let super_name = info.super_class_name.as_ref()?;
        let super_info = self.classes.get(super_name)?;
        super_info.fields.get(name).map(|meta| (2, *meta))
    }

    /// Load the named binding into a fresh register.
    /// Resolution order: locals, class fields, upvalues, globals.
    fn load_name(&mut self, name: &str) -> CResult<u8> {
        if let Some(index) = self.resolve_local(name) {
            let slot = self.state().locals[index].slot;
            let reg = self.alloc()?;
            self.emit(Op::LoadLocalVar, reg, slot, 0);
            return Ok(reg);
        }

        if let Some((level, _meta)) = self.lookup_class_property(name) {
            let k = self.const_index(Value::str(name))?;
            let reg = self.alloc()?;
            if level == 1 {
                self.emit(Op::LoadThisProperty, reg, k, 0);
            } else {
                self.emit(Op::GetParentObject, reg, 0, 0);
                self.emit(Op::GetProperty, reg, reg, k);
            }
            return Ok(reg);
        }

        let state = self.states.len() - 1;
        if let Some(up_index) = self.resolve_upvalue(state, name) {
            let reg = self.alloc()?;
            self.emit(Op::LoadUpvalue, reg, up_index as u8, 0);
            return Ok(reg);
        }

        let k = self.const_index(Value::str(name))?;
        let reg = self.alloc()?;
        self.emit(Op::LoadGlobalVar, reg, k, 0);
        Ok(reg)
    }

    /// Store register `src` into the named binding. Const targets are
    /// compile-time errors.
    fn store_name(&mut self, name: &str, src: u8) -> CResult<()> {
        if let Some(index) = self.resolve_local(name) {
            let local = &self.state().locals[index];
            let slot = local.slot;
            match local.kind {
                BindingKind::Const => {
                    return Err(ArdanError::compile_error(format!(
                        "Cannot assign to constant '{}'",
                        name
                    )))
                }
                BindingKind::Var => {
                    self.emit(Op::StoreLocalVar, slot, src, 0);
                }
                BindingKind::Let => {
                    self.emit(Op::StoreLocalLet, slot, src, 0);
                }
            }
            return Ok(());
        }

        if let Some((level, meta)) = self.lookup_class_property(name) {
            if meta.kind == BindingKind::Const {
                return Err(ArdanError::compile_error(format!(
                    "Cannot assign to constant field '{}'",
                    name
                )));
            }
            let k = self.const_index(Value::str(name))?;
            if level == 1 {
                self.emit(Op::StoreThisProperty, k, src, 0);
            } else {
                let parent = self.alloc()?;
                self.emit(Op::GetParentObject, parent, 0, 0);
                self.emit(Op::SetProperty, parent, k, src);
            }
            return Ok(());
        }

        let state = self.states.len() - 1;
        if let Some(up_index) = self.resolve_upvalue(state, name) {
            let op = match self.state().upvalues[up_index].kind {
                BindingKind::Var => Op::StoreUpvalueVar,
                BindingKind::Let => Op::StoreUpvalueLet,
                BindingKind::Const => Op::StoreUpvalueConst,
            };
            self.emit(op, up_index as u8, src, 0);
            return Ok(());
        }

        if let Some(global) = self.lookup_global(name) {
            if global.kind == BindingKind::Const {
                return Err(ArdanError::compile_error(format!(
                    "Cannot assign to constant '{}'",
                    name
                )));
            }
            let op = match global.kind {
                BindingKind::Var => Op::StoreGlobalVar,
                _ => Op::StoreGlobalLet,
            };
            let k = self.const_index(Value::str(name))?;
            self.emit(op, k, src, 0);
            return Ok(());
        }

        // Unseen name: resolved (or created) at runtime
        let k = self.const_index(Value::str(name))?;
        self.emit(Op::StoreGlobalVar, k, src, 0);
        Ok(())
    }

    // ---- statements ----

    fn statement(&mut self, stmt: &Stmt) -> CResult<()> {
        self.reset_scratch();
        match stmt {
            Stmt::Empty => Ok(()),
            Stmt::Expression(expr) => {
                self.expression(expr)?;
                Ok(())
            }
            Stmt::Block(body) => {
                self.begin_scope();
                for stmt in body {
                    self.statement(stmt)?;
                }
                self.end_scope();
                Ok(())
            }
            Stmt::Variable { kind, declarations } => self.variable_statement(*kind, declarations),
            Stmt::If { test, consequent, alternate } => {
                let cond = self.expression(test)?;
                let else_jump = self.emit_jump(Op::JumpIfFalse, cond);
                self.statement(consequent)?;
                let end_jump = self.emit_jump(Op::Jump, 0);
                self.patch_jump(else_jump)?;
                if let Some(alternate) = alternate {
                    self.statement(alternate)?;
                }
                self.patch_jump(end_jump)
            }
            Stmt::While { test, body } => self.while_statement(test, body),
            Stmt::DoWhile { body, test } => self.do_while_statement(body, test),
            Stmt::For { init, test, update, body } => {
                self.for_statement(init.as_deref(), test.as_ref(), update.as_ref(), body)
            }
            Stmt::ForIn { binding, object, body } => {
                self.for_in_statement(binding, object, body, true)
            }
            Stmt::ForOf { binding, iterable, body } => {
                self.for_in_statement(binding, iterable, body, false)
            }
            Stmt::Return(value) => {
                let reg = match value {
                    Some(expr) => self.expression(expr)?,
                    None => self.load_const(Value::Undefined)?,
                };
                self.emit(Op::Return, reg, 0, 0);
                Ok(())
            }
            Stmt::Break => {
                let jump = self.emit_jump(Op::Jump, 0);
                match self.state().breakables.last_mut() {
                    Some(breakable) => {
                        breakable.breaks.push(jump);
                        Ok(())
                    }
                    None => Err(ArdanError::compile_error(
                        "'break' outside of a loop or switch".to_string(),
                    )),
                }
            }
            Stmt::Continue => {
                let jump = self.emit_jump(Op::Jump, 0);
                match self
                    .state()
                    .breakables
                    .iter_mut()
                    .rev()
                    .find(|breakable| breakable.kind == BreakableKind::Loop)
                {
                    Some(breakable) => {
                        breakable.continues.push(jump);
                        Ok(())
                    }
                    None => {
                        Err(ArdanError::compile_error("'continue' outside of a loop".to_string()))
                    }
                }
            }
            Stmt::Throw(expr) => {
                let reg = self.expression(expr)?;
                self.emit(Op::Throw, reg, 0, 0);
                Ok(())
            }
            Stmt::Function(func) => {
                let reg = self.function_value(func, false)?;
                let name = func.name.clone().expect("function declarations are named");
                self.bind_declaration(&name, reg)
            }
            Stmt::Class(decl) => self.class_declaration(decl),
            Stmt::Try { block, handler, finalizer } => {
                self.try_statement(block, handler.as_ref(), finalizer.as_deref())
            }
            Stmt::Switch { discriminant, cases } => self.switch_statement(discriminant, cases),
            Stmt::Import { path, source_file } => self.import_statement(path, source_file),
        }
    }

    fn variable_statement(
        &mut self,
        kind: BindingKind,
        declarations: &[VarDeclarator],
    ) -> CResult<()> {
        for decl in declarations {
            if kind == BindingKind::Const && decl.init.is_none() {
                return Err(ArdanError::compile_error(format!(
                    "Const variable '{}' must be initialized",
                    decl.name
                )));
            }
            let value_reg = match &decl.init {
                Some(init) => self.expression(init)?,
                None => self.load_const(Value::Undefined)?,
            };
            self.bind_new_variable(&decl.name, kind, value_reg)?;
            self.reset_scratch();
        }
        Ok(())
    }

    /// Create a binding for a declaration: globals at top level, locals in
    /// nested scopes. `var` hoists to the enclosing function scope (its slot
    /// was pre-declared by hoist_var_declarations).
    fn bind_new_variable(&mut self, name: &str, kind: BindingKind, value_reg: u8) -> CResult<()> {
        let in_function = self.states.len() > 1;
        let depth = self.state().scope_depth;

        if !in_function {
            // Top-level code: `var` is a global everywhere; let/const become
            // globals only at depth zero.
            if depth == 0 || kind == BindingKind::Var {
                if depth == 0 {
                    self.declare_global(name, kind)?;
                }
                let op = match kind {
                    BindingKind::Var => Op::CreateGlobalVar,
                    BindingKind::Let => Op::CreateGlobalLet,
                    BindingKind::Const => Op::CreateGlobalConst,
                };
                let k = self.const_index(Value::str(name))?;
                self.emit(op, k, value_reg, 0);
                return Ok(());
            }
        }

        if in_function && kind == BindingKind::Var {
            // The slot already exists at function depth; this is its
            // initialising store.
            let index = self.resolve_local(name).ok_or_else(|| {
                ArdanError::compile_error(format!("Missing hoisted slot for '{}'", name))
            })?;
            let slot = self.state().locals[index].slot;
            self.emit(Op::CreateLocalVar, slot, value_reg, 0);
            return Ok(());
        }

        let slot = self.declare_local(name, kind, depth)?;
        let op = match kind {
            BindingKind::Let => Op::CreateLocalLet,
            _ => Op::CreateLocalConst,
        };
        self.emit(op, slot, value_reg, 0);
        Ok(())
    }

    /// Hoist every `var` declared anywhere in a function body (outside nested
    /// functions) into a slot at function depth. Duplicate declarations of
    /// the same name are rejected here.
    fn hoist_var_declarations(&mut self, body: &[Stmt]) -> CResult<()> {
        let mut names = Vec::new();
        collect_var_names(body, &mut names);
        for name in names {
            // Collides with a parameter or an earlier var of the same name
            if self.resolve_local(&name).is_some() {
                return Err(ArdanError::compile_error(format!(
                    "Variable '{}' already declared in this scope",
                    name
                )));
            }
            self.declare_local(&name, BindingKind::Var, 1)?;
        }
        Ok(())
    }

    /// Bind a function or class declaration name: var at top level, let in
    /// nested scopes.
    fn bind_declaration(&mut self, name: &str, value_reg: u8) -> CResult<()> {
        let kind = if self.states.len() == 1 && self.state().scope_depth == 0 {
            BindingKind::Var
        } else {
            BindingKind::Let
        };
        self.bind_new_variable(name, kind, value_reg)
    }

    fn begin_breakable(&mut self, kind: BreakableKind) {
        self.state().breakables.push(Breakable { kind, breaks: Vec::new(), continues: Vec::new() });
    }

    /// Patch pending continue jumps of the innermost loop to land here
    fn patch_continues(&mut self) -> CResult<()> {
        let continues = {
            let breakable = self.state().breakables.last_mut().expect("active loop");
            std::mem::take(&mut breakable.continues)
        };
        for jump in continues {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    /// Pop the innermost breakable, patching its break jumps to land here
    fn end_breakable(&mut self) -> CResult<()> {
        let breakable = self.state().breakables.pop().expect("active breakable");
        for jump in breakable.breaks {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn while_statement(&mut self, test: &Expr, body: &Stmt) -> CResult<()> {
        self.begin_breakable(BreakableKind::Loop);
        self.begin_scope();
        let loop_start = self.here();

        let cond = self.expression(test)?;
        let exit = self.emit_jump(Op::JumpIfFalse, cond);

        self.statement(body)?;
        self.patch_continues()?;
        self.emit_loop(loop_start)?;

        self.patch_jump(exit)?;
        self.end_scope();
        self.end_breakable()
    }

    fn do_while_statement(&mut self, body: &Stmt, test: &Expr) -> CResult<()> {
        self.begin_breakable(BreakableKind::Loop);
        self.begin_scope();
        let loop_start = self.here();

        self.statement(body)?;
        self.patch_continues()?;

        self.reset_scratch();
        let cond = self.expression(test)?;
        let exit = self.emit_jump(Op::JumpIfFalse, cond);
        self.emit_loop(loop_start)?;

        self.patch_jump(exit)?;
        self.end_scope();
        self.end_breakable()
    }

    fn for_statement(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
    ) -> CResult<()> {
        self.begin_scope();
        if let Some(init) = init {
            self.statement(init)?;
        }

        self.begin_breakable(BreakableKind::Loop);
        let loop_start = self.here();

        let exit = match test {
            Some(test) => {
                self.reset_scratch();
                let cond = self.expression(test)?;
                Some(self.emit_jump(Op::JumpIfFalse, cond))
            }
            None => None,
        };

        self.statement(body)?;

        // Continue lands between the body and the update expression
        self.patch_continues()?;
        if let Some(update) = update {
            self.reset_scratch();
            self.expression(update)?;
        }
        self.emit_loop(loop_start)?;

        if let Some(exit) = exit {
            self.patch_jump(exit)?;
        }
        self.end_breakable()?;
        self.end_scope();
        Ok(())
    }

    /// Shared lowering of for-in (keyed) and for-of (indexed) loops. The
    /// target is evaluated once; for-in materialises a key array via
    /// EnumKeys, for-of iterates the array-like directly.
    fn for_in_statement(
        &mut self,
        binding: &ForBinding,
        target: &Expr,
        body: &Stmt,
        keyed: bool,
    ) -> CResult<()> {
        self.begin_scope();

        // Loop variable
        let in_function = self.states.len() > 1;
        let (binding_name, binding_slot) = match binding {
            // A `var` loop binding in a function body was hoisted already
            ForBinding::Declaration(BindingKind::Var, name) if in_function => {
                let index = self.resolve_local(name).ok_or_else(|| {
                    ArdanError::compile_error(format!("Missing hoisted slot for '{}'", name))
                })?;
                (name.clone(), Some(self.state().locals[index].slot))
            }
            ForBinding::Declaration(BindingKind::Var, name) if !in_function => {
                // Top-level `var` binding is a global; iterate through it
                let undef = self.load_const(Value::Undefined)?;
                let k = self.const_index(Value::str(name))?;
                self.emit(Op::CreateGlobalVar, k, undef, 0);
                (name.clone(), None)
            }
            ForBinding::Declaration(kind, name) => {
                let undef = self.load_const(Value::Undefined)?;
                let depth = self.state().scope_depth;
                let slot = self.declare_local(name, *kind, depth)?;
                let op = match kind {
                    BindingKind::Let => Op::CreateLocalLet,
                    _ => Op::CreateLocalConst,
                };
                self.emit(op, slot, undef, 0);
                (name.clone(), Some(slot))
            }
            ForBinding::Identifier(name) => (name.clone(), None),
        };

        self.reset_scratch();
        let target_reg = self.expression(target)?;

        // Hidden iteration state
        let depth = self.state().scope_depth;
        let subject_slot = self.declare_local("(iter subject)", BindingKind::Let, depth)?;
        if keyed {
            let keys = self.alloc()?;
            self.emit(Op::EnumKeys, keys, target_reg, 0);
            self.emit(Op::CreateLocalLet, subject_slot, keys, 0);
        } else {
            self.emit(Op::CreateLocalLet, subject_slot, target_reg, 0);
        }

        let length_slot = self.declare_local("(iter length)", BindingKind::Let, depth)?;
        let subject = self.alloc()?;
        self.emit(Op::LoadLocalVar, subject, subject_slot, 0);
        let length = self.alloc()?;
        self.emit(Op::GetObjectLength, length, subject, 0);
        self.emit(Op::CreateLocalLet, length_slot, length, 0);

        let index_slot = self.declare_local("(iter index)", BindingKind::Let, depth)?;
        let zero = self.load_const(Value::Number(0.0))?;
        self.emit(Op::CreateLocalLet, index_slot, zero, 0);

        self.begin_breakable(BreakableKind::Loop);
        let loop_start = self.here();
        self.reset_scratch();

        // Bounds check: index < length
        let index = self.alloc()?;
        self.emit(Op::LoadLocalVar, index, index_slot, 0);
        let length = self.alloc()?;
        self.emit(Op::LoadLocalVar, length, length_slot, 0);
        let cond = self.alloc()?;
        self.emit(Op::LessThan, cond, index, length);
        let exit = self.emit_jump(Op::JumpIfFalse, cond);

        // Current element: subject[index]
        let subject = self.alloc()?;
        self.emit(Op::LoadLocalVar, subject, subject_slot, 0);
        let index = self.alloc()?;
        self.emit(Op::LoadLocalVar, index, index_slot, 0);
        let element = self.alloc()?;
        self.emit(Op::GetPropertyDynamic, element, subject, index);

        match binding_slot {
            // The loop binding may be const; write its slot directly so each
            // turn rebinds rather than assigns.
            Some(slot) => {
                self.emit(Op::StoreLocalLet, slot, element, 0);
            }
            None => self.store_name(&binding_name, element)?,
        }

        self.statement(body)?;
        self.patch_continues()?;

        // A captured let/const loop variable is closed each turn so every
        // iteration's closures observe their own binding; a var binding is
        // one shared slot.
        let fresh_binding = matches!(
            binding,
            ForBinding::Declaration(BindingKind::Let | BindingKind::Const, _)
        );
        if fresh_binding {
            if let Some(slot) = binding_slot {
                if let Some(index) = self.resolve_local(&binding_name) {
                    if self.state().locals[index].is_captured {
                        self.emit(Op::CloseUpvalue, slot, 0, 0);
                    }
                }
            }
        }

        // index = index + 1
        self.reset_scratch();
        let index = self.alloc()?;
        self.emit(Op::LoadLocalVar, index, index_slot, 0);
        let one = self.load_const(Value::Number(1.0))?;
        let next = self.alloc()?;
        self.emit(Op::Add, next, index, one);
        self.emit(Op::StoreLocalLet, index_slot, next, 0);

        self.emit_loop(loop_start)?;
        self.patch_jump(exit)?;
        self.end_breakable()?;
        self.end_scope();
        Ok(())
    }

    fn switch_statement(&mut self, discriminant: &Expr, cases: &[SwitchCase]) -> CResult<()> {
        self.begin_scope();
        self.begin_breakable(BreakableKind::Switch);

        let subject = self.expression(discriminant)?;

        // Test section: one Equal/JumpIfFalse pair per case, jumping to the
        // case body on match.
        let mut body_jumps: Vec<(usize, usize)> = Vec::new();
        for (case_index, case) in cases.iter().enumerate() {
            let Some(test) = &case.test else { continue };
            let test_reg = self.expression(test)?;
            let matched = self.alloc()?;
            self.emit(Op::Equal, matched, subject, test_reg);
            let next = self.emit_jump(Op::JumpIfFalse, matched);
            let to_body = self.emit_jump(Op::Jump, 0);
            body_jumps.push((case_index, to_body));
            self.patch_jump(next)?;
        }

        // No case matched: go to the default body when present, else past
        // the switch.
        let default_jump = self.emit_jump(Op::Jump, 0);
        let default_index = cases.iter().position(|case| case.test.is_none());

        // Body section in source order; absent breaks fall through.
        let mut body_starts = vec![0usize; cases.len()];
        for (case_index, case) in cases.iter().enumerate() {
            body_starts[case_index] = self.here();
            for stmt in &case.body {
                self.statement(stmt)?;
            }
        }

        for (case_index, jump) in body_jumps {
            self.patch_jump_to(jump, body_starts[case_index])?;
        }
        match default_index {
            Some(case_index) => self.patch_jump_to(default_jump, body_starts[case_index])?,
            None => self.patch_jump(default_jump)?,
        }

        self.end_breakable()?;
        self.end_scope();
        Ok(())
    }

    fn try_statement(
        &mut self,
        block: &[Stmt],
        handler: Option<&CatchClause>,
        finalizer: Option<&[Stmt]>,
    ) -> CResult<()> {
        let catch_reg = self.alloc()?;
        let try_at = self.emit(Op::Try, 0, 0, catch_reg);

        self.begin_scope();
        for stmt in block {
            self.statement(stmt)?;
        }
        self.end_scope();
        self.emit(Op::EndTry, 0, 0, 0);

        let mut catch_offset = 0usize;
        let mut skip_catch = None;
        if let Some(handler) = handler {
            skip_catch = Some(self.emit_jump(Op::Jump, 0));
            catch_offset = self.here() - (try_at + 1);

            // The catch binding lives in a fresh lexical environment
            self.emit(Op::PushLexicalEnv, 0, 0, 0);
            let name_idx = self.const_index(Value::str(&handler.param))?;
            self.emit(Op::LoadExceptionValue, catch_reg, name_idx, 0);
            self.begin_scope();
            for stmt in &handler.body {
                self.statement(stmt)?;
            }
            self.end_scope();
            self.emit(Op::PopLexicalEnv, 0, 0, 0);
        }
        if let Some(skip) = skip_catch {
            self.patch_jump(skip)?;
        }

        let mut finally_offset = 0usize;
        if let Some(finalizer) = finalizer {
            finally_offset = self.here() - (try_at + 1);
            self.begin_scope();
            for stmt in finalizer {
                self.statement(stmt)?;
            }
            self.end_scope();
            self.emit(Op::EndFinally, 0, 0, 0);
        }

        if catch_offset > u8::MAX as usize || finally_offset > u8::MAX as usize {
            return Err(ArdanError::compile_error(
                "Try region too large for handler offsets".to_string(),
            ));
        }
        let instr = &mut self.states.last_mut().expect("state").chunk.code[try_at];
        instr.a = catch_offset as u8;
        instr.b = finally_offset as u8;
        Ok(())
    }

    fn import_statement(&mut self, path: &str, source_file: &Path) -> CResult<()> {
        let base = source_file.parent().unwrap_or_else(|| Path::new("."));
        let resolved = base.join(path);
        let resolved = resolved.canonicalize().unwrap_or(resolved);

        if self.loaded_modules.contains(&resolved) {
            return Ok(());
        }
        // Registered before compilation so cyclic imports terminate
        self.loaded_modules.push(resolved.clone());

        let source = std::fs::read_to_string(&resolved).map_err(|e| {
            ArdanError::compile_error(format!("Failed to read module {:?}: {}", resolved, e))
        })?;
        let mut parser = Parser::new(tokenize(&source)).with_source_file(resolved);
        let program = parser.parse()?;
        for stmt in &program {
            self.statement(stmt)?;
        }
        Ok(())
    }

    // ---- functions & classes ----

    /// Compile a function body into its own chunk and emit the closure
    /// construction into the current chunk. Returns the register holding the
    /// closure.
    fn function_value(&mut self, func: &FunctionExpr, is_method: bool) -> CResult<u8> {
        let name = func.name.clone().unwrap_or_else(|| "<anonymous>".to_string());
        let mut state = FunctionState::new(&name, func.is_async);
        state.scope_depth = 1;
        self.states.push(state);

        // Parameter slots start at local 0; vars hoist in behind them
        for param in &func.params {
            self.declare_local(&param.name, BindingKind::Var, 1)?;
        }
        self.hoist_var_declarations(&func.body)?;

        for (index, param) in func.params.iter().enumerate() {
            let slot = index as u8;
            if param.is_rest {
                // rest = arguments.slice(index)
                let args = self.alloc()?;
                self.emit(Op::LoadArguments, args, 0, 0);
                let start = self.load_const(Value::Number(index as f64))?;
                self.emit(Op::Slice, args, start, 0);
                self.emit(Op::StoreLocalVar, slot, args, 0);
            } else if let Some(default) = &param.default {
                // slot = arguments.length > index ? arguments[index] : default
                let count = self.alloc()?;
                self.emit(Op::LoadArgumentsLength, count, 0, 0);
                let index_reg = self.load_const(Value::Number(index as f64))?;
                let enough = self.alloc()?;
                self.emit(Op::GreaterThan, enough, count, index_reg);
                let use_default = self.emit_jump(Op::JumpIfFalse, enough);

                let value = self.alloc()?;
                let k = self.const_index(Value::Number(index as f64))?;
                self.emit(Op::LoadConst, value, k, 0);
                self.emit(Op::LoadArgument, value, 0, 0);
                self.emit(Op::StoreLocalVar, slot, value, 0);
                let done = self.emit_jump(Op::Jump, 0);

                self.patch_jump(use_default)?;
                let fallback = self.expression(default)?;
                self.emit(Op::StoreLocalVar, slot, fallback, 0);
                self.patch_jump(done)?;
            } else {
                let value = self.alloc()?;
                let k = self.const_index(Value::Number(index as f64))?;
                self.emit(Op::LoadConst, value, k, 0);
                self.emit(Op::LoadArgument, value, 0, 0);
                self.emit(Op::StoreLocalVar, slot, value, 0);
            }
            self.reset_scratch();
        }

        // A derived-class constructor with no explicit super() chains
        // implicitly before its body runs.
        if is_method
            && name == crate::runtime::object::CONSTRUCTOR
            && self
                .class_info
                .as_ref()
                .map(|info| info.super_class_name.is_some())
                .unwrap_or(false)
            && !body_calls_super(&func.body)
        {
            self.emit_super_call_with_args(&[])?;
            self.reset_scratch();
        }

        for stmt in &func.body {
            self.statement(stmt)?;
        }
        let returns = matches!(func.body.last(), Some(Stmt::Return(_)));
        if !returns {
            self.reset_scratch();
            let undef = self.load_const(Value::Undefined)?;
            self.emit(Op::Return, undef, 0, 0);
        }

        let state = self.states.pop().expect("function state");
        let upvalues = state.upvalues.clone();
        let mut chunk = state.chunk;
        chunk.arity = func.params.len() as u32;
        let chunk_index = self.module.add_chunk(chunk);

        let fn_ref = FunctionObject {
            chunk_index,
            arity: func.params.len() as u32,
            name: name.clone(),
            upvalues_size: upvalues.len() as u32,
            is_async: func.is_async,
        };
        let module_index = self.module.add_constant(Value::FunctionRef(Rc::new(fn_ref)));

        // The closure register first holds the module-constant index
        let reg = self.load_const(Value::Number(module_index as f64))?;
        let bind_this = u8::from(func.is_arrow);
        self.emit(Op::CreateClosure, reg, 0, bind_this);
        for uv in &upvalues {
            self.emit(Op::UpvalueRef, u8::from(uv.is_local), uv.index, 0);
        }
        self.emit(Op::SetExecutionContext, reg, 0, 0);
        Ok(reg)
    }

    /// Compile a field-initialiser thunk: a zero-argument chunk returning the
    /// field's initial value, recorded only in the module constant pool.
    fn field_thunk(&mut self, field: &ClassField) -> CResult<usize> {
        let mut state = FunctionState::new(&field.name, false);
        state.scope_depth = 1;
        self.states.push(state);

        let value = match &field.init {
            Some(init) => self.expression(init)?,
            None => self.load_const(Value::Undefined)?,
        };
        self.emit(Op::Return, value, 0, 0);

        let state = self.states.pop().expect("thunk state");
        if !state.upvalues.is_empty() {
            return Err(ArdanError::compile_error(format!(
                "Field initializer for '{}' cannot capture enclosing variables",
                field.name
            )));
        }
        let chunk_index = self.module.add_chunk(state.chunk);
        let fn_ref = FunctionObject {
            chunk_index,
            arity: 0,
            name: field.name.clone(),
            upvalues_size: 0,
            is_async: false,
        };
        Ok(self.module.add_constant(Value::FunctionRef(Rc::new(fn_ref))))
    }

    fn class_declaration(&mut self, decl: &ClassDecl) -> CResult<()> {
        let previous_info = self.class_info.take();

        let mut info = ClassInfo {
            name: decl.name.clone(),
            super_class_name: decl.super_class.clone(),
            fields: AHashMap::new(),
        };
        // Member metadata is collected up front so method bodies can resolve
        // bare identifiers against it.
        for field in &decl.fields {
            info.fields.insert(
                field.name.clone(),
                PropertyMeta {
                    visibility: field.visibility,
                    kind: field.kind,
                    is_static: field.is_static,
                },
            );
        }
        for method in &decl.methods {
            info.fields.insert(
                method.name.clone(),
                PropertyMeta {
                    visibility: method.visibility,
                    kind: BindingKind::Var,
                    is_static: method.is_static,
                },
            );
        }
        self.class_info = Some(info);

        let result = self.class_declaration_inner(decl);

        let info = self.class_info.take().expect("class info");
        self.classes.insert(decl.name.clone(), info);
        self.class_info = previous_info;
        result
    }

    fn class_declaration_inner(&mut self, decl: &ClassDecl) -> CResult<()> {
        // Superclass value (or Null) ends up replaced by the class itself
        let class_reg = match &decl.super_class {
            Some(name) => self.load_name(name)?,
            None => self.load_const(Value::Null)?,
        };
        let name_idx = self.const_index(Value::str(&decl.name))?;
        self.emit(Op::NewClass, class_reg, 0, name_idx);

        for field in &decl.fields {
            let value_reg = if field.is_static {
                match &field.init {
                    Some(init) => self.expression(init)?,
                    None => self.load_const(Value::Undefined)?,
                }
            } else {
                // Instance fields defer to an initialiser thunk invoked at
                // construction time.
                let thunk_index = self.field_thunk(field)?;
                self.load_const(Value::Number(thunk_index as f64))?
            };
            let field_name = self.load_const(Value::str(&field.name))?;
            let op = class_property_op(field.visibility, field.kind, field.is_static)?;
            self.emit(op, class_reg, value_reg, field_name);
        }

        let mut has_constructor = false;
        for method in &decl.methods {
            if method.name == crate::runtime::object::CONSTRUCTOR {
                has_constructor = true;
            }
            self.compile_class_method(class_reg, method)?;
        }

        // Every class carries a constructor; the synthesized default just
        // chains to the superclass.
        if !has_constructor {
            let default_ctor = ClassMethod {
                name: crate::runtime::object::CONSTRUCTOR.to_string(),
                visibility: Visibility::Public,
                is_static: false,
                is_async: false,
                params: Vec::new(),
                body: vec![Stmt::Expression(Expr::Call {
                    callee: Box::new(Expr::Super),
                    arguments: Vec::new(),
                })],
            };
            self.compile_class_method(class_reg, &default_ctor)?;
        }

        self.bind_declaration(&decl.name, class_reg)
    }

    fn compile_class_method(&mut self, class_reg: u8, method: &ClassMethod) -> CResult<()> {
        let func = FunctionExpr {
            name: Some(method.name.clone()),
            params: method.params.clone(),
            body: method.body.clone(),
            is_async: method.is_async,
            is_arrow: false,
        };
        let method_reg = self.function_value(&func, true)?;
        let method_name = self.load_const(Value::str(&method.name))?;
        let op = class_method_op(method.visibility, method.is_static);
        self.emit(op, class_reg, method_reg, method_name);
        Ok(())
    }

    // ---- expressions ----

    /// Compile an expression, returning the register holding its value.
    fn expression(&mut self, expr: &Expr) -> CResult<u8> {
        match expr {
            Expr::Number(n) => self.load_const(Value::Number(*n)),
            Expr::Str(s) => self.load_const(Value::str(s)),
            Expr::Boolean(b) => self.load_const(Value::Boolean(*b)),
            Expr::Null => self.load_const(Value::Null),
            Expr::Undefined => self.load_const(Value::Undefined),
            Expr::Identifier(name) => self.load_name(name),
            Expr::This => {
                let reg = self.alloc()?;
                self.emit(Op::GetThis, reg, 0, 0);
                Ok(reg)
            }
            Expr::Super => {
                let reg = self.alloc()?;
                self.emit(Op::GetParentObject, reg, 0, 0);
                Ok(reg)
            }
            Expr::TemplateLiteral { quasis, expressions } => {
                self.template_literal(quasis, expressions)
            }
            Expr::Array(elements) => self.array_literal(elements),
            Expr::Object(properties) => self.object_literal(properties),
            Expr::Function(func) => self.function_value(func, false),
            Expr::Binary { op, left, right } => self.binary(op, left, right),
            Expr::Logical { op, left, right } => self.logical(op, left, right),
            Expr::Assign { op, target, value } => self.assignment(op, target, value),
            Expr::Unary { op, argument } => self.unary(op, argument),
            Expr::Update { op, prefix, argument } => self.update(op, *prefix, argument),
            Expr::Conditional { test, consequent, alternate } => {
                let cond = self.expression(test)?;
                let result = self.alloc()?;
                let to_else = self.emit_jump(Op::JumpIfFalse, cond);
                let then_reg = self.expression(consequent)?;
                self.emit(Op::Move, result, then_reg, 0);
                let to_end = self.emit_jump(Op::Jump, 0);
                self.patch_jump(to_else)?;
                let else_reg = self.expression(alternate)?;
                self.emit(Op::Move, result, else_reg, 0);
                self.patch_jump(to_end)?;
                Ok(result)
            }
            Expr::Call { callee, arguments } => self.call(callee, arguments),
            Expr::New { callee, arguments } => self.new_expression(callee, arguments),
            Expr::Member { object, property } => self.member_read(object, property),
            Expr::Await(argument) => {
                if !self.state().is_async {
                    return Err(ArdanError::compile_error(
                        "'await' is only valid inside async functions".to_string(),
                    ));
                }
                let promise = self.expression(argument)?;
                let result = self.alloc()?;
                self.emit(Op::Await, promise, result, 0);
                Ok(result)
            }
            Expr::Sequence(exprs) => {
                let mut last = self.load_const(Value::Undefined)?;
                for expr in exprs {
                    last = self.expression(expr)?;
                }
                Ok(last)
            }
        }
    }

    fn template_literal(&mut self, quasis: &[String], expressions: &[Expr]) -> CResult<u8> {
        let result = self.load_const(Value::str(""))?;
        for (index, quasi) in quasis.iter().enumerate() {
            if !quasi.is_empty() {
                let text = self.load_const(Value::str(quasi))?;
                self.emit(Op::Add, result, result, text);
            }
            if index < expressions.len() {
                let value = self.expression(&expressions[index])?;
                self.emit(Op::Add, result, result, value);
            }
        }
        Ok(result)
    }

    fn array_literal(&mut self, elements: &[ArrayElement]) -> CResult<u8> {
        let array = self.alloc()?;
        self.emit(Op::NewArray, array, 0, 0);
        for element in elements {
            match element {
                ArrayElement::Single(expr) => {
                    let value = self.expression(expr)?;
                    self.emit(Op::ArrayPush, array, value, 0);
                }
                ArrayElement::Spread(expr) => {
                    let value = self.expression(expr)?;
                    self.emit(Op::ArraySpread, array, value, 0);
                }
            }
        }
        Ok(array)
    }

    fn object_literal(&mut self, properties: &[ObjectProperty]) -> CResult<u8> {
        let object = self.alloc()?;
        self.emit(Op::CreateObjectLiteral, object, 0, 0);
        for property in properties {
            match property {
                ObjectProperty::Pair(key, value) => {
                    let value_reg = self.expression(value)?;
                    let key_idx = self.const_index(Value::str(key))?;
                    self.emit(Op::CreateObjectLiteralProperty, object, key_idx, value_reg);
                }
                ObjectProperty::Spread(expr) => {
                    let source = self.expression(expr)?;
                    self.emit(Op::ObjectSpread, object, source, 0);
                }
            }
        }
        Ok(object)
    }

    fn binary(&mut self, op: &BinaryOp, left: &Expr, right: &Expr) -> CResult<u8> {
        let lhs = self.expression(left)?;
        let rhs = self.expression(right)?;
        let result = self.alloc()?;
        self.emit(binary_opcode(op), result, lhs, rhs);
        Ok(result)
    }

    fn logical(&mut self, op: &LogicalOp, left: &Expr, right: &Expr) -> CResult<u8> {
        match op {
            LogicalOp::And => {
                let result = self.alloc()?;
                let lhs = self.expression(left)?;
                self.emit(Op::Move, result, lhs, 0);
                let short = self.emit_jump(Op::JumpIfFalse, result);
                let rhs = self.expression(right)?;
                self.emit(Op::Move, result, rhs, 0);
                self.patch_jump(short)?;
                Ok(result)
            }
            LogicalOp::Or => {
                let result = self.alloc()?;
                let lhs = self.expression(left)?;
                self.emit(Op::Move, result, lhs, 0);
                let take_rhs = self.emit_jump(Op::JumpIfFalse, result);
                let done = self.emit_jump(Op::Jump, 0);
                self.patch_jump(take_rhs)?;
                let rhs = self.expression(right)?;
                self.emit(Op::Move, result, rhs, 0);
                self.patch_jump(done)?;
                Ok(result)
            }
            LogicalOp::NullishCoalescing => {
                let lhs = self.expression(left)?;
                let rhs = self.expression(right)?;
                let result = self.alloc()?;
                self.emit(Op::NullishCoalescing, result, lhs, rhs);
                Ok(result)
            }
        }
    }

    fn assignment(&mut self, op: &AssignOp, target: &Expr, value: &Expr) -> CResult<u8> {
        match target {
            Expr::Identifier(name) => {
                let result = if *op == AssignOp::Assign {
                    self.expression(value)?
                } else {
                    let current = self.load_name(name)?;
                    let rhs = self.expression(value)?;
                    let result = self.alloc()?;
                    self.emit(assign_opcode(op), result, current, rhs);
                    result
                };
                self.store_name(name, result)?;
                Ok(result)
            }
            Expr::Member { object, property } => {
                // `this.x` prefers the dedicated this-property forms
                if matches!(object.as_ref(), Expr::This) {
                    if let MemberKey::Name(name) = property {
                        return self.this_property_assignment(op, name, value);
                    }
                }
                let object_reg = self.expression(object)?;
                match property {
                    MemberKey::Name(name) => {
                        let key = self.const_index(Value::str(name))?;
                        let result = if *op == AssignOp::Assign {
                            self.expression(value)?
                        } else {
                            let current = self.alloc()?;
                            self.emit(Op::GetProperty, current, object_reg, key);
                            let rhs = self.expression(value)?;
                            let result = self.alloc()?;
                            self.emit(assign_opcode(op), result, current, rhs);
                            result
                        };
                        self.emit(Op::SetProperty, object_reg, key, result);
                        Ok(result)
                    }
                    MemberKey::Computed(key_expr) => {
                        let key = self.expression(key_expr)?;
                        let result = if *op == AssignOp::Assign {
                            self.expression(value)?
                        } else {
                            let current = self.alloc()?;
                            self.emit(Op::GetPropertyDynamic, current, object_reg, key);
                            let rhs = self.expression(value)?;
                            let result = self.alloc()?;
                            self.emit(assign_opcode(op), result, current, rhs);
                            result
                        };
                        self.emit(Op::SetPropertyDynamic, object_reg, key, result);
                        Ok(result)
                    }
                }
            }
            _ => Err(ArdanError::compile_error("Unsupported assignment target".to_string())),
        }
    }

    fn this_property_assignment(
        &mut self,
        op: &AssignOp,
        name: &str,
        value: &Expr,
    ) -> CResult<u8> {
        let key = self.const_index(Value::str(name))?;
        let result = if *op == AssignOp::Assign {
            self.expression(value)?
        } else {
            let current = self.alloc()?;
            self.emit(Op::LoadThisProperty, current, key, 0);
            let rhs = self.expression(value)?;
            let result = self.alloc()?;
            self.emit(assign_opcode(op), result, current, rhs);
            result
        };
        self.emit(Op::StoreThisProperty, key, result, 0);
        Ok(result)
    }

    fn unary(&mut self, op: &UnaryOp, argument: &Expr) -> CResult<u8> {
        match op {
            UnaryOp::Delete => {
                let Expr::Member { object, property } = argument else {
                    return Err(ArdanError::compile_error(
                        "'delete' target must be a property access".to_string(),
                    ));
                };
                let object_reg = self.expression(object)?;
                let key = match property {
                    MemberKey::Name(name) => self.load_const(Value::str(name))?,
                    MemberKey::Computed(expr) => self.expression(expr)?,
                };
                let result = self.alloc()?;
                self.emit(Op::Delete, result, object_reg, key);
                Ok(result)
            }
            UnaryOp::BitNot => {
                // ~x lowers to x ^ -1
                let value = self.expression(argument)?;
                let all_ones = self.load_const(Value::Number(-1.0))?;
                let result = self.alloc()?;
                self.emit(Op::BitXor, result, value, all_ones);
                Ok(result)
            }
            UnaryOp::Positive => {
                // +x lowers to x - 0 for numeric coercion
                let value = self.expression(argument)?;
                let zero = self.load_const(Value::Number(0.0))?;
                let result = self.alloc()?;
                self.emit(Op::Subtract, result, value, zero);
                Ok(result)
            }
            UnaryOp::Negate => {
                let value = self.expression(argument)?;
                self.emit(Op::Negate, value, 0, 0);
                Ok(value)
            }
            UnaryOp::LogicalNot => {
                let value = self.expression(argument)?;
                self.emit(Op::LogicalNot, value, 0, 0);
                Ok(value)
            }
            UnaryOp::TypeOf => {
                let value = self.expression(argument)?;
                self.emit(Op::TypeOf, value, 0, 0);
                Ok(value)
            }
            UnaryOp::Void => {
                let value = self.expression(argument)?;
                self.emit(Op::Void, value, 0, 0);
                Ok(value)
            }
        }
    }

    /// Increments and decrements; the expression value is the old value for
    /// postfix forms and the new value for prefix forms.
    fn update(&mut self, op: &UpdateOp, prefix: bool, argument: &Expr) -> CResult<u8> {
        let delta_op = match op {
            UpdateOp::Increment => Op::Add,
            UpdateOp::Decrement => Op::Subtract,
        };
        match argument {
            Expr::Identifier(name) => {
                let old = self.load_name(name)?;
                let one = self.load_const(Value::Number(1.0))?;
                let new = self.alloc()?;
                self.emit(delta_op, new, old, one);
                self.store_name(name, new)?;
                Ok(if prefix { new } else { old })
            }
            Expr::Member { object, property } => {
                let object_reg = self.expression(object)?;
                match property {
                    MemberKey::Name(name) => {
                        let key = self.const_index(Value::str(name))?;
                        let old = self.alloc()?;
                        self.emit(Op::GetProperty, old, object_reg, key);
                        let one = self.load_const(Value::Number(1.0))?;
                        let new = self.alloc()?;
                        self.emit(delta_op, new, old, one);
                        self.emit(Op::SetProperty, object_reg, key, new);
                        Ok(if prefix { new } else { old })
                    }
                    MemberKey::Computed(key_expr) => {
                        let key = self.expression(key_expr)?;
                        let old = self.alloc()?;
                        self.emit(Op::GetPropertyDynamic, old, object_reg, key);
                        let one = self.load_const(Value::Number(1.0))?;
                        let new = self.alloc()?;
                        self.emit(delta_op, new, old, one);
                        self.emit(Op::SetPropertyDynamic, object_reg, key, new);
                        Ok(if prefix { new } else { old })
                    }
                }
            }
            _ => Err(ArdanError::compile_error(
                "Update target must be an identifier or member expression".to_string(),
            )),
        }
    }

    fn member_read(&mut self, object: &Expr, property: &MemberKey) -> CResult<u8> {
        // `this.x` uses the dedicated load
        if matches!(object, Expr::This) {
            if let MemberKey::Name(name) = property {
                let key = self.const_index(Value::str(name))?;
                let result = self.alloc()?;
                self.emit(Op::LoadThisProperty, result, key, 0);
                return Ok(result);
            }
        }
        let object_reg = self.expression(object)?;
        match property {
            MemberKey::Name(name) => {
                let key = self.const_index(Value::str(name))?;
                let result = self.alloc()?;
                self.emit(Op::GetProperty, result, object_reg, key);
                Ok(result)
            }
            MemberKey::Computed(key_expr) => {
                let key = self.expression(key_expr)?;
                let result = self.alloc()?;
                self.emit(Op::GetPropertyDynamic, result, object_reg, key);
                Ok(result)
            }
        }
    }

    /// Evaluate arguments into registers first, then push them; nested calls
    /// inside argument expressions drain the shared argument stack before the
    /// outer call's pushes happen.
    fn push_arguments(&mut self, arguments: &[Argument]) -> CResult<()> {
        let mut staged = Vec::with_capacity(arguments.len());
        for argument in arguments {
            match argument {
                Argument::Single(expr) => staged.push((self.expression(expr)?, false)),
                Argument::Spread(expr) => staged.push((self.expression(expr)?, true)),
            }
        }
        for (reg, spread) in staged {
            let op = if spread { Op::PushSpreadArg } else { Op::PushArg };
            self.emit(op, reg, 0, 0);
        }
        Ok(())
    }

    fn emit_super_call_with_args(&mut self, arguments: &[Argument]) -> CResult<u8> {
        let parent = self.alloc()?;
        self.emit(Op::GetParentObject, parent, 0, 0);
        self.push_arguments(arguments)?;
        let result = self.alloc()?;
        self.emit(Op::SuperCall, result, parent, 0);
        Ok(result)
    }

    fn call(&mut self, callee: &Expr, arguments: &[Argument]) -> CResult<u8> {
        // super(...) chains to the parent constructor
        if matches!(callee, Expr::Super) {
            return self.emit_super_call_with_args(arguments);
        }

        let callee_reg = match callee {
            Expr::Member { object, property } => {
                let object_reg = self.expression(object)?;
                match property {
                    MemberKey::Name(name) => {
                        let key = self.const_index(Value::str(name))?;
                        let func = self.alloc()?;
                        self.emit(Op::GetProperty, func, object_reg, key);
                        func
                    }
                    MemberKey::Computed(key_expr) => {
                        let key = self.expression(key_expr)?;
                        let func = self.alloc()?;
                        self.emit(Op::GetPropertyDynamic, func, object_reg, key);
                        func
                    }
                }
            }
            _ => self.expression(callee)?,
        };

        self.push_arguments(arguments)?;
        let result = self.alloc()?;
        self.emit(Op::Call, result, callee_reg, 0);
        Ok(result)
    }

    fn new_expression(&mut self, callee: &Expr, arguments: &[Argument]) -> CResult<u8> {
        let class_reg = self.expression(callee)?;
        self.emit(Op::CreateInstance, class_reg, 0, 0);
        self.push_arguments(arguments)?;
        self.emit(Op::InvokeConstructor, class_reg, 0, 0);
        Ok(class_reg)
    }
}

fn binary_opcode(op: &BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Subtract => Op::Subtract,
        BinaryOp::Multiply => Op::Multiply,
        BinaryOp::Divide => Op::Divide,
        BinaryOp::Modulo => Op::Modulo,
        BinaryOp::Power => Op::Power,
        BinaryOp::Equal => Op::Equal,
        BinaryOp::NotEqual => Op::NotEqual,
        BinaryOp::StrictEqual => Op::StrictEqual,
        BinaryOp::StrictNotEqual => Op::StrictNotEqual,
        BinaryOp::LessThan => Op::LessThan,
        BinaryOp::LessThanOrEqual => Op::LessThanOrEqual,
        BinaryOp::GreaterThan => Op::GreaterThan,
        BinaryOp::GreaterThanOrEqual => Op::GreaterThanOrEqual,
        BinaryOp::BitAnd => Op::BitAnd,
        BinaryOp::BitOr => Op::BitOr,
        BinaryOp::BitXor => Op::BitXor,
        BinaryOp::ShiftLeft => Op::ShiftLeft,
        BinaryOp::ShiftRight => Op::ShiftRight,
        BinaryOp::UnsignedShiftRight => Op::UnsignedShiftRight,
        BinaryOp::In => Op::In,
        BinaryOp::InstanceOf => Op::InstanceOf,
    }
}

fn assign_opcode(op: &AssignOp) -> Op {
    match op {
        AssignOp::Assign => unreachable!("plain assignment has no operator"),
        AssignOp::Add => Op::Add,
        AssignOp::Subtract => Op::Subtract,
        AssignOp::Multiply => Op::Multiply,
        AssignOp::Divide => Op::Divide,
        AssignOp::Modulo => Op::Modulo,
        AssignOp::Power => Op::Power,
        AssignOp::ShiftLeft => Op::ShiftLeft,
        AssignOp::ShiftRight => Op::ShiftRight,
        AssignOp::UnsignedShiftRight => Op::UnsignedShiftRight,
        AssignOp::BitAnd => Op::BitAnd,
        AssignOp::BitOr => Op::BitOr,
        AssignOp::BitXor => Op::BitXor,
        AssignOp::LogicalAnd => Op::LogicalAnd,
        AssignOp::LogicalOr => Op::LogicalOr,
        AssignOp::NullishCoalescing => Op::NullishCoalescing,
    }
}

fn class_property_op(
    visibility: Visibility,
    kind: BindingKind,
    is_static: bool,
) -> Result<Op, ArdanError> {
    let op = match (kind, is_static, visibility) {
        (BindingKind::Var, false, Visibility::Public) => Op::CreateClassPublicPropertyVar,
        (BindingKind::Var, false, Visibility::Private) => Op::CreateClassPrivatePropertyVar,
        (BindingKind::Var, false, Visibility::Protected) => Op::CreateClassProtectedPropertyVar,
        (BindingKind::Const, false, Visibility::Public) => Op::CreateClassPublicPropertyConst,
        (BindingKind::Const, false, Visibility::Private) => Op::CreateClassPrivatePropertyConst,
        (BindingKind::Const, false, Visibility::Protected) => {
            Op::CreateClassProtectedPropertyConst
        }
        (BindingKind::Var, true, Visibility::Public) => Op::CreateClassPublicStaticPropertyVar,
        (BindingKind::Var, true, Visibility::Private) => Op::CreateClassPrivateStaticPropertyVar,
        (BindingKind::Var, true, Visibility::Protected) => {
            Op::CreateClassProtectedStaticPropertyVar
        }
        (BindingKind::Const, true, Visibility::Public) => Op::CreateClassPublicStaticPropertyConst,
        (BindingKind::Const, true, Visibility::Private) => {
            Op::CreateClassPrivateStaticPropertyConst
        }
        (BindingKind::Const, true, Visibility::Protected) => {
            Op::CreateClassProtectedStaticPropertyConst
        }
        (BindingKind::Let, _, _) => {
            return Err(ArdanError::compile_error(
                "Class fields must be declared var or const".to_string(),
            ))
        }
    };
    Ok(op)
}

fn class_method_op(visibility: Visibility, is_static: bool) -> Op {
    match (is_static, visibility) {
        (false, Visibility::Public) => Op::CreateClassPublicMethod,
        (false, Visibility::Private) => Op::CreateClassPrivateMethod,
        (false, Visibility::Protected) => Op::CreateClassProtectedMethod,
        (true, Visibility::Public) => Op::CreateClassPublicStaticMethod,
        (true, Visibility::Private) => Op::CreateClassPrivateStaticMethod,
        (true, Visibility::Protected) => Op::CreateClassProtectedStaticMethod,
    }
}

/// Collect the names of `var` declarations reachable without entering a
/// nested function or class body.
fn collect_var_names(body: &[Stmt], names: &mut Vec<String>) {
    for stmt in body {
        match stmt {
            Stmt::Variable { kind: BindingKind::Var, declarations } => {
                for decl in declarations {
                    names.push(decl.name.clone());
                }
            }
            Stmt::Block(inner) => collect_var_names(inner, names),
            Stmt::If { consequent, alternate, .. } => {
                collect_var_names(std::slice::from_ref(consequent), names);
                if let Some(alternate) = alternate {
                    collect_var_names(std::slice::from_ref(alternate), names);
                }
            }
            Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => {
                collect_var_names(std::slice::from_ref(body), names);
            }
            Stmt::For { init, body, .. } => {
                if let Some(init) = init {
                    collect_var_names(std::slice::from_ref(init), names);
                }
                collect_var_names(std::slice::from_ref(body), names);
            }
            Stmt::ForIn { binding, body, .. } | Stmt::ForOf { binding, body, .. } => {
                if let ForBinding::Declaration(BindingKind::Var, name) = binding {
                    names.push(name.clone());
                }
                collect_var_names(std::slice::from_ref(body), names);
            }
            Stmt::Try { block, handler, finalizer } => {
                collect_var_names(block, names);
                if let Some(handler) = handler {
                    collect_var_names(&handler.body, names);
                }
                if let Some(finalizer) = finalizer {
                    collect_var_names(finalizer, names);
                }
            }
            Stmt::Switch { cases, .. } => {
                for case in cases {
                    collect_var_names(&case.body, names);
                }
            }
            _ => {}
        }
    }
}

/// Whether a constructor body contains an explicit super(...) call
fn body_calls_super(body: &[Stmt]) -> bool {
    fn expr_calls_super(expr: &Expr) -> bool {
        match expr {
            Expr::Call { callee, arguments } => {
                matches!(callee.as_ref(), Expr::Super)
                    || expr_calls_super(callee)
                    || arguments.iter().any(|arg| match arg {
                        Argument::Single(e) | Argument::Spread(e) => expr_calls_super(e),
                    })
            }
            Expr::Sequence(exprs) => exprs.iter().any(expr_calls_super),
            Expr::Assign { target, value, .. } => {
                expr_calls_super(target) || expr_calls_super(value)
            }
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                expr_calls_super(left) || expr_calls_super(right)
            }
            Expr::Conditional { test, consequent, alternate } => {
                expr_calls_super(test)
                    || expr_calls_super(consequent)
                    || expr_calls_super(alternate)
            }
            Expr::Unary { argument, .. }
            | Expr::Update { argument, .. }
            | Expr::Await(argument) => expr_calls_super(argument),
            _ => false,
        }
    }

    fn stmt_calls_super(stmt: &Stmt) -> bool {
        match stmt {
            Stmt::Expression(expr) | Stmt::Throw(expr) | Stmt::Return(Some(expr)) => {
                expr_calls_super(expr)
            }
            Stmt::Block(body) => body.iter().any(stmt_calls_super),
            Stmt::If { test, consequent, alternate } => {
                expr_calls_super(test)
                    || stmt_calls_super(consequent)
                    || alternate.as_deref().map(stmt_calls_super).unwrap_or(false)
            }
            _ => false,
        }
    }

    body.iter().any(stmt_calls_super)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn compile_source(src: &str) -> Result<Module, ArdanError> {
        let mut parser = Parser::new(tokenize(src));
        let program = parser.parse()?;
        let mut module = Module::new();
        compile_program(&mut module, &program)?;
        Ok(module)
    }

    fn entry_code(module: &Module) -> &[Instruction] {
        &module.entry_chunk().expect("entry chunk").code
    }

    #[test]
    fn jump_targets_stay_inside_the_chunk() {
        let module = compile_source(
            "let i = 0; while (i < 10) { if (i == 5) { break; } i = i + 1; } \
             for (let j = 0; j < 3; j = j + 1) { continue; }",
        )
        .unwrap();
        for chunk in &module.chunks {
            for (index, instr) in chunk.code.iter().enumerate() {
                match instr.op {
                    Op::Jump => assert!(index + 1 + instr.offset_ab() <= chunk.code.len()),
                    Op::JumpIfFalse => {
                        assert!(index + 1 + instr.offset_bc() <= chunk.code.len())
                    }
                    Op::Loop => assert!(instr.offset_ab() <= index + 1),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn try_offsets_point_past_the_try() {
        let module = compile_source(
            "try { throw \"x\"; } catch (e) { let y = e; } finally { let z = 1; }",
        )
        .unwrap();
        let code = entry_code(&module);
        let (index, try_instr) = code
            .iter()
            .enumerate()
            .find(|(_, instr)| instr.op == Op::Try)
            .expect("try emitted");
        assert!(try_instr.a > 0, "catch offset present");
        assert!(try_instr.b > 0, "finally offset present");
        assert!(try_instr.b > try_instr.a, "finally after catch");
        assert!(index + 1 + try_instr.a as usize <= code.len());
        assert!(index + 1 + try_instr.b as usize <= code.len());
    }

    #[test]
    fn closure_descriptor_count_matches_function_ref() {
        let module = compile_source(
            "function mk() { let x = 0; return function() { x = x + 1; return x; }; }",
        )
        .unwrap();
        // Inner function captures x: its FunctionRef must record one upvalue
        // and CreateClosure must trail exactly one descriptor.
        let inner = module
            .constants
            .iter()
            .filter_map(|value| match value {
                Value::FunctionRef(func) => Some(func),
                _ => None,
            })
            .find(|func| func.name == "<anonymous>")
            .expect("inner function constant");
        assert_eq!(inner.upvalues_size, 1);

        let mk_chunk = module
            .chunks
            .iter()
            .find(|chunk| chunk.name == "mk")
            .expect("mk chunk");
        let create_at = mk_chunk
            .code
            .iter()
            .position(|instr| instr.op == Op::CreateClosure)
            .expect("closure creation in mk");
        assert_eq!(mk_chunk.code[create_at + 1].op, Op::UpvalueRef);
        assert_eq!(mk_chunk.code[create_at + 1].a, 1); // captures mk's local
        assert_ne!(mk_chunk.code[create_at + 2].op, Op::UpvalueRef);
    }

    #[test]
    fn const_without_initializer_is_rejected() {
        let err = compile_source("const x;").unwrap_err();
        assert!(err.message.contains("must be initialized"));
    }

    #[test]
    fn assignment_to_const_is_rejected() {
        let err = compile_source("const x = 1; x = 2;").unwrap_err();
        assert!(err.message.contains("constant"));
    }

    #[test]
    fn duplicate_declaration_in_same_scope_is_rejected() {
        let err = compile_source("function f() { let a = 1; let a = 2; }").unwrap_err();
        assert!(err.message.contains("already declared"));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let err = compile_source("break;").unwrap_err();
        assert!(err.message.contains("break"));
        let err = compile_source("continue;").unwrap_err();
        assert!(err.message.contains("continue"));
    }

    #[test]
    fn await_outside_async_function_is_rejected() {
        let err = compile_source("function f() { return await g(); }").unwrap_err();
        assert!(err.message.contains("async"));
    }

    #[test]
    fn var_hoists_to_function_scope_not_block_scope() {
        // `var` in a block inside a function is a function-scoped local;
        // redeclaring it at function depth collides.
        let err = compile_source("function f() { { var a = 1; } var a = 2; }").unwrap_err();
        assert!(err.message.contains("already declared"));
        // let in a block does not collide with an outer let
        assert!(compile_source("function f() { let a = 1; { let a = 2; } }").is_ok());
    }

    #[test]
    fn class_fields_compile_to_thunks_and_property_ops() {
        let module = compile_source(
            "class Point { var x = 1; protected var y = 2; getX() { return this.x; } }",
        )
        .unwrap();
        let code = entry_code(&module);
        assert!(code.iter().any(|i| i.op == Op::NewClass));
        assert!(code.iter().any(|i| i.op == Op::CreateClassPublicPropertyVar));
        assert!(code.iter().any(|i| i.op == Op::CreateClassProtectedPropertyVar));
        assert!(code.iter().any(|i| i.op == Op::CreateClassPublicMethod));
        // Field thunks land in the module constant pool
        let thunks = module
            .constants
            .iter()
            .filter(|value| matches!(value, Value::FunctionRef(f) if f.arity == 0))
            .count();
        assert!(thunks >= 2, "two field thunks plus the default constructor");
    }

    #[test]
    fn method_body_rewrites_bare_field_references() {
        let module = compile_source(
            "class Counter { var count = 0; bump() { count = count + 1; return count; } }",
        )
        .unwrap();
        let bump = module
            .chunks
            .iter()
            .find(|chunk| chunk.name == "bump")
            .expect("bump chunk");
        assert!(bump.code.iter().any(|i| i.op == Op::LoadThisProperty));
        assert!(bump.code.iter().any(|i| i.op == Op::StoreThisProperty));
    }

    #[test]
    fn derived_constructor_gains_implicit_super_call() {
        let module = compile_source(
            "class A {} class B extends A { constructor() { let x = 1; } }",
        )
        .unwrap();
        let ctor = module
            .chunks
            .iter()
            .filter(|chunk| chunk.name == "constructor")
            .collect::<Vec<_>>();
        // B's explicit constructor must contain a SuperCall even though the
        // source has none.
        assert!(ctor
            .iter()
            .any(|chunk| chunk.code.iter().any(|i| i.op == Op::SuperCall)));
    }

    #[test]
    fn arguments_are_staged_before_pushing() {
        // f(1, g(2)): the inner call must drain its own argument before the
        // outer call's arguments are pushed.
        let module = compile_source("f(1, g(2));").unwrap();
        let code = entry_code(&module);
        let pushes: Vec<usize> = code
            .iter()
            .enumerate()
            .filter(|(_, i)| i.op == Op::PushArg)
            .map(|(index, _)| index)
            .collect();
        let calls: Vec<usize> = code
            .iter()
            .enumerate()
            .filter(|(_, i)| i.op == Op::Call)
            .map(|(index, _)| index)
            .collect();
        assert_eq!(pushes.len(), 3);
        assert_eq!(calls.len(), 2);
        // Inner call (g) happens before the outer call's first push
        assert!(calls[0] > pushes[0] && calls[0] < pushes[1]);
        assert!(calls[1] > pushes[2]);
    }

    #[test]
    fn switch_cases_fall_through_without_break() {
        let module = compile_source(
            "switch (x) { case 1: a(); case 2: b(); break; default: c(); }",
        )
        .unwrap();
        let code = entry_code(&module);
        assert!(code.iter().filter(|i| i.op == Op::Equal).count() == 2);
    }
}
