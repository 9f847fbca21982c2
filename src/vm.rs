// File: src/vm.rs
//
// Register virtual machine for Ardan bytecode. Executes chunks with per-frame
// register files, a shared argument stack, a try stack for exception
// unwinding, a context stack for global bindings, and a cooperative event
// loop for async/await. One interpreter thread owns all script state.

use crate::builtins;
use crate::bytecode::{Instruction, Op};
use crate::errors::ArdanError;
use crate::module::{Chunk, Module};
use crate::runtime::environment::{Env, ExecutionContext};
use crate::runtime::event_loop::{EventLoop, Task, Waker};
use crate::runtime::object::{Array, Class, Modifiers, Object, SlotKind, CONSTRUCTOR};
use crate::runtime::promise::{Awaiter, Promise, PromiseState, Reaction};
use crate::runtime::value::{Closure, Upvalue, Value, VmError, VmResult};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

const REGISTER_FILE: usize = 256;

/// One activation of a chunk
pub struct CallFrame {
    pub id: u64,
    pub chunk: Rc<Chunk>,
    pub ip: usize,
    pub registers: Vec<Value>,
    pub args: Vec<Value>,
    pub closure: Option<Rc<RefCell<Closure>>>,
    pub ctx: ExecutionContext,
    /// Settled with the frame's result when the frame belongs to an async call
    pub result_promise: Option<Rc<RefCell<Promise>>>,
    /// Context-stack depth below this frame's own contexts
    ctx_base: usize,
}

/// A suspended frame captured at an await point
pub struct FrameSnapshot {
    pub frame: CallFrame,
    try_frames: Vec<TryFrame>,
    /// The frame's slice of the context stack, including lexical
    /// environments pushed inside it
    contexts: Vec<ExecutionContext>,
}

/// Runtime record of an active try region (or a resume marker pushed during
/// unwinding so a trailing finally still runs)
#[derive(Clone)]
pub struct TryFrame {
    frame_id: u64,
    catch_ip: Option<usize>,
    finally_ip: Option<usize>,
    catch_reg: u8,
    pending: Option<Value>,
    is_resume: bool,
}

enum Flow {
    Continue,
    Return(Value),
    Suspend,
}

enum FrameOutcome {
    Completed(Value),
    Suspended,
}

pub struct Vm {
    chunks: Vec<Rc<Chunk>>,
    module_constants: Vec<Value>,
    frames: Vec<CallFrame>,
    try_stack: Vec<TryFrame>,
    arg_stack: VecDeque<Value>,
    context_stack: Vec<ExecutionContext>,
    root_ctx: ExecutionContext,
    open_upvalues: Vec<(u64, u8, Rc<RefCell<Upvalue>>)>,
    event_loop: EventLoop,
    next_frame_id: u64,
    /// Lines produced by `print`/`console.log`, kept for embedding and tests
    pub printed: Vec<String>,
    trace: bool,
}

impl Vm {
    pub fn new() -> Self {
        let root_ctx = ExecutionContext::root();
        let mut vm = Self {
            chunks: Vec::new(),
            module_constants: Vec::new(),
            frames: Vec::new(),
            try_stack: Vec::new(),
            arg_stack: VecDeque::new(),
            context_stack: vec![root_ctx.clone()],
            root_ctx,
            open_upvalues: Vec::new(),
            event_loop: EventLoop::new(),
            next_frame_id: 0,
            printed: Vec::new(),
            trace: std::env::var("ARDAN_DEBUG_BYTECODE").is_ok(),
        };
        builtins::install(&mut vm);
        vm
    }

    /// Handle for waking the loop from another thread
    pub fn waker(&self) -> Waker {
        self.event_loop.waker()
    }

    pub fn stop(&mut self) {
        self.event_loop.stop();
    }

    /// Register a host binding in the root environment
    pub fn define_global(&mut self, name: &str, value: Value) {
        self.root_ctx.variable_env.borrow_mut().set_var(name, value);
    }

    fn load_module(&mut self, module: &Module) {
        self.chunks = module.chunks.iter().map(|chunk| Rc::new(chunk.clone())).collect();
        self.module_constants = module.constants.clone();
    }

    /// Run a module's entry chunk to completion, then drain the event loop.
    pub fn interpret(&mut self, module: &Module) -> Result<Value, ArdanError> {
        self.interpret_with_args(module, Vec::new())
    }

    pub fn interpret_with_args(
        &mut self,
        module: &Module,
        args: Vec<Value>,
    ) -> Result<Value, ArdanError> {
        self.load_module(module);
        let entry = module.entry_chunk_index as usize;
        let chunk = self
            .chunks
            .get(entry)
            .cloned()
            .ok_or_else(|| ArdanError::bad_file("Entry chunk index out of range".to_string()))?;

        // Top-level bindings live in the root environments so they survive
        // across repeated interpret calls (the REPL relies on this).
        let script_ctx = self.root_ctx.clone();
        self.push_frame(chunk, args, None, script_ctx, None);
        let result = match self.run_top_frame() {
            Ok(FrameOutcome::Completed(value)) => {
                self.pop_frame();
                Ok(value)
            }
            Ok(FrameOutcome::Suspended) => Ok(Value::Undefined),
            Err(VmError::Thrown(value)) => {
                self.pop_frame();
                Err(ArdanError::runtime_error(format!(
                    "Uncaught exception: {}",
                    value.to_display_string()
                )))
            }
            Err(VmError::Fatal(error)) => {
                self.pop_frame();
                Err(error)
            }
        }?;

        self.run_event_loop();
        Ok(result)
    }

    // ---- frame management ----

    fn push_frame(
        &mut self,
        chunk: Rc<Chunk>,
        args: Vec<Value>,
        closure: Option<Rc<RefCell<Closure>>>,
        ctx: ExecutionContext,
        result_promise: Option<Rc<RefCell<Promise>>>,
    ) -> u64 {
        let id = self.next_frame_id;
        self.next_frame_id += 1;

        let mut registers = vec![Value::Undefined; REGISTER_FILE];
        // Arguments populate the leading parameter slots
        let arity = chunk.arity as usize;
        for (slot, value) in args.iter().take(arity).enumerate() {
            registers[slot] = value.clone();
        }

        let ctx_base = self.context_stack.len();
        self.context_stack.push(ctx.clone());
        self.frames.push(CallFrame {
            id,
            chunk,
            ip: 0,
            registers,
            args,
            closure,
            ctx,
            result_promise,
            ctx_base,
        });
        id
    }

    /// Pop the current frame: close its upvalues, drop its try frames, and
    /// unwind every context it pushed (including lexical environments an
    /// abrupt exit skipped).
    fn pop_frame(&mut self) -> Option<CallFrame> {
        let frame = self.frames.pop()?;
        self.close_frame_upvalues(frame.id, &frame);
        self.try_stack.retain(|tf| tf.frame_id != frame.id);
        self.context_stack.truncate(frame.ctx_base.max(1));
        Some(frame)
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("active call frame")
    }

    fn ctx(&self) -> &ExecutionContext {
        self.context_stack.last().expect("active execution context")
    }

    fn reg(&self, index: u8) -> Value {
        self.frame().registers[index as usize].clone()
    }

    fn set_reg(&mut self, index: u8, value: Value) {
        self.frame_mut().registers[index as usize] = value;
    }

    fn chunk_const(&self, index: u8) -> VmResult<Value> {
        self.frame()
            .chunk
            .constants
            .get(index as usize)
            .cloned()
            .ok_or_else(|| {
                VmError::Fatal(ArdanError::runtime_error(format!(
                    "Constant index {} out of range",
                    index
                )))
            })
    }

    fn const_name(&self, index: u8) -> VmResult<String> {
        Ok(self.chunk_const(index)?.to_display_string())
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, frame_id: u64, slot: u8) -> Rc<RefCell<Upvalue>> {
        if let Some((_, _, existing)) = self
            .open_upvalues
            .iter()
            .find(|(id, s, _)| *id == frame_id && *s == slot)
        {
            return Rc::clone(existing);
        }
        let upvalue = Rc::new(RefCell::new(Upvalue::Open { frame: frame_id, slot }));
        self.open_upvalues.push((frame_id, slot, Rc::clone(&upvalue)));
        upvalue
    }

    fn read_upvalue(&self, upvalue: &Rc<RefCell<Upvalue>>) -> VmResult<Value> {
        match &*upvalue.borrow() {
            Upvalue::Closed(value) => Ok(value.clone()),
            Upvalue::Open { frame, slot } => {
                let frame = self
                    .frames
                    .iter()
                    .rfind(|f| f.id == *frame)
                    .ok_or_else(|| {
                        VmError::Fatal(ArdanError::runtime_error(
                            "Open upvalue refers to a dead frame".to_string(),
                        ))
                    })?;
                Ok(frame.registers[*slot as usize].clone())
            }
        }
    }

    fn write_upvalue(&mut self, upvalue: &Rc<RefCell<Upvalue>>, value: Value) -> VmResult<()> {
        let location = upvalue.borrow().clone();
        match location {
            Upvalue::Closed(_) => {
                *upvalue.borrow_mut() = Upvalue::Closed(value);
                Ok(())
            }
            Upvalue::Open { frame, slot } => {
                let frame = self
                    .frames
                    .iter_mut()
                    .rfind(|f| f.id == frame)
                    .ok_or_else(|| {
                        VmError::Fatal(ArdanError::runtime_error(
                            "Open upvalue refers to a dead frame".to_string(),
                        ))
                    })?;
                frame.registers[slot as usize] = value;
                Ok(())
            }
        }
    }

    /// Close the open upvalue for one local slot of the current frame
    fn close_upvalue_slot(&mut self, slot: u8) {
        let frame_id = self.frame().id;
        let value = self.frame().registers[slot as usize].clone();
        self.open_upvalues.retain(|(id, s, upvalue)| {
            if *id == frame_id && *s == slot {
                *upvalue.borrow_mut() = Upvalue::Closed(value.clone());
                false
            } else {
                true
            }
        });
    }

    /// Close every open upvalue pointing into a departing frame
    fn close_frame_upvalues(&mut self, frame_id: u64, frame: &CallFrame) {
        self.open_upvalues.retain(|(id, slot, upvalue)| {
            if *id == frame_id {
                let value = frame.registers[*slot as usize].clone();
                *upvalue.borrow_mut() = Upvalue::Closed(value);
                false
            } else {
                true
            }
        });
    }

    // ---- dispatch loop ----

    fn run_top_frame(&mut self) -> VmResult<FrameOutcome> {
        loop {
            let frame = self.frame();
            if frame.ip >= frame.chunk.code.len() {
                return Ok(FrameOutcome::Completed(Value::Undefined));
            }
            let instruction = frame.chunk.code[frame.ip];
            if self.trace {
                eprintln!("[{}:{:04}] {}", frame.chunk.name, frame.ip, instruction);
            }
            self.frame_mut().ip += 1;

            match self.execute(instruction) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(value)) => return Ok(FrameOutcome::Completed(value)),
                Ok(Flow::Suspend) => return Ok(FrameOutcome::Suspended),
                Err(VmError::Thrown(value)) => self.handle_throw(value)?,
                Err(fatal) => return Err(fatal),
            }
        }
    }

    fn execute(&mut self, instruction: Instruction) -> VmResult<Flow> {
        let Instruction { op, a, b, c } = instruction;
        match op {
            Op::Nop | Op::UpvalueRef => {}

            Op::LoadConst => {
                let value = self.chunk_const(b)?;
                self.set_reg(a, value);
            }
            Op::Move => {
                let value = self.reg(b);
                self.set_reg(a, value);
            }

            // Arithmetic
            Op::Add => {
                let lhs = self.reg(b);
                let rhs = self.reg(c);
                let result = binary_add(&lhs, &rhs);
                self.set_reg(a, result);
            }
            Op::Subtract => self.numeric_binary(a, b, c, |x, y| x - y),
            Op::Multiply => self.numeric_binary(a, b, c, |x, y| x * y),
            Op::Divide => self.numeric_binary(a, b, c, |x, y| x / y),
            Op::Modulo => self.numeric_binary(a, b, c, |x, y| x % y),
            Op::Power => self.numeric_binary(a, b, c, f64::powf),

            // Bitwise: 32-bit integer semantics on the truncated number
            Op::ShiftLeft => self.int_binary(a, b, c, |x, y| x.wrapping_shl(y as u32 & 31)),
            Op::ShiftRight => self.int_binary(a, b, c, |x, y| x.wrapping_shr(y as u32 & 31)),
            Op::UnsignedShiftRight => {
                let lhs = to_uint32(self.reg(b).as_number());
                let rhs = to_uint32(self.reg(c).as_number());
                self.set_reg(a, Value::Number((lhs >> (rhs & 31)) as f64));
            }
            Op::BitAnd => self.int_binary(a, b, c, |x, y| x & y),
            Op::BitOr => self.int_binary(a, b, c, |x, y| x | y),
            Op::BitXor => self.int_binary(a, b, c, |x, y| x ^ y),

            // Logical and comparisons
            Op::LogicalAnd => {
                let result = self.reg(b).is_truthy() && self.reg(c).is_truthy();
                self.set_reg(a, Value::Boolean(result));
            }
            Op::LogicalOr => {
                let result = self.reg(b).is_truthy() || self.reg(c).is_truthy();
                self.set_reg(a, Value::Boolean(result));
            }
            Op::NullishCoalescing => {
                let lhs = self.reg(b);
                let result = if lhs.is_nullish() { self.reg(c) } else { lhs };
                self.set_reg(a, result);
            }
            Op::Equal => {
                let result = self.reg(b).loose_equals(&self.reg(c));
                self.set_reg(a, Value::Boolean(result));
            }
            Op::NotEqual => {
                let result = !self.reg(b).loose_equals(&self.reg(c));
                self.set_reg(a, Value::Boolean(result));
            }
            Op::StrictEqual => {
                let result = self.reg(b).strict_equals(&self.reg(c));
                self.set_reg(a, Value::Boolean(result));
            }
            Op::StrictNotEqual => {
                let result = !self.reg(b).strict_equals(&self.reg(c));
                self.set_reg(a, Value::Boolean(result));
            }
            Op::LessThan => self.compare(a, b, c, |x, y| x < y),
            Op::LessThanOrEqual => self.compare(a, b, c, |x, y| x <= y),
            Op::GreaterThan => self.compare(a, b, c, |x, y| x > y),
            Op::GreaterThanOrEqual => self.compare(a, b, c, |x, y| x >= y),
            Op::In => {
                let key = self.reg(b).to_display_string();
                let container = self.reg(c);
                let result = match &container {
                    Value::Object(obj) => obj.borrow().has_property(&key),
                    Value::Array(arr) => {
                        let arr = arr.borrow();
                        arr.object.lookup(&key).is_some()
                            || key.parse::<usize>().map(|i| i < arr.len()).unwrap_or(false)
                    }
                    Value::Class(class) => class.borrow().has_member(&key),
                    _ => false,
                };
                self.set_reg(a, Value::Boolean(result));
            }
            Op::InstanceOf => {
                let value = self.reg(b);
                let Value::Class(expected) = self.reg(c) else {
                    return Err(VmError::thrown(
                        "Right-hand side of 'instanceof' is not a class",
                    ));
                };
                let result = match &value {
                    Value::Object(obj) => obj
                        .borrow()
                        .class_of()
                        .map(|class| Class::derives_from(&class, &expected))
                        .unwrap_or(false),
                    _ => false,
                };
                self.set_reg(a, Value::Boolean(result));
            }

            // Unary
            Op::TypeOf => {
                let name = self.reg(a).type_of();
                self.set_reg(a, Value::str(name));
            }
            Op::Void => self.set_reg(a, Value::Undefined),
            Op::LogicalNot => {
                let result = !self.reg(a).is_truthy();
                self.set_reg(a, Value::Boolean(result));
            }
            Op::Negate => {
                let result = -self.reg(a).as_number();
                self.set_reg(a, Value::Number(result));
            }
            Op::Delete => {
                let target = self.reg(b);
                let key = self.reg(c).to_display_string();
                let result = match &target {
                    Value::Object(obj) => obj.borrow_mut().delete(&key),
                    Value::Array(arr) => arr.borrow_mut().object.delete(&key),
                    _ => false,
                };
                self.set_reg(a, Value::Boolean(result));
            }
            Op::Increment => {
                let result = self.reg(a).as_number() + self.reg(b).as_number();
                self.set_reg(a, Value::Number(result));
            }
            Op::Decrement => {
                let result = self.reg(a).as_number() - self.reg(b).as_number();
                self.set_reg(a, Value::Number(result));
            }

            // Jumps
            Op::Jump => {
                self.frame_mut().ip += instruction.offset_ab();
            }
            Op::JumpIfFalse => {
                if !self.reg(a).is_truthy() {
                    self.frame_mut().ip += instruction.offset_bc();
                }
            }
            Op::Loop => {
                self.frame_mut().ip -= instruction.offset_ab();
            }

            // Calls
            Op::PushArg => {
                let value = self.reg(a);
                self.arg_stack.push_back(value);
            }
            Op::PushSpreadArg => {
                let Value::Array(arr) = self.reg(a) else {
                    return Err(VmError::thrown("Spread argument is not an array"));
                };
                for value in arr.borrow().values() {
                    self.arg_stack.push_back(value);
                }
            }
            Op::Call => {
                let callee = self.reg(b);
                let args: Vec<Value> = self.arg_stack.drain(..).collect();
                let result = self.call_function(&callee, args)?;
                self.set_reg(a, result);
            }
            Op::SuperCall => {
                let parent = self.reg(b);
                let args: Vec<Value> = self.arg_stack.drain(..).collect();
                if let Value::Object(_) = &parent {
                    let ctor = self.get_property(&parent, CONSTRUCTOR)?;
                    if !matches!(ctor, Value::Undefined) {
                        self.call_function(&ctor, args)?;
                    }
                }
                self.set_reg(a, parent);
            }
            Op::Return => {
                let value = self.reg(a);
                return Ok(Flow::Return(value));
            }

            // Arguments protocol
            Op::LoadArgument => {
                let index = self.reg(a).as_number() as usize;
                let value = self.frame().args.get(index).cloned().unwrap_or(Value::Undefined);
                self.set_reg(a, value);
            }
            Op::LoadArguments => {
                let values = self.frame().args.clone();
                self.set_reg(a, Value::array(Array::from_values(values)));
            }
            Op::Slice => {
                let Value::Array(arr) = self.reg(a) else {
                    return Err(VmError::thrown("slice target is not an array"));
                };
                let start = self.reg(b).as_number().max(0.0) as usize;
                let values = arr.borrow().values();
                let rest = values.into_iter().skip(start).collect();
                self.set_reg(a, Value::array(Array::from_values(rest)));
            }
            Op::LoadArgumentsLength => {
                let count = self
                    .frame()
                    .args
                    .iter()
                    .filter(|value| !matches!(value, Value::Undefined))
                    .count();
                self.set_reg(a, Value::Number(count as f64));
            }

            // Closures
            Op::CreateClosure => {
                self.create_closure(a, c != 0)?;
            }
            Op::LoadUpvalue => {
                let upvalue = self.closure_upvalue(b)?;
                let value = self.read_upvalue(&upvalue)?;
                self.set_reg(a, value);
            }
            Op::StoreUpvalueVar | Op::StoreUpvalueLet => {
                let upvalue = self.closure_upvalue(a)?;
                let value = self.reg(b);
                self.write_upvalue(&upvalue, value)?;
            }
            Op::StoreUpvalueConst => {
                return Err(VmError::thrown("Cannot assign to a captured constant"));
            }
            Op::CloseUpvalue => self.close_upvalue_slot(a),

            // Locals: slots are registers, binding kinds are resolved at
            // compile time
            Op::CreateLocalVar | Op::CreateLocalLet | Op::CreateLocalConst => {
                let value = self.reg(b);
                self.set_reg(a, value);
            }
            Op::LoadLocalVar => {
                let value = self.reg(b);
                self.set_reg(a, value);
            }
            Op::StoreLocalVar | Op::StoreLocalLet => {
                let value = self.reg(b);
                self.set_reg(a, value);
            }

            // Globals
            Op::CreateGlobalVar => {
                let name = self.const_name(a)?;
                let value = self.reg(b);
                self.ctx().variable_env.borrow_mut().set_var(&name, value);
            }
            Op::CreateGlobalLet => {
                let name = self.const_name(a)?;
                let value = self.reg(b);
                self.ctx().lexical_env.borrow_mut().set_let(&name, value);
            }
            Op::CreateGlobalConst => {
                let name = self.const_name(a)?;
                let value = self.reg(b);
                self.ctx().lexical_env.borrow_mut().set_const(&name, value);
            }
            Op::LoadGlobalVar => {
                let name = self.const_name(b)?;
                let value = self.ctx().get(&name).ok_or_else(|| {
                    VmError::thrown(format!("Variable '{}' is not defined", name))
                })?;
                self.set_reg(a, value);
            }
            Op::StoreGlobalVar | Op::StoreGlobalLet => {
                let name = self.const_name(a)?;
                let value = self.reg(b);
                if !self.ctx().assign(&name, value.clone())? {
                    // Unseen name: created in the root variable environment
                    self.root_ctx.variable_env.borrow_mut().set_var(&name, value);
                }
            }

            // Objects & arrays
            Op::NewObject => self.set_reg(a, Value::object(Object::new())),
            Op::CreateObjectLiteral => self.set_reg(a, Value::object(Object::literal())),
            Op::CreateObjectLiteralProperty => {
                let name = self.const_name(b)?;
                let value = self.reg(c);
                let Value::Object(obj) = self.reg(a) else {
                    return Err(VmError::thrown("Property target is not an object"));
                };
                // Shorthand methods bind the literal as their receiver
                let value = match &value {
                    Value::Closure(closure) => {
                        Value::closure(closure.borrow().rebind(Rc::clone(&obj)))
                    }
                    _ => value,
                };
                obj.borrow_mut().define(&name, value, SlotKind::Var, Modifiers::public());
            }
            Op::NewArray => self.set_reg(a, Value::array(Array::new())),
            Op::ArrayPush => {
                let value = self.reg(b);
                let Value::Array(arr) = self.reg(a) else {
                    return Err(VmError::thrown("Push target is not an array"));
                };
                arr.borrow_mut().push(value);
            }
            Op::ArraySpread => {
                let Value::Array(target) = self.reg(a) else {
                    return Err(VmError::thrown("Spread target is not an array"));
                };
                let Value::Array(source) = self.reg(b) else {
                    return Err(VmError::thrown("Spread source is not an array"));
                };
                let values = source.borrow().values();
                let mut target = target.borrow_mut();
                for value in values {
                    target.push(value);
                }
            }
            Op::ObjectSpread => {
                let target = self.reg(a);
                let Value::Object(source) = self.reg(b) else {
                    return Err(VmError::thrown("Spread source is not an object"));
                };
                let properties = source.borrow().all_properties();
                for (name, value) in properties {
                    self.set_property(&target, &name, value)?;
                }
            }
            Op::SetProperty => {
                let target = self.reg(a);
                let name = self.const_name(b)?;
                let value = self.reg(c);
                self.set_property(&target, &name, value)?;
            }
            Op::GetProperty => {
                let target = self.reg(b);
                let name = self.const_name(c)?;
                let value = self.get_property(&target, &name)?;
                self.set_reg(a, value);
            }
            Op::SetPropertyDynamic => {
                let target = self.reg(a);
                let name = self.reg(b).to_display_string();
                let value = self.reg(c);
                self.set_property(&target, &name, value)?;
            }
            Op::GetPropertyDynamic => {
                let target = self.reg(b);
                let name = self.reg(c).to_display_string();
                let value = self.get_property(&target, &name)?;
                self.set_reg(a, value);
            }
            Op::GetObjectLength => {
                let value = match self.reg(b) {
                    Value::Array(arr) => Value::Number(arr.borrow().len() as f64),
                    Value::Object(obj) => Value::Number(obj.borrow().property_count() as f64),
                    Value::Class(class) => {
                        Value::Number(class.borrow().static_keys().len() as f64)
                    }
                    Value::Str(s) => Value::Number(s.chars().count() as f64),
                    Value::Number(n) => Value::Number(n),
                    _ => Value::Number(0.0),
                };
                self.set_reg(a, value);
            }
            Op::EnumKeys => {
                let keys = match self.reg(b) {
                    Value::Object(obj) => obj.borrow().keys(),
                    Value::Array(arr) => arr.borrow().keys(),
                    Value::Class(class) => class.borrow().static_keys(),
                    _ => Vec::new(),
                };
                let keys = keys.into_iter().map(Value::str).collect();
                self.set_reg(a, Value::array(Array::from_values(keys)));
            }

            // Classes
            Op::NewClass => {
                let superclass = self.reg(a);
                let name = self.const_name(c)?;
                let mut class = Class::new(&name);
                if let Value::Class(parent) = superclass {
                    class.super_class = Some(parent);
                }
                self.set_reg(a, Value::Class(Rc::new(RefCell::new(class))));
            }
            Op::CreateClassPublicPropertyVar => self.class_proto_prop(a, b, c, Modifiers::public(), SlotKind::Var)?,
            Op::CreateClassPrivatePropertyVar => self.class_proto_prop(a, b, c, Modifiers::private(), SlotKind::Var)?,
            Op::CreateClassProtectedPropertyVar => self.class_proto_prop(a, b, c, Modifiers::protected(), SlotKind::Var)?,
            Op::CreateClassPublicPropertyConst => self.class_proto_prop(a, b, c, Modifiers::public(), SlotKind::Const)?,
            Op::CreateClassPrivatePropertyConst => self.class_proto_prop(a, b, c, Modifiers::private(), SlotKind::Const)?,
            Op::CreateClassProtectedPropertyConst => self.class_proto_prop(a, b, c, Modifiers::protected(), SlotKind::Const)?,
            Op::CreateClassPublicStaticPropertyVar => self.class_static_prop(a, b, c, Modifiers::public(), SlotKind::Var)?,
            Op::CreateClassPrivateStaticPropertyVar => self.class_static_prop(a, b, c, Modifiers::private(), SlotKind::Var)?,
            Op::CreateClassProtectedStaticPropertyVar => self.class_static_prop(a, b, c, Modifiers::protected(), SlotKind::Var)?,
            Op::CreateClassPublicStaticPropertyConst => self.class_static_prop(a, b, c, Modifiers::public(), SlotKind::Const)?,
            Op::CreateClassPrivateStaticPropertyConst => self.class_static_prop(a, b, c, Modifiers::private(), SlotKind::Const)?,
            Op::CreateClassProtectedStaticPropertyConst => self.class_static_prop(a, b, c, Modifiers::protected(), SlotKind::Const)?,
            Op::CreateClassPublicMethod => self.class_proto_prop(a, b, c, Modifiers::public(), SlotKind::Var)?,
            Op::CreateClassPrivateMethod => self.class_proto_prop(a, b, c, Modifiers::private(), SlotKind::Var)?,
            Op::CreateClassProtectedMethod => self.class_proto_prop(a, b, c, Modifiers::protected(), SlotKind::Var)?,
            Op::CreateClassPublicStaticMethod => self.class_static_prop(a, b, c, Modifiers::public(), SlotKind::Var)?,
            Op::CreateClassPrivateStaticMethod => self.class_static_prop(a, b, c, Modifiers::private(), SlotKind::Var)?,
            Op::CreateClassProtectedStaticMethod => self.class_static_prop(a, b, c, Modifiers::protected(), SlotKind::Var)?,

            Op::CreateInstance => {
                let Value::Class(class) = self.reg(a) else {
                    return Err(VmError::thrown("'new' target is not a class"));
                };
                let instance = self.instantiate(&class)?;
                self.set_reg(a, Value::Object(instance));
            }
            Op::InvokeConstructor => {
                let target = self.reg(a);
                let args: Vec<Value> = self.arg_stack.drain(..).collect();
                let ctor = self.get_property(&target, CONSTRUCTOR)?;
                if !matches!(ctor, Value::Undefined) {
                    self.call_function(&ctor, args)?;
                }
            }

            // this / super
            Op::GetThis => {
                let this = self.bound_this();
                let value = match this {
                    Some(obj) => Value::Object(obj),
                    None => Value::Undefined,
                };
                self.set_reg(a, value);
            }
            Op::LoadThisProperty => {
                let name = self.const_name(b)?;
                let Some(this) = self.bound_this() else {
                    return Err(VmError::thrown(format!(
                        "Cannot read '{}': no bound 'this' in this context",
                        name
                    )));
                };
                let value = self.get_property(&Value::Object(this), &name)?;
                self.set_reg(a, value);
            }
            Op::StoreThisProperty => {
                let name = self.const_name(a)?;
                let value = self.reg(b);
                let Some(this) = self.bound_this() else {
                    return Err(VmError::thrown(format!(
                        "Cannot set '{}': no bound 'this' in this context",
                        name
                    )));
                };
                self.set_property(&Value::Object(this), &name, value)?;
            }
            Op::GetParentObject => {
                let parent = self
                    .bound_this()
                    .and_then(|obj| obj.borrow().parent_object.clone());
                let value = match parent {
                    Some(obj) => Value::Object(obj),
                    None => Value::Undefined,
                };
                self.set_reg(a, value);
            }

            // Exceptions
            Op::Try => {
                let base = self.frame().ip;
                let frame_id = self.frame().id;
                self.try_stack.push(TryFrame {
                    frame_id,
                    catch_ip: if a == 0 { None } else { Some(base + a as usize) },
                    finally_ip: if b == 0 { None } else { Some(base + b as usize) },
                    catch_reg: c,
                    pending: None,
                    is_resume: false,
                });
            }
            Op::EndTry => {
                let frame_id = self.frame().id;
                match self.try_stack.last() {
                    Some(top) if top.frame_id == frame_id => {
                        self.try_stack.pop();
                    }
                    _ => {
                        return Err(VmError::Fatal(ArdanError::runtime_error(
                            "Unmatched EndTry".to_string(),
                        )))
                    }
                }
            }
            Op::EndFinally => {
                let frame_id = self.frame().id;
                let is_resume = matches!(
                    self.try_stack.last(),
                    Some(top) if top.frame_id == frame_id && top.is_resume
                );
                if is_resume {
                    let marker = self.try_stack.pop().expect("resume marker");
                    if let Some(pending) = marker.pending {
                        // Finally finished while unwinding: re-raise outward
                        return Err(VmError::Thrown(pending));
                    }
                }
            }
            Op::Throw => {
                let value = self.reg(a);
                return Err(VmError::Thrown(value));
            }
            Op::LoadExceptionValue => {
                let value = self.reg(a);
                let name = self.const_name(b)?;
                self.ctx().lexical_env.borrow_mut().set_let(&name, value);
            }

            // Async & environments
            Op::CreatePromise => {
                let value = self.reg(a);
                self.set_reg(b, Value::Promise(Promise::resolved(value)));
            }
            Op::Await => {
                return self.await_value(a, b);
            }
            Op::SetExecutionContext => {
                let Value::Closure(closure) = self.reg(a) else {
                    return Err(VmError::Fatal(ArdanError::runtime_error(
                        "SetExecutionContext target is not a closure".to_string(),
                    )));
                };
                closure.borrow_mut().ctx = Some(self.ctx().clone());
            }
            Op::PushLexicalEnv => {
                let current = self.ctx().clone();
                let ctx = ExecutionContext {
                    lexical_env: Env::with_parent(current.lexical_env),
                    variable_env: current.variable_env,
                };
                self.context_stack.push(ctx);
            }
            Op::PopLexicalEnv => {
                // Never pop below the current frame's own context
                if self.context_stack.len() > self.frame().ctx_base + 1 {
                    self.context_stack.pop();
                }
            }

            Op::Halt => return Ok(Flow::Return(Value::Undefined)),
        }
        Ok(Flow::Continue)
    }

    fn numeric_binary(&mut self, a: u8, b: u8, c: u8, f: impl Fn(f64, f64) -> f64) {
        let result = f(self.reg(b).as_number(), self.reg(c).as_number());
        self.set_reg(a, Value::Number(result));
    }

    fn int_binary(&mut self, a: u8, b: u8, c: u8, f: impl Fn(i32, i32) -> i32) {
        let lhs = to_int32(self.reg(b).as_number());
        let rhs = to_int32(self.reg(c).as_number());
        self.set_reg(a, Value::Number(f(lhs, rhs) as f64));
    }

    fn compare(&mut self, a: u8, b: u8, c: u8, f: impl Fn(f64, f64) -> bool) {
        let result = f(self.reg(b).as_number(), self.reg(c).as_number());
        self.set_reg(a, Value::Boolean(result));
    }

    fn bound_this(&self) -> Option<Rc<RefCell<Object>>> {
        self.frame()
            .closure
            .as_ref()
            .and_then(|closure| closure.borrow().this_object.clone())
    }

    fn closure_upvalue(&self, index: u8) -> VmResult<Rc<RefCell<Upvalue>>> {
        let closure = self.frame().closure.as_ref().ok_or_else(|| {
            VmError::Fatal(ArdanError::runtime_error(
                "Upvalue access outside a closure frame".to_string(),
            ))
        })?;
        let closure = closure.borrow();
        closure.upvalues.get(index as usize).cloned().ok_or_else(|| {
            VmError::Fatal(ArdanError::runtime_error(format!(
                "Upvalue index {} out of range",
                index
            )))
        })
    }

    /// CreateClosure: the register holds a module-constant index of a
    /// FunctionRef; trailing UpvalueRef descriptors are consumed here.
    fn create_closure(&mut self, reg: u8, bind_this: bool) -> VmResult<()> {
        let index = self.reg(reg).as_number() as usize;
        let Some(Value::FunctionRef(fn_ref)) = self.module_constants.get(index).cloned() else {
            return Err(VmError::Fatal(ArdanError::runtime_error(format!(
                "Module constant {} is not a function reference",
                index
            ))));
        };

        let mut closure = Closure::new(Rc::clone(&fn_ref));
        let frame_id = self.frame().id;
        for _ in 0..fn_ref.upvalues_size {
            let frame = self.frame();
            let descriptor = frame.chunk.code.get(frame.ip).copied().ok_or_else(|| {
                VmError::Fatal(ArdanError::runtime_error(
                    "Truncated upvalue descriptor list".to_string(),
                ))
            })?;
            if descriptor.op != Op::UpvalueRef {
                return Err(VmError::Fatal(ArdanError::runtime_error(
                    "Malformed upvalue descriptor list".to_string(),
                )));
            }
            self.frame_mut().ip += 1;

            if descriptor.a != 0 {
                closure.upvalues.push(self.capture_upvalue(frame_id, descriptor.b));
            } else {
                let parent = self.closure_upvalue(descriptor.b)?;
                closure.upvalues.push(parent);
            }
        }

        if bind_this {
            closure.this_object = self.bound_this();
        }
        self.set_reg(reg, Value::closure(closure));
        Ok(())
    }

    // ---- exceptions ----

    /// Unwind the try stack of the current frame; Err when the exception
    /// leaves the frame entirely.
    fn handle_throw(&mut self, value: Value) -> VmResult<()> {
        let frame_id = self.frame().id;
        loop {
            let belongs = matches!(self.try_stack.last(), Some(top) if top.frame_id == frame_id);
            if !belongs {
                return Err(VmError::Thrown(value));
            }
            let top = self.try_stack.pop().expect("try frame");

            if let Some(catch_ip) = top.catch_ip {
                self.set_reg(top.catch_reg, value);
                if top.finally_ip.is_some() {
                    // After the catch body, the trailing finally still runs
                    self.try_stack.push(TryFrame {
                        frame_id,
                        catch_ip: None,
                        finally_ip: top.finally_ip,
                        catch_reg: top.catch_reg,
                        pending: None,
                        is_resume: true,
                    });
                }
                self.frame_mut().ip = catch_ip;
                return Ok(());
            }

            if let Some(finally_ip) = top.finally_ip {
                // Run the finally with the throw pending; EndFinally re-raises
                self.try_stack.push(TryFrame {
                    frame_id,
                    catch_ip: None,
                    finally_ip: None,
                    catch_reg: top.catch_reg,
                    pending: Some(value.clone()),
                    is_resume: true,
                });
                self.frame_mut().ip = finally_ip;
                return Ok(());
            }
            // A bare resume marker: keep unwinding
        }
    }

    // ---- calls ----

    pub fn call_function(&mut self, callee: &Value, args: Vec<Value>) -> VmResult<Value> {
        match callee {
            Value::Native(native) => (native.func.clone())(self, &args),
            Value::Closure(closure) => self.call_closure(Rc::clone(closure), args),
            Value::FunctionRef(fn_ref) => {
                let mut closure = Closure::new(Rc::clone(fn_ref));
                closure.ctx = Some(self.ctx().clone());
                self.call_closure(Rc::new(RefCell::new(closure)), args)
            }
            Value::Class(class) => Err(VmError::thrown(format!(
                "Class '{}' must be called with 'new'",
                class.borrow().name
            ))),
            other => Err(VmError::thrown(format!(
                "Called a non-callable value of type {}",
                other.type_of()
            ))),
        }
    }

    fn call_closure(
        &mut self,
        closure: Rc<RefCell<Closure>>,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let (fn_ref, parent_ctx) = {
            let borrowed = closure.borrow();
            (Rc::clone(&borrowed.fn_ref), borrowed.ctx.clone())
        };
        let chunk = self
            .chunks
            .get(fn_ref.chunk_index as usize)
            .cloned()
            .ok_or_else(|| {
                VmError::Fatal(ArdanError::runtime_error(format!(
                    "Chunk index {} out of range",
                    fn_ref.chunk_index
                )))
            })?;

        let call_ctx = parent_ctx.unwrap_or_else(|| self.root_ctx.clone()).child();
        let result_promise = if fn_ref.is_async { Some(Promise::new()) } else { None };

        self.push_frame(chunk, args, Some(closure), call_ctx, result_promise.clone());
        let outcome = self.run_top_frame();

        match outcome {
            Ok(FrameOutcome::Completed(value)) => {
                self.pop_frame();
                match result_promise {
                    Some(promise) => {
                        self.resolve_promise(&promise, value);
                        Ok(Value::Promise(promise))
                    }
                    None => Ok(value),
                }
            }
            Ok(FrameOutcome::Suspended) => {
                // The await arm already moved the frame into its snapshot
                match result_promise {
                    Some(promise) => Ok(Value::Promise(promise)),
                    None => Ok(Value::Undefined),
                }
            }
            Err(VmError::Thrown(reason)) => {
                self.pop_frame();
                match result_promise {
                    Some(promise) => {
                        // An uncaught throw inside an async body rejects its
                        // promise instead of unwinding the caller
                        self.reject_promise(&promise, reason);
                        Ok(Value::Promise(promise))
                    }
                    None => Err(VmError::Thrown(reason)),
                }
            }
            Err(fatal) => {
                self.pop_frame();
                Err(fatal)
            }
        }
    }

    // ---- instances ----

    fn instantiate(&mut self, class: &Rc<RefCell<Class>>) -> VmResult<Rc<RefCell<Object>>> {
        let instance = Rc::new(RefCell::new(Object::new()));
        instance.borrow_mut().class = Some(Rc::downgrade(class));

        let entries = class.borrow().proto_entries();
        for (name, slot, kind) in entries {
            match &slot.value {
                // Methods are rebound to the new instance
                Value::Closure(method) => {
                    let bound = Value::closure(method.borrow().rebind(Rc::clone(&instance)));
                    instance.borrow_mut().define(&name, bound, kind, slot.modifiers);
                }
                // Plain fields defer to their initialiser thunk
                Value::Number(index) => {
                    let thunk = self.field_thunk_closure(*index as usize, &instance)?;
                    let value = self.call_closure(thunk, Vec::new())?;
                    instance.borrow_mut().define(&name, value, kind, slot.modifiers);
                }
                other => {
                    instance.borrow_mut().define(&name, other.clone(), kind, slot.modifiers);
                }
            }
        }

        let super_class = class.borrow().super_class.clone();
        if let Some(super_class) = super_class {
            let parent = self.instantiate(&super_class)?;
            instance.borrow_mut().parent_object = Some(parent);
        }
        Ok(instance)
    }

    fn field_thunk_closure(
        &mut self,
        index: usize,
        instance: &Rc<RefCell<Object>>,
    ) -> VmResult<Rc<RefCell<Closure>>> {
        let Some(Value::FunctionRef(fn_ref)) = self.module_constants.get(index).cloned() else {
            return Err(VmError::Fatal(ArdanError::runtime_error(format!(
                "Field initializer constant {} is not a function reference",
                index
            ))));
        };
        let mut closure = Closure::new(fn_ref);
        closure.this_object = Some(Rc::clone(instance));
        closure.ctx = Some(self.ctx().clone());
        Ok(Rc::new(RefCell::new(closure)))
    }

    fn class_proto_prop(
        &mut self,
        class_reg: u8,
        value_reg: u8,
        name_reg: u8,
        modifiers: Modifiers,
        kind: SlotKind,
    ) -> VmResult<()> {
        let Value::Class(class) = self.reg(class_reg) else {
            return Err(VmError::thrown("Property target is not a class"));
        };
        let value = self.reg(value_reg);
        let name = self.reg(name_reg).to_display_string();
        match kind {
            SlotKind::Const => class.borrow_mut().set_proto_const(&name, value, modifiers),
            _ => class.borrow_mut().set_proto_var(&name, value, modifiers),
        }
        Ok(())
    }

    fn class_static_prop(
        &mut self,
        class_reg: u8,
        value_reg: u8,
        name_reg: u8,
        modifiers: Modifiers,
        kind: SlotKind,
    ) -> VmResult<()> {
        let Value::Class(class) = self.reg(class_reg) else {
            return Err(VmError::thrown("Property target is not a class"));
        };
        let value = self.reg(value_reg);
        let name = self.reg(name_reg).to_display_string();
        match kind {
            SlotKind::Const => class.borrow_mut().set_static_const(&name, value, modifiers),
            _ => class.borrow_mut().set_static_var(&name, value, modifiers),
        }
        Ok(())
    }

    // ---- property access & visibility ----

    /// Visibility enforcement against the currently bound receiver
    fn check_access(
        &self,
        name: &str,
        modifiers: Modifiers,
        owner: &Rc<RefCell<Object>>,
    ) -> VmResult<()> {
        if modifiers.private {
            let allowed = self
                .bound_this()
                .map(|this| Rc::ptr_eq(&this, owner))
                .unwrap_or(false);
            if !allowed {
                return Err(VmError::thrown(format!(
                    "Cannot access private property '{}' outside its class",
                    name
                )));
            }
        }
        if modifiers.protected {
            let owner_class = owner.borrow().class_of();
            let accessor_class = self.bound_this().and_then(|this| this.borrow().class_of());
            let allowed = match (accessor_class, owner_class) {
                (Some(accessor), Some(owner)) => Class::derives_from(&accessor, &owner),
                _ => false,
            };
            if !allowed {
                return Err(VmError::thrown(format!(
                    "Cannot access protected property '{}' outside its class or a subclass",
                    name
                )));
            }
        }
        Ok(())
    }

    fn check_static_access(
        &self,
        name: &str,
        modifiers: Modifiers,
        class: &Rc<RefCell<Class>>,
    ) -> VmResult<()> {
        if modifiers.private {
            let allowed = self
                .bound_this()
                .and_then(|this| this.borrow().class_of())
                .map(|accessor| Rc::ptr_eq(&accessor, class))
                .unwrap_or(false);
            if !allowed {
                return Err(VmError::thrown(format!(
                    "Cannot access private static property '{}' outside its class",
                    name
                )));
            }
        }
        if modifiers.protected {
            let allowed = self
                .bound_this()
                .and_then(|this| this.borrow().class_of())
                .map(|accessor| Class::derives_from(&accessor, class))
                .unwrap_or(false);
            if !allowed {
                return Err(VmError::thrown(format!(
                    "Cannot access protected static property '{}' outside its class or a subclass",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn get_property(&mut self, target: &Value, name: &str) -> VmResult<Value> {
        match target {
            Value::Object(obj) => {
                let mut cursor = Rc::clone(obj);
                loop {
                    let found = {
                        let borrowed = cursor.borrow();
                        borrowed.lookup(name).map(|slot| (slot.value.clone(), slot.modifiers))
                    };
                    if let Some((value, modifiers)) = found {
                        self.check_access(name, modifiers, &cursor)?;
                        return Ok(value);
                    }
                    let parent = cursor.borrow().parent_object.clone();
                    match parent {
                        Some(parent) => cursor = parent,
                        None => return Ok(Value::Undefined),
                    }
                }
            }
            Value::Array(arr) => {
                if let Some(method) = builtins::array_member(arr, name) {
                    return Ok(method);
                }
                Ok(arr.borrow().get(name))
            }
            Value::Class(class) => {
                let found = class.borrow().get_static(name);
                match found {
                    Some((value, modifiers)) => {
                        self.check_static_access(name, modifiers, class)?;
                        Ok(value)
                    }
                    None => Ok(Value::Undefined),
                }
            }
            Value::Promise(promise) => Ok(builtins::promise_member(promise, name)),
            Value::Str(s) => match name {
                "length" => Ok(Value::Number(s.chars().count() as f64)),
                _ => Ok(Value::Undefined),
            },
            Value::Null | Value::Undefined => Err(VmError::thrown(format!(
                "Cannot read property '{}' of {}",
                name,
                target.to_display_string()
            ))),
            _ => Ok(Value::Undefined),
        }
    }

    pub fn set_property(&mut self, target: &Value, name: &str, value: Value) -> VmResult<()> {
        match target {
            Value::Object(obj) => {
                // Assignment targets the object along the prototype chain
                // that owns the slot
                let mut cursor = Rc::clone(obj);
                loop {
                    let modifiers = cursor.borrow().modifiers_of(name);
                    if let Some(modifiers) = modifiers {
                        self.check_access(name, modifiers, &cursor)?;
                        return cursor.borrow_mut().assign(name, value);
                    }
                    let parent = cursor.borrow().parent_object.clone();
                    match parent {
                        Some(parent) => cursor = parent,
                        None => break,
                    }
                }
                // No slot anywhere: object literals create one
                obj.borrow_mut().assign(name, value)
            }
            Value::Array(arr) => {
                arr.borrow_mut().set(name, value);
                Ok(())
            }
            Value::Class(class) => {
                let existing = class.borrow().get_static(name);
                if let Some((_, modifiers)) = existing {
                    self.check_static_access(name, modifiers, class)?;
                    if class.borrow().static_const_props.contains_key(name) {
                        return Err(VmError::thrown(format!(
                            "Cannot assign to constant static property '{}'",
                            name
                        )));
                    }
                }
                let modifiers = existing.map(|(_, m)| m).unwrap_or_else(Modifiers::public);
                class.borrow_mut().set_static_var(name, value, modifiers);
                Ok(())
            }
            _ => Err(VmError::thrown(format!(
                "Cannot set property '{}' on a value of type {}",
                name,
                target.type_of()
            ))),
        }
    }

    // ---- async ----

    fn await_value(&mut self, promise_reg: u8, dest: u8) -> VmResult<Flow> {
        let awaited = self.reg(promise_reg);
        let promise = match awaited {
            Value::Promise(promise) => promise,
            // Awaiting a plain value resumes on the next turn with it
            other => Promise::resolved(other),
        };

        // Snapshot the current frame and leave the dispatch loop
        let frame = self.frames.pop().expect("awaiting frame");
        self.close_frame_upvalues(frame.id, &frame);
        let contexts = self.context_stack.split_off(frame.ctx_base.max(1));
        let frame_id = frame.id;
        let mut try_frames = Vec::new();
        self.try_stack.retain(|tf| {
            if tf.frame_id == frame_id {
                try_frames.push(tf.clone());
                false
            } else {
                true
            }
        });
        let snapshot = Box::new(FrameSnapshot { frame, try_frames, contexts });

        let state = promise.borrow().state();
        match state {
            PromiseState::Pending => {
                promise.borrow_mut().awaiters.push(Awaiter { snapshot, dest });
            }
            PromiseState::Resolved(value) => {
                self.event_loop.post(Task::ResumeFrame { snapshot, dest, value });
            }
            PromiseState::Rejected(reason) => {
                self.event_loop.post(Task::ResumeThrow { snapshot, reason });
            }
        }
        Ok(Flow::Suspend)
    }

    /// Settle a promise with a value, flattening a promise result
    pub fn resolve_promise(&mut self, promise: &Rc<RefCell<Promise>>, value: Value) {
        if let Value::Promise(inner) = &value {
            self.chain_promise(inner, promise);
            return;
        }
        let (reactions, awaiters) = promise.borrow_mut().settle_resolved(value.clone());
        for reaction in reactions {
            self.event_loop.post(Task::RunCallback {
                callback: reaction.callback.unwrap_or(Value::Undefined),
                args: vec![value.clone()],
                target: reaction.target,
            });
        }
        for awaiter in awaiters {
            self.event_loop.post(Task::ResumeFrame {
                snapshot: awaiter.snapshot,
                dest: awaiter.dest,
                value: value.clone(),
            });
        }
    }

    pub fn reject_promise(&mut self, promise: &Rc<RefCell<Promise>>, reason: Value) {
        let (reactions, awaiters) = promise.borrow_mut().settle_rejected(reason.clone());
        for reaction in reactions {
            match reaction.callback {
                Some(callback) => self.event_loop.post(Task::RunCallback {
                    callback,
                    args: vec![reason.clone()],
                    target: reaction.target,
                }),
                None => match reaction.target {
                    Some(target) => self
                        .event_loop
                        .post(Task::PropagateRejection { target, reason: reason.clone() }),
                    None => self.report_uncaught(&reason),
                },
            }
        }
        for awaiter in awaiters {
            self.event_loop.post(Task::ResumeThrow {
                snapshot: awaiter.snapshot,
                reason: reason.clone(),
            });
        }
    }

    /// Make `target` settle however `inner` settles
    fn chain_promise(&mut self, inner: &Rc<RefCell<Promise>>, target: &Rc<RefCell<Promise>>) {
        let state = inner.borrow().state();
        match state {
            PromiseState::Pending => {
                let mut borrowed = inner.borrow_mut();
                borrowed
                    .on_resolve
                    .push(Reaction { callback: None, target: Some(Rc::clone(target)) });
                borrowed
                    .on_reject
                    .push(Reaction { callback: None, target: Some(Rc::clone(target)) });
            }
            PromiseState::Resolved(value) => self.event_loop.post(Task::RunCallback {
                callback: Value::Undefined,
                args: vec![value],
                target: Some(Rc::clone(target)),
            }),
            PromiseState::Rejected(reason) => self
                .event_loop
                .post(Task::PropagateRejection { target: Rc::clone(target), reason }),
        }
    }

    /// Register a then/catch callback pair on a promise; already-settled
    /// promises schedule onto the loop rather than running synchronously.
    pub fn register_reaction(
        &mut self,
        promise: &Rc<RefCell<Promise>>,
        on_resolve: Option<Value>,
        on_reject: Option<Value>,
        target: Rc<RefCell<Promise>>,
    ) {
        let state = promise.borrow().state();
        match state {
            PromiseState::Pending => {
                let mut borrowed = promise.borrow_mut();
                borrowed
                    .on_resolve
                    .push(Reaction { callback: on_resolve, target: Some(Rc::clone(&target)) });
                borrowed
                    .on_reject
                    .push(Reaction { callback: on_reject, target: Some(target) });
            }
            PromiseState::Resolved(value) => self.event_loop.post(Task::RunCallback {
                callback: on_resolve.unwrap_or(Value::Undefined),
                args: vec![value],
                target: Some(target),
            }),
            PromiseState::Rejected(reason) => match on_reject {
                Some(callback) => self.event_loop.post(Task::RunCallback {
                    callback,
                    args: vec![reason],
                    target: Some(target),
                }),
                None => self.event_loop.post(Task::PropagateRejection { target, reason }),
            },
        }
    }

    fn report_uncaught(&mut self, reason: &Value) {
        eprintln!("Uncaught (in promise): {}", reason.to_display_string());
    }

    // ---- event loop driver ----

    /// Drain the task queue on the interpreter thread until idle or stopped
    pub fn run_event_loop(&mut self) {
        loop {
            if self.event_loop.is_stopped() {
                break;
            }
            if let Some(task) = self.event_loop.next_task() {
                self.execute_task(task);
                continue;
            }
            if let Some(injected) = self.event_loop.take_injected() {
                injected(self);
                continue;
            }
            break;
        }
    }

    fn execute_task(&mut self, task: Task) {
        match task {
            Task::ResumeFrame { snapshot, dest, value } => {
                self.resume_snapshot(*snapshot, Some((dest, value)), None);
            }
            Task::ResumeThrow { snapshot, reason } => {
                self.resume_snapshot(*snapshot, None, Some(reason));
            }
            Task::RunCallback { callback, args, target } => {
                let result = if matches!(callback, Value::Undefined) {
                    Ok(args.first().cloned().unwrap_or(Value::Undefined))
                } else {
                    self.call_function(&callback, args)
                };
                match result {
                    Ok(value) => {
                        if let Some(target) = target {
                            self.resolve_promise(&target, value);
                        }
                    }
                    Err(VmError::Thrown(reason)) => match target {
                        Some(target) => self.reject_promise(&target, reason),
                        None => self.report_uncaught(&reason),
                    },
                    Err(VmError::Fatal(error)) => {
                        eprintln!("{}", error);
                        self.event_loop.stop();
                    }
                }
            }
            Task::PropagateRejection { target, reason } => {
                self.reject_promise(&target, reason);
            }
        }
    }

    /// Re-enter a suspended frame, either delivering an awaited value or
    /// re-raising a rejection at the await point.
    fn resume_snapshot(
        &mut self,
        snapshot: FrameSnapshot,
        delivery: Option<(u8, Value)>,
        throw: Option<Value>,
    ) {
        let FrameSnapshot { mut frame, try_frames, contexts } = snapshot;
        let result_promise = frame.result_promise.clone();
        frame.ctx_base = self.context_stack.len();
        self.context_stack.extend(contexts);
        self.try_stack.extend(try_frames);
        self.frames.push(frame);

        if let Some((dest, value)) = delivery {
            self.set_reg(dest, value);
        }
        if let Some(reason) = throw {
            // A rejected awaited promise behaves as a throw at the await point
            if let Err(error) = self.handle_throw(reason) {
                self.finish_resumed(Err(error), result_promise);
                return;
            }
        }

        let outcome = self.run_top_frame();
        self.finish_resumed(outcome, result_promise);
    }

    fn finish_resumed(
        &mut self,
        outcome: VmResult<FrameOutcome>,
        result_promise: Option<Rc<RefCell<Promise>>>,
    ) {
        match outcome {
            Ok(FrameOutcome::Completed(value)) => {
                self.pop_frame();
                if let Some(promise) = result_promise {
                    self.resolve_promise(&promise, value);
                }
            }
            Ok(FrameOutcome::Suspended) => {}
            Err(VmError::Thrown(reason)) => {
                self.pop_frame();
                match result_promise {
                    Some(promise) => self.reject_promise(&promise, reason),
                    None => self.report_uncaught(&reason),
                }
            }
            Err(VmError::Fatal(error)) => {
                self.pop_frame();
                eprintln!("{}", error);
                self.event_loop.stop();
            }
        }
    }

    // ---- host output ----

    pub fn write_line(&mut self, line: String) {
        println!("{}", line);
        self.printed.push(line);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Addition: numeric unless either side is a string, then concatenation
fn binary_add(lhs: &Value, rhs: &Value) -> Value {
    match (lhs, rhs) {
        (Value::Str(_), _) | (_, Value::Str(_)) => {
            Value::str(format!("{}{}", lhs.to_display_string(), rhs.to_display_string()))
        }
        _ => Value::Number(lhs.as_number() + rhs.as_number()),
    }
}

/// ToInt32: truncate modulo 2^32 into the signed range
fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let modulus = 4294967296.0;
    let mut m = n.trunc() % modulus;
    if m < 0.0 {
        m += modulus;
    }
    m as u32 as i32
}

fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_truncation_wraps() {
        assert_eq!(to_int32(0.0), 0);
        assert_eq!(to_int32(-1.5), -1);
        assert_eq!(to_int32(4294967296.0), 0);
        assert_eq!(to_int32(2147483648.0), -2147483648);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_uint32(-1.0), 4294967295);
    }

    #[test]
    fn add_concatenates_with_strings() {
        let result = binary_add(&Value::Number(1.0), &Value::str("x"));
        assert!(result.strict_equals(&Value::str("1x")));
        let result = binary_add(&Value::Number(1.0), &Value::Number(2.0));
        assert!(result.strict_equals(&Value::Number(3.0)));
    }

    #[test]
    fn division_by_zero_follows_ieee() {
        let result = binary_add(&Value::Number(0.0), &Value::Number(0.0));
        assert!(result.strict_equals(&Value::Number(0.0)));
        assert_eq!(1.0_f64 / 0.0, f64::INFINITY);
        assert!((0.0_f64 / 0.0).is_nan());
    }
}
