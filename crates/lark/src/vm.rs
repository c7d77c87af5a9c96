//! The bytecode virtual machine.
//!
//! A tight fetch-decode-execute loop over the chunk of the active call
//! frame's closure. The VM owns every GC root: the value stack, the call
//! frames, the globals table, the open-upvalue list, the cached `init`
//! string, and — while compilation is in flight — the compiler chain
//! passed to [`Vm::collect_garbage`]. All allocation funnels through the
//! `alloc*` helpers here so the collection trigger always fires while the
//! roots still cover everything an object under construction refers to.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::chunk::OpCode;
use crate::compiler::FunctionState;
use crate::error::Error;
use crate::heap::Heap;
use crate::natives;
use crate::object::{
    hash_string, BoundMethod, Class, Closure, Function, Instance, LarkString, List, Native,
    NativeFn, Obj, ObjRef, Upvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::{format_number, Value};

/// Maximum call depth; exceeding it is the "Stack overflow." error.
pub const FRAMES_MAX: usize = 1024;
/// Value-stack capacity reserved up front.
const STACK_MAX: usize = FRAMES_MAX * 256;

/// Significant digits when `+` stringifies a number operand.
const CONCAT_PRECISION: usize = 10;

struct CallFrame {
    closure: ObjRef,
    /// Offset of the next byte to execute in the closure's chunk.
    ip: usize,
    /// Stack index of slot 0: the callee, or the receiver for methods.
    slots: usize,
}

enum Sink {
    Stdout,
    Buffer(Vec<u8>),
}

/// How a callable at the bottom of a call expression should be entered.
enum Callee {
    Closure,
    Native(NativeFn),
    Class,
    Bound(Value, ObjRef),
    NotCallable,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Head of the open-upvalue list, sorted by stack slot descending.
    open_upvalues: Option<ObjRef>,
    /// Interned `"init"`, looked up on every class call.
    init_string: Option<ObjRef>,
    start_time: Instant,
    sink: Sink,
    trace_execution: bool,
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            init_string: None,
            start_time: Instant::now(),
            sink: Sink::Stdout,
            trace_execution: false,
        };
        let init = vm.intern("init");
        vm.init_string = Some(init);
        vm.define_native("clock", natives::clock);
        vm.define_native("len", natives::len);
        vm.define_native("gc", natives::gc);
        vm
    }

    pub fn set_stress_gc(&mut self, on: bool) {
        self.heap.stress = on;
    }

    pub fn set_trace_execution(&mut self, on: bool) {
        self.trace_execution = on;
    }

    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    // -----------------------------------------------------------------------
    // Output sink
    // -----------------------------------------------------------------------

    /// Redirect `print` into an internal buffer instead of stdout.
    pub fn capture_output(&mut self) {
        self.sink = Sink::Buffer(Vec::new());
    }

    /// Drain the capture buffer. Empty when printing to stdout.
    pub fn take_output(&mut self) -> String {
        match &mut self.sink {
            Sink::Stdout => String::new(),
            Sink::Buffer(buffer) => {
                String::from_utf8(std::mem::take(buffer)).unwrap_or_default()
            }
        }
    }

    fn write_line(&mut self, text: &str) {
        match &mut self.sink {
            Sink::Stdout => println!("{text}"),
            Sink::Buffer(buffer) => {
                buffer.extend_from_slice(text.as_bytes());
                buffer.push(b'\n');
            }
        }
    }

    // -----------------------------------------------------------------------
    // Allocation and garbage collection
    // -----------------------------------------------------------------------

    /// Allocate during execution: the VM's own roots cover everything.
    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage(&[], None);
        }
        self.heap.alloc(obj)
    }

    /// Allocate a finished function during compilation. The compiler
    /// chain and the function's own chunk are extra roots for any
    /// collection this triggers.
    pub(crate) fn alloc_function(
        &mut self,
        function: Function,
        compilers: &[FunctionState<'_>],
    ) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage(compilers, Some(&function));
        }
        self.heap.alloc(Obj::Function(function))
    }

    /// Intern `chars`, returning the existing string when one lives.
    pub(crate) fn intern(&mut self, chars: &str) -> ObjRef {
        self.intern_in(chars, &[])
    }

    /// Interning variant used mid-compilation, with the compiler chain as
    /// extra roots.
    pub(crate) fn intern_in(&mut self, chars: &str, compilers: &[FunctionState<'_>]) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(existing) = self.heap.find_interned(chars, hash) {
            return existing;
        }
        if self.heap.should_collect() {
            self.collect_garbage(compilers, None);
        }
        let r = self.heap.alloc(Obj::String(LarkString {
            chars: chars.into(),
            hash,
        }));
        self.heap.record_interned(r);
        r
    }

    /// Mark every root, trace, clear dead interned strings, sweep.
    pub(crate) fn collect_garbage(
        &mut self,
        compilers: &[FunctionState<'_>],
        pending: Option<&Function>,
    ) {
        let before = self.heap.bytes_allocated();
        tracing::debug!(target: "lark::gc", bytes = before, "gc begin");

        if let Some(init) = self.init_string {
            self.heap.mark_object(init);
        }
        for value in &self.stack {
            self.heap.mark_value(*value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            self.heap.mark_object(r);
            upvalue = self.heap.upvalue(r).next;
        }
        self.heap.mark_table(&self.globals);
        for state in compilers {
            self.mark_function_roots(&state.function);
        }
        if let Some(function) = pending {
            self.mark_function_roots(function);
        }

        self.heap.trace_references();
        self.heap.remove_white_strings();
        self.heap.sweep();
        self.heap.finish_collection(before);
    }

    /// A compiler-owned function is not a heap object yet; mark what its
    /// chunk refers to.
    fn mark_function_roots(&mut self, function: &Function) {
        if let Some(name) = function.name {
            self.heap.mark_object(name);
        }
        for value in &function.chunk.constants {
            self.heap.mark_value(*value);
        }
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.intern(name);
        // both land on the stack so a collection mid-definition sees them
        self.push(Value::Obj(name));
        let native = self.alloc(Obj::Native(Native { function }));
        self.push(Value::Obj(native));
        let hash = self.heap.string_hash(name);
        self.globals.set(name, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    pub(crate) fn compile_source(&mut self, source: &str) -> Result<ObjRef, Error> {
        crate::compiler::compile(source, self).map_err(Error::Compile)
    }

    /// Wrap a compiled script in a closure and run it to completion.
    pub(crate) fn run_function(&mut self, function: ObjRef) -> Result<(), Error> {
        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        self.run()
    }

    // -----------------------------------------------------------------------
    // Stack primitives
    // -----------------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let ip = frame.ip;
        frame.ip += 1;
        let closure = frame.closure;
        let function = self.heap.closure(closure).function;
        self.heap.function(function).chunk.code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        (u16::from(high) << 8) | u16::from(low)
    }

    /// Read a constant operand out of the current frame's chunk.
    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        };
        let frame = self.frames.last().unwrap();
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    fn read_string_constant(&mut self, long: bool) -> ObjRef {
        match self.read_constant(long) {
            Value::Obj(r) => r,
            _ => unreachable!("name constant must be a string"),
        }
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    /// Build the runtime error with its backtrace, then reset the VM.
    fn runtime_error(&mut self, message: String) -> Error {
        let mut lines = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let entry = match function.name {
                Some(name) => format!("{}() line {}", self.heap.string(name), line),
                None => format!("script line {}", line),
            };
            lines.push(entry);
        }
        self.reset_stack();
        Error::Runtime {
            message,
            trace: collapse_trace(lines),
        }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), Error> {
        let kind = match callee {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Closure(_) => Callee::Closure,
                Obj::Native(native) => Callee::Native(native.function),
                Obj::Class(_) => Callee::Class,
                Obj::BoundMethod(bound) => Callee::Bound(bound.receiver, bound.method),
                _ => Callee::NotCallable,
            },
            _ => Callee::NotCallable,
        };
        match kind {
            Callee::Closure => {
                let closure = callee.as_obj().unwrap();
                self.call_closure(closure, arg_count)
            }
            Callee::Native(function) => {
                let argc = arg_count as usize;
                let start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[start..].to_vec();
                let result = function(self, &args);
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Callee::Class => {
                let class = callee.as_obj().unwrap();
                self.call_class(class, arg_count)
            }
            Callee::Bound(receiver, method) => {
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::NotCallable => {
                Err(self.runtime_error("Can only call functions and classes.".to_string()))
            }
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: u8) -> Result<(), Error> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        // getters carry arity −1 and are entered with no arguments
        let expected = if arity < 0 { 0 } else { arity };
        if i32::from(arg_count) != expected {
            let message = format!("Expected {} arguments but got {}.", expected, arg_count);
            return Err(self.runtime_error(message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let slots = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots,
        });
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, arg_count: u8) -> Result<(), Error> {
        let instance = self.alloc(Obj::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Obj(instance);
        let init = self.init_string.unwrap();
        let hash = self.heap.string_hash(init);
        match self.heap.class(class).methods.get(init, hash) {
            Some(Value::Obj(initializer)) => self.call_closure(initializer, arg_count),
            Some(_) => unreachable!("methods table holds closures"),
            None if arg_count != 0 => {
                let message = format!("Expected 0 arguments but got {}.", arg_count);
                Err(self.runtime_error(message))
            }
            None => Ok(()),
        }
    }

    fn invoke(&mut self, name: ObjRef, arg_count: u8) -> Result<(), Error> {
        let receiver = self.peek(arg_count as usize);
        let Some(r) = receiver.as_obj() else {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        };
        let hash = self.heap.string_hash(name);
        let (class, field) = match self.heap.get(r) {
            Obj::Instance(instance) => (instance.class, instance.fields.get(name, hash)),
            _ => return Err(self.runtime_error("Only instances have methods.".to_string())),
        };
        // a field shadows a method and is called like any other value
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        self.invoke_from_class(class, name, arg_count)
    }

    /// Call `name` from a class's method table, skipping bound-method
    /// allocation.
    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, arg_count: u8) -> Result<(), Error> {
        let hash = self.heap.string_hash(name);
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => self.call_closure(method, arg_count),
            Some(_) => unreachable!("methods table holds closures"),
            None => {
                let message = format!("Undefined property '{}'.", self.heap.string(name));
                Err(self.runtime_error(message))
            }
        }
    }

    /// Replace the receiver at TOS with `name` bound to it; getters run
    /// immediately.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), Error> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => method,
            Some(_) => unreachable!("methods table holds closures"),
            None => {
                let message = format!("Undefined property '{}'.", self.heap.string(name));
                return Err(self.runtime_error(message));
            }
        };
        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        let function = self.heap.closure(method).function;
        if self.heap.function(function).arity < 0 {
            return self.call_value(Value::Obj(bound), 0);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Upvalues
    // -----------------------------------------------------------------------

    /// Find or create the open upvalue for a stack slot, keeping the list
    /// sorted by slot descending with at most one entry per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(r) = current {
            let location = self.open_location(r);
            if location <= slot {
                if location == slot {
                    return r;
                }
                break;
            }
            previous = Some(r);
            current = self.heap.upvalue(r).next;
        }
        let created = self.alloc(Obj::Upvalue(Upvalue {
            state: UpvalueState::Open(slot),
            next: current,
        }));
        match previous {
            Some(p) => self.heap.upvalue_mut(p).next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue pointing at `last` or above, migrating
    /// the stack value into the cell.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(r) = self.open_upvalues {
            let location = self.open_location(r);
            if location < last {
                break;
            }
            let value = self.stack[location];
            let next = self.heap.upvalue(r).next;
            let upvalue = self.heap.upvalue_mut(r);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }

    fn open_location(&self, upvalue: ObjRef) -> usize {
        match self.heap.upvalue(upvalue).state {
            UpvalueState::Open(slot) => slot,
            UpvalueState::Closed(_) => unreachable!("open list holds only open upvalues"),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.trace_execution {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => {
                    return Err(self.runtime_error(format!("Unknown opcode {}.", byte)));
                }
            };
            match op {
                OpCode::Constant => {
                    let value = self.read_constant(false);
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let value = self.read_constant(true);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_arithmetic(|a, b| a - b)?,
                OpCode::Multiply => self.binary_arithmetic(|a, b| a * b)?,
                OpCode::Divide => self.binary_arithmetic(|a, b| a / b)?,
                OpCode::Power => self.binary_arithmetic(f64::powf)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    }
                },
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Print => {
                    let value = self.pop();
                    let rendered = self.heap.render_value(value);
                    self.write_line(&rendered);
                }
                OpCode::DefineGlobal => self.define_global(false),
                OpCode::DefineGlobalLong => self.define_global(true),
                OpCode::GetGlobal => self.get_global(false)?,
                OpCode::GetGlobalLong => self.get_global(true)?,
                OpCode::SetGlobal => self.set_global(false)?,
                OpCode::SetGlobalLong => self.set_global(true)?,
                OpCode::GetLocal => {
                    let slot = self.read_u16() as usize;
                    let base = self.frame().slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_u16() as usize;
                    let value = self.peek(0);
                    let base = self.frame().slots;
                    self.stack[base + slot] = value;
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    // the condition stays on the stack for the branch's Pop
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => self.op_closure(),
                OpCode::GetUpvalue => {
                    let index = self.read_u16() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_u16() as usize;
                    let value = self.peek(0);
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    if self.op_return() {
                        return Ok(());
                    }
                }
                OpCode::Class => {
                    let name = self.read_string_constant(true);
                    let class = self.alloc(Obj::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::Method => self.define_method(),
                OpCode::Invoke => {
                    let name = self.read_string_constant(true);
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::GetSuper => {
                    let name = self.read_string_constant(true);
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("superclass slot holds a class"),
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::InvokeSuper => {
                    let name = self.read_string_constant(true);
                    let arg_count = self.read_byte();
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("superclass slot holds a class"),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::MakeList => self.make_list(),
                OpCode::GetElement => self.get_element()?,
                OpCode::SetElement => self.set_element()?,
            }
        }
    }

    fn trace_instruction(&self) {
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        let chunk = &self.heap.function(function).chunk;
        let (text, _) = crate::debug::disassemble_instruction(&self.heap, chunk, frame.ip);
        let mut stack = String::new();
        for value in &self.stack {
            stack.push_str("[ ");
            stack.push_str(&self.heap.render_value(*value));
            stack.push_str(" ]");
        }
        trace!(target: "lark::vm", %stack, instruction = %text);
    }

    // -----------------------------------------------------------------------
    // Instruction implementations
    // -----------------------------------------------------------------------

    fn binary_arithmetic(&mut self, op: fn(f64, f64) -> f64) -> Result<(), Error> {
        let (b, a) = (self.peek(0), self.peek(1));
        let (Value::Number(b), Value::Number(a)) = (b, a) else {
            return Err(self.runtime_error("Operands must be numbers.".to_string()));
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), Error> {
        let (b, a) = (self.peek(0), self.peek(1));
        let (Value::Number(b), Value::Number(a)) = (b, a) else {
            return Err(self.runtime_error("Operands must be numbers.".to_string()));
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Obj(r) if self.heap.as_string(r).is_some())
    }

    fn add(&mut self) -> Result<(), Error> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Value::Number(a), Value::Number(b)) = (a, b) {
            self.pop();
            self.pop();
            self.push(Value::Number(a + b));
            return Ok(());
        }
        let concatenable =
            |vm: &Vm, v: Value| vm.is_string(v) || matches!(v, Value::Number(_));
        if (self.is_string(a) || self.is_string(b))
            && concatenable(self, a)
            && concatenable(self, b)
        {
            self.concatenate();
            Ok(())
        } else {
            Err(self.runtime_error("Operands must be two numbers or two strings.".to_string()))
        }
    }

    /// String concatenation; number operands are stringified first. The
    /// operands stay on the stack until the result exists.
    fn concatenate(&mut self) {
        let b = self.peek(0);
        let a = self.peek(1);
        let mut chars = self.stringify_operand(a);
        chars.push_str(&self.stringify_operand(b));
        let result = self.intern(&chars);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    fn stringify_operand(&self, value: Value) -> String {
        match value {
            Value::Number(n) => format_number(n, CONCAT_PRECISION),
            Value::Obj(r) => self.heap.string(r).to_string(),
            _ => unreachable!("checked by add"),
        }
    }

    fn define_global(&mut self, long: bool) {
        let name = self.read_string_constant(long);
        let hash = self.heap.string_hash(name);
        let value = self.peek(0);
        self.globals.set(name, hash, value);
        self.pop();
    }

    fn get_global(&mut self, long: bool) -> Result<(), Error> {
        let name = self.read_string_constant(long);
        let hash = self.heap.string_hash(name);
        match self.globals.get(name, hash) {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => {
                let message = format!("Undefined variable '{}'.", self.heap.string(name));
                Err(self.runtime_error(message))
            }
        }
    }

    fn set_global(&mut self, long: bool) -> Result<(), Error> {
        let name = self.read_string_constant(long);
        let hash = self.heap.string_hash(name);
        let value = self.peek(0);
        // assignment must not create a global; undo the insert it probed
        if self.globals.set(name, hash, value) {
            self.globals.delete(name, hash);
            let message = format!("Undefined variable '{}'.", self.heap.string(name));
            return Err(self.runtime_error(message));
        }
        Ok(())
    }

    fn op_closure(&mut self) {
        let function = match self.read_constant(true) {
            Value::Obj(r) => r,
            _ => unreachable!("closure constant holds a function"),
        };
        let upvalue_count = self.heap.function(function).upvalue_count;
        let closure = self.alloc(Obj::Closure(Closure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        // on the stack before any capture can trigger a collection
        self.push(Value::Obj(closure));
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_u16() as usize;
            let upvalue = if is_local {
                let slot = self.frame().slots + index;
                self.capture_upvalue(slot)
            } else {
                let enclosing = self.frame().closure;
                self.heap.closure(enclosing).upvalues[index]
            };
            match self.heap.get_mut(closure) {
                Obj::Closure(c) => c.upvalues.push(upvalue),
                _ => unreachable!(),
            }
        }
    }

    /// Returns true when the top-level frame returned and execution is
    /// complete.
    fn op_return(&mut self) -> bool {
        let result = self.pop();
        let frame = self.frames.pop().unwrap();
        self.close_upvalues(frame.slots);
        if self.frames.is_empty() {
            self.pop();
            return true;
        }
        self.stack.truncate(frame.slots);
        self.push(result);
        false
    }

    fn get_property(&mut self) -> Result<(), Error> {
        let name = self.read_string_constant(true);
        let Some(r) = self.peek(0).as_obj() else {
            return Err(self.runtime_error("Only instances have properties.".to_string()));
        };
        let hash = self.heap.string_hash(name);
        let (class, field) = match self.heap.get(r) {
            Obj::Instance(instance) => (instance.class, instance.fields.get(name, hash)),
            _ => {
                return Err(self.runtime_error("Only instances have properties.".to_string()));
            }
        };
        if let Some(value) = field {
            self.pop();
            self.push(value);
            return Ok(());
        }
        self.bind_method(class, name)
    }

    fn set_property(&mut self) -> Result<(), Error> {
        let name = self.read_string_constant(true);
        let Some(r) = self.peek(1).as_obj() else {
            return Err(self.runtime_error("Only instances have fields.".to_string()));
        };
        if !matches!(self.heap.get(r), Obj::Instance(_)) {
            return Err(self.runtime_error("Only instances have fields.".to_string()));
        }
        let hash = self.heap.string_hash(name);
        let value = self.peek(0);
        match self.heap.get_mut(r) {
            Obj::Instance(instance) => {
                instance.fields.set(name, hash, value);
            }
            _ => unreachable!(),
        }
        // the assigned value is the expression's result
        let value = self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn define_method(&mut self) {
        let name = self.read_string_constant(true);
        let hash = self.heap.string_hash(name);
        let method = self.peek(0);
        let class = match self.peek(1) {
            Value::Obj(r) => r,
            _ => unreachable!("class sits under the method closure"),
        };
        match self.heap.get_mut(class) {
            Obj::Class(c) => {
                c.methods.set(name, hash, method);
            }
            _ => unreachable!(),
        }
        self.pop();
    }

    fn inherit(&mut self) -> Result<(), Error> {
        let superclass = match self.peek(1) {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
            _ => return Err(self.runtime_error("Superclass must be a class.".to_string())),
        };
        let subclass = match self.peek(0) {
            Value::Obj(r) => r,
            _ => unreachable!("subclass sits on top of its superclass"),
        };
        // the subclass's table is still empty, so a wholesale copy is the
        // whole inheritance step; later METHOD ops overwrite overrides
        let methods = self.heap.class(superclass).methods.clone();
        match self.heap.get_mut(subclass) {
            Obj::Class(c) => c.methods = methods,
            _ => unreachable!(),
        }
        self.pop();
        Ok(())
    }

    fn make_list(&mut self) {
        let count = self.read_u16() as usize;
        // allocate while the elements are still rooted by the stack
        let list = self.alloc(Obj::List(List {
            items: Vec::with_capacity(count),
        }));
        let start = self.stack.len() - count;
        let items = self.stack.split_off(start);
        match self.heap.get_mut(list) {
            Obj::List(l) => l.items = items,
            _ => unreachable!(),
        }
        self.push(Value::Obj(list));
    }

    fn get_element(&mut self) -> Result<(), Error> {
        let index = self.peek(0);
        let target = self.peek(1);
        let Value::Number(index) = index else {
            return Err(self.runtime_error("List index must be a number.".to_string()));
        };
        let Some(r) = target.as_obj() else {
            return Err(self.runtime_error("Can only subscript lists.".to_string()));
        };
        let length = match self.heap.get(r) {
            Obj::List(list) => list.items.len(),
            _ => return Err(self.runtime_error("Can only subscript lists.".to_string())),
        };
        let slot = index as i64;
        if slot < 0 || slot >= length as i64 {
            return Err(self.runtime_error("Index out of bounds.".to_string()));
        }
        let value = match self.heap.get(r) {
            Obj::List(list) => list.items[slot as usize],
            _ => unreachable!(),
        };
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn set_element(&mut self) -> Result<(), Error> {
        let value = self.peek(0);
        let index = self.peek(1);
        let target = self.peek(2);
        let Value::Number(index) = index else {
            return Err(self.runtime_error("List index must be a number.".to_string()));
        };
        let Some(r) = target.as_obj() else {
            return Err(self.runtime_error("Can only subscript lists.".to_string()));
        };
        let length = match self.heap.get(r) {
            Obj::List(list) => list.items.len(),
            _ => return Err(self.runtime_error("Can only subscript lists.".to_string())),
        };
        let slot = index as i64;
        if slot < 0 || slot >= length as i64 {
            return Err(self.runtime_error("Index out of bounds.".to_string()));
        }
        match self.heap.get_mut(r) {
            Obj::List(list) => list.items[slot as usize] = value,
            _ => unreachable!(),
        }
        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse runs of identical backtrace lines into a repeat marker.
fn collapse_trace(lines: Vec<String>) -> Vec<String> {
    let mut collapsed = Vec::new();
    let mut iter = lines.into_iter().peekable();
    while let Some(line) = iter.next() {
        let mut count = 1usize;
        while iter.peek() == Some(&line) {
            iter.next();
            count += 1;
        }
        collapsed.push(line);
        if count > 1 {
            collapsed.push(format!("[^ line repeated {} time(s)]", count - 1));
        }
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates_by_content() {
        let mut vm = Vm::new();
        let a = vm.intern("shared");
        let b = vm.intern("shared");
        let c = vm.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn collection_keeps_stack_roots_alive() {
        let mut vm = Vm::new();
        let rooted = vm.intern("rooted");
        vm.push(Value::Obj(rooted));
        vm.intern("garbage");

        vm.collect_garbage(&[], None);

        assert_eq!(vm.heap.string(rooted), "rooted");
        // the unrooted string was reclaimed and re-interning recreates it
        let recreated = vm.intern("garbage");
        assert_eq!(vm.heap.string(recreated), "garbage");
    }

    #[test]
    fn trace_collapse_marks_repeats() {
        let lines = vec![
            "recurse() line 2".to_string(),
            "recurse() line 2".to_string(),
            "recurse() line 2".to_string(),
            "script line 4".to_string(),
        ];
        assert_eq!(
            collapse_trace(lines),
            vec![
                "recurse() line 2".to_string(),
                "[^ line repeated 2 time(s)]".to_string(),
                "script line 4".to_string(),
            ]
        );
    }
}
