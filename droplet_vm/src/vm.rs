//! The Droplet virtual machine.
//!
//! A single-threaded, synchronous, stack-based interpreter. Per instance:
//! an operand stack with an explicit stack pointer, a call-frame vector, a
//! globals map, the function table, the constant pool, a native-function
//! registry, and the GC allocator.
//!
//! The execution cycle pops one opcode from the top frame per iteration;
//! a GC safepoint and an optional cooperative pause hook run before each
//! dispatch. Runtime anomalies never abort execution — lookups that fail
//! push nil, out-of-range array reads yield nil, writes on wrongly-typed
//! receivers are no-ops (see the per-opcode handlers).

use crate::allocator::Allocator;
use crate::ffi::{FfiDispatcher, FfiSignature, FfiValue};
use crate::function::{CallFrame, Function};
use crate::natives;
use crate::object::HeapObject;
use crate::stack::OperandStack;
use droplet_compiler::Op;
use droplet_core::{DropletError, DropletResult, Value};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::io::Write as _;

/// A host-provided native function. The callback is responsible for popping
/// its `argc` arguments and pushing exactly one result.
pub type NativeFn = fn(&mut Vm, u8);

/// Cooperative pause hook, consulted before each dispatch; returning `true`
/// halts the run loop (the embedder can resume by calling `run` again).
pub type PauseHook = Box<dyn FnMut(&Vm) -> bool>;

/// Where `print`/`println` output goes.
#[derive(Debug)]
enum OutputSink {
    Stdout,
    Buffer(Vec<u8>),
}

/// The Droplet VM.
pub struct Vm {
    /// Operand stack; frame locals live inside it.
    pub stack: OperandStack,
    /// Call frames, innermost last.
    pub frames: Vec<CallFrame>,
    /// Global variables by name.
    pub globals: FxHashMap<String, Value>,
    /// Loaded constant pool.
    pub constants: Vec<Value>,
    /// Loaded function table (append-only during load).
    pub functions: Vec<Function>,
    /// Function name → table index.
    pub function_index_by_name: FxHashMap<String, u32>,
    /// The allocator and garbage collector.
    pub allocator: Allocator,
    natives: FxHashMap<String, NativeFn>,
    ffi: Option<Box<dyn FfiDispatcher>>,
    output: OutputSink,
    pause_hook: Option<PauseHook>,
}

impl Vm {
    /// Create a VM with the standard natives registered and the default GC
    /// threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(Allocator::new())
    }

    /// Create a VM collecting garbage above the given live-object count.
    #[must_use]
    pub fn with_gc_threshold(threshold: usize) -> Self {
        Self::with_allocator(Allocator::with_threshold(threshold))
    }

    fn with_allocator(allocator: Allocator) -> Self {
        let mut vm = Self {
            stack: OperandStack::new(),
            frames: Vec::with_capacity(64),
            globals: FxHashMap::default(),
            constants: Vec::new(),
            functions: Vec::new(),
            function_index_by_name: FxHashMap::default(),
            allocator,
            natives: FxHashMap::default(),
            ffi: None,
            output: OutputSink::Stdout,
            pause_hook: None,
        };
        natives::register_default_natives(&mut vm);
        vm
    }

    // =========================================================================
    // Host surface
    // =========================================================================

    /// Register (or replace) a native function.
    pub fn register_native(&mut self, name: &str, f: NativeFn) {
        self.natives.insert(name.to_string(), f);
    }

    /// Install the FFI dispatcher.
    pub fn set_ffi_dispatcher(&mut self, dispatcher: Box<dyn FfiDispatcher>) {
        self.ffi = Some(dispatcher);
    }

    /// Install a cooperative pause hook.
    pub fn set_pause_hook(&mut self, hook: PauseHook) {
        self.pause_hook = Some(hook);
    }

    /// Redirect `print`/`println` into an internal buffer (for tests and
    /// embedders).
    pub fn capture_output(&mut self) {
        self.output = OutputSink::Buffer(Vec::new());
    }

    /// Drain the captured output buffer.
    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            OutputSink::Buffer(buffer) => String::from_utf8_lossy(&std::mem::take(buffer)).into_owned(),
            OutputSink::Stdout => String::new(),
        }
    }

    /// Write program output to the configured sink.
    pub fn write_output(&mut self, text: &str) {
        match &mut self.output {
            OutputSink::Stdout => {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            OutputSink::Buffer(buffer) => buffer.extend_from_slice(text.as_bytes()),
        }
    }

    /// Look up a function index by (mangled) name.
    #[must_use]
    pub fn get_function_index(&self, name: &str) -> Option<u32> {
        self.function_index_by_name.get(name).copied()
    }

    // =========================================================================
    // Call protocol
    // =========================================================================

    /// Push a frame for `fn_idx`. The `argc` arguments already on the stack
    /// become slots `0..argc`; remaining locals are nil-initialized. A bad
    /// index consumes the arguments and pushes nil.
    pub fn call_function_by_index(&mut self, fn_idx: u32, argc: u8) {
        let Some(func) = self.functions.get(fn_idx as usize) else {
            for _ in 0..argc {
                self.stack.pop();
            }
            self.stack.push(Value::nil());
            return;
        };
        let local_count = func.local_count;
        let locals_base = self.stack.sp().saturating_sub(u32::from(argc));
        let additional = local_count.saturating_sub(argc);
        for _ in 0..additional {
            self.stack.push(Value::nil());
        }
        self.frames.push(CallFrame::new(fn_idx, locals_base));
    }

    /// Pop `count` return values, tear down the frame (discarding its locals
    /// and arguments), and push the returns back.
    pub fn do_return(&mut self, count: u8) {
        if self.frames.is_empty() {
            return;
        }
        let mut returns: SmallVec<[Value; 2]> = SmallVec::new();
        for _ in 0..count {
            returns.push(self.stack.pop());
        }
        let frame = self.frames.pop().expect("frame stack non-empty");
        self.stack.set_sp(frame.locals_base);
        for value in returns.into_iter().rev() {
            self.stack.push(value);
        }
    }

    /// Invoke every `*$init` static-field initializer, then `main`.
    pub fn run_program(&mut self) -> DropletResult<()> {
        let inits: Vec<u32> = self
            .functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.name.ends_with("$init"))
            .map(|(i, _)| i as u32)
            .collect();
        for idx in inits {
            self.call_function_by_index(idx, 0);
            self.run();
        }

        let Some(main_idx) = self.get_function_index("main") else {
            return Err(DropletError::load("program has no 'main' function"));
        };
        self.call_function_by_index(main_idx, 0);
        self.run();
        Ok(())
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    /// Run until the call-frame stack empties (or the pause hook halts).
    pub fn run(&mut self) {
        while !self.frames.is_empty() {
            // GC safepoint at the top of every instruction.
            self.allocator
                .collect_if_needed(&self.stack, &self.globals, &self.constants);

            if let Some(mut hook) = self.pause_hook.take() {
                let halt = hook(self);
                self.pause_hook = Some(hook);
                if halt {
                    return;
                }
            }

            // A frame that runs off its code returns implicitly.
            {
                let frame = self.frames.last().expect("loop guard");
                let code_len = self.functions[frame.function as usize].code.len() as u32;
                if frame.ip >= code_len {
                    self.do_return(0);
                    continue;
                }
            }

            let op_byte = self.read_u8();
            let Some(op) = Op::from_u8(op_byte) else {
                eprintln!("droplet-vm: unimplemented opcode {op_byte:#04x}");
                return;
            };
            self.dispatch(op);
        }
    }

    fn dispatch(&mut self, op: Op) {
        match op {
            // ----------------------------------------------------------- stack
            Op::PushConst => {
                let idx = self.read_u32();
                let value = self
                    .constants
                    .get(idx as usize)
                    .copied()
                    .unwrap_or_else(Value::nil);
                self.stack.push(value);
            }
            Op::Pop => {
                self.stack.pop();
            }
            Op::LoadLocal => {
                let slot = self.read_u8();
                let base = self.frames.last().expect("active frame").locals_base;
                let value = self.stack.get(base + u32::from(slot));
                self.stack.push(value);
            }
            Op::StoreLocal => {
                let slot = self.read_u8();
                let base = self.frames.last().expect("active frame").locals_base;
                let value = self.stack.pop();
                self.stack.set(base + u32::from(slot), value);
            }
            Op::Dup => {
                let value = self.stack.peek(0);
                self.stack.push(value);
            }
            Op::Swap => {
                let a = self.stack.pop();
                let b = self.stack.pop();
                self.stack.push(a);
                self.stack.push(b);
            }
            Op::Rot => {
                // Bottom-to-top x y z becomes y z x.
                let a = self.stack.pop();
                let b = self.stack.pop();
                let c = self.stack.pop();
                self.stack.push(b);
                self.stack.push(a);
                self.stack.push(c);
            }

            // ------------------------------------------------------ arithmetic
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                let vb = self.stack.pop();
                let va = self.stack.pop();
                self.stack.push(Self::arithmetic(op, va, vb));
            }

            // ----------------------------------------------------------- logic
            Op::And => {
                let vb = self.stack.pop();
                let va = self.stack.pop();
                self.stack
                    .push(Value::bool(va.is_truthy() && vb.is_truthy()));
            }
            Op::Or => {
                let vb = self.stack.pop();
                let va = self.stack.pop();
                self.stack
                    .push(Value::bool(va.is_truthy() || vb.is_truthy()));
            }
            Op::Not => {
                let value = self.stack.pop();
                self.stack.push(Value::bool(!value.is_truthy()));
            }

            // ------------------------------------------------------ comparison
            Op::Eq | Op::Neq | Op::Lt | Op::Gt | Op::Lte | Op::Gte => {
                let vb = self.stack.pop();
                let va = self.stack.pop();
                let result = self.compare(op, va, vb);
                self.stack.push(Value::bool(result));
            }
            Op::IsInstance => {
                let type_idx = self.read_u32();
                let value = self.stack.pop();
                let matches = match (self.const_str(type_idx), value.as_object()) {
                    (Some(type_name), Some(r)) => matches!(
                        self.allocator.heap().get(r),
                        Some(HeapObject::Instance { class_name, .. }) if *class_name == type_name
                    ),
                    _ => false,
                };
                self.stack.push(Value::bool(matches));
            }

            // --------------------------------------------------------- control
            Op::Jump => {
                let target = self.read_u32();
                self.frames.last_mut().expect("active frame").ip = target;
            }
            Op::JumpIfFalse => {
                let target = self.read_u32();
                let cond = self.stack.pop();
                if !cond.is_truthy() {
                    self.frames.last_mut().expect("active frame").ip = target;
                }
            }
            Op::JumpIfTrue => {
                let target = self.read_u32();
                let cond = self.stack.pop();
                if cond.is_truthy() {
                    self.frames.last_mut().expect("active frame").ip = target;
                }
            }

            // ----------------------------------------------------------- calls
            Op::Call => {
                let fn_idx = self.read_u32();
                let argc = self.read_u8();
                self.call_function_by_index(fn_idx, argc);
            }
            Op::Return => {
                let count = self.read_u8();
                self.do_return(count);
            }
            Op::CallNative => {
                let name_idx = self.read_u32();
                let argc = self.read_u8();
                let native = self
                    .const_str(name_idx)
                    .and_then(|name| self.natives.get(&name).copied());
                match native {
                    Some(f) => f(self, argc),
                    None => {
                        eprintln!("droplet-vm: native function not found");
                        for _ in 0..argc {
                            self.stack.pop();
                        }
                        self.stack.push(Value::nil());
                    }
                }
            }
            Op::CallFfi => {
                let lib_idx = self.read_u32();
                let sym_idx = self.read_u32();
                let argc = self.read_u8();
                let sig_idx = self.read_u32();
                self.do_call_ffi(lib_idx, sym_idx, argc, sig_idx);
            }

            // --------------------------------------------------------- objects
            Op::NewObject => {
                let name_idx = self.read_u32();
                let class_name = self
                    .const_str(name_idx)
                    .unwrap_or_else(|| "Object".to_string());
                let r = self.allocator.alloc_instance(class_name);
                self.stack.push(Value::object(r));
            }
            Op::GetField => {
                let name_idx = self.read_u32();
                let objv = self.stack.pop();
                let value = match (self.const_str(name_idx), objv.as_object()) {
                    (Some(field), Some(r)) => match self.allocator.heap().get(r) {
                        Some(HeapObject::Instance { fields, .. }) => {
                            fields.get(&field).copied().unwrap_or_else(Value::nil)
                        }
                        _ => Value::nil(),
                    },
                    _ => Value::nil(),
                };
                self.stack.push(value);
            }
            Op::SetField => {
                let name_idx = self.read_u32();
                let value = self.stack.pop();
                let objv = self.stack.pop();
                // Writes on non-objects are no-ops.
                if let (Some(field), Some(r)) = (self.const_str(name_idx), objv.as_object()) {
                    if let Some(HeapObject::Instance { fields, .. }) =
                        self.allocator.heap_mut().get_mut(r)
                    {
                        fields.insert(field, value);
                    }
                }
            }
            Op::NewArray => {
                let r = self.allocator.alloc_array();
                self.stack.push(Value::object(r));
            }
            Op::NewMap => {
                let r = self.allocator.alloc_map();
                self.stack.push(Value::object(r));
            }

            // ---------------------------------------------------------- arrays
            Op::ArrayGet => {
                let idxv = self.stack.pop();
                let arrv = self.stack.pop();
                let value = match arrv.as_object().and_then(|r| self.allocator.heap().get(r)) {
                    Some(HeapObject::Array(items)) => {
                        let idx = Self::index_of(idxv);
                        if idx >= 0 && (idx as usize) < items.len() {
                            items[idx as usize]
                        } else {
                            Value::nil()
                        }
                    }
                    _ => Value::nil(),
                };
                self.stack.push(value);
            }
            Op::ArraySet => {
                let value = self.stack.pop();
                let idxv = self.stack.pop();
                let arrv = self.stack.pop();
                let Some(r) = arrv.as_object() else {
                    return;
                };
                let idx = Self::index_of(idxv);
                if idx < 0 {
                    return;
                }
                if let Some(HeapObject::Array(items)) = self.allocator.heap_mut().get_mut(r) {
                    let idx = idx as usize;
                    if idx >= items.len() {
                        items.resize(idx + 1, Value::nil());
                    }
                    items[idx] = value;
                }
            }

            // ------------------------------------------------------------ maps
            Op::MapSet => {
                let value = self.stack.pop();
                let keyv = self.stack.pop();
                let mapv = self.stack.pop();
                let key = self.render_value(keyv);
                if let Some(r) = mapv.as_object() {
                    if let Some(HeapObject::Map(entries)) = self.allocator.heap_mut().get_mut(r) {
                        entries.insert(key, value);
                    }
                }
            }
            Op::MapGet => {
                let keyv = self.stack.pop();
                let mapv = self.stack.pop();
                let key = self.render_value(keyv);
                let value = match mapv.as_object().and_then(|r| self.allocator.heap().get(r)) {
                    Some(HeapObject::Map(entries)) => {
                        entries.get(&key).copied().unwrap_or_else(Value::nil)
                    }
                    _ => Value::nil(),
                };
                self.stack.push(value);
            }

            // --------------------------------------------------------- strings
            Op::StringConcat => {
                let vb = self.stack.pop();
                let va = self.stack.pop();
                let mut s = self.string_or_render(va);
                s.push_str(&self.string_or_render(vb));
                let r = self.allocator.alloc_string(s);
                self.stack.push(Value::object(r));
            }
            Op::StringLength => {
                let value = self.stack.pop();
                let len = self
                    .heap_str(value)
                    .map_or(0, |s| s.len() as i64);
                self.stack.push(Value::int(len));
            }
            Op::StringSubstr => {
                let start = self.read_u32() as usize;
                let len = self.read_u32() as usize;
                let value = self.stack.pop();
                let out = match self.heap_str(value) {
                    Some(s) => {
                        let bytes = s.as_bytes();
                        let start = start.min(bytes.len());
                        let end = start + len.min(bytes.len() - start);
                        String::from_utf8_lossy(&bytes[start..end]).into_owned()
                    }
                    None => String::new(),
                };
                let r = self.allocator.alloc_string(out);
                self.stack.push(Value::object(r));
            }
            Op::StringEq => {
                let vb = self.stack.pop();
                let va = self.stack.pop();
                let equal = self.string_or_render(va) == self.string_or_render(vb);
                self.stack.push(Value::bool(equal));
            }
            Op::StringGetChar => {
                let idxv = self.stack.pop();
                let value = self.stack.pop();
                let idx = Self::index_of(idxv);
                let out = match self.heap_str(value) {
                    Some(s) if idx >= 0 && (idx as usize) < s.len() => {
                        let byte = s.as_bytes()[idx as usize];
                        String::from_utf8_lossy(&[byte]).into_owned()
                    }
                    _ => String::new(),
                };
                let r = self.allocator.alloc_string(out);
                self.stack.push(Value::object(r));
            }

            // --------------------------------------------------------- globals
            Op::LoadGlobal => {
                let name_idx = self.read_u32();
                let value = self
                    .const_str(name_idx)
                    .and_then(|name| self.globals.get(&name).copied())
                    .unwrap_or_else(Value::nil);
                self.stack.push(value);
            }
            Op::StoreGlobal => {
                let name_idx = self.read_u32();
                let value = self.stack.pop();
                if let Some(name) = self.const_str(name_idx) {
                    self.globals.insert(name, value);
                }
            }
        }
    }

    // =========================================================================
    // Operand reading
    // =========================================================================

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("active frame");
        let code = &self.functions[frame.function as usize].code;
        let v = code.get(frame.ip as usize).copied().unwrap_or(0);
        frame.ip += 1;
        v
    }

    fn read_u32(&mut self) -> u32 {
        let frame = self.frames.last_mut().expect("active frame");
        let code = &self.functions[frame.function as usize].code;
        let at = frame.ip as usize;
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = code.get(at + i).copied().unwrap_or(0);
        }
        frame.ip += 4;
        u32::from_le_bytes(bytes)
    }

    // =========================================================================
    // Semantics helpers
    // =========================================================================

    /// Numeric arithmetic with promotion: int pairs stay int except `/`,
    /// which always yields float; any float operand widens the result.
    /// Integer `%` by zero yields 0; float division by zero follows IEEE-754.
    fn arithmetic(op: Op, va: Value, vb: Value) -> Value {
        if let (Value::Int(a), Value::Int(b)) = (va, vb) {
            if op != Op::Div {
                return Value::int(match op {
                    Op::Add => a.wrapping_add(b),
                    Op::Sub => a.wrapping_sub(b),
                    Op::Mul => a.wrapping_mul(b),
                    Op::Mod => {
                        if b == 0 {
                            0
                        } else {
                            a.wrapping_rem(b)
                        }
                    }
                    _ => unreachable!("arithmetic op"),
                });
            }
        }
        let a = va.as_float_coerce().unwrap_or(0.0);
        let b = vb.as_float_coerce().unwrap_or(0.0);
        Value::float(match op {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
            Op::Mod => a % b,
            _ => unreachable!("arithmetic op"),
        })
    }

    /// Comparison: numerics promote; strings compare byte-wise
    /// (lexicographic for the ordered operators); other objects compare by
    /// identity; mixed kinds are false for `==`, true for `!=`.
    fn compare(&self, op: Op, va: Value, vb: Value) -> bool {
        if let (Some(a), Some(b)) = (va.as_float_coerce(), vb.as_float_coerce()) {
            return match op {
                Op::Eq => a == b,
                Op::Neq => a != b,
                Op::Lt => a < b,
                Op::Gt => a > b,
                Op::Lte => a <= b,
                Op::Gte => a >= b,
                _ => false,
            };
        }

        if let (Some(sa), Some(sb)) = (self.heap_str(va), self.heap_str(vb)) {
            return match op {
                Op::Eq => sa == sb,
                Op::Neq => sa != sb,
                Op::Lt => sa < sb,
                Op::Gt => sa > sb,
                Op::Lte => sa <= sb,
                Op::Gte => sa >= sb,
                _ => false,
            };
        }

        if let (Some(ra), Some(rb)) = (va.as_object(), vb.as_object()) {
            return match op {
                Op::Eq => ra == rb,
                Op::Neq => ra != rb,
                _ => false,
            };
        }

        match op {
            Op::Eq => va == vb,
            Op::Neq => va != vb,
            _ => false,
        }
    }

    fn index_of(value: Value) -> i64 {
        match value {
            Value::Int(i) => i,
            Value::Float(f) => f as i64,
            _ => 0,
        }
    }

    fn do_call_ffi(&mut self, lib_idx: u32, sym_idx: u32, argc: u8, sig_idx: u32) {
        let lib = self.const_str(lib_idx);
        let sym = self.const_str(sym_idx);
        let sig = self.const_str(sig_idx);

        let (Some(lib), Some(sym), Some(sig)) = (lib, sym, sig) else {
            eprintln!("droplet-vm: CALL_FFI with invalid constant indices");
            for _ in 0..argc {
                self.stack.pop();
            }
            self.stack.push(Value::nil());
            return;
        };

        let Some(mut dispatcher) = self.ffi.take() else {
            // No dispatcher installed: the declared surface fails soft.
            for _ in 0..argc {
                self.stack.pop();
            }
            self.stack.push(Value::nil());
            return;
        };

        let mut args: SmallVec<[Value; 8]> = SmallVec::new();
        for _ in 0..argc {
            args.push(self.stack.pop());
        }
        args.reverse();

        let string_args: Vec<Option<String>> = args
            .iter()
            .map(|v| self.heap_str(*v).map(str::to_string))
            .collect();

        let result = match FfiSignature::parse(&sig) {
            Ok(signature) => dispatcher.call(&lib, &sym, &signature, &args, &string_args),
            Err(e) => {
                eprintln!("droplet-vm: {e}");
                FfiValue::Nil
            }
        };
        self.ffi = Some(dispatcher);

        let value = match result {
            FfiValue::Nil => Value::nil(),
            FfiValue::Int(i) => Value::int(i),
            FfiValue::Float(f) => Value::float(f),
            FfiValue::Bool(b) => Value::bool(b),
            FfiValue::Str(s) => Value::object(self.allocator.alloc_string(s)),
        };
        self.stack.push(value);
    }

    // =========================================================================
    // Value rendering and string access
    // =========================================================================

    /// Borrow the string contents of a string-object value.
    #[must_use]
    pub fn heap_str(&self, value: Value) -> Option<&str> {
        value
            .as_object()
            .and_then(|r| self.allocator.heap().get(r))
            .and_then(HeapObject::as_str)
    }

    /// Read a string out of the constant pool.
    #[must_use]
    pub fn const_str(&self, idx: u32) -> Option<String> {
        self.constants
            .get(idx as usize)
            .copied()
            .and_then(|v| self.heap_str(v).map(str::to_string))
    }

    fn string_or_render(&self, value: Value) -> String {
        match self.heap_str(value) {
            Some(s) => s.to_string(),
            None => self.render_value(value),
        }
    }

    /// The user-facing rendering used by `print`, `str`, and map keys:
    /// ints and floats in decimal, bools as `true`/`false`, nil as `nil`,
    /// strings as their contents, lists as `[e1, e2]`, maps as `{k: v}`,
    /// instances as `<object:Class>`.
    #[must_use]
    pub fn render_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Object(r) => match self.allocator.heap().get(r) {
                Some(HeapObject::Str(s)) => s.clone(),
                Some(HeapObject::Array(items)) => {
                    let parts: Vec<String> =
                        items.iter().map(|v| self.render_value(*v)).collect();
                    format!("[{}]", parts.join(", "))
                }
                Some(HeapObject::Map(entries)) => {
                    let parts: Vec<String> = entries
                        .iter()
                        .map(|(k, v)| format!("{k}: {}", self.render_value(*v)))
                        .collect();
                    format!("{{{}}}", parts.join(", "))
                }
                Some(HeapObject::Instance { class_name, .. }) => {
                    format!("<object:{class_name}>")
                }
                Some(HeapObject::FunctionHandle(idx)) => format!("<fn #{idx}>"),
                Some(HeapObject::BoundMethod { method, .. }) => {
                    format!("<bound method #{method}>")
                }
                None => "nil".to_string(),
            },
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droplet_compiler::bytecode::DbcBuilder;

    /// Install a hand-built artifact into a fresh VM.
    fn vm_with(builder: &mut DbcBuilder) -> Vm {
        let mut vm = Vm::new();
        vm.capture_output();
        crate::loader::load_bytes(&mut vm, &builder.to_bytes()).expect("load");
        vm
    }

    #[test]
    fn test_push_const_and_return() {
        let mut builder = DbcBuilder::new();
        let k = builder.add_int(42);
        {
            let f = builder.add_function("main");
            f.local_count = 0;
            f.push_const(k);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::int(42));
    }

    #[test]
    fn test_arithmetic_int_preserving() {
        assert_eq!(
            Vm::arithmetic(Op::Add, Value::int(2), Value::int(3)),
            Value::int(5)
        );
        assert_eq!(
            Vm::arithmetic(Op::Mul, Value::int(4), Value::int(5)),
            Value::int(20)
        );
        assert_eq!(
            Vm::arithmetic(Op::Mod, Value::int(7), Value::int(3)),
            Value::int(1)
        );
        // Truncated remainder for negatives.
        assert_eq!(
            Vm::arithmetic(Op::Mod, Value::int(-7), Value::int(3)),
            Value::int(-1)
        );
    }

    #[test]
    fn test_division_always_floats() {
        assert_eq!(
            Vm::arithmetic(Op::Div, Value::int(7), Value::int(2)),
            Value::float(3.5)
        );
        let infinite = Vm::arithmetic(Op::Div, Value::int(1), Value::int(0));
        assert_eq!(infinite.as_float(), Some(f64::INFINITY));
    }

    #[test]
    fn test_int_mod_zero_is_defined() {
        assert_eq!(
            Vm::arithmetic(Op::Mod, Value::int(5), Value::int(0)),
            Value::int(0)
        );
    }

    #[test]
    fn test_float_promotion() {
        assert_eq!(
            Vm::arithmetic(Op::Add, Value::int(1), Value::float(0.5)),
            Value::float(1.5)
        );
    }

    #[test]
    fn test_compare_mixed_types() {
        let vm = Vm::new();
        assert!(!vm.compare(Op::Eq, Value::int(1), Value::bool(true)));
        assert!(vm.compare(Op::Neq, Value::int(1), Value::bool(true)));
        assert!(!vm.compare(Op::Lt, Value::nil(), Value::int(1)));
    }

    #[test]
    fn test_compare_strings_lexicographic() {
        let mut vm = Vm::new();
        let a = Value::object(vm.allocator.alloc_string("apple"));
        let b = Value::object(vm.allocator.alloc_string("banana"));
        assert!(vm.compare(Op::Lt, a, b));
        assert!(vm.compare(Op::Neq, a, b));
        assert!(!vm.compare(Op::Eq, a, b));
    }

    #[test]
    fn test_string_content_equality_distinct_objects() {
        let mut vm = Vm::new();
        let a = Value::object(vm.allocator.alloc_string("same"));
        let b = Value::object(vm.allocator.alloc_string("same"));
        assert!(vm.compare(Op::Eq, a, b));
    }

    #[test]
    fn test_object_identity_equality() {
        let mut vm = Vm::new();
        let a = Value::object(vm.allocator.alloc_array());
        let b = Value::object(vm.allocator.alloc_array());
        assert!(vm.compare(Op::Eq, a, a));
        assert!(!vm.compare(Op::Eq, a, b));
        assert!(vm.compare(Op::Neq, a, b));
    }

    #[test]
    fn test_call_frame_protocol() {
        let mut builder = DbcBuilder::new();
        let k = builder.add_int(10);
        // add_one(x) -> x + 1
        {
            let one = builder.add_int(1);
            let f = builder.add_function("add_one");
            f.arg_count = 1;
            f.local_count = 1;
            f.load_local(0);
            f.push_const(one);
            f.emit(Op::Add);
            f.ret(1);
        }
        {
            let f = builder.add_function("main");
            f.push_const(k);
            f.call(0, 1);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::int(11));
        assert_eq!(vm.stack.sp(), 0);
    }

    #[test]
    fn test_call_bad_index_pushes_nil() {
        let mut builder = DbcBuilder::new();
        let k = builder.add_int(5);
        {
            let f = builder.add_function("main");
            f.push_const(k);
            f.call(99, 1);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::nil());
    }

    #[test]
    fn test_locals_are_nil_initialized() {
        let mut builder = DbcBuilder::new();
        {
            let f = builder.add_function("main");
            f.local_count = 3;
            f.load_local(2);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::nil());
    }

    #[test]
    fn test_globals_roundtrip() {
        let mut builder = DbcBuilder::new();
        let name = builder.add_string("g");
        let k = builder.add_int(99);
        {
            let f = builder.add_function("main");
            f.push_const(k);
            f.store_global(name);
            f.load_global(name);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::int(99));
        assert_eq!(vm.globals.get("g"), Some(&Value::int(99)));
    }

    #[test]
    fn test_unknown_global_reads_nil() {
        let mut builder = DbcBuilder::new();
        let name = builder.add_string("missing");
        {
            let f = builder.add_function("main");
            f.load_global(name);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::nil());
    }

    #[test]
    fn test_array_set_autogrows_and_out_of_range_reads_nil() {
        let mut builder = DbcBuilder::new();
        let i5 = builder.add_int(5);
        let i7 = builder.add_int(7);
        let i9 = builder.add_int(9);
        {
            let f = builder.add_function("main");
            f.local_count = 1;
            f.emit(Op::NewArray);
            f.store_local(0);
            // arr[5] = 7
            f.load_local(0);
            f.push_const(i5);
            f.push_const(i7);
            f.emit(Op::ArraySet);
            // read arr[9] (out of range -> nil), then arr[5]
            f.load_local(0);
            f.push_const(i9);
            f.emit(Op::ArrayGet);
            f.emit(Op::Pop);
            f.load_local(0);
            f.push_const(i5);
            f.emit(Op::ArrayGet);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::int(7));
    }

    #[test]
    fn test_map_key_coercion() {
        let mut builder = DbcBuilder::new();
        let k1 = builder.add_int(1);
        let v = builder.add_string("one");
        {
            let f = builder.add_function("main");
            f.local_count = 1;
            f.emit(Op::NewMap);
            f.store_local(0);
            f.load_local(0);
            f.push_const(k1);
            f.push_const(v);
            f.emit(Op::MapSet);
            f.load_local(0);
            f.push_const(k1);
            f.emit(Op::MapGet);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        let result = vm.stack.pop();
        assert_eq!(vm.heap_str(result), Some("one"));
    }

    #[test]
    fn test_string_concat_identity() {
        let mut builder = DbcBuilder::new();
        let empty = builder.add_string("");
        let x = builder.add_string("x");
        {
            let f = builder.add_function("main");
            f.push_const(empty);
            f.push_const(x);
            f.emit(Op::StringConcat);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        let result = vm.stack.pop();
        assert_eq!(vm.heap_str(result), Some("x"));
    }

    #[test]
    fn test_string_substr_and_get_char() {
        let mut builder = DbcBuilder::new();
        let s = builder.add_string("droplet");
        let i0 = builder.add_int(0);
        {
            let f = builder.add_function("main");
            f.push_const(s);
            f.emit(Op::StringSubstr);
            f.emit_u32(2);
            f.emit_u32(3);
            // then first char of "ople"... take char of original instead
            f.emit(Op::Pop);
            f.push_const(s);
            f.push_const(i0);
            f.emit(Op::StringGetChar);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        let result = vm.stack.pop();
        assert_eq!(vm.heap_str(result), Some("d"));
    }

    #[test]
    fn test_is_instance_exact_match_only() {
        let mut builder = DbcBuilder::new();
        let cls = builder.add_string("Error");
        let other = builder.add_string("Warning");
        {
            let f = builder.add_function("main");
            f.new_object(cls);
            f.is_instance(other);
            f.emit(Op::Pop);
            f.new_object(cls);
            f.is_instance(cls);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::bool(true));
    }

    #[test]
    fn test_field_roundtrip_and_missing_field_nil() {
        let mut builder = DbcBuilder::new();
        let cls = builder.add_string("P");
        let fx = builder.add_string("x");
        let fy = builder.add_string("y");
        let k = builder.add_int(3);
        {
            let f = builder.add_function("main");
            f.local_count = 1;
            f.new_object(cls);
            f.store_local(0);
            f.load_local(0);
            f.push_const(k);
            f.set_field(fx);
            // missing field read
            f.load_local(0);
            f.get_field(fy);
            f.emit(Op::Pop);
            f.load_local(0);
            f.get_field(fx);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::int(3));
    }

    #[test]
    fn test_rot_and_swap() {
        let mut builder = DbcBuilder::new();
        let k1 = builder.add_int(1);
        let k2 = builder.add_int(2);
        let k3 = builder.add_int(3);
        {
            let f = builder.add_function("main");
            f.push_const(k1);
            f.push_const(k2);
            f.emit(Op::Swap);
            // now stack: 2 1 -> top is 1
            f.push_const(k3);
            f.emit(Op::Rot);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        // stack was [2,1,3]; ROT pops 3,1,2 pushes 1,3,2 -> top = 2
        assert_eq!(vm.stack.pop(), Value::int(2));
    }

    #[test]
    fn test_render_values() {
        let mut vm = Vm::new();
        assert_eq!(vm.render_value(Value::nil()), "nil");
        assert_eq!(vm.render_value(Value::bool(true)), "true");
        assert_eq!(vm.render_value(Value::int(-3)), "-3");
        assert_eq!(vm.render_value(Value::float(2.0)), "2.0");
        assert_eq!(vm.render_value(Value::float(2.5)), "2.5");

        let s = Value::object(vm.allocator.alloc_string("hi"));
        assert_eq!(vm.render_value(s), "hi");

        let arr = vm.allocator.alloc_array();
        if let Some(HeapObject::Array(items)) = vm.allocator.heap_mut().get_mut(arr) {
            items.push(Value::int(1));
            items.push(Value::int(2));
        }
        assert_eq!(vm.render_value(Value::object(arr)), "[1, 2]");

        let inst = Value::object(vm.allocator.alloc_instance("Point"));
        assert_eq!(vm.render_value(inst), "<object:Point>");
    }

    #[test]
    fn test_ffi_without_dispatcher_pushes_nil() {
        let mut builder = DbcBuilder::new();
        let lib = builder.add_string("libm.so");
        let sym = builder.add_string("sqrt");
        let sig = builder.add_string("f->f");
        let k = builder.add_float(2.0);
        {
            let f = builder.add_function("main");
            f.push_const(k);
            f.call_ffi(lib, sym, 1, sig);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::nil());
    }

    #[test]
    fn test_ffi_dispatcher_receives_call() {
        use crate::ffi::{FfiDispatcher, FfiSignature, FfiValue};

        struct Doubler;
        impl FfiDispatcher for Doubler {
            fn call(
                &mut self,
                _lib: &str,
                _symbol: &str,
                _signature: &FfiSignature,
                args: &[Value],
                _string_args: &[Option<String>],
            ) -> FfiValue {
                FfiValue::Int(args[0].as_int().unwrap_or(0) * 2)
            }
        }

        let mut builder = DbcBuilder::new();
        let lib = builder.add_string("libx.so");
        let sym = builder.add_string("dbl");
        let sig = builder.add_string("i->i");
        let k = builder.add_int(21);
        {
            let f = builder.add_function("main");
            f.push_const(k);
            f.call_ffi(lib, sym, 1, sig);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.set_ffi_dispatcher(Box::new(Doubler));
        vm.run_program().expect("run");
        assert_eq!(vm.stack.pop(), Value::int(42));
    }

    #[test]
    fn test_pause_hook_halts() {
        let mut builder = DbcBuilder::new();
        let k = builder.add_int(1);
        {
            let f = builder.add_function("main");
            f.push_const(k);
            f.ret(1);
        }
        let mut vm = vm_with(&mut builder);
        vm.set_pause_hook(Box::new(|_vm| true));
        let main = vm.get_function_index("main").expect("main");
        vm.call_function_by_index(main, 0);
        vm.run();
        // Halted before executing anything: the frame is still live.
        assert_eq!(vm.frames.len(), 1);
    }

    #[test]
    fn test_missing_main_is_load_error() {
        let mut builder = DbcBuilder::new();
        builder.add_function("not_main");
        let mut vm = vm_with(&mut builder);
        assert!(vm.run_program().is_err());
    }
}
