//! DLBC artifact builder.
//!
//! [`DbcBuilder`] owns the program-wide constant pool and the list of emitted
//! functions. Constants are deduplicated by value (string dedup is a format
//! requirement; scalar dedup just keeps the pool small). [`FunctionBuilder`]
//! provides the emit API the code generator writes through, including 4-byte
//! little-endian jump placeholders and their patching.

use super::opcode::Op;
use super::{Constant, DLBC_MAGIC, DLBC_VERSION};
use droplet_core::DropletResult;
use rustc_hash::FxHashMap;
use std::path::Path;

/// Key type for constant deduplication. Floats compare by bit pattern so
/// distinct NaNs stay distinct.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum ConstantKey {
    Int(i32),
    Float(u64),
    Str(String),
    Nil,
    Bool(bool),
}

/// Builder for one bytecode function.
#[derive(Clone, Debug, Default)]
pub struct FunctionBuilder {
    /// Function name (mangled for members).
    pub name: String,
    /// Declared argument count (≤ 255).
    pub arg_count: u8,
    /// Total local slot count, arguments included (≤ 255).
    pub local_count: u8,
    /// Emitted code bytes.
    pub code: Vec<u8>,
}

impl FunctionBuilder {
    /// Current emit position; the next emitted byte lands here.
    #[inline]
    #[must_use]
    pub fn current_pos(&self) -> u32 {
        self.code.len() as u32
    }

    /// Emit a bare opcode.
    pub fn emit(&mut self, op: Op) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    /// Emit a raw byte operand.
    pub fn emit_u8(&mut self, val: u8) -> &mut Self {
        self.code.push(val);
        self
    }

    /// Emit a little-endian u16 operand.
    pub fn emit_u16(&mut self, val: u16) -> &mut Self {
        self.code.extend_from_slice(&val.to_le_bytes());
        self
    }

    /// Emit a little-endian u32 operand.
    pub fn emit_u32(&mut self, val: u32) -> &mut Self {
        self.code.extend_from_slice(&val.to_le_bytes());
        self
    }

    /// Overwrite a previously emitted 4-byte operand (jump patching).
    pub fn patch_u32(&mut self, offset: u32, val: u32) {
        let offset = offset as usize;
        self.code[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }

    // =========================================================================
    // Typed emitters
    // =========================================================================

    pub fn push_const(&mut self, const_idx: u32) -> &mut Self {
        self.emit(Op::PushConst).emit_u32(const_idx)
    }

    pub fn load_local(&mut self, slot: u8) -> &mut Self {
        self.emit(Op::LoadLocal).emit_u8(slot)
    }

    pub fn store_local(&mut self, slot: u8) -> &mut Self {
        self.emit(Op::StoreLocal).emit_u8(slot)
    }

    pub fn load_global(&mut self, name_idx: u32) -> &mut Self {
        self.emit(Op::LoadGlobal).emit_u32(name_idx)
    }

    pub fn store_global(&mut self, name_idx: u32) -> &mut Self {
        self.emit(Op::StoreGlobal).emit_u32(name_idx)
    }

    pub fn call(&mut self, fn_idx: u32, argc: u8) -> &mut Self {
        self.emit(Op::Call).emit_u32(fn_idx).emit_u8(argc)
    }

    pub fn call_native(&mut self, name_idx: u32, argc: u8) -> &mut Self {
        self.emit(Op::CallNative).emit_u32(name_idx).emit_u8(argc)
    }

    pub fn call_ffi(&mut self, lib_idx: u32, sym_idx: u32, argc: u8, sig_idx: u32) -> &mut Self {
        self.emit(Op::CallFfi)
            .emit_u32(lib_idx)
            .emit_u32(sym_idx)
            .emit_u8(argc)
            .emit_u32(sig_idx)
    }

    pub fn ret(&mut self, ret_count: u8) -> &mut Self {
        self.emit(Op::Return).emit_u8(ret_count)
    }

    pub fn jump(&mut self, target: u32) -> &mut Self {
        self.emit(Op::Jump).emit_u32(target)
    }

    pub fn jump_if_false(&mut self, target: u32) -> &mut Self {
        self.emit(Op::JumpIfFalse).emit_u32(target)
    }

    pub fn jump_if_true(&mut self, target: u32) -> &mut Self {
        self.emit(Op::JumpIfTrue).emit_u32(target)
    }

    pub fn new_object(&mut self, class_name_idx: u32) -> &mut Self {
        self.emit(Op::NewObject).emit_u32(class_name_idx)
    }

    pub fn get_field(&mut self, field_name_idx: u32) -> &mut Self {
        self.emit(Op::GetField).emit_u32(field_name_idx)
    }

    pub fn set_field(&mut self, field_name_idx: u32) -> &mut Self {
        self.emit(Op::SetField).emit_u32(field_name_idx)
    }

    pub fn is_instance(&mut self, type_name_idx: u32) -> &mut Self {
        self.emit(Op::IsInstance).emit_u32(type_name_idx)
    }
}

/// Builder for a complete DLBC artifact.
#[derive(Debug, Default)]
pub struct DbcBuilder {
    constants: Vec<Constant>,
    constant_index: FxHashMap<ConstantKey, u32>,
    /// Emitted functions, in registration order.
    pub functions: Vec<FunctionBuilder>,
}

impl DbcBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Constant pool
    // =========================================================================

    fn intern(&mut self, key: ConstantKey, constant: Constant) -> u32 {
        if let Some(&idx) = self.constant_index.get(&key) {
            return idx;
        }
        let idx = self.constants.len() as u32;
        self.constants.push(constant);
        self.constant_index.insert(key, idx);
        idx
    }

    /// Add (or reuse) an i32 constant.
    pub fn add_int(&mut self, value: i32) -> u32 {
        self.intern(ConstantKey::Int(value), Constant::Int(value))
    }

    /// Add (or reuse) an f64 constant.
    pub fn add_float(&mut self, value: f64) -> u32 {
        self.intern(ConstantKey::Float(value.to_bits()), Constant::Float(value))
    }

    /// Add (or reuse) a string constant. Identical text always yields the
    /// same index.
    pub fn add_string(&mut self, value: &str) -> u32 {
        self.intern(
            ConstantKey::Str(value.to_string()),
            Constant::Str(value.to_string()),
        )
    }

    /// Add (or reuse) the nil constant.
    pub fn add_nil(&mut self) -> u32 {
        self.intern(ConstantKey::Nil, Constant::Nil)
    }

    /// Add (or reuse) a bool constant.
    pub fn add_bool(&mut self, value: bool) -> u32 {
        self.intern(ConstantKey::Bool(value), Constant::Bool(value))
    }

    /// The current constant pool.
    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Register a new function and return its builder. The function's table
    /// index is `functions.len() - 1` immediately after this call.
    pub fn add_function(&mut self, name: &str) -> &mut FunctionBuilder {
        self.functions.push(FunctionBuilder {
            name: name.to_string(),
            ..FunctionBuilder::default()
        });
        self.functions.last_mut().expect("just pushed")
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Serialize to DLBC bytes (see the format layout in the loader).
    pub fn to_bytes(&mut self) -> Vec<u8> {
        // Function names live in the constant pool; intern them before the
        // pool is written.
        let name_indices: Vec<u32> = {
            let names: Vec<String> = self.functions.iter().map(|f| f.name.clone()).collect();
            names.iter().map(|n| self.add_string(n)).collect()
        };

        let mut out = Vec::new();
        out.extend_from_slice(DLBC_MAGIC);
        out.push(DLBC_VERSION);

        // Constants section.
        out.extend_from_slice(&(self.constants.len() as u32).to_le_bytes());
        for constant in &self.constants {
            out.push(constant.type_tag());
            match constant {
                Constant::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
                Constant::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
                Constant::Str(s) => {
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                Constant::Nil => {}
                Constant::Bool(b) => out.push(u8::from(*b)),
            }
        }

        // Function headers against a unified code blob.
        out.extend_from_slice(&(self.functions.len() as u32).to_le_bytes());
        let mut code_blob: Vec<u8> = Vec::new();
        for (func, &name_idx) in self.functions.iter().zip(&name_indices) {
            let start = code_blob.len() as u32;
            let size = func.code.len() as u32;
            out.extend_from_slice(&name_idx.to_le_bytes());
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.push(func.arg_count);
            out.push(func.local_count);
            code_blob.extend_from_slice(&func.code);
        }

        // Unified code section.
        out.extend_from_slice(&(code_blob.len() as u32).to_le_bytes());
        out.extend_from_slice(&code_blob);
        out
    }

    /// Serialize and write to a file.
    pub fn write_to_file(&mut self, path: impl AsRef<Path>) -> DropletResult<()> {
        let bytes = self.to_bytes();
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_dedup_returns_same_index() {
        let mut b = DbcBuilder::new();
        let a = b.add_string("main");
        let c = b.add_string("other");
        let d = b.add_string("main");
        assert_eq!(a, d);
        assert_ne!(a, c);
        assert_eq!(b.constants().len(), 2);
    }

    #[test]
    fn test_scalar_dedup() {
        let mut b = DbcBuilder::new();
        assert_eq!(b.add_int(7), b.add_int(7));
        assert_eq!(b.add_nil(), b.add_nil());
        assert_eq!(b.add_bool(true), b.add_bool(true));
        assert_ne!(b.add_bool(true), b.add_bool(false));
        assert_eq!(b.add_float(1.5), b.add_float(1.5));
    }

    #[test]
    fn test_emit_and_patch_jump() {
        let mut b = DbcBuilder::new();
        let f = b.add_function("f");
        let hole = f.current_pos();
        f.jump(0);
        f.emit(Op::Pop);
        let target = f.current_pos();
        f.patch_u32(hole + 1, target);

        assert_eq!(f.code[0], Op::Jump as u8);
        assert_eq!(
            u32::from_le_bytes([f.code[1], f.code[2], f.code[3], f.code[4]]),
            target
        );
    }

    #[test]
    fn test_header_layout() {
        let mut b = DbcBuilder::new();
        {
            let f = b.add_function("main");
            f.arg_count = 0;
            f.local_count = 2;
            f.push_const(0);
            f.ret(1);
        }
        let bytes = b.to_bytes();

        assert_eq!(&bytes[0..4], b"DLBC");
        assert_eq!(bytes[4], 1);

        // One constant (the function name string).
        let const_count = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
        assert_eq!(const_count, 1);
        assert_eq!(bytes[9], 3); // string tag
        let len = u32::from_le_bytes(bytes[10..14].try_into().unwrap());
        assert_eq!(len, 4);
        assert_eq!(&bytes[14..18], b"main");

        let fn_count = u32::from_le_bytes(bytes[18..22].try_into().unwrap());
        assert_eq!(fn_count, 1);
    }

    #[test]
    fn test_code_blob_concatenation() {
        let mut b = DbcBuilder::new();
        b.add_function("a").emit(Op::Pop);
        b.add_function("b").emit(Op::Dup).emit(Op::Pop);
        let bytes = b.to_bytes();
        // The final u32 before the blob is the blob size: 1 + 2 bytes.
        let blob = &bytes[bytes.len() - 3..];
        assert_eq!(blob, &[Op::Pop as u8, Op::Dup as u8, Op::Pop as u8]);
    }

    #[test]
    fn test_emit_u16_little_endian() {
        let mut b = DbcBuilder::new();
        let f = b.add_function("f");
        f.emit_u16(0x1234);
        assert_eq!(f.code, vec![0x34, 0x12]);
    }
}
