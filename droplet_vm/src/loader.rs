//! DLBC artifact loader.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic      4 bytes = "DLBC"
//! version    u8      = 1
//! constCount u32, then constCount entries:
//!     type u8 ∈ {1=i32, 2=f64, 3=string, 4=nil, 5=bool}, payload per type
//! fnCount    u32, then fnCount headers:
//!     nameIndex u32 (string constant), codeStart u32, codeSize u32,
//!     argCount u8, localCount u8
//! codeSize   u32, then the unified code blob
//! ```
//!
//! Every structural inconsistency — bad magic, unknown version, truncated
//! section, out-of-range index, non-string name — is a load error; nothing
//! is installed into the VM until the whole artifact validates.

use crate::function::Function;
use crate::vm::Vm;
use droplet_compiler::bytecode::{DLBC_MAGIC, DLBC_VERSION};
use droplet_core::{DropletError, DropletResult, Value};
use std::path::Path;

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> DropletResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| truncated(what))?;
        if end > self.bytes.len() {
            return Err(truncated(what));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self, what: &str) -> DropletResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u32(&mut self, what: &str) -> DropletResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self, what: &str) -> DropletResult<i32> {
        let b = self.take(4, what)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f64(&mut self, what: &str) -> DropletResult<f64> {
        let b = self.take(8, what)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(f64::from_le_bytes(bytes))
    }
}

fn truncated(what: &str) -> DropletError {
    DropletError::load(format!("truncated DLBC artifact while reading {what}"))
}

struct FnHeader {
    name_index: u32,
    start: u32,
    size: u32,
    arg_count: u8,
    local_count: u8,
}

/// Load a DLBC artifact from a file into the VM.
pub fn load_file(vm: &mut Vm, path: impl AsRef<Path>) -> DropletResult<()> {
    let bytes = std::fs::read(path)?;
    load_bytes(vm, &bytes)
}

/// Load a DLBC artifact from memory into the VM. On success the constant
/// pool, function table, and name index are installed and any function can
/// be invoked by name.
pub fn load_bytes(vm: &mut Vm, bytes: &[u8]) -> DropletResult<()> {
    let mut r = Reader::new(bytes);

    let magic = r.take(4, "magic")?;
    if magic != DLBC_MAGIC {
        return Err(DropletError::load("bad magic (not a DLBC artifact)"));
    }

    let version = r.read_u8("version")?;
    if version != DLBC_VERSION {
        return Err(DropletError::load(format!(
            "unsupported DLBC version {version} (expected {DLBC_VERSION})"
        )));
    }

    // Constant pool. Strings become heap objects via the VM allocator.
    let const_count = r.read_u32("constant count")?;
    let mut pool: Vec<Value> = Vec::with_capacity(const_count as usize);
    // Raw string texts, kept so function names can be validated below
    // without chasing the heap.
    let mut string_texts: Vec<Option<String>> = Vec::with_capacity(const_count as usize);

    for i in 0..const_count {
        let tag = r.read_u8("constant tag")?;
        match tag {
            1 => {
                let v = r.read_i32("int constant")?;
                pool.push(Value::int(i64::from(v)));
                string_texts.push(None);
            }
            2 => {
                let v = r.read_f64("float constant")?;
                pool.push(Value::float(v));
                string_texts.push(None);
            }
            3 => {
                let len = r.read_u32("string length")?;
                let data = r.take(len as usize, "string bytes")?;
                let text = String::from_utf8_lossy(data).into_owned();
                let obj = vm.allocator.alloc_string(text.clone());
                pool.push(Value::object(obj));
                string_texts.push(Some(text));
            }
            4 => {
                pool.push(Value::nil());
                string_texts.push(None);
            }
            5 => {
                let v = r.read_u8("bool constant")?;
                pool.push(Value::bool(v != 0));
                string_texts.push(None);
            }
            other => {
                return Err(DropletError::load(format!(
                    "unknown constant type {other} at pool index {i}"
                )));
            }
        }
    }

    // Function headers.
    let fn_count = r.read_u32("function count")?;
    let mut headers = Vec::with_capacity(fn_count as usize);
    for _ in 0..fn_count {
        headers.push(FnHeader {
            name_index: r.read_u32("function name index")?,
            start: r.read_u32("function code start")?,
            size: r.read_u32("function code size")?,
            arg_count: r.read_u8("function arg count")?,
            local_count: r.read_u8("function local count")?,
        });
    }

    // Unified code blob.
    let code_size = r.read_u32("code size")?;
    let code = r.take(code_size as usize, "code blob")?;

    // Validate and install functions.
    for header in &headers {
        let name = string_texts
            .get(header.name_index as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                DropletError::load(format!(
                    "function name index {} is not a string constant",
                    header.name_index
                ))
            })?;

        let start = header.start as usize;
        let end = start
            .checked_add(header.size as usize)
            .ok_or_else(|| DropletError::load("function code range overflows"))?;
        if end > code.len() {
            return Err(DropletError::load(format!(
                "function '{name}' code range {start}..{end} exceeds blob of {} bytes",
                code.len()
            )));
        }

        let idx = vm.functions.len() as u32;
        vm.function_index_by_name.insert(name.clone(), idx);
        vm.functions.push(Function {
            name: name.clone(),
            code: code[start..end].to_vec(),
            arg_count: header.arg_count,
            local_count: header.local_count,
        });
    }

    vm.constants.extend(pool);
    Ok(())
}
