//! Foreign-function call surface.
//!
//! The VM core treats FFI as a declared boundary: `CALL_FFI` resolves the
//! library, symbol, and signature strings and routes the call to an
//! embedder-installed [`FfiDispatcher`]. Without a dispatcher the call
//! consumes its arguments and yields nil.
//!
//! Signature strings take the form `"<argKinds>-><retKind>"`, each kind one
//! of `i` (int64), `f` (double), `b` (bool), `s` (string); empty arguments
//! and a `v` return are valid: `"ff->f"`, `"->v"`, `"s->i"`.

use droplet_core::{DropletError, DropletResult, Value};

/// One marshalled FFI kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FfiKind {
    Int,
    Float,
    Bool,
    Str,
    Void,
}

impl FfiKind {
    fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'i' => Self::Int,
            'f' => Self::Float,
            'b' => Self::Bool,
            's' => Self::Str,
            'v' => Self::Void,
            _ => return None,
        })
    }
}

/// A parsed FFI signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FfiSignature {
    pub args: Vec<FfiKind>,
    pub ret: FfiKind,
}

impl FfiSignature {
    /// Parse `"<argKinds>-><retKind>"`.
    pub fn parse(signature: &str) -> DropletResult<Self> {
        let Some((args_str, ret_str)) = signature.split_once("->") else {
            return Err(DropletError::load(format!(
                "malformed FFI signature '{signature}': missing '->'"
            )));
        };

        let mut args = Vec::new();
        for c in args_str.chars() {
            let Some(kind) = FfiKind::from_char(c) else {
                return Err(DropletError::load(format!(
                    "malformed FFI signature '{signature}': unknown kind '{c}'"
                )));
            };
            if kind == FfiKind::Void {
                return Err(DropletError::load(format!(
                    "malformed FFI signature '{signature}': 'v' is not an argument kind"
                )));
            }
            args.push(kind);
        }

        let ret = match ret_str {
            "" | "v" => FfiKind::Void,
            s if s.len() == 1 => {
                let c = s.chars().next().expect("len checked");
                FfiKind::from_char(c).ok_or_else(|| {
                    DropletError::load(format!(
                        "malformed FFI signature '{signature}': unknown return kind '{c}'"
                    ))
                })?
            }
            _ => {
                return Err(DropletError::load(format!(
                    "malformed FFI signature '{signature}': multi-kind return"
                )));
            }
        };

        Ok(Self { args, ret })
    }
}

/// A value crossing the FFI boundary. String payloads are owned so the
/// dispatcher never touches the GC heap; the VM allocates the result object.
#[derive(Clone, Debug, PartialEq)]
pub enum FfiValue {
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// Embedder hook receiving foreign calls.
pub trait FfiDispatcher {
    /// Perform the call. `args` follow declaration order; string arguments
    /// arrive pre-rendered in `string_args` at matching indices.
    fn call(
        &mut self,
        lib: &str,
        symbol: &str,
        signature: &FfiSignature,
        args: &[Value],
        string_args: &[Option<String>],
    ) -> FfiValue;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_floats_to_float() {
        let sig = FfiSignature::parse("ff->f").expect("parse");
        assert_eq!(sig.args, vec![FfiKind::Float, FfiKind::Float]);
        assert_eq!(sig.ret, FfiKind::Float);
    }

    #[test]
    fn test_parse_empty_args_and_void_return() {
        let sig = FfiSignature::parse("->v").expect("parse");
        assert!(sig.args.is_empty());
        assert_eq!(sig.ret, FfiKind::Void);

        let sig = FfiSignature::parse("->").expect("parse");
        assert_eq!(sig.ret, FfiKind::Void);
    }

    #[test]
    fn test_parse_string_arg() {
        let sig = FfiSignature::parse("s->i").expect("parse");
        assert_eq!(sig.args, vec![FfiKind::Str]);
        assert_eq!(sig.ret, FfiKind::Int);
    }

    #[test]
    fn test_malformed_signatures() {
        assert!(FfiSignature::parse("ff").is_err());
        assert!(FfiSignature::parse("x->i").is_err());
        assert!(FfiSignature::parse("v->i").is_err());
        assert!(FfiSignature::parse("i->ff").is_err());
    }
}
