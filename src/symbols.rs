use crate::errors::CompileError;
use crate::values::ValType;
use core::ffi::c_void;
use smallvec::SmallVec;

/// How an import resolves into generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Resolved at compile time; callsites are emitted as direct calls.
    Static,
    /// Resolved at init into a link-data slot; callsites call indirectly
    /// through the slot.
    Dynamic,
}

/// Calling convention of a host function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiVersion {
    /// Scalar arguments per the platform C ABI plus a trailing `ctx` pointer.
    V1,
    /// `(params_ptr, results_ptr, ctx)`, each slot 8 bytes regardless of
    /// type. Supports multiple results.
    V2,
}

/// Raw callable installed into a link slot. For [`AbiVersion::V2`] this is
/// a [`V2Fn`]; for V1 it is an `extern "C"` function whose scalar signature
/// matches the symbol's signature string.
pub type NativeFnPtr = *const c_void;

/// Host function signature for [`AbiVersion::V2`] symbols.
pub type V2Fn = unsafe extern "C" fn(params: *const u64, results: *mut u64, ctx: *mut c_void);

/// A host function descriptor the embedder supplies at compile and at init.
///
/// The signature string has the shape `"(args)returns"` with one character
/// per value: `i`=i32, `I`=i64, `f`=f32, `F`=f64. Link-time matching
/// compares module, symbol and signature character by character.
#[derive(Debug, Clone)]
pub struct NativeSymbol {
    pub module: &'static str,
    pub name: &'static str,
    pub signature: &'static str,
    pub ptr: NativeFnPtr,
    pub linkage: Linkage,
    pub abi: AbiVersion,
}

// The pointer is only ever invoked from the owning runtime's thread.
unsafe impl Send for NativeSymbol {}
unsafe impl Sync for NativeSymbol {}

impl NativeSymbol {
    pub fn new(
        module: &'static str,
        name: &'static str,
        signature: &'static str,
        ptr: NativeFnPtr,
        linkage: Linkage,
        abi: AbiVersion,
    ) -> Self {
        Self {
            module,
            name,
            signature,
            ptr,
            linkage,
            abi,
        }
    }

    pub fn matches(&self, module: &str, name: &str, signature: &str) -> bool {
        self.module == module && self.name == name && self.signature == signature
    }
}

/// A parsed `"(args)returns"` signature string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    pub params: SmallVec<[ValType; 8]>,
    pub results: SmallVec<[ValType; 2]>,
}

impl ParsedSignature {
    pub fn parse(signature: &str) -> crate::Result<Self> {
        let rest = signature
            .strip_prefix('(')
            .ok_or_else(|| bad_signature(signature))?;
        let close = rest.find(')').ok_or_else(|| bad_signature(signature))?;
        let (args, returns) = rest.split_at(close);

        let mut parsed = Self {
            params: SmallVec::new(),
            results: SmallVec::new(),
        };
        for c in args.chars() {
            parsed
                .params
                .push(ValType::from_sig_char(c).ok_or_else(|| bad_signature(signature))?);
        }
        for c in returns[1..].chars() {
            parsed
                .results
                .push(ValType::from_sig_char(c).ok_or_else(|| bad_signature(signature))?);
        }
        Ok(parsed)
    }
}

fn bad_signature(signature: &str) -> CompileError {
    CompileError::Linking {
        module: String::new(),
        name: String::new(),
        message: format!("malformed signature string `{signature}`"),
    }
}

/// Render a function type as a signature string, the exact byte sequence
/// stored in the frozen binary's export records.
pub fn signature_string(params: &[ValType], results: &[ValType]) -> String {
    let mut s = String::with_capacity(params.len() + results.len() + 2);
    s.push('(');
    for ty in params {
        s.push(ty.sig_char());
    }
    s.push(')');
    for ty in results {
        s.push(ty.sig_char());
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        let sig = ParsedSignature::parse("(iIfF)i").unwrap();
        assert_eq!(
            sig.params.as_slice(),
            &[ValType::I32, ValType::I64, ValType::F32, ValType::F64]
        );
        assert_eq!(sig.results.as_slice(), &[ValType::I32]);
        assert_eq!(signature_string(&sig.params, &sig.results), "(iIfF)i");

        let empty = ParsedSignature::parse("()").unwrap();
        assert!(empty.params.is_empty() && empty.results.is_empty());

        assert!(ParsedSignature::parse("i)i").is_err());
        assert!(ParsedSignature::parse("(x)").is_err());
    }
}
