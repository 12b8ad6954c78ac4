//! Value-encoding helpers for Cranelift IR generation
//!
//! Inline versions of the host's value macros. These mirror the encoding in
//! [`crate::constants::HostValue`]: small integers are tagged with the low
//! bit, `false` and `nil` are the only falsy words.

use cranelift_codegen::ir::{self, condcodes::IntCC, InstBuilder};
use cranelift_frontend::FunctionBuilder;

use crate::config::HostAbi;
use crate::constants::{type_mask, HostValue};
use crate::error::BridgeResult;
use crate::layout::TypeLayoutTable;

use super::FunctionEmitter;

/// Tag an integer as a fixnum: `(v << 1) | 1`
pub fn emit_int2fix(builder: &mut FunctionBuilder<'_>, val: ir::Value) -> ir::Value {
    let shifted = builder.ins().ishl_imm(val, 1);
    builder.ins().bor_imm(shifted, 1)
}

/// Untag a fixnum: arithmetic `v >> 1`
pub fn emit_fix2int(builder: &mut FunctionBuilder<'_>, val: ir::Value) -> ir::Value {
    builder.ins().sshr_imm(val, 1)
}

/// `i8` 1 if the word is a fixnum
pub fn emit_is_fixnum(builder: &mut FunctionBuilder<'_>, val: ir::Value) -> ir::Value {
    let bit = builder.ins().band_imm(val, 1);
    builder.ins().icmp_imm(IntCC::NotEqual, bit, 0)
}

/// `i8` 1 if the word is truthy: `(v & ~Qnil) != 0`
pub fn emit_rtest(builder: &mut FunctionBuilder<'_>, val: ir::Value) -> ir::Value {
    let masked = builder.ins().band_imm(val, !(HostValue::NIL.bits() as i64));
    builder.ins().icmp_imm(IntCC::NotEqual, masked, 0)
}

/// Host boolean from any integer condition: `(c != 0) << 1`
pub fn emit_to_rbool(
    builder: &mut FunctionBuilder<'_>,
    cond: ir::Value,
    value_type: ir::Type,
) -> ir::Value {
    let is_set = builder.ins().icmp_imm(IntCC::NotEqual, cond, 0);
    let widened = builder.ins().uextend(value_type, is_set);
    builder.ins().ishl_imm(widened, 1)
}

/// `RBasic.flags & T_MASK` of a heap object
pub fn emit_builtin_type(
    emitter: &mut FunctionEmitter<'_>,
    layouts: &TypeLayoutTable,
    abi: HostAbi,
    obj: ir::Value,
) -> BridgeResult<ir::Value> {
    let flags = layouts.lookup("RBasic", "flags")?;
    let word = emitter.load_field(flags, obj);
    Ok(emitter.builder().ins().band_imm(word, type_mask(abi) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::MethodCompiler;
    use cranelift_codegen::ir::types;

    fn compile_unary<F>(
        compiler: &mut MethodCompiler,
        name: &str,
        emit: F,
    ) -> extern "C" fn(u64) -> u64
    where
        F: FnOnce(&mut FunctionBuilder<'_>, ir::Value) -> ir::Value,
    {
        let sig = compiler.signature(&[types::I64], Some(types::I64));
        let method = compiler
            .compile(name, &sig, |e| {
                let arg = e.params()[0];
                let out = emit(e.builder(), arg);
                let out = if e.value_type(out) == types::I8 {
                    e.builder().ins().uextend(types::I64, out)
                } else {
                    out
                };
                Ok(vec![out])
            })
            .unwrap();
        unsafe { std::mem::transmute(method.code_ptr()) }
    }

    #[test]
    fn test_fixnum_helpers() {
        let mut compiler = MethodCompiler::new().unwrap();
        let int2fix = compile_unary(&mut compiler, "int2fix", emit_int2fix);
        let fix2int = compile_unary(&mut compiler, "fix2int", emit_fix2int);
        let is_fixnum = compile_unary(&mut compiler, "is_fixnum", emit_is_fixnum);

        assert_eq!(int2fix(21), HostValue::from_fixnum(21).bits());
        assert_eq!(fix2int(HostValue::from_fixnum(-8).bits()) as i64, -8);
        assert_eq!(is_fixnum(HostValue::from_fixnum(3).bits()), 1);
        assert_eq!(is_fixnum(HostValue::NIL.bits()), 0);
    }

    #[test]
    fn test_truthiness_helpers() {
        let mut compiler = MethodCompiler::new().unwrap();
        let rtest = compile_unary(&mut compiler, "rtest", emit_rtest);
        let to_rbool =
            compile_unary(&mut compiler, "to_rbool", |b, v| emit_to_rbool(b, v, types::I64));

        assert_eq!(rtest(HostValue::NIL.bits()), 0);
        assert_eq!(rtest(HostValue::FALSE.bits()), 0);
        assert_eq!(rtest(HostValue::TRUE.bits()), 1);
        assert_eq!(rtest(HostValue::from_fixnum(0).bits()), 1);
        assert_eq!(to_rbool(0), HostValue::FALSE.bits());
        assert_eq!(to_rbool(5), HostValue::TRUE.bits());
    }
}
