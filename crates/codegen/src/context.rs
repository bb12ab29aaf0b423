//! The per-method compilation pipeline.

use log::{debug, trace};

use crate::cfg::analyze_control_flow;
use crate::cu::CompilationUnit;
use crate::error::CodegenResult;
use crate::hirgen::build_hir;
use crate::hooks::CompileEnv;
use crate::isa::x86::{emit_code, select_instructions};
use crate::regalloc;

/// Run the full pipeline over a freshly created unit: control-flow
/// analysis, HIR construction, instruction selection, register
/// allocation, and emission. On success the unit's `objcode` buffer holds
/// the method's machine code with its relocations, ready for the
/// publisher.
pub fn compile_method(cu: &mut CompilationUnit, env: &dyn CompileEnv) -> CodegenResult<()> {
    trace!(
        "compile: {}.{}{}",
        cu.method.class().name,
        cu.method.name,
        cu.method.descriptor
    );

    analyze_control_flow(cu)?;
    build_hir(cu, env)?;
    select_instructions(cu, env)?;
    regalloc::allocate(cu)?;
    emit_code(cu, env)?;

    debug!(
        "compile: {}.{}{} done, {} bytes",
        cu.method.class().name,
        cu.method.name,
        cu.method.descriptor,
        cu.objcode.offset()
    );
    Ok(())
}
