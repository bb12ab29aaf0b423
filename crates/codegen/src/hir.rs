//! High-level tree IR.
//!
//! One statement list per basic block; statements hold expression trees
//! built by abstract interpretation of the operand stack. Each expression
//! appears in exactly one tree position — values that would be consumed
//! twice are captured into a temporary first, so ownership is plain `Box`.

use std::sync::Arc;

use javelin_environ::{Class, Field, Method, VmType};

use crate::cu::BlockId;

/// Binary operators, covering both arithmetic and the comparisons used in
/// `If` conditions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Rem,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
    /// Shift left.
    Shl,
    /// Arithmetic shift right.
    Shr,
    /// Logical shift right.
    Ushr,
    /// Three-way compare biased to -1 on unordered (`fcmpl`, `dcmpl`, `lcmp`).
    CmpL,
    /// Three-way compare biased to +1 on unordered (`fcmpg`, `dcmpg`).
    CmpG,
    /// Equality test.
    Eq,
    /// Inequality test.
    Ne,
    /// Signed less-than.
    Lt,
    /// Signed greater-or-equal.
    Ge,
    /// Signed greater-than.
    Gt,
    /// Signed less-or-equal.
    Le,
}

impl BinOp {
    /// Is this one of the comparison operators valid in an `If` condition?
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Ge | BinOp::Gt | BinOp::Le
        )
    }
}

/// How a method is invoked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvokeKind {
    /// `invokevirtual`: dispatch through the receiver's vtable.
    Virtual,
    /// `invokeinterface`: dispatch through the itable resolver stub.
    Interface,
    /// `invokespecial`: direct call to a known method.
    Special,
    /// `invokestatic`: direct call, no receiver.
    Static,
}

/// An expression tree node.
#[derive(Clone, Debug)]
pub enum Expr {
    /// Integer-class constant: int, long, or the null reference (0).
    Value {
        /// Result type.
        ty: VmType,
        /// The constant bits.
        value: i64,
    },
    /// Floating-point constant.
    FValue {
        /// Result type.
        ty: VmType,
        /// The constant value.
        value: f64,
    },
    /// String literal resolved from the constant pool.
    StringConst {
        /// The UTF-8 payload.
        value: Arc<str>,
    },
    /// A local variable slot.
    Local {
        /// Value type.
        ty: VmType,
        /// Local slot index.
        index: u16,
    },
    /// A compiler temporary; behaves like a local beyond `max_locals`.
    Temporary {
        /// Value type.
        ty: VmType,
        /// Temporary id, dense per unit.
        id: u32,
    },
    /// Binary operation.
    Binop {
        /// Result type.
        ty: VmType,
        /// Operator.
        op: BinOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Arithmetic negation.
    Neg {
        /// Result type.
        ty: VmType,
        /// Operand.
        value: Box<Expr>,
    },
    /// Numeric conversion.
    Convert {
        /// Source type.
        from: VmType,
        /// Destination type.
        to: VmType,
        /// Operand.
        value: Box<Expr>,
    },
    /// Truncate an int to byte/char/short and re-extend (`i2b`, `i2c`, `i2s`).
    Truncate {
        /// The sub-int type to truncate to.
        to: VmType,
        /// Operand.
        value: Box<Expr>,
    },
    /// Array element load. Null and bounds checks are separate statements
    /// emitted before the deref.
    ArrayDeref {
        /// Element type.
        ty: VmType,
        /// Array reference.
        array: Box<Expr>,
        /// Element index.
        index: Box<Expr>,
    },
    /// `arraylength`.
    ArrayLength {
        /// Array reference.
        array: Box<Expr>,
    },
    /// Instance field load.
    InstanceField {
        /// Field type.
        ty: VmType,
        /// Resolved field.
        field: Arc<Field>,
        /// Object reference.
        object: Box<Expr>,
    },
    /// Static field load; the access site is patched after class init.
    StaticField {
        /// Field type.
        ty: VmType,
        /// Declaring class.
        class: Arc<Class>,
        /// Resolved field.
        field: Arc<Field>,
    },
    /// Method invocation.
    Invoke {
        /// Return type (`Void` for none).
        ty: VmType,
        /// Dispatch kind.
        kind: InvokeKind,
        /// Resolved target (for virtual/interface: the declared method).
        method: Arc<Method>,
        /// Arguments, receiver first for instance invokes.
        args: Vec<Expr>,
    },
    /// `new`: allocate an instance.
    NewObject {
        /// The instantiated class.
        class: Arc<Class>,
    },
    /// `anewarray` / `newarray`.
    NewArray {
        /// Element class for reference arrays, or `None` with a primitive tag.
        element: Option<Arc<Class>>,
        /// Primitive array type tag when `element` is `None`.
        atype: u8,
        /// Array length.
        length: Box<Expr>,
    },
    /// `multianewarray`.
    NewMultiArray {
        /// The array class.
        class: Arc<Class>,
        /// Dimension lengths, outermost first.
        dimensions: Vec<Expr>,
    },
    /// `instanceof`, producing an int.
    InstanceOf {
        /// The tested class.
        class: Arc<Class>,
        /// The tested reference.
        object: Box<Expr>,
    },
    /// The native address of a block head, pushed by `jsr` and consumed
    /// by the indirect jump of `ret`.
    ReturnAddress {
        /// The return target.
        block: BlockId,
    },
}

impl Expr {
    /// The type a value of this expression has on the operand stack.
    pub fn ty(&self) -> VmType {
        match self {
            Expr::Value { ty, .. }
            | Expr::FValue { ty, .. }
            | Expr::Local { ty, .. }
            | Expr::Temporary { ty, .. }
            | Expr::Binop { ty, .. }
            | Expr::Neg { ty, .. }
            | Expr::ArrayDeref { ty, .. }
            | Expr::InstanceField { ty, .. }
            | Expr::StaticField { ty, .. }
            | Expr::Invoke { ty, .. } => ty.stack_type(),
            Expr::Convert { to, .. } => to.stack_type(),
            Expr::Truncate { .. } => VmType::Int,
            Expr::ArrayLength { .. } | Expr::InstanceOf { .. } => VmType::Int,
            Expr::StringConst { .. }
            | Expr::NewObject { .. }
            | Expr::NewArray { .. }
            | Expr::NewMultiArray { .. }
            | Expr::ReturnAddress { .. } => VmType::Reference,
        }
    }

    /// Can this expression be re-evaluated freely? Used by the `dup` family
    /// to decide between copying the tree and capturing it in a temporary.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Expr::Value { .. }
                | Expr::FValue { .. }
                | Expr::Local { .. }
                | Expr::Temporary { .. }
                | Expr::StringConst { .. }
                | Expr::ReturnAddress { .. }
        )
    }
}

/// A statement.
#[derive(Clone, Debug)]
pub enum Stmt {
    /// Store into a local or temporary.
    Store {
        /// Destination: `Local` or `Temporary`.
        dest: Expr,
        /// Stored value.
        value: Expr,
    },
    /// Array element store. The null/bounds/store checks precede this
    /// statement in the block.
    ArrayStore {
        /// Element type.
        ty: VmType,
        /// Array reference.
        array: Expr,
        /// Element index.
        index: Expr,
        /// Stored value.
        value: Expr,
    },
    /// Instance field store.
    FieldStore {
        /// Resolved field.
        field: Arc<Field>,
        /// Object reference.
        object: Expr,
        /// Stored value.
        value: Expr,
    },
    /// Static field store.
    StaticStore {
        /// Declaring class.
        class: Arc<Class>,
        /// Resolved field.
        field: Arc<Field>,
        /// Stored value.
        value: Expr,
    },
    /// Evaluate for side effects and discard the result.
    Expression {
        /// The evaluated expression.
        expr: Expr,
    },
    /// Conditional branch; falls through when false.
    If {
        /// A comparison `Binop`.
        cond: Expr,
        /// Branch target when the condition holds.
        target: BlockId,
    },
    /// Unconditional branch.
    Goto {
        /// Branch target.
        target: BlockId,
    },
    /// `tableswitch`/`lookupswitch` after normalisation.
    Switch {
        /// Scrutinee.
        value: Expr,
        /// `(match, target)` pairs in key order.
        cases: Vec<(i32, BlockId)>,
        /// Default target.
        default: BlockId,
    },
    /// Return from the method.
    Return {
        /// Returned value, absent for `void`.
        value: Option<Expr>,
    },
    /// `athrow`.
    Throw {
        /// The thrown reference.
        exception: Expr,
    },
    /// `monitorenter`.
    MonitorEnter {
        /// Locked object.
        object: Expr,
    },
    /// `monitorexit`.
    MonitorExit {
        /// Unlocked object.
        object: Expr,
    },
    /// Trap if the reference is null.
    NullCheck {
        /// Checked reference.
        object: Expr,
    },
    /// Trap if the index is outside the array bounds.
    BoundsCheck {
        /// Checked array.
        array: Expr,
        /// Checked index.
        index: Expr,
    },
    /// Trap with `ArithmeticException` if the divisor is zero.
    DivZeroCheck {
        /// Operand type.
        ty: VmType,
        /// Checked divisor.
        value: Expr,
    },
    /// Trap with `ArrayStoreException` on element-type mismatch.
    StoreCheck {
        /// Target array.
        array: Expr,
        /// Stored reference.
        value: Expr,
    },
    /// `checkcast`.
    CheckCast {
        /// The cast class.
        class: Arc<Class>,
        /// Checked reference.
        object: Expr,
    },
    /// Indirect jump through a local holding a `jsr` return address.
    RetJump {
        /// The local holding the return target.
        local: u16,
    },
}
