//! Value types as seen by the JIT.

use crate::error::EnvironError;

/// The kind of a value flowing through compiled code.
///
/// `Long` and `Double` are *wide*: they occupy two 32-bit argument slots in
/// a method signature. `Reference` is pointer-sized on the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VmType {
    /// No value; only valid as a return type.
    Void,
    /// 8-bit signed integer.
    Byte,
    /// 8-bit boolean.
    Boolean,
    /// 16-bit unsigned UTF-16 code unit.
    Char,
    /// 16-bit signed integer.
    Short,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer (wide).
    Long,
    /// 32-bit IEEE float.
    Float,
    /// 64-bit IEEE float (wide).
    Double,
    /// Object or array reference.
    Reference,
}

impl VmType {
    /// Does this type occupy two 32-bit argument slots?
    pub fn is_wide(self) -> bool {
        matches!(self, VmType::Long | VmType::Double)
    }

    /// Is this a floating-point type (allocated to XMM registers)?
    pub fn is_float(self) -> bool {
        matches!(self, VmType::Float | VmType::Double)
    }

    /// Number of 32-bit argument slots a value of this type consumes.
    pub fn slot_count(self) -> u32 {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    /// The type a value of this kind has on the operand stack, where
    /// sub-int types are widened to `Int`.
    pub fn stack_type(self) -> VmType {
        match self {
            VmType::Byte | VmType::Boolean | VmType::Char | VmType::Short => VmType::Int,
            other => other,
        }
    }
}

/// Parse a method descriptor such as `(IJLjava/lang/String;)V` into its
/// argument types and return type.
pub fn parse_method_descriptor(desc: &str) -> Result<(Vec<VmType>, VmType), EnvironError> {
    let bytes = desc.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(EnvironError::BadDescriptor(desc.to_owned()));
    }

    let mut args = Vec::new();
    let mut pos = 1;
    while pos < bytes.len() && bytes[pos] != b')' {
        let (ty, next) = parse_field_type(desc, pos)?;
        args.push(ty);
        pos = next;
    }
    if pos >= bytes.len() {
        return Err(EnvironError::BadDescriptor(desc.to_owned()));
    }

    pos += 1; // consume ')'
    let ret = if bytes.get(pos) == Some(&b'V') {
        if pos + 1 != bytes.len() {
            return Err(EnvironError::BadDescriptor(desc.to_owned()));
        }
        VmType::Void
    } else {
        let (ty, next) = parse_field_type(desc, pos)?;
        if next != bytes.len() {
            return Err(EnvironError::BadDescriptor(desc.to_owned()));
        }
        ty
    };

    Ok((args, ret))
}

fn parse_field_type(desc: &str, pos: usize) -> Result<(VmType, usize), EnvironError> {
    let bytes = desc.as_bytes();
    let ty = match bytes.get(pos) {
        Some(b'B') => VmType::Byte,
        Some(b'Z') => VmType::Boolean,
        Some(b'C') => VmType::Char,
        Some(b'S') => VmType::Short,
        Some(b'I') => VmType::Int,
        Some(b'J') => VmType::Long,
        Some(b'F') => VmType::Float,
        Some(b'D') => VmType::Double,
        Some(b'L') => {
            let end = desc[pos..]
                .find(';')
                .ok_or_else(|| EnvironError::BadDescriptor(desc.to_owned()))?;
            return Ok((VmType::Reference, pos + end + 1));
        }
        Some(b'[') => {
            // Arrays are references; skip the element type.
            let (_, next) = parse_field_type(desc, pos + 1)?;
            return Ok((VmType::Reference, next));
        }
        _ => return Err(EnvironError::BadDescriptor(desc.to_owned())),
    };
    Ok((ty, pos + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_primitive_args() {
        let (args, ret) = parse_method_descriptor("(IJ)V").unwrap();
        assert_eq!(args, vec![VmType::Int, VmType::Long]);
        assert_eq!(ret, VmType::Void);
    }

    #[test]
    fn parse_reference_and_array() {
        let (args, ret) = parse_method_descriptor("(Ljava/lang/String;[[I)Ljava/lang/Object;")
            .unwrap();
        assert_eq!(args, vec![VmType::Reference, VmType::Reference]);
        assert_eq!(ret, VmType::Reference);
    }

    #[test]
    fn reject_malformed() {
        assert!(parse_method_descriptor("IJ)V").is_err());
        assert!(parse_method_descriptor("(Q)V").is_err());
        assert!(parse_method_descriptor("(I").is_err());
        assert!(parse_method_descriptor("(Ljava/lang/String)V").is_err());
    }

    #[test]
    fn wide_types_take_two_slots() {
        assert_eq!(VmType::Long.slot_count(), 2);
        assert_eq!(VmType::Double.slot_count(), 2);
        assert_eq!(VmType::Reference.slot_count(), 1);
        assert_eq!(VmType::Short.stack_type(), VmType::Int);
    }
}
