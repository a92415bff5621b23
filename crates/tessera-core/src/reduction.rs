use crate::scalar::Scalar;
use crate::types::Type;

/// A user-defined reduction operator over elements of [`ReductionOp::value_type`].
///
/// Both methods operate on single elements encoded in host-native bytes.
pub trait ReductionOp: Send + Sync {
    fn value_type(&self) -> Type;

    /// The value `x` such that combining `x` with any `y` yields `y`.
    fn identity(&self) -> Scalar;

    /// Reduces `rhs` into the current value `lhs`.
    fn apply(&self, lhs: &mut [u8], rhs: &[u8]);

    /// Combines two partial contributions, leaving the result in `rhs1`.
    fn fold(&self, rhs1: &mut [u8], rhs2: &[u8]);
}
