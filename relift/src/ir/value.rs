use crate::ir::inst::CastOp;
use crate::ir::{FuncId, GlobalId, InstId};
use crate::types::TypeId;

/// A constant, including constant-expression cast trees.
///
/// Scalar payloads carry the raw bit pattern; floats are stored by their
/// encoding, not their numeric value.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
	Int { ty: TypeId, bits: u128 },
	Float { ty: TypeId, bits: u128 },
	Null { ty: TypeId },
	Undef { ty: TypeId },
	/// The address of a global; `ty` is the global's pointer type.
	GlobalAddr { global: GlobalId, ty: TypeId },
	Array { ty: TypeId, elems: Vec<Constant> },
	Struct { ty: TypeId, fields: Vec<Constant> },
	Cast { op: CastOp, ty: TypeId, value: Box<Constant> },
}

impl Constant {
	pub fn ty(&self) -> TypeId {
		match self {
			Constant::Int { ty, .. }
			| Constant::Float { ty, .. }
			| Constant::Null { ty }
			| Constant::Undef { ty }
			| Constant::GlobalAddr { ty, .. }
			| Constant::Array { ty, .. }
			| Constant::Struct { ty, .. }
			| Constant::Cast { ty, .. } => *ty,
		}
	}

	/// Whether this tree references `global` directly.
	pub fn references(&self, global: GlobalId) -> bool {
		match self {
			Constant::GlobalAddr { global: g, .. } => *g == global,
			Constant::Cast { value, .. } => value.references(global),
			Constant::Array { elems, .. } => elems.iter().any(|e| e.references(global)),
			Constant::Struct { fields, .. } => fields.iter().any(|f| f.references(global)),
			_ => false,
		}
	}

	/// Collects every global referenced by this tree.
	pub fn referenced_globals(&self, out: &mut Vec<GlobalId>) {
		match self {
			Constant::GlobalAddr { global, .. } => {
				if !out.contains(global) {
					out.push(*global);
				}
			}
			Constant::Cast { value, .. } => value.referenced_globals(out),
			Constant::Array { elems, .. } => {
				for elem in elems {
					elem.referenced_globals(out);
				}
			}
			Constant::Struct { fields, .. } => {
				for field in fields {
					field.referenced_globals(out);
				}
			}
			_ => {}
		}
	}

	/// Replaces every reference to `global` with `with`.
	pub fn replace_global(&mut self, global: GlobalId, with: &Constant) {
		match self {
			Constant::GlobalAddr { global: g, .. } if *g == global => *self = with.clone(),
			Constant::Cast { value, .. } => value.replace_global(global, with),
			Constant::Array { elems, .. } => {
				for elem in elems {
					elem.replace_global(global, with);
				}
			}
			Constant::Struct { fields, .. } => {
				for field in fields {
					field.replace_global(global, with);
				}
			}
			_ => {}
		}
	}
}

/// What produces a value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
	Constant(Constant),
	Global(GlobalId),
	Argument { func: FuncId, index: u32 },
	Inst(InstId),
	Undef,
}

/// A single recorded use of a value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Use {
	/// Operand `index` of `inst`, in the instruction's operand order.
	Operand { inst: InstId, index: u32 },
	/// Appears inside the initializer of a global.
	Initializer(GlobalId),
}

#[derive(Debug)]
pub(crate) struct ValueRecord {
	pub(crate) data: ValueData,
	pub(crate) ty: TypeId,
	pub(crate) users: Vec<Use>,
}
