pub mod inst;
pub mod module;
pub mod value;
pub mod verify;

pub use inst::{BinOp, CastOp, Inst, InstKind, InsertPoint, Predicate, UnOp};
pub use module::{Function, Global, Linkage, Module};
pub use value::{Constant, Use, ValueData};

macro_rules! define_ids {
	($($(#[$attr: meta])* $id: ident),*) => {$(
		$(#[$attr])*
		#[repr(transparent)]
		#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
		pub struct $id(pub(crate) u32);

		impl $id {
			#[inline]
			pub(crate) fn idx(self) -> usize {
				self.0 as usize
			}
		}

		impl std::fmt::Debug for $id {
			fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
				write!(f, concat!(stringify!($id), "({})"), self.0)
			}
		}
	)*};
}

define_ids! {
	/// An SSA value.
	ValueId,
	/// An instruction. Stays valid until the instruction is erased.
	InstId,
	/// A basic block.
	BlockId,
	/// A function.
	FuncId,
	/// A global object.
	GlobalId
}
