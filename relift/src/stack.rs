//! Stack slots keyed by (function, offset).

use crate::config::{ConfigObject, IrHandle, Storage};
use crate::context::Context;
use crate::ir::{FuncId, InstId};
use crate::types::TypeId;

impl Context {
	/// Returns the local slot at `offset` in `function`, creating it on
	/// first use. The slot's type is frozen at creation (the word type when
	/// the request is not a valid pointee); later passes re-type through
	/// [`change_object_type`](crate::retype::change_object_type).
	pub fn get_stack_slot(
		&mut self,
		function: FuncId,
		offset: i64,
		requested: Option<TypeId>,
		name_hint: &str,
	) -> InstId {
		if let Some(id) = self.config.by_stack(function, offset) {
			if let Some(IrHandle::Stack(inst)) = self.config.handle(id) {
				return inst;
			}
		}

		let ty = match requested {
			Some(ty) if self.module.types.is_valid_pointee(ty) => ty,
			_ => self.module.types.word(),
		};
		let name = format!("{name_hint}_{offset}");
		let inst = self.module.build_alloca(function, ty, Some(name.clone()));
		let ty_string = self.module.types.display(ty).to_string();
		self.config.insert_object(
			ConfigObject {
				name,
				storage: Storage::Stack { func: function, offset },
				ty: Some(ty),
				ty_string,
				crypto_description: None,
				from_debug: false,
				wide_string: false,
			},
			Some(IrHandle::Stack(inst)),
		);
		inst
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ir::inst::InstKind;
	use crate::testutil::small_context;

	fn context_with_fn() -> (Context, FuncId) {
		let mut ctx = small_context();
		let i32t = ctx.module.types.int(32);
		let f = ctx.module.add_function("f", i32t, &[], false, None);
		ctx.module.add_block(f);
		(ctx, f)
	}

	#[test]
	fn repeated_requests_return_the_same_slot() {
		let (mut ctx, f) = context_with_fn();
		let i32t = ctx.module.types.int(32);
		let a = ctx.get_stack_slot(f, -16, Some(i32t), "x");
		let b = ctx.get_stack_slot(f, -16, Some(i32t), "x");
		assert_eq!(a, b);
		// the frozen type wins over a later, different request
		let i64t = ctx.module.types.int(64);
		let c = ctx.get_stack_slot(f, -16, Some(i64t), "y");
		assert_eq!(a, c);
	}

	#[test]
	fn slots_are_named_hint_then_offset() {
		let (mut ctx, f) = context_with_fn();
		let i32t = ctx.module.types.int(32);
		let a = ctx.get_stack_slot(f, -16, Some(i32t), "x");
		assert_eq!(ctx.module.inst(a).name.as_deref(), Some("x_-16"));
		assert_eq!(
			ctx.module.inst(a).kind,
			InstKind::Alloca { allocated: i32t }
		);
		let entry = ctx.config.by_stack(f, -16).unwrap();
		assert_eq!(ctx.config.object(entry).name, "x_-16");
	}

	#[test]
	fn invalid_pointees_fall_back_to_the_word_type() {
		let (mut ctx, f) = context_with_fn();
		let void = ctx.module.types.void();
		let a = ctx.get_stack_slot(f, -8, Some(void), "tmp");
		let word = ctx.module.types.word();
		assert_eq!(ctx.module.inst(a).kind, InstKind::Alloca { allocated: word });
		let b = ctx.get_stack_slot(f, -4, None, "tmp");
		assert_eq!(ctx.module.inst(b).kind, InstKind::Alloca { allocated: word });
	}

	#[test]
	fn distinct_offsets_get_distinct_slots() {
		let (mut ctx, f) = context_with_fn();
		let a = ctx.get_stack_slot(f, -16, None, "x");
		let b = ctx.get_stack_slot(f, -12, None, "x");
		assert_ne!(a, b);
		assert_eq!(ctx.module.verify(), Ok(()));
	}
}
