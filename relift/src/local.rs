//! Turning store-defined pseudo-globals into true function locals, and
//! function renaming with identifier normalization.

use crate::config::{CallingConvention, ConfigFunction, IrHandle};
use crate::context::{Context, EraseSet};
use crate::ir::inst::{InsertPoint, InstKind};
use crate::ir::value::ValueData;
use crate::ir::{FuncId, InstId};

impl Context {
	/// Converts the pseudo-global written by `store` into a function local.
	///
	/// A fresh alloca of the pointee type lands in the entry block, the
	/// stored value is re-stored at the original position, the original
	/// store goes away and every instruction in `uses` is patched to the new
	/// alloca. Once nothing else mentions the pseudo-global it is retired
	/// from both the IR and the config.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn localize(
		&mut self,
		store: InstId,
		uses: &[InstId],
		mut eraser: Option<&mut EraseSet>,
	) -> InstId {
		let (value, ptr) = match &self.module.inst(store).kind {
			InstKind::Store { value, ptr } => (*value, *ptr),
			other => panic!("localize expects a store, got {other:?}"),
		};
		let ValueData::Global(g) = *self.module.value_data(ptr) else {
			panic!("localize expects a store through a pseudo-global");
		};

		let pointee = self.module.global_pointee(g);
		let func = self.module.block_func(self.module.inst(store).block());
		let name = self.module.global(g).name.clone();
		let alloca = self.module.build_alloca(func, pointee, Some(name));
		let alloca_val = self.module.result(alloca);
		self.module.build_store(value, alloca_val, InsertPoint::Before(store));
		match eraser.as_deref_mut() {
			Some(set) => set.insert(store),
			None => self.module.erase_inst(store),
		}

		for &user in uses {
			if self.module.is_erased(user) {
				continue;
			}
			let operands = self.module.inst(user).kind.operands();
			for (index, op) in operands.into_iter().enumerate() {
				if op == ptr {
					self.module.set_operand(user, index as u32, alloca_val);
				}
			}
		}

		if self.module.users(ptr).is_empty() {
			if let Some(id) = self.config.by_handle(IrHandle::Global(g)) {
				self.config.remove_object(id);
			}
			self.module.remove_global(g);
		}
		alloca
	}

	/// Renames a function, normalizing `new_name` first, and keeps the
	/// config entry in step. A rename to the current name changes nothing
	/// and hands back the existing entry.
	pub fn rename_function(&mut self, func: FuncId, new_name: &str) -> &ConfigFunction {
		let normalized = normalize_name(new_name);
		if self.module.function(func).name != normalized {
			self.module.set_function_name(func, normalized);
		}
		let name = self.module.function(func).name.clone();
		let address = self.module.function(func).address;
		if self.config.function(func).is_some() {
			if let Some(entry) = self.config.function_mut(func) {
				entry.name = name;
			}
		} else {
			self.config.set_function(
				func,
				ConfigFunction {
					name,
					address,
					param_storage: Vec::new(),
					calling_convention: CallingConvention::default(),
				},
			);
		}
		match self.config.function(func) {
			Some(entry) => entry,
			None => unreachable!(),
		}
	}
}

/// Canonical identifier normalization: anything outside `[A-Za-z0-9_]`
/// becomes `_`, and a name that is empty or starts with a digit gets the
/// `function_` prefix.
pub fn normalize_name(name: &str) -> String {
	let mut out = String::with_capacity(name.len());
	for c in name.chars() {
		if c.is_ascii_alphanumeric() || c == '_' {
			out.push(c);
		} else {
			out.push('_');
		}
	}
	if out.is_empty() || out.as_bytes()[0].is_ascii_digit() {
		out.insert_str(0, "function_");
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{ConfigObject, Storage};
	use crate::ir::module::Linkage;
	use crate::testutil::small_context;
	use test_case::test_case;

	#[test]
	fn localize_rewires_every_given_use() {
		let mut ctx = small_context();
		let m = &mut ctx.module;
		let i32t = m.types.int(32);
		let f = m.add_function("f", i32t, &[i32t], false, None);
		let b = m.add_block(f);
		let arg = m.arg(f, 0);
		let g = m.add_global("r7", i32t, None, None, false, Linkage::Private);
		let gv = m.global_value(g);
		let st = m.build_store(arg, gv, InsertPoint::AtEnd(b));
		let ld = m.build_load(gv, None, InsertPoint::AtEnd(b));
		ctx.config.insert_object(
			ConfigObject {
				name: "r7".into(),
				storage: Storage::Register(7),
				ty: Some(i32t),
				ty_string: "i32".into(),
				crypto_description: None,
				from_debug: false,
				wide_string: false,
			},
			Some(IrHandle::Global(g)),
		);

		let alloca = ctx.localize(st, &[ld], None);
		let m = &ctx.module;
		let alloca_val = m.result(alloca);

		assert!(m.is_erased(st));
		assert_eq!(m.inst(ld).kind, InstKind::Load { ptr: alloca_val });
		assert_eq!(m.inst(alloca).name.as_deref(), Some("r7"));
		// the pseudo-global is gone from IR and config alike
		assert!(m.users(gv).is_empty());
		assert!(ctx.config.by_handle(IrHandle::Global(g)).is_none());
		// the stored value reaches the new slot at the original position
		let entry = m.entry_block(f);
		let insts = m.block_insts(entry).to_vec();
		assert!(m.inst(insts[0]).is_alloca());
		assert!(matches!(m.inst(insts[1]).kind, InstKind::Store { .. }));
		assert_eq!(m.verify(), Ok(()));
	}

	#[test]
	fn rename_to_the_same_name_is_a_no_op() {
		let mut ctx = small_context();
		let i32t = ctx.module.types.int(32);
		let f = ctx.module.add_function("main", i32t, &[], false, Some(0x400));
		let entry = ctx.rename_function(f, "main");
		assert_eq!(entry.name, "main");
		assert_eq!(entry.address, Some(0x400));
		assert_eq!(ctx.module.function(f).name, "main");
		let again = ctx.rename_function(f, "main");
		assert_eq!(again.name, "main");
	}

	#[test]
	fn rename_normalizes_and_updates_config() {
		let mut ctx = small_context();
		let i32t = ctx.module.types.int(32);
		let f = ctx.module.add_function("sub_401000", i32t, &[], false, None);
		let entry = ctx.rename_function(f, "operator new[]");
		assert_eq!(entry.name, "operator_new__");
		assert_eq!(ctx.module.function(f).name, "operator_new__");
	}

	#[test_case("main", "main")]
	#[test_case("operator new[]", "operator_new__")]
	#[test_case("123go", "function_123go")]
	#[test_case("", "function_")]
	#[test_case("std::vector", "std__vector")]
	fn normalization(input: &str, expected: &str) {
		assert_eq!(normalize_name(input), expected);
	}
}
