//! Changes the declared type of a global, stack local or function argument
//! and re-types every use so the program keeps type-checking.

use crate::config::{ConfigObject, IrHandle, Storage};
use crate::context::{Context, EraseSet};
use crate::convert::{convert_constant, convert_value};
use crate::errors::Error;
use crate::ir::inst::{InsertPoint, InstKind};
use crate::ir::module::Module;
use crate::ir::value::{Constant, Use, ValueData};
use crate::ir::{FuncId, GlobalId, InstId, ValueId};
use crate::types::TypeId;

#[derive(Debug, Copy, Clone)]
enum ObjectKind {
	Alloca(InstId),
	Global(GlobalId),
	Argument { func: FuncId, index: u32 },
}

/// Changes the declared type of `object` to `new_type`.
///
/// For an alloca or global the declared type is the pointee; for an argument
/// it is the value type itself. Every user of the object is patched via the
/// converter so it continues to type-check; instructions made dead by the
/// rewrite are erased eagerly, or queued on `eraser` so callers mid-traversal
/// can defer deletion. The config mirror picks up the new type string and the
/// wide-string flag.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn change_object_type(
	ctx: &mut Context,
	object: ValueId,
	new_type: TypeId,
	init: Option<Constant>,
	mut eraser: Option<&mut EraseSet>,
	wide_string: bool,
) -> Result<ValueId, Error> {
	let kind = match ctx.module.value_data(object) {
		ValueData::Inst(i)
			if matches!(ctx.module.inst(*i).kind, InstKind::Alloca { .. }) =>
		{
			ObjectKind::Alloca(*i)
		}
		ValueData::Global(g) => ObjectKind::Global(*g),
		ValueData::Argument { func, index } => {
			ObjectKind::Argument { func: *func, index: *index }
		}
		other => panic!(
			"change_object_type: cannot re-type {other:?} of type `{}`",
			ctx.module.types.display(ctx.module.value_type(object))
		),
	};

	let declared = match kind {
		ObjectKind::Alloca(i) => match ctx.module.inst(i).kind {
			InstKind::Alloca { allocated } => allocated,
			_ => unreachable!(),
		},
		ObjectKind::Global(g) => ctx.module.global_pointee(g),
		ObjectKind::Argument { .. } => ctx.module.value_type(object),
	};
	if declared == new_type {
		return Ok(object);
	}
	let old_value_ty = ctx.module.value_type(object);

	// Re-declare the object under its new type.
	let (new_val, new_handle) = match kind {
		ObjectKind::Alloca(i) => {
			let func = ctx.module.block_func(ctx.module.inst(i).block());
			let name = ctx.module.take_inst_name(i);
			let new_inst = ctx.module.build_alloca(func, new_type, name);
			(ctx.module.result(new_inst), Some(IrHandle::Stack(new_inst)))
		}
		ObjectKind::Global(g) => {
			let address = ctx.module.global(g).address;
			let init = match init {
				Some(c) => Some(c),
				None => address.and_then(|addr| ctx.read_constant(new_type, addr)),
			};
			let (name, constant, linkage) = {
				let glob = ctx.module.global(g);
				(glob.name.clone(), glob.constant, glob.linkage)
			};
			ctx.module.clear_global_address(g);
			let new_g = ctx.module.add_global(name, new_type, init, address, constant, linkage);
			(ctx.module.global_value(new_g), Some(IrHandle::Global(new_g)))
		}
		ObjectKind::Argument { func, index } => {
			(ctx.module.retype_argument(func, index, new_type), None)
		}
	};

	// Iterating a use list that is being rewritten loses users; work on a
	// snapshot.
	let users: Vec<Use> = ctx.module.users(object).to_vec();
	for entry in users {
		match entry {
			Use::Initializer(g) => {
				let Some(source) = ctx.module.as_constant(new_val) else {
					unreachable!("initializer references a non-constant object");
				};
				let replacement =
					convert_constant(&mut ctx.module.types, &source, old_value_ty)?;
				ctx.module.replace_initializer_reference(g, object, &replacement);
			}
			Use::Operand { inst, index } => {
				if ctx.module.is_erased(inst) {
					continue;
				}
				if ctx.module.inst(inst).kind.operands()[index as usize] != object {
					continue;
				}
				retype_user(&mut ctx.module, inst, index, object, new_val, old_value_ty, &mut eraser)?;
			}
		}
	}

	// Retire the old declaration.
	match kind {
		ObjectKind::Alloca(i) => erase_or_queue(&mut ctx.module, &mut eraser, i),
		ObjectKind::Global(g) => match eraser.as_deref_mut() {
			Some(set) => set.insert_global(g),
			None => ctx.module.remove_global(g),
		},
		ObjectKind::Argument { .. } => {}
	}

	// Rewiring may have folded the old global's initializer references back
	// into the new one; break any resulting cycle with a plain word read.
	if let Some(IrHandle::Global(new_g)) = new_handle {
		let init = ctx.module.global(new_g).init.clone();
		if let Some(init) = init {
			if ctx.module.initializer_would_cycle(new_g, &init) {
				let address = ctx.module.global(new_g).address;
				let word_ty = ctx.module.types.word();
				let bits = address.and_then(|a| ctx.image.word_at(a)).unwrap_or(0);
				let word = Constant::Int { ty: word_ty, bits: bits as u128 };
				let fixed = convert_constant(&mut ctx.module.types, &word, new_type)?;
				ctx.module.set_global_initializer(new_g, Some(fixed));
			}
		}
	}

	sync_config(ctx, kind, new_handle, new_type, wide_string);
	Ok(new_val)
}

fn retype_user(
	module: &mut Module,
	inst: InstId,
	index: u32,
	object: ValueId,
	new_val: ValueId,
	old_value_ty: TypeId,
	eraser: &mut Option<&mut EraseSet>,
) -> Result<(), Error> {
	enum UserCase {
		StorePtr { value: ValueId },
		Load,
		Cast,
		Other,
	}
	let case = match &module.inst(inst).kind {
		InstKind::Store { value, ptr } if index == 1 && *ptr == object => {
			UserCase::StorePtr { value: *value }
		}
		InstKind::Load { .. } if module.types.is_pointer(module.value_type(new_val)) => {
			UserCase::Load
		}
		InstKind::Cast { .. } => UserCase::Cast,
		_ => UserCase::Other,
	};
	match case {
		UserCase::StorePtr { value } => {
			match module.types.element(module.value_type(new_val)) {
				Some(elem) => {
					let converted =
						convert_value(module, value, elem, InsertPoint::Before(inst))?;
					module.set_operand(inst, 0, converted);
					module.set_operand(inst, 1, new_val);
				}
				// The new declaration is not addressable; fall back to
				// handing the store the old type.
				None => patch_operand(module, inst, index, new_val, old_value_ty)?,
			}
		}
		UserCase::Load => {
			let old_result = module.result(inst);
			let old_ty = module.value_type(old_result);
			let name = module.take_inst_name(inst);
			let new_load = module.build_load(new_val, name, InsertPoint::Before(inst));
			let loaded = module.result(new_load);
			let converted = convert_value(module, loaded, old_ty, InsertPoint::Before(inst))?;
			module.replace_all_uses_with(old_result, converted);
			erase_or_queue(module, eraser, inst);
		}
		UserCase::Cast => {
			let target = module.inst(inst).ty;
			let replacement = if module.value_type(new_val) == target {
				new_val
			} else {
				convert_value(module, new_val, target, InsertPoint::Before(inst))?
			};
			let old_result = module.result(inst);
			module.replace_all_uses_with(old_result, replacement);
			erase_or_queue(module, eraser, inst);
		}
		UserCase::Other => patch_operand(module, inst, index, new_val, old_value_ty)?,
	}
	Ok(())
}

/// Hands the user a value of the object's original type, leaving downstream
/// typing intact for later passes to continue the propagation.
fn patch_operand(
	module: &mut Module,
	inst: InstId,
	index: u32,
	new_val: ValueId,
	old_value_ty: TypeId,
) -> Result<(), Error> {
	let converted = convert_value(module, new_val, old_value_ty, InsertPoint::Before(inst))?;
	module.set_operand(inst, index, converted);
	Ok(())
}

fn erase_or_queue(module: &mut Module, eraser: &mut Option<&mut EraseSet>, inst: InstId) {
	match eraser.as_deref_mut() {
		Some(set) => set.insert(inst),
		None => module.erase_inst(inst),
	}
}

fn sync_config(
	ctx: &mut Context,
	kind: ObjectKind,
	new_handle: Option<IrHandle>,
	new_type: TypeId,
	wide_string: bool,
) {
	let ty_string = ctx.module.types.display(new_type).to_string();
	match (kind, new_handle) {
		(ObjectKind::Global(old_g), Some(IrHandle::Global(new_g))) => {
			let address = ctx.module.global(new_g).address;
			let id = address
				.and_then(|a| ctx.config.by_address(a))
				.or_else(|| ctx.config.by_handle(IrHandle::Global(old_g)));
			match id {
				Some(id) => {
					ctx.config.rebind_handle(id, Some(IrHandle::Global(new_g)));
					let entry = ctx.config.object_mut(id);
					entry.ty = Some(new_type);
					entry.ty_string = ty_string;
					entry.wide_string = wide_string;
				}
				None => {
					if let Some(addr) = address {
						ctx.config.insert_object(
							ConfigObject {
								name: ctx.module.global(new_g).name.clone(),
								storage: Storage::Global(addr),
								ty: Some(new_type),
								ty_string,
								crypto_description: None,
								from_debug: false,
								wide_string,
							},
							Some(IrHandle::Global(new_g)),
						);
					}
				}
			}
		}
		(ObjectKind::Alloca(old_i), Some(IrHandle::Stack(new_i))) => {
			if let Some(id) = ctx.config.by_handle(IrHandle::Stack(old_i)) {
				ctx.config.rebind_handle(id, Some(IrHandle::Stack(new_i)));
				let entry = ctx.config.object_mut(id);
				entry.ty = Some(new_type);
				entry.ty_string = ty_string;
				entry.wide_string = wide_string;
			}
		}
		_ => {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ir::inst::CastOp;
	use crate::ir::BlockId;
	use crate::testutil::{data_context, small_context};

	fn func_with_block(ctx: &mut Context) -> (FuncId, BlockId) {
		let i32t = ctx.module.types.int(32);
		let f = ctx.module.add_function("f", i32t, &[i32t], false, None);
		let b = ctx.module.add_block(f);
		(f, b)
	}

	#[test]
	fn same_type_is_a_no_op() {
		let mut ctx = small_context();
		let (f, _) = func_with_block(&mut ctx);
		let i32t = ctx.module.types.int(32);
		let a = ctx.module.build_alloca(f, i32t, Some("x".into()));
		let av = ctx.module.result(a);
		let got = change_object_type(&mut ctx, av, i32t, None, None, false).unwrap();
		assert_eq!(got, av);
	}

	#[test]
	fn alloca_retype_rewrites_stores_and_loads() {
		let mut ctx = small_context();
		let (f, b) = func_with_block(&mut ctx);
		let m = &mut ctx.module;
		let i32t = m.types.int(32);
		let i64t = m.types.int(64);
		let a = m.build_alloca(f, i32t, Some("x".into()));
		let av = m.result(a);
		let arg = m.arg(f, 0);
		m.build_store(arg, av, InsertPoint::AtEnd(b));
		let ld = m.build_load(av, None, InsertPoint::AtEnd(b));
		let ld_res = m.result(ld);
		let user = m.build_cast(CastOp::IntCast, ld_res, i64t, InsertPoint::AtEnd(b));

		let new_val = change_object_type(&mut ctx, av, i64t, None, None, false).unwrap();

		let m = &ctx.module;
		assert_eq!(m.types.element(m.value_type(new_val)), Some(i64t));
		assert!(m.is_erased(a));
		assert!(m.is_erased(ld));
		// the cast that consumed the old load now sees an i32 again
		let InstKind::Cast { value, .. } = m.inst(user).kind else { panic!() };
		assert_eq!(m.value_type(value), i32t);
		assert_eq!(m.verify(), Ok(()));
	}

	#[test]
	fn deferred_erasure_keeps_cursors_valid() {
		let mut ctx = small_context();
		let (f, b) = func_with_block(&mut ctx);
		let m = &mut ctx.module;
		let i32t = m.types.int(32);
		let i64t = m.types.int(64);
		let a = m.build_alloca(f, i32t, None);
		let av = m.result(a);
		let ld = m.build_load(av, None, InsertPoint::AtEnd(b));

		let mut erase = EraseSet::new();
		change_object_type(&mut ctx, av, i64t, None, Some(&mut erase), false).unwrap();
		// nothing deleted while the set is held
		assert!(!ctx.module.is_erased(a));
		assert!(!ctx.module.is_erased(ld));
		erase.flush(&mut ctx.module);
		assert!(ctx.module.is_erased(a));
		assert!(ctx.module.is_erased(ld));
		assert_eq!(ctx.module.verify(), Ok(()));
	}

	#[test]
	fn cast_user_matching_the_new_type_collapses() {
		let mut ctx = small_context();
		let (f, b) = func_with_block(&mut ctx);
		let m = &mut ctx.module;
		let i32t = m.types.int(32);
		let i64t = m.types.int(64);
		let p64 = m.types.pointer(i64t);
		let a = m.build_alloca(f, i32t, None);
		let av = m.result(a);
		let cast = m.build_cast(CastOp::BitCast, av, p64, InsertPoint::AtEnd(b));
		let ld = m.build_load(m.result(cast), None, InsertPoint::AtEnd(b));

		let new_val = change_object_type(&mut ctx, av, i64t, None, None, false).unwrap();

		let m = &ctx.module;
		assert!(m.is_erased(cast));
		let InstKind::Load { ptr } = m.inst(ld).kind else { panic!() };
		assert_eq!(ptr, new_val);
		assert_eq!(m.verify(), Ok(()));
	}

	#[test]
	fn argument_retype_patches_other_users() {
		let mut ctx = small_context();
		let (f, b) = func_with_block(&mut ctx);
		let m = &mut ctx.module;
		let i32t = m.types.int(32);
		let i64t = m.types.int(64);
		let arg = m.arg(f, 0);
		let void = m.types.void();
		let ret = m.build_inst(
			InstKind::Return { value: Some(arg) },
			void,
			None,
			InsertPoint::AtEnd(b),
		);

		let new_val = change_object_type(&mut ctx, arg, i64t, None, None, false).unwrap();
		let m = &ctx.module;
		assert_eq!(new_val, arg);
		assert_eq!(m.value_type(arg), i64t);
		// the return still sees an i32
		let InstKind::Return { value: Some(v) } = m.inst(ret).kind else { panic!() };
		assert_eq!(m.value_type(v), i32t);
		assert_eq!(m.verify(), Ok(()));
	}

	#[test]
	fn global_retype_rereads_the_initializer_and_updates_config() {
		let mut ctx = data_context(&[0x2a, 0, 0, 0, 1, 0, 0, 0]);
		let i32t = ctx.module.types.int(32);
		let i16t = ctx.module.types.int(16);
		let g = ctx.get_global_variable(0x1000, false, None).unwrap();
		let gv = ctx.module.global_value(g);
		assert_eq!(ctx.module.global_pointee(g), i32t);

		let new_val = change_object_type(&mut ctx, gv, i16t, None, None, false).unwrap();
		let ValueData::Global(new_g) = *ctx.module.value_data(new_val) else { panic!() };
		assert_eq!(ctx.module.global_pointee(new_g), i16t);
		assert_eq!(
			ctx.module.global(new_g).init,
			Some(Constant::Int { ty: i16t, bits: 0x2a })
		);
		assert_eq!(ctx.module.global_at(0x1000), Some(new_g));

		let entry = ctx.config.by_address(0x1000).unwrap();
		assert_eq!(ctx.config.object(entry).ty_string, "i16");
		assert_eq!(
			ctx.config.handle(entry),
			Some(IrHandle::Global(new_g))
		);
		assert_eq!(ctx.module.verify(), Ok(()));
	}

	#[test]
	#[should_panic(expected = "cannot re-type")]
	fn non_object_values_are_rejected() {
		let mut ctx = small_context();
		let i32t = ctx.module.types.int(32);
		let c = ctx.module.constant(Constant::Int { ty: i32t, bits: 1 });
		let i64t = ctx.module.types.int(64);
		let _ = change_object_type(&mut ctx, c, i64t, None, None, false);
	}
}
