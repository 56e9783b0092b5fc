//! Bridges arbitrary pairs of low-level types by inserting a minimal chain
//! of primitive casts, either as live instructions at an insertion point or
//! as a constant-expression tree.

use crate::errors::Error;
use crate::ir::inst::{CastOp, InsertPoint, InstKind};
use crate::ir::module::Module;
use crate::ir::value::{Constant, ValueData};
use crate::ir::ValueId;
use crate::types::{is_float_width, Type, TypeId, TypePool};

/// Produces a value of type `dst` from `v`, inserting casts at `at`. The
/// returned value has type `dst`; `v` itself is returned when it already
/// does. Integer resizes are signed; unsigned semantics are the business of
/// operand-level rewrites in later passes.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn convert_value(
	module: &mut Module,
	v: ValueId,
	dst: TypeId,
	at: InsertPoint,
) -> Result<ValueId, Error> {
	let mut at = at;
	convert_value_at(module, v, dst, &mut at)
}

fn convert_value_at(
	module: &mut Module,
	v: ValueId,
	dst: TypeId,
	at: &mut InsertPoint,
) -> Result<ValueId, Error> {
	let src = module.value_type(v);
	if src == dst {
		return Ok(v);
	}

	// A cast immediately undone folds away instead of stacking.
	if let ValueData::Inst(i) = *module.value_data(v) {
		if let InstKind::Cast { op, value } = &module.inst(i).kind {
			let (op, value) = (*op, *value);
			if matches!(op, CastOp::BitCast | CastOp::IntToPtr | CastOp::PtrToInt)
				&& module.value_type(value) == dst
			{
				return Ok(value);
			}
		}
	}

	let src_kind = module.types.get(src).clone();
	let dst_kind = module.types.get(dst).clone();
	match (&src_kind, &dst_kind) {
		(Type::Array { .. } | Type::Struct { .. }, _) => {
			// Memory ops cannot move aggregates; such a load is a lifting
			// artifact. Re-load the scalar through a retyped pointer.
			if let ValueData::Inst(i) = *module.value_data(v) {
				if let InstKind::Load { ptr } = module.inst(i).kind {
					let new_ptr_ty = module.types.pointer(dst);
					let new_ptr = convert_value_at(module, ptr, new_ptr_ty, at)?;
					let load = module.build_load(new_ptr, None, *at);
					*at = InsertPoint::After(load);
					let result = module.result(load);
					if module.users(v).is_empty() {
						module.erase_inst(i);
					}
					return Ok(result);
				}
			}
			if module.types.field(src, 0).is_none() {
				return Err(unsupported(&module.types, src, dst));
			}
			let extract = module.build_extract_value(v, vec![0], *at);
			*at = InsertPoint::After(extract);
			let scalar = module.result(extract);
			convert_value_at(module, scalar, dst, at)
		}
		(_, Type::Array { .. } | Type::Struct { .. }) => {
			let first = module
				.types
				.field(dst, 0)
				.ok_or_else(|| unsupported(&module.types, src, dst))?;
			let scalar = convert_value_at(module, v, first, at)?;
			let undef = module.undef(dst);
			let insert = module.build_insert_value(undef, scalar, vec![0], *at);
			*at = InsertPoint::After(insert);
			Ok(module.result(insert))
		}
		(Type::Pointer(_), Type::Pointer(_)) => Ok(emit(module, CastOp::BitCast, v, dst, at)),
		(Type::Pointer(_), Type::Int(_)) => Ok(emit(module, CastOp::PtrToInt, v, dst, at)),
		(Type::Pointer(_), Type::Float(bits)) => {
			let mid = module.types.int(*bits);
			let as_int = emit(module, CastOp::PtrToInt, v, mid, at);
			Ok(emit(module, CastOp::BitCast, as_int, dst, at))
		}
		(Type::Int(_), Type::Pointer(_)) => Ok(emit(module, CastOp::IntToPtr, v, dst, at)),
		(Type::Int(_), Type::Int(_)) => Ok(emit(module, CastOp::IntCast, v, dst, at)),
		(Type::Int(src_bits), Type::Float(dst_bits)) => {
			let mut cur = v;
			if src_bits != dst_bits {
				let mid = module.types.int(*dst_bits);
				cur = emit(module, CastOp::IntCast, cur, mid, at);
			}
			Ok(emit(module, CastOp::BitCast, cur, dst, at))
		}
		(Type::Float(src_bits), Type::Pointer(_)) => {
			let mid = module.types.int(*src_bits);
			let as_int = emit(module, CastOp::BitCast, v, mid, at);
			Ok(emit(module, CastOp::IntToPtr, as_int, dst, at))
		}
		(Type::Float(src_bits), Type::Int(dst_bits)) => {
			if is_float_width(*dst_bits) {
				let mut cur = v;
				if src_bits != dst_bits {
					let mid = module.types.float(*dst_bits);
					cur = emit(module, CastOp::FpCast, cur, mid, at);
				}
				Ok(emit(module, CastOp::BitCast, cur, dst, at))
			} else {
				// No float of the target width; canonicalize on i32.
				let i32t = module.types.int(32);
				let as_i32 = convert_value_at(module, v, i32t, at)?;
				Ok(emit(module, CastOp::IntCast, as_i32, dst, at))
			}
		}
		(Type::Float(_), Type::Float(_)) => Ok(emit(module, CastOp::FpCast, v, dst, at)),
		_ => Err(unsupported(&module.types, src, dst)),
	}
}

fn emit(module: &mut Module, op: CastOp, v: ValueId, ty: TypeId, at: &mut InsertPoint) -> ValueId {
	let inst = module.build_cast(op, v, ty, *at);
	*at = InsertPoint::After(inst);
	module.result(inst)
}

/// The constant-expression mirror of [`convert_value`]. Never touches the
/// IR; literal integer resizes fold, everything else becomes a cast node.
pub fn convert_constant(types: &mut TypePool, c: &Constant, dst: TypeId) -> Result<Constant, Error> {
	let src = c.ty();
	if src == dst {
		return Ok(c.clone());
	}

	if let Constant::Cast { op, value, .. } = c {
		if matches!(op, CastOp::BitCast | CastOp::IntToPtr | CastOp::PtrToInt)
			&& value.ty() == dst
		{
			return Ok((**value).clone());
		}
	}

	let src_kind = types.get(src).clone();
	let dst_kind = types.get(dst).clone();
	match (&src_kind, &dst_kind) {
		(Type::Array { .. } | Type::Struct { .. }, _) => {
			let first = match c {
				Constant::Array { elems, .. } => elems.first().cloned(),
				Constant::Struct { fields, .. } => fields.first().cloned(),
				Constant::Undef { .. } => {
					types.field(src, 0).map(|ty| Constant::Undef { ty })
				}
				_ => None,
			};
			let first = first.ok_or_else(|| unsupported(types, src, dst))?;
			convert_constant(types, &first, dst)
		}
		(_, Type::Array { elem, len }) => {
			let first = types
				.field(dst, 0)
				.ok_or_else(|| unsupported(types, src, dst))?;
			let converted = convert_constant(types, c, first)?;
			let mut elems = vec![converted];
			elems.extend((1..*len).map(|_| Constant::Undef { ty: *elem }));
			Ok(Constant::Array { ty: dst, elems })
		}
		(_, Type::Struct { fields, .. }) => {
			let first = fields
				.first()
				.copied()
				.ok_or_else(|| unsupported(types, src, dst))?;
			let converted = convert_constant(types, c, first)?;
			let mut out = vec![converted];
			out.extend(fields[1..].iter().map(|f| Constant::Undef { ty: *f }));
			Ok(Constant::Struct { ty: dst, fields: out })
		}
		(Type::Pointer(_), Type::Pointer(_)) => Ok(cast(CastOp::BitCast, dst, c)),
		(Type::Pointer(_), Type::Int(_)) => Ok(cast(CastOp::PtrToInt, dst, c)),
		(Type::Pointer(_), Type::Float(bits)) => {
			let mid = types.int(*bits);
			let as_int = cast(CastOp::PtrToInt, mid, c);
			Ok(Constant::Cast { op: CastOp::BitCast, ty: dst, value: Box::new(as_int) })
		}
		(Type::Int(_), Type::Pointer(_)) => Ok(cast(CastOp::IntToPtr, dst, c)),
		(Type::Int(src_bits), Type::Int(dst_bits)) => match c {
			Constant::Int { bits, .. } => {
				Ok(Constant::Int { ty: dst, bits: resize_bits(*bits, *src_bits, *dst_bits) })
			}
			_ => Ok(cast(CastOp::IntCast, dst, c)),
		},
		(Type::Int(src_bits), Type::Float(dst_bits)) => {
			let resized = if src_bits != dst_bits {
				let mid = types.int(*dst_bits);
				convert_constant(types, c, mid)?
			} else {
				c.clone()
			};
			Ok(Constant::Cast { op: CastOp::BitCast, ty: dst, value: Box::new(resized) })
		}
		(Type::Float(src_bits), Type::Pointer(_)) => {
			let mid = types.int(*src_bits);
			let as_int = cast(CastOp::BitCast, mid, c);
			Ok(Constant::Cast { op: CastOp::IntToPtr, ty: dst, value: Box::new(as_int) })
		}
		(Type::Float(src_bits), Type::Int(dst_bits)) => {
			if is_float_width(*dst_bits) {
				let cur = if src_bits != dst_bits {
					let mid = types.float(*dst_bits);
					cast(CastOp::FpCast, mid, c)
				} else {
					c.clone()
				};
				Ok(Constant::Cast { op: CastOp::BitCast, ty: dst, value: Box::new(cur) })
			} else {
				let i32t = types.int(32);
				let as_i32 = convert_constant(types, c, i32t)?;
				convert_constant(types, &as_i32, dst)
			}
		}
		(Type::Float(_), Type::Float(_)) => Ok(cast(CastOp::FpCast, dst, c)),
		_ => Err(unsupported(types, src, dst)),
	}
}

fn cast(op: CastOp, ty: TypeId, value: &Constant) -> Constant {
	Constant::Cast { op, ty, value: Box::new(value.clone()) }
}

/// Signed resize of a bit pattern stored masked to `from` bits.
fn resize_bits(bits: u128, from: u32, to: u32) -> u128 {
	let mut value = bits;
	if to > from && from > 0 {
		let sign = (bits >> (from - 1)) & 1;
		if sign == 1 {
			let ones = if to >= 128 { !0u128 } else { (1u128 << to) - 1 };
			let low = (1u128 << from) - 1;
			value |= ones & !low;
		}
	}
	if to < 128 {
		value &= (1u128 << to) - 1;
	}
	value
}

fn unsupported(types: &TypePool, src: TypeId, dst: TypeId) -> Error {
	Error::UnsupportedConversion {
		src: types.display(src).to_string(),
		dst: types.display(dst).to_string(),
	}
}
