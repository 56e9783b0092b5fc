use crate::ir::inst::InstKind;
use crate::ir::module::Module;
use crate::ir::value::Use;
use crate::ir::CastOp;

impl Module {
	/// Structural well-formedness check: instruction typing, use-list
	/// coherence, alloca placement and initializer acyclicity. Returns the
	/// first violation found.
	pub fn verify(&self) -> Result<(), String> {
		for f in self.functions() {
			for (bi, &b) in self.function(f).blocks().iter().enumerate() {
				let mut past_allocas = false;
				for &i in self.block_insts(b) {
					let inst = self.inst(i);
					self.verify_inst_types(i)?;
					for (index, op) in inst.kind.operands().into_iter().enumerate() {
						let entry = Use::Operand { inst: i, index: index as u32 };
						if !self.users(op).contains(&entry) {
							return Err(format!("use list of {op:?} is missing {entry:?}"));
						}
					}
					match &inst.kind {
						InstKind::Alloca { .. } => {
							if bi != 0 || past_allocas {
								return Err(format!(
									"{i:?}: alloca is not at the head of the entry block"
								));
							}
						}
						_ => past_allocas = true,
					}
				}
			}
		}
		for g in self.globals() {
			let glob = self.global(g);
			if let Some(init) = &glob.init {
				if self.initializer_would_cycle(g, init) {
					return Err(format!("initializer of {g:?} references itself"));
				}
				let pointee = self.global_pointee(g);
				if init.ty() != pointee {
					return Err(format!(
						"initializer of {g:?} has type `{}`, expected `{}`",
						self.types.display(init.ty()),
						self.types.display(pointee)
					));
				}
			}
			if let Some(addr) = glob.address {
				if self.global_at(addr) != Some(g) {
					return Err(format!("{g:?} is not indexed under {addr:#x}"));
				}
			}
		}
		Ok(())
	}

	fn verify_inst_types(&self, i: crate::ir::InstId) -> Result<(), String> {
		let inst = self.inst(i);
		let types = &self.types;
		let mismatch = |what: &str| {
			Err(format!(
				"{i:?}: {what} (result type `{}`)",
				types.display(inst.ty)
			))
		};
		match &inst.kind {
			InstKind::Alloca { allocated } => {
				if types.element(inst.ty) != Some(*allocated) || !types.is_pointer(inst.ty) {
					return mismatch("alloca result is not a pointer to its slot type");
				}
			}
			InstKind::Load { ptr } => {
				if types.element(self.value_type(*ptr)) != Some(inst.ty)
					|| !types.is_pointer(self.value_type(*ptr))
				{
					return mismatch("load result does not match its pointer's element");
				}
			}
			InstKind::Store { value, ptr } => {
				let ptr_ty = self.value_type(*ptr);
				if !types.is_pointer(ptr_ty)
					|| types.element(ptr_ty) != Some(self.value_type(*value))
				{
					return mismatch("store operand does not match its pointer's element");
				}
			}
			InstKind::Cast { op, value } => {
				let src = self.value_type(*value);
				let ok = match op {
					CastOp::BitCast => types.bit_width(src) == types.bit_width(inst.ty),
					CastOp::IntToPtr => types.is_int(src) && types.is_pointer(inst.ty),
					CastOp::PtrToInt => types.is_pointer(src) && types.is_int(inst.ty),
					CastOp::IntCast => types.is_int(src) && types.is_int(inst.ty),
					CastOp::FpCast => types.is_float(src) && types.is_float(inst.ty),
				};
				if !ok {
					return mismatch("cast operand kinds do not fit the cast op");
				}
			}
			InstKind::ExtractValue { agg, indices } => {
				let mut ty = self.value_type(*agg);
				for &index in indices {
					match types.field(ty, index as usize) {
						Some(f) => ty = f,
						None => return mismatch("extractvalue walks outside the aggregate"),
					}
				}
				if ty != inst.ty {
					return mismatch("extractvalue result does not match the indexed field");
				}
			}
			InstKind::InsertValue { agg, elem, indices } => {
				if self.value_type(*agg) != inst.ty {
					return mismatch("insertvalue result does not match the aggregate");
				}
				let mut ty = inst.ty;
				for &index in indices {
					match types.field(ty, index as usize) {
						Some(f) => ty = f,
						None => return mismatch("insertvalue walks outside the aggregate"),
					}
				}
				if ty != self.value_type(*elem) {
					return mismatch("insertvalue element does not match the indexed field");
				}
			}
			_ => {}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use crate::ir::inst::InsertPoint;
	use crate::ir::module::{Linkage, Module};
	use crate::ir::value::Constant;

	#[test]
	fn well_formed_module_passes() {
		let mut m = Module::new(32);
		let i32t = m.types.int(32);
		let f = m.add_function("f", i32t, &[i32t], false, None);
		let b = m.add_block(f);
		let arg = m.arg(f, 0);
		let a = m.build_alloca(f, i32t, Some("x".into()));
		let av = m.result(a);
		m.build_store(arg, av, InsertPoint::AtEnd(b));
		m.build_load(av, None, InsertPoint::AtEnd(b));
		assert_eq!(m.verify(), Ok(()));
	}

	#[test]
	fn self_referential_initializer_is_rejected() {
		let mut m = Module::new(32);
		let i32t = m.types.int(32);
		let ptr = m.types.pointer(i32t);
		let g = m.add_global("g", ptr, None, Some(0x100), false, Linkage::Internal);
		let gty = m.value_type(m.global_value(g));
		let this = Constant::GlobalAddr { global: g, ty: gty };
		let cast = Constant::Cast {
			op: crate::ir::CastOp::BitCast,
			ty: ptr,
			value: Box::new(this),
		};
		m.set_global_initializer(g, Some(cast));
		assert!(m.verify().is_err());
	}
}
