//! Lookup and materialization of global variables from raw binary addresses.

use crate::config::{ConfigObject, IrHandle, Storage};
use crate::context::Context;
use crate::ir::module::Linkage;
use crate::ir::value::Constant;
use crate::ir::{CastOp, GlobalId};
use crate::types::{Type, TypeId};

/// Shortest printable run accepted as a plausible string.
const MIN_STRING_LEN: usize = 2;

impl Context {
	/// Whether a global variable may legally be synthesized at `addr`.
	///
	/// Inside code segments only addresses that hold a plausible string, or
	/// whose surroundings read like pointers to data, are accepted. Targets
	/// that interleave data with code get a relaxed pass unless `strict`;
	/// every such acceptance is counted for diagnostic review.
	pub fn can_be_created(&self, addr: u64, strict: bool) -> bool {
		if !self.image.has_data_on(addr) {
			return false;
		}
		let in_code = self.image.is_code(addr) || self.module.function_at(addr).is_some();
		if !in_code {
			return true;
		}
		if matches!(self.image.string_at(addr), Some(s) if s.len() >= MIN_STRING_LEN) {
			return true;
		}
		let word = self.image.word_bytes() as u64;
		let nearby = [addr, addr.wrapping_add(word), addr.wrapping_sub(word)];
		let indirect = nearby
			.iter()
			.any(|a| matches!(self.image.word_at(*a), Some(t) if self.image.has_data_on(t)));
		if indirect {
			return true;
		}
		if !strict && self.image.arch().interleaves_code_and_data() {
			self.count_loose_global();
			return true;
		}
		false
	}

	/// Returns the global at `addr`, synthesizing it on first reference.
	///
	/// The name is salted with the address. The type starts as the image's
	/// word (or a detected string), overridden in turn by debug info, an
	/// existing config entry and a crypto-pattern annotation. When the
	/// initializer read comes back under a different type, the global is
	/// rebuilt around the initializer and the original pointer type is
	/// recovered with a constant cast. Returns `None` when nothing readable
	/// lives at the address; the config entry is still kept for later use.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn get_global_variable(
		&mut self,
		addr: u64,
		strict: bool,
		name_hint: Option<&str>,
	) -> Option<GlobalId> {
		if let Some(g) = self.module.global_at(addr) {
			return Some(g);
		}
		if !self.can_be_created(addr, strict) {
			return None;
		}

		let hint = name_hint.unwrap_or("global_var");
		let mut name = format!("{hint}_{addr:x}");
		let mut ty = self.module.types.word();
		let mut from_debug = false;
		let mut wide_string = false;
		let mut crypto_description = None;

		if let Some(s) = self.image.string_at(addr).filter(|s| s.len() >= MIN_STRING_LEN) {
			let i8t = self.module.types.int(8);
			ty = self.module.types.array(i8t, s.len() as u64 + 1);
		} else if let Some(units) = self
			.image
			.wide_string_at(addr, 2)
			.filter(|u| u.len() >= MIN_STRING_LEN)
		{
			let i16t = self.module.types.int(16);
			ty = self.module.types.array(i16t, units.len() as u64 + 1);
			wide_string = true;
		}
		if let Some(debug) = self.debug_globals.get(&addr) {
			from_debug = true;
			ty = debug.ty;
			if let Some(n) = &debug.name {
				name = n.clone();
			}
		}
		if let Some(id) = self.config.by_address(addr) {
			let entry = self.config.object(id);
			if let Some(t) = entry.ty {
				ty = t;
			}
			if !entry.name.is_empty() {
				name = entry.name.clone();
			}
			wide_string = wide_string || entry.wide_string;
		}
		if let Some(pattern) = self.crypto_patterns.get(&addr) {
			name = pattern.name.clone();
			ty = pattern.ty;
			crypto_description = Some(pattern.description.clone());
		}

		let constant = self.image.has_read_only_data_on(addr);
		let g = self.module.add_global(name, ty, None, Some(addr), constant, Linkage::Internal);

		let Some(init) = self.read_constant(ty, addr) else {
			self.register_global_config(g, addr, wide_string, crypto_description, from_debug);
			if let Some(id) = self.config.by_address(addr) {
				self.config.rebind_handle(id, None);
			}
			let value = self.module.global_value(g);
			if !self.module.users(value).is_empty() {
				let value_ty = self.module.value_type(value);
				let undef = self.module.undef(value_ty);
				self.module.replace_all_uses_with(value, undef);
			}
			self.module.remove_global(g);
			return None;
		};

		// A self-referential initializer degrades to the address word.
		let init = if self.module.initializer_would_cycle(g, &init) {
			let word_ty = self.module.types.word();
			let bits = self.image.word_at(addr).unwrap_or(0);
			Constant::Int { ty: word_ty, bits: bits as u128 }
		} else {
			init
		};

		let pointee = self.module.global_pointee(g);
		let final_g = if init.ty() == pointee {
			self.module.set_global_initializer(g, Some(init));
			g
		} else {
			// Rebuild around the initializer's true type and recover the
			// original pointer type with a constant cast.
			let (name, constant, linkage) = {
				let glob = self.module.global(g);
				(glob.name.clone(), glob.constant, glob.linkage)
			};
			self.module.clear_global_address(g);
			let init_ty = init.ty();
			let g2 = self.module.add_global(name, init_ty, Some(init), Some(addr), constant, linkage);
			let g2_ty = self.module.value_type(self.module.global_value(g2));
			let old_ptr_ty = self.module.value_type(self.module.global_value(g));
			let g2_addr = Constant::GlobalAddr { global: g2, ty: g2_ty };
			let cast = if g2_ty == old_ptr_ty {
				g2_addr
			} else {
				Constant::Cast { op: CastOp::BitCast, ty: old_ptr_ty, value: Box::new(g2_addr) }
			};
			let cast_val = self.module.constant(cast);
			let old_val = self.module.global_value(g);
			self.module.replace_all_uses_with(old_val, cast_val);
			self.module.remove_global(g);
			g2
		};

		self.register_global_config(final_g, addr, wide_string, crypto_description, from_debug);
		Some(final_g)
	}

	/// Reads a constant of `ty` at `addr`, resolving pointer words against
	/// known (or newly materialized) globals.
	pub(crate) fn read_constant(&mut self, ty: TypeId, addr: u64) -> Option<Constant> {
		match self.module.types.get(ty).clone() {
			Type::Pointer(_) => {
				let word = self.image.word_at(addr)?;
				if word == 0 {
					return Some(Constant::Null { ty });
				}
				if let Some(g) = self.get_global_variable(word, false, None) {
					let g_ty = self.module.value_type(self.module.global_value(g));
					let addr_const = Constant::GlobalAddr { global: g, ty: g_ty };
					if g_ty == ty {
						Some(addr_const)
					} else {
						Some(Constant::Cast {
							op: CastOp::BitCast,
							ty,
							value: Box::new(addr_const),
						})
					}
				} else {
					let word_ty = self.module.types.word();
					let value = Box::new(Constant::Int { ty: word_ty, bits: word as u128 });
					Some(Constant::Cast { op: CastOp::IntToPtr, ty, value })
				}
			}
			Type::Array { elem, len } => {
				let stride = self.module.types.byte_width(elem);
				let mut elems = Vec::with_capacity(len as usize);
				for i in 0..len {
					elems.push(self.read_constant(elem, addr + i * stride)?);
				}
				Some(Constant::Array { ty, elems })
			}
			Type::Struct { fields, .. } => {
				let mut out = Vec::with_capacity(fields.len());
				for (i, field) in fields.iter().enumerate() {
					let offset = self.module.types.field_offset(ty, i)?;
					out.push(self.read_constant(*field, addr + offset)?);
				}
				Some(Constant::Struct { ty, fields: out })
			}
			_ => self.image.constant(&mut self.module.types, ty, addr),
		}
	}

	fn register_global_config(
		&mut self,
		g: GlobalId,
		addr: u64,
		wide_string: bool,
		crypto_description: Option<String>,
		from_debug: bool,
	) {
		let pointee = self.module.global_pointee(g);
		let ty_string = self.module.types.display(pointee).to_string();
		let name = self.module.global(g).name.clone();
		match self.config.by_address(addr) {
			Some(id) => {
				self.config.rebind_handle(id, Some(IrHandle::Global(g)));
				let entry = self.config.object_mut(id);
				entry.name = name;
				entry.ty = Some(pointee);
				entry.ty_string = ty_string;
				entry.wide_string = wide_string;
				entry.from_debug = entry.from_debug || from_debug;
				if crypto_description.is_some() {
					entry.crypto_description = crypto_description;
				}
			}
			None => {
				self.config.insert_object(
					ConfigObject {
						name,
						storage: Storage::Global(addr),
						ty: Some(pointee),
						ty_string,
						crypto_description,
						from_debug,
						wide_string,
					},
					Some(IrHandle::Global(g)),
				);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::DebugGlobal;
	use crate::image::{Arch, Segment, SegmentFlags};
	use crate::testutil::{context_with, data_context};

	#[test]
	fn materialization_is_idempotent() {
		let mut ctx = data_context(&[1, 2, 3, 4]);
		let a = ctx.get_global_variable(0x1000, false, None).unwrap();
		let b = ctx.get_global_variable(0x1000, false, None).unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn names_are_salted_with_the_address() {
		let mut ctx = data_context(&[1, 2, 3, 4]);
		let g = ctx.get_global_variable(0x1000, false, Some("table")).unwrap();
		assert_eq!(ctx.module.global(g).name, "table_1000");
		let word = ctx.module.types.word();
		assert_eq!(ctx.module.global_pointee(g), word);
		assert_eq!(
			ctx.module.global(g).init,
			Some(Constant::Int { ty: word, bits: 0x0403_0201 })
		);
		let entry = ctx.config.by_address(0x1000).unwrap();
		assert_eq!(ctx.config.object(entry).ty_string, "i32");
		assert_eq!(ctx.config.handle(entry), Some(IrHandle::Global(g)));
	}

	#[test]
	fn strings_steer_the_default_type() {
		let mut ctx = data_context(b"hello\0\0\0");
		let g = ctx.get_global_variable(0x1000, false, None).unwrap();
		let i8t = ctx.module.types.int(8);
		let expected = ctx.module.types.array(i8t, 6);
		assert_eq!(ctx.module.global_pointee(g), expected);
		assert_eq!(ctx.module.verify(), Ok(()));
	}

	#[test]
	fn wide_strings_set_the_flag() {
		let mut ctx = data_context(&[b'h', 0, b'i', 0, b'!', 0, 0, 0]);
		let g = ctx.get_global_variable(0x1000, false, None).unwrap();
		let i16t = ctx.module.types.int(16);
		let expected = ctx.module.types.array(i16t, 4);
		assert_eq!(ctx.module.global_pointee(g), expected);
		let entry = ctx.config.by_address(0x1000).unwrap();
		assert!(ctx.config.object(entry).wide_string);
	}

	#[test]
	fn self_referential_pointer_degrades_to_a_word_read() {
		// the four bytes at 0x1000 spell the address 0x1000 itself
		let mut ctx = data_context(&[0x00, 0x10, 0, 0]);
		let i32t = ctx.module.types.int(32);
		let ptr = ctx.module.types.pointer(i32t);
		ctx.debug_globals.insert(0x1000, DebugGlobal { name: None, ty: ptr });

		let g = ctx.get_global_variable(0x1000, false, None).unwrap();
		let word = ctx.module.types.word();
		assert_eq!(ctx.module.global_pointee(g), word);
		assert_eq!(
			ctx.module.global(g).init,
			Some(Constant::Int { ty: word, bits: 0x1000 })
		);
		assert_eq!(ctx.module.verify(), Ok(()));
	}

	#[test]
	fn pointer_words_materialize_their_target() {
		let mut ctx = data_context(&[0x08, 0x10, 0, 0, 0, 0, 0, 0, 0x2a, 0, 0, 0]);
		let i32t = ctx.module.types.int(32);
		let ptr = ctx.module.types.pointer(i32t);
		ctx.debug_globals.insert(0x1000, DebugGlobal { name: None, ty: ptr });

		let g = ctx.get_global_variable(0x1000, false, None).unwrap();
		let target = ctx.module.global_at(0x1008).expect("target materialized");
		assert_eq!(
			ctx.module.global(g).init,
			Some(Constant::GlobalAddr {
				global: target,
				ty: ctx.module.value_type(ctx.module.global_value(target)),
			})
		);
		assert_eq!(ctx.module.verify(), Ok(()));
	}

	#[test]
	fn unreadable_initializers_keep_the_config_entry_only() {
		let mut ctx = data_context(&[1, 2, 3, 4]);
		let i64t = ctx.module.types.int(64);
		ctx.debug_globals.insert(0x1002, DebugGlobal { name: None, ty: i64t });
		assert_eq!(ctx.get_global_variable(0x1002, false, None), None);
		assert_eq!(ctx.module.global_at(0x1002), None);
		let entry = ctx.config.by_address(0x1002).expect("entry kept");
		assert_eq!(ctx.config.object(entry).ty_string, "i64");
		assert_eq!(ctx.config.handle(entry), None);
	}

	#[test]
	fn code_addresses_need_evidence() {
		let code = Segment::new(".text", 0x3000, SegmentFlags::CODE, &[0xff; 16][..]);
		let mut ctx = context_with(Arch::X86, vec![code]);
		assert!(!ctx.can_be_created(0x3000, false));
		assert_eq!(ctx.get_global_variable(0x3000, false, None), None);
		assert_eq!(ctx.loose_global_count(), 0);
	}

	#[test]
	fn interleaved_targets_relax_the_code_check() {
		let code = Segment::new(".text", 0x3000, SegmentFlags::CODE, &[0xff; 16][..]);
		let ctx = context_with(Arch::Thumb, vec![code]);
		assert!(ctx.can_be_created(0x3000, false));
		assert_eq!(ctx.loose_global_count(), 1);
		assert!(!ctx.can_be_created(0x3000, true));
		assert_eq!(ctx.loose_global_count(), 1);
	}

	#[test]
	fn word_pointing_at_data_rescues_a_code_address() {
		let code = Segment::new(".text", 0x3000, SegmentFlags::CODE, &[0x00, 0x10, 0, 0][..]);
		let data = Segment::new(".data", 0x1000, SegmentFlags::DATA, &[9, 9, 9, 9][..]);
		let ctx = context_with(Arch::X86, vec![code, data]);
		assert!(ctx.can_be_created(0x3000, true));
	}

	#[test]
	fn read_only_segments_mark_the_global_constant() {
		let seg = Segment::new(
			".rodata",
			0x1000,
			SegmentFlags::DATA | SegmentFlags::READ_ONLY,
			&[7, 0, 0, 0][..],
		);
		let mut ctx = context_with(Arch::X86, vec![seg]);
		let g = ctx.get_global_variable(0x1000, false, None).unwrap();
		assert!(ctx.module.global(g).constant);
	}

	#[test]
	fn crypto_patterns_win_the_override_chain() {
		let mut ctx = data_context(&[1, 0, 2, 0, 3, 0, 4, 0]);
		let i16t = ctx.module.types.int(16);
		let table = ctx.module.types.array(i16t, 4);
		ctx.crypto_patterns.insert(
			0x1000,
			crate::context::CryptoPattern {
				name: "crc16_tab".into(),
				description: "CRC-16 lookup table".into(),
				ty: table,
			},
		);
		let g = ctx.get_global_variable(0x1000, false, None).unwrap();
		assert_eq!(ctx.module.global(g).name, "crc16_tab");
		assert_eq!(ctx.module.global_pointee(g), table);
		let entry = ctx.config.by_address(0x1000).unwrap();
		assert_eq!(
			ctx.config.object(entry).crypto_description.as_deref(),
			Some("CRC-16 lookup table")
		);
	}
}
