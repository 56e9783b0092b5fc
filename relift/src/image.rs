use std::sync::Arc;

use bitflags::bitflags;
use derivative::Derivative;

use crate::ir::value::Constant;
use crate::ir::CastOp;
use crate::types::{Type, TypeId, TypePool};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Arch {
	X86,
	X86_64,
	Arm,
	Thumb,
	Pic32,
	Mips,
	PowerPc,
}

impl Arch {
	/// Targets that commonly interleave data with code (literal pools).
	pub fn interleaves_code_and_data(self) -> bool {
		matches!(self, Arch::Arm | Arch::Thumb | Arch::Pic32)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Endian {
	Little,
	Big,
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct SegmentFlags: u8 {
		const CODE = 0x1;
		const DATA = 0x2;
		const READ_ONLY = 0x4;
	}
}

enum SegmentData {
	Owned(Arc<[u8]>),
	#[cfg(feature = "memmap2")]
	Mapped(memmap2::Mmap),
}

impl SegmentData {
	fn bytes(&self) -> &[u8] {
		match self {
			SegmentData::Owned(data) => data,
			#[cfg(feature = "memmap2")]
			SegmentData::Mapped(map) => map,
		}
	}
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Segment {
	pub name: String,
	pub address: u64,
	pub flags: SegmentFlags,
	#[derivative(Debug = "ignore")]
	data: SegmentData,
}

impl Segment {
	pub fn new(
		name: impl Into<String>,
		address: u64,
		flags: SegmentFlags,
		data: impl Into<Arc<[u8]>>,
	) -> Self {
		Segment {
			name: name.into(),
			address,
			flags,
			data: SegmentData::Owned(data.into()),
		}
	}

	/// Maps a file's bytes as this segment's contents.
	#[cfg(feature = "memmap2")]
	pub fn map_file(
		name: impl Into<String>,
		address: u64,
		flags: SegmentFlags,
		path: impl AsRef<std::path::Path>,
	) -> std::io::Result<Self> {
		let file = std::fs::File::open(path)?;
		let map = unsafe { memmap2::Mmap::map(&file)? };
		Ok(Segment {
			name: name.into(),
			address,
			flags,
			data: SegmentData::Mapped(map),
		})
	}

	#[inline]
	pub fn data(&self) -> &[u8] {
		self.data.bytes()
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.data.bytes().len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.data.bytes().is_empty()
	}

	#[inline]
	pub fn contains(&self, addr: u64) -> bool {
		addr >= self.address && addr - self.address < self.len() as u64
	}
}

/// Read-only view over the loaded object file.
#[derive(Debug)]
pub struct ImageView {
	arch: Arch,
	endian: Endian,
	word_bytes: u32,
	segments: Vec<Segment>,
}

impl ImageView {
	pub fn new(arch: Arch, endian: Endian, word_bytes: u32, mut segments: Vec<Segment>) -> Self {
		segments.sort_by_key(|s| s.address);
		ImageView { arch, endian, word_bytes, segments }
	}

	#[inline]
	pub fn arch(&self) -> Arch {
		self.arch
	}

	#[inline]
	pub fn endian(&self) -> Endian {
		self.endian
	}

	#[inline]
	pub fn word_bytes(&self) -> u32 {
		self.word_bytes
	}

	#[inline]
	pub fn word_bits(&self) -> u32 {
		self.word_bytes * 8
	}

	#[inline]
	pub fn segments(&self) -> &[Segment] {
		&self.segments
	}

	pub fn segment_of(&self, addr: u64) -> Option<&Segment> {
		self.segments.iter().find(|s| s.contains(addr))
	}

	pub fn has_data_on(&self, addr: u64) -> bool {
		self.segment_of(addr).is_some()
	}

	pub fn has_read_only_data_on(&self, addr: u64) -> bool {
		matches!(self.segment_of(addr), Some(s) if s.flags.contains(SegmentFlags::READ_ONLY))
	}

	pub fn is_code(&self, addr: u64) -> bool {
		matches!(self.segment_of(addr), Some(s) if s.flags.contains(SegmentFlags::CODE))
	}

	pub fn bytes_at(&self, addr: u64, len: usize) -> Option<&[u8]> {
		let segment = self.segment_of(addr)?;
		let start = (addr - segment.address) as usize;
		segment.data().get(start..start + len)
	}

	/// Reads an unsigned integer of up to 8 bytes.
	pub fn read_uint(&self, addr: u64, bytes: u32) -> Option<u64> {
		Some(self.read_wide_uint(addr, bytes)? as u64)
	}

	/// Reads an unsigned integer of up to 16 bytes.
	pub fn read_wide_uint(&self, addr: u64, bytes: u32) -> Option<u128> {
		debug_assert!(bytes <= 16);
		let raw = self.bytes_at(addr, bytes as usize)?;
		let mut value = 0u128;
		match self.endian {
			Endian::Little => {
				for byte in raw.iter().rev() {
					value = (value << 8) | *byte as u128;
				}
			}
			Endian::Big => {
				for byte in raw {
					value = (value << 8) | *byte as u128;
				}
			}
		}
		Some(value)
	}

	/// Reads a word at the target's natural width.
	pub fn word_at(&self, addr: u64) -> Option<u64> {
		self.read_uint(addr, self.word_bytes)
	}

	/// Reads a terminated run of printable characters. Fails when a
	/// non-printable byte precedes the terminator or no terminator exists.
	pub fn string_at(&self, addr: u64) -> Option<String> {
		let segment = self.segment_of(addr)?;
		let start = (addr - segment.address) as usize;
		let data = &segment.data()[start..];
		let mut out = String::new();
		for &byte in data.iter().take(MAX_STRING_BYTES) {
			if byte == 0 {
				return Some(out);
			}
			if !is_printable(byte as u32) {
				return None;
			}
			out.push(byte as char);
		}
		None
	}

	/// Like [`string_at`](Self::string_at), over `unit_bytes`-wide units.
	pub fn wide_string_at(&self, addr: u64, unit_bytes: u32) -> Option<Vec<u32>> {
		debug_assert!(matches!(unit_bytes, 2 | 4));
		let mut out = Vec::new();
		let mut cursor = addr;
		for _ in 0..MAX_STRING_BYTES {
			let unit = self.read_uint(cursor, unit_bytes)? as u32;
			if unit == 0 {
				return Some(out);
			}
			if !is_printable(unit) {
				return None;
			}
			out.push(unit);
			cursor += unit_bytes as u64;
		}
		None
	}

	/// Materializes a constant of `ty` from the bytes at `addr`. Pointer
	/// words come back as raw int-to-pointer casts; resolving them against
	/// known globals is the caller's concern.
	pub fn constant(&self, types: &mut TypePool, ty: TypeId, addr: u64) -> Option<Constant> {
		match types.get(ty).clone() {
			Type::Void | Type::Function { .. } => None,
			Type::Int(bits) => {
				let bytes = (bits + 7) / 8;
				if bytes > 16 {
					return None;
				}
				let bits_read = self.read_wide_uint(addr, bytes)?;
				Some(Constant::Int { ty, bits: mask_to(bits_read, bits) })
			}
			Type::Float(bits) => {
				let bytes = (bits + 7) / 8;
				let bits_read = self.read_wide_uint(addr, bytes)?;
				Some(Constant::Float { ty, bits: mask_to(bits_read, bits) })
			}
			Type::Pointer(_) => {
				let word = self.word_at(addr)?;
				if word == 0 {
					return Some(Constant::Null { ty });
				}
				let word_ty = types.word();
				let value = Box::new(Constant::Int { ty: word_ty, bits: word as u128 });
				Some(Constant::Cast { op: CastOp::IntToPtr, ty, value })
			}
			Type::Array { elem, len } => {
				let stride = types.byte_width(elem);
				let mut elems = Vec::with_capacity(len as usize);
				for i in 0..len {
					elems.push(self.constant(types, elem, addr + i * stride)?);
				}
				Some(Constant::Array { ty, elems })
			}
			Type::Struct { fields, .. } => {
				let mut out = Vec::with_capacity(fields.len());
				for (i, field) in fields.iter().enumerate() {
					let offset = types.field_offset(ty, i)?;
					out.push(self.constant(types, *field, addr + offset)?);
				}
				Some(Constant::Struct { ty, fields: out })
			}
		}
	}
}

const MAX_STRING_BYTES: usize = 4096;

fn is_printable(c: u32) -> bool {
	matches!(c, 0x20..=0x7e | 0x09 | 0x0a | 0x0d)
}

fn mask_to(value: u128, bits: u32) -> u128 {
	if bits >= 128 {
		value
	} else {
		value & ((1u128 << bits) - 1)
	}
}
