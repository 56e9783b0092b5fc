use std::collections::HashMap;

use nohash_hasher::BuildNoHashHasher;

use crate::ir::inst::{Inst, InstKind, InsertPoint};
use crate::ir::value::{Constant, Use, ValueData, ValueRecord};
use crate::ir::{BlockId, CastOp, FuncId, GlobalId, InstId, ValueId};
use crate::types::{Type, TypeId, TypePool};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Linkage {
	Private,
	Internal,
	External,
}

#[derive(Debug)]
pub struct Global {
	pub name: String,
	/// Always a pointer type; the pointee is the stored object's type.
	pub ty: TypeId,
	pub init: Option<Constant>,
	pub address: Option<u64>,
	pub constant: bool,
	pub linkage: Linkage,
	pub(crate) value: ValueId,
	pub(crate) dead: bool,
}

#[derive(Debug)]
pub struct Function {
	pub name: String,
	pub ty: TypeId,
	pub address: Option<u64>,
	pub(crate) args: Vec<ValueId>,
	pub(crate) blocks: Vec<BlockId>,
}

impl Function {
	#[inline]
	pub fn args(&self) -> &[ValueId] {
		&self.args
	}

	#[inline]
	pub fn blocks(&self) -> &[BlockId] {
		&self.blocks
	}
}

#[derive(Debug)]
struct Block {
	func: FuncId,
	insts: Vec<InstId>,
}

/// The in-memory SSA program. Values, instructions, blocks, functions and
/// globals live in slab arenas and are addressed by copyable ids; per-value
/// use lists make `replace_all_uses_with` proportional to the user count.
#[derive(Debug)]
pub struct Module {
	pub types: TypePool,
	values: Vec<ValueRecord>,
	insts: Vec<Option<Inst>>,
	blocks: Vec<Block>,
	funcs: Vec<Function>,
	globals: Vec<Global>,
	globals_by_address: HashMap<u64, GlobalId, BuildNoHashHasher<u64>>,
	funcs_by_address: HashMap<u64, FuncId, BuildNoHashHasher<u64>>,
}

impl Module {
	pub fn new(ptr_bits: u32) -> Self {
		Module {
			types: TypePool::new(ptr_bits),
			values: Vec::new(),
			insts: Vec::new(),
			blocks: Vec::new(),
			funcs: Vec::new(),
			globals: Vec::new(),
			globals_by_address: HashMap::default(),
			funcs_by_address: HashMap::default(),
		}
	}

	fn new_value(&mut self, data: ValueData, ty: TypeId) -> ValueId {
		let id = ValueId(self.values.len() as u32);
		self.values.push(ValueRecord { data, ty, users: Vec::new() });
		id
	}

	#[inline]
	pub fn value_type(&self, v: ValueId) -> TypeId {
		self.values[v.idx()].ty
	}

	#[inline]
	pub fn value_data(&self, v: ValueId) -> &ValueData {
		&self.values[v.idx()].data
	}

	#[inline]
	pub fn users(&self, v: ValueId) -> &[Use] {
		&self.values[v.idx()].users
	}

	pub fn constant(&mut self, c: Constant) -> ValueId {
		let ty = c.ty();
		self.new_value(ValueData::Constant(c), ty)
	}

	pub fn undef(&mut self, ty: TypeId) -> ValueId {
		self.new_value(ValueData::Undef, ty)
	}

	/// The constant form of a value, when it has one.
	pub fn as_constant(&self, v: ValueId) -> Option<Constant> {
		match &self.values[v.idx()].data {
			ValueData::Constant(c) => Some(c.clone()),
			ValueData::Global(g) => Some(Constant::GlobalAddr { global: *g, ty: self.values[v.idx()].ty }),
			ValueData::Undef => Some(Constant::Undef { ty: self.values[v.idx()].ty }),
			_ => None,
		}
	}

	// ---- functions ----------------------------------------------------

	pub fn add_function(
		&mut self,
		name: impl Into<String>,
		ret: TypeId,
		params: &[TypeId],
		vararg: bool,
		address: Option<u64>,
	) -> FuncId {
		let id = FuncId(self.funcs.len() as u32);
		let ty = self.types.function(ret, params.to_vec(), vararg);
		let args = params
			.iter()
			.enumerate()
			.map(|(index, param)| {
				self.new_value(ValueData::Argument { func: id, index: index as u32 }, *param)
			})
			.collect();
		self.funcs.push(Function { name: name.into(), ty, address, args, blocks: Vec::new() });
		if let Some(addr) = address {
			self.funcs_by_address.insert(addr, id);
		}
		id
	}

	#[inline]
	pub fn function(&self, f: FuncId) -> &Function {
		&self.funcs[f.idx()]
	}

	pub fn functions(&self) -> impl Iterator<Item = FuncId> + '_ {
		(0..self.funcs.len() as u32).map(FuncId)
	}

	#[inline]
	pub fn function_at(&self, address: u64) -> Option<FuncId> {
		self.funcs_by_address.get(&address).copied()
	}

	#[inline]
	pub fn arg(&self, f: FuncId, index: u32) -> ValueId {
		self.funcs[f.idx()].args[index as usize]
	}

	pub fn set_function_name(&mut self, f: FuncId, name: impl Into<String>) {
		self.funcs[f.idx()].name = name.into();
	}

	/// Rebuilds the signature with the argument at `index` retyped. The
	/// argument keeps its value identity; only its type (and the function
	/// type) change.
	pub fn retype_argument(&mut self, f: FuncId, index: u32, ty: TypeId) -> ValueId {
		let arg = self.funcs[f.idx()].args[index as usize];
		self.values[arg.idx()].ty = ty;
		let fty = self.funcs[f.idx()].ty;
		let Type::Function { ret, mut params, vararg } = self.types.get(fty).clone() else {
			unreachable!("function {f:?} carries a non-function type");
		};
		params[index as usize] = ty;
		self.funcs[f.idx()].ty = self.types.function(ret, params, vararg);
		arg
	}

	// ---- blocks -------------------------------------------------------

	pub fn add_block(&mut self, f: FuncId) -> BlockId {
		let id = BlockId(self.blocks.len() as u32);
		self.blocks.push(Block { func: f, insts: Vec::new() });
		self.funcs[f.idx()].blocks.push(id);
		id
	}

	pub fn entry_block(&self, f: FuncId) -> BlockId {
		*self.funcs[f.idx()]
			.blocks
			.first()
			.unwrap_or_else(|| panic!("function {f:?} has no blocks"))
	}

	#[inline]
	pub fn block_func(&self, b: BlockId) -> FuncId {
		self.blocks[b.idx()].func
	}

	#[inline]
	pub fn block_insts(&self, b: BlockId) -> &[InstId] {
		&self.blocks[b.idx()].insts
	}

	// ---- instructions -------------------------------------------------

	pub fn inst(&self, i: InstId) -> &Inst {
		match &self.insts[i.idx()] {
			Some(inst) => inst,
			None => panic!("use of erased instruction {i:?}"),
		}
	}

	fn inst_mut(&mut self, i: InstId) -> &mut Inst {
		match &mut self.insts[i.idx()] {
			Some(inst) => inst,
			None => panic!("use of erased instruction {i:?}"),
		}
	}

	#[inline]
	pub fn is_erased(&self, i: InstId) -> bool {
		self.insts[i.idx()].is_none()
	}

	#[inline]
	pub fn result(&self, i: InstId) -> ValueId {
		self.inst(i).result
	}

	fn position(&self, b: BlockId, i: InstId) -> usize {
		self.blocks[b.idx()]
			.insts
			.iter()
			.position(|x| *x == i)
			.unwrap_or_else(|| panic!("{i:?} is not in {b:?}"))
	}

	fn insert_pos(&self, at: InsertPoint) -> (BlockId, usize) {
		match at {
			InsertPoint::Before(i) => {
				let b = self.inst(i).block;
				(b, self.position(b, i))
			}
			InsertPoint::After(i) => {
				let b = self.inst(i).block;
				(b, self.position(b, i) + 1)
			}
			InsertPoint::AtStart(b) => (b, 0),
			InsertPoint::AtEnd(b) => (b, self.blocks[b.idx()].insts.len()),
		}
	}

	pub fn build_inst(
		&mut self,
		kind: InstKind,
		ty: TypeId,
		name: Option<String>,
		at: InsertPoint,
	) -> InstId {
		let (block, pos) = self.insert_pos(at);
		self.build_inst_at(kind, ty, name, block, pos)
	}

	fn build_inst_at(
		&mut self,
		kind: InstKind,
		ty: TypeId,
		name: Option<String>,
		block: BlockId,
		pos: usize,
	) -> InstId {
		let id = InstId(self.insts.len() as u32);
		let result = self.new_value(ValueData::Inst(id), ty);
		self.insts.push(Some(Inst { kind, ty, name, block, result }));
		self.blocks[block.idx()].insts.insert(pos, id);
		let operands = self.inst(id).kind.operands();
		for (index, op) in operands.into_iter().enumerate() {
			self.values[op.idx()].users.push(Use::Operand { inst: id, index: index as u32 });
		}
		id
	}

	/// Builds an alloca in the function's entry block, after any allocas
	/// already leading it and before the first ordinary instruction.
	pub fn build_alloca(&mut self, f: FuncId, allocated: TypeId, name: Option<String>) -> InstId {
		let ty = self.types.pointer(allocated);
		let entry = self.entry_block(f);
		let pos = self.blocks[entry.idx()]
			.insts
			.iter()
			.take_while(|i| self.inst(**i).is_alloca())
			.count();
		self.build_inst_at(InstKind::Alloca { allocated }, ty, name, entry, pos)
	}

	pub fn build_load(&mut self, ptr: ValueId, name: Option<String>, at: InsertPoint) -> InstId {
		let ptr_ty = self.value_type(ptr);
		let ty = match self.types.get(ptr_ty) {
			Type::Pointer(elem) => *elem,
			other => panic!("load through a non-pointer value of type {other:?}"),
		};
		self.build_inst(InstKind::Load { ptr }, ty, name, at)
	}

	pub fn build_store(&mut self, value: ValueId, ptr: ValueId, at: InsertPoint) -> InstId {
		let ty = self.types.void();
		self.build_inst(InstKind::Store { value, ptr }, ty, None, at)
	}

	pub fn build_cast(&mut self, op: CastOp, value: ValueId, ty: TypeId, at: InsertPoint) -> InstId {
		self.build_inst(InstKind::Cast { op, value }, ty, None, at)
	}

	pub fn build_extract_value(
		&mut self,
		agg: ValueId,
		indices: Vec<u32>,
		at: InsertPoint,
	) -> InstId {
		let mut ty = self.value_type(agg);
		for &index in &indices {
			ty = self
				.types
				.field(ty, index as usize)
				.unwrap_or_else(|| panic!("extractvalue index {index} out of range"));
		}
		self.build_inst(InstKind::ExtractValue { agg, indices }, ty, None, at)
	}

	pub fn build_insert_value(
		&mut self,
		agg: ValueId,
		elem: ValueId,
		indices: Vec<u32>,
		at: InsertPoint,
	) -> InstId {
		let ty = self.value_type(agg);
		self.build_inst(InstKind::InsertValue { agg, elem, indices }, ty, None, at)
	}

	/// Transfers an instruction's name to the caller.
	pub fn take_inst_name(&mut self, i: InstId) -> Option<String> {
		self.inst_mut(i).name.take()
	}

	/// Rewrites a global's initializer so references to `old` become `with`.
	pub fn replace_initializer_reference(&mut self, g: GlobalId, old: ValueId, with: &Constant) {
		let ValueData::Global(old_g) = *self.value_data(old) else {
			panic!("initializer use recorded on a non-global value {old:?}");
		};
		self.unregister_init_uses(g);
		if let Some(init) = self.globals[g.idx()].init.as_mut() {
			init.replace_global(old_g, with);
		}
		self.register_init_uses(g);
	}

	/// Rewrites one operand slot, keeping use lists coherent.
	pub fn set_operand(&mut self, i: InstId, index: u32, v: ValueId) {
		let old = self.inst(i).kind.operands()[index as usize];
		if old == v {
			return;
		}
		*self.inst_mut(i).kind.operands_mut()[index as usize] = v;
		let entry = Use::Operand { inst: i, index };
		remove_use(&mut self.values[old.idx()].users, entry);
		self.values[v.idx()].users.push(entry);
	}

	/// Rewrites every use of `old` to `new`. Initializer uses require `new`
	/// to have a constant form.
	pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) {
		if old == new {
			return;
		}
		let uses = std::mem::take(&mut self.values[old.idx()].users);
		for entry in uses {
			match entry {
				Use::Operand { inst, index } => {
					*self.inst_mut(inst).kind.operands_mut()[index as usize] = new;
					self.values[new.idx()].users.push(entry);
				}
				Use::Initializer(g) => {
					let Some(replacement) = self.as_constant(new) else {
						panic!("cannot place {new:?} inside a constant initializer");
					};
					self.replace_initializer_reference(g, old, &replacement);
				}
			}
		}
	}

	/// Erases an instruction. The instruction must have no remaining users.
	pub fn erase_inst(&mut self, i: InstId) {
		let inst = match self.insts[i.idx()].take() {
			Some(inst) => inst,
			None => panic!("instruction {i:?} erased twice"),
		};
		assert!(
			self.values[inst.result.idx()].users.is_empty(),
			"erasing {i:?} while its result still has users"
		);
		for (index, op) in inst.kind.operands().into_iter().enumerate() {
			remove_use(
				&mut self.values[op.idx()].users,
				Use::Operand { inst: i, index: index as u32 },
			);
		}
		let pos = self.position(inst.block, i);
		self.blocks[inst.block.idx()].insts.remove(pos);
		self.values[inst.result.idx()].data = ValueData::Undef;
	}

	// ---- globals ------------------------------------------------------

	pub fn add_global(
		&mut self,
		name: impl Into<String>,
		pointee: TypeId,
		init: Option<Constant>,
		address: Option<u64>,
		constant: bool,
		linkage: Linkage,
	) -> GlobalId {
		let name = name.into();
		let ty = self.types.pointer(pointee);
		if let Some(addr) = address {
			debug_assert!(
				!self
					.globals
					.iter()
					.any(|g| !g.dead && g.address == Some(addr) && g.name == name),
				"duplicate global `{name}` at {addr:#x}"
			);
			debug_assert!(!self.globals_by_address.contains_key(&addr));
		}
		let id = GlobalId(self.globals.len() as u32);
		let value = self.new_value(ValueData::Global(id), ty);
		self.globals.push(Global {
			name,
			ty,
			init: None,
			address,
			constant,
			linkage,
			value,
			dead: false,
		});
		if let Some(addr) = address {
			self.globals_by_address.insert(addr, id);
		}
		if init.is_some() {
			self.set_global_initializer(id, init);
		}
		id
	}

	#[inline]
	pub fn global(&self, g: GlobalId) -> &Global {
		&self.globals[g.idx()]
	}

	#[inline]
	pub fn global_value(&self, g: GlobalId) -> ValueId {
		self.globals[g.idx()].value
	}

	pub fn global_pointee(&self, g: GlobalId) -> TypeId {
		self.types
			.element(self.globals[g.idx()].ty)
			.unwrap_or_else(|| panic!("global {g:?} carries a non-pointer type"))
	}

	#[inline]
	pub fn global_at(&self, address: u64) -> Option<GlobalId> {
		self.globals_by_address.get(&address).copied()
	}

	pub fn globals(&self) -> impl Iterator<Item = GlobalId> + '_ {
		(0..self.globals.len() as u32)
			.map(GlobalId)
			.filter(|g| !self.globals[g.idx()].dead)
	}

	pub fn set_global_initializer(&mut self, g: GlobalId, init: Option<Constant>) {
		self.unregister_init_uses(g);
		self.globals[g.idx()].init = init;
		self.register_init_uses(g);
	}

	/// Detaches a global from its binary address without removing it.
	pub fn clear_global_address(&mut self, g: GlobalId) {
		if let Some(addr) = self.globals[g.idx()].address.take() {
			self.globals_by_address.remove(&addr);
		}
	}

	/// Removes a global. Its value must have no remaining users.
	pub fn remove_global(&mut self, g: GlobalId) {
		let value = self.globals[g.idx()].value;
		assert!(
			self.values[value.idx()].users.is_empty(),
			"removing global {g:?} while its value still has users"
		);
		self.unregister_init_uses(g);
		self.clear_global_address(g);
		let glob = &mut self.globals[g.idx()];
		glob.init = None;
		glob.dead = true;
		self.values[value.idx()].data = ValueData::Undef;
	}

	fn register_init_uses(&mut self, g: GlobalId) {
		let mut refs = Vec::new();
		if let Some(init) = &self.globals[g.idx()].init {
			init.referenced_globals(&mut refs);
		}
		for referenced in refs {
			let value = self.globals[referenced.idx()].value;
			self.values[value.idx()].users.push(Use::Initializer(g));
		}
	}

	fn unregister_init_uses(&mut self, g: GlobalId) {
		let mut refs = Vec::new();
		if let Some(init) = &self.globals[g.idx()].init {
			init.referenced_globals(&mut refs);
		}
		for referenced in refs {
			let value = self.globals[referenced.idx()].value;
			self.values[value.idx()].users.retain(|u| *u != Use::Initializer(g));
		}
	}

	/// Whether `init`, installed on `g`, would reference `g` directly or
	/// through the initializers of other globals.
	pub fn initializer_would_cycle(&self, g: GlobalId, init: &Constant) -> bool {
		let mut queue = Vec::new();
		init.referenced_globals(&mut queue);
		let mut visited: Vec<GlobalId> = queue.clone();
		while let Some(current) = queue.pop() {
			if current == g {
				return true;
			}
			if let Some(inner) = &self.globals[current.idx()].init {
				let mut next = Vec::new();
				inner.referenced_globals(&mut next);
				for n in next {
					if !visited.contains(&n) {
						visited.push(n);
						queue.push(n);
					}
				}
			}
		}
		false
	}
}

fn remove_use(users: &mut Vec<Use>, entry: Use) {
	let pos = users
		.iter()
		.position(|u| *u == entry)
		.unwrap_or_else(|| panic!("use list is missing {entry:?}"));
	users.swap_remove(pos);
}
