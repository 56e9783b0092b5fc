use std::collections::HashMap;

use fxhash::FxHashMap;
use nohash_hasher::BuildNoHashHasher;
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::ir::module::Module;
use crate::ir::{FuncId, GlobalId, InstId};
use crate::types::TypeId;

/// Identity of the IR object a config entry mirrors. Keys are stable ids,
/// never raw pointers: IR objects are re-created during type changes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IrHandle {
	Global(GlobalId),
	/// The alloca of a stack slot.
	Stack(InstId),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Storage {
	Global(u64),
	Stack { func: FuncId, offset: i64 },
	Register(u32),
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ObjectId(u32);

impl ObjectId {
	#[inline]
	fn idx(self) -> usize {
		self.0 as usize
	}
}

#[derive(Debug, Clone)]
pub struct ConfigObject {
	pub name: String,
	pub storage: Storage,
	/// Runtime type, when known. Lost across serialization; the rendered
	/// string below is the durable form.
	pub ty: Option<TypeId>,
	pub ty_string: String,
	pub crypto_description: Option<String>,
	pub from_debug: bool,
	pub wide_string: bool,
}

#[derive(Debug, Clone)]
pub struct ConfigFunction {
	pub name: String,
	pub address: Option<u64>,
	pub param_storage: Vec<Storage>,
	pub calling_convention: CallingConvention,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallingConvention {
	#[default]
	Unknown,
	Cdecl,
	Stdcall,
	Fastcall,
	Thiscall,
	Pascal,
	Watcom,
}

/// Source-level metadata mirroring selected IR objects, keyed bidirectionally
/// by IR handle and by binary address.
#[derive(Debug, Default)]
pub struct ConfigStore {
	objects: Vec<Option<ConfigObject>>,
	handles: Vec<Option<IrHandle>>,
	by_address: HashMap<u64, ObjectId, BuildNoHashHasher<u64>>,
	by_handle: FxHashMap<IrHandle, ObjectId>,
	by_stack: FxHashMap<(FuncId, i64), ObjectId>,
	functions: FxHashMap<FuncId, ConfigFunction>,
}

impl ConfigStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert_object(&mut self, object: ConfigObject, handle: Option<IrHandle>) -> ObjectId {
		let id = ObjectId(self.objects.len() as u32);
		match object.storage {
			Storage::Global(addr) => {
				debug_assert!(!self.by_address.contains_key(&addr));
				self.by_address.insert(addr, id);
			}
			Storage::Stack { func, offset } => {
				debug_assert!(!self.by_stack.contains_key(&(func, offset)));
				self.by_stack.insert((func, offset), id);
			}
			Storage::Register(_) => {}
		}
		if let Some(handle) = handle {
			self.by_handle.insert(handle, id);
		}
		self.objects.push(Some(object));
		self.handles.push(handle);
		id
	}

	pub fn object(&self, id: ObjectId) -> &ConfigObject {
		match &self.objects[id.idx()] {
			Some(object) => object,
			None => panic!("use of removed config object {id:?}"),
		}
	}

	/// Mutable access to an entry. The storage key must not be changed
	/// through this; use removal + insertion for that.
	pub fn object_mut(&mut self, id: ObjectId) -> &mut ConfigObject {
		match &mut self.objects[id.idx()] {
			Some(object) => object,
			None => panic!("use of removed config object {id:?}"),
		}
	}

	#[inline]
	pub fn handle(&self, id: ObjectId) -> Option<IrHandle> {
		self.handles[id.idx()]
	}

	/// Re-points an entry at a different IR object.
	pub fn rebind_handle(&mut self, id: ObjectId, handle: Option<IrHandle>) {
		if let Some(old) = self.handles[id.idx()] {
			self.by_handle.remove(&old);
		}
		if let Some(new) = handle {
			self.by_handle.insert(new, id);
		}
		self.handles[id.idx()] = handle;
	}

	#[inline]
	pub fn by_address(&self, addr: u64) -> Option<ObjectId> {
		self.by_address.get(&addr).copied()
	}

	#[inline]
	pub fn by_handle(&self, handle: IrHandle) -> Option<ObjectId> {
		self.by_handle.get(&handle).copied()
	}

	#[inline]
	pub fn by_stack(&self, func: FuncId, offset: i64) -> Option<ObjectId> {
		self.by_stack.get(&(func, offset)).copied()
	}

	pub fn remove_object(&mut self, id: ObjectId) {
		let Some(object) = self.objects[id.idx()].take() else {
			panic!("config object {id:?} removed twice");
		};
		match object.storage {
			Storage::Global(addr) => {
				self.by_address.remove(&addr);
			}
			Storage::Stack { func, offset } => {
				self.by_stack.remove(&(func, offset));
			}
			Storage::Register(_) => {}
		}
		if let Some(handle) = self.handles[id.idx()].take() {
			self.by_handle.remove(&handle);
		}
	}

	pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &ConfigObject)> {
		self.objects
			.iter()
			.enumerate()
			.filter_map(|(i, o)| Some((ObjectId(i as u32), o.as_ref()?)))
	}

	pub fn set_function(&mut self, func: FuncId, entry: ConfigFunction) {
		self.functions.insert(func, entry);
	}

	#[inline]
	pub fn function(&self, func: FuncId) -> Option<&ConfigFunction> {
		self.functions.get(&func)
	}

	pub fn function_mut(&mut self, func: FuncId) -> Option<&mut ConfigFunction> {
		self.functions.get_mut(&func)
	}

	pub fn functions(&self) -> impl Iterator<Item = (FuncId, &ConfigFunction)> {
		self.functions.iter().map(|(f, e)| (*f, e))
	}

	// ---- on-disk form -------------------------------------------------

	pub fn to_document(&self, module: &Module) -> Document {
		let storage_doc = |storage: &Storage| match storage {
			Storage::Global(addr) => DocStorage::Global { address: *addr },
			Storage::Stack { func, offset } => DocStorage::Stack {
				function: module.function(*func).name.clone(),
				offset: *offset,
			},
			Storage::Register(id) => DocStorage::Register { id: *id },
		};
		let objects = self
			.objects()
			.map(|(_, o)| DocObject {
				name: o.name.clone(),
				storage: storage_doc(&o.storage),
				type_llvm_ir: o.ty_string.clone(),
				crypto_description: o.crypto_description.clone(),
				is_from_debug: o.from_debug,
				is_wide_string: o.wide_string,
			})
			.collect();
		let functions = self
			.functions
			.values()
			.map(|f| DocFunction {
				name: f.name.clone(),
				address: f.address,
				parameters: f.param_storage.iter().map(storage_doc).collect(),
				calling_convention: f.calling_convention,
			})
			.collect();
		Document { objects, functions }
	}

	pub fn from_document(doc: &Document, module: &Module) -> Result<Self, Error> {
		let mut func_by_name: FxHashMap<&str, FuncId> = FxHashMap::default();
		for f in module.functions() {
			func_by_name.insert(&module.function(f).name, f);
		}
		let resolve = |storage: &DocStorage| -> Result<Storage, Error> {
			Ok(match storage {
				DocStorage::Global { address } => Storage::Global(*address),
				DocStorage::Stack { function, offset } => {
					let func = *func_by_name.get(function.as_str()).ok_or_else(|| {
						Error::InvalidDocument(format!("unknown function `{function}`"))
					})?;
					Storage::Stack { func, offset: *offset }
				}
				DocStorage::Register { id } => Storage::Register(*id),
			})
		};
		let mut store = ConfigStore::new();
		for object in &doc.objects {
			store.insert_object(
				ConfigObject {
					name: object.name.clone(),
					storage: resolve(&object.storage)?,
					ty: None,
					ty_string: object.type_llvm_ir.clone(),
					crypto_description: object.crypto_description.clone(),
					from_debug: object.is_from_debug,
					wide_string: object.is_wide_string,
				},
				None,
			);
		}
		for function in &doc.functions {
			let func = function
				.address
				.and_then(|a| module.function_at(a))
				.or_else(|| func_by_name.get(function.name.as_str()).copied())
				.ok_or_else(|| {
					Error::InvalidDocument(format!("unknown function `{}`", function.name))
				})?;
			store.set_function(
				func,
				ConfigFunction {
					name: function.name.clone(),
					address: function.address,
					param_storage: function
						.parameters
						.iter()
						.map(&resolve)
						.collect::<Result<_, _>>()?,
					calling_convention: function.calling_convention,
				},
			);
		}
		Ok(store)
	}

	pub fn to_json(&self, module: &Module) -> String {
		serde_json::to_string_pretty(&self.to_document(module))
			.unwrap_or_else(|e| panic!("config document failed to serialize: {e}"))
	}

	pub fn from_json(json: &str, module: &Module) -> Result<Self, Error> {
		let doc: Document =
			serde_json::from_str(json).map_err(|e| Error::InvalidDocument(e.to_string()))?;
		Self::from_document(&doc, module)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DocStorage {
	Global { address: u64 },
	Stack { function: String, offset: i64 },
	Register { id: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DocObject {
	pub name: String,
	pub storage: DocStorage,
	pub type_llvm_ir: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub crypto_description: Option<String>,
	#[serde(default)]
	pub is_from_debug: bool,
	#[serde(default)]
	pub is_wide_string: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DocFunction {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub address: Option<u64>,
	pub parameters: Vec<DocStorage>,
	pub calling_convention: CallingConvention,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Document {
	pub objects: Vec<DocObject>,
	pub functions: Vec<DocFunction>,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn module_with_fn() -> (Module, FuncId) {
		let mut m = Module::new(32);
		let i32t = m.types.int(32);
		let f = m.add_function("main", i32t, &[], false, Some(0x400));
		(m, f)
	}

	fn object(name: &str, storage: Storage) -> ConfigObject {
		ConfigObject {
			name: name.into(),
			storage,
			ty: None,
			ty_string: "i32".into(),
			crypto_description: None,
			from_debug: false,
			wide_string: false,
		}
	}

	#[test]
	fn bidirectional_lookup() {
		let (_, f) = module_with_fn();
		let mut store = ConfigStore::new();
		let a = store.insert_object(object("g", Storage::Global(0x1000)), None);
		let b = store.insert_object(
			object("x_-16", Storage::Stack { func: f, offset: -16 }),
			Some(IrHandle::Stack(InstId(0))),
		);
		assert_eq!(store.by_address(0x1000), Some(a));
		assert_eq!(store.by_stack(f, -16), Some(b));
		assert_eq!(store.by_handle(IrHandle::Stack(InstId(0))), Some(b));
		assert_eq!(store.by_address(0x2000), None);
	}

	#[test]
	fn rebind_moves_the_handle_key() {
		let (_, f) = module_with_fn();
		let mut store = ConfigStore::new();
		let id = store.insert_object(
			object("x_-8", Storage::Stack { func: f, offset: -8 }),
			Some(IrHandle::Stack(InstId(1))),
		);
		store.rebind_handle(id, Some(IrHandle::Stack(InstId(7))));
		assert_eq!(store.by_handle(IrHandle::Stack(InstId(1))), None);
		assert_eq!(store.by_handle(IrHandle::Stack(InstId(7))), Some(id));
	}

	#[test]
	fn removal_clears_all_keys() {
		let (_, f) = module_with_fn();
		let mut store = ConfigStore::new();
		let id = store.insert_object(
			object("y_-4", Storage::Stack { func: f, offset: -4 }),
			Some(IrHandle::Stack(InstId(2))),
		);
		store.remove_object(id);
		assert_eq!(store.by_stack(f, -4), None);
		assert_eq!(store.by_handle(IrHandle::Stack(InstId(2))), None);
	}

	#[test]
	fn json_round_trip() {
		let (m, f) = module_with_fn();
		let mut store = ConfigStore::new();
		store.insert_object(object("table_8048000", Storage::Global(0x8048000)), None);
		store.insert_object(object("x_-16", Storage::Stack { func: f, offset: -16 }), None);
		store.set_function(
			f,
			ConfigFunction {
				name: "main".into(),
				address: Some(0x400),
				param_storage: vec![Storage::Register(3)],
				calling_convention: CallingConvention::Cdecl,
			},
		);

		let json = store.to_json(&m);
		assert!(json.contains("type-llvm-ir"));
		assert!(json.contains("calling-convention"));

		let restored = ConfigStore::from_json(&json, &m).unwrap();
		assert!(restored.by_address(0x8048000).is_some());
		let slot = restored.by_stack(f, -16).unwrap();
		assert_eq!(restored.object(slot).name, "x_-16");
		assert_eq!(
			restored.function(f).unwrap().calling_convention,
			CallingConvention::Cdecl
		);
	}

	#[test]
	fn unknown_function_in_document_is_rejected() {
		let (m, _) = module_with_fn();
		let doc = Document {
			objects: vec![DocObject {
				name: "z".into(),
				storage: DocStorage::Stack { function: "nope".into(), offset: -4 },
				type_llvm_ir: "i32".into(),
				crypto_description: None,
				is_from_debug: false,
				is_wide_string: false,
			}],
			functions: vec![],
		};
		assert!(ConfigStore::from_document(&doc, &m).is_err());
	}
}
