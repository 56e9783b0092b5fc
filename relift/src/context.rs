use std::cell::Cell;
use std::collections::HashMap;

use fxhash::FxHashSet;
use nohash_hasher::BuildNoHashHasher;

use crate::config::ConfigStore;
use crate::image::ImageView;
use crate::ir::module::Module;
use crate::ir::{GlobalId, InstId};
use crate::types::TypeId;

/// A global known from debug information.
#[derive(Debug, Clone)]
pub struct DebugGlobal {
	pub name: Option<String>,
	pub ty: TypeId,
}

/// A pre-recognized constant table (S-box and the like) at a known address.
#[derive(Debug, Clone)]
pub struct CryptoPattern {
	pub name: String,
	pub description: String,
	pub ty: TypeId,
}

/// The unit of mutation: the IR, its config mirror and the image, threaded
/// through every operation. Owned by a single actor; nothing here suspends.
#[derive(Debug)]
pub struct Context {
	pub module: Module,
	pub config: ConfigStore,
	pub image: ImageView,
	pub debug_globals: HashMap<u64, DebugGlobal, BuildNoHashHasher<u64>>,
	pub crypto_patterns: HashMap<u64, CryptoPattern, BuildNoHashHasher<u64>>,
	loose_globals: Cell<u64>,
}

impl Context {
	pub fn new(image: ImageView) -> Self {
		Context {
			module: Module::new(image.word_bits()),
			config: ConfigStore::new(),
			image,
			debug_globals: HashMap::default(),
			crypto_patterns: HashMap::default(),
			loose_globals: Cell::new(0),
		}
	}

	/// How many globals were accepted only through the relaxed
	/// interleaved-code heuristic. Meant for diagnostic review.
	#[inline]
	pub fn loose_global_count(&self) -> u64 {
		self.loose_globals.get()
	}

	pub(crate) fn count_loose_global(&self) {
		self.loose_globals.set(self.loose_globals.get() + 1);
	}
}

/// Deferred-erasure handle. A client traversing the users of some object
/// cannot have those instructions deleted under it; it queues them here and
/// flushes once its cursors are gone.
#[derive(Debug, Default)]
pub struct EraseSet {
	pending: Vec<InstId>,
	seen: FxHashSet<InstId>,
	globals: Vec<GlobalId>,
}

impl EraseSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, inst: InstId) {
		if self.seen.insert(inst) {
			self.pending.push(inst);
		}
	}

	pub fn insert_global(&mut self, global: GlobalId) {
		if !self.globals.contains(&global) {
			self.globals.push(global);
		}
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.pending.is_empty() && self.globals.is_empty()
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.pending.len() + self.globals.len()
	}

	/// Erases everything queued, users before their operands. Queued
	/// instructions must be dead by now; anything still used points at a
	/// caller that queued too much.
	pub fn flush(&mut self, module: &mut Module) {
		loop {
			let mut progress = false;
			self.pending.retain(|&inst| {
				if module.is_erased(inst) {
					progress = true;
					return false;
				}
				if module.users(module.result(inst)).is_empty() {
					module.erase_inst(inst);
					progress = true;
					return false;
				}
				true
			});
			if self.pending.is_empty() {
				break;
			}
			if !progress {
				panic!(
					"erase set left instructions with live uses: {:?}",
					self.pending
				);
			}
		}
		for global in self.globals.drain(..) {
			module.remove_global(global);
		}
		self.seen.clear();
	}
}
