//! The opaque value-type seam.
//!
//! The backend never understands concrete script types (structs, objects,
//! enums, ...). It sees every type through [`ValueType`]: a byte size, an
//! alignment, and optional lifecycle callbacks. The type system that owns the
//! real semantics registers its types in a [`TypeRegistry`] before
//! compilation; the allocator, packer and executor only ever call through
//! the trait.

use std::fmt;

/// Index of a registered type in a [`TypeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TypeId(pub u32);

/// Lifecycle and layout contract for one script value type.
///
/// `init`/`assign`/`destruct` are only invoked for types that report them
/// via `has_init`/`has_destruct`; plain-old-data types keep the defaults and
/// the core degenerates to `memcpy` semantics for them.
///
/// The callbacks receive raw frame bytes. The core guarantees the slices are
/// exactly `size()` long and aligned to `align()` within the frame arena.
pub trait ValueType {
    /// Type name, used in disassembly and throw reports.
    fn name(&self) -> &str;

    /// Storage size in bytes. Zero-sized types are legal and never allocated.
    fn size(&self) -> u32;

    /// Required alignment in bytes; must be a power of two.
    fn align(&self) -> u32 {
        self.size().clamp(1, 8).next_power_of_two()
    }

    /// True if `init` must run before the storage is used.
    fn has_init(&self) -> bool {
        false
    }

    /// True if `destruct` must run when the storage dies.
    fn has_destruct(&self) -> bool {
        false
    }

    /// Constructs a value in uninitialized storage.
    fn init(&self, mem: &mut [u8]) {
        mem.fill(0);
    }

    /// Copies `src` over an initialized `dst`, releasing whatever `dst` held.
    fn assign(&self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }

    /// Copies `src` into uninitialized `dst` (no old value to release).
    fn init_assign(&self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }

    /// Destroys the value; the storage is dead afterwards.
    fn destruct(&self, _mem: &mut [u8]) {}
}

/// Table of every type a compilation may reference, indexed by [`TypeId`].
///
/// Owned by the embedder during compilation and moved into the
/// [`crate::Module`] afterwards so packed literals can be destructed when the
/// module is dropped.
pub struct TypeRegistry {
    entries: Vec<Box<dyn ValueType>>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registers a type and returns its id.
    pub fn register(&mut self, ty: impl ValueType + 'static) -> TypeId {
        let id = TypeId(u32::try_from(self.entries.len()).expect("type table overflow"));
        self.entries.push(Box::new(ty));
        id
    }

    /// Looks up a type by id.
    ///
    /// # Panics
    /// Panics if the id was not produced by this registry; instruction
    /// streams are validated against the registry before packing, so a bad
    /// id here is a caller bug, not script input.
    #[must_use]
    pub fn get(&self, id: TypeId) -> &dyn ValueType {
        self.entries[id.0 as usize].as_ref()
    }

    /// True if `id` names a registered type.
    #[must_use]
    pub fn contains(&self, id: TypeId) -> bool {
        (id.0 as usize) < self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|t| t.name()))
            .finish()
    }
}

/// A plain N-byte scalar with no lifecycle callbacks.
///
/// This is what primitive script types (ints, floats, bools, raw handles)
/// register as; the core moves them with `memcpy`.
#[derive(Debug, Clone)]
pub struct Scalar {
    name: &'static str,
    size: u32,
}

impl Scalar {
    #[must_use]
    pub fn new(name: &'static str, size: u32) -> Self {
        Self { name, size }
    }
}

impl ValueType for Scalar {
    fn name(&self) -> &str {
        self.name
    }

    fn size(&self) -> u32 {
        self.size
    }
}
