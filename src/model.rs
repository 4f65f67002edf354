//! Data model types.
//!
//! This is our abstract description of the entities recorded in a heap dump:
//! objects, roots, goroutines, stack frames, runtime types, and the
//! bookkeeping records that ride along with them.

use std::collections::BTreeMap;

/// Identifies an object in the heap by its dense index.
///
/// Valid ids run from 0 to `Dump::num_objects() - 1`, assigned after the
/// object table has been sorted by address. Lookups that may miss return
/// `Option<ObjId>` instead of a sentinel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjId(pub usize);

/// Identifies a deduplicated object shape in `Dump::full_types`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FullTypeId(pub usize);

/// Identifies a stack frame in `Dump::frames`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FrameId(pub usize);

/// Identifies a memory-profile record in `Dump::memprof`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MemProfId(pub usize);

/// Classifies one slot of an object, frame, or segment.
///
/// The numeric values are the wire encoding used by field-descriptor lists
/// in the dump. `Eol` terminates a list. Kinds `Bytes8` and up never appear
/// on the wire; they are synthesised by the naming pass.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FieldKind {
    Eol = 0,
    Ptr = 1,
    Iface = 2,
    Eface = 3,
    String = 4,
    Slice = 5,
    Bool = 6,
    UInt8 = 7,
    SInt8 = 8,
    UInt16 = 9,
    SInt16 = 10,
    UInt32 = 11,
    SInt32 = 12,
    UInt64 = 13,
    SInt64 = 14,
    Float32 = 15,
    Float64 = 16,
    Complex64 = 17,
    Complex128 = 18,
    Bytes8 = 19,
    Bytes16 = 20,
    BytesElided = 21,
}

impl FieldKind {
    /// Decodes a wire tag. Unknown tags are the caller's problem; the format
    /// is versioned, so they are treated as fatal at the decode site.
    pub fn from_tag(tag: u64) -> Option<FieldKind> {
        Some(match tag {
            0 => Self::Eol,
            1 => Self::Ptr,
            2 => Self::Iface,
            3 => Self::Eface,
            4 => Self::String,
            5 => Self::Slice,
            6 => Self::Bool,
            7 => Self::UInt8,
            8 => Self::SInt8,
            9 => Self::UInt16,
            10 => Self::SInt16,
            11 => Self::UInt32,
            12 => Self::SInt32,
            13 => Self::UInt64,
            14 => Self::SInt64,
            15 => Self::Float32,
            16 => Self::Float64,
            17 => Self::Complex64,
            18 => Self::Complex128,
            19 => Self::Bytes8,
            20 => Self::Bytes16,
            21 => Self::BytesElided,
            _ => return None,
        })
    }

    /// Number of bytes a slot of this kind occupies in memory.
    ///
    /// Used to give naming-pass interval entries an extent; pointer-bearing
    /// kinds scale with the target's pointer size.
    pub fn byte_size(self, ptr_size: u64) -> u64 {
        match self {
            Self::Eol => 0,
            Self::Ptr => ptr_size,
            Self::Iface | Self::Eface | Self::String => 2 * ptr_size,
            Self::Slice => 3 * ptr_size,
            Self::Bool | Self::UInt8 | Self::SInt8 => 1,
            Self::UInt16 | Self::SInt16 => 2,
            Self::UInt32 | Self::SInt32 | Self::Float32 => 4,
            Self::UInt64 | Self::SInt64 | Self::Float64 | Self::Complex64 => 8,
            Self::Complex128 => 16,
            Self::Bytes8 => 8,
            Self::Bytes16 => 16,
            Self::BytesElided => 0,
        }
    }

    /// True for kinds whose slot holds (or begins with) a heap pointer.
    pub fn is_pointer_bearing(self) -> bool {
        matches!(
            self,
            Self::Ptr | Self::Iface | Self::Eface | Self::String | Self::Slice
        )
    }
}

/// A location in an object, frame, or segment where there might be a
/// pointer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    /// What lives at this offset.
    pub kind: FieldKind,
    /// Offset within the containing entity, in bytes.
    pub offset: u64,
    /// Name of the field, once a naming pass has run.
    pub name: Option<String>,
    /// Base type for `Ptr`, `Slice`, `Iface` slots, when known.
    pub base_type: Option<String>,
}

impl Field {
    /// A nameless field, the shape produced by the decoder and the DWARF
    /// projections before naming.
    pub fn new(kind: FieldKind, offset: u64) -> Field {
        Field {
            kind,
            offset,
            name: None,
            base_type: None,
        }
    }
}

/// A directed connection between two objects. The source is implicit; the
/// edge records where it leaves the source and where it lands in the
/// destination.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Edge {
    /// Target object.
    pub to: ObjId,
    /// Offset in the source where the pointer was found.
    pub from_offset: u64,
    /// Offset in the destination where the pointer lands.
    pub to_offset: u64,
    /// Name of the field in the source object, if known.
    pub field_name: Option<String>,
}

/// A runtime type record from the dump (tag 3).
///
/// Names are not necessarily unique; the address is, and is the key of
/// `Dump::type_map`.
#[derive(Clone, Debug)]
pub struct RuntimeType {
    /// Address of the type descriptor in the inferior.
    pub addr: u64,
    /// Size of a value of this type, in bytes.
    pub size: u64,
    /// Name of the type.
    pub name: String,
    /// Whether an empty-interface payload of this type is stored as a
    /// pointer rather than inline.
    pub efaceptr: bool,
    /// Fields, in increasing offset order.
    pub fields: Vec<Field>,
}

/// A deduplicated description of an object shape, keyed by
/// `(size, gc_sig)` during decoding.
///
/// The garbage collector only distinguishes objects up to their pointer
/// layout, so many runtime types share one `FullType`. Type propagation
/// appends additional entries with DWARF-derived layouts and an empty
/// signature.
#[derive(Clone, Debug)]
pub struct FullType {
    /// Dense id; index of this entry in `Dump::full_types`.
    pub id: FullTypeId,
    /// Object size in bytes.
    pub size: u64,
    /// GC signature: one character per pointer-sized slot, over the
    /// alphabet `S` (scalar), `P` (pointer), `I`/`E` (interface halves).
    pub gc_sig: String,
    /// Synthesised or DWARF-derived name.
    pub name: String,
    /// Field layout. Filled by the naming pass or by type propagation.
    pub fields: Vec<Field>,
}

/// An object in the heap.
///
/// There will be a lot of these. They need to be small, so the payload
/// stays in the dump file and only its offset is recorded here.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HeapObject {
    pub(crate) addr: u64,
    pub(crate) ft: FullTypeId,
    /// Position of the object contents in the dump file.
    pub(crate) offset: u64,
}

/// A goroutine (tag 4).
#[derive(Clone, Debug)]
pub struct GoRoutine {
    /// Address of the goroutine descriptor.
    pub addr: u64,
    /// Frame at the bottom of the stack (depth 0, currently running).
    /// Resolved by the indexer; a goroutine without one is fatal.
    pub bos: Option<FrameId>,
    /// The goroutine's context object, if its address resolves to one.
    pub ctxt: Option<ObjId>,
    pub goid: u64,
    pub gopc: u64,
    pub status: u64,
    pub is_system: bool,
    pub is_background: bool,
    pub wait_since: u64,
    pub wait_reason: String,
    /// Address of the OS thread this goroutine is attached to, or 0.
    pub m_addr: u64,
    /// Head of the defer chain.
    pub defer_addr: u64,
    /// Head of the panic chain.
    pub panic_addr: u64,
    pub(crate) bos_addr: u64,
    pub(crate) ctxt_addr: u64,
}

/// A stack frame (tag 5). Frames are keyed by `(addr, depth)` because
/// zero-sized frames can share an address.
#[derive(Clone, Debug)]
pub struct StackFrame {
    /// Function name.
    pub name: String,
    /// The calling frame, one step toward the top of the stack.
    pub parent: Option<FrameId>,
    /// Index of the owning goroutine in `Dump::goroutines`.
    pub goroutine: Option<usize>,
    /// 0 is the bottom of the stack (the innermost, running frame).
    pub depth: u64,
    /// Raw frame contents.
    pub data: Vec<u8>,
    /// Edges out of this frame, filled by the edge linker.
    pub edges: Vec<Edge>,
    pub addr: u64,
    pub entry: u64,
    pub pc: u64,
    /// Live pointer slots, per the runtime's liveness maps.
    pub fields: Vec<Field>,
    pub(crate) child_addr: u64,
}

/// A data or bss segment (tags 12 and 13).
#[derive(Clone, Debug, Default)]
pub struct Segment {
    pub addr: u64,
    pub data: Vec<u8>,
    pub fields: Vec<Field>,
    pub edges: Vec<Edge>,
}

impl Segment {
    /// True if `addr` falls inside this segment.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.addr + self.data.len() as u64
    }
}

/// A miscellaneous root (tag 2): something the runtime considers reachable
/// that is not a global, stack, or finalizer.
#[derive(Clone, Debug)]
pub struct OtherRoot {
    pub description: String,
    pub to_addr: u64,
    pub edges: Vec<Edge>,
}

/// A pending finalizer (tag 7). The object is still live; no edges are
/// linked for these.
#[derive(Clone, Debug)]
pub struct Finalizer {
    pub obj: u64,
    /// The function to be run (a FuncVal*).
    pub fn_addr: u64,
    /// Code pointer (fn->fn).
    pub code: u64,
    /// Type of the function argument.
    pub fint: u64,
    /// Type of the object.
    pub ot: u64,
}

/// A finalizer that is ready to run (tag 11). These keep their targets
/// alive, so the edge linker records their references.
#[derive(Clone, Debug)]
pub struct QFinalizer {
    pub obj: u64,
    pub fn_addr: u64,
    pub code: u64,
    pub fint: u64,
    pub ot: u64,
    pub edges: Vec<Edge>,
}

/// A deferred call record (tag 14).
#[derive(Clone, Debug)]
pub struct Defer {
    pub addr: u64,
    pub gp: u64,
    pub argp: u64,
    pub pc: u64,
    pub fn_addr: u64,
    pub code: u64,
    pub link: u64,
}

/// An in-flight panic record (tag 15).
#[derive(Clone, Debug)]
pub struct Panic {
    pub addr: u64,
    pub gp: u64,
    pub typ: u64,
    pub data: u64,
    pub defer_addr: u64,
    pub link: u64,
}

/// An OS thread (tag 9).
#[derive(Clone, Debug)]
pub struct OSThread {
    pub addr: u64,
    pub id: u64,
    pub procid: u64,
}

/// One frame of a memory-profile allocation stack.
#[derive(Clone, Debug)]
pub struct MemProfFrame {
    pub func: String,
    pub file: String,
    pub line: u64,
}

/// An allocation-site record (tag 16).
#[derive(Clone, Debug)]
pub struct MemProfEntry {
    pub size: u64,
    pub stack: Vec<MemProfFrame>,
    pub allocs: u64,
    pub frees: u64,
}

/// A sampled allocation (tag 17), attributing one object to its
/// allocation site.
#[derive(Clone, Debug)]
pub struct AllocSample {
    /// Address of the object.
    pub addr: u64,
    /// The allocation site, resolved against records earlier in the
    /// stream. `None` if the stream referenced an unknown site.
    pub prof: Option<MemProfId>,
}

/// Runtime memory statistics (tag 10): 24 counters, the GC pause ring,
/// and the GC count.
#[derive(Clone, Debug)]
pub struct MemStats {
    pub alloc: u64,
    pub total_alloc: u64,
    pub sys: u64,
    pub lookups: u64,
    pub mallocs: u64,
    pub frees: u64,
    pub heap_alloc: u64,
    pub heap_sys: u64,
    pub heap_idle: u64,
    pub heap_inuse: u64,
    pub heap_released: u64,
    pub heap_objects: u64,
    pub stack_inuse: u64,
    pub stack_sys: u64,
    pub mspan_inuse: u64,
    pub mspan_sys: u64,
    pub mcache_inuse: u64,
    pub mcache_sys: u64,
    pub buck_hash_sys: u64,
    pub gc_sys: u64,
    pub other_sys: u64,
    pub next_gc: u64,
    pub last_gc: u64,
    pub pause_total_ns: u64,
    /// Circular buffer of recent GC pause durations.
    pub pause_ns: Box<[u64; 256]>,
    pub num_gc: u32,
}

/// Map from a type descriptor address to its runtime type record.
pub type TypeMap = BTreeMap<u64, RuntimeType>;

/// Map from an itab address to the type-descriptor address it represents.
/// A value of 0 means the interface holds non-pointer data inline.
pub type ItabMap = BTreeMap<u64, u64>;
