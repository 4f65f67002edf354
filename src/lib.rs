//! Reconstructs the object graph of a Go heap dump into a queryable, typed
//! form.
//!
//! [`read`] decodes a `go1.4 heap dump` file, indexes the heap for fast
//! address lookup, and -- when the originating executable is supplied -- runs
//! a worklist type propagation that attaches DWARF-derived layouts to heap
//! objects and DWARF names to fields, frame slots, and globals. The result
//! is a [`Dump`]: an aggregate owning every decoded entity, intended as the
//! substrate for leak finders, retention browsers, and bloat reports.

pub mod model;

mod decode;
mod dwarf;
mod name;
mod propagate;

pub use self::model::*;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read as _, Seek, SeekFrom};
use std::path::Path;

use gimli::Endianity;
use thiserror::Error as ThisError;
use tracing::warn;

/// Size of the heap buckets used by [`Dump::find_obj`]. Bigger buckets use
/// less memory but lengthen the per-lookup scan; 512 bytes keeps the index
/// around 1.5% of the heap and bounds a lookup at 64 pointer-aligned
/// objects.
const BUCKET_SIZE: u64 = 512;

/// Everything that can go structurally wrong while reading a dump.
///
/// Non-structural anomalies (layout disagreements, dangling pointers seen
/// during propagation) are reported as `tracing` diagnostics instead and do
/// not abort the read.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not a go1.4 heap dump file")]
    BadHeader,
    #[error("heap dump is truncated")]
    Truncated,
    #[error("unknown record tag {0}")]
    UnknownTag(u64),
    #[error("unsupported pointer size {0}")]
    UnsupportedPointerSize(u64),
    #[error("goroutine {goid} has no bottom-of-stack frame at {bos_addr:#x}")]
    MissingBos { goid: u64, bos_addr: u64 },
    #[error("no itab record for address {0:#x}")]
    MissingItab(u64),
    #[error("no type record for address {0:#x}")]
    MissingType(u64),
    #[error(
        "type {name} ({type_size} bytes) does not fit the object at {addr:#x} ({obj_size} bytes)"
    )]
    TypeDoesNotFit {
        addr: u64,
        name: String,
        type_size: u64,
        obj_size: u64,
    },
    #[error("unsupported DWARF location expression")]
    BadDwarfLocation,
    #[error("unsupported DWARF base type: encoding {encoding:?}, size {size}")]
    UnsupportedBaseType { encoding: gimli::DwAte, size: u64 },
    #[error("DWARF type reference for {0:?} did not resolve")]
    UnresolvedTypeRef(String),
    #[error("i/o error reading dump")]
    Io(#[from] std::io::Error),
    #[error("executable could not be parsed")]
    Object(#[from] object::Error),
    #[error("DWARF data could not be parsed")]
    Dwarf(#[from] gimli::Error),
}

/// A decoded heap dump.
///
/// The dump owns every entity vector; cross-entity references are dense
/// indices (`ObjId`, `FullTypeId`, `FrameId`) into those vectors. It also
/// keeps the dump file open: object payloads stay on disk and are re-read
/// on demand by [`Dump::contents`] and [`Dump::edges`] through a shared
/// scratch buffer, which is why both take `&mut self`. Clone the returned
/// slices if you need them to outlive the next call.
pub struct Dump {
    /// Byte order of the dumped process.
    pub endian: gimli::RunTimeEndian,
    /// Pointer size in bytes; 4 or 8.
    pub ptr_size: u64,
    /// Size of a channel header, derived from the pointer size.
    pub hchan_size: u64,
    /// Heap bounds: `[heap_start, heap_end)`.
    pub heap_start: u64,
    pub heap_end: u64,
    /// Toolchain architecture character.
    pub the_char: u8,
    /// Value of GOEXPERIMENT at build time.
    pub experiment: String,
    pub ncpu: u64,
    /// Runtime type records by descriptor address.
    pub type_map: TypeMap,
    /// Interface dispatch tables: itab address to type address.
    pub itab_map: ItabMap,
    /// Deduplicated object shapes; `FullTypeId` indexes this.
    pub full_types: Vec<FullType>,
    pub goroutines: Vec<GoRoutine>,
    pub frames: Vec<StackFrame>,
    pub otherroots: Vec<OtherRoot>,
    /// Pending finalizers; their objects are still live.
    pub finalizers: Vec<Finalizer>,
    /// Finalizers queued to run; these root their targets.
    pub qfinalizers: Vec<QFinalizer>,
    pub osthreads: Vec<OSThread>,
    pub memstats: Option<MemStats>,
    pub data: Option<Segment>,
    pub bss: Option<Segment>,
    pub defers: Vec<Defer>,
    pub panics: Vec<Panic>,
    pub memprof: Vec<MemProfEntry>,
    pub alloc_samples: Vec<AllocSample>,

    pub(crate) objects: Vec<HeapObject>,
    /// Bucket index for `find_obj`: for each `BUCKET_SIZE` window of the
    /// heap, the lowest-index object whose extent intersects it.
    pub(crate) idx: Vec<usize>,
    /// Handle to the dump file, for lazy payload reads.
    pub(crate) file: File,
    /// Scratch for `contents`.
    pub(crate) buf: Vec<u8>,
    /// Scratch for `edges`.
    pub(crate) edge_buf: Vec<Edge>,
}

/// Reads a heap dump, optionally using the originating executable's DWARF
/// info to type heap objects and name fields.
///
/// Passes run in a fixed order: decode, index, (propagate + DWARF naming |
/// fallback naming), FullType field synthesis, edge linking. The returned
/// dump is fully populated and, apart from its scratch buffers, read-only.
pub fn read(dump_path: &Path, exec_path: Option<&Path>) -> Result<Dump, Error> {
    let mut d = decode::read_dump(dump_path)?;
    d.index_objects();
    d.link_frames()?;
    if let Some(exec) = exec_path {
        let info = dwarf::load_executable(exec, d.endian, d.ptr_size)?;
        propagate::run(&mut d, &info)?;
        name::name_with_dwarf(&mut d, &info)?;
    } else {
        name::name_fallback(&mut d);
    }
    name::name_full_types(&mut d);
    d.link_edges()?;
    Ok(d)
}

impl Dump {
    /// Number of objects in the heap. Valid `ObjId`s for the other calls
    /// run from 0 to `num_objects() - 1`.
    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    /// Address of an object.
    pub fn addr(&self, i: ObjId) -> u64 {
        self.objects[i.0].addr
    }

    /// Size of an object in bytes.
    pub fn size(&self, i: ObjId) -> u64 {
        self.full_types[self.objects[i.0].ft.0].size
    }

    /// The object's deduplicated shape.
    pub fn full_type(&self, i: ObjId) -> &FullType {
        &self.full_types[self.objects[i.0].ft.0]
    }

    /// The object's raw contents, re-read from the dump file into a shared
    /// scratch buffer. The returned slice is valid until the next call.
    pub fn contents(&mut self, i: ObjId) -> Result<&[u8], Error> {
        let obj = self.objects[i.0];
        let size = self.full_types[obj.ft.0].size;
        self.read_at(obj.offset, size)?;
        Ok(&self.buf)
    }

    /// Finds the object containing `addr`.
    ///
    /// Constant-time via the bucket index: scan forward from the first
    /// object intersecting the address's bucket, stopping as soon as an
    /// object starts past `addr`.
    pub fn find_obj(&self, addr: u64) -> Option<ObjId> {
        if addr < self.heap_start || addr >= self.heap_end {
            // Quick exit; includes nil pointers.
            return None;
        }
        let bucket = ((addr - self.heap_start) / BUCKET_SIZE) as usize;
        let start = self.idx.get(bucket).copied().unwrap_or(self.objects.len());
        for i in start..self.objects.len() {
            let x = &self.objects[i];
            if addr < x.addr {
                return None;
            }
            if addr < x.addr + self.full_types[x.ft.0].size {
                return Some(ObjId(i));
            }
        }
        None
    }

    /// Edges leaving an object, resolved against its current `FullType`
    /// layout. Uses shared scratch buffers; the slice is valid until the
    /// next `contents` or `edges` call.
    pub fn edges(&mut self, i: ObjId) -> Result<&[Edge], Error> {
        let obj = self.objects[i.0];
        let size = self.full_types[obj.ft.0].size;
        self.read_at(obj.offset, size)?;
        let data = std::mem::take(&mut self.buf);
        let mut edges = std::mem::take(&mut self.edge_buf);
        edges.clear();
        let result = self.append_field_edges(
            &data,
            &self.full_types[obj.ft.0].fields,
            &mut edges,
        );
        self.buf = data;
        self.edge_buf = edges;
        result?;
        Ok(&self.edge_buf)
    }

    fn read_at(&mut self, offset: u64, size: u64) -> Result<(), Error> {
        self.buf.resize(size as usize, 0);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut self.buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Truncated
            } else {
                Error::Io(e)
            }
        })
    }

    /// Reads a pointer-sized word out of `data`, or `None` if the slot
    /// runs past the end.
    pub(crate) fn word_at(&self, data: &[u8], offset: u64) -> Option<u64> {
        read_word(self.endian, self.ptr_size, data, offset)
    }

    /// Walks a field list over `data` and appends an edge for every
    /// pointer-like slot that lands in an object.
    ///
    /// Interface slots resolve their type word first: a zero itab or type
    /// descriptor is a nil interface and yields nothing; a type whose
    /// empty-interface payload is inline yields nothing for the payload.
    pub(crate) fn append_field_edges(
        &self,
        data: &[u8],
        fields: &[Field],
        out: &mut Vec<Edge>,
    ) -> Result<(), Error> {
        for f in fields {
            if f.offset >= data.len() as u64 {
                continue;
            }
            match f.kind {
                FieldKind::Ptr | FieldKind::String | FieldKind::Slice => {
                    self.append_edge(data, f.offset, f, out);
                }
                FieldKind::Eface => {
                    let Some(taddr) = self.word_at(data, f.offset) else {
                        continue;
                    };
                    if taddr == 0 {
                        continue; // nil eface
                    }
                    let t = self
                        .type_map
                        .get(&taddr)
                        .ok_or(Error::MissingType(taddr))?;
                    if t.efaceptr {
                        self.append_edge(data, f.offset + self.ptr_size, f, out);
                    }
                }
                FieldKind::Iface => {
                    let Some(itab) = self.word_at(data, f.offset) else {
                        continue;
                    };
                    if itab == 0 {
                        continue; // nil iface
                    }
                    let &taddr = self
                        .itab_map
                        .get(&itab)
                        .ok_or(Error::MissingItab(itab))?;
                    if taddr == 0 {
                        continue; // non-pointer data field
                    }
                    let t = self
                        .type_map
                        .get(&taddr)
                        .ok_or(Error::MissingType(taddr))?;
                    if t.efaceptr {
                        self.append_edge(data, f.offset + self.ptr_size, f, out);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Appends an edge if the pointer at `data[offset..]` hits an object.
    fn append_edge(
        &self,
        data: &[u8],
        offset: u64,
        f: &Field,
        out: &mut Vec<Edge>,
    ) {
        let Some(p) = self.word_at(data, offset) else {
            return;
        };
        if let Some(q) = self.find_obj(p) {
            out.push(Edge {
                to: q,
                from_offset: offset,
                to_offset: p - self.objects[q.0].addr,
                field_name: f.name.clone(),
            });
        }
    }

    /// Sorts the object table by address and builds the bucket index.
    ///
    /// Buckets are filled in reverse object order so the lowest-index
    /// object intersecting a bucket wins.
    pub(crate) fn index_objects(&mut self) {
        self.objects.sort_by_key(|o| o.addr);
        let span = self.heap_end.saturating_sub(self.heap_start);
        let nbuckets = span.div_ceil(BUCKET_SIZE) as usize;
        self.idx = vec![self.objects.len(); nbuckets];
        for i in (0..self.objects.len()).rev() {
            let addr = self.objects[i].addr;
            let size = self.full_types[self.objects[i].ft.0].size;
            if addr < self.heap_start || addr + size.max(1) > self.heap_end {
                warn!(addr, size, "object lies outside the declared heap");
                continue;
            }
            let lo = (addr - self.heap_start) / BUCKET_SIZE;
            let hi = (addr + size.max(1) - 1 - self.heap_start) / BUCKET_SIZE;
            for j in lo..=hi {
                self.idx[j as usize] = i;
            }
        }
    }

    /// Links frames into per-goroutine chains.
    ///
    /// Frames are keyed `(addr, depth)`; a frame's parent is the frame
    /// that recorded it as its child one level down. Each goroutine gets
    /// its bottom-of-stack frame, every frame on the chain gets a
    /// back-reference, and the goroutine's context object is resolved.
    pub(crate) fn link_frames(&mut self) -> Result<(), Error> {
        let mut by_key: BTreeMap<(u64, u64), FrameId> = BTreeMap::new();
        for (i, f) in self.frames.iter().enumerate() {
            by_key.insert((f.addr, f.depth), FrameId(i));
        }
        for i in 0..self.frames.len() {
            let f = &self.frames[i];
            if f.depth == 0 {
                continue;
            }
            if let Some(&child) = by_key.get(&(f.child_addr, f.depth - 1)) {
                self.frames[child.0].parent = Some(FrameId(i));
            }
        }
        for gi in 0..self.goroutines.len() {
            let (goid, bos_addr, ctxt_addr) = {
                let g = &self.goroutines[gi];
                (g.goid, g.bos_addr, g.ctxt_addr)
            };
            let Some(&bos) = by_key.get(&(bos_addr, 0)) else {
                return Err(Error::MissingBos { goid, bos_addr });
            };
            self.goroutines[gi].bos = Some(bos);
            let mut cur = Some(bos);
            while let Some(fid) = cur {
                self.frames[fid.0].goroutine = Some(gi);
                cur = self.frames[fid.0].parent;
            }
            self.goroutines[gi].ctxt = self.find_obj(ctxt_addr);
        }
        Ok(())
    }

    /// Materialises edges for every non-heap root: frames, data and bss
    /// segments, other roots, and queued finalizers. Heap-to-heap edges
    /// stay lazy in [`Dump::edges`].
    pub(crate) fn link_edges(&mut self) -> Result<(), Error> {
        for i in 0..self.frames.len() {
            let mut edges = Vec::new();
            let f = &self.frames[i];
            self.append_field_edges(&f.data, &f.fields, &mut edges)?;
            self.frames[i].edges = edges;
        }
        if let Some(mut seg) = self.data.take() {
            let mut edges = Vec::new();
            self.append_field_edges(&seg.data, &seg.fields, &mut edges)?;
            seg.edges = edges;
            self.data = Some(seg);
        }
        if let Some(mut seg) = self.bss.take() {
            let mut edges = Vec::new();
            self.append_field_edges(&seg.data, &seg.fields, &mut edges)?;
            seg.edges = edges;
            self.bss = Some(seg);
        }
        for i in 0..self.otherroots.len() {
            let to_addr = self.otherroots[i].to_addr;
            if let Some(x) = self.find_obj(to_addr) {
                let edge = Edge {
                    to: x,
                    from_offset: 0,
                    to_offset: to_addr - self.objects[x.0].addr,
                    field_name: None,
                };
                self.otherroots[i].edges.push(edge);
            }
        }
        for i in 0..self.qfinalizers.len() {
            let addrs = {
                let q = &self.qfinalizers[i];
                [q.obj, q.fn_addr, q.fint, q.ot]
            };
            for a in addrs {
                if let Some(x) = self.find_obj(a) {
                    let edge = Edge {
                        to: x,
                        from_offset: 0,
                        to_offset: a - self.objects[x.0].addr,
                        field_name: None,
                    };
                    self.qfinalizers[i].edges.push(edge);
                }
            }
        }
        Ok(())
    }
}

/// Reads a pointer-sized word at `offset` in `data`, honoring the dump's
/// byte order. `None` if the slot runs past the end of `data`.
pub(crate) fn read_word(
    endian: gimli::RunTimeEndian,
    ptr_size: u64,
    data: &[u8],
    offset: u64,
) -> Option<u64> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(ptr_size as usize)?;
    let bytes = data.get(start..end)?;
    Some(match ptr_size {
        4 => u64::from(endian.read_u32(bytes)),
        8 => endian.read_u64(bytes),
        _ => unreachable!("pointer size validated during decode"),
    })
}
