//! Tagged-record decoder for the heap dump stream.
//!
//! The dump is a single header line followed by varint-tagged records until
//! an EOF tag. Object payloads are not held in memory; the decoder records
//! their file offsets and the dump keeps the file handle for later reads.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use indexmap::IndexMap;
use tracing::warn;

use crate::model::*;
use crate::{Dump, Error};

/// First line of every dump this crate understands.
const DUMP_HEADER: &[u8] = b"go1.4 heap dump";

const TAG_EOF: u64 = 0;
const TAG_OBJECT: u64 = 1;
const TAG_OTHER_ROOT: u64 = 2;
const TAG_TYPE: u64 = 3;
const TAG_GOROUTINE: u64 = 4;
const TAG_STACK_FRAME: u64 = 5;
const TAG_PARAMS: u64 = 6;
const TAG_FINALIZER: u64 = 7;
const TAG_ITAB: u64 = 8;
const TAG_OS_THREAD: u64 = 9;
const TAG_MEM_STATS: u64 = 10;
const TAG_QFINAL: u64 = 11;
const TAG_DATA: u64 = 12;
const TAG_BSS: u64 = 13;
const TAG_DEFER: u64 = 14;
const TAG_PANIC: u64 = 15;
const TAG_MEM_PROF: u64 = 16;
const TAG_ALLOC_SAMPLE: u64 = 17;

/// A buffered reader that knows its absolute position in the file, so
/// object records can capture the offset of their payload before it is
/// skipped.
struct RecordReader<R> {
    inner: R,
    pos: u64,
}

impl<R: BufRead> RecordReader<R> {
    fn new(inner: R) -> RecordReader<R> {
        RecordReader { inner, pos: 0 }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn into_inner(self) -> R {
        self.inner
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b).map_err(truncated)?;
        self.pos += 1;
        Ok(b[0])
    }

    /// Unsigned LEB128, the integer encoding used for every numeric field.
    fn read_uvarint(&mut self) -> Result<u64, Error> {
        let mut x = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.read_byte()?;
            if shift >= 64 {
                return Err(Error::Truncated);
            }
            x |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(x);
            }
            shift += 7;
        }
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, Error> {
        let n = self.read_uvarint()?;
        let mut buf = vec![0u8; n as usize];
        self.inner.read_exact(&mut buf).map_err(truncated)?;
        self.pos += n;
        Ok(buf)
    }

    fn read_string(&mut self) -> Result<String, Error> {
        // Names in the dump are not guaranteed to be UTF-8.
        Ok(String::from_utf8_lossy(&self.read_bytes()?).into_owned())
    }

    fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_byte()? != 0)
    }

    fn skip(&mut self, n: u64) -> Result<(), Error> {
        let copied =
            io::copy(&mut self.inner.by_ref().take(n), &mut io::sink())?;
        self.pos += copied;
        if copied != n {
            return Err(Error::Truncated);
        }
        Ok(())
    }

    /// Reads the ASCII header line, without its terminating newline.
    fn read_header_line(&mut self) -> Result<Vec<u8>, Error> {
        let mut line = Vec::new();
        let n = self.inner.read_until(b'\n', &mut line)?;
        self.pos += n as u64;
        if line.pop() != Some(b'\n') {
            return Err(Error::BadHeader);
        }
        Ok(line)
    }

    /// A field-descriptor list: `(kind, offset)` pairs until an EOL kind.
    fn read_fields(&mut self) -> Result<Vec<Field>, Error> {
        let mut fields = Vec::new();
        loop {
            let tag = self.read_uvarint()?;
            let kind = FieldKind::from_tag(tag).ok_or(Error::UnknownTag(tag))?;
            if kind == FieldKind::Eol {
                return Ok(fields);
            }
            fields.push(Field::new(kind, self.read_uvarint()?));
        }
    }
}

fn truncated(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::Truncated
    } else {
        Error::Io(e)
    }
}

/// Reads a dump file into a `Dump`, leaving object payloads on disk.
///
/// This is a single sequential pass; indexing and linking happen later.
pub(crate) fn read_dump(path: &Path) -> Result<Dump, Error> {
    let file = File::open(path)?;
    let mut r = RecordReader::new(BufReader::new(file));

    if r.read_header_line()? != DUMP_HEADER {
        return Err(Error::BadHeader);
    }

    let mut endian = gimli::RunTimeEndian::Little;
    let mut ptr_size = 0u64;
    let mut hchan_size = 0u64;
    let mut heap_start = 0u64;
    let mut heap_end = 0u64;
    let mut the_char = 0u8;
    let mut experiment = String::new();
    let mut ncpu = 0u64;

    let mut objects: Vec<HeapObject> = Vec::new();
    let mut full_types: Vec<FullType> = Vec::new();
    // FullType interning: insertion order doubles as dense id assignment.
    let mut ftmap: IndexMap<(u64, String), FullTypeId> = IndexMap::new();
    let mut type_map = TypeMap::new();
    let mut itab_map = ItabMap::new();
    let mut goroutines = Vec::new();
    let mut frames = Vec::new();
    let mut otherroots = Vec::new();
    let mut finalizers = Vec::new();
    let mut qfinalizers = Vec::new();
    let mut osthreads = Vec::new();
    let mut memstats = None;
    let mut data: Option<Segment> = None;
    let mut bss: Option<Segment> = None;
    let mut defers = Vec::new();
    let mut panics = Vec::new();
    let mut memprof: Vec<MemProfEntry> = Vec::new();
    let mut memprof_keys: BTreeMap<u64, MemProfId> = BTreeMap::new();
    let mut alloc_samples = Vec::new();

    let mut sig = String::new();

    loop {
        let tag = r.read_uvarint()?;
        match tag {
            TAG_EOF => break,
            TAG_OBJECT => {
                let addr = r.read_uvarint()?;
                let size = r.read_uvarint()?;
                let offset = r.position();
                r.skip(size)?;
                if ptr_size == 0 {
                    // An object record before the params record leaves the
                    // pointer size unknown.
                    return Err(Error::UnsupportedPointerSize(0));
                }
                read_gc_signature(&mut r, ptr_size, &mut sig)?;
                let key = (size, sig.clone());
                let ft = match ftmap.get(&key) {
                    Some(&id) => id,
                    None => {
                        let id = FullTypeId(full_types.len());
                        full_types.push(FullType {
                            id,
                            size,
                            gc_sig: sig.clone(),
                            name: format!("{size}_{sig}"),
                            fields: Vec::new(),
                        });
                        ftmap.insert(key, id);
                        id
                    }
                };
                objects.push(HeapObject { addr, ft, offset });
            }
            TAG_OTHER_ROOT => {
                otherroots.push(OtherRoot {
                    description: r.read_string()?,
                    to_addr: r.read_uvarint()?,
                    edges: Vec::new(),
                });
            }
            TAG_TYPE => {
                let typ = RuntimeType {
                    addr: r.read_uvarint()?,
                    size: r.read_uvarint()?,
                    name: r.read_string()?,
                    efaceptr: r.read_bool()?,
                    fields: Vec::new(),
                };
                // Dumps may contain duplicate type records; the first wins.
                type_map.entry(typ.addr).or_insert(typ);
            }
            TAG_GOROUTINE => {
                goroutines.push(GoRoutine {
                    addr: r.read_uvarint()?,
                    bos_addr: r.read_uvarint()?,
                    goid: r.read_uvarint()?,
                    gopc: r.read_uvarint()?,
                    status: r.read_uvarint()?,
                    is_system: r.read_bool()?,
                    is_background: r.read_bool()?,
                    wait_since: r.read_uvarint()?,
                    wait_reason: r.read_string()?,
                    ctxt_addr: r.read_uvarint()?,
                    m_addr: r.read_uvarint()?,
                    defer_addr: r.read_uvarint()?,
                    panic_addr: r.read_uvarint()?,
                    bos: None,
                    ctxt: None,
                });
            }
            TAG_STACK_FRAME => {
                let addr = r.read_uvarint()?;
                let depth = r.read_uvarint()?;
                let child_addr = r.read_uvarint()?;
                let data = r.read_bytes()?;
                let entry = r.read_uvarint()?;
                let pc = r.read_uvarint()?;
                let _continpc = r.read_uvarint()?;
                let name = r.read_string()?;
                let fields = r.read_fields()?;
                frames.push(StackFrame {
                    name,
                    parent: None,
                    goroutine: None,
                    depth,
                    data,
                    edges: Vec::new(),
                    addr,
                    entry,
                    pc,
                    fields,
                    child_addr,
                });
            }
            TAG_PARAMS => {
                endian = if r.read_uvarint()? == 0 {
                    gimli::RunTimeEndian::Little
                } else {
                    gimli::RunTimeEndian::Big
                };
                ptr_size = r.read_uvarint()?;
                heap_start = r.read_uvarint()?;
                heap_end = r.read_uvarint()?;
                the_char = r.read_uvarint()? as u8;
                experiment = r.read_string()?;
                ncpu = r.read_uvarint()?;
                hchan_size = match ptr_size {
                    4 => 28,
                    8 => 48,
                    n => return Err(Error::UnsupportedPointerSize(n)),
                };
            }
            TAG_FINALIZER => {
                finalizers.push(Finalizer {
                    obj: r.read_uvarint()?,
                    fn_addr: r.read_uvarint()?,
                    code: r.read_uvarint()?,
                    fint: r.read_uvarint()?,
                    ot: r.read_uvarint()?,
                });
            }
            TAG_QFINAL => {
                qfinalizers.push(QFinalizer {
                    obj: r.read_uvarint()?,
                    fn_addr: r.read_uvarint()?,
                    code: r.read_uvarint()?,
                    fint: r.read_uvarint()?,
                    ot: r.read_uvarint()?,
                    edges: Vec::new(),
                });
            }
            TAG_ITAB => {
                let addr = r.read_uvarint()?;
                let type_addr = r.read_uvarint()?;
                itab_map.insert(addr, type_addr);
            }
            TAG_OS_THREAD => {
                osthreads.push(OSThread {
                    addr: r.read_uvarint()?,
                    id: r.read_uvarint()?,
                    procid: r.read_uvarint()?,
                });
            }
            TAG_MEM_STATS => {
                memstats = Some(read_mem_stats(&mut r)?);
            }
            TAG_DATA => {
                data = Some(read_segment(&mut r)?);
            }
            TAG_BSS => {
                bss = Some(read_segment(&mut r)?);
            }
            TAG_DEFER => {
                defers.push(Defer {
                    addr: r.read_uvarint()?,
                    gp: r.read_uvarint()?,
                    argp: r.read_uvarint()?,
                    pc: r.read_uvarint()?,
                    fn_addr: r.read_uvarint()?,
                    code: r.read_uvarint()?,
                    link: r.read_uvarint()?,
                });
            }
            TAG_PANIC => {
                panics.push(Panic {
                    addr: r.read_uvarint()?,
                    gp: r.read_uvarint()?,
                    typ: r.read_uvarint()?,
                    data: r.read_uvarint()?,
                    defer_addr: r.read_uvarint()?,
                    link: r.read_uvarint()?,
                });
            }
            TAG_MEM_PROF => {
                let key = r.read_uvarint()?;
                let size = r.read_uvarint()?;
                let nstk = r.read_uvarint()?;
                let mut stack = Vec::with_capacity(nstk as usize);
                for _ in 0..nstk {
                    stack.push(MemProfFrame {
                        func: r.read_string()?,
                        file: r.read_string()?,
                        line: r.read_uvarint()?,
                    });
                }
                let allocs = r.read_uvarint()?;
                let frees = r.read_uvarint()?;
                memprof_keys.insert(key, MemProfId(memprof.len()));
                memprof.push(MemProfEntry {
                    size,
                    stack,
                    allocs,
                    frees,
                });
            }
            TAG_ALLOC_SAMPLE => {
                let addr = r.read_uvarint()?;
                let key = r.read_uvarint()?;
                let prof = memprof_keys.get(&key).copied();
                if prof.is_none() {
                    warn!(key, "allocation sample references unknown profile record");
                }
                alloc_samples.push(AllocSample { addr, prof });
            }
            _ => return Err(Error::UnknownTag(tag)),
        }
    }

    let file = r.into_inner().into_inner();
    Ok(Dump {
        endian,
        ptr_size,
        hchan_size,
        heap_start,
        heap_end,
        the_char,
        experiment,
        ncpu,
        type_map,
        itab_map,
        full_types,
        goroutines,
        frames,
        otherroots,
        finalizers,
        qfinalizers,
        osthreads,
        memstats,
        data,
        bss,
        defers,
        panics,
        memprof,
        alloc_samples,
        objects,
        idx: Vec::new(),
        file,
        buf: Vec::new(),
        edge_buf: Vec::new(),
    })
}

/// Consumes an object's GC field descriptor and synthesises its signature:
/// one character per pointer-sized slot, `P` for pointers, `II`/`EE` for
/// interface pairs, with `S` padding for the gaps between fields.
fn read_gc_signature<R: BufRead>(
    r: &mut RecordReader<R>,
    ptr_size: u64,
    sig: &mut String,
) -> Result<(), Error> {
    sig.clear();
    let mut offset = 0u64;
    loop {
        let tag = r.read_uvarint()?;
        match FieldKind::from_tag(tag) {
            Some(FieldKind::Eol) => return Ok(()),
            Some(FieldKind::Ptr) => {
                let off = r.read_uvarint()?;
                while offset < off {
                    sig.push('S');
                    offset += ptr_size;
                }
                sig.push('P');
                offset += ptr_size;
            }
            Some(FieldKind::Iface) => {
                let off = r.read_uvarint()?;
                while offset < off {
                    sig.push('S');
                    offset += ptr_size;
                }
                sig.push_str("II");
                offset += 2 * ptr_size;
            }
            Some(FieldKind::Eface) => {
                let off = r.read_uvarint()?;
                while offset < off {
                    sig.push('S');
                    offset += ptr_size;
                }
                sig.push_str("EE");
                offset += 2 * ptr_size;
            }
            _ => return Err(Error::UnknownTag(tag)),
        }
    }
}

fn read_segment<R: BufRead>(r: &mut RecordReader<R>) -> Result<Segment, Error> {
    Ok(Segment {
        addr: r.read_uvarint()?,
        data: r.read_bytes()?,
        fields: r.read_fields()?,
        edges: Vec::new(),
    })
}

fn read_mem_stats<R: BufRead>(r: &mut RecordReader<R>) -> Result<MemStats, Error> {
    let mut stats = MemStats {
        alloc: r.read_uvarint()?,
        total_alloc: r.read_uvarint()?,
        sys: r.read_uvarint()?,
        lookups: r.read_uvarint()?,
        mallocs: r.read_uvarint()?,
        frees: r.read_uvarint()?,
        heap_alloc: r.read_uvarint()?,
        heap_sys: r.read_uvarint()?,
        heap_idle: r.read_uvarint()?,
        heap_inuse: r.read_uvarint()?,
        heap_released: r.read_uvarint()?,
        heap_objects: r.read_uvarint()?,
        stack_inuse: r.read_uvarint()?,
        stack_sys: r.read_uvarint()?,
        mspan_inuse: r.read_uvarint()?,
        mspan_sys: r.read_uvarint()?,
        mcache_inuse: r.read_uvarint()?,
        mcache_sys: r.read_uvarint()?,
        buck_hash_sys: r.read_uvarint()?,
        gc_sys: r.read_uvarint()?,
        other_sys: r.read_uvarint()?,
        next_gc: r.read_uvarint()?,
        last_gc: r.read_uvarint()?,
        pause_total_ns: r.read_uvarint()?,
        pause_ns: Box::new([0u64; 256]),
        num_gc: 0,
    };
    for pause in stats.pause_ns.iter_mut() {
        *pause = r.read_uvarint()?;
    }
    stats.num_gc = r.read_uvarint()? as u32;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn uvarint(out: &mut Vec<u8>, mut v: u64) {
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            out.push(b);
            if v == 0 {
                return;
            }
        }
    }

    fn reader(bytes: &[u8]) -> RecordReader<BufReader<&[u8]>> {
        RecordReader::new(BufReader::new(bytes))
    }

    #[test]
    fn uvarint_roundtrip() {
        let mut buf = Vec::new();
        for v in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            buf.clear();
            uvarint(&mut buf, v);
            assert_eq!(reader(&buf).read_uvarint().unwrap(), v);
        }
    }

    #[test]
    fn uvarint_eof_is_truncated() {
        let buf = [0x80u8];
        assert!(matches!(
            reader(&buf).read_uvarint(),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn position_tracks_all_reads() {
        let mut buf = Vec::new();
        uvarint(&mut buf, 300);
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let mut r = reader(&buf);
        r.read_uvarint().unwrap();
        assert_eq!(r.position(), 2);
        r.skip(3).unwrap();
        assert_eq!(r.position(), 5);
    }

    #[test]
    fn gc_signature_pads_gaps_with_scalars() {
        // P at offset 16 with 8-byte pointers: two scalar slots first.
        let mut buf = Vec::new();
        uvarint(&mut buf, FieldKind::Ptr as u64);
        uvarint(&mut buf, 16);
        uvarint(&mut buf, FieldKind::Eol as u64);
        let mut sig = String::new();
        read_gc_signature(&mut reader(&buf), 8, &mut sig).unwrap();
        assert_eq!(sig, "SSP");
    }

    #[test]
    fn gc_signature_interfaces_cover_two_slots() {
        let mut buf = Vec::new();
        uvarint(&mut buf, FieldKind::Iface as u64);
        uvarint(&mut buf, 0);
        uvarint(&mut buf, FieldKind::Eface as u64);
        uvarint(&mut buf, 16);
        uvarint(&mut buf, FieldKind::Eol as u64);
        let mut sig = String::new();
        read_gc_signature(&mut reader(&buf), 8, &mut sig).unwrap();
        assert_eq!(sig, "IIEE");
    }

    #[test]
    fn header_must_match() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"go1.3 heap dump\n").unwrap();
        assert!(matches!(read_dump(f.path()), Err(Error::BadHeader)));
    }

    #[test]
    fn field_list_rejects_unknown_kinds() {
        let mut buf = Vec::new();
        uvarint(&mut buf, 99);
        assert!(matches!(
            reader(&buf).read_fields(),
            Err(Error::UnknownTag(99))
        ));
    }
}
