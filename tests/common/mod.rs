//! Shared helper for synthesising heap dump files on disk.
#![allow(dead_code)] // each test binary uses a subset of the writers

use std::io::Write;

use tempfile::NamedTempFile;

/// Builds a dump byte stream record by record. Integer fields are LEB128;
/// the header line is written up front.
pub struct DumpWriter {
    pub buf: Vec<u8>,
}

impl DumpWriter {
    pub fn new() -> DumpWriter {
        DumpWriter {
            buf: b"go1.4 heap dump\n".to_vec(),
        }
    }

    pub fn uvarint(&mut self, mut v: u64) {
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            self.buf.push(b);
            if v == 0 {
                return;
            }
        }
    }

    pub fn string(&mut self, s: &str) {
        self.uvarint(s.len() as u64);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn bytes(&mut self, b: &[u8]) {
        self.uvarint(b.len() as u64);
        self.buf.extend_from_slice(b);
    }

    pub fn fields(&mut self, fields: &[(u64, u64)]) {
        for &(kind, off) in fields {
            self.uvarint(kind);
            self.uvarint(off);
        }
        self.uvarint(0);
    }

    /// Little-endian, 8-byte pointers.
    pub fn params(&mut self, heap_start: u64, heap_end: u64) {
        self.uvarint(6);
        self.uvarint(0);
        self.uvarint(8);
        self.uvarint(heap_start);
        self.uvarint(heap_end);
        self.uvarint(b'6' as u64);
        self.string("");
        self.uvarint(2);
    }

    pub fn object(&mut self, addr: u64, payload: &[u8], fields: &[(u64, u64)]) {
        self.uvarint(1);
        self.uvarint(addr);
        self.bytes(payload);
        self.fields(fields);
    }

    pub fn type_record(&mut self, addr: u64, size: u64, name: &str, efaceptr: bool) {
        self.uvarint(3);
        self.uvarint(addr);
        self.uvarint(size);
        self.string(name);
        self.buf.push(efaceptr as u8);
    }

    pub fn itab(&mut self, addr: u64, type_addr: u64) {
        self.uvarint(8);
        self.uvarint(addr);
        self.uvarint(type_addr);
    }

    pub fn goroutine(&mut self, addr: u64, bos_addr: u64, goid: u64, ctxt_addr: u64) {
        self.uvarint(4);
        self.uvarint(addr);
        self.uvarint(bos_addr);
        self.uvarint(goid);
        self.uvarint(0); // gopc
        self.uvarint(0); // status
        self.buf.push(0); // is_system
        self.buf.push(0); // is_background
        self.uvarint(0); // wait_since
        self.string("chan receive");
        self.uvarint(ctxt_addr);
        self.uvarint(0); // m
        self.uvarint(0); // defer
        self.uvarint(0); // panic
    }

    pub fn frame(
        &mut self,
        addr: u64,
        depth: u64,
        child_addr: u64,
        data: &[u8],
        name: &str,
        fields: &[(u64, u64)],
    ) {
        self.uvarint(5);
        self.uvarint(addr);
        self.uvarint(depth);
        self.uvarint(child_addr);
        self.bytes(data);
        self.uvarint(0x400); // entry
        self.uvarint(0x404); // pc
        self.uvarint(0); // continpc
        self.string(name);
        self.fields(fields);
    }

    pub fn data_segment(&mut self, addr: u64, data: &[u8], fields: &[(u64, u64)]) {
        self.uvarint(12);
        self.uvarint(addr);
        self.bytes(data);
        self.fields(fields);
    }

    pub fn bss_segment(&mut self, addr: u64, data: &[u8], fields: &[(u64, u64)]) {
        self.uvarint(13);
        self.uvarint(addr);
        self.bytes(data);
        self.fields(fields);
    }

    pub fn other_root(&mut self, description: &str, to_addr: u64) {
        self.uvarint(2);
        self.string(description);
        self.uvarint(to_addr);
    }

    pub fn finalizer(&mut self, obj: u64, func: u64) {
        self.uvarint(7);
        self.uvarint(obj);
        self.uvarint(func);
        self.uvarint(0);
        self.uvarint(0);
        self.uvarint(0);
    }

    pub fn qfinalizer(&mut self, obj: u64, func: u64, fint: u64, ot: u64) {
        self.uvarint(11);
        self.uvarint(obj);
        self.uvarint(func);
        self.uvarint(0); // code
        self.uvarint(fint);
        self.uvarint(ot);
    }

    pub fn os_thread(&mut self, addr: u64, id: u64, procid: u64) {
        self.uvarint(9);
        self.uvarint(addr);
        self.uvarint(id);
        self.uvarint(procid);
    }

    pub fn defer_record(&mut self, addr: u64, gp: u64) {
        self.uvarint(14);
        self.uvarint(addr);
        self.uvarint(gp);
        for _ in 0..5 {
            self.uvarint(0);
        }
    }

    pub fn panic_record(&mut self, addr: u64, gp: u64) {
        self.uvarint(15);
        self.uvarint(addr);
        self.uvarint(gp);
        for _ in 0..4 {
            self.uvarint(0);
        }
    }

    pub fn mem_prof(&mut self, key: u64, size: u64, stack: &[(&str, &str, u64)]) {
        self.uvarint(16);
        self.uvarint(key);
        self.uvarint(size);
        self.uvarint(stack.len() as u64);
        for &(func, file, line) in stack {
            self.string(func);
            self.string(file);
            self.uvarint(line);
        }
        self.uvarint(4); // allocs
        self.uvarint(1); // frees
    }

    pub fn alloc_sample(&mut self, addr: u64, key: u64) {
        self.uvarint(17);
        self.uvarint(addr);
        self.uvarint(key);
    }

    pub fn mem_stats(&mut self) {
        self.uvarint(10);
        for i in 0..24u64 {
            self.uvarint(i + 1);
        }
        for i in 0..256u64 {
            self.uvarint(i);
        }
        self.uvarint(7); // num_gc
    }

    /// Appends the EOF tag and writes the stream to a temp file.
    pub fn finish(mut self) -> NamedTempFile {
        self.uvarint(0);
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&self.buf).unwrap();
        f
    }
}

pub fn word(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}
