//! Failure modes and the fallback naming scheme.

mod common;

use std::io::Write;

use common::{word, DumpWriter};
use heapdb::{Error, FieldKind};

const PTR: u64 = FieldKind::Ptr as u64;
const IFACE: u64 = FieldKind::Iface as u64;
const EFACE: u64 = FieldKind::Eface as u64;

#[test]
fn rejects_foreign_headers() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"core dump 1.0\n").unwrap();
    assert!(matches!(
        heapdb::read(f.path(), None),
        Err(Error::BadHeader)
    ));
}

#[test]
fn rejects_unknown_record_tags() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    w.uvarint(99);
    let file = w.finish();
    assert!(matches!(
        heapdb::read(file.path(), None),
        Err(Error::UnknownTag(99))
    ));
}

#[test]
fn truncated_records_fail() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    w.uvarint(1); // object record with nothing behind it
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&w.buf).unwrap();
    assert!(matches!(
        heapdb::read(f.path(), None),
        Err(Error::Truncated)
    ));
}

#[test]
fn objects_before_params_are_rejected() {
    let mut w = DumpWriter::new();
    w.object(0x1000, &[0u8; 8], &[]);
    let file = w.finish();
    assert!(matches!(
        heapdb::read(file.path(), None),
        Err(Error::UnsupportedPointerSize(0))
    ));
}

#[test]
fn pointer_sizes_other_than_4_and_8_are_rejected() {
    let mut w = DumpWriter::new();
    w.uvarint(6);
    w.uvarint(0);
    w.uvarint(2); // 16-bit pointers
    w.uvarint(0x1000);
    w.uvarint(0x2000);
    w.uvarint(b'6' as u64);
    w.string("");
    w.uvarint(1);
    let file = w.finish();
    assert!(matches!(
        heapdb::read(file.path(), None),
        Err(Error::UnsupportedPointerSize(2))
    ));
}

#[test]
fn goroutine_without_bottom_frame_is_fatal() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    w.goroutine(0x900, 0xdead, 3, 0);
    let file = w.finish();
    assert!(matches!(
        heapdb::read(file.path(), None),
        Err(Error::MissingBos {
            goid: 3,
            bos_addr: 0xdead
        })
    ));
}

#[test]
fn segment_interface_with_unknown_itab_is_fatal() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    let mut data = Vec::new();
    data.extend_from_slice(&word(0x7777)); // itab never recorded
    data.extend_from_slice(&word(0));
    w.data_segment(0x500, &data, &[(IFACE, 0)]);
    let file = w.finish();
    assert!(matches!(
        heapdb::read(file.path(), None),
        Err(Error::MissingItab(0x7777))
    ));
}

#[test]
fn heap_eface_with_unknown_type_fails_lazily() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    let mut payload = Vec::new();
    payload.extend_from_slice(&word(0x8888)); // type never recorded
    payload.extend_from_slice(&word(0));
    w.object(0x1000, &payload, &[(EFACE, 0)]);
    let file = w.finish();

    // Decoding succeeds; the structural problem surfaces on edge walk.
    let mut d = heapdb::read(file.path(), None).unwrap();
    let a = d.find_obj(0x1000).unwrap();
    assert!(matches!(d.edges(a), Err(Error::MissingType(0x8888))));
}

#[test]
fn fallback_names_are_positional() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    w.type_record(0x5000, 16, "main.T", false);
    w.frame(0xa, 0, 0, &word(0), "main.f", &[(PTR, 0)]);
    w.goroutine(0x900, 0xa, 1, 0);
    w.data_segment(0x500, &word(0), &[(PTR, 0)]);
    w.bss_segment(0x600, &word(0), &[(PTR, 0)]);
    let file = w.finish();

    let d = heapdb::read(file.path(), None).unwrap();
    assert_eq!(
        d.frames[0].fields[0].name.as_deref(),
        Some("var0")
    );
    assert_eq!(
        d.data.as_ref().unwrap().fields[0].name.as_deref(),
        Some("data0")
    );
    assert_eq!(
        d.bss.as_ref().unwrap().fields[0].name.as_deref(),
        Some("bss0")
    );
}

#[test]
fn full_type_fields_cover_the_signature_and_tail() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    // 32-byte object: pointer, scalar gap, then two untyped words.
    w.object(0x1000, &[0u8; 32], &[(PTR, 0)]);
    let file = w.finish();

    let d = heapdb::read(file.path(), None).unwrap();
    let ft = &d.full_types[0];
    assert_eq!(ft.gc_sig, "P");
    let kinds: Vec<(FieldKind, u64)> =
        ft.fields.iter().map(|f| (f.kind, f.offset)).collect();
    assert_eq!(
        kinds,
        [
            (FieldKind::Ptr, 0),
            (FieldKind::UInt64, 8),
            (FieldKind::UInt64, 16),
            (FieldKind::UInt64, 24),
        ]
    );
    assert_eq!(ft.fields[0].name.as_deref(), Some("f0"));
    assert_eq!(ft.fields[1].name.as_deref(), Some("1"));
}

#[test]
fn huge_objects_get_an_elided_marker() {
    let size = (1usize << 16) + 64;
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x40000);
    w.object(0x1000, &vec![0u8; size], &[]);
    let file = w.finish();

    let d = heapdb::read(file.path(), None).unwrap();
    let ft = &d.full_types[0];
    let last = ft.fields.last().unwrap();
    assert_eq!(last.kind, FieldKind::BytesElided);
    assert_eq!(last.offset, 1 << 16);
    assert_eq!(last.name.as_deref(), Some("offset 10000"));
}
