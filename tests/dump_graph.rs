//! End-to-end decoding, indexing, and edge enumeration against synthetic
//! dumps.

mod common;

use common::{word, DumpWriter};
use heapdb::{Edge, FieldKind, ObjId};

const PTR: u64 = FieldKind::Ptr as u64;
const IFACE: u64 = FieldKind::Iface as u64;
const EFACE: u64 = FieldKind::Eface as u64;

#[test]
fn minimal_dump() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    let mut payload = Vec::new();
    payload.extend_from_slice(&word(0));
    payload.extend_from_slice(&word(0));
    w.object(0x1000, &payload, &[(PTR, 0)]);
    let file = w.finish();

    let mut d = heapdb::read(file.path(), None).unwrap();
    assert_eq!(d.num_objects(), 1);
    assert_eq!(d.ptr_size, 8);
    assert_eq!(d.hchan_size, 48);
    assert_eq!(d.heap_start, 0x1000);
    assert_eq!(d.heap_end, 0x2000);

    assert_eq!(d.full_types.len(), 1);
    let ft = &d.full_types[0];
    assert_eq!(ft.size, 16);
    assert_eq!(ft.gc_sig, "P");
    assert_eq!(ft.name, "16_P");

    assert_eq!(d.find_obj(0x1000), Some(ObjId(0)));
    assert_eq!(d.find_obj(0x100f), Some(ObjId(0)));
    assert_eq!(d.find_obj(0x1010), None);
    assert_eq!(d.find_obj(0xfff), None);
    assert_eq!(d.find_obj(0x2000), None);

    assert_eq!(d.addr(ObjId(0)), 0x1000);
    assert_eq!(d.size(ObjId(0)), 16);
    let contents = d.contents(ObjId(0)).unwrap();
    assert_eq!(contents.len(), 16);
    assert_eq!(contents, &payload[..]);
}

#[test]
fn pointer_between_two_objects() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x3000);
    w.object(0x1000, &word(0x2000), &[(PTR, 0)]);
    w.object(0x2000, &word(0), &[]);
    let file = w.finish();

    let mut d = heapdb::read(file.path(), None).unwrap();
    assert_eq!(d.num_objects(), 2);
    let a = d.find_obj(0x1000).unwrap();
    let b = d.find_obj(0x2000).unwrap();

    let edges = d.edges(a).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].to, b);
    assert_eq!(edges[0].from_offset, 0);
    assert_eq!(edges[0].to_offset, 0);

    assert!(d.edges(b).unwrap().is_empty());
}

#[test]
fn interface_edge_resolves_through_the_itab() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x3000);
    w.type_record(0x5000, 8, "main.T", true);
    w.itab(0x6000, 0x5000);
    let mut payload = Vec::new();
    payload.extend_from_slice(&word(0x6000));
    payload.extend_from_slice(&word(0x2000));
    w.object(0x1000, &payload, &[(IFACE, 0)]);
    w.object(0x2000, &word(0), &[]);
    let file = w.finish();

    let mut d = heapdb::read(file.path(), None).unwrap();
    let a = d.find_obj(0x1000).unwrap();
    let b = d.find_obj(0x2000).unwrap();
    assert_eq!(d.full_type(a).gc_sig, "II");

    let edges = d.edges(a).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].to, b);
    assert_eq!(edges[0].from_offset, 8);
    assert_eq!(edges[0].to_offset, 0);
}

#[test]
fn inline_eface_payload_yields_no_edge() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x3000);
    w.type_record(0x5100, 8, "main.Inline", false);
    let mut payload = Vec::new();
    payload.extend_from_slice(&word(0x5100));
    payload.extend_from_slice(&word(0x2000));
    w.object(0x1000, &payload, &[(EFACE, 0)]);
    w.object(0x2000, &word(0), &[]);
    let file = w.finish();

    let mut d = heapdb::read(file.path(), None).unwrap();
    let a = d.find_obj(0x1000).unwrap();
    assert_eq!(d.full_type(a).gc_sig, "EE");
    assert!(d.edges(a).unwrap().is_empty());
}

#[test]
fn nil_interfaces_yield_no_edges() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x3000);
    let mut payload = Vec::new();
    payload.extend_from_slice(&word(0)); // nil itab
    payload.extend_from_slice(&word(0x1000));
    w.object(0x1000, &payload, &[(IFACE, 0)]);
    let file = w.finish();

    let mut d = heapdb::read(file.path(), None).unwrap();
    let a = d.find_obj(0x1000).unwrap();
    assert!(d.edges(a).unwrap().is_empty());
}

#[test]
fn frame_parent_linkage() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    w.frame(0xa, 0, 0, &[], "main.inner", &[]);
    w.frame(0xb, 1, 0xa, &[], "main.outer", &[]);
    w.goroutine(0x900, 0xa, 42, 0);
    let file = w.finish();

    let d = heapdb::read(file.path(), None).unwrap();
    assert_eq!(d.frames.len(), 2);
    let f0 = d.frames.iter().position(|f| f.depth == 0).unwrap();
    let f1 = d.frames.iter().position(|f| f.depth == 1).unwrap();

    assert_eq!(d.frames[f0].parent, Some(heapdb::FrameId(f1)));
    assert_eq!(d.frames[f1].parent, None);

    let g = &d.goroutines[0];
    assert_eq!(g.goid, 42);
    assert_eq!(g.bos, Some(heapdb::FrameId(f0)));
    assert_eq!(d.frames[f0].goroutine, Some(0));
    assert_eq!(d.frames[f1].goroutine, Some(0));
}

#[test]
fn goroutine_context_resolves_to_an_object() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    w.object(0x1000, &[0u8; 32], &[]);
    w.frame(0xa, 0, 0, &[], "main.run", &[]);
    w.goroutine(0x900, 0xa, 7, 0x1008); // interior pointer
    let file = w.finish();

    let d = heapdb::read(file.path(), None).unwrap();
    assert_eq!(d.goroutines[0].ctxt, Some(ObjId(0)));
}

#[test]
fn objects_are_sorted_and_non_overlapping() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x4000);
    // Deliberately out of address order.
    w.object(0x3000, &[0u8; 8], &[]);
    w.object(0x1000, &[0u8; 8], &[]);
    w.object(0x2000, &[0u8; 8], &[]);
    let file = w.finish();

    let d = heapdb::read(file.path(), None).unwrap();
    let addrs: Vec<u64> = (0..d.num_objects()).map(|i| d.addr(ObjId(i))).collect();
    assert_eq!(addrs, [0x1000, 0x2000, 0x3000]);
    for i in 0..d.num_objects() {
        let id = ObjId(i);
        assert!(d.addr(id) >= d.heap_start);
        assert!(d.addr(id) + d.size(id) <= d.heap_end);
        if i > 0 {
            let prev = ObjId(i - 1);
            assert!(d.addr(prev) + d.size(prev) <= d.addr(id));
        }
    }
}

#[test]
fn find_obj_scans_shared_buckets() {
    // Several small objects in one 512-byte bucket.
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    for i in 0..8u64 {
        w.object(0x1000 + i * 16, &[0u8; 16], &[]);
    }
    let file = w.finish();

    let d = heapdb::read(file.path(), None).unwrap();
    for i in 0..8u64 {
        assert_eq!(d.find_obj(0x1000 + i * 16 + 5), Some(ObjId(i as usize)));
    }
    assert_eq!(d.find_obj(0x1000 + 8 * 16), None);
}

#[test]
fn edges_are_stable_across_calls() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x3000);
    let mut payload = Vec::new();
    payload.extend_from_slice(&word(0x2000));
    payload.extend_from_slice(&word(0x2008));
    w.object(0x1000, &payload, &[(PTR, 0), (PTR, 8)]);
    w.object(0x2000, &[0u8; 16], &[]);
    let file = w.finish();

    let mut d = heapdb::read(file.path(), None).unwrap();
    let a = d.find_obj(0x1000).unwrap();
    let first: Vec<Edge> = d.edges(a).unwrap().to_vec();
    assert_eq!(first.len(), 2);
    assert_eq!(first[1].to_offset, 8);
    let second: Vec<Edge> = d.edges(a).unwrap().to_vec();
    assert_eq!(first, second);
}

#[test]
fn rereading_produces_identical_full_types() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x3000);
    w.object(0x1000, &[0u8; 16], &[(PTR, 0)]);
    w.object(0x1800, &[0u8; 16], &[(PTR, 0)]); // same shape, same FullType
    w.object(0x2000, &[0u8; 8], &[]);
    let file = w.finish();

    let d1 = heapdb::read(file.path(), None).unwrap();
    let d2 = heapdb::read(file.path(), None).unwrap();
    assert_eq!(d1.full_types.len(), 2);
    let sig = |d: &heapdb::Dump| {
        let mut v: Vec<(u64, String)> = d
            .full_types
            .iter()
            .map(|ft| (ft.size, ft.gc_sig.clone()))
            .collect();
        v.sort();
        v
    };
    assert_eq!(sig(&d1), sig(&d2));
}

#[test]
fn zero_sized_frames_coexist() {
    let mut w = DumpWriter::new();
    w.params(0x1000, 0x2000);
    // Two zero-sized frames at the same address, distinguished by depth.
    w.frame(0xa, 0, 0, &[], "main.leaf", &[]);
    w.frame(0xa, 1, 0xa, &[], "main.mid", &[]);
    w.frame(0xb, 2, 0xa, &[], "main.root", &[]);
    w.goroutine(0x900, 0xa, 1, 0);
    let file = w.finish();

    let d = heapdb::read(file.path(), None).unwrap();
    let leaf = d.frames.iter().position(|f| f.depth == 0).unwrap();
    let mid = d.frames.iter().position(|f| f.depth == 1).unwrap();
    let root = d.frames.iter().position(|f| f.depth == 2).unwrap();
    assert_eq!(d.frames[leaf].parent, Some(heapdb::FrameId(mid)));
    assert_eq!(d.frames[mid].parent, Some(heapdb::FrameId(root)));
    assert_eq!(d.frames[root].parent, None);
}
