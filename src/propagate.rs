//! Worklist type propagation.
//!
//! Seeds heap-object types from typed globals and live stack slots, then
//! chases pointer fields of already-typed objects to a fixpoint. Objects
//! that end up typed are retagged with a DWARF-derived `FullType` so the
//! rest of the crate sees the richer layout.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::dwarf::{DwarfInfo, DwarfKind, TypeGraph, TypeSlot};
use crate::model::*;
use crate::{read_word, Dump, Error};

pub(crate) fn run(d: &mut Dump, info: &DwarfInfo) -> Result<(), Error> {
    let graph = &info.graph;
    let mut htypes: BTreeMap<u64, TypeSlot> = BTreeMap::new();
    let mut worklist: Vec<u64> = Vec::new();

    seed_globals(d, info, &mut htypes, &mut worklist)?;
    seed_stacks(d, info, &mut htypes, &mut worklist)?;

    // Chase pointers until nothing new gets typed. Contents are copied out
    // of the dump's scratch buffer because the walk needs the dump for
    // lookups while the bytes are read.
    let mut scratch: Vec<u8> = Vec::new();
    while let Some(addr) = worklist.pop() {
        let Some(&ty) = htypes.get(&addr) else {
            continue;
        };
        let Some(obj) = d.find_obj(addr) else {
            debug!(addr, ty = graph.name(ty), "typed pointer does not hit an object");
            continue;
        };
        let base = d.addr(obj);
        scratch.clear();
        scratch.extend_from_slice(d.contents(obj)?);
        let type_size = graph.size(ty);
        if type_size > scratch.len() as u64 {
            return Err(Error::TypeDoesNotFit {
                addr,
                name: graph.name(ty).to_string(),
                type_size,
                obj_size: scratch.len() as u64,
            });
        }
        for leaf in graph.pointer_leaves(ty) {
            let DwarfKind::Ptr { elem: Some(elem) } = graph.kind(leaf.ty)
            else {
                continue;
            };
            let slot = addr - base + leaf.offset;
            let Some(p) = read_word(d.endian, d.ptr_size, &scratch, slot)
            else {
                continue;
            };
            if set_type(d, graph, &mut htypes, p, *elem)? {
                worklist.push(p);
            }
        }
    }

    retag(d, graph, &htypes)
}

/// Types objects pointed to by typed globals in the data and bss segments.
fn seed_globals(
    d: &Dump,
    info: &DwarfInfo,
    htypes: &mut BTreeMap<u64, TypeSlot>,
    worklist: &mut Vec<u64>,
) -> Result<(), Error> {
    let graph = &info.graph;
    for g in &info.globals {
        let Some(ty) = g.ty else {
            continue; // named-only globals are for the naming pass
        };
        let Some((seg_addr, data)) = segment_containing(d, g.addr) else {
            warn!(
                name = %g.name,
                addr = g.addr,
                "global is outside the data and bss segments"
            );
            continue;
        };
        let base_off = g.addr - seg_addr;
        for leaf in graph.pointer_leaves(ty) {
            let DwarfKind::Ptr { elem: Some(elem) } = graph.kind(leaf.ty)
            else {
                continue;
            };
            let Some(p) =
                read_word(d.endian, d.ptr_size, data, base_off + leaf.offset)
            else {
                continue;
            };
            if set_type(d, graph, htypes, p, *elem)? {
                worklist.push(p);
            }
        }
    }
    Ok(())
}

/// Types objects pointed to by live stack slots.
///
/// Each frame's dump-provided field list is its liveness map: a live
/// interface slot covers two words. Locals sit at `len(data) - offset`;
/// the previously visited frame's formal parameters sit at positive
/// offsets in this frame's out-argument area.
fn seed_stacks(
    d: &Dump,
    info: &DwarfInfo,
    htypes: &mut BTreeMap<u64, TypeSlot>,
    worklist: &mut Vec<u64>,
) -> Result<(), Error> {
    let graph = &info.graph;
    let mut live: BTreeSet<u64> = BTreeSet::new();
    for g in &d.goroutines {
        let mut callee: Option<&StackFrame> = None;
        let mut cur = g.bos;
        while let Some(fid) = cur {
            let frame = &d.frames[fid.0];
            live.clear();
            for f in &frame.fields {
                match f.kind {
                    FieldKind::Ptr => {
                        live.insert(f.offset);
                    }
                    FieldKind::Iface | FieldKind::Eface => {
                        live.insert(f.offset);
                        live.insert(f.offset + d.ptr_size);
                    }
                    _ => (),
                }
            }
            if let Some(layout) = info.layouts.get(&frame.name) {
                for local in &layout.locals {
                    for leaf in graph.pointer_leaves(local.ty) {
                        let DwarfKind::Ptr { elem: Some(elem) } =
                            graph.kind(leaf.ty)
                        else {
                            continue;
                        };
                        let Some(top) = (frame.data.len() as u64)
                            .checked_sub(local.offset)
                        else {
                            continue;
                        };
                        let slot = top + leaf.offset;
                        if !live.contains(&slot) {
                            continue;
                        }
                        let Some(p) = read_word(
                            d.endian,
                            d.ptr_size,
                            &frame.data,
                            slot,
                        ) else {
                            continue;
                        };
                        if set_type(d, graph, htypes, p, *elem)? {
                            worklist.push(p);
                        }
                    }
                }
            }
            if let Some(c) = callee {
                if let Some(layout) = info.layouts.get(&c.name) {
                    for arg in &layout.args {
                        for leaf in graph.pointer_leaves(arg.ty) {
                            let DwarfKind::Ptr { elem: Some(elem) } =
                                graph.kind(leaf.ty)
                            else {
                                continue;
                            };
                            let slot = arg.offset + leaf.offset;
                            if !live.contains(&slot) {
                                continue;
                            }
                            let Some(p) = read_word(
                                d.endian,
                                d.ptr_size,
                                &frame.data,
                                slot,
                            ) else {
                                continue;
                            };
                            if set_type(d, graph, htypes, p, *elem)? {
                                worklist.push(p);
                            }
                        }
                    }
                }
            }
            callee = Some(frame);
            cur = frame.parent;
        }
    }
    Ok(())
}

fn segment_containing(d: &Dump, addr: u64) -> Option<(u64, &[u8])> {
    for seg in [d.data.as_ref(), d.bss.as_ref()].into_iter().flatten() {
        if seg.contains(addr) {
            return Some((seg.addr, &seg.data));
        }
    }
    None
}

/// Records a type for a heap address.
///
/// Addresses outside the heap are ignored. A type larger than the object
/// it lands in is fatal. On conflicting assignments the first one wins;
/// the conflict is logged.
fn set_type(
    d: &Dump,
    graph: &TypeGraph,
    htypes: &mut BTreeMap<u64, TypeSlot>,
    addr: u64,
    ty: TypeSlot,
) -> Result<bool, Error> {
    if addr < d.heap_start || addr >= d.heap_end {
        return Ok(false);
    }
    if let Some(obj) = d.find_obj(addr) {
        let type_size = graph.size(ty);
        if type_size > d.size(obj) {
            return Err(Error::TypeDoesNotFit {
                addr,
                name: graph.name(ty).to_string(),
                type_size,
                obj_size: d.size(obj),
            });
        }
    }
    if let Some(&old) = htypes.get(&addr) {
        if old != ty {
            warn!(
                addr,
                kept = graph.name(old),
                ignored = graph.name(ty),
                "conflicting types propagated to one heap address"
            );
        }
        return Ok(false);
    }
    htypes.insert(addr, ty);
    debug!(addr, ty = graph.name(ty), "typed heap address");
    Ok(true)
}

/// Allocates one `FullType` per distinct DWARF type that reached a heap
/// object and retags those objects with it. The new full types carry the
/// DWARF field projection so edge enumeration follows the inferred layout.
fn retag(
    d: &mut Dump,
    graph: &TypeGraph,
    htypes: &BTreeMap<u64, TypeSlot>,
) -> Result<(), Error> {
    let mut dwarf_to_full: BTreeMap<TypeSlot, FullTypeId> = BTreeMap::new();
    for i in 0..d.objects.len() {
        let addr = d.objects[i].addr;
        let Some(&ty) = htypes.get(&addr) else {
            continue;
        };
        let ft = match dwarf_to_full.get(&ty) {
            Some(&ft) => ft,
            None => {
                let id = FullTypeId(d.full_types.len());
                let fields = graph.fields(ty)?.to_vec();
                d.full_types.push(FullType {
                    id,
                    size: graph.size(ty),
                    gc_sig: String::new(),
                    name: graph.name(ty).to_string(),
                    fields,
                });
                dwarf_to_full.insert(ty, id);
                id
            }
        };
        d.objects[i].ft = ft;
    }
    Ok(())
}
