//! Field, frame-slot, and global naming.
//!
//! With DWARF available, runtime types get DWARF field names when the two
//! layouts agree, frame slots get local and out-arg names from the frame
//! layouts, and data/bss slots are named through an interval map over the
//! globals' absolute addresses. Without DWARF, everything falls back to
//! positional names. Either way, every `FullType` gets a field list
//! synthesised from its GC signature.

use std::collections::BTreeMap;

use rangemap::RangeInclusiveMap;
use tracing::{debug, warn};

use crate::dwarf::{join_names, DwarfInfo, TypeSlot};
use crate::model::*;
use crate::{Dump, Error};

pub(crate) fn name_with_dwarf(
    d: &mut Dump,
    info: &DwarfInfo,
) -> Result<(), Error> {
    let graph = &info.graph;

    // DWARF types by name. Names repeat across units; the first wins.
    let mut by_name: BTreeMap<&str, TypeSlot> = BTreeMap::new();
    for s in graph.slots() {
        by_name.entry(graph.name(s)).or_insert(s);
    }

    // The dump's field list is the root truth, but it has no names and
    // omits non-pointer fields. If the DWARF layout is consistent with it
    // -- same kind at every dump offset, nothing pointer-bearing beyond
    // them -- adopt the DWARF fields wholesale.
    for t in d.type_map.values_mut() {
        let Some(&slot) = by_name.get(t.name.as_str()) else {
            // Unexported types have no DWARF entry; that's normal.
            continue;
        };
        let df = graph.fields(slot)?;
        let mut layout: BTreeMap<u64, &Field> = BTreeMap::new();
        for f in df {
            layout.insert(f.offset, f);
        }
        let mut consistent = true;
        for f in &t.fields {
            match layout.remove(&f.offset) {
                Some(lf) if lf.kind == f.kind => (),
                Some(lf) => {
                    debug!(
                        ty = %t.name,
                        offset = f.offset,
                        dwarf = ?lf.kind,
                        dump = ?f.kind,
                        "field kind mismatch"
                    );
                    consistent = false;
                }
                None => {
                    debug!(
                        ty = %t.name,
                        offset = f.offset,
                        "dump field missing from dwarf layout"
                    );
                    consistent = false;
                }
            }
        }
        for f in layout.values() {
            if matches!(
                f.kind,
                FieldKind::Ptr | FieldKind::Iface | FieldKind::Eface
            ) {
                debug!(
                    ty = %t.name,
                    offset = f.offset,
                    "dwarf layout has an extra pointer field"
                );
                consistent = false;
            }
        }
        if consistent {
            t.fields = df.to_vec();
        } else {
            warn!(ty = %t.name, "inconsistent dwarf layout; keeping dump fields");
        }
    }

    // Frame slot names, keyed by function and position. Locals are keyed
    // by distance down from the frame top, args by offset into the
    // argument area.
    let mut local_names: BTreeMap<(String, u64), String> = BTreeMap::new();
    let mut arg_names: BTreeMap<(String, u64), String> = BTreeMap::new();
    for (fname, layout) in &info.layouts {
        for local in &layout.locals {
            for f in graph.fields(local.ty)? {
                local_names.insert(
                    (fname.clone(), local.offset.wrapping_sub(f.offset)),
                    join_names(&local.name, f.name.as_deref().unwrap_or("")),
                );
            }
        }
        for arg in &layout.args {
            for f in graph.fields(arg.ty)? {
                arg_names.insert(
                    (fname.clone(), arg.offset + f.offset),
                    join_names(&arg.name, f.name.as_deref().unwrap_or("")),
                );
            }
        }
    }
    for gi in 0..d.goroutines.len() {
        let mut callee: Option<FrameId> = None;
        let mut cur = d.goroutines[gi].bos;
        while let Some(fid) = cur {
            let frame_len = d.frames[fid.0].data.len() as u64;
            let fname = d.frames[fid.0].name.clone();
            let callee_name = callee.map(|c| d.frames[c.0].name.clone());
            for i in 0..d.frames[fid.0].fields.len() {
                let off = d.frames[fid.0].fields[i].offset;
                let mut name = local_names
                    .get(&(fname.clone(), frame_len.wrapping_sub(off)))
                    .cloned();
                if name.is_none() {
                    if let Some(cn) = &callee_name {
                        if let Some(a) = arg_names.get(&(cn.clone(), off)) {
                            name = Some(format!("outarg.{a}"));
                        }
                    }
                }
                d.frames[fid.0].fields[i].name =
                    Some(name.unwrap_or_else(|| format!("~{off}")));
            }
            callee = Some(fid);
            cur = d.frames[fid.0].parent;
        }
    }

    // Global names: an interval map over absolute addresses, so interior
    // slots resolve to the enclosing global plus a byte delta.
    let mut globals: RangeInclusiveMap<u64, Field> = RangeInclusiveMap::new();
    for g in &info.globals {
        match g.ty {
            None => {
                // Non-Go symbols (rodata, closures) land here.
                let mut f = Field::new(FieldKind::Ptr, 0);
                f.name = Some(format!("~{}", g.name));
                let extent = d.ptr_size.max(1);
                globals.insert(g.addr..=g.addr + extent - 1, f);
            }
            Some(ty) => {
                for f in graph.fields(ty)? {
                    let start = g.addr + f.offset;
                    let extent = f.kind.byte_size(d.ptr_size).max(1);
                    let mut nf = f.clone();
                    nf.offset = 0;
                    nf.name = Some(join_names(
                        &g.name,
                        f.name.as_deref().unwrap_or(""),
                    ));
                    globals.insert(start..=start + extent - 1, nf);
                }
            }
        }
    }
    for seg in [d.data.as_mut(), d.bss.as_mut()].into_iter().flatten() {
        for f in seg.fields.iter_mut() {
            let addr = seg.addr + f.offset;
            let Some((range, entry)) = globals.get_key_value(&addr) else {
                continue;
            };
            let mut nf = entry.clone();
            if *range.start() != addr {
                let base = nf.name.take().unwrap_or_default();
                nf.name = Some(format!("{}:{}", base, addr - range.start()));
            }
            nf.offset = f.offset;
            *f = nf;
        }
    }
    Ok(())
}

/// Positional names for everything when no debug info is available.
pub(crate) fn name_fallback(d: &mut Dump) {
    for t in d.type_map.values_mut() {
        for (i, f) in t.fields.iter_mut().enumerate() {
            f.name = Some(format!("field{i}"));
        }
    }
    for frame in &mut d.frames {
        for (i, f) in frame.fields.iter_mut().enumerate() {
            f.name = Some(format!("var{i}"));
        }
    }
    if let Some(seg) = &mut d.data {
        for (i, f) in seg.fields.iter_mut().enumerate() {
            f.name = Some(format!("data{i}"));
        }
    }
    if let Some(seg) = &mut d.bss {
        for (i, f) in seg.fields.iter_mut().enumerate() {
            f.name = Some(format!("bss{i}"));
        }
    }
}

/// Synthesises field lists for FullTypes from their GC signatures.
///
/// DWARF-retagged FullTypes already carry a projection and are left alone.
pub(crate) fn name_full_types(d: &mut Dump) {
    for ft in &mut d.full_types {
        if ft.fields.is_empty() {
            synthesize_fields(ft, d.ptr_size);
        }
    }
}

/// One field per signature slot, then pointer-size-stride scalars for any
/// trailing bytes, cut off with a `BytesElided` marker past 64 KiB so huge
/// objects don't explode the field list.
fn synthesize_fields(ft: &mut FullType, ptr_size: u64) {
    let scalar = if ptr_size == 8 {
        FieldKind::UInt64
    } else {
        FieldKind::UInt32
    };
    let sig = ft.gc_sig.as_bytes();
    let mut i = 0;
    while i < sig.len() {
        let offset = i as u64 * ptr_size;
        let kind = match sig[i] {
            b'P' => FieldKind::Ptr,
            b'I' => FieldKind::Iface,
            b'E' => FieldKind::Eface,
            _ => scalar,
        };
        let mut f = Field::new(kind, offset);
        f.name = Some(format!("f{i}"));
        ft.fields.push(f);
        if matches!(kind, FieldKind::Iface | FieldKind::Eface) {
            i += 1; // the companion slot belongs to this field
        }
        i += 1;
    }
    // After the signature there may be more data bytes.
    let mut offset = sig.len() as u64 * ptr_size;
    while offset < ft.size {
        let mut f = Field::new(scalar, offset);
        f.name = Some(format!("{}", offset / ptr_size));
        ft.fields.push(f);
        if offset >= 1 << 16 {
            let mut elided = Field::new(FieldKind::BytesElided, offset);
            elided.name = Some(format!("offset {offset:x}"));
            ft.fields.push(elided);
            break;
        }
        offset += ptr_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_type(size: u64, sig: &str) -> FullType {
        FullType {
            id: FullTypeId(0),
            size,
            gc_sig: sig.to_string(),
            name: format!("{size}_{sig}"),
            fields: Vec::new(),
        }
    }

    #[test]
    fn signature_slots_become_fields() {
        let mut ft = full_type(40, "PSEE");
        synthesize_fields(&mut ft, 8);
        let kinds: Vec<_> = ft.fields.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            [FieldKind::Ptr, FieldKind::UInt64, FieldKind::Eface, FieldKind::UInt64]
        );
        // The eface consumed two signature slots; the trailing scalar
        // covers the last pointer-sized chunk.
        assert_eq!(ft.fields[2].offset, 16);
        assert_eq!(ft.fields[2].name.as_deref(), Some("f2"));
        assert_eq!(ft.fields[3].offset, 32);
        assert_eq!(ft.fields[3].name.as_deref(), Some("4"));
    }

    #[test]
    fn trailing_bytes_are_elided_past_64k() {
        let mut ft = full_type(1 << 20, "");
        synthesize_fields(&mut ft, 8);
        let last = ft.fields.last().unwrap();
        assert_eq!(last.kind, FieldKind::BytesElided);
        assert_eq!(last.offset, 1 << 16);
        // 64 KiB of scalars at 8-byte stride, plus the marker.
        assert_eq!(ft.fields.len(), (1 << 16) / 8 + 2);
    }

    #[test]
    fn dwarf_layouts_are_left_alone() {
        let mut ft = full_type(16, "");
        ft.fields.push(Field::new(FieldKind::Ptr, 0));
        let before = ft.fields.clone();
        let mut d_full_types = vec![ft];
        for ft in &mut d_full_types {
            if ft.fields.is_empty() {
                synthesize_fields(ft, 8);
            }
        }
        assert_eq!(d_full_types[0].fields, before);
    }
}
