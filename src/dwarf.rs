//! DWARF type materialiser.
//!
//! Consumes the executable's debug info by recursive descent (via gimli),
//! building a graph of the six type shapes the propagator cares about:
//! base, pointer, struct, array, typedef, subroutine. Each type exposes two
//! lazily-memoised projections: `fields` flattens to the heap-dump field
//! kinds, `pointer_leaves` flattens but keeps pointer-typed leaves for type
//! propagation. The walk also collects global variables and per-function
//! frame layouts from location expressions.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use gimli::constants as gim_con;
use gimli::Reader;
use once_cell::sync::Lazy;
use once_cell::unsync::OnceCell;
use regex::Regex;
use tracing::{debug, warn};

use object::{Object, ObjectSection};

use crate::model::{Field, FieldKind};
use crate::Error;

// Internal type abbreviations
type RtReader = gimli::EndianReader<gimli::RunTimeEndian, Arc<[u8]>>;
type SectionOffset = gimli::UnitSectionOffset;

/// Pointer types that legitimately have no element type.
const UNTYPED_POINTERS: [&str; 2] =
    ["unsafe.Pointer", "crypto/x509._Ctype_CFTypeRef"];

/// Identifies a type in the materialised graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub(crate) struct TypeSlot(pub(crate) usize);

/// A flattened component of a type: where it sits, what it is called, and
/// which type lives there.
#[derive(Clone, Debug)]
pub(crate) struct TypeMember {
    pub(crate) offset: u64,
    pub(crate) name: String,
    pub(crate) ty: TypeSlot,
}

/// The six type shapes that matter for heap analysis.
#[derive(Clone, Debug)]
pub(crate) enum DwarfKind {
    Base { encoding: gimli::DwAte, size: u64 },
    Ptr { elem: Option<TypeSlot> },
    Struct { size: u64, members: Vec<TypeMember> },
    Array { size: u64, elem: TypeSlot },
    Typedef { target: TypeSlot },
    Subroutine,
}

/// One type plus its memoised projections.
///
/// The projections are computed on first use rather than at construction:
/// unrolling every array type eagerly would be catastrophic for types like
/// `[1000000000]byte` that are declared but never instantiated.
#[derive(Clone, Debug)]
pub(crate) struct TypeNode {
    name: String,
    kind: DwarfKind,
    fields: OnceCell<Vec<Field>>,
    leaves: OnceCell<Vec<TypeMember>>,
}

impl TypeNode {
    pub(crate) fn new(name: impl Into<String>, kind: DwarfKind) -> TypeNode {
        TypeNode {
            name: name.into(),
            kind,
            fields: OnceCell::new(),
            leaves: OnceCell::new(),
        }
    }
}

/// The materialised type graph. Slots index into a flat node table; the
/// last two nodes are synthetic (`<codeptr>` and `*<closure>`) and stand in
/// for the pointed-to shape of every subroutine type.
#[derive(Clone, Debug)]
pub(crate) struct TypeGraph {
    nodes: Vec<TypeNode>,
    ptr_size: u64,
    closure: TypeSlot,
}

impl TypeGraph {
    pub(crate) fn new(mut nodes: Vec<TypeNode>, ptr_size: u64) -> TypeGraph {
        let codeptr = TypeSlot(nodes.len());
        nodes.push(TypeNode::new(
            "<codeptr>",
            DwarfKind::Base {
                encoding: gim_con::DW_ATE_unsigned,
                size: ptr_size,
            },
        ));
        let closure = TypeSlot(nodes.len());
        nodes.push(TypeNode::new(
            "*<closure>",
            DwarfKind::Ptr {
                elem: Some(codeptr),
            },
        ));
        TypeGraph {
            nodes,
            ptr_size,
            closure,
        }
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = TypeSlot> {
        (0..self.nodes.len()).map(TypeSlot)
    }

    pub(crate) fn name(&self, s: TypeSlot) -> &str {
        &self.nodes[s.0].name
    }

    pub(crate) fn kind(&self, s: TypeSlot) -> &DwarfKind {
        &self.nodes[s.0].kind
    }

    /// Size of the type in bytes. Pointers and subroutine values are
    /// pointer-sized; typedefs have the size of their target.
    pub(crate) fn size(&self, s: TypeSlot) -> u64 {
        match &self.nodes[s.0].kind {
            DwarfKind::Base { size, .. } => *size,
            DwarfKind::Struct { size, .. } => *size,
            DwarfKind::Array { size, .. } => *size,
            DwarfKind::Ptr { .. } | DwarfKind::Subroutine => self.ptr_size,
            DwarfKind::Typedef { target } => self.size(*target),
        }
    }

    /// The heap-dump projection: field kinds at offsets, the same shape the
    /// dump itself uses. Memoised per type.
    pub(crate) fn fields(&self, s: TypeSlot) -> Result<&[Field], Error> {
        self.nodes[s.0]
            .fields
            .get_or_try_init(|| self.compute_fields(s))
            .map(Vec::as_slice)
    }

    /// The propagation projection: flattened to base and pointer leaves,
    /// with pointer element types retained. Memoised per type.
    pub(crate) fn pointer_leaves(&self, s: TypeSlot) -> &[TypeMember] {
        self.nodes[s.0]
            .leaves
            .get_or_init(|| self.compute_leaves(s))
    }

    fn compute_fields(&self, s: TypeSlot) -> Result<Vec<Field>, Error> {
        let node = &self.nodes[s.0];
        let scalar = scalar_kind(self.ptr_size);
        Ok(match &node.kind {
            DwarfKind::Base { encoding, size } => {
                vec![Field::new(base_field_kind(*encoding, *size)?, 0)]
            }
            DwarfKind::Ptr { .. } => {
                let mut f = Field::new(FieldKind::Ptr, 0);
                f.base_type =
                    node.name.strip_prefix('*').map(str::to_owned);
                vec![f]
            }
            DwarfKind::Typedef { target } => self.fields(*target)?.to_vec(),
            // A func value is a pointer to a closure.
            DwarfKind::Subroutine => vec![Field::new(FieldKind::Ptr, 0)],
            DwarfKind::Struct { members, .. } => match node.name.as_str() {
                // Don't look inside strings and interfaces; project the
                // shapes the dump format uses for them.
                "string" => {
                    vec![Field::new(FieldKind::Ptr, 0), Field::new(scalar, 0)]
                }
                "runtime.iface" => {
                    vec![
                        Field::new(FieldKind::Ptr, 0),
                        Field::new(FieldKind::Ptr, 0),
                    ]
                }
                "runtime.eface" => {
                    vec![
                        Field::new(FieldKind::Eface, 0),
                        Field::new(FieldKind::Eface, 0),
                    ]
                }
                _ => {
                    let mut fields = Vec::new();
                    for m in members {
                        for f in self.fields(m.ty)? {
                            let mut f = f.clone();
                            f.offset += m.offset;
                            f.name = opt_name(join_names(
                                &m.name,
                                f.name.as_deref().unwrap_or(""),
                            ));
                            fields.push(f);
                        }
                    }
                    fields
                }
            },
            DwarfKind::Array { size, elem } => {
                let mut fields = Vec::new();
                let elem_size = self.size(*elem);
                if elem_size > 0 {
                    let inner = self.fields(*elem)?;
                    for i in 0..size / elem_size {
                        for f in inner {
                            let mut f = f.clone();
                            f.offset += i * elem_size;
                            f.name = opt_name(join_names(
                                &i.to_string(),
                                f.name.as_deref().unwrap_or(""),
                            ));
                            fields.push(f);
                        }
                    }
                }
                fields
            }
        })
    }

    fn compute_leaves(&self, s: TypeSlot) -> Vec<TypeMember> {
        let node = &self.nodes[s.0];
        match &node.kind {
            DwarfKind::Base { .. } | DwarfKind::Ptr { .. } => {
                vec![TypeMember {
                    offset: 0,
                    name: String::new(),
                    ty: s,
                }]
            }
            DwarfKind::Typedef { target } => {
                self.pointer_leaves(*target).to_vec()
            }
            DwarfKind::Subroutine => vec![TypeMember {
                offset: 0,
                name: String::new(),
                ty: self.closure,
            }],
            DwarfKind::Struct { members, .. } => {
                let mut leaves = Vec::new();
                for m in members {
                    for f in self.pointer_leaves(m.ty) {
                        leaves.push(TypeMember {
                            offset: m.offset + f.offset,
                            name: join_names(&m.name, &f.name),
                            ty: f.ty,
                        });
                    }
                }
                leaves
            }
            DwarfKind::Array { size, elem } => {
                let mut leaves = Vec::new();
                let elem_size = self.size(*elem);
                if elem_size > 0 {
                    let inner = self.pointer_leaves(*elem).to_vec();
                    for i in 0..size / elem_size {
                        for f in &inner {
                            leaves.push(TypeMember {
                                offset: i * elem_size + f.offset,
                                name: join_names(&format!("[{i}]"), &f.name),
                                ty: f.ty,
                            });
                        }
                    }
                }
                leaves
            }
        }
    }
}

/// A global variable with a fixed address. Untyped globals (assembly
/// symbols, read-only data) keep their names for the naming pass but carry
/// no type.
#[derive(Clone, Debug)]
pub(crate) struct GlobalVar {
    pub(crate) addr: u64,
    pub(crate) name: String,
    pub(crate) ty: Option<TypeSlot>,
}

/// Frame layout of one function: locals keyed by distance down from the
/// frame top, formal parameters keyed by offset into the argument area.
#[derive(Clone, Debug, Default)]
pub(crate) struct FrameLayout {
    pub(crate) locals: Vec<TypeMember>,
    pub(crate) args: Vec<TypeMember>,
}

/// Everything the later passes need from the executable.
pub(crate) struct DwarfInfo {
    pub(crate) graph: TypeGraph,
    pub(crate) globals: Vec<GlobalVar>,
    pub(crate) layouts: BTreeMap<String, FrameLayout>,
}

/// Joins two name path components, tolerating empties.
pub(crate) fn join_names(a: &str, b: &str) -> String {
    if a.is_empty() {
        b.to_string()
    } else if b.is_empty() {
        a.to_string()
    } else {
        format!("{a}.{b}")
    }
}

fn opt_name(name: String) -> Option<String> {
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn scalar_kind(ptr_size: u64) -> FieldKind {
    if ptr_size == 8 {
        FieldKind::UInt64
    } else {
        FieldKind::UInt32
    }
}

/// `(encoding, size)` to heap-dump field kind. Anything outside this table
/// is fatal.
fn base_field_kind(encoding: gimli::DwAte, size: u64) -> Result<FieldKind, Error> {
    Ok(match (encoding, size) {
        (gim_con::DW_ATE_boolean, _) => FieldKind::Bool,
        (gim_con::DW_ATE_signed, 1) => FieldKind::SInt8,
        (gim_con::DW_ATE_signed, 2) => FieldKind::SInt16,
        (gim_con::DW_ATE_signed, 4) => FieldKind::SInt32,
        (gim_con::DW_ATE_signed, 8) => FieldKind::SInt64,
        (gim_con::DW_ATE_unsigned, 1) => FieldKind::UInt8,
        (gim_con::DW_ATE_unsigned, 2) => FieldKind::UInt16,
        (gim_con::DW_ATE_unsigned, 4) => FieldKind::UInt32,
        (gim_con::DW_ATE_unsigned, 8) => FieldKind::UInt64,
        (gim_con::DW_ATE_float, 4) => FieldKind::Float32,
        (gim_con::DW_ATE_float, 8) => FieldKind::Float64,
        (gim_con::DW_ATE_complex_float, 8) => FieldKind::Complex64,
        (gim_con::DW_ATE_complex_float, 16) => FieldKind::Complex128,
        _ => return Err(Error::UnsupportedBaseType { encoding, size }),
    })
}

// Some type names in the DWARF info don't match the corresponding names in
// the binary; map hash table internals are the known offenders.
static MAP_HDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^hash<(.*),(.*)>$").unwrap());
static MAP_BUCKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^bucket<(.*),(.*)>$").unwrap());

fn rewrite_type_name(name: &str) -> String {
    if let Some(c) = MAP_HDR.captures(name) {
        return format!("map.hdr[{}]{}", &c[1], &c[2]);
    }
    if let Some(c) = MAP_BUCKET.captures(name) {
        return format!("map.bucket[{}]{}", &c[1], &c[2]);
    }
    name.to_string()
}

fn read_uleb(b: &[u8]) -> Option<(&[u8], u64)> {
    let mut r = 0u64;
    let mut shift = 0u32;
    let mut i = 0;
    loop {
        let x = *b.get(i)?;
        i += 1;
        if shift >= 64 {
            return None;
        }
        r |= u64::from(x & 0x7f) << shift;
        if x & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Some((&b[i..], r))
}

fn read_sleb(b: &[u8]) -> Option<(&[u8], i64)> {
    let (rest, v) = read_uleb(b)?;
    let bits = ((b.len() - rest.len()) * 7).min(64) as u32;
    let v = if bits >= 64 {
        v as i64
    } else {
        // sign extend
        (v as i64) << (64 - bits) >> (64 - bits)
    };
    Some((rest, v))
}

/// Decodes a member location expression. Accepted forms: nothing (offset
/// 0), `plus_uconst u`, or `consts s, plus` with no trailing bytes.
fn member_offset_from_expr(bytes: &[u8]) -> Result<u64, Error> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes[0] == gim_con::DW_OP_plus_uconst.0 {
        let (rest, off) =
            read_uleb(&bytes[1..]).ok_or(Error::BadDwarfLocation)?;
        if !rest.is_empty() {
            return Err(Error::BadDwarfLocation);
        }
        return Ok(off);
    }
    if bytes.len() >= 2
        && bytes[0] == gim_con::DW_OP_consts.0
        && bytes[bytes.len() - 1] == gim_con::DW_OP_plus.0
    {
        let (rest, off) = read_sleb(&bytes[1..bytes.len() - 1])
            .ok_or(Error::BadDwarfLocation)?;
        if !rest.is_empty() {
            return Err(Error::BadDwarfLocation);
        }
        return Ok(off as u64);
    }
    Err(Error::BadDwarfLocation)
}

/// Decodes a frame-slot location: `call_frame_cfa` alone is offset 0,
/// `call_frame_cfa, consts s, plus` is offset `s`. Anything else is not a
/// frame slot.
fn frame_offset_from_expr(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes[0] != gim_con::DW_OP_call_frame_cfa.0 {
        return None;
    }
    if bytes.len() == 1 {
        return Some(0);
    }
    if bytes.len() >= 3
        && bytes[1] == gim_con::DW_OP_consts.0
        && bytes[bytes.len() - 1] == gim_con::DW_OP_plus.0
    {
        let (rest, v) = read_sleb(&bytes[2..bytes.len() - 1])?;
        if rest.is_empty() {
            return Some(v);
        }
    }
    None
}

// -- DWARF walk --------------------------------------------------------

struct RawMember {
    offset: u64,
    name: String,
    ty: Option<SectionOffset>,
}

enum RawType {
    Base {
        name: String,
        encoding: gimli::DwAte,
        size: u64,
    },
    Ptr {
        name: String,
        elem: Option<SectionOffset>,
    },
    Struct {
        name: String,
        size: u64,
        members: Vec<RawMember>,
    },
    Array {
        name: String,
        size: u64,
        elem: Option<SectionOffset>,
    },
    Typedef {
        name: String,
        target: Option<SectionOffset>,
    },
    Subroutine {
        name: String,
    },
}

struct RawVar {
    addr: u64,
    name: String,
    ty: Option<SectionOffset>,
}

#[derive(Default)]
struct RawLayout {
    locals: Vec<RawSlot>,
    args: Vec<RawSlot>,
}

struct RawSlot {
    offset: u64,
    name: String,
    ty: Option<SectionOffset>,
}

#[derive(Default)]
struct Collector {
    types: BTreeMap<SectionOffset, RawType>,
    globals: Vec<RawVar>,
    layouts: BTreeMap<String, RawLayout>,
}

/// Parses the executable's DWARF info into a [`DwarfInfo`].
///
/// Pass 1 collects a skeletal record per type entry, keyed by its offset in
/// the debug sections; pass 2 (in `finalize`) resolves cross-references
/// into graph slots and appends the synthetic closure types.
pub(crate) fn load_executable(
    path: &Path,
    endian: gimli::RunTimeEndian,
    ptr_size: u64,
) -> Result<DwarfInfo, Error> {
    let data = std::fs::read(path)?;
    let object = object::File::parse(&*data)?;

    let load_section = |id: gimli::SectionId| -> Result<RtReader, Error> {
        let cow = object
            .section_by_name(id.name())
            .map(|sect| sect.uncompressed_data())
            .transpose()?
            .unwrap_or_default();
        Ok(gimli::EndianReader::new(Arc::from(cow), endian))
    };
    let dwarf = gimli::Dwarf::load(load_section)?;

    let mut collector = Collector::default();

    let mut iter = dwarf.units();
    while let Some(header) = iter.next()? {
        let unit = dwarf.unit(header)?;
        let mut entries = unit.entries();
        // Step onto the unit root, then walk its children.
        if entries.next_entry()?.is_none() || entries.current().is_none() {
            continue;
        }
        while let Some(()) = entries.next_entry()? {
            if entries.current().is_none() {
                break;
            }
            handle_die(
                &dwarf,
                &unit,
                &mut entries,
                &mut collector,
                endian,
                ptr_size,
            )?;
        }
    }

    finalize(collector, ptr_size)
}

fn handle_die(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    collector: &mut Collector,
    endian: gimli::RunTimeEndian,
    ptr_size: u64,
) -> Result<(), Error> {
    let Some(entry) = cursor.current() else {
        return Ok(());
    };
    match entry.tag() {
        gim_con::DW_TAG_base_type => {
            parse_base_type(dwarf, unit, cursor, collector)
        }
        gim_con::DW_TAG_pointer_type => {
            parse_pointer_type(dwarf, unit, cursor, collector)
        }
        gim_con::DW_TAG_structure_type => {
            parse_structure_type(dwarf, unit, cursor, collector)
        }
        gim_con::DW_TAG_array_type => {
            parse_array_type(dwarf, unit, cursor, collector)
        }
        gim_con::DW_TAG_typedef => {
            parse_typedef(dwarf, unit, cursor, collector)
        }
        gim_con::DW_TAG_subroutine_type => {
            parse_subroutine_type(dwarf, unit, cursor, collector)
        }
        gim_con::DW_TAG_subprogram => {
            parse_subprogram(dwarf, unit, cursor, collector)
        }
        gim_con::DW_TAG_variable => {
            parse_global_variable(dwarf, unit, cursor, collector, endian, ptr_size)
        }
        _ => skip_entry(cursor),
    }
}

/// Skips the current entry and its whole subtree.
fn skip_entry(
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
) -> Result<(), Error> {
    let Some(entry) = cursor.current() else {
        return Ok(());
    };
    if entry.has_children() {
        while let Some(()) = cursor.next_entry()? {
            if cursor.current().is_some() {
                skip_entry(cursor)?;
            } else {
                break;
            }
        }
    }
    Ok(())
}

fn attr_string(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    value: gimli::AttributeValue<RtReader>,
) -> Result<String, Error> {
    let r = dwarf.attr_string(unit, value)?;
    Ok(r.to_string_lossy()?.into_owned())
}

fn type_ref(
    unit: &gimli::Unit<RtReader>,
    value: gimli::AttributeValue<RtReader>,
) -> Option<SectionOffset> {
    match value {
        gimli::AttributeValue::UnitRef(o) => {
            Some(o.to_unit_section_offset(unit))
        }
        gimli::AttributeValue::DebugInfoRef(o) => Some(o.into()),
        _ => None,
    }
}

fn exprloc_bytes(
    attr: &gimli::Attribute<RtReader>,
) -> Result<Option<Vec<u8>>, Error> {
    let Some(e) = attr.exprloc_value() else {
        return Ok(None);
    };
    Ok(Some(e.0.to_slice()?.into_owned()))
}

fn parse_base_type(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    collector: &mut Collector,
) -> Result<(), Error> {
    let entry = cursor.current().expect("cursor positioned by caller");
    let offset = entry.offset().to_unit_section_offset(unit);

    let mut name = None;
    let mut size = None;
    let mut encoding = None;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_byte_size => {
                size = attr.value().udata_value();
            }
            gim_con::DW_AT_encoding => {
                if let gimli::AttributeValue::Encoding(e) = attr.value() {
                    encoding = Some(e);
                }
            }
            _ => (),
        }
    }

    match (size, encoding) {
        (Some(size), Some(encoding)) => {
            collector.types.insert(
                offset,
                RawType::Base {
                    name: name.unwrap_or_default(),
                    encoding,
                    size,
                },
            );
        }
        _ => warn!(?offset, "base type without size or encoding, skipped"),
    }
    skip_entry(cursor)
}

fn parse_pointer_type(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    collector: &mut Collector,
) -> Result<(), Error> {
    let entry = cursor.current().expect("cursor positioned by caller");
    let offset = entry.offset().to_unit_section_offset(unit);

    let mut name = None;
    let mut elem = None;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_type => {
                elem = type_ref(unit, attr.value());
            }
            _ => (),
        }
    }

    collector.types.insert(
        offset,
        RawType::Ptr {
            name: name.unwrap_or_default(),
            elem,
        },
    );
    skip_entry(cursor)
}

fn parse_structure_type(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    collector: &mut Collector,
) -> Result<(), Error> {
    let entry = cursor.current().expect("cursor positioned by caller");
    let offset = entry.offset().to_unit_section_offset(unit);

    let mut name = None;
    let mut size = None;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_byte_size => {
                size = attr.value().udata_value();
            }
            gim_con::DW_AT_declaration => {
                return skip_entry(cursor);
            }
            _ => (),
        }
    }
    let has_children = entry.has_children();

    let mut members = Vec::new();
    if has_children {
        while let Some(()) = cursor.next_entry()? {
            let Some(child) = cursor.current() else {
                break;
            };
            if child.tag() == gim_con::DW_TAG_member {
                members.push(parse_member(dwarf, unit, cursor)?);
            } else {
                skip_entry(cursor)?;
            }
        }
    }

    collector.types.insert(
        offset,
        RawType::Struct {
            name: rewrite_type_name(&name.unwrap_or_default()),
            size: size.unwrap_or(0),
            members,
        },
    );
    Ok(())
}

fn parse_member(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
) -> Result<RawMember, Error> {
    let entry = cursor.current().expect("cursor positioned by caller");

    let mut name = None;
    let mut ty = None;
    let mut offset = 0;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_type => {
                ty = type_ref(unit, attr.value());
            }
            gim_con::DW_AT_data_member_location => {
                offset = match attr.value().udata_value() {
                    Some(u) => u,
                    None => match exprloc_bytes(&attr)? {
                        Some(bytes) => member_offset_from_expr(&bytes)?,
                        None => return Err(Error::BadDwarfLocation),
                    },
                };
            }
            _ => (),
        }
    }
    skip_entry(cursor)?;

    Ok(RawMember {
        offset,
        name: name.unwrap_or_default(),
        ty,
    })
}

fn parse_array_type(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    collector: &mut Collector,
) -> Result<(), Error> {
    let entry = cursor.current().expect("cursor positioned by caller");
    let offset = entry.offset().to_unit_section_offset(unit);

    let mut name = None;
    let mut size = None;
    let mut elem = None;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_byte_size => {
                size = attr.value().udata_value();
            }
            gim_con::DW_AT_type => {
                elem = type_ref(unit, attr.value());
            }
            _ => (),
        }
    }

    collector.types.insert(
        offset,
        RawType::Array {
            name: name.unwrap_or_default(),
            size: size.unwrap_or(0),
            elem,
        },
    );
    skip_entry(cursor)
}

fn parse_typedef(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    collector: &mut Collector,
) -> Result<(), Error> {
    let entry = cursor.current().expect("cursor positioned by caller");
    let offset = entry.offset().to_unit_section_offset(unit);

    let mut name = None;
    let mut target = None;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_type => {
                target = type_ref(unit, attr.value());
            }
            _ => (),
        }
    }

    collector.types.insert(
        offset,
        RawType::Typedef {
            name: name.unwrap_or_default(),
            target,
        },
    );
    skip_entry(cursor)
}

fn parse_subroutine_type(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    collector: &mut Collector,
) -> Result<(), Error> {
    let entry = cursor.current().expect("cursor positioned by caller");
    let offset = entry.offset().to_unit_section_offset(unit);

    let mut name = None;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        if attr.name() == gim_con::DW_AT_name {
            name = Some(attr_string(dwarf, unit, attr.value())?);
        }
    }

    collector.types.insert(
        offset,
        RawType::Subroutine {
            name: name.unwrap_or_default(),
        },
    );
    skip_entry(cursor)
}

fn parse_subprogram(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    collector: &mut Collector,
) -> Result<(), Error> {
    let entry = cursor.current().expect("cursor positioned by caller");

    let mut name = None;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        if attr.name() == gim_con::DW_AT_name {
            name = Some(attr_string(dwarf, unit, attr.value())?);
        }
    }
    let has_children = entry.has_children();

    let Some(name) = name else {
        return skip_entry(cursor);
    };

    let mut layout = RawLayout::default();
    if has_children {
        parse_frame_children(dwarf, unit, cursor, &mut layout)?;
    }
    collector.layouts.insert(name, layout);
    Ok(())
}

/// Collects frame slots from a subprogram's subtree. Lexical blocks and
/// inlined subroutines contribute to the enclosing function's layout.
fn parse_frame_children(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    layout: &mut RawLayout,
) -> Result<(), Error> {
    while let Some(()) = cursor.next_entry()? {
        let Some(child) = cursor.current() else {
            break;
        };
        match child.tag() {
            gim_con::DW_TAG_variable => {
                if let Some(slot) = parse_frame_slot(dwarf, unit, cursor)? {
                    // Locals sit below the frame top; store the distance
                    // down so frame data can be indexed from its length.
                    layout.locals.push(RawSlot {
                        offset: slot.offset.wrapping_neg(),
                        ..slot
                    });
                }
            }
            gim_con::DW_TAG_formal_parameter => {
                if let Some(slot) = parse_frame_slot(dwarf, unit, cursor)? {
                    layout.args.push(slot);
                }
            }
            gim_con::DW_TAG_lexical_block
            | gim_con::DW_TAG_inlined_subroutine => {
                let has_children = child.has_children();
                if has_children {
                    parse_frame_children(dwarf, unit, cursor, layout)?;
                }
            }
            _ => skip_entry(cursor)?,
        }
    }
    Ok(())
}

/// One local or formal parameter, if it has a name and a CFA-relative
/// location. The returned offset is the raw signed CFA offset,
/// reinterpreted as `u64`.
fn parse_frame_slot(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
) -> Result<Option<RawSlot>, Error> {
    let entry = cursor.current().expect("cursor positioned by caller");

    let mut name = None;
    let mut ty = None;
    let mut location = None;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_type => {
                ty = type_ref(unit, attr.value());
            }
            gim_con::DW_AT_location => {
                location = exprloc_bytes(&attr)?;
            }
            _ => (),
        }
    }
    skip_entry(cursor)?;

    let (Some(name), Some(bytes)) = (name, location) else {
        return Ok(None);
    };
    let Some(offset) = frame_offset_from_expr(&bytes) else {
        return Ok(None);
    };
    Ok(Some(RawSlot {
        offset: offset as u64,
        name,
        ty,
    }))
}

fn parse_global_variable(
    dwarf: &gimli::Dwarf<RtReader>,
    unit: &gimli::Unit<RtReader>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtReader>,
    collector: &mut Collector,
    endian: gimli::RunTimeEndian,
    ptr_size: u64,
) -> Result<(), Error> {
    let entry = cursor.current().expect("cursor positioned by caller");

    let mut name = None;
    let mut ty = None;
    let mut location = None;
    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_type => {
                ty = type_ref(unit, attr.value());
            }
            gim_con::DW_AT_location => {
                location = exprloc_bytes(&attr)?;
            }
            _ => (),
        }
    }
    skip_entry(cursor)?;

    let (Some(name), Some(bytes)) = (name, location) else {
        return Ok(());
    };
    if bytes.first() != Some(&gim_con::DW_OP_addr.0) {
        return Ok(());
    }
    let Some(addr) = crate::read_word(endian, ptr_size, &bytes, 1) else {
        return Err(Error::BadDwarfLocation);
    };
    collector.globals.push(RawVar { addr, name, ty });
    Ok(())
}

/// Pass 2: resolves cross-references into graph slots, validates pointer
/// and typedef targets, and converts globals and frame layouts.
fn finalize(collector: Collector, ptr_size: u64) -> Result<DwarfInfo, Error> {
    let slot_of: BTreeMap<SectionOffset, TypeSlot> = collector
        .types
        .keys()
        .enumerate()
        .map(|(i, &o)| (o, TypeSlot(i)))
        .collect();
    let resolve = |o: Option<SectionOffset>| -> Option<TypeSlot> {
        o.and_then(|o| slot_of.get(&o).copied())
    };

    let mut nodes = Vec::with_capacity(collector.types.len() + 2);
    for raw in collector.types.values() {
        nodes.push(match raw {
            RawType::Base {
                name,
                encoding,
                size,
            } => TypeNode::new(
                name.clone(),
                DwarfKind::Base {
                    encoding: *encoding,
                    size: *size,
                },
            ),
            RawType::Ptr { name, elem } => {
                let elem = resolve(*elem);
                if elem.is_none()
                    && !UNTYPED_POINTERS.contains(&name.as_str())
                {
                    return Err(Error::UnresolvedTypeRef(name.clone()));
                }
                TypeNode::new(name.clone(), DwarfKind::Ptr { elem })
            }
            RawType::Struct {
                name,
                size,
                members,
            } => {
                let members = members
                    .iter()
                    .map(|m| {
                        let ty = resolve(m.ty).ok_or_else(|| {
                            Error::UnresolvedTypeRef(join_names(
                                name, &m.name,
                            ))
                        })?;
                        Ok(TypeMember {
                            offset: m.offset,
                            name: m.name.clone(),
                            ty,
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                TypeNode::new(
                    name.clone(),
                    DwarfKind::Struct {
                        size: *size,
                        members,
                    },
                )
            }
            RawType::Array { name, size, elem } => {
                let elem = resolve(*elem)
                    .ok_or_else(|| Error::UnresolvedTypeRef(name.clone()))?;
                TypeNode::new(
                    name.clone(),
                    DwarfKind::Array { size: *size, elem },
                )
            }
            RawType::Typedef { name, target } => {
                let target = resolve(*target)
                    .ok_or_else(|| Error::UnresolvedTypeRef(name.clone()))?;
                TypeNode::new(name.clone(), DwarfKind::Typedef { target })
            }
            RawType::Subroutine { name } => {
                TypeNode::new(name.clone(), DwarfKind::Subroutine)
            }
        });
    }
    let graph = TypeGraph::new(nodes, ptr_size);

    let globals = collector
        .globals
        .into_iter()
        .map(|v| {
            let ty = resolve(v.ty);
            if ty.is_none() && v.ty.is_some() {
                debug!(name = %v.name, "global with unmaterialised type");
            }
            GlobalVar {
                addr: v.addr,
                name: v.name,
                ty,
            }
        })
        .collect();

    let layouts = collector
        .layouts
        .into_iter()
        .map(|(fname, raw)| {
            let convert = |slots: Vec<RawSlot>| {
                slots
                    .into_iter()
                    .filter_map(|s| {
                        let ty = resolve(s.ty)?;
                        Some(TypeMember {
                            offset: s.offset,
                            name: s.name,
                            ty,
                        })
                    })
                    .collect()
            };
            (
                fname,
                FrameLayout {
                    locals: convert(raw.locals),
                    args: convert(raw.args),
                },
            )
        })
        .collect();

    Ok(DwarfInfo {
        graph,
        globals,
        layouts,
    })
}
