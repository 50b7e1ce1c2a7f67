//! The tagged field stream used for record (`Bean`) values and, unchanged,
//! for wire messages.
//!
//! A record body is a sequence of `uvarint(tag << 2 | kind) || payload`
//! entries terminated by a single zero byte (tag 0, kind 0 encodes to the
//! same single `0x00` byte, so the terminator falls naturally out of the
//! header encoding as long as real tags start at 1). `kind` selects one of
//! four payload shapes: `Int` (signed varint), `String` (length-prefixed
//! bytes, also used for raw byte blobs), `Bean` (a nested, self-terminating
//! stream), or `Var` (a one-byte sub-header introducing a homogeneous list
//! or map container).

use std::collections::BTreeMap;

use super::octets::Octets;
use super::varint::{marshal_uvarint32, marshal_varint, unmarshal_uvarint32, unmarshal_varint};
use crate::error::{Error, Result};

/// The four field kinds a tag header can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldKind {
    Int = 0,
    String = 1,
    Bean = 2,
    Var = 3,
}

/// Element/key/value kinds usable inside a `Var` container.
const KIND_INT: u8 = 0;
const KIND_STRING: u8 = 1;
const KIND_BEAN: u8 = 2;
// 3 is reserved and always a format error.
const KIND_F32: u8 = 4;
const KIND_F64: u8 = 5;

fn check_container_kind(kind: u8) -> Result<()> {
    match kind {
        KIND_INT | KIND_STRING | KIND_BEAN | KIND_F32 | KIND_F64 => Ok(()),
        _ => Err(Error::MarshalBadFormat(format!("reserved container element kind {kind}"))),
    }
}

/// A record type with a hand-written (or code-generated, in the excluded
/// collaborator's world) tagged field stream encoding. Implementations call
/// the `write_*_field` / `read_fields` helpers in this module.
pub trait Bean: Sized {
    /// Append this record's field stream, including the terminator, to `out`.
    fn marshal(&self, out: &mut Octets);
    /// Read a field stream (through its terminator) into a fresh instance.
    fn unmarshal(inp: &mut Octets) -> Result<Self>;
}

/// Values that can appear as list elements or map keys/values inside a
/// `Var` container. `Bean` elements go through the dedicated
/// `write_list_bean_field`/`read_list_bean_field` helpers instead, since a
/// blanket impl here would conflict with the concrete scalar impls.
pub trait ContainerElem: Sized {
    const KIND: u8;
    fn write_elem(&self, out: &mut Octets);
    fn read_elem(inp: &mut Octets) -> Result<Self>;
}

impl ContainerElem for i64 {
    const KIND: u8 = KIND_INT;
    fn write_elem(&self, out: &mut Octets) {
        marshal_varint(out, *self);
    }
    fn read_elem(inp: &mut Octets) -> Result<Self> {
        unmarshal_varint(inp)
    }
}

impl ContainerElem for String {
    const KIND: u8 = KIND_STRING;
    fn write_elem(&self, out: &mut Octets) {
        marshal_uvarint32(out, self.len() as u32);
        out.put_slice(self.as_bytes());
    }
    fn read_elem(inp: &mut Octets) -> Result<Self> {
        read_string_value(inp)
    }
}

impl ContainerElem for f32 {
    const KIND: u8 = KIND_F32;
    fn write_elem(&self, out: &mut Octets) {
        out.put_f32_le(*self);
    }
    fn read_elem(inp: &mut Octets) -> Result<Self> {
        inp.get_f32_le()
    }
}

impl ContainerElem for f64 {
    const KIND: u8 = KIND_F64;
    fn write_elem(&self, out: &mut Octets) {
        out.put_f64_le(*self);
    }
    fn read_elem(inp: &mut Octets) -> Result<Self> {
        inp.get_f64_le()
    }
}

fn write_field_header(out: &mut Octets, tag: u32, kind: FieldKind) {
    marshal_uvarint32(out, (tag << 2) | kind as u32);
}

/// Append the stream terminator (a single zero byte).
pub fn write_terminator(out: &mut Octets) {
    out.put_u8(0);
}

pub fn write_int_field(out: &mut Octets, tag: u32, v: i64) {
    write_field_header(out, tag, FieldKind::Int);
    marshal_varint(out, v);
}

pub fn write_bool_field(out: &mut Octets, tag: u32, v: bool) {
    write_int_field(out, tag, v as i64);
}

pub fn write_string_field(out: &mut Octets, tag: u32, v: &str) {
    write_field_header(out, tag, FieldKind::String);
    marshal_uvarint32(out, v.len() as u32);
    out.put_slice(v.as_bytes());
}

pub fn write_bytes_field(out: &mut Octets, tag: u32, v: &[u8]) {
    write_field_header(out, tag, FieldKind::String);
    marshal_uvarint32(out, v.len() as u32);
    out.put_slice(v);
}

pub fn write_bean_field<B: Bean>(out: &mut Octets, tag: u32, v: &B) {
    write_field_header(out, tag, FieldKind::Bean);
    v.marshal(out);
}

pub fn write_list_field<T: ContainerElem>(out: &mut Octets, tag: u32, items: &[T]) {
    write_field_header(out, tag, FieldKind::Var);
    out.put_u8(T::KIND);
    marshal_uvarint32(out, items.len() as u32);
    for item in items {
        item.write_elem(out);
    }
}

pub fn write_list_bean_field<B: Bean>(out: &mut Octets, tag: u32, items: &[B]) {
    write_field_header(out, tag, FieldKind::Var);
    out.put_u8(KIND_BEAN);
    marshal_uvarint32(out, items.len() as u32);
    for item in items {
        item.marshal(out);
    }
}

pub fn write_map_field<K: ContainerElem, V: ContainerElem>(out: &mut Octets, tag: u32, map: &BTreeMap<K, V>)
where
    K: Ord,
{
    write_field_header(out, tag, FieldKind::Var);
    out.put_u8(0x80 | (K::KIND << 3) | V::KIND);
    marshal_uvarint32(out, map.len() as u32);
    for (k, v) in map {
        k.write_elem(out);
        v.write_elem(out);
    }
}

pub fn read_int_value(inp: &mut Octets) -> Result<i64> {
    unmarshal_varint(inp)
}

pub fn read_bool_value(inp: &mut Octets) -> Result<bool> {
    Ok(unmarshal_varint(inp)? != 0)
}

pub fn read_string_value(inp: &mut Octets) -> Result<String> {
    let n = unmarshal_uvarint32(inp)? as usize;
    let bytes = inp.get_bytes(n)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::MarshalBadFormat(e.to_string()))
}

pub fn read_bytes_value(inp: &mut Octets) -> Result<Vec<u8>> {
    let n = unmarshal_uvarint32(inp)? as usize;
    Ok(inp.get_bytes(n)?.to_vec())
}

pub fn read_bean_value<B: Bean>(inp: &mut Octets) -> Result<B> {
    B::unmarshal(inp)
}

pub fn read_list_field<T: ContainerElem>(inp: &mut Octets) -> Result<Vec<T>> {
    let sub = inp.get_u8()?;
    if sub != T::KIND {
        return Err(Error::MarshalBadFormat(format!(
            "expected list element kind {}, found sub-header 0x{:02X}",
            T::KIND,
            sub
        )));
    }
    let n = unmarshal_uvarint32(inp)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(T::read_elem(inp)?);
    }
    Ok(out)
}

pub fn read_list_bean_field<B: Bean>(inp: &mut Octets) -> Result<Vec<B>> {
    let sub = inp.get_u8()?;
    if sub != KIND_BEAN {
        return Err(Error::MarshalBadFormat(format!("expected list-of-bean sub-header, found 0x{:02X}", sub)));
    }
    let n = unmarshal_uvarint32(inp)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(B::unmarshal(inp)?);
    }
    Ok(out)
}

pub fn read_map_field<K: ContainerElem + Ord, V: ContainerElem>(inp: &mut Octets) -> Result<BTreeMap<K, V>> {
    let sub = inp.get_u8()?;
    if sub & 0x80 == 0 {
        return Err(Error::MarshalBadFormat(format!("expected map sub-header, found 0x{:02X}", sub)));
    }
    let key_kind = (sub >> 3) & 0x7;
    let val_kind = sub & 0x7;
    if key_kind != K::KIND || val_kind != V::KIND {
        return Err(Error::MarshalBadFormat("map key/value kind mismatch".into()));
    }
    let n = unmarshal_uvarint32(inp)? as usize;
    let mut out = BTreeMap::new();
    for _ in 0..n {
        let k = K::read_elem(inp)?;
        let v = V::read_elem(inp)?;
        out.insert(k, v);
    }
    Ok(out)
}

/// Drive a `Bean::unmarshal` loop. `handle` is offered each `(tag, kind)`
/// header in turn and must return `Ok(true)` if it consumed the payload
/// itself; returning `Ok(false)` (an unrecognized tag) causes the payload to
/// be skipped generically, so unknown fields never cause a decode failure.
pub fn read_fields(inp: &mut Octets, mut handle: impl FnMut(&mut Octets, u32, u8) -> Result<bool>) -> Result<()> {
    loop {
        let header = unmarshal_uvarint32(inp)?;
        if header == 0 {
            return Ok(());
        }
        let tag = header >> 2;
        let kind = (header & 0x3) as u8;
        if !handle(inp, tag, kind)? {
            skip_field(inp, kind)?;
        }
    }
}

/// Skip one field's payload given its `kind`, recursing into nested beans
/// and containers as needed. Used both by [`read_fields`] for unrecognized
/// tags and available directly for callers implementing their own dispatch.
pub fn skip_field(inp: &mut Octets, kind: u8) -> Result<()> {
    match kind {
        0 => {
            unmarshal_varint(inp)?;
            Ok(())
        }
        1 => {
            let n = unmarshal_uvarint32(inp)? as usize;
            inp.skip(n)
        }
        2 => skip_bean(inp),
        3 => skip_var(inp),
        _ => Err(Error::MarshalBadFormat(format!("reserved field kind {kind}"))),
    }
}

fn skip_bean(inp: &mut Octets) -> Result<()> {
    loop {
        let header = unmarshal_uvarint32(inp)?;
        if header == 0 {
            return Ok(());
        }
        let kind = (header & 0x3) as u8;
        skip_field(inp, kind)?;
    }
}

fn skip_container_elem(inp: &mut Octets, kind: u8) -> Result<()> {
    match kind {
        KIND_INT => {
            unmarshal_varint(inp)?;
            Ok(())
        }
        KIND_STRING => {
            let n = unmarshal_uvarint32(inp)? as usize;
            inp.skip(n)
        }
        KIND_BEAN => skip_bean(inp),
        KIND_F32 => inp.skip(4),
        KIND_F64 => inp.skip(8),
        _ => Err(Error::MarshalBadFormat(format!("reserved container element kind {kind}"))),
    }
}

/// Skip a `Var` field's payload: a one-byte sub-header (list or map) plus
/// its elements.
pub fn skip_var(inp: &mut Octets) -> Result<()> {
    let sub = inp.get_u8()?;
    if sub & 0x80 == 0 {
        check_container_kind(sub)?;
        let n = unmarshal_uvarint32(inp)? as usize;
        for _ in 0..n {
            skip_container_elem(inp, sub)?;
        }
    } else {
        let key_kind = (sub >> 3) & 0x7;
        let val_kind = sub & 0x7;
        check_container_kind(key_kind)?;
        check_container_kind(val_kind)?;
        let n = unmarshal_uvarint32(inp)? as usize;
        for _ in 0..n {
            skip_container_elem(inp, key_kind)?;
            skip_container_elem(inp, val_kind)?;
        }
    }
    Ok(())
}

/// Current (and only) record value wire format.
pub const FORMAT_CURRENT: u8 = 0x00;

/// Encode a full record value: `u8 format || tagged field stream`.
pub fn encode_record_value<B: Bean>(bean: &B) -> Vec<u8> {
    let mut out = Octets::with_capacity(64);
    out.put_u8(FORMAT_CURRENT);
    bean.marshal(&mut out);
    out.into_vec()
}

/// Decode a full record value written by [`encode_record_value`].
pub fn decode_record_value<B: Bean>(bytes: &[u8]) -> Result<B> {
    let mut inp = Octets::from_vec(bytes.to_vec());
    let format = inp.get_u8()?;
    if format != FORMAT_CURRENT {
        return Err(Error::MarshalBadFormat(format!("unsupported record format {format}")));
    }
    B::unmarshal(&mut inp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Point {
        x: i64,
        y: i64,
        label: String,
    }

    impl Bean for Point {
        fn marshal(&self, out: &mut Octets) {
            write_int_field(out, 1, self.x);
            write_int_field(out, 2, self.y);
            write_string_field(out, 3, &self.label);
            write_terminator(out);
        }

        fn unmarshal(inp: &mut Octets) -> Result<Self> {
            let mut x = 0;
            let mut y = 0;
            let mut label = String::new();
            read_fields(inp, |inp, tag, _kind| {
                match tag {
                    1 => x = read_int_value(inp)?,
                    2 => y = read_int_value(inp)?,
                    3 => label = read_string_value(inp)?,
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(Point { x, y, label })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Shape {
        points: Vec<Point>,
        weights: BTreeMap<i64, String>,
    }

    impl Bean for Shape {
        fn marshal(&self, out: &mut Octets) {
            write_list_bean_field(out, 1, &self.points);
            write_map_field(out, 2, &self.weights);
            write_terminator(out);
        }

        fn unmarshal(inp: &mut Octets) -> Result<Self> {
            let mut points = Vec::new();
            let mut weights = BTreeMap::new();
            read_fields(inp, |inp, tag, _kind| {
                match tag {
                    1 => points = read_list_bean_field(inp)?,
                    2 => weights = read_map_field(inp)?,
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(Shape { points, weights })
        }
    }

    #[test]
    fn record_roundtrip() {
        let p = Point { x: -5, y: 1000, label: "origin".into() };
        let bytes = encode_record_value(&p);
        let back: Point = decode_record_value(&bytes).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn nested_and_container_roundtrip() {
        let mut weights = BTreeMap::new();
        weights.insert(1, "a".to_string());
        weights.insert(2, "b".to_string());
        let s = Shape {
            points: vec![
                Point { x: 0, y: 0, label: "a".into() },
                Point { x: 1, y: 1, label: "b".into() },
            ],
            weights,
        };
        let bytes = encode_record_value(&s);
        let back: Shape = decode_record_value(&bytes).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn unknown_tags_are_skipped() {
        // Hand-build a stream with an unknown scalar tag, an unknown string
        // tag, an unknown nested bean tag, and an unknown list tag, plus one
        // tag `Point` actually understands.
        let mut out = Octets::new();
        write_int_field(&mut out, 99, 42); // unknown int
        write_string_field(&mut out, 98, "ignored"); // unknown string
        let nested = Point { x: 1, y: 2, label: "n".into() };
        write_bean_field(&mut out, 97, &nested); // unknown nested bean
        write_list_field(&mut out, 96, &[1i64, 2, 3]); // unknown list
        write_int_field(&mut out, 1, 7);
        write_int_field(&mut out, 2, 8);
        write_string_field(&mut out, 3, "kept");
        write_terminator(&mut out);

        let decoded = Point::unmarshal(&mut out).unwrap();
        assert_eq!(decoded, Point { x: 7, y: 8, label: "kept".into() });
    }

    #[test]
    fn underflow_on_truncated_stream() {
        let mut out = Octets::new();
        write_string_field(&mut out, 1, "hello");
        // Truncate the buffer so the declared string length overruns it.
        let mut truncated = out.as_slice().to_vec();
        truncated.truncate(truncated.len() - 2);
        let mut inp = Octets::from_vec(truncated);
        let header = unmarshal_uvarint32(&mut inp).unwrap();
        assert_eq!(header >> 2, 1);
        assert!(matches!(read_string_value(&mut inp), Err(Error::MarshalUnderflow)));
    }

    #[test]
    fn bad_format_on_reserved_container_kind() {
        let mut out = Octets::new();
        write_field_header(&mut out, 1, FieldKind::Var);
        out.put_u8(3); // reserved list element kind
        marshal_uvarint32(&mut out, 0);
        write_terminator(&mut out);
        let result = read_fields(&mut out, |_, _, _| Ok(false));
        assert!(matches!(result, Err(Error::MarshalBadFormat(_))));
    }
}
