//! Binary codec: the buffer primitive (`Octets`), the two varint schemes,
//! and the tagged field stream records are built from.

pub mod octets;
pub mod record;
pub mod varint;

pub use octets::Octets;
pub use record::{
    read_bean_value, read_bool_value, read_bytes_value, read_fields, read_int_value, read_list_bean_field,
    read_list_field, read_map_field, read_string_value, skip_field, skip_var, write_bean_field, write_bool_field,
    write_bytes_field, write_int_field, write_list_bean_field, write_list_field, write_map_field, write_string_field,
    write_terminator, Bean, ContainerElem, FieldKind,
};
pub use varint::{marshal_uvarint32, marshal_varint, skip_varint, unmarshal_uvarint32, unmarshal_varint};

/// Encode a key as `varuint(table_id) || key_bytes`, where `key_bytes` is
/// the caller-supplied already-encoded key (typically a single tagged
/// `Int`/`String` field payload or a small fixed encoding for composite
/// keys).
pub fn encode_table_key(table_id: u32, key_bytes: &[u8]) -> Vec<u8> {
    let mut out = Octets::with_capacity(5 + key_bytes.len());
    marshal_uvarint32(&mut out, table_id);
    out.put_slice(key_bytes);
    out.into_vec()
}

/// Split a `varuint(table_id) || key_bytes` blob back into its table id and
/// the remaining key bytes.
pub fn decode_table_key(bytes: &[u8]) -> crate::error::Result<(u32, Vec<u8>)> {
    let mut inp = Octets::from_vec(bytes.to_vec());
    let table_id = unmarshal_uvarint32(&mut inp)?;
    Ok((table_id, inp.remaining_slice().to_vec()))
}

/// Reserved table-id prefix byte `TableLong` uses for its id-counter entry,
/// so the counter never collides with a real record key.
pub const TABLE_LONG_ID_COUNTER_PREFIX: u8 = 0xF1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_key_roundtrip() {
        let key_bytes = b"somekey".to_vec();
        let encoded = encode_table_key(7, &key_bytes);
        let (table_id, back) = decode_table_key(&encoded).unwrap();
        assert_eq!(table_id, 7);
        assert_eq!(back, key_bytes);
    }
}
