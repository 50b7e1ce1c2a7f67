//! Property-based round-trip tests for the binary codec, grounded on the
//! varint round-trip proptest style used for commit-log framing elsewhere
//! in the pack.

use bedrock::codec::octets::Octets;
use bedrock::codec::record::{encode_record_value, decode_record_value, read_fields, read_int_value, read_string_value, write_int_field, write_string_field, write_terminator, Bean};
use bedrock::codec::varint::{marshal_uvarint32, marshal_varint, unmarshal_uvarint32, unmarshal_varint, SIGNED_MAX, SIGNED_MIN};
use bedrock::codec::{decode_table_key, encode_table_key};
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Widget {
    id: i64,
    name: String,
}

impl Bean for Widget {
    fn marshal(&self, out: &mut Octets) {
        write_int_field(out, 1, self.id);
        write_string_field(out, 2, &self.name);
        write_terminator(out);
    }

    fn unmarshal(inp: &mut Octets) -> bedrock::error::Result<Self> {
        let mut id = 0;
        let mut name = String::new();
        read_fields(inp, |inp, tag, _kind| match tag {
            1 => {
                id = read_int_value(inp)?;
                Ok(true)
            }
            2 => {
                name = read_string_value(inp)?;
                Ok(true)
            }
            _ => Ok(false),
        })?;
        Ok(Widget { id, name })
    }
}

proptest! {
    #[test]
    fn signed_varint_roundtrips(v in SIGNED_MIN..=SIGNED_MAX) {
        let mut out = Octets::new();
        marshal_varint(&mut out, v);
        let back = unmarshal_varint(&mut out).unwrap();
        prop_assert_eq!(back, v);
    }

    #[test]
    fn signed_varint_clamps_any_i64(v: i64) {
        let mut out = Octets::new();
        marshal_varint(&mut out, v);
        let back = unmarshal_varint(&mut out).unwrap();
        prop_assert_eq!(back, v.clamp(SIGNED_MIN, SIGNED_MAX));
    }

    #[test]
    fn uvarint32_roundtrips(v: u32) {
        let mut out = Octets::new();
        marshal_uvarint32(&mut out, v);
        let back = unmarshal_uvarint32(&mut out).unwrap();
        prop_assert_eq!(back, v);
    }

    #[test]
    fn table_key_roundtrips(table_id: u32, key in prop::collection::vec(any::<u8>(), 0..32)) {
        let encoded = encode_table_key(table_id, &key);
        let (back_id, back_key) = decode_table_key(&encoded).unwrap();
        prop_assert_eq!(back_id, table_id);
        prop_assert_eq!(back_key, key);
    }

    #[test]
    fn widget_record_roundtrips(id: i64, name in "[a-zA-Z0-9 ]{0,32}") {
        let widget = Widget { id: id.clamp(SIGNED_MIN, SIGNED_MAX), name };
        let bytes = encode_record_value(&widget);
        let back: Widget = decode_record_value(&bytes).unwrap();
        prop_assert_eq!(back, widget);
    }
}
