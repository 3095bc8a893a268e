//! PostgreSQL Type OID Constants
//!
//! Reference: https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat

/// PostgreSQL Type OIDs
pub mod oid {
    /// Parameter type left for the server to infer.
    pub const UNSPECIFIED: u32 = 0;

    // Boolean
    pub const BOOL: u32 = 16;

    // Bytes
    pub const BYTEA: u32 = 17;

    // Characters
    pub const CHAR: u32 = 18;
    pub const NAME: u32 = 19;

    // Integers
    pub const INT8: u32 = 20; // bigint
    pub const INT2: u32 = 21; // smallint
    pub const INT4: u32 = 23; // integer

    // Text
    pub const TEXT: u32 = 25;
    pub const VARCHAR: u32 = 1043;
    pub const BPCHAR: u32 = 1042; // blank-padded char

    // OID
    pub const OID: u32 = 26;

    // JSON
    pub const JSON: u32 = 114;
    pub const JSONB: u32 = 3802;

    // Geometry
    pub const POINT: u32 = 600;
    pub const LSEG: u32 = 601;
    pub const BOX: u32 = 603;
    pub const CIRCLE: u32 = 718;

    // Float
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;

    // Money
    pub const MONEY: u32 = 790;

    // Date/Time
    pub const DATE: u32 = 1082;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;

    // UUID
    pub const UUID: u32 = 2950;

    // Arrays
    pub const JSON_ARRAY: u32 = 199;
    pub const CIRCLE_ARRAY: u32 = 719;
    pub const MONEY_ARRAY: u32 = 791;
    pub const BOOL_ARRAY: u32 = 1000;
    pub const BYTEA_ARRAY: u32 = 1001;
    pub const CHAR_ARRAY: u32 = 1002;
    pub const NAME_ARRAY: u32 = 1003;
    pub const INT2_ARRAY: u32 = 1005;
    pub const INT4_ARRAY: u32 = 1007;
    pub const TEXT_ARRAY: u32 = 1009;
    pub const BPCHAR_ARRAY: u32 = 1014;
    pub const VARCHAR_ARRAY: u32 = 1015;
    pub const INT8_ARRAY: u32 = 1016;
    pub const POINT_ARRAY: u32 = 1017;
    pub const LSEG_ARRAY: u32 = 1018;
    pub const BOX_ARRAY: u32 = 1020;
    pub const FLOAT4_ARRAY: u32 = 1021;
    pub const FLOAT8_ARRAY: u32 = 1022;
    pub const OID_ARRAY: u32 = 1028;
    pub const TIMESTAMP_ARRAY: u32 = 1115;
    pub const DATE_ARRAY: u32 = 1182;
    pub const TIMESTAMPTZ_ARRAY: u32 = 1185;
    pub const UUID_ARRAY: u32 = 2951;
    pub const JSONB_ARRAY: u32 = 3807;
}

/// Map a built-in array OID to its element OID.
pub fn array_element_oid(array_oid: u32) -> Option<u32> {
    let element = match array_oid {
        oid::JSON_ARRAY => oid::JSON,
        oid::CIRCLE_ARRAY => oid::CIRCLE,
        oid::MONEY_ARRAY => oid::MONEY,
        oid::BOOL_ARRAY => oid::BOOL,
        oid::BYTEA_ARRAY => oid::BYTEA,
        oid::CHAR_ARRAY => oid::CHAR,
        oid::NAME_ARRAY => oid::NAME,
        oid::INT2_ARRAY => oid::INT2,
        oid::INT4_ARRAY => oid::INT4,
        oid::TEXT_ARRAY => oid::TEXT,
        oid::BPCHAR_ARRAY => oid::BPCHAR,
        oid::VARCHAR_ARRAY => oid::VARCHAR,
        oid::INT8_ARRAY => oid::INT8,
        oid::POINT_ARRAY => oid::POINT,
        oid::LSEG_ARRAY => oid::LSEG,
        oid::BOX_ARRAY => oid::BOX,
        oid::FLOAT4_ARRAY => oid::FLOAT4,
        oid::FLOAT8_ARRAY => oid::FLOAT8,
        oid::OID_ARRAY => oid::OID,
        oid::TIMESTAMP_ARRAY => oid::TIMESTAMP,
        oid::DATE_ARRAY => oid::DATE,
        oid::TIMESTAMPTZ_ARRAY => oid::TIMESTAMPTZ,
        oid::UUID_ARRAY => oid::UUID,
        oid::JSONB_ARRAY => oid::JSONB,
        _ => return None,
    };
    Some(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_element_oid() {
        assert_eq!(array_element_oid(oid::INT4_ARRAY), Some(oid::INT4));
        assert_eq!(array_element_oid(oid::JSONB_ARRAY), Some(oid::JSONB));
        assert_eq!(array_element_oid(oid::INT4), None);
    }
}
