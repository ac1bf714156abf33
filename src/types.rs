//! PostgreSQL type OIDs the proxy needs to know about.

pub const BOOL: i32 = 16;
pub const BYTEA: i32 = 17;
pub const INT8: i32 = 20;
pub const INT2: i32 = 21;
pub const INT4: i32 = 23;
pub const TEXT: i32 = 25;
pub const FLOAT4: i32 = 700;
pub const FLOAT8: i32 = 701;
pub const BPCHAR: i32 = 1042;
pub const VARCHAR: i32 = 1043;
pub const DATE: i32 = 1082;
pub const TIME: i32 = 1083;
pub const TIMESTAMP: i32 = 1114;
pub const TIMESTAMPTZ: i32 = 1184;
pub const NUMERIC: i32 = 1700;
pub const UUID: i32 = 2950;
pub const JSONB: i32 = 3802;

/// Resolves a type name as written in configuration files. Plain numbers are taken as OIDs.
pub fn oid_by_name(name: &str) -> Option<i32> {
    let normalized = name.trim().to_lowercase();
    if let Ok(oid) = normalized.parse::<i32>() {
        return Some(oid);
    }
    let oid = match normalized.as_str() {
        "bool" | "boolean" => BOOL,
        "bytea" => BYTEA,
        "int8" | "bigint" => INT8,
        "int2" | "smallint" => INT2,
        "int4" | "int" | "integer" => INT4,
        "text" => TEXT,
        "float4" | "real" => FLOAT4,
        "float8" | "double precision" => FLOAT8,
        "bpchar" | "char" | "character" => BPCHAR,
        "varchar" | "character varying" => VARCHAR,
        "date" => DATE,
        "time" => TIME,
        "timestamp" => TIMESTAMP,
        "timestamptz" => TIMESTAMPTZ,
        "numeric" | "decimal" => NUMERIC,
        "uuid" => UUID,
        "jsonb" => JSONB,
        _ => return None,
    };
    Some(oid)
}

/// `typlen` of the type, -1 for variable length ones.
pub fn default_size(oid: i32) -> i16 {
    match oid {
        BOOL => 1,
        INT2 => 2,
        INT4 | FLOAT4 | DATE => 4,
        INT8 | FLOAT8 | TIME | TIMESTAMP | TIMESTAMPTZ => 8,
        UUID => 16,
        _ => -1,
    }
}
