//! Parameter codec: host values -> typed wire values.
//!
//! Host values come from the scene documents as JSON and are classified once
//! ([`HostValue::from_json`]); the declared renderer type then decides how they
//! are written. Nothing here touches the filesystem.

use std::path::Path;

use serde_json::Value;

use crate::{error::UnsupportedTypeError, registry::RiType};

/// Extension of textures produced by the texture optimiser.
pub const TEXTURE_EXTENSION: &str = "tex";

/// Row-major 4x4 matrix, the host's native storage.
pub type Matrix4 = [[f64; 4]; 4];

pub const IDENTITY: Matrix4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// A parameter value as the host stores it.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Flat numeric sequence: vectors, colors, eulers, plain float arrays.
    Floats(Vec<f64>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
    /// Array of fixed-size tuples, e.g. a list of colors.
    Tuples { arity: usize, values: Vec<f64> },
    Matrix(Matrix4),
    /// A JSON shape with no renderer mapping (null, object, mixed arrays).
    Unmapped(&'static str),
}

impl HostValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => HostValue::Unmapped("null"),
            Value::Bool(b) => HostValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => HostValue::Int(i),
                None => n.as_f64().map_or(HostValue::Unmapped("number"), HostValue::Float),
            },
            Value::String(s) => HostValue::String(s.clone()),
            Value::Object(_) => HostValue::Unmapped("object"),
            Value::Array(items) => array_from_json(items),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::String(_) => "string",
            HostValue::Floats(_) => "float array",
            HostValue::Ints(_) => "int array",
            HostValue::Strings(_) => "string array",
            HostValue::Tuples { .. } => "tuple array",
            HostValue::Matrix(_) => "matrix",
            HostValue::Unmapped(kind) => kind,
        }
    }
}

fn array_from_json(items: &[Value]) -> HostValue {
    if items.is_empty() {
        return HostValue::Floats(Vec::new());
    }
    if items.iter().all(Value::is_i64) {
        return HostValue::Ints(items.iter().filter_map(Value::as_i64).collect());
    }
    if items.iter().all(Value::is_number) {
        return HostValue::Floats(items.iter().filter_map(Value::as_f64).collect());
    }
    if items.iter().all(Value::is_string) {
        return HostValue::Strings(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        );
    }

    let rows: Option<Vec<Vec<f64>>> = items
        .iter()
        .map(|row| {
            row.as_array()
                .and_then(|r| r.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>())
        })
        .collect();
    let Some(rows) = rows else {
        return HostValue::Unmapped("mixed array");
    };
    let arity = rows[0].len();
    if arity == 0 || rows.iter().any(|r| r.len() != arity) {
        return HostValue::Unmapped("ragged array");
    }
    if rows.len() == 4 && arity == 4 {
        let mut m = [[0.0; 4]; 4];
        for (i, row) in rows.iter().enumerate() {
            m[i].copy_from_slice(row);
        }
        return HostValue::Matrix(m);
    }
    HostValue::Tuples {
        arity,
        values: rows.into_iter().flatten().collect(),
    }
}

/// Typed value as written on the wire. Every wire value is a sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Strings(Vec<String>),
}

impl WireValue {
    pub fn string(s: impl Into<String>) -> Self {
        WireValue::Strings(vec![s.into()])
    }

    pub fn len(&self) -> usize {
        match self {
            WireValue::Ints(v) => v.len(),
            WireValue::Floats(v) => v.len(),
            WireValue::Strings(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 16 numbers in the renderer's column order.
pub fn column_major(m: &Matrix4) -> Vec<f64> {
    let mut out = Vec::with_capacity(16);
    for col in 0..4 {
        for row in m {
            out.push(row[col]);
        }
    }
    out
}

/// Encode `value` for a parameter declared as `hint`.
pub fn encode(value: &HostValue, hint: RiType) -> Result<WireValue, UnsupportedTypeError> {
    let unsupported = || UnsupportedTypeError {
        found: value.kind().to_string(),
        hint,
    };

    match hint {
        RiType::Int => match value {
            HostValue::Int(i) => Ok(WireValue::Ints(vec![*i])),
            // Stored as a generic float, declared integer: truncate like the host does.
            HostValue::Float(f) => truncate(*f).map(|i| WireValue::Ints(vec![i])).ok_or_else(unsupported),
            HostValue::Bool(b) => Ok(WireValue::Ints(vec![i64::from(*b)])),
            HostValue::Ints(v) => Ok(WireValue::Ints(v.clone())),
            HostValue::Floats(v) => v
                .iter()
                .map(|f| truncate(*f))
                .collect::<Option<Vec<i64>>>()
                .map(WireValue::Ints)
                .ok_or_else(unsupported),
            _ => Err(unsupported()),
        },
        _ if !value_is_finite(value) => Err(UnsupportedTypeError {
            found: format!("non-finite {}", value.kind()),
            hint,
        }),
        RiType::Float => match value {
            HostValue::Float(f) => Ok(WireValue::Floats(vec![*f])),
            HostValue::Int(i) => Ok(WireValue::Floats(vec![*i as f64])),
            HostValue::Bool(b) => Ok(WireValue::Floats(vec![if *b { 1.0 } else { 0.0 }])),
            HostValue::Floats(v) => Ok(WireValue::Floats(v.clone())),
            HostValue::Ints(v) => Ok(WireValue::Floats(v.iter().map(|i| *i as f64).collect())),
            _ => Err(unsupported()),
        },
        RiType::Color | RiType::Point | RiType::Vector | RiType::Normal => {
            let flat = match value {
                HostValue::Floats(v) => v.clone(),
                HostValue::Ints(v) => v.iter().map(|i| *i as f64).collect(),
                HostValue::Tuples { arity: 3, values } => values.clone(),
                _ => return Err(unsupported()),
            };
            if flat.is_empty() || flat.len() % 3 != 0 {
                return Err(unsupported());
            }
            Ok(WireValue::Floats(flat))
        }
        RiType::Matrix => match value {
            HostValue::Matrix(m) => Ok(WireValue::Floats(column_major(m))),
            HostValue::Floats(v) if v.len() == 16 => {
                let mut m = [[0.0; 4]; 4];
                for (i, row) in m.iter_mut().enumerate() {
                    row.copy_from_slice(&v[i * 4..i * 4 + 4]);
                }
                Ok(WireValue::Floats(column_major(&m)))
            }
            _ => Err(unsupported()),
        },
        RiType::String | RiType::Struct => match value {
            HostValue::String(s) => Ok(WireValue::string(s.clone())),
            HostValue::Strings(v) => Ok(WireValue::Strings(v.clone())),
            _ => Err(unsupported()),
        },
    }
}

/// Integer part of `f`, or `None` when it is not finite or does not fit an `i64`.
fn truncate(f: f64) -> Option<i64> {
    let t = f.trunc();
    // i64::MAX as f64 rounds up to 2^63, which is already out of range.
    (t.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64).then_some(t as i64)
}

fn value_is_finite(value: &HostValue) -> bool {
    match value {
        HostValue::Float(f) => f.is_finite(),
        HostValue::Floats(v) | HostValue::Tuples { values: v, .. } => v.iter().all(|f| f.is_finite()),
        HostValue::Matrix(m) => m.iter().flatten().all(|f| f.is_finite()),
        _ => true,
    }
}

fn is_empty_array(value: &HostValue) -> bool {
    match value {
        HostValue::Floats(v) | HostValue::Tuples { values: v, .. } => v.is_empty(),
        HostValue::Ints(v) => v.is_empty(),
        HostValue::Strings(v) => v.is_empty(),
        _ => false,
    }
}

/// Encode an array parameter. Returns the wire value and the element count to declare,
/// which always follows the actual value rather than any declared maximum.
pub fn encode_array(value: &HostValue, hint: RiType) -> Result<(WireValue, usize), UnsupportedTypeError> {
    let wire = match (value, hint) {
        // An empty array is declared with a count of zero, whatever its element type.
        _ if is_empty_array(value) => match hint {
            RiType::Int => WireValue::Ints(Vec::new()),
            RiType::String | RiType::Struct => WireValue::Strings(Vec::new()),
            _ => WireValue::Floats(Vec::new()),
        },
        (HostValue::Tuples { arity, values }, RiType::Matrix) if *arity == 4 && values.len() % 16 == 0 && value_is_finite(value) => {
            let mut flat = Vec::with_capacity(values.len());
            for chunk in values.chunks(16) {
                let mut m = [[0.0; 4]; 4];
                for (i, row) in m.iter_mut().enumerate() {
                    row.copy_from_slice(&chunk[i * 4..i * 4 + 4]);
                }
                flat.extend(column_major(&m));
            }
            WireValue::Floats(flat)
        }
        (HostValue::Float(_) | HostValue::Int(_) | HostValue::Bool(_) | HostValue::String(_), _) => {
            return Err(UnsupportedTypeError {
                found: value.kind().to_string(),
                hint,
            });
        }
        _ => encode(value, hint)?,
    };
    let count = wire.len() / hint.arity();
    Ok((wire, count))
}

/// Texture file name as the renderer will find it in the texture cache:
/// directory stripped, extension replaced by [`TEXTURE_EXTENSION`].
pub fn texture_file_name(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let p = Path::new(path);
    let stem = p
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path);
    format!("{stem}.{TEXTURE_EXTENSION}")
}

pub fn is_optimised_texture(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(TEXTURE_EXTENSION))
}

pub fn param_key(ty: RiType, name: &str) -> String {
    format!("{ty} {name}")
}

pub fn array_param_key(ty: RiType, count: usize, name: &str) -> String {
    format!("{ty}[{count}] {name}")
}

pub fn reference_key(ty: RiType, name: &str) -> String {
    format!("reference {ty} {name}")
}
