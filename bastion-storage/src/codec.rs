//! Row codec: typed records to and from the CSV attachment format.
//!
//! Every table declares its columns up front. Decoding is driven by that
//! schema rather than by sniffing values, so `"0"`, `0` and `false` can never
//! be confused. Quoting follows RFC 4180: a field is wrapped in double quotes
//! when it contains a delimiter, quote, or line break, and embedded quotes
//! are doubled.
//!
//! Unset (optional, `None`) values are written as an empty unquoted field.
//! An empty string is always written as `""`, which keeps the two apart.

use bastion_core::{CodecError, Snowflake};

// ============================================================================
// SCHEMA
// ============================================================================

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// Free text.
    Text,
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// `true` / `false`.
    Boolean,
    /// Platform snowflake identifier.
    Id,
}

/// A column declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// Optional columns decode an empty field as [`Value::Unset`].
    pub optional: bool,
}

impl Column {
    /// A column that always holds a value.
    pub const fn required(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            optional: false,
        }
    }

    /// A column whose value may be unset.
    pub const fn optional(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            optional: true,
        }
    }

    fn zero_value(&self) -> Value {
        if self.optional {
            return Value::Unset;
        }
        match self.kind {
            ColumnKind::Text => Value::Text(String::new()),
            ColumnKind::Integer => Value::Integer(0),
            ColumnKind::Float => Value::Float(0.0),
            ColumnKind::Boolean => Value::Boolean(false),
            ColumnKind::Id => Value::Id(0),
        }
    }
}

/// A single typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unset,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Id(Snowflake),
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Unset, Into::into)
    }
}

/// A row type with a fixed schema.
///
/// `to_values` must return one value per entry of `COLUMNS`, in order.
pub trait Record: Clone + Send + Sync + 'static {
    /// Column declarations, in attachment order.
    const COLUMNS: &'static [Column];

    /// Flatten the record into column values.
    fn to_values(&self) -> Vec<Value>;

    /// Rebuild the record from decoded column values.
    fn from_values(row: RowValues<'_>) -> Result<Self, CodecError>;
}

/// Decoded values of one row, addressable by column name.
#[derive(Debug)]
pub struct RowValues<'a> {
    columns: &'static [Column],
    values: &'a [Value],
}

macro_rules! typed_accessors {
    ($($required:ident, $optional:ident, $variant:ident => $ty:ty;)*) => {
        $(
            #[doc = concat!("Read a required `", stringify!($variant), "` column.")]
            pub fn $required(&self, name: &str) -> Result<$ty, CodecError> {
                match self.get(name)? {
                    Value::$variant(v) => Ok(v.clone()),
                    other => Err(mismatch(name, other, stringify!($variant))),
                }
            }

            #[doc = concat!("Read an optional `", stringify!($variant), "` column.")]
            pub fn $optional(&self, name: &str) -> Result<Option<$ty>, CodecError> {
                match self.get(name)? {
                    Value::Unset => Ok(None),
                    Value::$variant(v) => Ok(Some(v.clone())),
                    other => Err(mismatch(name, other, stringify!($variant))),
                }
            }
        )*
    };
}

impl<'a> RowValues<'a> {
    /// Wrap values aligned with `columns`.
    pub fn new(columns: &'static [Column], values: &'a [Value]) -> Self {
        Self { columns, values }
    }

    /// Raw value of a column.
    pub fn get(&self, name: &str) -> Result<&Value, CodecError> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|idx| self.values.get(idx))
            .ok_or_else(|| CodecError::MissingColumn {
                column: name.to_string(),
            })
    }

    typed_accessors! {
        text, opt_text, Text => String;
        integer, opt_integer, Integer => i64;
        float, opt_float, Float => f64;
        boolean, opt_boolean, Boolean => bool;
        id, opt_id, Id => Snowflake;
    }
}

fn mismatch(column: &str, value: &Value, expected: &str) -> CodecError {
    CodecError::InvalidValue {
        column: column.to_string(),
        value: format!("{:?}", value),
        reason: format!("expected {}", expected),
    }
}

// ============================================================================
// ENCODING
// ============================================================================

/// Encode a row set as a CSV attachment.
///
/// Returns `None` for an empty row set: the anchor then carries no
/// attachment at all instead of a header-only file.
pub fn encode_rows<R: Record>(rows: &[R]) -> Option<Vec<u8>> {
    if rows.is_empty() {
        return None;
    }

    let mut out = String::new();
    let header: Vec<String> = R::COLUMNS
        .iter()
        .map(|c| escape_text(c.name))
        .collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for row in rows {
        let fields: Vec<String> = row.to_values().iter().map(encode_value).collect();
        out.push_str(&fields.join(","));
        out.push('\n');
    }

    Some(out.into_bytes())
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::Unset => String::new(),
        Value::Text(s) => escape_text(s),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Id(id) => id.to_string(),
    }
}

fn escape_text(s: &str) -> String {
    let needs_quotes = s.is_empty()
        || s.contains([',', '"', '\n', '\r'])
        || s.starts_with(char::is_whitespace)
        || s.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

// ============================================================================
// DECODING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawField {
    text: String,
    quoted: bool,
}

/// Decode a CSV attachment into rows.
///
/// A missing attachment (or an empty / header-only one) decodes to an empty
/// row set. Columns are matched by header name, so column order on disk is
/// free; unknown columns are ignored and missing optional columns decode as
/// unset.
pub fn decode_rows<R: Record>(bytes: Option<&[u8]>) -> Result<Vec<R>, CodecError> {
    let Some(bytes) = bytes else {
        return Ok(Vec::new());
    };
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    let records = parse_records(text)?;

    let mut records = records.into_iter();
    let Some((_, header)) = records.next() else {
        return Ok(Vec::new());
    };

    let positions = R::COLUMNS
        .iter()
        .map(|column| {
            let pos = header.iter().position(|h| h.text == column.name);
            match pos {
                None if !column.optional => Err(CodecError::MissingColumn {
                    column: column.name.to_string(),
                }),
                pos => Ok(pos),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::new();
    for (line, record) in records {
        if record.len() != header.len() {
            return Err(CodecError::RowWidth {
                line,
                expected: header.len(),
                got: record.len(),
            });
        }
        let values = R::COLUMNS
            .iter()
            .zip(&positions)
            .map(|(column, pos)| match pos {
                Some(idx) => decode_field(column, &record[*idx]),
                None => Ok(Value::Unset),
            })
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(R::from_values(RowValues::new(R::COLUMNS, &values))?);
    }
    Ok(rows)
}

fn decode_field(column: &Column, field: &RawField) -> Result<Value, CodecError> {
    if field.text.is_empty() && !field.quoted {
        return Ok(column.zero_value());
    }

    let invalid = |reason: &str| CodecError::InvalidValue {
        column: column.name.to_string(),
        value: field.text.clone(),
        reason: reason.to_string(),
    };

    match column.kind {
        ColumnKind::Text => Ok(Value::Text(field.text.clone())),
        ColumnKind::Integer => field
            .text
            .parse()
            .map(Value::Integer)
            .map_err(|_| invalid("not an integer")),
        ColumnKind::Float => field
            .text
            .parse()
            .map(Value::Float)
            .map_err(|_| invalid("not a number")),
        ColumnKind::Boolean => match field.text.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Boolean(true)),
            "false" => Ok(Value::Boolean(false)),
            _ => Err(invalid("not a boolean")),
        },
        ColumnKind::Id => field
            .text
            .parse()
            .map(Value::Id)
            .map_err(|_| invalid("not a snowflake")),
    }
}

/// Split CSV text into records, each tagged with the line it starts on.
fn parse_records(text: &str) -> Result<Vec<(usize, Vec<RawField>)>, CodecError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut quote_line = 1;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
                quote_line = line;
            }
            ',' => {
                record.push(RawField {
                    text: std::mem::take(&mut field),
                    quoted,
                });
                quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(RawField {
                    text: std::mem::take(&mut field),
                    quoted,
                });
                quoted = false;
                records.push((record_line, std::mem::take(&mut record)));
                line += 1;
                record_line = line;
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(CodecError::UnterminatedQuote { line: quote_line });
    }
    if !record.is_empty() || !field.is_empty() || quoted {
        record.push(RawField { text: field, quoted });
        records.push((record_line, record));
    }
    Ok(records)
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Mixed {
        label: String,
        note: Option<String>,
        count: i64,
        weight: f64,
        flag: bool,
        maybe_flag: Option<bool>,
    }

    impl Record for Mixed {
        const COLUMNS: &'static [Column] = &[
            Column::required("label", ColumnKind::Text),
            Column::optional("note", ColumnKind::Text),
            Column::required("count", ColumnKind::Integer),
            Column::required("weight", ColumnKind::Float),
            Column::required("flag", ColumnKind::Boolean),
            Column::optional("maybe_flag", ColumnKind::Boolean),
        ];

        fn to_values(&self) -> Vec<Value> {
            vec![
                self.label.clone().into(),
                self.note.clone().into(),
                self.count.into(),
                self.weight.into(),
                self.flag.into(),
                self.maybe_flag.into(),
            ]
        }

        fn from_values(row: RowValues<'_>) -> Result<Self, CodecError> {
            Ok(Self {
                label: row.text("label")?,
                note: row.opt_text("note")?,
                count: row.integer("count")?,
                weight: row.float("weight")?,
                flag: row.boolean("flag")?,
                maybe_flag: row.opt_boolean("maybe_flag")?,
            })
        }
    }

    fn arb_text() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just(",".to_string()),
            Just("\"".to_string()),
            Just("\"\"".to_string()),
            "[a-z ,\"\\n\\r]{0,12}",
            any::<String>(),
        ]
    }

    fn arb_mixed() -> impl Strategy<Value = Mixed> {
        (
            arb_text(),
            proptest::option::of(arb_text()),
            any::<i64>(),
            proptest::num::f64::NORMAL | proptest::num::f64::ZERO | proptest::num::f64::SUBNORMAL,
            any::<bool>(),
            proptest::option::of(any::<bool>()),
        )
            .prop_map(|(label, note, count, weight, flag, maybe_flag)| Mixed {
                label,
                note,
                count,
                weight,
                flag,
                maybe_flag,
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Decoding an encoded row set yields the original rows.
        #[test]
        fn prop_round_trip(rows in proptest::collection::vec(arb_mixed(), 0..8)) {
            let encoded = encode_rows(&rows);
            prop_assert_eq!(encoded.is_none(), rows.is_empty());
            let decoded = decode_rows::<Mixed>(encoded.as_deref()).unwrap();
            prop_assert_eq!(decoded, rows);
        }
    }
}
