//! Postgres row operation.
//!
//! - [`Row`]: one result row, decoded lazily per column.
//! - [`Column`]: column metadata from the row description.
//! - [`FromValue`]: conversions out of [`PgValue`].
//! - [`RowIndex`]: column lookup by position or name.
use bytes::{Buf, Bytes};
use std::{fmt, sync::Arc};

use crate::{
    codec::{CodecRegistry, DecodeError, PgValue},
    postgres::{Oid, PgFormat, backend::{DataRow, FieldDescription}},
};

/// One result row.
///
/// Column bytes stay inside the retained `DataRow` body; a value is
/// sliced and decoded only when asked for.
pub struct Row {
    fields: Arc<[FieldDescription]>,
    registry: Arc<CodecRegistry>,
    values: Bytes,
    columns: u16,
}

impl Row {
    pub(crate) fn new(
        fields: Arc<[FieldDescription]>,
        registry: Arc<CodecRegistry>,
        row: DataRow,
    ) -> Result<Self, DecodeError> {
        if row.columns as usize != fields.len() {
            return Err(DecodeError::malformed(format!(
                "DataRow carries {} values for {} described fields",
                row.columns,
                fields.len(),
            )));
        }
        Ok(Self {
            fields,
            registry,
            values: row.body,
            columns: row.columns,
        })
    }

    /// Returns the number of columns in the row.
    pub fn len(&self) -> usize {
        self.columns as usize
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.columns == 0
    }

    /// Column metadata, in result order.
    pub fn columns(&self) -> impl Iterator<Item = Column<'_>> {
        self.fields.iter().map(|field| Column {
            field,
            host_type: self.registry.preferred_type(field.oid, field.format),
        })
    }

    /// The raw wire bytes of the nth column, [`None`] for NULL.
    pub fn raw(&self, nth: usize) -> Result<Option<Bytes>, DecodeError> {
        if nth >= self.len() {
            return Err(DecodeError::ColumnNotFound(nth.to_string().into()));
        }

        let truncated = || DecodeError::malformed("DataRow body is truncated");

        let mut values = self.values.clone();
        let mut at = 0;
        loop {
            if values.len() < 4 {
                return Err(truncated());
            }
            let len = values.get_i32();
            let value = match len {
                -1 => None,
                len if len < 0 => return Err(truncated()),
                len if (len as usize) > values.len() => return Err(truncated()),
                len => Some(values.split_to(len as usize)),
            };
            if at == nth {
                return Ok(value);
            }
            at += 1;
        }
    }

    /// Decode a column into a [`PgValue`] through the registry.
    pub fn get<I: RowIndex>(&self, index: I) -> Result<PgValue, DecodeError> {
        let nth = index.position(&self.fields)?;
        let field = &self.fields[nth];
        let raw = self.raw(nth)?;
        self.registry.decode(raw.as_ref(), field.oid, field.format)
    }

    /// Decode a column and convert it to a host type.
    pub fn try_get<I: RowIndex, T: FromValue>(&self, index: I) -> Result<T, DecodeError> {
        T::from_value(self.get(index)?)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (nth, field) in self.fields.iter().enumerate() {
            map.key(&field.name.as_str());
            match self.get(nth) {
                Ok(value) => map.value(&value),
                Err(_) => map.value(&"<undecodable>"),
            };
        }
        map.finish()
    }
}

/// Metadata of one result column.
#[derive(Debug)]
pub struct Column<'a> {
    field: &'a FieldDescription,
    host_type: Option<&'static str>,
}

impl Column<'_> {
    pub fn name(&self) -> &str {
        &self.field.name
    }

    pub fn oid(&self) -> Oid {
        self.field.oid
    }

    pub fn format(&self) -> PgFormat {
        self.field.format
    }

    /// The host type the registry would decode this column into.
    pub fn host_type(&self) -> Option<&'static str> {
        self.host_type
    }
}

/// Type that can be used for indexing column.
pub trait RowIndex: Sized + sealed::Sealed {
    fn position(self, fields: &[FieldDescription]) -> Result<usize, DecodeError>;
}

impl RowIndex for usize {
    fn position(self, fields: &[FieldDescription]) -> Result<usize, DecodeError> {
        if self >= fields.len() {
            return Err(DecodeError::ColumnNotFound(self.to_string().into()));
        }
        Ok(self)
    }
}

impl RowIndex for &str {
    fn position(self, fields: &[FieldDescription]) -> Result<usize, DecodeError> {
        fields
            .iter()
            .position(|f| f.name.as_str() == self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

/// A host type constructible from a [`PgValue`].
pub trait FromValue: Sized {
    fn from_value(value: PgValue) -> Result<Self, DecodeError>;
}

impl FromValue for PgValue {
    fn from_value(value: PgValue) -> Result<Self, DecodeError> {
        Ok(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: PgValue) -> Result<Self, DecodeError> {
        match value {
            PgValue::Null(_) => Ok(None),
            value => T::from_value(value).map(Some),
        }
    }
}

macro_rules! from_value {
    ($ty:ty, $expected:literal, $($pat:pat => $body:expr),+ $(,)?) => {
        impl FromValue for $ty {
            fn from_value(value: PgValue) -> Result<Self, DecodeError> {
                match value {
                    $($pat => $body,)+
                    other => Err(DecodeError::TypeMismatch {
                        expected: $expected,
                        found: other.type_name(),
                    }),
                }
            }
        }
    };
}

from_value!(bool, "bool", PgValue::Bool(v) => Ok(v));
from_value!(i16, "i16", PgValue::Int2(v) => Ok(v));
from_value!(i32, "i32", PgValue::Int4(v) => Ok(v), PgValue::Int2(v) => Ok(v as i32));
from_value!(
    i64, "i64",
    PgValue::Int8(v) => Ok(v),
    PgValue::Int4(v) => Ok(v as i64),
    PgValue::Int2(v) => Ok(v as i64),
);
from_value!(f32, "f32", PgValue::Float4(v) => Ok(v));
from_value!(f64, "f64", PgValue::Float8(v) => Ok(v), PgValue::Float4(v) => Ok(v as f64));
from_value!(
    String, "String",
    PgValue::Text(v) => Ok(v.as_str().to_owned()),
    PgValue::Numeric(v) => Ok(v),
);
from_value!(Vec<u8>, "Vec<u8>", PgValue::Bytea(v) => Ok(v.to_vec()));
from_value!(Bytes, "Bytes", PgValue::Bytea(v) => Ok(v));
from_value!(uuid::Uuid, "uuid::Uuid", PgValue::Uuid(v) => Ok(v));
from_value!(time::Date, "time::Date", PgValue::Date(v) => Ok(v));
from_value!(time::Time, "time::Time", PgValue::Time(v) => Ok(v));
from_value!(
    time::PrimitiveDateTime, "time::PrimitiveDateTime",
    PgValue::Timestamp(v) => Ok(v),
);
from_value!(
    time::OffsetDateTime, "time::OffsetDateTime",
    PgValue::TimestampTz(v) => Ok(v),
);
from_value!(crate::codec::Interval, "Interval", PgValue::Interval(v) => Ok(v));
from_value!(serde_json::Value, "serde_json::Value", PgValue::Json(v) => Ok(v));
from_value!(std::net::IpAddr, "IpAddr", PgValue::Inet(v) => Ok(v));
from_value!(crate::codec::PgArray, "PgArray", PgValue::Array(v) => Ok(v));

/// No row was returned where exactly one was required.
#[derive(Debug)]
pub struct RowNotFound;

impl std::error::Error for RowNotFound { }

impl fmt::Display for RowNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("query returned no rows")
    }
}

#[cfg(test)]
mod test {
    use bytes::BufMut;

    use super::*;
    use crate::{common::ByteStr, postgres::oid};

    fn fields() -> Arc<[FieldDescription]> {
        let field = |name: &str, oid, format| FieldDescription {
            name: ByteStr::copy_from_str(name),
            table_oid: 0,
            column_id: 0,
            oid,
            type_size: -1,
            type_modifier: -1,
            format,
        };
        vec![
            field("id", oid::INT4, PgFormat::Binary),
            field("name", oid::TEXT, PgFormat::Binary),
            field("note", oid::TEXT, PgFormat::Binary),
        ]
        .into()
    }

    fn data_row() -> DataRow {
        let mut body = bytes::BytesMut::new();
        body.put_i32(4);
        body.put_i32(420);
        body.put_i32(3);
        body.put_slice(b"Foo");
        body.put_i32(-1);
        DataRow { columns: 3, body: body.freeze() }
    }

    fn row() -> Row {
        Row::new(fields(), Arc::new(CodecRegistry::default()), data_row()).unwrap()
    }

    #[test]
    fn get_by_position_and_name() {
        let row = row();
        assert_eq!(row.get(0).unwrap(), PgValue::Int4(420));
        assert_eq!(row.try_get::<_, i32>("id").unwrap(), 420);
        assert_eq!(row.try_get::<_, String>("name").unwrap(), "Foo");
    }

    #[test]
    fn null_columns_are_distinct() {
        let row = row();
        assert_eq!(row.get("note").unwrap(), PgValue::Null(oid::TEXT));
        assert_eq!(row.try_get::<_, Option<String>>("note").unwrap(), None);
        assert_eq!(row.raw(2).unwrap(), None);
        assert_eq!(row.raw(1).unwrap(), Some(Bytes::from_static(b"Foo")));
    }

    #[test]
    fn missing_column_errors() {
        let row = row();
        assert!(matches!(row.get(3), Err(DecodeError::ColumnNotFound(_))));
        assert!(matches!(row.get("nope"), Err(DecodeError::ColumnNotFound(_))));
    }

    #[test]
    fn type_mismatch_reports_both_sides() {
        let row = row();
        let err = row.try_get::<_, bool>("id").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::TypeMismatch { expected: "bool", found: "i32" },
        ));
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let mut wrong = data_row();
        wrong.columns = 2;
        assert!(Row::new(fields(), Arc::new(CodecRegistry::default()), wrong).is_err());
    }

    #[test]
    fn column_metadata_exposes_host_types() {
        let row = row();
        let columns: Vec<_> = row.columns().collect();
        assert_eq!(columns[0].name(), "id");
        assert_eq!(columns[0].host_type(), Some("i32"));
        assert_eq!(columns[1].host_type(), Some("String"));
        assert_eq!(columns[0].format(), PgFormat::Binary);
    }
}
