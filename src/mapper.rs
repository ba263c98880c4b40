//! Source value to MySQL bind value conversion.
//!
//! Follows the family rules: integers into 64-bit signed/unsigned slots with
//! an overflow check, exact decimals as digit strings, floats as doubles,
//! temporal values as broken-down components, NULL preserved end to end.

use chrono::{Datelike, Timelike};
use mysql::Value;

use crate::error::{CopyError, Result};
use crate::value::{CellValue, ColumnInfo, LobHandle, TypeFamily};

/// Bind a full row, separating out large values for chunked streaming.
///
/// Large-value slots are bound as empty byte buffers; the worker appends their
/// chunks into the pending batch afterwards.
pub fn bind_row(
    cells: &[CellValue],
    columns: &[ColumnInfo],
) -> Result<(Vec<Value>, Vec<(usize, LobHandle)>)> {
    let mut bound = Vec::with_capacity(cells.len());
    let mut lobs = Vec::new();
    for (cell, column) in cells.iter().zip(columns) {
        match cell {
            CellValue::Lob(handle) => {
                bound.push(Value::Bytes(Vec::new()));
                lobs.push((column.ordinal, handle.clone()));
            }
            other => bound.push(bind_value(other, column)?),
        }
    }
    Ok((bound, lobs))
}

/// Convert one cell into its MySQL bind value.
pub fn bind_value(cell: &CellValue, column: &ColumnInfo) -> Result<Value> {
    let value = match cell {
        CellValue::Null => Value::NULL,
        CellValue::Int(i) => {
            if column.family == TypeFamily::UnsignedInteger {
                let u = u64::try_from(*i).map_err(|_| out_of_range(column, &i.to_string()))?;
                Value::UInt(u)
            } else {
                Value::Int(*i)
            }
        }
        CellValue::UInt(u) => {
            if column.family == TypeFamily::UnsignedInteger {
                Value::UInt(*u)
            } else {
                let i = i64::try_from(*u).map_err(|_| out_of_range(column, &u.to_string()))?;
                Value::Int(i)
            }
        }
        CellValue::Double(f) => Value::Double(*f),
        CellValue::Decimal(digits) => Value::Bytes(digits.clone().into_bytes()),
        CellValue::Date(date) => {
            let year = year_component(column, date.year())?;
            Value::Date(year, date.month() as u8, date.day() as u8, 0, 0, 0, 0)
        }
        CellValue::DateTime(dt) => {
            let year = year_component(column, dt.year())?;
            Value::Date(
                year,
                dt.month() as u8,
                dt.day() as u8,
                dt.hour() as u8,
                dt.minute() as u8,
                dt.second() as u8,
                dt.nanosecond() / 1000,
            )
        }
        CellValue::Time {
            negative,
            hours,
            minutes,
            seconds,
            micro_seconds,
        } => Value::Time(
            *negative,
            hours / 24,
            (hours % 24) as u8,
            *minutes,
            *seconds,
            *micro_seconds,
        ),
        CellValue::Bytes(bytes) => Value::Bytes(bytes.clone()),
        CellValue::Text(text) => Value::Bytes(text.clone().into_bytes()),
        CellValue::Lob(_) => {
            return Err(CopyError::Driver(format!(
                "large value in column '{}' was not drained before binding",
                column.name
            )))
        }
    };
    Ok(value)
}

fn year_component(column: &ColumnInfo, year: i32) -> Result<u16> {
    u16::try_from(year).map_err(|_| out_of_range(column, &year.to_string()))
}

fn out_of_range(column: &ColumnInfo, value: &str) -> CopyError {
    CopyError::Range(format!(
        "value {value} does not fit column '{}' ({:?})",
        column.name, column.family
    ))
}

/// Rough serialised size of one bind value, used against the packet budget.
pub fn estimated_bind_size(value: &Value) -> usize {
    const SLOT_OVERHEAD: usize = 8;
    match value {
        Value::Bytes(b) => b.len() + SLOT_OVERHEAD,
        Value::NULL => SLOT_OVERHEAD,
        _ => 16 + SLOT_OVERHEAD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn column(family: TypeFamily) -> ColumnInfo {
        ColumnInfo {
            ordinal: 0,
            name: "c".into(),
            family,
            type_name: "TEST".into(),
            length: 0,
            scale: 0,
            nullable: true,
            charset: None,
        }
    }

    #[test]
    fn integers_bind_per_family() {
        let signed = column(TypeFamily::SignedInteger);
        let unsigned = column(TypeFamily::UnsignedInteger);

        assert_eq!(bind_value(&CellValue::Int(-5), &signed).unwrap(), Value::Int(-5));
        assert_eq!(
            bind_value(&CellValue::UInt(5), &unsigned).unwrap(),
            Value::UInt(5)
        );
        // A non-negative signed source value may feed an unsigned slot.
        assert_eq!(
            bind_value(&CellValue::Int(7), &unsigned).unwrap(),
            Value::UInt(7)
        );
    }

    #[test]
    fn integer_overflow_is_a_range_error() {
        let signed = column(TypeFamily::SignedInteger);
        let unsigned = column(TypeFamily::UnsignedInteger);

        let err = bind_value(&CellValue::Int(-1), &unsigned).unwrap_err();
        assert!(matches!(err, CopyError::Range(_)));

        let err = bind_value(&CellValue::UInt(u64::MAX), &signed).unwrap_err();
        assert!(matches!(err, CopyError::Range(_)));
    }

    #[test]
    fn decimals_stay_textual() {
        let col = column(TypeFamily::Decimal);
        let bound = bind_value(&CellValue::Decimal("12345678901234567890.55".into()), &col).unwrap();
        assert_eq!(bound, Value::Bytes(b"12345678901234567890.55".to_vec()));
    }

    #[test]
    fn temporal_values_bind_broken_down() {
        let date_col = column(TypeFamily::Date);
        let date = NaiveDate::from_ymd_opt(2014, 2, 28).unwrap();
        assert_eq!(
            bind_value(&CellValue::Date(date), &date_col).unwrap(),
            Value::Date(2014, 2, 28, 0, 0, 0, 0)
        );

        let ts_col = column(TypeFamily::Timestamp);
        let dt: NaiveDateTime = date.and_hms_micro_opt(13, 45, 59, 250_000).unwrap();
        assert_eq!(
            bind_value(&CellValue::DateTime(dt), &ts_col).unwrap(),
            Value::Date(2014, 2, 28, 13, 45, 59, 250_000)
        );

        let time_col = column(TypeFamily::Time);
        let time = CellValue::Time {
            negative: true,
            hours: 30,
            minutes: 15,
            seconds: 1,
            micro_seconds: 0,
        };
        assert_eq!(
            bind_value(&time, &time_col).unwrap(),
            Value::Time(true, 1, 6, 15, 1, 0)
        );
    }

    #[test]
    fn nulls_are_preserved() {
        for family in [TypeFamily::SignedInteger, TypeFamily::Text, TypeFamily::Bytes] {
            assert_eq!(
                bind_value(&CellValue::Null, &column(family)).unwrap(),
                Value::NULL
            );
        }
    }

    #[test]
    fn bind_row_splits_out_large_values() {
        let columns = vec![
            ColumnInfo {
                ordinal: 0,
                ..column(TypeFamily::SignedInteger)
            },
            ColumnInfo {
                ordinal: 1,
                ..column(TypeFamily::Bytes)
            },
        ];
        let cells = vec![
            CellValue::Int(1),
            CellValue::Lob(LobHandle::new(vec![9u8; 64], false)),
        ];

        let (bound, lobs) = bind_row(&cells, &columns).unwrap();
        assert_eq!(bound[0], Value::Int(1));
        assert_eq!(bound[1], Value::Bytes(Vec::new()));
        assert_eq!(lobs.len(), 1);
        assert_eq!(lobs[0].0, 1);
        assert_eq!(lobs[0].1.len(), 64);
    }
}
