//! Conversions between strand values and `mysql_async` values, params and rows

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use mysql_async::{Params, Value as MySqlValue};

use crate::error::{Error, Result};
use crate::query::StatementParams;
use crate::row::Row;
use crate::value::Value;

/// Convert a strand Value to a mysql_async Value
pub fn to_mysql_value(value: &Value) -> MySqlValue {
    match value {
        Value::Null => MySqlValue::NULL,
        Value::Bool(v) => MySqlValue::from(*v),
        Value::I64(v) => MySqlValue::from(*v),
        Value::U64(v) => MySqlValue::from(*v),
        Value::F64(v) => MySqlValue::from(*v),
        Value::String(v) => MySqlValue::from(v.as_str()),
        Value::Bytes(v) => MySqlValue::from(v.as_slice()),
        Value::Date(v) => {
            MySqlValue::Date(v.year() as u16, v.month() as u8, v.day() as u8, 0, 0, 0, 0)
        }
        Value::DateTime(v) => MySqlValue::Date(
            v.year() as u16,
            v.month() as u8,
            v.day() as u8,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.and_utc().timestamp_subsec_micros(),
        ),
        Value::Time(v) => MySqlValue::Time(
            false,
            0,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.nanosecond() / 1000,
        ),
        Value::Decimal(v) => MySqlValue::from(v.to_string()),
        Value::Json(v) => MySqlValue::from(v.to_string()),
    }
}

/// Convert a mysql_async Value to a strand Value
pub fn from_mysql_value(value: MySqlValue) -> Result<Value> {
    match value {
        MySqlValue::NULL => Ok(Value::Null),
        // Text protocol sends everything as bytes
        MySqlValue::Bytes(v) => match String::from_utf8(v) {
            Ok(s) => Ok(Value::String(s)),
            Err(e) => Ok(Value::Bytes(e.into_bytes())),
        },
        MySqlValue::Int(v) => Ok(Value::I64(v)),
        MySqlValue::UInt(v) => Ok(Value::U64(v)),
        MySqlValue::Float(v) => Ok(Value::F64(v.into())),
        MySqlValue::Double(v) => Ok(Value::F64(v)),
        MySqlValue::Date(year, month, day, hour, min, sec, micro) => {
            let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                .ok_or_else(|| Error::TypeConversion {
                    expected: "date",
                    actual: format!("{}-{}-{}", year, month, day),
                })?;
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                return Ok(Value::Date(date));
            }
            let time = NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .ok_or_else(|| Error::TypeConversion {
                    expected: "time",
                    actual: format!("{}:{}:{}.{}", hour, min, sec, micro),
                })?;
            Ok(Value::DateTime(NaiveDateTime::new(date, time)))
        }
        MySqlValue::Time(is_neg, days, hours, mins, secs, micro) => {
            // NaiveTime only covers 00:00:00 to 23:59:59
            if is_neg || days > 0 || hours >= 24 {
                return Err(Error::TypeConversion {
                    expected: "time (00:00:00 to 23:59:59)",
                    actual: format!(
                        "{}{}:{:02}:{:02}",
                        if is_neg { "-" } else { "" },
                        days * 24 + hours as u32,
                        mins,
                        secs
                    ),
                });
            }
            let time = NaiveTime::from_hms_micro_opt(hours as u32, mins as u32, secs as u32, micro)
                .ok_or_else(|| Error::TypeConversion {
                    expected: "time",
                    actual: format!("{}:{}:{}.{}", hours, mins, secs, micro),
                })?;
            Ok(Value::Time(time))
        }
    }
}

/// Convert bound statement parameters for native binding
pub fn to_mysql_params(params: StatementParams) -> Params {
    match params {
        StatementParams::Empty => Params::Empty,
        StatementParams::Positional(values) => {
            Params::Positional(values.iter().map(to_mysql_value).collect())
        }
        StatementParams::Named(values) => Params::Named(
            values
                .iter()
                .map(|(name, value)| (name.as_bytes().to_vec(), to_mysql_value(value)))
                .collect::<HashMap<_, _>>(),
        ),
    }
}

/// Convert a mysql_async row into a column-ordered Row
pub fn from_mysql_row(row: mysql_async::Row) -> Result<Row> {
    let columns = row.columns_ref();
    let mut values = Vec::with_capacity(columns.len());

    for (i, column) in columns.iter().enumerate() {
        let name = column.name_str().to_string();
        let mysql_value = row
            .as_ref(i)
            .ok_or_else(|| Error::ColumnNotFound(name.clone()))?
            .clone();
        values.push((name, from_mysql_value(mysql_value)?));
    }

    Ok(values.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_round_trip() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(12, 30, 5, 250)
            .unwrap();
        let back = from_mysql_value(to_mysql_value(&Value::DateTime(dt))).unwrap();
        assert_eq!(back, Value::DateTime(dt));
    }

    #[test]
    fn test_midnight_datetime_reads_as_date() {
        let value = from_mysql_value(MySqlValue::Date(2024, 3, 1, 0, 0, 0, 0)).unwrap();
        assert_eq!(value, Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
    }

    #[test]
    fn test_negative_time_rejected() {
        assert!(from_mysql_value(MySqlValue::Time(true, 0, 1, 0, 0, 0)).is_err());
    }

    #[test]
    fn test_named_params() {
        let params = to_mysql_params(StatementParams::Named(vec![(
            "id".into(),
            Value::I64(3),
        )]));
        match params {
            Params::Named(map) => assert_eq!(map.get(b"id".as_slice()), Some(&MySqlValue::Int(3))),
            other => panic!("unexpected params: {:?}", other),
        }
    }

    #[test]
    fn test_binary_bytes_stay_bytes() {
        let value = from_mysql_value(MySqlValue::Bytes(vec![0xff, 0x00])).unwrap();
        assert_eq!(value, Value::Bytes(vec![0xff, 0x00]));
    }
}
