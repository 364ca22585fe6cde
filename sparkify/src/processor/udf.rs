use super::time::{TimeField, TimeParts};
use crate::schema::start_time_type;
use datafusion::arrow::array::{Array, ArrayRef, Int32Array, Int64Array, TimestampMillisecondArray};
use datafusion::arrow::datatypes::DataType;
use datafusion::common::DataFusionError;
use datafusion::execution::context::SessionContext;
use datafusion::logical_expr::{ColumnarValue, Volatility, create_udf};
use std::sync::Arc;

type UdfResult<T> = std::result::Result<T, DataFusionError>;

/// SQL names of the time-part functions, all taking epoch milliseconds.
pub const TIME_PART_UDFS: [(&str, TimeField); 6] = [
    ("utc_hour", TimeField::Hour),
    ("utc_day", TimeField::Day),
    ("iso_week", TimeField::Week),
    ("utc_month", TimeField::Month),
    ("utc_year", TimeField::Year),
    ("utc_weekday", TimeField::Weekday),
];

/// Registers the timestamp UDFs so SQL derives time parts exactly like the
/// native transform does.
pub fn register_udfs(ctx: &SessionContext) {
    let utc_timestamp = create_udf(
        "utc_timestamp",
        vec![DataType::Int64],
        start_time_type(),
        Volatility::Immutable,
        Arc::new(convert_to_timestamp),
    );
    ctx.register_udf(utc_timestamp);

    for (name, field) in TIME_PART_UDFS {
        let udf = create_udf(
            name,
            vec![DataType::Int64],
            DataType::Int32,
            Volatility::Immutable,
            Arc::new(move |args: &[ColumnarValue]| extract_time_part(args, field)),
        );
        ctx.register_udf(udf);
    }
}

fn millis_argument(args: &[ColumnarValue]) -> UdfResult<ArrayRef> {
    let arrays = ColumnarValue::values_to_arrays(args)?;
    let array = arrays
        .into_iter()
        .next()
        .ok_or_else(|| DataFusionError::Internal("Expected one argument".to_string()))?;
    if array.data_type() != &DataType::Int64 {
        return Err(DataFusionError::Internal(format!(
            "Expected int64 epoch millis, got {:?}",
            array.data_type()
        )));
    }
    Ok(array)
}

fn as_millis(array: &ArrayRef) -> UdfResult<&Int64Array> {
    array
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| DataFusionError::Internal("Expected int64 array".to_string()))
}

/// Epoch millis to a UTC timestamp; out-of-range values become null.
fn convert_to_timestamp(args: &[ColumnarValue]) -> UdfResult<ColumnarValue> {
    let array = millis_argument(args)?;
    let millis = as_millis(&array)?;

    let result: TimestampMillisecondArray = millis
        .iter()
        .map(|ts| ts.filter(|ms| TimeParts::from_epoch_millis(*ms).is_some()))
        .collect::<TimestampMillisecondArray>()
        .with_timezone(crate::schema::UTC);

    Ok(ColumnarValue::Array(Arc::new(result)))
}

fn extract_time_part(args: &[ColumnarValue], field: TimeField) -> UdfResult<ColumnarValue> {
    let array = millis_argument(args)?;
    let millis = as_millis(&array)?;

    let result: Int32Array = millis
        .iter()
        .map(|ts| ts.and_then(TimeParts::from_epoch_millis).map(|p| p.get(field)))
        .collect();

    Ok(ColumnarValue::Array(Arc::new(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::AsArray;
    use datafusion::arrow::datatypes::Int32Type;

    fn millis(values: Vec<Option<i64>>) -> Vec<ColumnarValue> {
        vec![ColumnarValue::Array(Arc::new(Int64Array::from(values)))]
    }

    #[test]
    fn test_convert_to_timestamp() {
        let result = convert_to_timestamp(&millis(vec![
            Some(1541903636796),
            None,
            Some(i64::MAX),
        ]))
        .unwrap();

        if let ColumnarValue::Array(array) = result {
            assert_eq!(array.data_type(), &start_time_type());
            let ts_array = array
                .as_any()
                .downcast_ref::<TimestampMillisecondArray>()
                .unwrap();
            assert_eq!(ts_array.value(0), 1541903636796);
            assert!(ts_array.is_null(1));
            assert!(ts_array.is_null(2));
        } else {
            panic!("Expected Array result");
        }
    }

    #[test]
    fn test_extract_time_parts_match_native() {
        let ts = 1541903636796;
        let parts = TimeParts::from_epoch_millis(ts).unwrap();

        for (_, field) in TIME_PART_UDFS {
            let result = extract_time_part(&millis(vec![Some(ts), None]), field).unwrap();
            if let ColumnarValue::Array(array) = result {
                let values = array.as_primitive::<Int32Type>();
                assert_eq!(values.value(0), parts.get(field));
                assert!(values.is_null(1));
            } else {
                panic!("Expected Array result");
            }
        }
    }

    #[test]
    fn test_scalar_argument_is_accepted() {
        let args = vec![ColumnarValue::Scalar(
            datafusion::scalar::ScalarValue::Int64(Some(0)),
        )];
        let result = extract_time_part(&args, TimeField::Year).unwrap();
        if let ColumnarValue::Array(array) = result {
            assert_eq!(array.as_primitive::<Int32Type>().value(0), 1970);
        } else {
            panic!("Expected Array result");
        }
    }

    #[tokio::test]
    async fn test_udfs_available_in_sql() {
        let ctx = SessionContext::new();
        register_udfs(&ctx);

        let batches = ctx
            .sql("SELECT utc_year(CAST(1541903636796 AS BIGINT)) AS y, iso_week(CAST(1541903636796 AS BIGINT)) AS w")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();

        let batch = &batches[0];
        assert_eq!(batch.column(0).as_primitive::<Int32Type>().value(0), 2018);
        assert_eq!(batch.column(1).as_primitive::<Int32Type>().value(0), 45);
    }
}
