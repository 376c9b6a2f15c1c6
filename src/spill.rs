//! Parquet spill files for stage inputs.
//!
//! When a combine or reduce stage fails, the sorted stream it was given is
//! written here so it can be inspected afterwards. Each file has two binary
//! columns, `key` and `value`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use arrow::array::{Array, ArrayRef, BinaryArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::error::Stage;
use crate::KeyValue;

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Binary, false),
        Field::new("value", DataType::Binary, false),
    ]))
}

/// Path of the spill file for `job`'s `stage` under `dir`.
pub fn spill_path(dir: &Path, job: &str, stage: Stage) -> PathBuf {
    dir.join(format!("{job}-{stage}.parquet"))
}

pub fn write_parquet(path: &Path, records: &[KeyValue]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = File::create(path)?;
    let keys: Vec<&[u8]> = records.iter().map(|kv| kv.key.as_ref()).collect();
    let values: Vec<&[u8]> = records.iter().map(|kv| kv.value.as_ref()).collect();
    let batch = RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(BinaryArray::from(keys)) as ArrayRef,
            Arc::new(BinaryArray::from(values)) as ArrayRef,
        ],
    )?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    // closing writes the footer
    writer.close()?;
    Ok(())
}

fn arr_to_vec(binary_array: &BinaryArray) -> Vec<Bytes> {
    (0..binary_array.len())
        .map(|i| Bytes::copy_from_slice(binary_array.value(i)))
        .collect()
}

fn binary_column(batch: &RecordBatch, index: usize) -> Result<Vec<Bytes>> {
    let column = batch
        .columns()
        .get(index)
        .ok_or_else(|| anyhow!("spill file is missing column {index}"))?;
    let array = column
        .as_any()
        .downcast_ref::<BinaryArray>()
        .ok_or_else(|| anyhow!("spill column {index} is not binary"))?;
    Ok(arr_to_vec(array))
}

pub fn read_parquet(path: &Path) -> Result<Vec<KeyValue>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let keys = binary_column(&batch, 0)?;
        let values = binary_column(&batch, 1)?;
        records.extend(keys.into_iter().zip(values).map(|(k, v)| KeyValue::new(k, v)));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn spilled_stream_reads_back_in_order() {
        let dir = TempDir::new().unwrap();
        let path = spill_path(dir.path(), "trending", Stage::Reduce);
        assert!(path.ends_with("trending-reduce.parquet"));

        let records = vec![
            KeyValue::new(Bytes::from("c1"), Bytes::from("4")),
            KeyValue::new(Bytes::from("c1"), Bytes::from("x\ty")),
            KeyValue::new(Bytes::from("c2"), Bytes::new()),
        ];
        write_parquet(&path, &records).unwrap();
        assert_eq!(read_parquet(&path).unwrap(), records);
    }
}
