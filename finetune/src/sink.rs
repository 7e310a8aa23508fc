//! Where run statistics are written: the per epoch `log.txt` and the scalar
//! dashboard stream.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::Result;

pub const LOG_FILE: &str = "log.txt";
pub const SCALARS_FILE: &str = "scalars.jsonl";

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Appends one JSON object per epoch to `<output_dir>/log.txt`.
pub struct LogSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogSink {
    pub fn create(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join(LOG_FILE);
        let writer = open_append(&path)?;
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Builds an epoch's line, `train_` and `test_` prefixed metrics first.
    ///
    /// # Arguments
    /// * `train` - The epoch's global training averages.
    /// * `test` - The metrics of the last validation run, if one happened.
    /// * `epoch` - The epoch.
    /// * `n_parameters` - The model's trainable scalars.
    pub fn epoch_line(
        train: &BTreeMap<String, f32>,
        test: Option<&BTreeMap<String, f32>>,
        epoch: usize,
        n_parameters: usize,
    ) -> Value {
        let mut line = Map::new();

        for (k, v) in train {
            line.insert(format!("train_{k}"), Value::from(*v));
        }

        for (k, v) in test.into_iter().flatten() {
            line.insert(format!("test_{k}"), Value::from(*v));
        }

        line.insert("epoch".into(), Value::from(epoch));
        line.insert("n_parameters".into(), Value::from(n_parameters));
        Value::Object(line)
    }

    /// Appends `line` and flushes it.
    pub fn write(&mut self, line: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarEvent<'a> {
    tag: &'a str,
    value: f32,
    step: u64,
    wall_time: f64,
}

/// Streams scalars to `<log_dir>/scalars.jsonl` for a dashboard to pick up.
pub struct DashboardWriter {
    writer: BufWriter<File>,
}

impl DashboardWriter {
    pub fn create(log_dir: &Path) -> Result<Self> {
        let writer = open_append(&log_dir.join(SCALARS_FILE))?;
        Ok(Self { writer })
    }

    /// Buffers one scalar, `flush` pushes them to disk.
    pub fn add_scalar(&mut self, tag: &str, value: f32, step: u64) -> Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let event = ScalarEvent {
            tag,
            value,
            step,
            wall_time,
        };

        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
