//! Append-only transaction log for the configuration store.
//!
//! Every accepted write is appended as one JSON line. On startup the log is
//! replayed to rebuild the tree; compaction rewrites the log from the live
//! tree so it does not grow without bound.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::tree::ConfigTree;
use crate::value::Value;

/// The kind of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlogOp {
    /// A leaf write.
    Write,

    /// A subtree removal.
    Remove,
}

/// One transaction log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlogRecord {
    /// Milliseconds since epoch of the write.
    pub ts: i64,

    /// Operation kind.
    pub op: TlogOp,

    /// Path segments the operation touched.
    pub path: Vec<String>,

    /// Leaf value for writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl TlogRecord {
    /// Creates a write record.
    #[must_use]
    pub fn write(path: Vec<String>, value: Value, ts: i64) -> Self {
        Self {
            ts,
            op: TlogOp::Write,
            path,
            value: Some(value),
        }
    }

    /// Creates a removal record.
    #[must_use]
    pub const fn remove(path: Vec<String>, ts: i64) -> Self {
        Self {
            ts,
            op: TlogOp::Remove,
            path,
            value: None,
        }
    }
}

/// An open transaction log.
#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TransactionLog {
    /// Opens (or creates) the log at `path` and replays its records.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a line cannot be
    /// decoded.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<TlogRecord>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let records = if path.exists() {
            Self::read_records(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ConfigError::Io {
                path: path.clone(),
                source: e,
            })?;

        Ok((
            Self {
                path,
                writer: BufWriter::new(file),
            },
            records,
        ))
    }

    fn read_records(path: &Path) -> Result<Vec<TlogRecord>> {
        let file = File::open(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record =
                serde_json::from_str(&line).map_err(|e| ConfigError::CorruptTlog {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Appends one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn append(&mut self, record: &TlogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{line}").map_err(|e| ConfigError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Flushes buffered records to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| ConfigError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Rewrites the log from the live tree, dropping superseded records.
    ///
    /// The new log is written to a sibling temp file and atomically renamed
    /// over the old one.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite fails.
    pub fn compact(&mut self, tree: &ConfigTree) -> Result<()> {
        let tmp_path = self.path.with_extension("tlog.new");
        {
            let tmp = File::create(&tmp_path).map_err(|e| ConfigError::Io {
                path: tmp_path.clone(),
                source: e,
            })?;
            let mut writer = BufWriter::new(tmp);
            let mut result = Ok(());
            tree.for_each_leaf(|path, leaf| {
                if result.is_err() {
                    return;
                }
                let record = TlogRecord::write(
                    path.iter().map(ToString::to_string).collect(),
                    leaf.value.clone(),
                    leaf.timestamp,
                );
                result = serde_json::to_string(&record)
                    .map_err(ConfigError::from)
                    .and_then(|line| {
                        writeln!(writer, "{line}").map_err(|e| ConfigError::Io {
                            path: tmp_path.clone(),
                            source: e,
                        })
                    });
            });
            result?;
            writer.flush().map_err(|e| ConfigError::Io {
                path: tmp_path.clone(),
                source: e,
            })?;
        }

        std::fs::rename(&tmp_path, &self.path).map_err(|e| ConfigError::Io {
            path: self.path.clone(),
            source: e,
        })?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| ConfigError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        self.writer = BufWriter::new(file);

        tracing::debug!(path = ?self.path, "compacted transaction log");
        Ok(())
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
