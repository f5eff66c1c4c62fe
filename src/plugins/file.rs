use crate::codec;
use crate::error::PluginError;
use crate::metric::Metric;
use crate::plugins::Output;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Output appending one wire line per metric to a file
#[derive(Debug)]
pub struct FileOutput {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}

impl Output for FileOutput {
    fn connect(&mut self) -> Result<(), PluginError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PluginError::Connect(format!("{}: {}", self.path.display(), e)))?;
        self.writer = Some(BufWriter::new(file));
        info!("File output connected to {}", self.path.display());
        Ok(())
    }

    fn write(&mut self, metrics: &[Metric]) -> Result<(), PluginError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PluginError::Write("file output is not connected".to_string()))?;

        for metric in metrics {
            writer
                .write_all(codec::encode(metric).as_bytes())
                .map_err(|e| PluginError::Write(e.to_string()))?;
        }
        writer
            .flush()
            .map_err(|e| PluginError::Write(e.to_string()))
    }

    fn close(&mut self) -> Result<(), PluginError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| PluginError::Close(e.to_string()))?;
            debug!("File output {} closed", self.path.display());
        }
        Ok(())
    }
}
