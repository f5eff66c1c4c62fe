use crate::error::PluginError;
use crate::metric::{FieldValue, Fields, Tags};
use crate::plugins::{Accumulator, Input};
use log::debug;

/// Input emitting `heartbeat,source=<name> count=<n>i` once per pass
#[derive(Debug)]
pub struct Heartbeat {
    source: String,
    count: i64,
}

impl Heartbeat {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            count: 0,
        }
    }

    /// Number of completed passes
    pub fn count(&self) -> i64 {
        self.count
    }
}

impl Input for Heartbeat {
    fn init(&mut self) -> Result<(), PluginError> {
        if self.source.trim().is_empty() {
            return Err(PluginError::Init(
                "heartbeat source name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn gather(&mut self, acc: &mut dyn Accumulator) -> Result<(), PluginError> {
        self.count += 1;
        debug!("Heartbeat pass {} for {}", self.count, self.source);

        let mut tags = Tags::new();
        tags.insert("source".to_string(), self.source.clone());
        let mut fields = Fields::new();
        fields.insert("count".to_string(), FieldValue::Integer(self.count));

        acc.add_fields("heartbeat", fields, tags, None);
        Ok(())
    }
}
