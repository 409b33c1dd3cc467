use std::io::Write;

use crate::{error::Error, logger::FixSnapshot};

/// Durable destination of published [FixSnapshot]s.
pub trait Sink: Send {
    /// Persists one snapshot. Failures must be reported, never swallowed.
    fn persist(&mut self, snapshot: FixSnapshot) -> Result<(), Error>;
}

/// Streams one JSON object per line
pub struct JsonSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for JsonSink<W> {
    fn persist(&mut self, snapshot: FixSnapshot) -> Result<(), Error> {
        serde_json::to_writer(&mut self.writer, &snapshot)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
