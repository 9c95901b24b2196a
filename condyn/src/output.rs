//! Snapshot recording and replay sources.
//!
//! At the configured output interval the simulation captures each body's
//! configuration and velocity into a [`Snapshot`] and hands it to a
//! [`StateSink`]. Snapshots are bincode frames; a recorded file can be read
//! back and replayed through the same run driver.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::objects::BodyId;
use crate::Error;

/// Kind-specific flattened state of one body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BodyState {
    pub id: BodyId,
    pub configuration: Vec<f64>,
    pub velocity: Vec<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub step: u64,
    pub time: f64,
    pub bodies: Vec<BodyState>,
    pub contact_count: usize,
}

/// Receiver of recorded snapshots.
pub trait StateSink {
    fn write(&mut self, snapshot: &Snapshot) -> Result<(), Error>;

    /// Flush buffered frames; called once at the end of a run.
    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Keeps every frame in memory; doubles as a replay source in tests.
#[derive(Default)]
pub struct MemorySink {
    pub frames: Vec<Snapshot>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }
}

impl StateSink for MemorySink {
    fn write(&mut self, snapshot: &Snapshot) -> Result<(), Error> {
        self.frames.push(snapshot.clone());
        Ok(())
    }
}

/// Streams bincode frames to a file.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(FileSink {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl StateSink for FileSink {
    fn write(&mut self, snapshot: &Snapshot) -> Result<(), Error> {
        bincode::serialize_into(&mut self.writer, snapshot)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads all frames recorded by a [`FileSink`].
pub fn read_frames(path: impl AsRef<Path>) -> Result<Vec<Snapshot>, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut frames = Vec::new();
    loop {
        match bincode::deserialize_from::<_, Snapshot>(&mut reader) {
            Ok(frame) => frames.push(frame),
            Err(err) => match *err {
                bincode::ErrorKind::Io(ref io) if io.kind() == ErrorKind::UnexpectedEof => break,
                _ => return Err(err.into()),
            },
        }
    }
    Ok(frames)
}
