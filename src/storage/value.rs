use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

/// A readable, seekable byte stream.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// The write-side input: a single immutable blob.
///
/// `Buffer` values carry a stream position. Composers that pass a value to
/// several candidate locations snapshot the position first and restore it
/// after a refusal, so every candidate sees the same stream.
pub enum Value {
    /// A path to a readable file.
    Path(PathBuf),
    /// A seekable byte stream, consumed from its current position.
    Buffer(Box<dyn ReadSeek>),
    /// An in-memory byte array.
    Bytes(Bytes),
}

impl Value {
    pub fn buffer<R: ReadSeek + 'static>(reader: R) -> Self {
        Value::Buffer(Box::new(reader))
    }

    /// Current stream position, for `Buffer` values only.
    pub fn stream_position(&mut self) -> std::io::Result<Option<u64>> {
        match self {
            Value::Buffer(buffer) => buffer.seek(SeekFrom::Current(0)).map(Some),
            _ => Ok(None),
        }
    }

    pub fn seek_to(&mut self, position: u64) -> std::io::Result<()> {
        if let Value::Buffer(buffer) = self {
            buffer.seek(SeekFrom::Start(position))?;
        }
        Ok(())
    }

    /// Opens the value for reading. `Buffer` values read from their current
    /// position and are consumed by it.
    pub fn reader(&mut self) -> std::io::Result<ValueReader<'_>> {
        match self {
            Value::Path(path) => Ok(ValueReader::File(File::open(path)?)),
            Value::Buffer(buffer) => Ok(ValueReader::Buffer(buffer)),
            Value::Bytes(bytes) => Ok(ValueReader::Bytes(&bytes[..])),
        }
    }
}

impl From<PathBuf> for Value {
    fn from(path: PathBuf) -> Self {
        Value::Path(path)
    }
}

impl From<&Path> for Value {
    fn from(path: &Path) -> Self {
        Value::Path(path.to_owned())
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes.into())
    }
}

pub enum ValueReader<'a> {
    File(File),
    Buffer(&'a mut Box<dyn ReadSeek>),
    Bytes(&'a [u8]),
}

impl Read for ValueReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ValueReader::File(file) => file.read(buf),
            ValueReader::Buffer(buffer) => buffer.read(buf),
            ValueReader::Bytes(bytes) => bytes.read(buf),
        }
    }
}

/// The read-side output of a location.
///
/// A `File` handle borrows a path that is only guaranteed to exist for the
/// duration of the read scope. A `Blob` is owned and outlives the scope.
pub enum ValueHandle {
    File(PathBuf),
    Blob(Bytes),
}

impl ValueHandle {
    /// Reads the whole value into memory.
    pub fn to_bytes(&self) -> std::io::Result<Bytes> {
        match self {
            ValueHandle::File(path) => Ok(std::fs::read(path)?.into()),
            ValueHandle::Blob(bytes) => Ok(bytes.clone()),
        }
    }

    pub fn open(&self) -> std::io::Result<Box<dyn Read + '_>> {
        match self {
            ValueHandle::File(path) => Ok(Box::new(File::open(path)?)),
            ValueHandle::Blob(bytes) => Ok(Box::new(&bytes[..])),
        }
    }

    /// Re-packages the handle as a write-side value, for replication.
    pub fn to_value(&self) -> Value {
        match self {
            ValueHandle::File(path) => Value::Path(path.clone()),
            ValueHandle::Blob(bytes) => Value::Bytes(bytes.clone()),
        }
    }
}
