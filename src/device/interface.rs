use flate2::read::GzDecoder;
use serialport::SerialPort;
use std::{
    fs::File,
    io::{Read, Write},
};

use crate::error::Error;

/// [Interface] to the U-Blox stream
pub enum Interface {
    /// [Interface::ReadOnly] is dedicated to read only input, mainly File inputs.
    /// Stacked handles are consumed one after the other.
    ReadOnly(Vec<Box<dyn Read + Send>>),

    /// [Interface::Port] is used to connect to a physical port,
    /// and activately operate a U-Blox GNSS.
    Port(Box<dyn SerialPort>),
}

impl Interface {
    /// Creates a new [SerialPort] interface
    pub fn from_serial_port(port: Box<dyn SerialPort>) -> Self {
        Self::Port(port)
    }

    /// Stacks a new file handle, to be consumed after the current ones
    pub fn stack_file_handle(&mut self, handle: File) {
        if let Self::ReadOnly(handles) = self {
            handles.push(Box::new(handle));
        }
    }

    /// Stacks a new gzip compressed file handle
    pub fn stack_gzip_file_handle(&mut self, handle: File) {
        if let Self::ReadOnly(handles) = self {
            handles.push(Box::new(GzDecoder::new(handle)));
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly(_))
    }

    /// Returns a second handle to the same port, for concurrent writes.
    pub fn try_clone_writer(&self) -> Result<Box<dyn Write + Send>, Error> {
        match self {
            Self::ReadOnly(_) => Err(Error::ReadOnlyInterface),
            Self::Port(port) => {
                let clone = port
                    .try_clone()
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
                Ok(Box::new(clone))
            },
        }
    }
}

impl std::io::Read for Interface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::ReadOnly(handles) => {
                while !handles.is_empty() {
                    let size = handles[0].read(buf)?;
                    if size > 0 {
                        return Ok(size);
                    }
                    // exhausted: move on to next handle
                    handles.remove(0);
                }
                Ok(0)
            },
            Self::Port(port) => port.read(buf),
        }
    }
}

impl std::io::Write for Interface {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::ReadOnly(_) => Err(std::io::Error::other("read-only interface")),
            Self::Port(port) => port.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::ReadOnly(_) => Ok(()),
            Self::Port(port) => port.flush(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Interface;
    use std::io::{Cursor, Read, Write};

    #[test]
    fn test_stacked_handles() {
        let mut interface = Interface::ReadOnly(vec![
            Box::new(Cursor::new(vec![1, 2])),
            Box::new(Cursor::new(vec![])),
            Box::new(Cursor::new(vec![3])),
        ]);

        let mut content = Vec::new();
        interface.read_to_end(&mut content).unwrap();
        assert_eq!(content, vec![1, 2, 3]);

        assert!(interface.is_read_only());
        assert!(interface.write(&[0]).is_err());
        assert!(interface.try_clone_writer().is_err());
    }
}
