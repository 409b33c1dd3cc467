use log::{debug, error, info};

mod interface;

pub use interface::Interface;

use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
    time::{Duration, Instant},
};

use ublox::{
    UbxPacketMeta,
    cfg_msg::{CfgMsgAllPorts, CfgMsgAllPortsBuilder},
    nav_dop::NavDop,
    nav_pvt::proto23::NavPvt,
    nav_sat::NavSat,
};

use crate::{
    error::Error,
    ubx::{Decoder, Error as UbxError, Message},
};

/// How long we wait for the receiver to acknowledge a command
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens a file for reading, transparently gunzipping `.gz` files.
pub fn open_reader<P: AsRef<Path>>(path: P) -> std::io::Result<Box<dyn Read + Send>> {
    let path = path.as_ref();
    let handle = File::open(path)?;

    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(flate2::read::GzDecoder::new(handle)))
    } else {
        Ok(Box::new(handle))
    }
}

/// U-Blox [Device]: the [Interface] and the UBX parser state attached to it.
pub struct Device {
    decoder: Decoder<Interface>,
}

impl Device {
    fn new(interface: Interface) -> Self {
        Self {
            decoder: Decoder::new(interface),
        }
    }

    /// Stacks all input files (passive mode), consumed in order.
    pub fn open_files(paths: &[&String]) -> Result<Self, Error> {
        let mut interface = Interface::ReadOnly(Vec::with_capacity(paths.len()));

        for path in paths {
            let handle = File::open(path.as_str())?;
            if path.ends_with(".gz") {
                interface.stack_gzip_file_handle(handle);
            } else {
                interface.stack_file_handle(handle);
            }
            debug!("stacked \"{}\"", path);
        }

        Ok(Self::new(interface))
    }

    pub fn open_serial_port(port_str: &str, baud: u32) -> Result<Self, Error> {
        let port = serialport::new(port_str, baud)
            .timeout(Duration::from_millis(250))
            .open()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        info!("connected to {} ({} bauds)", port_str, baud);

        Ok(Self::new(Interface::from_serial_port(port)))
    }

    pub fn is_read_only(&self) -> bool {
        self.decoder.get_ref().is_read_only()
    }

    pub fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.decoder.get_mut().write_all(data)
    }

    /// Returns a writable handle for concurrent uploads
    pub fn writer(&self) -> Result<Box<dyn Write + Send>, Error> {
        self.decoder.get_ref().try_clone_writer()
    }

    /// Hands the stream over to the decode loop.
    /// Bytes already buffered by the parser are preserved.
    pub fn into_decoder(self) -> Decoder<Interface> {
        self.decoder
    }

    /// Enables the messages we log, on every receiver port
    pub fn enable_messages(&mut self) -> Result<(), Error> {
        self.enable::<NavPvt>("UBX-NAV-PVT")?;
        self.enable::<NavDop>("UBX-NAV-DOP")?;
        self.enable::<NavSat>("UBX-NAV-SAT")?;
        Ok(())
    }

    fn enable<T: UbxPacketMeta>(&mut self, name: &str) -> Result<(), Error> {
        self.write_all(
            &CfgMsgAllPortsBuilder::set_rate_for::<T>([1, 1, 1, 1, 1, 1]).into_packet_bytes(),
        )?;
        self.wait_for_ack::<CfgMsgAllPorts>()?;
        debug!("{} enabled", name);
        Ok(())
    }

    /// Consumes the stream until the receiver acknowledges a `T` command.
    pub fn wait_for_ack<T: UbxPacketMeta>(&mut self) -> Result<(), Error> {
        let (class, id) = (T::CLASS, T::ID);
        let deadline = Instant::now() + ACK_TIMEOUT;

        while Instant::now() < deadline {
            match self.decoder.decode() {
                Ok(Message::AckAck { class: c, id: i }) if c == class && i == id => {
                    return Ok(());
                },
                Ok(Message::AckNak { class: c, id: i }) if c == class && i == id => {
                    error!("{:02x}-{:02x} NACK", class, id);
                    return Err(Error::Nack { class, id });
                },
                Ok(_) | Err(UbxError::Idle) => {},
                Err(e) if e.is_recoverable() => {},
                Err(UbxError::EndOfStream) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::AckTimeout { class, id })
    }
}
