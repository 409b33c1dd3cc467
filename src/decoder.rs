use std::{io::Read, time::Duration};

use log::{debug, error, info, trace, warn};
use tokio::sync::{oneshot, watch};

use crate::{
    error::Error,
    registry::HandlerRegistry,
    ubx::{Decoder, Error as UbxError, InfLevel, Message},
};

/// Pause after a transport error, before reading again
const IO_BACKOFF: Duration = Duration::from_millis(100);

/// How the decode loop came to an end
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Input stream exhausted
    EndOfStream,
    /// Shutdown requested
    Shutdown,
}

/// Pulls [Message]s out of the stream and hands them to the [HandlerRegistry].
/// The loop owns the registry, and thereby every registered handler.
pub struct DecodeLoop<R: Read> {
    decoder: Decoder<R>,
    registry: HandlerRegistry,
    shutdown: watch::Receiver<bool>,
}

impl<R: Read> DecodeLoop<R> {
    pub fn new(
        decoder: Decoder<R>,
        registry: HandlerRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            decoder,
            registry,
            shutdown,
        }
    }

    /// Runs until end of stream, shutdown, or the first handler error.
    /// Corrupt frames and transport errors are reported and skipped.
    pub fn run(&mut self) -> Result<Termination, Error> {
        loop {
            if *self.shutdown.borrow() {
                info!(target: "decoder", "shutdown requested");
                return Ok(Termination::Shutdown);
            }

            let msg = match self.decoder.decode() {
                Ok(msg) => msg,
                Err(UbxError::EndOfStream) => {
                    info!(target: "decoder", "consumed all content");
                    return Ok(Termination::EndOfStream);
                },
                Err(UbxError::Idle) => continue,
                Err(UbxError::Io(e)) => {
                    warn!(target: "decoder", "transport error: {}", e);
                    std::thread::sleep(IO_BACKOFF);
                    continue;
                },
                Err(e) => {
                    warn!(target: "decoder", "error decoding ubx: {}", e);
                    continue;
                },
            };

            report(&msg);

            self.registry.dispatch(&msg)?;
        }
    }
}

impl<R: Read + Send + 'static> DecodeLoop<R> {
    /// Deploys this loop on a dedicated (blocking) thread.
    /// The returned channel is written to exactly once.
    pub fn spawn(mut self) -> oneshot::Receiver<Result<Termination, Error>> {
        let (done_tx, done_rx) = oneshot::channel();

        tokio::task::spawn_blocking(move || {
            let result = self.run();
            if let Err(e) = &result {
                debug!(target: "decoder", "terminated: {}", e);
            }
            let _ = done_tx.send(result);
        });

        done_rx
    }
}

/// Receiver notifications are reported as they come
fn report(msg: &Message) {
    match msg {
        Message::AckNak { class, id } => {
            warn!(target: "decoder", "NACK: {:02x}-{:02x}", class, id);
        },
        Message::Inf { level, text } => match level {
            InfLevel::Error => error!(target: "decoder", "received error notification {}", text),
            InfLevel::Warning => warn!(target: "decoder", "received warning message {}", text),
            InfLevel::Notice => info!(target: "decoder", "received notification {}", text),
            InfLevel::Debug => debug!(target: "decoder", "received debug message {}", text),
            InfLevel::Test => trace!(target: "decoder", "received test message {}", text),
        },
        _ => {},
    }
}

#[cfg(test)]
mod test {
    use super::{DecodeLoop, Termination};
    use crate::{
        error::Error,
        logger::{FixAggregator, FixSnapshot, sink::Sink},
        registry::{Handler, HandlerRegistry},
        ubx::{Decoder, Message, MessageKind, encode},
    };
    use hifitime::prelude::Epoch;
    use std::{
        io::{Cursor, Read},
        sync::{Arc, Mutex},
    };
    use tokio::sync::watch;

    struct Counter(Arc<Mutex<Vec<MessageKind>>>);

    impl Handler for Counter {
        fn handle(&mut self, msg: &Message) -> Result<(), Error> {
            self.0.lock().unwrap().push(msg.kind());
            Ok(())
        }
    }

    struct Failing;

    impl Handler for Failing {
        fn handle(&mut self, _: &Message) -> Result<(), Error> {
            Err(Error::SinkNotInitialized)
        }
    }

    struct Recorder(Arc<Mutex<Vec<FixSnapshot>>>);

    impl Sink for Recorder {
        fn persist(&mut self, snapshot: FixSnapshot) -> Result<(), Error> {
            self.0.lock().unwrap().push(snapshot);
            Ok(())
        }
    }

    fn dop_frame(hdop: u16) -> Vec<u8> {
        let mut payload = vec![0; 18];
        payload[12..14].copy_from_slice(&hdop.to_le_bytes());
        encode(0x01, 0x04, &payload).unwrap()
    }

    fn sat_frame(used: &[bool]) -> Vec<u8> {
        let mut payload = vec![0; 8 + 12 * used.len()];
        payload[5] = used.len() as u8;
        for (i, used) in used.iter().enumerate() {
            payload[8 + 12 * i + 8] = if *used { 0x0f } else { 0x04 };
        }
        encode(0x01, 0x35, &payload).unwrap()
    }

    fn stream() -> Vec<u8> {
        let mut stream = sat_frame(&[true, true, false]);
        stream.extend(dop_frame(150));

        // corrupt frame: skipped
        let mut corrupt = dop_frame(900);
        corrupt[8] ^= 0x55;
        stream.extend(corrupt);

        stream.extend(dop_frame(110));
        stream
    }

    #[test]
    fn test_end_of_stream() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Counter(journal.clone()), &[MessageKind::NavDop]);

        let (_tx, rx) = watch::channel(false);
        let mut decode = DecodeLoop::new(Decoder::new(Cursor::new(stream())), registry, rx);

        assert_eq!(decode.run().unwrap(), Termination::EndOfStream);

        // corrupt frame never reaches the handlers
        assert_eq!(
            *journal.lock().unwrap(),
            vec![MessageKind::NavDop, MessageKind::NavDop]
        );
    }

    #[test]
    fn test_transport_error_is_skipped() {
        // fails once, then delivers
        struct Flaky {
            failed: bool,
            stream: Cursor<Vec<u8>>,
        }

        impl Read for Flaky {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if !self.failed {
                    self.failed = true;
                    return Err(std::io::Error::other("transient line error"));
                }
                self.stream.read(buf)
            }
        }

        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Counter(journal.clone()), &[MessageKind::NavDop]);

        let reader = Flaky {
            failed: false,
            stream: Cursor::new(dop_frame(120)),
        };

        let (_tx, rx) = watch::channel(false);
        let mut decode = DecodeLoop::new(Decoder::new(reader), registry, rx);

        assert_eq!(decode.run().unwrap(), Termination::EndOfStream);
        assert_eq!(*journal.lock().unwrap(), vec![MessageKind::NavDop]);
    }

    #[test]
    fn test_handler_error_terminates() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Failing, &[MessageKind::NavDop]);
        registry.register(Counter(journal.clone()), &[MessageKind::NavSat]);

        let (_tx, rx) = watch::channel(false);
        let mut decode = DecodeLoop::new(Decoder::new(Cursor::new(stream())), registry, rx);

        assert!(matches!(decode.run(), Err(Error::SinkNotInitialized)));

        // loop stopped on first NAV-DOP
        assert_eq!(*journal.lock().unwrap(), vec![MessageKind::NavSat]);
    }

    #[test]
    fn test_shutdown() {
        let mut registry = HandlerRegistry::new();
        registry.register(Failing, &[MessageKind::NavDop]);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let mut decode = DecodeLoop::new(Decoder::new(Cursor::new(stream())), registry, rx);
        assert_eq!(decode.run().unwrap(), Termination::Shutdown);
    }

    #[tokio::test]
    async fn test_aggregation_pipeline() {
        let published = Arc::new(Mutex::new(Vec::new()));

        let aggregator =
            FixAggregator::new(Epoch::now().unwrap()).with_sink(Recorder(published.clone()));

        let mut registry = HandlerRegistry::new();
        registry.register(
            aggregator,
            &[MessageKind::NavPvt, MessageKind::NavDop, MessageKind::NavSat],
        );

        let (_tx, rx) = watch::channel(false);
        let done = DecodeLoop::new(Decoder::new(Cursor::new(stream())), registry, rx).spawn();

        assert_eq!(done.await.unwrap().unwrap(), Termination::EndOfStream);

        let published = published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].satellites.seen, 3);
        assert_eq!(published[0].satellites.used, 2);
        assert!((published[0].dop.hdop - 1.5).abs() < 1E-9);
        assert!((published[1].dop.hdop - 1.1).abs() < 1E-9);
    }
}
