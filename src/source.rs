use serialport::{DataBits, Parity, StopBits};
use std::{
    future::Future,
    io::{self, BufRead, BufReader, Read},
    mem,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc,
};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("device disconnected")]
    Disconnected,
}

/// Producer of newline-framed raw lines.
pub trait LineSource: Send {
    /// Next raw line including its terminator. `Ok(None)` means a finite
    /// source is exhausted.
    fn next_line(&mut self)
        -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;
}

/// Serial-attached concentrator, 8/N/1. Lines are read on a dedicated thread
/// since `serialport` only offers blocking reads.
pub struct SerialSource {
    lines: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
}

impl SerialSource {
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open()
            .map_err(|source| TransportError::Open {
                port: port_name.to_string(),
                source,
            })?;

        info!("Opened serial port {} at {} baud", port_name, baud_rate);

        let (sender, receiver) = mpsc::channel(64);
        std::thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_serial_lines(port, sender))?;

        Ok(Self { lines: receiver })
    }
}

/// Frames the byte stream from `port` into lines until the device goes away.
/// Read timeouts keep the partial line; a line is sent once its `\n` arrives.
fn read_serial_lines<R: Read>(port: R, sender: mpsc::Sender<Result<Vec<u8>, TransportError>>) {
    let mut reader = BufReader::new(port);
    let mut buf = Vec::new();

    loop {
        let message = match reader.read_until(b'\n', &mut buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(_) if buf.ends_with(b"\n") => Ok(mem::take(&mut buf)),
            // Partial line, the rest is still in flight
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(TransportError::Io(e)),
        };

        let fatal = message.is_err();
        if sender.blocking_send(message).is_err() {
            debug!("Serial reader stopped, receiver dropped");
            return;
        }
        if fatal {
            return;
        }
    }
}

impl LineSource for SerialSource {
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.lines.recv().await {
            Some(line) => line.map(Some),
            None => Err(TransportError::Disconnected),
        }
    }
}

/// Lines from any buffered async reader: a capture file, stdin or a byte
/// slice in tests.
pub struct ReaderSource<R> {
    reader: R,
}

impl<R> ReaderSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R> LineSource for ReaderSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut buf = Vec::new();
        let read = self.reader.read_until(b'\n', &mut buf).await?;

        Ok((read > 0).then_some(buf))
    }
}
