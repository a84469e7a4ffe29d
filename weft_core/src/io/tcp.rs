use super::{ByteOrder, Destination, IoError, IpcChannel, IpcListener, Source};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::debug;

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// Connected TCP stream with bounded read/write times.
pub struct TcpChannel {
    stream: TcpStream,
    order: ByteOrder,
}

impl TcpChannel {
    /// Wraps an accepted stream.
    ///
    /// # Arguments
    /// * `stream` - The connection; it is switched back to blocking mode.
    /// * `io_timeout` - Upper bound for every single read and write. A
    ///   stalled peer surfaces as `IoError::Timeout`.
    /// * `order` - Byte order for multi-byte scalars in both directions.
    pub fn new(stream: TcpStream, io_timeout: Duration, order: ByteOrder) -> Result<Self, IoError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, order })
    }
}

/// Maps socket errors onto the channel taxonomy: timeouts, peer hang-ups and
/// everything else.
fn map_io(err: std::io::Error, operation: &'static str) -> IoError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => IoError::Timeout(operation),
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => IoError::Closed,
        _ => IoError::Transport(err),
    }
}

impl Source for TcpChannel {
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), IoError> {
        self.stream
            .read_exact(buf)
            .map_err(|e| map_io(e, "reading from the target"))
    }

    fn read_order(&self) -> ByteOrder {
        self.order
    }
}

impl Destination for TcpChannel {
    fn send(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.stream
            .write_all(data)
            .map_err(|e| map_io(e, "writing to the target"))
    }

    fn write_order(&self) -> ByteOrder {
        self.order
    }
}

/// Listening socket the target connects back to.
pub struct TcpIpcListener {
    listener: TcpListener,
    io_timeout: Duration,
    order: ByteOrder,
}

impl TcpIpcListener {
    /// Binds a non-blocking listener.
    ///
    /// # Arguments
    /// * `interface` / `port` - Address to listen on. Port 0 picks a free
    ///   port, see `local_addr`.
    /// * `io_timeout` - Passed to every accepted `TcpChannel`.
    /// * `order` - Byte order of accepted channels.
    pub fn bind(
        interface: &str,
        port: u16,
        io_timeout: Duration,
        order: ByteOrder,
    ) -> Result<Self, IoError> {
        let listener = TcpListener::bind((interface, port))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            io_timeout,
            order,
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, IoError> {
        Ok(self.listener.local_addr()?)
    }
}

impl IpcListener for TcpIpcListener {
    /// Polls the non-blocking socket until a peer connects or `timeout`
    /// passes.
    fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn IpcChannel>>, IoError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "target connected");
                    let channel = TcpChannel::new(stream, self.io_timeout, self.order)?;
                    return Ok(Some(Box::new(channel)));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(ACCEPT_POLL.min(deadline - now));
                }
                Err(e) => return Err(IoError::Transport(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> TcpIpcListener {
        TcpIpcListener::bind(
            "127.0.0.1",
            0,
            Duration::from_millis(200),
            ByteOrder::BigEndian,
        )
        .unwrap()
    }

    #[test]
    fn accept_times_out_without_client() {
        let mut server = listener();
        let started = Instant::now();
        let channel = server.accept(Duration::from_millis(30)).unwrap();
        assert!(channel.is_none(), "No client connected, expected None");
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn channel_exchanges_scalars_and_lines() {
        let mut server = listener();
        let addr = server.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut greeting = [0u8; 2];
            stream.read_exact(&mut greeting).unwrap();
            stream.write_all(&[0xCA, 0xFE]).unwrap();
            stream.write_all(b"pong\r\n").unwrap();
            greeting
        });

        let mut channel = server
            .accept(Duration::from_secs(2))
            .unwrap()
            .expect("client should connect");
        channel.write_u16(0x0102).unwrap();
        assert_eq!(channel.read_u16().unwrap(), 0xCAFE);
        assert_eq!(channel.read_line().unwrap(), "pong");
        assert_eq!(client.join().unwrap(), [0x01, 0x02]);
    }

    #[test]
    fn read_times_out_when_target_is_silent() {
        let mut server = listener();
        let addr = server.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let mut channel = server.accept(Duration::from_secs(2)).unwrap().unwrap();
        match channel.read_u8() {
            Err(IoError::Timeout(_)) => {}
            other => panic!("Expected Timeout, got {other:?}"),
        }
        drop(client);
    }
}
