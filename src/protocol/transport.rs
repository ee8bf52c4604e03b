use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use super::{
    ConnectionError, Record,
    record::{read_record, write_record},
};

/// A connected byte stream: TCP or a Unix-domain socket.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    /// Another handle to the same socket, used to give the reader and the
    /// writer of a connection their own stream.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Transport::Tcp(stream) => stream.try_clone().map(Transport::Tcp),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.try_clone().map(Transport::Unix),
        }
    }

    /// Closes both directions for every handle of this socket.
    pub fn shutdown(&self) -> io::Result<()> {
        let res = match self {
            Transport::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
        match res {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    /// Peer description for logs.
    pub fn peer(&self) -> String {
        match self {
            Transport::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown tcp peer".to_string()),
            #[cfg(unix)]
            Transport::Unix(_) => "unix socket peer".to_string(),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.flush(),
        }
    }
}

/// Record-level view over a byte stream. Reading needs `T: Read`, writing
/// needs `T: Write`.
pub struct RecordTransport<T> {
    stream: T,
}

impl<T> RecordTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }
}

impl<T: Read> RecordTransport<T> {
    pub fn read_record(&mut self) -> Result<Option<Record>, ConnectionError> {
        read_record(&mut self.stream)
    }
}

impl<T: Write> RecordTransport<T> {
    pub fn write_record(&mut self, record: &Record) -> Result<(), ConnectionError> {
        write_record(&mut self.stream, record)
    }

    pub fn write_records(&mut self, records: &[Record]) -> Result<(), ConnectionError> {
        for record in records {
            self.write_record(record)?;
        }
        self.stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use crate::protocol::RecordType;

    use super::*;

    #[test]
    fn read_write_records() {
        let stream = Cursor::new(Vec::new());
        let mut transport = RecordTransport::new(stream);

        let records = vec![
            Record::new(RecordType::Stdout, 1, b"payload".to_vec()),
            Record::end_of_stream(RecordType::Stdout, 1),
        ];
        transport.write_records(&records).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        assert_eq!(transport.read_record().unwrap(), Some(records[0].clone()));
        assert_eq!(transport.read_record().unwrap(), Some(records[1].clone()));
        assert_eq!(transport.read_record().unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_reaches_every_handle() {
        let (a, b) = UnixStream::pair().unwrap();
        let local = Transport::Unix(a);
        let clone = local.try_clone().unwrap();
        let mut remote = RecordTransport::new(Transport::Unix(b));

        clone.shutdown().unwrap();
        assert_eq!(remote.read_record().unwrap(), None);
        drop(local);
    }
}
