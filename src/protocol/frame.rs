use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::TcpStream;

use crate::config::DEFAULT_MAX_FRAME_LEN;
use crate::error::{DispatchError, Result};
use crate::protocol::header::BundleHeader;

const LENGTH_PREFIX: usize = 4;

/// A socket-like source and sink that never blocks.
///
/// `try_read` and `try_write` return `WouldBlock` when no progress can be made
/// right now and `Ok(0)` on end of stream.
pub trait NonBlockingIo {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl NonBlockingIo for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// One protocol exchange: a header, the shared data provider and the task blobs.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: BundleHeader,
    pub data_provider: Bytes,
    pub tasks: Vec<Bytes>,
}

impl Message {
    pub fn new(header: BundleHeader) -> Self {
        Self {
            header,
            data_provider: Bytes::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_data_provider(mut self, data_provider: Bytes) -> Self {
        self.data_provider = data_provider;
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<Bytes>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Serialize into the framed wire format. The header's task count is
    /// always rewritten to match the number of task frames.
    pub fn encode(&self) -> Result<Bytes> {
        let mut header = self.header.clone();
        header.task_count = i32::try_from(self.tasks.len()).map_err(|_| {
            DispatchError::Protocol(format!("too many tasks: {}", self.tasks.len()))
        })?;
        let header = header.encode()?;

        let payload_len = header.len()
            + self.data_provider.len()
            + self.tasks.iter().map(Bytes::len).sum::<usize>();
        let frames = 2 + self.tasks.len();
        let mut buf = BytesMut::with_capacity(payload_len + frames * LENGTH_PREFIX);
        put_frame(&mut buf, &header)?;
        put_frame(&mut buf, &self.data_provider)?;
        for task in &self.tasks {
            put_frame(&mut buf, task)?;
        }
        Ok(buf.freeze())
    }
}

fn put_frame(buf: &mut BytesMut, frame: &[u8]) -> Result<()> {
    let len = u32::try_from(frame.len()).map_err(|_| DispatchError::FrameTooLarge {
        len: frame.len(),
        max: u32::MAX as usize,
    })?;
    buf.put_u32(len);
    buf.put_slice(frame);
    Ok(())
}

/// Resumable reassembly of one [`Message`] from a non-blocking source.
///
/// Every call consumes as many bytes as are available without blocking and
/// picks up at the exact byte where the previous call stopped.
#[derive(Debug)]
pub struct MessageReader {
    max_frame_len: usize,
    length: [u8; LENGTH_PREFIX],
    length_filled: usize,
    body: Vec<u8>,
    body_filled: usize,
    in_body: bool,
    header: Option<BundleHeader>,
    frames: Vec<Bytes>,
    expected_frames: usize,
    message_len: usize,
    last_message_len: usize,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl MessageReader {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            length: [0; LENGTH_PREFIX],
            length_filled: 0,
            body: Vec::new(),
            body_filled: 0,
            in_body: false,
            header: None,
            frames: Vec::new(),
            expected_frames: 0,
            message_len: 0,
            last_message_len: 0,
        }
    }

    /// Make progress on the current message.
    ///
    /// Returns `Ok(None)` when the source has no more bytes right now,
    /// `Ok(Some(_))` once the full message is assembled, and
    /// [`DispatchError::ConnectionBroken`] on end of stream.
    pub fn read_from<T: NonBlockingIo + ?Sized>(&mut self, io: &T) -> Result<Option<Message>> {
        loop {
            if !self.in_body {
                let Some(n) = read_some(io, &mut self.length[self.length_filled..])? else {
                    return Ok(None);
                };
                self.length_filled += n;
                if self.length_filled < LENGTH_PREFIX {
                    continue;
                }
                let len = u32::from_be_bytes(self.length) as usize;
                if len > self.max_frame_len {
                    return Err(DispatchError::FrameTooLarge {
                        len,
                        max: self.max_frame_len,
                    });
                }
                self.length_filled = 0;
                self.body = vec![0; len];
                self.body_filled = 0;
                self.in_body = true;
            }

            if self.body_filled < self.body.len() {
                let Some(n) = read_some(io, &mut self.body[self.body_filled..])? else {
                    return Ok(None);
                };
                self.body_filled += n;
                if self.body_filled < self.body.len() {
                    continue;
                }
            }

            self.in_body = false;
            let frame = Bytes::from(std::mem::take(&mut self.body));
            self.message_len += LENGTH_PREFIX + frame.len();
            if let Some(message) = self.frame_complete(frame)? {
                return Ok(Some(message));
            }
        }
    }

    fn frame_complete(&mut self, frame: Bytes) -> Result<Option<Message>> {
        match &self.header {
            None => {
                let header = BundleHeader::decode(&frame)?;
                // data provider + one frame per task
                self.expected_frames = 1 + header.task_count as usize;
                self.frames = Vec::with_capacity(self.expected_frames.min(1024));
                self.header = Some(header);
            }
            Some(_) => self.frames.push(frame),
        }
        if self.frames.len() < self.expected_frames {
            return Ok(None);
        }
        let Some(header) = self.header.take() else {
            return Ok(None);
        };
        let mut frames = std::mem::take(&mut self.frames).into_iter();
        let data_provider = frames.next().unwrap_or_default();
        let tasks = frames.collect();
        self.last_message_len = std::mem::take(&mut self.message_len);
        self.expected_frames = 0;
        Ok(Some(Message {
            header,
            data_provider,
            tasks,
        }))
    }

    /// True when no partial message is buffered.
    pub fn is_idle(&self) -> bool {
        !self.in_body && self.length_filled == 0 && self.header.is_none()
    }

    /// Drop any partially assembled message.
    pub fn reset(&mut self) {
        *self = Self::new(self.max_frame_len);
    }

    /// Size on the wire of the last complete message.
    pub fn last_message_len(&self) -> usize {
        self.last_message_len
    }
}

fn read_some<T: NonBlockingIo + ?Sized>(io: &T, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        match io.try_read(buf) {
            Ok(0) => return Err(DispatchError::ConnectionBroken),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Resumable write of one encoded [`Message`].
#[derive(Debug)]
pub struct MessageWriter {
    buf: Bytes,
    written: usize,
}

impl MessageWriter {
    pub fn new(message: &Message) -> Result<Self> {
        Ok(Self {
            buf: message.encode()?,
            written: 0,
        })
    }

    /// Returns `Ok(true)` once every byte has been written.
    pub fn write_to<T: NonBlockingIo + ?Sized>(&mut self, io: &T) -> Result<bool> {
        while self.written < self.buf.len() {
            match io.try_write(&self.buf[self.written..]) {
                Ok(0) => return Err(DispatchError::ConnectionBroken),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.written
    }
}

/// Write a whole message, waiting for the socket to become writable as needed.
pub async fn send_message(stream: &TcpStream, message: &Message) -> Result<usize> {
    let mut writer = MessageWriter::new(message)?;
    loop {
        if writer.write_to(stream)? {
            return Ok(writer.len());
        }
        stream.writable().await?;
    }
}

/// Read a whole message, waiting for the socket to become readable as needed.
pub async fn receive_message(stream: &TcpStream, reader: &mut MessageReader) -> Result<Message> {
    loop {
        if let Some(message) = reader.read_from(stream)? {
            return Ok(message);
        }
        stream.readable().await?;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryIo;
    use super::*;
    use crate::protocol::header::Parameter;
    use rand::Rng;
    use uuid::Uuid;

    fn sample_message(tasks: usize) -> Message {
        let mut header = BundleHeader::new(Uuid::new_v4(), "sample");
        header.priority = 3;
        header.set_parameter(Parameter::BundleId, "b-1").unwrap();
        Message::new(header)
            .with_data_provider(Bytes::from_static(b"shared data"))
            .with_tasks(
                (0..tasks)
                    .map(|i| Bytes::from(format!("task-{i}").repeat(i + 1)))
                    .collect(),
            )
    }

    fn expected(message: &Message) -> Message {
        let mut expected = message.clone();
        expected.header.task_count = message.tasks.len() as i32;
        expected
    }

    #[test]
    fn roundtrip_one_byte_at_a_time() {
        let message = sample_message(5);
        let io = MemoryIo::with_chunks(1, 1);
        io.push_message(&message);

        let mut reader = MessageReader::default();
        let mut polls = 0;
        let decoded = loop {
            polls += 1;
            if let Some(m) = reader.read_from(&io).unwrap() {
                break m;
            }
            panic!("reader stalled with bytes available");
        };
        assert_eq!(polls, 1);
        assert_eq!(decoded, expected(&message));
        assert_eq!(reader.last_message_len(), message.encode().unwrap().len());
        assert!(reader.is_idle());
    }

    #[test]
    fn roundtrip_with_bytes_trickling_in() {
        let message = sample_message(4);
        let encoded = message.encode().unwrap();
        let io = MemoryIo::new();
        let mut reader = MessageReader::default();

        for (i, byte) in encoded.iter().enumerate() {
            io.push_inbound(&[*byte]);
            let out = reader.read_from(&io).unwrap();
            if i + 1 < encoded.len() {
                assert!(out.is_none(), "message completed early at byte {i}");
            } else {
                assert_eq!(out.unwrap(), expected(&message));
            }
        }
    }

    #[test]
    fn roundtrip_in_random_chunks() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let message = sample_message(rng.gen_range(0..8));
            let encoded = message.encode().unwrap();
            let io = MemoryIo::new();
            let mut reader = MessageReader::default();
            let mut offset = 0;
            let mut decoded = None;
            while offset < encoded.len() {
                let end = (offset + rng.gen_range(1..=17)).min(encoded.len());
                io.push_inbound(&encoded[offset..end]);
                offset = end;
                if let Some(m) = reader.read_from(&io).unwrap() {
                    decoded = Some(m);
                }
            }
            assert_eq!(decoded.unwrap(), expected(&message));
        }
    }

    #[test]
    fn consecutive_messages_are_not_merged() {
        let first = sample_message(2);
        let second = sample_message(0);
        let io = MemoryIo::with_chunks(3, usize::MAX);
        io.push_message(&first);
        io.push_message(&second);

        let mut reader = MessageReader::default();
        assert_eq!(reader.read_from(&io).unwrap().unwrap(), expected(&first));
        assert_eq!(reader.read_from(&io).unwrap().unwrap(), expected(&second));
        assert!(reader.read_from(&io).unwrap().is_none());
    }

    #[test]
    fn empty_data_provider_and_empty_tasks() {
        let header = BundleHeader::new(Uuid::new_v4(), "empty");
        let message = Message::new(header).with_tasks(vec![Bytes::new(), Bytes::new()]);
        let io = MemoryIo::with_chunks(1, 1);
        io.push_message(&message);
        let decoded = MessageReader::default().read_from(&io).unwrap().unwrap();
        assert_eq!(decoded.tasks.len(), 2);
        assert!(decoded.data_provider.is_empty());
        assert!(decoded.tasks.iter().all(Bytes::is_empty));
    }

    #[test]
    fn eof_mid_message_breaks_connection() {
        let encoded = sample_message(3).encode().unwrap();
        let io = MemoryIo::new();
        io.push_inbound(&encoded[..encoded.len() - 2]);
        io.close();
        let mut reader = MessageReader::default();
        assert!(matches!(
            reader.read_from(&io),
            Err(DispatchError::ConnectionBroken)
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let io = MemoryIo::new();
        io.push_inbound(&(1024u32).to_be_bytes());
        let mut reader = MessageReader::new(512);
        assert!(matches!(
            reader.read_from(&io),
            Err(DispatchError::FrameTooLarge { len: 1024, max: 512 })
        ));
    }

    #[test]
    fn corrupt_header_is_a_serialization_fault() {
        let io = MemoryIo::new();
        io.push_inbound(&3u32.to_be_bytes());
        io.push_inbound(b"{{{");
        let err = MessageReader::default().read_from(&io).unwrap_err();
        assert!(matches!(err, DispatchError::Serialization(_)));
        assert!(err.is_connection_fault());
    }

    #[test]
    fn partial_write_resumes_where_it_stopped() {
        let message = sample_message(3);
        let io = MemoryIo::with_chunks(usize::MAX, 7);
        io.set_write_budget(Some(10));

        let mut writer = MessageWriter::new(&message).unwrap();
        assert!(!writer.write_to(&io).unwrap());
        assert_eq!(writer.remaining(), writer.len() - 10);

        io.set_write_budget(Some(25));
        assert!(!writer.write_to(&io).unwrap());
        io.set_write_budget(None);
        assert!(writer.write_to(&io).unwrap());
        assert_eq!(writer.remaining(), 0);

        assert_eq!(io.take_messages(), vec![expected(&message)]);
    }

    #[test]
    fn encode_rewrites_task_count() {
        let mut message = sample_message(2);
        message.header.task_count = 99;
        let io = MemoryIo::new();
        io.push_message(&message);
        let decoded = MessageReader::default().read_from(&io).unwrap().unwrap();
        assert_eq!(decoded.header.task_count, 2);
    }
}
