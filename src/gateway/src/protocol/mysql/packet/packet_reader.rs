use crate::protocol::mysql::packet::{packet, unparsed_len, Packet};

use std::io;
use std::io::prelude::*;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use winnow::error::ErrMode;

const PACKET_BUFFER_SIZE: usize = 4096;

#[macro_export]
macro_rules! async_packet_read {
    ($reader: expr) => {{
        use tracing::warn;
        let rs = $reader.next_async().await;
        if rs.is_err() {
            warn!("GatewaySrv read pkg err = {:?}", rs);
        }
        rs?.ok_or_else(|| {
            warn!("GatewaySrv pkg is none");
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection disconnect.",
            )
        })?
    }};
}

/// [PacketReader] reads from a stream and reassembles MySQL [`Packet`]s.
///
/// Bytes read past a packet boundary stay buffered; the `AsyncRead` impl
/// drains that buffer first so the splice phase never loses them.
#[derive(Debug)]
pub struct PacketReader<R> {
    buf: Vec<u8>,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader { buf: Vec::new(), r }
    }

    fn take_packet(&mut self) -> io::Result<Option<(u8, Packet)>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        match packet(&self.buf) {
            Ok((rest, (seq, pkt))) => {
                let consumed = self.buf.len() - unparsed_len(&rest);
                self.buf.drain(..consumed);
                Ok(Some((seq, pkt)))
            }
            Err(ErrMode::Incomplete(_)) => Ok(None),
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{e:?}"),
            )),
        }
    }
}

impl<R: Read> PacketReader<R> {
    pub fn next_read(&mut self) -> io::Result<Option<(u8, Packet)>> {
        loop {
            if let Some(pkt) = self.take_packet()? {
                return Ok(Some(pkt));
            }
            let mut chunk = [0u8; PACKET_BUFFER_SIZE];
            let read = self.r.read(&mut chunk)?;
            if read == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.buf.len()),
                    ))
                };
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        loop {
            if let Some(pkt) = self.take_packet()? {
                return Ok(Some(pkt));
            }
            let mut chunk = [0u8; PACKET_BUFFER_SIZE];
            let read = self.r.read(&mut chunk).await?;
            if read == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.buf.len()),
                    ))
                };
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PacketReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            let n = std::cmp::min(buf.remaining(), this.buf.len());
            buf.put_slice(&this.buf[..n]);
            this.buf.drain(..n);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut this.r).poll_read(cx, buf)
        }
    }
}
