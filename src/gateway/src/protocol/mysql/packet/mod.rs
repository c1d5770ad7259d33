pub mod packet_reader;
pub mod packet_writer;
pub mod writers;

use crate::protocol::mysql::constants::{self, HeaderInfo};
use std::ops::Deref;
use winnow::binary::{le_u24, le_u8};
use winnow::error::{ErrMode, ErrorKind, InputError};
use winnow::stream::Stream as _;
use winnow::token::take;
use winnow::{IResult, Parser, Partial};

type PartialBytes<'a> = Partial<&'a [u8]>;

/// `Packet` Represents the packet format of the MySql wire protocol.
/// The maximum size of a MySQL packet is 16M; if the data is >16M, it is split
/// across frames until the last frame is less than 16M.
/// [MySQL Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html)
#[derive(Clone, Debug)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet(vec)
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::ErrHeader as u8)
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() <= 5
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

#[inline]
fn one_frame(i: PartialBytes<'_>) -> IResult<PartialBytes<'_>, (u8, &[u8])> {
    let (i, length) = le_u24.parse_peek(i)?;
    let (i, seq) = le_u8.parse_peek(i)?;
    let (i, payload) = take(length).parse_peek(i)?;
    Ok((i, (seq, payload)))
}

/// Reassemble one logical packet, following 16M continuation frames.
///
/// Returns `ErrMode::Incomplete` until a full packet is buffered, so callers
/// can keep reading from the socket and retry.
pub fn packet(i: &[u8]) -> IResult<PartialBytes<'_>, (u8, Packet)> {
    let (mut input, (mut seq, mut frame)) = one_frame(Partial::new(i))?;
    let mut payload = Packet(frame.to_vec());
    while frame.len() == constants::MAX_PAYLOAD_LEN {
        let (rest, (next_seq, next_frame)) = one_frame(input)?;
        if next_seq != seq.wrapping_add(1) {
            return Err(ErrMode::Cut(InputError::new(input, ErrorKind::Verify)));
        }
        payload.extend(next_frame);
        seq = next_seq;
        frame = next_frame;
        input = rest;
    }
    Ok((input, (seq, payload)))
}

/// Bytes of `input` that `packet` did not consume.
pub(crate) fn unparsed_len(rest: &PartialBytes<'_>) -> usize {
    rest.eof_offset()
}
