use crate::protocol::mysql::constants::AuthPluginName::AuthNativePassword;

use byteorder::{ByteOrder, LittleEndian};
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::error::{ErrMode, ErrorKind, InputError};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};
use winnow::Parser;

/// `HandshakeResponse` is the client's reply to the synthesized greeting.
///
/// `connect_attributes` keeps the raw key/value block so the relayed login
/// can re-emit it untouched.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u16,
    pub username: Option<Vec<u8>>,
    pub auth_response: Vec<u8>,
    pub auth_plugin: Vec<u8>,
    pub database: Option<Vec<u8>>,
    pub connect_attributes: Option<Vec<u8>>,
}

impl HandshakeResponse {
    pub fn db_name(&self) -> String {
        match &self.database {
            Some(db) => String::from_utf8_lossy(db).to_string(),
            None => String::new(),
        }
    }

    pub fn user_name(&self) -> String {
        match &self.username {
            Some(username) => String::from_utf8_lossy(username).to_string(),
            None => String::new(),
        }
    }
}

/// Fields of the upstream server's Handshake v10 the gateway needs to relay
/// the auth switch: its scramble, plugin, and capabilities.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerHandshake {
    pub capability_flags: CapabilityFlags,
    pub collation: u8,
    pub status_flags: StatusFlags,
    pub auth_data: Vec<u8>,
    pub auth_plugin: Vec<u8>,
}

pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        // 0xfb is the NULL marker; it never appears in the login phase
        0xfb => return Err(ErrMode::Cut(InputError::new(i, ErrorKind::Verify))),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

fn null_terminated(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, bytes) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    Ok((i, bytes))
}

/// Parse a HandshakeResponse41.
///
/// `CLIENT_PROTOCOL_41` is required; pre-4.1 clients cannot carry the
/// capability negotiation the relayed login depends on.
pub fn client_handshake_response(i: &[u8]) -> IResult<&[u8], HandshakeResponse> {
    let (i, capability_flags) = le_u16.parse_peek(i)?;
    let capabilities = CapabilityFlags::from_bits_truncate(capability_flags as u32);
    if !capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        return Err(ErrMode::Cut(InputError::new(i, ErrorKind::Verify)));
    }

    let (i, cap2) = le_u16.parse_peek(i)?;
    let cap = (cap2 as u32) << 16 | capability_flags as u32;
    let capabilities = CapabilityFlags::from_bits_truncate(cap);

    let (i, max_packet_len) = le_u32.parse_peek(i)?;
    let (i, collation) = take(1u8).parse_peek(i)?;
    let (i, _) = take(23u8).parse_peek(i)?;

    let (i, username) = null_terminated(i)?;

    let (i, auth_response) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            let (i, size) = read_length_encoded_number(i)?;
            take(size).parse_peek(i)?
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let (i, size) = le_u8.parse_peek(i)?;
            take(size).parse_peek(i)?
        } else {
            null_terminated(i)?
        };

    let (i, db) = if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty()
    {
        let (i, db) = null_terminated(i)?;
        (i, Some(db))
    } else {
        (i, None)
    };

    let (i, auth_plugin) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            null_terminated(i)?
        } else {
            (i, &b""[..])
        };

    let (i, connect_attributes) =
        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !i.is_empty() {
            let (i, data_len) = read_length_encoded_number(i)?;
            let (i, data) = take(data_len).parse_peek(i)?;
            (i, Some(data.to_vec()))
        } else {
            (i, None)
        };

    Ok((
        i,
        HandshakeResponse {
            client_flag: capabilities,
            max_packet_len,
            collation: u16::from(collation[0]),
            username: Some(username.to_owned()),
            auth_response: auth_response.to_vec(),
            auth_plugin: auth_plugin.to_vec(),
            database: db.map(|c| c.to_vec()),
            connect_attributes,
        },
    ))
}

/// Parse the upstream's Handshake v10 greeting.
///
/// auth-plugin-data arrives split: 8 bytes before the capability block and
/// `max(13, auth_plugin_data_len - 8)` bytes after the reserved block. The
/// plugin name starts immediately after the second half.
pub fn server_handshake(i: &[u8]) -> IResult<&[u8], ServerHandshake> {
    let (i, protocol_version) = le_u8.parse_peek(i)?;
    if protocol_version != 10 {
        return Err(ErrMode::Cut(InputError::new(i, ErrorKind::Verify)));
    }
    let (i, _server_version) = null_terminated(i)?;
    let (i, _connection_id) = le_u32.parse_peek(i)?;
    let (i, auth_part1) = take(8u8).parse_peek(i)?;
    let (i, _filler) = take(1u8).parse_peek(i)?;
    let (i, cap_lower) = le_u16.parse_peek(i)?;
    let (i, collation) = le_u8.parse_peek(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;
    let (i, cap_upper) = le_u16.parse_peek(i)?;
    let capabilities = CapabilityFlags::from_bits_truncate(cap_lower as u32 | (cap_upper as u32) << 16);

    let (i, auth_plugin_data_len) = le_u8.parse_peek(i)?;
    let (i, _reserved) = take(10u8).parse_peek(i)?;

    let part2_len = if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
        && auth_plugin_data_len > 0
    {
        std::cmp::max(13, auth_plugin_data_len as usize - 8)
    } else {
        12
    };
    let (i, auth_part2) = take(part2_len).parse_peek(i)?;
    let mut auth_data = auth_part1.to_vec();
    auth_data.extend_from_slice(auth_part2);

    let (i, auth_plugin) = if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
        && !i.is_empty()
    {
        let (i, plugin) = null_terminated(i)?;
        if plugin.is_empty() {
            (i, AuthNativePassword.as_ref().as_bytes())
        } else {
            (i, plugin)
        }
    } else {
        (i, AuthNativePassword.as_ref().as_bytes())
    };

    Ok((
        i,
        ServerHandshake {
            capability_flags: capabilities,
            collation,
            status_flags: StatusFlags::from_bits_truncate(status_flags_value),
            auth_data,
            auth_plugin: auth_plugin.to_vec(),
        },
    ))
}

/// Decode an ERR packet for the log line; the payload itself is always
/// relayed untouched.
pub fn err_packet_summary(payload: &[u8]) -> String {
    if payload.len() >= 9 && payload[0] == 0xff {
        let code = LittleEndian::read_u16(&payload[1..3]);
        let marker = payload[3] as char;
        let state = String::from_utf8_lossy(&payload[4..9]);
        let msg = String::from_utf8_lossy(&payload[9..]);
        format!("ERR code={code} state={marker}{state} msg={msg}")
    } else {
        format!("ERR raw={payload:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::packet_reader::PacketReader;
    use mysql_common::io::WriteMysqlExt;
    use std::io::Cursor;

    #[test]
    pub fn test_handshake_parse() {
        let bytes = &[
            0x5b, 0x00, 0x00, 0x01, 0x8d, 0xa6, 0xff, 0x09, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c,
            0x74, 0x00, 0x14, 0xf7, 0xd1, 0x6c, 0xe9, 0x0d, 0x2f, 0x34, 0xb0, 0x2f, 0xd8, 0x1d,
            0x18, 0xc7, 0xa4, 0xe8, 0x98, 0x97, 0x67, 0xeb, 0xad, 0x64, 0x65, 0x66, 0x61, 0x75,
            0x6c, 0x74, 0x00, 0x6d, 0x79, 0x73, 0x71, 0x6c, 0x5f, 0x6e, 0x61, 0x74, 0x69, 0x76,
            0x65, 0x5f, 0x70, 0x61, 0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x00,
        ];
        let cursor = Cursor::new(&bytes[..]);
        let mut packet_reader = PacketReader::new(cursor);
        let (_, packet) = packet_reader.next_read().unwrap().unwrap();

        let (_, handshake) = client_handshake_response(&packet).unwrap();
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert_eq!(handshake.collation, 33);
        assert_eq!(handshake.username.as_deref(), Some(&b"default"[..]));
        assert_eq!(handshake.auth_response.len(), 20);
        assert_eq!(handshake.database.as_deref(), Some(&b"default"[..]));
        assert_eq!(handshake.auth_plugin, b"mysql_native_password");
        assert_eq!(handshake.max_packet_len, 16777216);
    }

    #[test]
    pub fn test_handshake_parse_requires_protocol_41() {
        // capability flags without CLIENT_PROTOCOL_41
        let payload = [0x85u8, 0x20, 0x00, 0x00];
        assert!(client_handshake_response(&payload).is_err());
    }

    fn greeting_payload(salt: &[u8; 20], plugin: &[u8]) -> Vec<u8> {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        let cap_bytes = caps.bits().to_le_bytes();
        let mut payload = vec![10u8];
        payload.extend_from_slice(b"10.6.14-MariaDB\0");
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(&salt[..8]);
        payload.push(0);
        payload.extend_from_slice(&cap_bytes[..2]);
        payload.push(33);
        payload.extend_from_slice(&StatusFlags::SERVER_STATUS_AUTOCOMMIT.bits().to_le_bytes());
        payload.extend_from_slice(&cap_bytes[2..4]);
        payload.push(21);
        payload.extend_from_slice(&[0u8; 10]);
        payload.extend_from_slice(&salt[8..]);
        payload.push(0);
        payload.extend_from_slice(plugin);
        payload.push(0);
        payload
    }

    #[test]
    pub fn test_server_handshake_reassembles_split_salt() {
        let salt: [u8; 20] = *b"abcdefgh_ijklmnopqrs";
        let payload = greeting_payload(&salt, b"mysql_native_password");
        let (rest, greeting) = server_handshake(&payload).unwrap();
        assert!(rest.is_empty());

        // both scramble halves plus the trailing NUL
        assert_eq!(greeting.auth_data.len(), 21);
        assert_eq!(&greeting.auth_data[..20], &salt[..]);
        assert_eq!(greeting.auth_data[20], 0);
        assert_eq!(greeting.auth_plugin, b"mysql_native_password");
        assert_eq!(greeting.collation, 33);
        assert!(greeting
            .capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH));
        assert!(greeting
            .status_flags
            .contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));
    }

    #[test]
    pub fn test_server_handshake_rejects_old_protocol() {
        let payload = [9u8, 0x35, 0x2e, 0x30, 0x00];
        assert!(server_handshake(&payload).is_err());
    }

    #[test]
    pub fn test_lenenc_number_round_trip() {
        let values = [
            0u64,
            1,
            0xfa,
            0xfb,
            0xfc,
            0xfff0,
            0xffff,
            0x1_0000,
            0xff_ffff,
            0x100_0000,
            0xffff_ffff,
            u64::MAX,
        ];
        for value in values {
            let mut encoded = Vec::new();
            encoded.write_lenenc_int(value).unwrap();
            let (rest, decoded) = read_length_encoded_number(&encoded).unwrap();
            assert!(rest.is_empty(), "value={value}");
            assert_eq!(decoded, value);
        }
    }

    #[test]
    pub fn test_lenenc_null_marker_is_an_error() {
        assert!(read_length_encoded_number(&[0xfb, 0x01]).is_err());
    }

    #[test]
    pub fn test_err_packet_summary() {
        let mut payload = vec![0xff];
        payload.extend_from_slice(&1049u16.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(b"08S01");
        payload.extend_from_slice(b"Unknown database");
        let summary = err_packet_summary(&payload);
        assert!(summary.contains("code=1049"));
        assert!(summary.contains("state=#08S01"));
        assert!(summary.contains("Unknown database"));
    }
}
