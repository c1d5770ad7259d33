use crate::protocol::mysql::constants::AuthPluginName::AuthNativePassword;
use crate::protocol::mysql::constants::{
    AUTH_PLUGIN_DATA_PART_1_LENGTH, AUTH_SWITCH_REQUEST, GATEWAY_SERVER_VERSION, UTF8_GENERAL_CI,
};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::handshake::HandshakeResponse;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::server::gateway_capabilities;

use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::CapabilityFlags;
use mysql_common::io::WriteMysqlExt;
use std::io::{self, Write};
use tokio::io::AsyncWrite;

pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(err as u16)?;
    w.write_u8(b'#')?;
    w.write_all(err.sqlstate())?;
    w.write_all(msg)?;
    w.end_packet().await?;
    w.flush_all().await
}

/// Send the gateway's own Handshake v10 greeting.
///
/// The scramble written here only exists so the client's first login frame
/// can be parsed for routing; the response hashed against it is discarded
/// after the auth switch.
pub async fn write_initial_handshake<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    conn_id: u32,
    scramble: [u8; 20],
) -> io::Result<()> {
    writer.reset_seq();
    writer.write_all(&[10])?; // protocol 10

    writer.write_all(GATEWAY_SERVER_VERSION)?;
    writer.write_all(&[0x00])?;
    writer.write_u32::<LittleEndian>(conn_id)?;

    let server_capabilities_vec = gateway_capabilities().bits().to_le_bytes();

    writer.write_all(&scramble[0..AUTH_PLUGIN_DATA_PART_1_LENGTH])?; // auth-plugin-data-part-1
    writer.write_all(&[0x00])?;

    writer.write_all(&server_capabilities_vec[..2])?; // lower 2 bytes of the capability flags

    writer.write_all(&UTF8_GENERAL_CI.to_le_bytes())?;
    writer.write_u16::<LittleEndian>(0)?; // status flags
    writer.write_all(&server_capabilities_vec[2..4])?; // upper 2 bytes of the capability flags

    writer.write_all(&((scramble.len() + 1) as u8).to_le_bytes())?;

    writer.write_all(&[0x00; 10][..])?; // 10 bytes filler
                                        // Part2 of the auth_plugin_data
                                        // $len=MAX(13, length of auth-plugin-data - 8)
    writer.write_all(&scramble[AUTH_PLUGIN_DATA_PART_1_LENGTH..])?; // 12 bytes
    writer.write_all(&[0x00])?;

    writer.write_all(AuthNativePassword.as_ref().as_bytes())?;
    writer.write_all(&[0x00])?;
    writer.end_packet().await?;
    writer.flush_all().await
}

/// Ask the client to redo auth against the upstream's plugin and scramble.
/// `auth_data` is relayed exactly as the upstream framed it.
pub async fn write_auth_switch_request<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    plugin: &[u8],
    auth_data: &[u8],
) -> io::Result<()> {
    w.write_u8(AUTH_SWITCH_REQUEST)?;
    w.write_all(plugin)?;
    w.write_all(&[0x00])?;
    w.write_all(auth_data)?;
    w.end_packet().await?;
    w.flush_all().await
}

/// Rebuild a HandshakeResponse41 for the upstream from the client's login
/// fields, the negotiated capability intersection, and the auth bytes the
/// client produced after the auth switch.
pub async fn write_handshake_response<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    client: &HandshakeResponse,
    auth_response: &[u8],
    capability_flags: CapabilityFlags,
    plugin: &[u8],
    database: Option<&[u8]>,
) -> io::Result<()> {
    w.write_u32::<LittleEndian>(capability_flags.bits())?;
    w.write_u32::<LittleEndian>(client.max_packet_len)?;
    w.write_u8(client.collation as u8)?;
    w.write_all(&[0x00; 23])?;
    w.write_all(client.username.as_deref().unwrap_or_default())?;
    w.write_all(&[0x00])?;

    if capability_flags.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        w.write_lenenc_int(auth_response.len() as u64)?;
        w.write_all(auth_response)?;
    } else if capability_flags.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        w.write_u8(auth_response.len() as u8)?;
        w.write_all(auth_response)?;
    } else {
        w.write_all(auth_response)?;
        w.write_all(&[0x00])?;
    }

    if capability_flags.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
        w.write_all(database.unwrap_or_default())?;
        w.write_all(&[0x00])?;
    }

    if capability_flags.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        w.write_all(plugin)?;
        w.write_all(&[0x00])?;
    }

    if capability_flags.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
        let attrs = client.connect_attributes.as_deref().unwrap_or_default();
        w.write_lenenc_int(attrs.len() as u64)?;
        w.write_all(attrs)?;
    }

    w.end_packet().await?;
    w.flush_all().await
}

/// Relay an already-framed payload without inspecting it.
pub async fn write_raw_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    payload: &[u8],
) -> io::Result<()> {
    w.write_all(payload)?;
    w.end_packet().await?;
    w.flush_all().await
}
