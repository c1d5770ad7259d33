use strum_macros::AsRefStr;

// max packet payload length.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;
/// auth-plugin-data-part-1 The first 8 bytes of the scramble; the rest is
/// carried after the reserved block of the handshake payload.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;
/// The length of the scramble. (auth-plugin-data-part-1 + auth-plugin-data-part-2)
pub const SCRAMBLE_SIZE: usize = 20;

pub const UTF8_GENERAL_CI: u8 = 33;

/// Version banner placed in the synthesized greeting. Clients only see this
/// until the auth switch hands them over to the real upstream.
pub const GATEWAY_SERVER_VERSION: &[u8] = b"8.0.33-db-gateway";

/// Login-phase request from a server to redo auth with a new plugin/salt.
pub const AUTH_SWITCH_REQUEST: u8 = 0xfe;

#[derive(Debug, PartialEq, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
}

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
}
