/// The server error codes the gateway itself emits.
///
/// `ER_BAD_DB_ERROR` doubles as the routing-failure signal; it is reported
/// with the connection-layer SQLSTATE `08S01` so drivers treat the session as
/// unusable instead of retrying with another schema.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorKind {
    ER_HANDSHAKE_ERROR = 1043,
    ER_ACCESS_DENIED_ERROR = 1045,
    ER_BAD_DB_ERROR = 1049,
}

impl ErrorKind {
    pub fn sqlstate(&self) -> &'static [u8] {
        match self {
            ErrorKind::ER_HANDSHAKE_ERROR => b"08S01",
            ErrorKind::ER_ACCESS_DENIED_ERROR => b"28000",
            ErrorKind::ER_BAD_DB_ERROR => b"08S01",
        }
    }
}
