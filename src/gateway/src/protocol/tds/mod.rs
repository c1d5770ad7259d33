use byteorder::{BigEndian, ByteOrder, LittleEndian};

pub const TDS_HEADER_LEN: usize = 8;
/// TDS 7.x Login7 packet type.
pub const LOGIN7_PACKET_TYPE: u8 = 0x10;

// The database slot of the Login7 fixed header: UInt16 length in characters
// at 68, UInt16 offset into the UCS-2 string pool at 70. Stable across
// TDS 7.x.
const DATABASE_LEN_OFFSET: usize = 68;
const DATABASE_OFF_OFFSET: usize = 70;

/// The 8-byte header every TDS packet starts with. Length is big-endian and
/// includes the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdsHeader {
    pub packet_type: u8,
    pub status: u8,
    pub length: u16,
    pub channel: u16,
    pub packet_id: u8,
    pub window: u8,
}

impl TdsHeader {
    pub fn parse(raw: &[u8; TDS_HEADER_LEN]) -> Self {
        TdsHeader {
            packet_type: raw[0],
            status: raw[1],
            length: BigEndian::read_u16(&raw[2..4]),
            channel: BigEndian::read_u16(&raw[4..6]),
            packet_id: raw[6],
            window: raw[7],
        }
    }

    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(TDS_HEADER_LEN)
    }
}

/// Extract the database name from a Login7 payload.
///
/// Returns `None` when the slot is empty or points outside the payload, so
/// routing falls through to wildcard/prefix on an empty name instead of
/// failing the connection.
pub fn login7_database(payload: &[u8]) -> Option<String> {
    if payload.len() < DATABASE_OFF_OFFSET + 2 {
        return None;
    }
    let db_len = LittleEndian::read_u16(&payload[DATABASE_LEN_OFFSET..DATABASE_LEN_OFFSET + 2])
        as usize;
    let db_off = LittleEndian::read_u16(&payload[DATABASE_OFF_OFFSET..DATABASE_OFF_OFFSET + 2])
        as usize;
    if db_len == 0 {
        return None;
    }
    let end = db_off.checked_add(db_len * 2)?;
    if end > payload.len() {
        return None;
    }
    let code_units: Vec<u16> = payload[db_off..end]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    Some(String::from_utf16_lossy(&code_units))
}
