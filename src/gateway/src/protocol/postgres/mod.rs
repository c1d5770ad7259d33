use byteorder::{BigEndian, ByteOrder};

/// Magic protocol version of the inline TLS probe. Answered with `N`.
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Largest startup packet accepted, length field included. Real drivers stay
/// well below this even with many options.
pub const MAX_STARTUP_PACKET_LEN: usize = 8 * 1024;

/// A parsed startup message.
///
/// Parameters keep their wire order; some drivers encode side-channel
/// information by position, so a rebuilt packet must not reshuffle them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub version: u32,
    pub params: Vec<(String, String)>,
}

impl StartupMessage {
    /// Parse the payload that follows the 4-byte length field: the protocol
    /// version, then NUL-terminated key/value pairs ended by an empty key.
    /// Malformed UTF-8 is tolerated with replacement characters.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 4 {
            return None;
        }
        let version = BigEndian::read_u32(&payload[..4]);

        let mut params = Vec::new();
        let mut rest = &payload[4..];
        loop {
            let Some(key_end) = rest.iter().position(|&b| b == 0) else {
                break;
            };
            if key_end == 0 {
                // terminator
                break;
            }
            let key = String::from_utf8_lossy(&rest[..key_end]).into_owned();
            rest = &rest[key_end + 1..];
            let value_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            let value = String::from_utf8_lossy(&rest[..value_end]).into_owned();
            rest = if value_end < rest.len() {
                &rest[value_end + 1..]
            } else {
                &[]
            };
            params.push((key, value));
        }
        Some(StartupMessage { version, params })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace a parameter in place, or append it when absent.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.params.push((key.to_string(), value.to_string())),
        }
    }

    pub fn database(&self) -> Option<&str> {
        self.get("database").or_else(|| self.get("dbname"))
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    /// Serialize back to a full startup packet, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(&self.version.to_be_bytes());
        for (key, value) in &self.params {
            payload.extend_from_slice(key.as_bytes());
            payload.push(0);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);

        let mut packet = Vec::with_capacity(payload.len() + 4);
        packet.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
        packet.extend_from_slice(&payload);
        packet
    }
}

/// Encode a minimal ErrorResponse: severity, SQLSTATE, message.
pub fn error_response(message: &str) -> Vec<u8> {
    let mut fields = Vec::with_capacity(message.len() + 24);
    fields.push(b'S');
    fields.extend_from_slice(b"ERROR");
    fields.push(0);
    fields.push(b'C');
    fields.extend_from_slice(b"XX000");
    fields.push(0);
    fields.push(b'M');
    fields.extend_from_slice(message.as_bytes());
    fields.push(0);
    fields.push(0);

    let mut packet = Vec::with_capacity(fields.len() + 5);
    packet.push(b'E');
    packet.extend_from_slice(&((fields.len() + 4) as u32).to_be_bytes());
    packet.extend_from_slice(&fields);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn startup_packet(version: u32, params: &[(&str, &str)]) -> Vec<u8> {
        let msg = StartupMessage {
            version,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        msg.encode()
    }

    #[test]
    fn parse_extracts_params_in_order() {
        let packet = startup_packet(
            196608,
            &[
                ("user", "app"),
                ("database", "cw_tenant_123"),
                ("application_name", "psql"),
            ],
        );
        let msg = StartupMessage::parse(&packet[4..]).unwrap();
        assert_eq!(msg.version, 196608);
        assert_eq!(msg.user(), Some("app"));
        assert_eq!(msg.database(), Some("cw_tenant_123"));
        assert_eq!(msg.params[0].0, "user");
        assert_eq!(msg.params[2].0, "application_name");
    }

    #[test]
    fn dbname_is_accepted_as_database_alias() {
        let packet = startup_packet(196608, &[("user", "app"), ("dbname", "t1")]);
        let msg = StartupMessage::parse(&packet[4..]).unwrap();
        assert_eq!(msg.database(), Some("t1"));
    }

    #[test]
    fn rebuild_is_bit_identical_without_override() {
        let packet = startup_packet(
            196608,
            &[("user", "app"), ("database", "db"), ("options", "-c x=y")],
        );
        let msg = StartupMessage::parse(&packet[4..]).unwrap();
        assert_eq!(msg.encode(), packet);
    }

    #[test]
    fn override_rewrites_database_and_keeps_position() {
        let packet = startup_packet(196608, &[("database", "cw_tenant_123"), ("user", "app")]);
        let mut msg = StartupMessage::parse(&packet[4..]).unwrap();
        msg.set("database", "customersdb");

        let rebuilt = StartupMessage::parse(&msg.encode()[4..]).unwrap();
        assert_eq!(rebuilt.params[0], ("database".into(), "customersdb".into()));
        assert_eq!(rebuilt.user(), Some("app"));
        assert_eq!(rebuilt.version, 196608);
    }

    #[test]
    fn parse_tolerates_truncated_tail() {
        // missing trailing NUL after the last value
        let raw = b"\x00\x03\x00\x00user\0app";
        let msg = StartupMessage::parse(raw).unwrap();
        assert_eq!(msg.user(), Some("app"));
    }

    #[test]
    fn error_response_layout() {
        let packet = error_response("Unknown tenant/source for postgres: db='x' user=''");
        assert_eq!(packet[0], b'E');
        let len = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]) as usize;
        assert_eq!(len + 1, packet.len());
        assert!(packet[5..].starts_with(b"SERROR\0CXX000\0MUnknown tenant/source"));
        assert_eq!(packet[packet.len() - 2..], [0, 0]);
    }
}
