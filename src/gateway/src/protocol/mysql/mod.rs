pub mod constants;
pub mod error_codes;
pub mod handshake;
pub mod packet;
