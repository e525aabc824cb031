//! Wire protocol codec
//!
//! Fixed 256-byte little-endian command packets. Fields are written
//! sequentially with strict offset accumulation (the `sequence_number` field
//! at offset 61 leaves `client_send_time` at the unaligned offset 65);
//! unused fields for a given command kind stay zero. Deserialization
//! validates length, magic, and version, and drops anything else silently —
//! reception must never be interrupted by a bad packet.
//!
//! | offset | field | type |
//! |---|---|---|
//! | 0  | magic                        | u32 |
//! | 4  | version                      | i32 |
//! | 8  | command_type                 | i32 |
//! | 12 | ntp_timestamp                | i64 |
//! | 20 | scheduled_execution_time     | i64 |
//! | 28 | master_clock_timestamp       | f64 |
//! | 36 | master_clock_sample_position | i64 |
//! | 44 | sample_rate                  | i32 |
//! | 48 | target_position              | f64 |
//! | 56 | tempo_value                  | f32 |
//! | 60 | use_smooth                   | u8  |
//! | 61 | sequence_number              | i32 |
//! | 65 | client_send_time             | i64 |
//! | 73 | zero padding to 256          |     |

use crate::error::{Error, Result};

/// Packet magic, `"ANWO"` on the wire (little-endian u32).
pub const PROTOCOL_MAGIC: u32 = 0x4F57_4E41;

/// Current protocol version.
pub const PROTOCOL_VERSION: i32 = 1;

/// Every packet is exactly this long.
pub const PACKET_LEN: usize = 256;

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 9876;

/// Command discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CommandKind {
    ClockSync = 0,
    Play = 1,
    Pause = 2,
    Stop = 3,
    Seek = 4,
    Tempo = 5,
    Ping = 6,
    Pong = 7,
    ServerAnnouncement = 8,
    ClientHandshake = 9,
    ServerHandshake = 10,
}

impl CommandKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => CommandKind::ClockSync,
            1 => CommandKind::Play,
            2 => CommandKind::Pause,
            3 => CommandKind::Stop,
            4 => CommandKind::Seek,
            5 => CommandKind::Tempo,
            6 => CommandKind::Ping,
            7 => CommandKind::Pong,
            8 => CommandKind::ServerAnnouncement,
            9 => CommandKind::ClientHandshake,
            10 => CommandKind::ServerHandshake,
            _ => return None,
        })
    }
}

/// One wire command. All fields are always present on the wire; fields a
/// given kind does not use are zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub kind: CommandKind,

    /// Reference-clock ticks (100 ns since the Unix epoch)
    pub ntp_timestamp: i64,

    /// Reference-clock ticks at which the command should take effect
    pub scheduled_execution_time: i64,

    /// Leader's master clock in seconds
    pub master_clock_timestamp: f64,

    /// Leader's master clock in output frames
    pub master_clock_sample_position: i64,

    pub sample_rate: i32,

    /// Seek target in seconds
    pub target_position: f64,

    pub tempo_value: f32,
    pub use_smooth: bool,
    pub sequence_number: i32,

    /// Echoed by Pong for RTT measurement, ticks
    pub client_send_time: i64,
}

impl Command {
    /// All-zero command of the given kind.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            ntp_timestamp: 0,
            scheduled_execution_time: 0,
            master_clock_timestamp: 0.0,
            master_clock_sample_position: 0,
            sample_rate: 0,
            target_position: 0.0,
            tempo_value: 0.0,
            use_smooth: false,
            sequence_number: 0,
            client_send_time: 0,
        }
    }

    pub fn clock_sync(
        ntp_timestamp: i64,
        master_clock_timestamp: f64,
        master_clock_sample_position: i64,
        sample_rate: i32,
    ) -> Self {
        Self {
            ntp_timestamp,
            master_clock_timestamp,
            master_clock_sample_position,
            sample_rate,
            ..Self::new(CommandKind::ClockSync)
        }
    }

    pub fn ping(client_send_time: i64, sequence_number: i32) -> Self {
        Self {
            client_send_time,
            sequence_number,
            ..Self::new(CommandKind::Ping)
        }
    }

    /// Pong echoing the client's original send timestamp.
    pub fn pong(ntp_timestamp: i64, client_send_time: i64, sequence_number: i32) -> Self {
        Self {
            ntp_timestamp,
            client_send_time,
            sequence_number,
            ..Self::new(CommandKind::Pong)
        }
    }

    pub fn seek(target_position: f64, ntp_timestamp: i64) -> Self {
        Self {
            target_position,
            ntp_timestamp,
            ..Self::new(CommandKind::Seek)
        }
    }

    pub fn tempo(tempo_value: f32, use_smooth: bool, ntp_timestamp: i64) -> Self {
        Self {
            tempo_value,
            use_smooth,
            ntp_timestamp,
            ..Self::new(CommandKind::Tempo)
        }
    }

    /// Serialize into a caller-provided buffer; writes exactly
    /// [`PACKET_LEN`] bytes and returns that count.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < PACKET_LEN {
            return Err(Error::BufferTooSmall {
                len: buf.len(),
                needed: PACKET_LEN,
            });
        }

        let buf = &mut buf[..PACKET_LEN];
        buf.fill(0);

        let mut offset = 0usize;
        put(buf, &mut offset, &PROTOCOL_MAGIC.to_le_bytes());
        put(buf, &mut offset, &PROTOCOL_VERSION.to_le_bytes());
        put(buf, &mut offset, &(self.kind as i32).to_le_bytes());
        put(buf, &mut offset, &self.ntp_timestamp.to_le_bytes());
        put(buf, &mut offset, &self.scheduled_execution_time.to_le_bytes());
        put(buf, &mut offset, &self.master_clock_timestamp.to_le_bytes());
        put(buf, &mut offset, &self.master_clock_sample_position.to_le_bytes());
        put(buf, &mut offset, &self.sample_rate.to_le_bytes());
        put(buf, &mut offset, &self.target_position.to_le_bytes());
        put(buf, &mut offset, &self.tempo_value.to_le_bytes());
        put(buf, &mut offset, &[self.use_smooth as u8]);
        put(buf, &mut offset, &self.sequence_number.to_le_bytes());
        put(buf, &mut offset, &self.client_send_time.to_le_bytes());
        debug_assert_eq!(offset, 73);

        Ok(PACKET_LEN)
    }

    /// Validate and decode a packet. Returns `None` on short buffers, bad
    /// magic, bad version, or an unknown command type.
    pub fn deserialize(buf: &[u8]) -> Option<Command> {
        if buf.len() < PACKET_LEN {
            return None;
        }

        let mut offset = 0usize;
        if take_u32(buf, &mut offset) != PROTOCOL_MAGIC {
            return None;
        }
        if take_i32(buf, &mut offset) != PROTOCOL_VERSION {
            return None;
        }
        let kind = CommandKind::from_i32(take_i32(buf, &mut offset))?;

        Some(Command {
            kind,
            ntp_timestamp: take_i64(buf, &mut offset),
            scheduled_execution_time: take_i64(buf, &mut offset),
            master_clock_timestamp: take_f64(buf, &mut offset),
            master_clock_sample_position: take_i64(buf, &mut offset),
            sample_rate: take_i32(buf, &mut offset),
            target_position: take_f64(buf, &mut offset),
            tempo_value: take_f32(buf, &mut offset),
            use_smooth: take_u8(buf, &mut offset) != 0,
            sequence_number: take_i32(buf, &mut offset),
            client_send_time: take_i64(buf, &mut offset),
        })
    }
}

#[inline]
fn put(buf: &mut [u8], offset: &mut usize, bytes: &[u8]) {
    buf[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    *offset += bytes.len();
}

#[inline]
fn take<const N: usize>(buf: &[u8], offset: &mut usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[*offset..*offset + N]);
    *offset += N;
    out
}

fn take_u8(buf: &[u8], offset: &mut usize) -> u8 {
    let [b] = take::<1>(buf, offset);
    b
}

fn take_u32(buf: &[u8], offset: &mut usize) -> u32 {
    u32::from_le_bytes(take(buf, offset))
}

fn take_i32(buf: &[u8], offset: &mut usize) -> i32 {
    i32::from_le_bytes(take(buf, offset))
}

fn take_i64(buf: &[u8], offset: &mut usize) -> i64 {
    i64::from_le_bytes(take(buf, offset))
}

fn take_f32(buf: &[u8], offset: &mut usize) -> f32 {
    f32::from_le_bytes(take(buf, offset))
}

fn take_f64(buf: &[u8], offset: &mut usize) -> f64 {
    f64::from_le_bytes(take(buf, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_command() -> Command {
        Command {
            kind: CommandKind::Play,
            ntp_timestamp: 100,
            scheduled_execution_time: 200,
            master_clock_timestamp: 3.25,
            master_clock_sample_position: 143_325,
            sample_rate: 44_100,
            target_position: 12.5,
            tempo_value: 1.05,
            use_smooth: true,
            sequence_number: 42,
            client_send_time: -7,
        }
    }

    #[test]
    fn serialize_is_length_exact() {
        let mut buf = [0u8; PACKET_LEN];
        let written = full_command().serialize(&mut buf).unwrap();
        assert_eq!(written, PACKET_LEN);
    }

    #[test]
    fn serialize_rejects_short_buffer() {
        let mut buf = [0u8; 128];
        assert!(matches!(
            full_command().serialize(&mut buf),
            Err(Error::BufferTooSmall { len: 128, .. })
        ));
    }

    #[test]
    fn round_trips_every_field() {
        let command = full_command();
        let mut buf = [0u8; PACKET_LEN];
        command.serialize(&mut buf).unwrap();

        let decoded = Command::deserialize(&buf).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn magic_bytes_order_on_wire() {
        let mut buf = [0u8; PACKET_LEN];
        Command::new(CommandKind::Ping).serialize(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x41, 0x4E, 0x57, 0x4F]); // "ANWO"
    }

    #[test]
    fn field_offsets_match_layout() {
        let command = full_command();
        let mut buf = [0u8; PACKET_LEN];
        command.serialize(&mut buf).unwrap();

        assert_eq!(i32::from_le_bytes(buf[4..8].try_into().unwrap()), 1);
        assert_eq!(i32::from_le_bytes(buf[8..12].try_into().unwrap()), 1); // Play
        assert_eq!(i64::from_le_bytes(buf[12..20].try_into().unwrap()), 100);
        assert_eq!(i64::from_le_bytes(buf[20..28].try_into().unwrap()), 200);
        assert_eq!(f64::from_le_bytes(buf[28..36].try_into().unwrap()), 3.25);
        assert_eq!(
            i64::from_le_bytes(buf[36..44].try_into().unwrap()),
            143_325
        );
        assert_eq!(i32::from_le_bytes(buf[44..48].try_into().unwrap()), 44_100);
        assert_eq!(f64::from_le_bytes(buf[48..56].try_into().unwrap()), 12.5);
        assert_eq!(f32::from_le_bytes(buf[56..60].try_into().unwrap()), 1.05);
        assert_eq!(buf[60], 1);
        // sequence_number sits at the unaligned offset 61
        assert_eq!(i32::from_le_bytes(buf[61..65].try_into().unwrap()), 42);
        assert_eq!(i64::from_le_bytes(buf[65..73].try_into().unwrap()), -7);
        // padding stays zero
        assert!(buf[73..].iter().all(|&b| b == 0));
    }

    #[test]
    fn deserialize_rejects_bad_magic() {
        let mut buf = [0u8; PACKET_LEN];
        full_command().serialize(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        assert!(Command::deserialize(&buf).is_none());
    }

    #[test]
    fn deserialize_rejects_bad_version() {
        let mut buf = [0u8; PACKET_LEN];
        full_command().serialize(&mut buf).unwrap();
        buf[4] = 99;
        assert!(Command::deserialize(&buf).is_none());
    }

    #[test]
    fn deserialize_rejects_short_packet() {
        let mut buf = [0u8; PACKET_LEN];
        full_command().serialize(&mut buf).unwrap();
        assert!(Command::deserialize(&buf[..255]).is_none());
    }

    #[test]
    fn deserialize_rejects_unknown_kind() {
        let mut buf = [0u8; PACKET_LEN];
        full_command().serialize(&mut buf).unwrap();
        buf[8] = 0x7F;
        assert!(Command::deserialize(&buf).is_none());
    }

    #[test]
    fn all_kinds_round_trip() {
        for value in 0..=10 {
            let kind = CommandKind::from_i32(value).unwrap();
            let mut buf = [0u8; PACKET_LEN];
            Command::new(kind).serialize(&mut buf).unwrap();
            assert_eq!(Command::deserialize(&buf).unwrap().kind, kind);
        }
    }
}
