//! Flow records and their packed on-disk encoding.

use std::net::Ipv4Addr;

/// Numeric identifier of a flow-collection point.
pub type SensorId = u16;
/// Numeric identifier of a `(class, type)` pair.
pub type FlowtypeId = u8;
/// Numeric identifier of a flow class.
pub type ClassId = u8;

/// Milliseconds per hour; hourly files are keyed on this boundary.
pub const MS_PER_HOUR: i64 = 3_600_000;

/// Packed octet length of one encoded flow record.
pub const FLOW_RECORD_LEN: usize = 46;

/// One unidirectional network flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    pub sip: Ipv4Addr,
    pub dip: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub proto: u8,
    /// Cumulative TCP flags over the flow.
    pub flags: u8,
    /// Flags on the first packet.
    pub init_flags: u8,
    /// Flags on the remaining packets.
    pub sess_flags: u8,
    pub attributes: u8,
    pub packets: u32,
    pub bytes: u32,
    pub start_time_ms: i64,
    pub duration_ms: u32,
    pub sensor: SensorId,
    pub flowtype: FlowtypeId,
    pub input: u16,
    pub output: u16,
    pub application: u16,
}

impl Default for FlowRecord {
    fn default() -> Self {
        Self {
            sip: Ipv4Addr::UNSPECIFIED,
            dip: Ipv4Addr::UNSPECIFIED,
            sport: 0,
            dport: 0,
            proto: 0,
            flags: 0,
            init_flags: 0,
            sess_flags: 0,
            attributes: 0,
            packets: 0,
            bytes: 0,
            start_time_ms: 0,
            duration_ms: 0,
            sensor: 0,
            flowtype: 0,
            input: 0,
            output: 0,
            application: 0,
        }
    }
}

impl FlowRecord {
    /// End of the flow: start plus duration.
    pub fn end_time_ms(&self) -> i64 {
        self.start_time_ms + i64::from(self.duration_ms)
    }

    /// Start time rounded down to the containing hour.
    pub fn hour_ts(&self) -> i64 {
        self.start_time_ms - self.start_time_ms.rem_euclid(MS_PER_HOUR)
    }

    /// Pack into `buf`, big-endian per field.
    pub fn encode(&self, buf: &mut [u8; FLOW_RECORD_LEN]) {
        buf[0..4].copy_from_slice(&self.sip.octets());
        buf[4..8].copy_from_slice(&self.dip.octets());
        buf[8..10].copy_from_slice(&self.sport.to_be_bytes());
        buf[10..12].copy_from_slice(&self.dport.to_be_bytes());
        buf[12] = self.proto;
        buf[13] = self.flags;
        buf[14] = self.init_flags;
        buf[15] = self.sess_flags;
        buf[16] = self.attributes;
        buf[17..21].copy_from_slice(&self.packets.to_be_bytes());
        buf[21..25].copy_from_slice(&self.bytes.to_be_bytes());
        buf[25..33].copy_from_slice(&self.start_time_ms.to_be_bytes());
        buf[33..37].copy_from_slice(&self.duration_ms.to_be_bytes());
        buf[37..39].copy_from_slice(&self.sensor.to_be_bytes());
        buf[39] = self.flowtype;
        buf[40..42].copy_from_slice(&self.input.to_be_bytes());
        buf[42..44].copy_from_slice(&self.output.to_be_bytes());
        buf[44..46].copy_from_slice(&self.application.to_be_bytes());
    }

    /// Unpack a record previously written by [`encode`](Self::encode).
    pub fn decode(buf: &[u8; FLOW_RECORD_LEN]) -> Self {
        Self {
            sip: Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
            dip: Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
            sport: u16::from_be_bytes([buf[8], buf[9]]),
            dport: u16::from_be_bytes([buf[10], buf[11]]),
            proto: buf[12],
            flags: buf[13],
            init_flags: buf[14],
            sess_flags: buf[15],
            attributes: buf[16],
            packets: u32::from_be_bytes([buf[17], buf[18], buf[19], buf[20]]),
            bytes: u32::from_be_bytes([buf[21], buf[22], buf[23], buf[24]]),
            start_time_ms: i64::from_be_bytes([
                buf[25], buf[26], buf[27], buf[28], buf[29], buf[30], buf[31], buf[32],
            ]),
            duration_ms: u32::from_be_bytes([buf[33], buf[34], buf[35], buf[36]]),
            sensor: u16::from_be_bytes([buf[37], buf[38]]),
            flowtype: buf[39],
            input: u16::from_be_bytes([buf[40], buf[41]]),
            output: u16::from_be_bytes([buf[42], buf[43]]),
            application: u16::from_be_bytes([buf[44], buf[45]]),
        }
    }
}
