//! Wire-level opcode, key id and packet framing (spec §3.1/§6.1). This
//! module only concerns itself with the plain (unwrapped) layout; tls-auth/
//! tls-crypt add their own prefix/suffix bytes on top (`ctrl_wrap.rs`) and
//! AEAD/CBC add theirs (`data_crypt.rs`). Layout and parse-error style are
//! grounded on the corevpn `packet.rs` reference implementation, adapted to
//! this crate's `WireError` taxonomy.

use crate::error::WireError;
use crate::psid::{ProtoSessionId, PSID_LEN};

/// The 5-bit opcode space (spec §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    ControlSoftResetV1,
    ControlV1,
    AckV1,
    DataV1,
    ControlHardResetClientV2,
    ControlHardResetServerV2,
    DataV2,
    ControlHardResetClientV3,
    ControlWkcV1,
}

impl OpCode {
    pub fn value(self) -> u8 {
        match self {
            OpCode::ControlSoftResetV1 => 3,
            OpCode::ControlV1 => 4,
            OpCode::AckV1 => 5,
            OpCode::DataV1 => 6,
            OpCode::ControlHardResetClientV2 => 7,
            OpCode::ControlHardResetServerV2 => 8,
            OpCode::DataV2 => 9,
            OpCode::ControlHardResetClientV3 => 10,
            OpCode::ControlWkcV1 => 11,
        }
    }

    pub fn from_value(value: u8) -> Result<Self, WireError> {
        match value {
            3 => Ok(OpCode::ControlSoftResetV1),
            4 => Ok(OpCode::ControlV1),
            5 => Ok(OpCode::AckV1),
            6 => Ok(OpCode::DataV1),
            7 => Ok(OpCode::ControlHardResetClientV2),
            8 => Ok(OpCode::ControlHardResetServerV2),
            9 => Ok(OpCode::DataV2),
            10 => Ok(OpCode::ControlHardResetClientV3),
            11 => Ok(OpCode::ControlWkcV1),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }

    pub fn is_data(self) -> bool {
        matches!(self, OpCode::DataV1 | OpCode::DataV2)
    }

    pub fn is_hard_reset(self) -> bool {
        matches!(
            self,
            OpCode::ControlHardResetClientV2
                | OpCode::ControlHardResetServerV2
                | OpCode::ControlHardResetClientV3
        )
    }
}

/// 3-bit key multiplexer, 0..=7 with 0 reserved for the initial key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId(u8);

impl KeyId {
    pub const INITIAL: KeyId = KeyId(0);

    pub fn new(raw: u8) -> Self {
        KeyId(raw & 0x07)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Next id in the 1..=7 cycle, wrapping past 7 back to 1 (0 stays
    /// reserved for the initial key, per spec §3).
    pub fn next(self) -> KeyId {
        KeyId(if self.0 == 0 || self.0 == 7 { 1 } else { self.0 + 1 })
    }
}

/// Decoded first byte of every packet: `opcode(5) | key_id(3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: OpCode,
    pub key_id: KeyId,
}

impl PacketHeader {
    pub fn to_byte(self) -> u8 {
        (self.opcode.value() << 3) | self.key_id.value()
    }

    pub fn from_byte(byte: u8) -> Result<Self, WireError> {
        let opcode = OpCode::from_value(byte >> 3)?;
        let key_id = KeyId::new(byte & 0x07);
        Ok(PacketHeader { opcode, key_id })
    }
}

/// 24-bit peer id used by DATA_V2 to demultiplex sessions on a shared
/// socket. `0x00ff_ffff` means "unset" (spec §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId(u32);

impl PeerId {
    pub const UNSET: PeerId = PeerId(0x00ff_ffff);

    pub fn new(raw: u32) -> Self {
        PeerId(raw & 0x00ff_ffff)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_set(self) -> bool {
        self.0 != Self::UNSET.0
    }
}

/// A reassembled control-channel packet (plain body layout, before any
/// tls-auth/tls-crypt wrapping is applied or after it has been removed).
#[derive(Debug, Clone)]
pub struct ControlPacket {
    pub header: PacketHeader,
    pub src_psid: ProtoSessionId,
    pub acks: Vec<u32>,
    pub dst_psid: Option<ProtoSessionId>,
    pub msg_id: Option<u32>,
    pub payload: Vec<u8>,
}

const MAX_ACKS: u8 = 8;

impl ControlPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.payload.len());
        out.push(self.header.to_byte());
        out.extend_from_slice(self.src_psid.as_bytes());
        out.push(self.acks.len() as u8);
        for ack in &self.acks {
            out.extend_from_slice(&ack.to_be_bytes());
        }
        if !self.acks.is_empty() {
            let dst = self.dst_psid.expect("dst_psid required whenever acks is non-empty");
            out.extend_from_slice(dst.as_bytes());
        }
        if self.header.opcode != OpCode::AckV1 {
            let msg_id = self.msg_id.expect("msg_id required for non-ACK control packets");
            out.extend_from_slice(&msg_id.to_be_bytes());
            out.extend_from_slice(&self.payload);
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.is_empty() {
            return Err(WireError::Empty);
        }
        let header = PacketHeader::from_byte(data[0])?;
        let mut offset = 1usize;

        let src_psid = read_psid(data, &mut offset)?;

        if offset >= data.len() {
            return Err(WireError::TooShort {
                need: offset + 1,
                got: data.len(),
            });
        }
        let ack_len = data[offset];
        offset += 1;
        if ack_len > MAX_ACKS {
            return Err(WireError::TooManyAcks(ack_len));
        }

        let mut acks = Vec::with_capacity(ack_len as usize);
        for _ in 0..ack_len {
            acks.push(read_u32(data, &mut offset)?);
        }

        let dst_psid = if ack_len > 0 {
            Some(read_psid(data, &mut offset)?)
        } else {
            None
        };

        let (msg_id, payload) = if header.opcode != OpCode::AckV1 {
            let msg_id = read_u32(data, &mut offset)?;
            (Some(msg_id), data[offset..].to_vec())
        } else {
            (None, Vec::new())
        };

        Ok(ControlPacket {
            header,
            src_psid,
            acks,
            dst_psid,
            msg_id,
            payload,
        })
    }
}

/// A data-channel packet at the framing level: opcode/key-id, the optional
/// DATA_V2 peer id, and the (still encrypted) remainder. `data_crypt.rs`
/// owns interpreting `payload`.
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub header: PacketHeader,
    pub peer_id: Option<PeerId>,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.is_empty() {
            return Err(WireError::Empty);
        }
        let header = PacketHeader::from_byte(data[0])?;
        let mut offset = 1usize;
        let peer_id = if header.opcode == OpCode::DataV2 {
            if data.len() < offset + 3 {
                return Err(WireError::TooShort {
                    need: offset + 3,
                    got: data.len(),
                });
            }
            let raw = u32::from_be_bytes([0, data[offset], data[offset + 1], data[offset + 2]]);
            offset += 3;
            Some(PeerId::new(raw))
        } else {
            None
        };
        Ok(DataPacket {
            header,
            peer_id,
            payload: data[offset..].to_vec(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.push(self.header.to_byte());
        if let Some(peer_id) = self.peer_id {
            let bytes = peer_id.value().to_be_bytes();
            out.extend_from_slice(&bytes[1..]);
        }
        out.extend_from_slice(&self.payload);
        out
    }
}

fn read_psid(data: &[u8], offset: &mut usize) -> Result<ProtoSessionId, WireError> {
    if data.len() < *offset + PSID_LEN {
        return Err(WireError::TooShort {
            need: *offset + PSID_LEN,
            got: data.len(),
        });
    }
    let mut buf = [0u8; PSID_LEN];
    buf.copy_from_slice(&data[*offset..*offset + PSID_LEN]);
    *offset += PSID_LEN;
    Ok(ProtoSessionId::from_bytes(buf))
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, WireError> {
    if data.len() < *offset + 4 {
        return Err(WireError::TooShort {
            need: *offset + 4,
            got: data.len(),
        });
    }
    let v = u32::from_be_bytes(data[*offset..*offset + 4].try_into().unwrap());
    *offset += 4;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_byte_round_trips() {
        let header = PacketHeader {
            opcode: OpCode::ControlV1,
            key_id: KeyId::new(3),
        };
        let byte = header.to_byte();
        assert_eq!(PacketHeader::from_byte(byte).unwrap(), header);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        // opcode value 0 (top 5 bits zero) is not in the wire table.
        assert_eq!(PacketHeader::from_byte(0x00), Err(WireError::UnknownOpcode(0)));
    }

    #[test]
    fn key_id_wraps_one_through_seven() {
        assert_eq!(KeyId::new(7).next(), KeyId::new(1));
        assert_eq!(KeyId::new(3).next(), KeyId::new(4));
    }

    #[test]
    fn control_packet_round_trips_with_acks() {
        let pkt = ControlPacket {
            header: PacketHeader {
                opcode: OpCode::ControlV1,
                key_id: KeyId::new(0),
            },
            src_psid: ProtoSessionId::from_bytes([1; 8]),
            acks: vec![10, 20],
            dst_psid: Some(ProtoSessionId::from_bytes([2; 8])),
            msg_id: Some(42),
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let bytes = pkt.serialize();
        let parsed = ControlPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.src_psid, pkt.src_psid);
        assert_eq!(parsed.acks, pkt.acks);
        assert_eq!(parsed.dst_psid, pkt.dst_psid);
        assert_eq!(parsed.msg_id, pkt.msg_id);
        assert_eq!(parsed.payload, pkt.payload);
    }

    #[test]
    fn ack_only_packet_has_no_msg_id_or_payload() {
        let pkt = ControlPacket {
            header: PacketHeader {
                opcode: OpCode::AckV1,
                key_id: KeyId::new(0),
            },
            src_psid: ProtoSessionId::from_bytes([1; 8]),
            acks: vec![1],
            dst_psid: Some(ProtoSessionId::from_bytes([2; 8])),
            msg_id: None,
            payload: Vec::new(),
        };
        let bytes = pkt.serialize();
        let parsed = ControlPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.msg_id, None);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn too_many_acks_is_rejected() {
        let mut bytes = vec![PacketHeader {
            opcode: OpCode::AckV1,
            key_id: KeyId::new(0),
        }
        .to_byte()];
        bytes.extend_from_slice(&[9u8; 8]); // src_psid
        bytes.push(9); // ack_len > MAX_ACKS
        assert_eq!(ControlPacket::parse(&bytes), Err(WireError::TooManyAcks(9)));
    }

    #[test]
    fn data_v2_packet_carries_a_24_bit_peer_id() {
        let pkt = DataPacket {
            header: PacketHeader {
                opcode: OpCode::DataV2,
                key_id: KeyId::new(2),
            },
            peer_id: Some(PeerId::new(0x0102_03)),
            payload: vec![1, 2, 3],
        };
        let bytes = pkt.serialize();
        let parsed = DataPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.peer_id.unwrap().value(), 0x0102_03);
        assert_eq!(parsed.payload, vec![1, 2, 3]);
    }

    #[test]
    fn data_v1_packet_has_no_peer_id() {
        let pkt = DataPacket {
            header: PacketHeader {
                opcode: OpCode::DataV1,
                key_id: KeyId::new(1),
            },
            peer_id: None,
            payload: vec![9, 9, 9],
        };
        let bytes = pkt.serialize();
        let parsed = DataPacket::parse(&bytes).unwrap();
        assert!(parsed.peer_id.is_none());
        assert_eq!(parsed.payload, vec![9, 9, 9]);
    }

    #[test]
    fn truncated_data_v2_header_is_rejected() {
        let bytes = vec![PacketHeader {
            opcode: OpCode::DataV2,
            key_id: KeyId::new(0),
        }
        .to_byte(), 0x01];
        assert!(DataPacket::parse(&bytes).is_err());
    }
}
