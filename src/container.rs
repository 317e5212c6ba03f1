use std::io::{self, Cursor};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u16)]
pub enum ContainerType {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

pub const CONTAINER_HEADER_SIZE: usize = 12;

/// Length-field escape for data containers larger than 4 GiB; the true
/// length is learned from the object size.
pub const CONTAINER_LENGTH_HUGE: u32 = 0xFFFF_FFFF;

/// Largest content size expressible in a normal container length field.
pub const MAX_CONTENT_SIZE: u64 = CONTAINER_LENGTH_HUGE as u64 - CONTAINER_HEADER_SIZE as u64;

/// Transactions carry ids in 1..0xFFFFFFFE; 0xFFFFFFFF marks event
/// containers outside any transaction.
pub const NO_TRANSACTION_ID: u32 = 0xFFFF_FFFF;

/// Parsed container header.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ContainerInfo {
    /// raw length field; may be CONTAINER_LENGTH_HUGE
    pub container_len: u32,

    /// Container kind
    pub kind: ContainerType,

    /// Operation, response or event code, depending on 'kind'
    pub code: u16,

    /// transaction ID that this container belongs to
    pub tid: u32,
}

impl ContainerInfo {
    pub fn parse<R: ReadBytesExt>(mut r: R) -> Result<ContainerInfo, Error> {
        let len = r.read_u32::<LittleEndian>()?;
        let kind_u16 = r.read_u16::<LittleEndian>()?;
        let kind = ContainerType::from_u16(kind_u16)
            .ok_or_else(|| Error::Malformed(format!("Invalid container type {:x}.", kind_u16)))?;
        let code = r.read_u16::<LittleEndian>()?;
        let tid = r.read_u32::<LittleEndian>()?;

        Ok(ContainerInfo {
            container_len: len,
            kind,
            code,
            tid,
        })
    }

    pub fn payload_len(&self) -> usize {
        (self.container_len as usize).saturating_sub(CONTAINER_HEADER_SIZE)
    }

    pub fn belongs_to(&self, tid: u32) -> bool {
        self.tid == tid
    }
}

/// A container received from the initiator. Accumulates segments until the
/// full payload is present.
#[derive(Debug)]
pub struct RxContainer {
    info: ContainerInfo,
    buf: Vec<u8>,
}

impl RxContainer {
    pub fn new(data: &[u8]) -> Result<RxContainer, Error> {
        if data.len() < CONTAINER_HEADER_SIZE {
            return Err(Error::Malformed(format!(
                "Container of {} bytes is shorter than its header",
                data.len()
            )));
        }
        let info = ContainerInfo::parse(&data[..CONTAINER_HEADER_SIZE])?;
        Ok(RxContainer {
            info,
            buf: data.to_vec(),
        })
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn container_type(&self) -> ContainerType {
        self.info.kind
    }

    pub fn code(&self) -> u16 {
        self.info.code
    }

    pub fn transaction_id(&self) -> u32 {
        self.info.tid
    }

    pub fn container_len(&self) -> u32 {
        self.info.container_len
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[CONTAINER_HEADER_SIZE..]
    }

    /// Request parameters: the payload interpreted as u32 values (at most
    /// five for command containers).
    pub fn params(&self) -> Vec<u32> {
        self.payload()
            .chunks_exact(4)
            .take(5)
            .map(LittleEndian::read_u32)
            .collect()
    }

    /// Cursor over the payload for typed dataset deserialization.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.payload())
    }
}

/// A container being built for transmission. The length field is patched
/// when the buffer is taken, unless explicitly overridden for the >4 GiB
/// segmented case.
#[derive(Debug)]
pub struct TxContainer {
    buf: Vec<u8>,
    kind: ContainerType,
    code: u16,
    tid: u32,
    length_override: Option<u32>,
}

impl TxContainer {
    pub fn new(kind: ContainerType, code: u16, tid: u32) -> TxContainer {
        let mut buf = Vec::with_capacity(64);
        buf.write_u32::<LittleEndian>(0).ok();
        buf.write_u16::<LittleEndian>(kind as u16).ok();
        buf.write_u16::<LittleEndian>(code).ok();
        buf.write_u32::<LittleEndian>(tid).ok();
        TxContainer {
            buf,
            kind,
            code,
            tid,
            length_override: None,
        }
    }

    pub fn container_type(&self) -> ContainerType {
        self.kind
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn transaction_id(&self) -> u32 {
        self.tid
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - CONTAINER_HEADER_SIZE
    }

    /// Override the length field; used when a data phase is longer than the
    /// container actually buffered (segmented sends).
    pub fn set_container_length(&mut self, len: u32) {
        self.length_override = Some(len);
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.length_override.unwrap_or(self.buf.len() as u32);
        LittleEndian::write_u32(&mut self.buf[..4], len);
        self.buf
    }
}

impl io::Write for TxContainer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MtpRead, MtpWrite};

    #[test]
    fn header_round_trip() {
        let mut c = TxContainer::new(ContainerType::Command, 0x1001, 7);
        c.write_mtp_u32(0xAABBCCDD).unwrap();
        let bytes = c.finish();
        assert_eq!(bytes.len(), 16);

        let info = ContainerInfo::parse(&bytes[..]).unwrap();
        assert_eq!(info.container_len, 16);
        assert_eq!(info.kind, ContainerType::Command);
        assert_eq!(info.code, 0x1001);
        assert_eq!(info.tid, 7);
        assert_eq!(info.payload_len(), 4);

        let rx = RxContainer::new(&bytes).unwrap();
        assert_eq!(rx.params(), vec![0xAABBCCDD]);
    }

    #[test]
    fn segmented_length_override() {
        let mut c = TxContainer::new(ContainerType::Data, 0x1009, 1);
        c.set_container_length(CONTAINER_LENGTH_HUGE);
        c.write_mtp_u8(0).unwrap();
        let bytes = c.finish();
        assert_eq!(LittleEndian::read_u32(&bytes[..4]), CONTAINER_LENGTH_HUGE);
    }

    #[test]
    fn rx_append_accumulates_payload() {
        let mut c = TxContainer::new(ContainerType::Data, 0x100D, 2);
        c.write_mtp_u32(1).unwrap();
        let mut bytes = c.finish();
        LittleEndian::write_u32(&mut bytes[..4], 20); // promises 8 payload bytes

        let mut rx = RxContainer::new(&bytes).unwrap();
        rx.append(&[5, 0, 0, 0]);
        assert_eq!(rx.payload().len(), 8);
        let mut r = rx.reader();
        assert_eq!(r.read_mtp_u32().unwrap(), 1);
        assert_eq!(r.read_mtp_u32().unwrap(), 5);
    }

    #[test]
    fn short_container_is_rejected() {
        assert!(RxContainer::new(&[1, 2, 3]).is_err());
    }
}
