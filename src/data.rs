use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::ToPrimitive;

use crate::Error;

/* Data type codes, as used in property descriptors and prop-list entries. */
pub const DATA_TYPE_UNDEF: u16 = 0x0000;
pub const DATA_TYPE_INT8: u16 = 0x0001;
pub const DATA_TYPE_UINT8: u16 = 0x0002;
pub const DATA_TYPE_INT16: u16 = 0x0003;
pub const DATA_TYPE_UINT16: u16 = 0x0004;
pub const DATA_TYPE_INT32: u16 = 0x0005;
pub const DATA_TYPE_UINT32: u16 = 0x0006;
pub const DATA_TYPE_INT64: u16 = 0x0007;
pub const DATA_TYPE_UINT64: u16 = 0x0008;
pub const DATA_TYPE_INT128: u16 = 0x0009;
pub const DATA_TYPE_UINT128: u16 = 0x000A;
pub const DATA_TYPE_AINT8: u16 = 0x4001;
pub const DATA_TYPE_AUINT8: u16 = 0x4002;
pub const DATA_TYPE_AINT16: u16 = 0x4003;
pub const DATA_TYPE_AUINT16: u16 = 0x4004;
pub const DATA_TYPE_AINT32: u16 = 0x4005;
pub const DATA_TYPE_AUINT32: u16 = 0x4006;
pub const DATA_TYPE_AINT64: u16 = 0x4007;
pub const DATA_TYPE_AUINT64: u16 = 0x4008;
pub const DATA_TYPE_AINT128: u16 = 0x4009;
pub const DATA_TYPE_AUINT128: u16 = 0x400A;
pub const DATA_TYPE_STR: u16 = 0xFFFF;

pub trait MtpRead: ReadBytesExt {
    fn read_mtp_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_u8()?)
    }

    fn read_mtp_i8(&mut self) -> Result<i8, Error> {
        Ok(self.read_i8()?)
    }

    fn read_mtp_u16(&mut self) -> Result<u16, Error> {
        Ok(self.read_u16::<LittleEndian>()?)
    }

    fn read_mtp_i16(&mut self) -> Result<i16, Error> {
        Ok(self.read_i16::<LittleEndian>()?)
    }

    fn read_mtp_u32(&mut self) -> Result<u32, Error> {
        Ok(self.read_u32::<LittleEndian>()?)
    }

    fn read_mtp_i32(&mut self) -> Result<i32, Error> {
        Ok(self.read_i32::<LittleEndian>()?)
    }

    fn read_mtp_u64(&mut self) -> Result<u64, Error> {
        Ok(self.read_u64::<LittleEndian>()?)
    }

    fn read_mtp_i64(&mut self) -> Result<i64, Error> {
        Ok(self.read_i64::<LittleEndian>()?)
    }

    fn read_mtp_u128(&mut self) -> Result<u128, Error> {
        Ok(self.read_u128::<LittleEndian>()?)
    }

    fn read_mtp_i128(&mut self) -> Result<i128, Error> {
        Ok(self.read_i128::<LittleEndian>()?)
    }

    #[inline(always)]
    fn read_mtp_vec<T: Sized, U: Fn(&mut Self) -> Result<T, Error>>(
        &mut self,
        func: U,
    ) -> Result<Vec<T>, Error> {
        let len = self.read_u32::<LittleEndian>()? as usize;
        (0..len).map(|_| func(self)).collect()
    }

    fn read_mtp_u8_vec(&mut self) -> Result<Vec<u8>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_u8())
    }

    fn read_mtp_i8_vec(&mut self) -> Result<Vec<i8>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_i8())
    }

    fn read_mtp_u16_vec(&mut self) -> Result<Vec<u16>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_u16())
    }

    fn read_mtp_i16_vec(&mut self) -> Result<Vec<i16>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_i16())
    }

    fn read_mtp_u32_vec(&mut self) -> Result<Vec<u32>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_u32())
    }

    fn read_mtp_i32_vec(&mut self) -> Result<Vec<i32>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_i32())
    }

    fn read_mtp_u64_vec(&mut self) -> Result<Vec<u64>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_u64())
    }

    fn read_mtp_i64_vec(&mut self) -> Result<Vec<i64>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_i64())
    }

    fn read_mtp_u128_vec(&mut self) -> Result<Vec<u128>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_u128())
    }

    fn read_mtp_i128_vec(&mut self) -> Result<Vec<i128>, Error> {
        self.read_mtp_vec(|cur| cur.read_mtp_i128())
    }

    /// Strings are a u8 count of UCS-2 code units (terminator included,
    /// 0 for the empty string) followed by the units and a trailing null.
    fn read_mtp_str(&mut self) -> Result<String, Error> {
        let len = self.read_u8()?;
        if len > 0 {
            let data: Vec<u16> = (0..(len - 1))
                .map(|_| self.read_u16::<LittleEndian>())
                .collect::<Result<Vec<_>, _>>()?;

            self.read_u16::<LittleEndian>()?;
            String::from_utf16(&data)
                .map_err(|_| Error::Malformed(format!("Invalid UTF16 data: {:?}", data)))
        } else {
            Ok("".into())
        }
    }

    fn expect_end(&mut self) -> Result<(), Error>;
}

impl<T: AsRef<[u8]>> MtpRead for Cursor<T> {
    fn expect_end(&mut self) -> Result<(), Error> {
        let len = self.get_ref().as_ref().len();
        if len as u64 != self.position() {
            Err(Error::Malformed(format!(
                "Payload {} bytes, expected {} bytes",
                len,
                self.position()
            )))
        } else {
            Ok(())
        }
    }
}

pub trait MtpWrite: WriteBytesExt {
    fn write_mtp_u8(&mut self, val: u8) -> Result<(), Error> {
        Ok(self.write_u8(val)?)
    }

    fn write_mtp_i8(&mut self, val: i8) -> Result<(), Error> {
        Ok(self.write_i8(val)?)
    }

    fn write_mtp_u16(&mut self, val: u16) -> Result<(), Error> {
        Ok(self.write_u16::<LittleEndian>(val)?)
    }

    fn write_mtp_i16(&mut self, val: i16) -> Result<(), Error> {
        Ok(self.write_i16::<LittleEndian>(val)?)
    }

    fn write_mtp_u32(&mut self, val: u32) -> Result<(), Error> {
        Ok(self.write_u32::<LittleEndian>(val)?)
    }

    fn write_mtp_i32(&mut self, val: i32) -> Result<(), Error> {
        Ok(self.write_i32::<LittleEndian>(val)?)
    }

    fn write_mtp_u64(&mut self, val: u64) -> Result<(), Error> {
        Ok(self.write_u64::<LittleEndian>(val)?)
    }

    fn write_mtp_i64(&mut self, val: i64) -> Result<(), Error> {
        Ok(self.write_i64::<LittleEndian>(val)?)
    }

    fn write_mtp_u128(&mut self, val: u128) -> Result<(), Error> {
        Ok(self.write_u128::<LittleEndian>(val)?)
    }

    fn write_mtp_i128(&mut self, val: i128) -> Result<(), Error> {
        Ok(self.write_i128::<LittleEndian>(val)?)
    }

    fn write_mtp_u16_vec(&mut self, val: &[u16]) -> Result<(), Error> {
        self.write_u32::<LittleEndian>(val.len() as u32)?;
        for item in val {
            self.write_u16::<LittleEndian>(*item)?;
        }
        Ok(())
    }

    fn write_mtp_u32_vec(&mut self, val: &[u32]) -> Result<(), Error> {
        self.write_u32::<LittleEndian>(val.len() as u32)?;
        for item in val {
            self.write_u32::<LittleEndian>(*item)?;
        }
        Ok(())
    }

    fn write_mtp_str(&mut self, val: &str) -> Result<(), Error> {
        let units: Vec<u16> = val.encode_utf16().collect();
        if units.is_empty() {
            self.write_u8(0)?;
        } else {
            self.write_u8((units.len() + 1) as u8)?;
            for unit in units {
                self.write_u16::<LittleEndian>(unit)?;
            }
            self.write_u16::<LittleEndian>(0)?;
        }
        Ok(())
    }
}

impl<W: WriteBytesExt + ?Sized> MtpWrite for W {}

/// Heterogeneous property value, tagged with the MTP data type it is
/// serialized as.
#[derive(Debug, PartialEq, PartialOrd, Clone)]
pub enum MtpData {
    UNDEF,
    INT8(i8),
    UINT8(u8),
    INT16(i16),
    UINT16(u16),
    INT32(i32),
    UINT32(u32),
    INT64(i64),
    UINT64(u64),
    INT128(i128),
    UINT128(u128),
    AINT8(Vec<i8>),
    AUINT8(Vec<u8>),
    AINT16(Vec<i16>),
    AUINT16(Vec<u16>),
    AINT32(Vec<i32>),
    AUINT32(Vec<u32>),
    AINT64(Vec<i64>),
    AUINT64(Vec<u64>),
    AINT128(Vec<i128>),
    AUINT128(Vec<u128>),
    STR(String),
}

impl MtpData {
    pub fn data_type(&self) -> u16 {
        use self::MtpData::*;
        match self {
            UNDEF => DATA_TYPE_UNDEF,
            INT8(_) => DATA_TYPE_INT8,
            UINT8(_) => DATA_TYPE_UINT8,
            INT16(_) => DATA_TYPE_INT16,
            UINT16(_) => DATA_TYPE_UINT16,
            INT32(_) => DATA_TYPE_INT32,
            UINT32(_) => DATA_TYPE_UINT32,
            INT64(_) => DATA_TYPE_INT64,
            UINT64(_) => DATA_TYPE_UINT64,
            INT128(_) => DATA_TYPE_INT128,
            UINT128(_) => DATA_TYPE_UINT128,
            AINT8(_) => DATA_TYPE_AINT8,
            AUINT8(_) => DATA_TYPE_AUINT8,
            AINT16(_) => DATA_TYPE_AINT16,
            AUINT16(_) => DATA_TYPE_AUINT16,
            AINT32(_) => DATA_TYPE_AINT32,
            AUINT32(_) => DATA_TYPE_AUINT32,
            AINT64(_) => DATA_TYPE_AINT64,
            AUINT64(_) => DATA_TYPE_AUINT64,
            AINT128(_) => DATA_TYPE_AINT128,
            AUINT128(_) => DATA_TYPE_AUINT128,
            STR(_) => DATA_TYPE_STR,
        }
    }

    pub fn encode<W: MtpWrite>(&self, out: &mut W) -> Result<(), Error> {
        use self::MtpData::*;
        match self {
            UNDEF => {}
            &INT8(val) => out.write_mtp_i8(val)?,
            &UINT8(val) => out.write_mtp_u8(val)?,
            &INT16(val) => out.write_mtp_i16(val)?,
            &UINT16(val) => out.write_mtp_u16(val)?,
            &INT32(val) => out.write_mtp_i32(val)?,
            &UINT32(val) => out.write_mtp_u32(val)?,
            &INT64(val) => out.write_mtp_i64(val)?,
            &UINT64(val) => out.write_mtp_u64(val)?,
            &INT128(val) => out.write_mtp_i128(val)?,
            &UINT128(val) => out.write_mtp_u128(val)?,
            AINT8(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_i8(*item)?;
                }
            }
            AUINT8(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_u8(*item)?;
                }
            }
            AINT16(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_i16(*item)?;
                }
            }
            AUINT16(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_u16(*item)?;
                }
            }
            AINT32(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_i32(*item)?;
                }
            }
            AUINT32(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_u32(*item)?;
                }
            }
            AINT64(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_i64(*item)?;
                }
            }
            AUINT64(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_u64(*item)?;
                }
            }
            AINT128(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_i128(*item)?;
                }
            }
            AUINT128(val) => {
                out.write_mtp_u32(val.len() as u32)?;
                for item in val {
                    out.write_mtp_u128(*item)?;
                }
            }
            STR(val) => out.write_mtp_str(val)?,
        }
        Ok(())
    }

    pub fn read_type<T: MtpRead>(kind: u16, reader: &mut T) -> Result<MtpData, Error> {
        use self::MtpData::*;
        Ok(match kind {
            DATA_TYPE_INT8 => INT8(reader.read_mtp_i8()?),
            DATA_TYPE_UINT8 => UINT8(reader.read_mtp_u8()?),
            DATA_TYPE_INT16 => INT16(reader.read_mtp_i16()?),
            DATA_TYPE_UINT16 => UINT16(reader.read_mtp_u16()?),
            DATA_TYPE_INT32 => INT32(reader.read_mtp_i32()?),
            DATA_TYPE_UINT32 => UINT32(reader.read_mtp_u32()?),
            DATA_TYPE_INT64 => INT64(reader.read_mtp_i64()?),
            DATA_TYPE_UINT64 => UINT64(reader.read_mtp_u64()?),
            DATA_TYPE_INT128 => INT128(reader.read_mtp_i128()?),
            DATA_TYPE_UINT128 => UINT128(reader.read_mtp_u128()?),
            DATA_TYPE_AINT8 => AINT8(reader.read_mtp_i8_vec()?),
            DATA_TYPE_AUINT8 => AUINT8(reader.read_mtp_u8_vec()?),
            DATA_TYPE_AINT16 => AINT16(reader.read_mtp_i16_vec()?),
            DATA_TYPE_AUINT16 => AUINT16(reader.read_mtp_u16_vec()?),
            DATA_TYPE_AINT32 => AINT32(reader.read_mtp_i32_vec()?),
            DATA_TYPE_AUINT32 => AUINT32(reader.read_mtp_u32_vec()?),
            DATA_TYPE_AINT64 => AINT64(reader.read_mtp_i64_vec()?),
            DATA_TYPE_AUINT64 => AUINT64(reader.read_mtp_u64_vec()?),
            DATA_TYPE_AINT128 => AINT128(reader.read_mtp_i128_vec()?),
            DATA_TYPE_AUINT128 => AUINT128(reader.read_mtp_u128_vec()?),
            DATA_TYPE_STR => STR(reader.read_mtp_str()?),
            _ => UNDEF,
        })
    }

    /// Default (zero/empty) value for a wire data type.
    pub fn default_for(kind: u16) -> MtpData {
        use self::MtpData::*;
        match kind {
            DATA_TYPE_INT8 => INT8(0),
            DATA_TYPE_UINT8 => UINT8(0),
            DATA_TYPE_INT16 => INT16(0),
            DATA_TYPE_UINT16 => UINT16(0),
            DATA_TYPE_INT32 => INT32(0),
            DATA_TYPE_UINT32 => UINT32(0),
            DATA_TYPE_INT64 => INT64(0),
            DATA_TYPE_UINT64 => UINT64(0),
            DATA_TYPE_INT128 => INT128(0),
            DATA_TYPE_UINT128 => UINT128(0),
            DATA_TYPE_AINT8 => AINT8(Vec::new()),
            DATA_TYPE_AUINT8 => AUINT8(Vec::new()),
            DATA_TYPE_AINT16 => AINT16(Vec::new()),
            DATA_TYPE_AUINT16 => AUINT16(Vec::new()),
            DATA_TYPE_AINT32 => AINT32(Vec::new()),
            DATA_TYPE_AUINT32 => AUINT32(Vec::new()),
            DATA_TYPE_AINT64 => AINT64(Vec::new()),
            DATA_TYPE_AUINT64 => AUINT64(Vec::new()),
            DATA_TYPE_AINT128 => AINT128(Vec::new()),
            DATA_TYPE_AUINT128 => AUINT128(Vec::new()),
            DATA_TYPE_STR => STR(String::new()),
            _ => UNDEF,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MtpData::STR(s) => Some(s),
            _ => None,
        }
    }
}

impl ToPrimitive for MtpData {
    fn to_i64(&self) -> Option<i64> {
        match self {
            MtpData::INT8(v) => Some(*v as i64),
            MtpData::UINT8(v) => Some(*v as i64),
            MtpData::INT16(v) => Some(*v as i64),
            MtpData::UINT16(v) => Some(*v as i64),
            MtpData::INT32(v) => Some(*v as i64),
            MtpData::UINT32(v) => Some(*v as i64),
            MtpData::INT64(v) => Some(*v),
            _ => None,
        }
    }

    fn to_u64(&self) -> Option<u64> {
        match self {
            MtpData::UINT8(v) => Some(*v as u64),
            MtpData::UINT16(v) => Some(*v as u64),
            MtpData::UINT32(v) => Some(*v as u64),
            MtpData::UINT64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i8> for MtpData {
    fn from(value: i8) -> Self {
        MtpData::INT8(value)
    }
}

impl From<u8> for MtpData {
    fn from(value: u8) -> Self {
        MtpData::UINT8(value)
    }
}

impl From<i16> for MtpData {
    fn from(value: i16) -> Self {
        MtpData::INT16(value)
    }
}

impl From<u16> for MtpData {
    fn from(value: u16) -> Self {
        MtpData::UINT16(value)
    }
}

impl From<i32> for MtpData {
    fn from(value: i32) -> Self {
        MtpData::INT32(value)
    }
}

impl From<u32> for MtpData {
    fn from(value: u32) -> Self {
        MtpData::UINT32(value)
    }
}

impl From<i64> for MtpData {
    fn from(value: i64) -> Self {
        MtpData::INT64(value)
    }
}

impl From<u64> for MtpData {
    fn from(value: u64) -> Self {
        MtpData::UINT64(value)
    }
}

impl From<u128> for MtpData {
    fn from(value: u128) -> Self {
        MtpData::UINT128(value)
    }
}

impl<'a> From<&'a str> for MtpData {
    fn from(value: &'a str) -> Self {
        MtpData::STR(value.to_owned())
    }
}

impl From<String> for MtpData {
    fn from(value: String) -> Self {
        MtpData::STR(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: MtpData) {
        let mut buf = Vec::new();
        value.encode(&mut buf).unwrap();
        let mut cur = Cursor::new(&buf);
        let back = MtpData::read_type(value.data_type(), &mut cur).unwrap();
        cur.expect_end().unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn scalar_round_trips() {
        round_trip(MtpData::UINT8(0x7f));
        round_trip(MtpData::INT16(-513));
        round_trip(MtpData::UINT32(0xDEADBEEF));
        round_trip(MtpData::UINT64(1 << 63));
        round_trip(MtpData::UINT128(0x0123_4567_89AB_CDEF_0011_2233_4455_6677));
    }

    #[test]
    fn array_round_trips() {
        round_trip(MtpData::AUINT8(vec![1, 2, 3]));
        round_trip(MtpData::AUINT32(vec![0, u32::MAX]));
        round_trip(MtpData::AUINT128(vec![7, 1 << 100]));
    }

    #[test]
    fn string_wire_format() {
        let mut buf = Vec::new();
        MtpData::STR("MTP".into()).encode(&mut buf).unwrap();
        // count includes terminator; units are UCS-2 LE with trailing null
        assert_eq!(
            buf,
            [4, b'M', 0, b'T', 0, b'P', 0, 0, 0]
        );

        buf.clear();
        MtpData::STR(String::new()).encode(&mut buf).unwrap();
        assert_eq!(buf, [0]);
    }

    #[test]
    fn string_round_trips() {
        round_trip(MtpData::STR("song1.mp3".into()));
        round_trip(MtpData::STR("päivä".into()));
        round_trip(MtpData::STR(String::new()));
    }

    #[test]
    fn u128_is_little_endian_low_quad_first() {
        let mut buf = Vec::new();
        MtpData::UINT128(1).encode(&mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert!(buf[1..].iter().all(|&b| b == 0));
    }
}
