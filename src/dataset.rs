use crate::data::{MtpRead, MtpWrite};
use crate::format::{FORMAT_UNDEFINED, HANDLE_ROOT};
use crate::Error;

#[cfg(feature = "serde")]
use serde::Serialize;

/// ObjectInfo dataset. The compressed size is kept as u64 internally; the
/// wire field is 32 bits and saturates at 0xFFFFFFFF for larger objects.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub object_format: u16,
    pub protection_status: u16,
    pub compressed_size: u64,
    pub thumb_format: u16,
    pub thumb_compressed_size: u32,
    pub thumb_pix_width: u32,
    pub thumb_pix_height: u32,
    pub image_pix_width: u32,
    pub image_pix_height: u32,
    pub image_bit_depth: u32,
    pub parent_object: u32,
    pub association_type: u16,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    pub capture_date: String,
    pub modification_date: String,
    pub keywords: String,
}

impl Default for ObjectInfo {
    fn default() -> Self {
        ObjectInfo {
            storage_id: 0,
            object_format: FORMAT_UNDEFINED,
            protection_status: 0,
            compressed_size: 0,
            thumb_format: FORMAT_UNDEFINED,
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 0,
            image_pix_height: 0,
            image_bit_depth: 0,
            parent_object: HANDLE_ROOT,
            association_type: 0,
            association_desc: 0,
            sequence_number: 0,
            filename: String::new(),
            capture_date: String::new(),
            modification_date: String::new(),
            keywords: String::new(),
        }
    }
}

impl ObjectInfo {
    pub fn decode<T: MtpRead>(cur: &mut T) -> Result<ObjectInfo, Error> {
        Ok(ObjectInfo {
            storage_id: cur.read_mtp_u32()?,
            object_format: cur.read_mtp_u16()?,
            protection_status: cur.read_mtp_u16()?,
            compressed_size: cur.read_mtp_u32()? as u64,
            thumb_format: cur.read_mtp_u16()?,
            thumb_compressed_size: cur.read_mtp_u32()?,
            thumb_pix_width: cur.read_mtp_u32()?,
            thumb_pix_height: cur.read_mtp_u32()?,
            image_pix_width: cur.read_mtp_u32()?,
            image_pix_height: cur.read_mtp_u32()?,
            image_bit_depth: cur.read_mtp_u32()?,
            parent_object: cur.read_mtp_u32()?,
            association_type: cur.read_mtp_u16()?,
            association_desc: cur.read_mtp_u32()?,
            sequence_number: cur.read_mtp_u32()?,
            filename: cur.read_mtp_str()?,
            capture_date: cur.read_mtp_str()?,
            modification_date: cur.read_mtp_str()?,
            keywords: cur.read_mtp_str()?,
        })
    }

    pub fn encode<W: MtpWrite>(&self, w: &mut W) -> Result<(), Error> {
        w.write_mtp_u32(self.storage_id)?;
        w.write_mtp_u16(self.object_format)?;
        w.write_mtp_u16(self.protection_status)?;
        w.write_mtp_u32(self.compressed_size.min(u32::MAX as u64) as u32)?;
        w.write_mtp_u16(self.thumb_format)?;
        w.write_mtp_u32(self.thumb_compressed_size)?;
        w.write_mtp_u32(self.thumb_pix_width)?;
        w.write_mtp_u32(self.thumb_pix_height)?;
        w.write_mtp_u32(self.image_pix_width)?;
        w.write_mtp_u32(self.image_pix_height)?;
        w.write_mtp_u32(self.image_bit_depth)?;
        w.write_mtp_u32(self.parent_object)?;
        w.write_mtp_u16(self.association_type)?;
        w.write_mtp_u32(self.association_desc)?;
        w.write_mtp_u32(self.sequence_number)?;
        w.write_mtp_str(&self.filename)?;
        w.write_mtp_str(&self.capture_date)?;
        w.write_mtp_str(&self.modification_date)?;
        w.write_mtp_str(&self.keywords)?;
        Ok(())
    }
}

/// StorageInfo dataset.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct StorageInfo {
    pub storage_type: u16,
    pub filesystem_type: u16,
    pub access_capability: u16,
    pub max_capacity: u64,
    pub free_space: u64,
    pub free_space_in_objects: u32,
    pub description: String,
    pub volume_label: String,
}

impl Default for StorageInfo {
    fn default() -> Self {
        StorageInfo {
            storage_type: 0,
            filesystem_type: 0,
            access_capability: 0,
            max_capacity: 0,
            free_space: 0,
            free_space_in_objects: 0xFFFF_FFFF,
            description: String::new(),
            volume_label: String::new(),
        }
    }
}

impl StorageInfo {
    pub fn decode<T: MtpRead>(cur: &mut T) -> Result<StorageInfo, Error> {
        Ok(StorageInfo {
            storage_type: cur.read_mtp_u16()?,
            filesystem_type: cur.read_mtp_u16()?,
            access_capability: cur.read_mtp_u16()?,
            max_capacity: cur.read_mtp_u64()?,
            free_space: cur.read_mtp_u64()?,
            free_space_in_objects: cur.read_mtp_u32()?,
            description: cur.read_mtp_str()?,
            volume_label: cur.read_mtp_str()?,
        })
    }

    pub fn encode<W: MtpWrite>(&self, w: &mut W) -> Result<(), Error> {
        w.write_mtp_u16(self.storage_type)?;
        w.write_mtp_u16(self.filesystem_type)?;
        w.write_mtp_u16(self.access_capability)?;
        w.write_mtp_u64(self.max_capacity)?;
        w.write_mtp_u64(self.free_space)?;
        w.write_mtp_u32(self.free_space_in_objects)?;
        w.write_mtp_str(&self.description)?;
        w.write_mtp_str(&self.volume_label)?;
        Ok(())
    }
}

/// DeviceInfo dataset.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct DeviceInfo {
    pub standard_version: u16,
    pub vendor_extension_id: u32,
    pub mtp_version: u16,
    pub mtp_extensions: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub playback_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn decode<T: MtpRead>(cur: &mut T) -> Result<DeviceInfo, Error> {
        Ok(DeviceInfo {
            standard_version: cur.read_mtp_u16()?,
            vendor_extension_id: cur.read_mtp_u32()?,
            mtp_version: cur.read_mtp_u16()?,
            mtp_extensions: cur.read_mtp_str()?,
            functional_mode: cur.read_mtp_u16()?,
            operations_supported: cur.read_mtp_u16_vec()?,
            events_supported: cur.read_mtp_u16_vec()?,
            device_properties_supported: cur.read_mtp_u16_vec()?,
            capture_formats: cur.read_mtp_u16_vec()?,
            playback_formats: cur.read_mtp_u16_vec()?,
            manufacturer: cur.read_mtp_str()?,
            model: cur.read_mtp_str()?,
            device_version: cur.read_mtp_str()?,
            serial_number: cur.read_mtp_str()?,
        })
    }

    pub fn encode<W: MtpWrite>(&self, w: &mut W) -> Result<(), Error> {
        w.write_mtp_u16(self.standard_version)?;
        w.write_mtp_u32(self.vendor_extension_id)?;
        w.write_mtp_u16(self.mtp_version)?;
        w.write_mtp_str(&self.mtp_extensions)?;
        w.write_mtp_u16(self.functional_mode)?;
        w.write_mtp_u16_vec(&self.operations_supported)?;
        w.write_mtp_u16_vec(&self.events_supported)?;
        w.write_mtp_u16_vec(&self.device_properties_supported)?;
        w.write_mtp_u16_vec(&self.capture_formats)?;
        w.write_mtp_u16_vec(&self.playback_formats)?;
        w.write_mtp_str(&self.manufacturer)?;
        w.write_mtp_str(&self.model)?;
        w.write_mtp_str(&self.device_version)?;
        w.write_mtp_str(&self.serial_number)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn object_info_round_trip() {
        let info = ObjectInfo {
            storage_id: 0x0001_0001,
            object_format: 0x3009,
            compressed_size: 12345,
            parent_object: 3,
            association_type: 0,
            filename: "song1.mp3".into(),
            capture_date: "20260801T120000+0000".into(),
            modification_date: "20260801T120000+0000".into(),
            ..Default::default()
        };

        let mut buf = Vec::new();
        info.encode(&mut buf).unwrap();
        let back = ObjectInfo::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn object_info_size_saturates_on_wire() {
        let info = ObjectInfo {
            compressed_size: 5 << 30,
            ..Default::default()
        };
        let mut buf = Vec::new();
        info.encode(&mut buf).unwrap();
        let back = ObjectInfo::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back.compressed_size, u32::MAX as u64);
    }

    #[test]
    fn storage_info_round_trip() {
        let info = StorageInfo {
            storage_type: 0x0003,
            filesystem_type: 0x0002,
            access_capability: 0,
            max_capacity: 64 << 30,
            free_space: 10 << 30,
            free_space_in_objects: 0xFFFF_FFFF,
            description: "Phone memory".into(),
            volume_label: "storage1".into(),
        };

        let mut buf = Vec::new();
        info.encode(&mut buf).unwrap();
        let back = StorageInfo::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(info, back);
    }
}
