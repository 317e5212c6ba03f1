use crate::data::{MtpData, MtpWrite, DATA_TYPE_AUINT8, DATA_TYPE_STR, DATA_TYPE_UINT128,
    DATA_TYPE_UINT16, DATA_TYPE_UINT32, DATA_TYPE_UINT64, DATA_TYPE_UINT8};
use crate::deviceinfo::DeviceInfoProvider;
use crate::format::{self, FormatCategory, ObjectFormatCode};
use crate::response::StandardResponseCode;
use crate::Error;

/* Object property codes. */
pub const OBJ_PROP_STORAGE_ID: u16 = 0xDC01;
pub const OBJ_PROP_OBJECT_FORMAT: u16 = 0xDC02;
pub const OBJ_PROP_PROTECTION_STATUS: u16 = 0xDC03;
pub const OBJ_PROP_OBJECT_SIZE: u16 = 0xDC04;
pub const OBJ_PROP_ASSOCIATION_TYPE: u16 = 0xDC05;
pub const OBJ_PROP_ASSOCIATION_DESC: u16 = 0xDC06;
pub const OBJ_PROP_OBJECT_FILE_NAME: u16 = 0xDC07;
pub const OBJ_PROP_DATE_CREATED: u16 = 0xDC08;
pub const OBJ_PROP_DATE_MODIFIED: u16 = 0xDC09;
pub const OBJ_PROP_PARENT_OBJECT: u16 = 0xDC0B;
pub const OBJ_PROP_ALLOWED_FOLDER_CONTENTS: u16 = 0xDC0C;
pub const OBJ_PROP_HIDDEN: u16 = 0xDC0D;
pub const OBJ_PROP_PERSISTENT_UNIQUE_ID: u16 = 0xDC41;
pub const OBJ_PROP_NAME: u16 = 0xDC44;
pub const OBJ_PROP_ARTIST: u16 = 0xDC46;
pub const OBJ_PROP_DATE_ADDED: u16 = 0xDC4E;
pub const OBJ_PROP_NON_CONSUMABLE: u16 = 0xDC4F;
pub const OBJ_PROP_CORRUPT_UNPLAYABLE: u16 = 0xDC50;
pub const OBJ_PROP_REP_SAMPLE_FORMAT: u16 = 0xDC81;
pub const OBJ_PROP_REP_SAMPLE_SIZE: u16 = 0xDC82;
pub const OBJ_PROP_REP_SAMPLE_HEIGHT: u16 = 0xDC83;
pub const OBJ_PROP_REP_SAMPLE_WIDTH: u16 = 0xDC84;
pub const OBJ_PROP_REP_SAMPLE_DATA: u16 = 0xDC86;
pub const OBJ_PROP_WIDTH: u16 = 0xDC87;
pub const OBJ_PROP_HEIGHT: u16 = 0xDC88;
pub const OBJ_PROP_DURATION: u16 = 0xDC89;
pub const OBJ_PROP_TRACK: u16 = 0xDC8B;
pub const OBJ_PROP_GENRE: u16 = 0xDC8C;
pub const OBJ_PROP_USE_COUNT: u16 = 0xDC91;
pub const OBJ_PROP_ALBUM_NAME: u16 = 0xDC9A;
pub const OBJ_PROP_DRM_STATUS: u16 = 0xDC9D;
pub const OBJ_PROP_BITRATE_TYPE: u16 = 0xDE92;
pub const OBJ_PROP_SAMPLE_RATE: u16 = 0xDE93;
pub const OBJ_PROP_NBR_OF_CHANNELS: u16 = 0xDE94;
pub const OBJ_PROP_AUDIO_WAVE_CODEC: u16 = 0xDE99;
pub const OBJ_PROP_AUDIO_BITRATE: u16 = 0xDE9A;
pub const OBJ_PROP_VIDEO_FOURCC_CODEC: u16 = 0xDE9B;
pub const OBJ_PROP_VIDEO_BITRATE: u16 = 0xDE9C;
pub const OBJ_PROP_FRAMES_PER_THOUSAND_SECS: u16 = 0xDE9D;

/* Device property codes. */
pub const DEV_PROP_BATTERY_LEVEL: u16 = 0x5001;
pub const DEV_PROP_SYNCHRONIZATION_PARTNER: u16 = 0xD401;
pub const DEV_PROP_DEVICE_FRIENDLY_NAME: u16 = 0xD402;
pub const DEV_PROP_VOLUME: u16 = 0xD403;
pub const DEV_PROP_DEVICE_ICON: u16 = 0xD405;
pub const DEV_PROP_PERCEIVED_DEVICE_TYPE: u16 = 0xD407;

/* Form flags used in property describing datasets. */
pub const FORM_FLAG_NONE: u8 = 0x00;
pub const FORM_FLAG_RANGE: u8 = 0x01;
pub const FORM_FLAG_ENUM: u8 = 0x02;
pub const FORM_FLAG_DATE_TIME: u8 = 0x03;
pub const FORM_FLAG_FIXED_ARRAY: u8 = 0x04;
pub const FORM_FLAG_REGEX: u8 = 0x05;
pub const FORM_FLAG_BYTE_ARRAY: u8 = 0x06;
pub const FORM_FLAG_LONG_STRING: u8 = 0xFF;

/// FORM field of a property describing dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum FormField {
    None,
    Range {
        min: MtpData,
        max: MtpData,
        step: MtpData,
    },
    Enum(Vec<MtpData>),
    DateTime,
    ByteArray,
}

impl FormField {
    pub fn flag(&self) -> u8 {
        match self {
            FormField::None => FORM_FLAG_NONE,
            FormField::Range { .. } => FORM_FLAG_RANGE,
            FormField::Enum(_) => FORM_FLAG_ENUM,
            FormField::DateTime => FORM_FLAG_DATE_TIME,
            FormField::ByteArray => FORM_FLAG_BYTE_ARRAY,
        }
    }

    pub fn encode<W: MtpWrite>(&self, w: &mut W) -> Result<(), Error> {
        w.write_mtp_u8(self.flag())?;
        match self {
            FormField::Range { min, max, step } => {
                min.encode(w)?;
                max.encode(w)?;
                step.encode(w)?;
            }
            FormField::Enum(values) => {
                w.write_mtp_u16(values.len() as u16)?;
                for value in values {
                    value.encode(w)?;
                }
            }
            FormField::None | FormField::DateTime | FormField::ByteArray => {}
        }
        Ok(())
    }
}

/// Describing dataset for one object property within a format category.
#[derive(Debug, Clone)]
pub struct ObjPropDesc {
    pub code: u16,
    pub data_type: u16,
    pub writable: bool,
    pub default: MtpData,
    pub group_code: u32,
    pub form: FormField,
}

impl ObjPropDesc {
    pub fn encode<W: MtpWrite>(&self, w: &mut W) -> Result<(), Error> {
        w.write_mtp_u16(self.code)?;
        w.write_mtp_u16(self.data_type)?;
        w.write_mtp_u8(self.writable as u8)?;
        self.default.encode(w)?;
        w.write_mtp_u32(self.group_code)?;
        self.form.encode(w)?;
        Ok(())
    }
}

/// Describing dataset for one device property.
#[derive(Debug, Clone)]
pub struct DevPropDesc {
    pub code: u16,
    pub data_type: u16,
    pub writable: bool,
    pub default: MtpData,
    pub current: MtpData,
    pub form: FormField,
}

impl DevPropDesc {
    pub fn encode<W: MtpWrite>(&self, w: &mut W) -> Result<(), Error> {
        w.write_mtp_u16(self.code)?;
        w.write_mtp_u16(self.data_type)?;
        w.write_mtp_u8(self.writable as u8)?;
        self.default.encode(w)?;
        self.current.encode(w)?;
        self.form.encode(w)?;
        Ok(())
    }
}

/// Static descriptor tables for supported object and device properties,
/// keyed by object format category. Enum and range forms are populated from
/// the device-info provider when the registry is built.
pub struct PropertyRegistry {
    common: Vec<ObjPropDesc>,
    image: Vec<ObjPropDesc>,
    audio: Vec<ObjPropDesc>,
    video: Vec<ObjPropDesc>,
    device: Vec<u16>,
}

impl PropertyRegistry {
    pub fn new(provider: &DeviceInfoProvider) -> PropertyRegistry {
        PropertyRegistry {
            common: common_props(),
            image: image_props(provider),
            audio: audio_props(provider, FormatCategory::Audio),
            video: video_props(provider),
            device: vec![
                DEV_PROP_BATTERY_LEVEL,
                DEV_PROP_SYNCHRONIZATION_PARTNER,
                DEV_PROP_DEVICE_FRIENDLY_NAME,
                DEV_PROP_DEVICE_ICON,
                DEV_PROP_PERCEIVED_DEVICE_TYPE,
            ],
        }
    }

    fn category_table(&self, category: FormatCategory) -> Option<&[ObjPropDesc]> {
        match category {
            FormatCategory::Common => Some(&[]),
            FormatCategory::Image => Some(&self.image),
            FormatCategory::Audio => Some(&self.audio),
            FormatCategory::Video => Some(&self.video),
            FormatCategory::Unsupported => None,
        }
    }

    /// Common properties plus the category-specific ones, deduplicated.
    pub fn object_props_supported(
        &self,
        category: FormatCategory,
    ) -> Result<Vec<u16>, StandardResponseCode> {
        let specific = self
            .category_table(category)
            .ok_or(StandardResponseCode::InvalidObjectPropFormat)?;
        let mut codes: Vec<u16> = self.common.iter().map(|desc| desc.code).collect();
        for desc in specific {
            if !codes.contains(&desc.code) {
                codes.push(desc.code);
            }
        }
        Ok(codes)
    }

    /// The common table is searched first, then the category-specific one.
    pub fn object_prop_desc(
        &self,
        category: FormatCategory,
        code: u16,
    ) -> Result<&ObjPropDesc, StandardResponseCode> {
        if let Some(desc) = self.common.iter().find(|desc| desc.code == code) {
            return Ok(desc);
        }
        self.category_table(category)
            .and_then(|table| table.iter().find(|desc| desc.code == code))
            .ok_or(StandardResponseCode::InvalidObjectPropCode)
    }

    pub fn device_props_supported(&self) -> &[u16] {
        &self.device
    }

    /// Device property descriptors are assembled on demand so the current
    /// value always reflects the provider.
    pub fn device_prop_desc(
        &self,
        code: u16,
        provider: &DeviceInfoProvider,
    ) -> Result<DevPropDesc, StandardResponseCode> {
        if !self.device.contains(&code) {
            return Err(StandardResponseCode::DevicePropNotSupported);
        }
        let desc = match code {
            DEV_PROP_BATTERY_LEVEL => DevPropDesc {
                code,
                data_type: DATA_TYPE_UINT8,
                writable: false,
                default: MtpData::UINT8(0),
                current: MtpData::UINT8(provider.battery_level()),
                form: FormField::Range {
                    min: MtpData::UINT8(0),
                    max: MtpData::UINT8(100),
                    step: MtpData::UINT8(1),
                },
            },
            DEV_PROP_SYNCHRONIZATION_PARTNER => DevPropDesc {
                code,
                data_type: DATA_TYPE_STR,
                writable: true,
                default: MtpData::STR(String::new()),
                current: MtpData::STR(provider.sync_partner().into()),
                form: FormField::None,
            },
            DEV_PROP_DEVICE_FRIENDLY_NAME => DevPropDesc {
                code,
                data_type: DATA_TYPE_STR,
                writable: true,
                default: MtpData::STR(String::new()),
                current: MtpData::STR(provider.friendly_name().into()),
                form: FormField::None,
            },
            DEV_PROP_DEVICE_ICON => DevPropDesc {
                code,
                data_type: DATA_TYPE_AUINT8,
                writable: false,
                default: MtpData::AUINT8(Vec::new()),
                current: MtpData::AUINT8(provider.device_icon().to_vec()),
                form: FormField::None,
            },
            DEV_PROP_PERCEIVED_DEVICE_TYPE => DevPropDesc {
                code,
                data_type: DATA_TYPE_UINT32,
                writable: false,
                default: MtpData::UINT32(0),
                current: MtpData::UINT32(provider.device_type()),
                form: FormField::None,
            },
            _ => return Err(StandardResponseCode::DevicePropNotSupported),
        };
        Ok(desc)
    }
}

fn common_props() -> Vec<ObjPropDesc> {
    vec![
        ObjPropDesc {
            code: OBJ_PROP_STORAGE_ID,
            data_type: DATA_TYPE_UINT32,
            writable: false,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_OBJECT_FORMAT,
            data_type: DATA_TYPE_UINT16,
            writable: false,
            default: MtpData::UINT16(0),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_PROTECTION_STATUS,
            data_type: DATA_TYPE_UINT16,
            writable: false,
            default: MtpData::UINT16(0),
            group_code: 0,
            form: FormField::Enum(vec![
                MtpData::UINT16(format::PROTECTION_NONE),
                MtpData::UINT16(format::PROTECTION_READ_ONLY),
                MtpData::UINT16(format::PROTECTION_READ_ONLY_DATA),
                MtpData::UINT16(format::PROTECTION_NON_TRANSFERRABLE_DATA),
            ]),
        },
        ObjPropDesc {
            code: OBJ_PROP_OBJECT_SIZE,
            data_type: DATA_TYPE_UINT64,
            writable: false,
            default: MtpData::UINT64(0),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_OBJECT_FILE_NAME,
            data_type: DATA_TYPE_STR,
            writable: true,
            default: MtpData::STR(String::new()),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_DATE_CREATED,
            data_type: DATA_TYPE_STR,
            writable: false,
            default: MtpData::STR(String::new()),
            group_code: 0,
            form: FormField::DateTime,
        },
        ObjPropDesc {
            code: OBJ_PROP_DATE_MODIFIED,
            data_type: DATA_TYPE_STR,
            writable: false,
            default: MtpData::STR(String::new()),
            group_code: 0,
            form: FormField::DateTime,
        },
        ObjPropDesc {
            code: OBJ_PROP_PARENT_OBJECT,
            data_type: DATA_TYPE_UINT32,
            writable: false,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_PERSISTENT_UNIQUE_ID,
            data_type: DATA_TYPE_UINT128,
            writable: false,
            default: MtpData::UINT128(0),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_NAME,
            data_type: DATA_TYPE_STR,
            writable: true,
            default: MtpData::STR(String::new()),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_NON_CONSUMABLE,
            data_type: DATA_TYPE_UINT8,
            writable: false,
            default: MtpData::UINT8(0),
            group_code: 0,
            form: FormField::Enum(vec![MtpData::UINT8(0x00), MtpData::UINT8(0x01)]),
        },
    ]
}

fn image_props(provider: &DeviceInfoProvider) -> Vec<ObjPropDesc> {
    let (min, max) = provider.image_dimension_range();
    let dim_range = || FormField::Range {
        min: MtpData::UINT32(min),
        max: MtpData::UINT32(max),
        step: MtpData::UINT32(1),
    };
    vec![
        ObjPropDesc {
            code: OBJ_PROP_WIDTH,
            data_type: DATA_TYPE_UINT32,
            writable: false,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: dim_range(),
        },
        ObjPropDesc {
            code: OBJ_PROP_HEIGHT,
            data_type: DATA_TYPE_UINT32,
            writable: false,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: dim_range(),
        },
        ObjPropDesc {
            code: OBJ_PROP_REP_SAMPLE_FORMAT,
            data_type: DATA_TYPE_UINT16,
            writable: false,
            default: MtpData::UINT16(0),
            group_code: 0,
            form: FormField::Enum(vec![
                MtpData::UINT16(ObjectFormatCode::Jfif.value()),
                MtpData::UINT16(ObjectFormatCode::Png.value()),
            ]),
        },
        ObjPropDesc {
            code: OBJ_PROP_REP_SAMPLE_WIDTH,
            data_type: DATA_TYPE_UINT32,
            writable: false,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: dim_range(),
        },
        ObjPropDesc {
            code: OBJ_PROP_REP_SAMPLE_HEIGHT,
            data_type: DATA_TYPE_UINT32,
            writable: false,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: dim_range(),
        },
        ObjPropDesc {
            code: OBJ_PROP_REP_SAMPLE_DATA,
            data_type: DATA_TYPE_AUINT8,
            writable: false,
            default: MtpData::AUINT8(Vec::new()),
            group_code: 0,
            form: FormField::ByteArray,
        },
    ]
}

fn audio_props(provider: &DeviceInfoProvider, category: FormatCategory) -> Vec<ObjPropDesc> {
    let (min_rate, max_rate) = provider.audio_bitrate_range();
    let channels = match category {
        FormatCategory::Video => provider.video_channels(),
        _ => provider.audio_channels(),
    };
    vec![
        ObjPropDesc {
            code: OBJ_PROP_ARTIST,
            data_type: DATA_TYPE_STR,
            writable: true,
            default: MtpData::STR(String::new()),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_ALBUM_NAME,
            data_type: DATA_TYPE_STR,
            writable: true,
            default: MtpData::STR(String::new()),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_TRACK,
            data_type: DATA_TYPE_UINT16,
            writable: true,
            default: MtpData::UINT16(0),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_GENRE,
            data_type: DATA_TYPE_STR,
            writable: true,
            default: MtpData::STR(String::new()),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_USE_COUNT,
            data_type: DATA_TYPE_UINT32,
            writable: true,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_DURATION,
            data_type: DATA_TYPE_UINT32,
            writable: true,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: FormField::None,
        },
        ObjPropDesc {
            code: OBJ_PROP_BITRATE_TYPE,
            data_type: DATA_TYPE_UINT16,
            writable: true,
            default: MtpData::UINT16(0),
            group_code: 0,
            form: FormField::Enum(vec![
                MtpData::UINT16(format::BITRATE_TYPE_UNUSED),
                MtpData::UINT16(format::BITRATE_TYPE_DISCRETE),
                MtpData::UINT16(format::BITRATE_TYPE_VARIABLE),
                MtpData::UINT16(format::BITRATE_TYPE_FREE),
            ]),
        },
        ObjPropDesc {
            code: OBJ_PROP_SAMPLE_RATE,
            data_type: DATA_TYPE_UINT32,
            writable: true,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: FormField::Enum(
                provider
                    .sample_rates()
                    .iter()
                    .map(|rate| MtpData::UINT32(*rate))
                    .collect(),
            ),
        },
        ObjPropDesc {
            code: OBJ_PROP_NBR_OF_CHANNELS,
            data_type: DATA_TYPE_UINT16,
            writable: true,
            default: MtpData::UINT16(0),
            group_code: 0,
            form: FormField::Enum(channels.iter().map(|ch| MtpData::UINT16(*ch)).collect()),
        },
        ObjPropDesc {
            code: OBJ_PROP_AUDIO_WAVE_CODEC,
            data_type: DATA_TYPE_UINT32,
            writable: true,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: FormField::Enum(
                provider
                    .supported_audio_codecs()
                    .iter()
                    .map(|codec| MtpData::UINT32(*codec))
                    .collect(),
            ),
        },
        ObjPropDesc {
            code: OBJ_PROP_AUDIO_BITRATE,
            data_type: DATA_TYPE_UINT32,
            writable: true,
            default: MtpData::UINT32(0),
            group_code: 0,
            form: FormField::Range {
                min: MtpData::UINT32(min_rate),
                max: MtpData::UINT32(max_rate),
                step: MtpData::UINT32(1),
            },
        },
        ObjPropDesc {
            code: OBJ_PROP_DRM_STATUS,
            data_type: DATA_TYPE_UINT16,
            writable: true,
            default: MtpData::UINT16(0),
            group_code: 0,
            form: FormField::Enum(vec![
                MtpData::UINT16(format::DRM_UNPROTECTED),
                MtpData::UINT16(format::DRM_PROTECTED),
            ]),
        },
    ]
}

fn video_props(provider: &DeviceInfoProvider) -> Vec<ObjPropDesc> {
    let (min_dim, max_dim) = provider.video_dimension_range();
    let (min_rate, max_rate) = provider.video_bitrate_range();
    let (min_fps, max_fps) = provider.video_framerate_range();
    let dim_range = || FormField::Range {
        min: MtpData::UINT32(min_dim),
        max: MtpData::UINT32(max_dim),
        step: MtpData::UINT32(1),
    };

    let mut props = audio_props(provider, FormatCategory::Video);
    props.push(ObjPropDesc {
        code: OBJ_PROP_VIDEO_FOURCC_CODEC,
        data_type: DATA_TYPE_UINT32,
        writable: true,
        default: MtpData::UINT32(0),
        group_code: 0,
        form: FormField::Enum(vec![
            MtpData::UINT32(0x4449_5643), // DIVC
            MtpData::UINT32(0x574D_5631), // WMV1
            MtpData::UINT32(0x574D_5633), // WMV3
            MtpData::UINT32(0x3436_3248), // H264
        ]),
    });
    props.push(ObjPropDesc {
        code: OBJ_PROP_VIDEO_BITRATE,
        data_type: DATA_TYPE_UINT32,
        writable: true,
        default: MtpData::UINT32(0),
        group_code: 0,
        form: FormField::Range {
            min: MtpData::UINT32(min_rate),
            max: MtpData::UINT32(max_rate),
            step: MtpData::UINT32(1),
        },
    });
    props.push(ObjPropDesc {
        code: OBJ_PROP_FRAMES_PER_THOUSAND_SECS,
        data_type: DATA_TYPE_UINT32,
        writable: true,
        default: MtpData::UINT32(0),
        group_code: 0,
        form: FormField::Range {
            min: MtpData::UINT32(min_fps),
            max: MtpData::UINT32(max_fps),
            step: MtpData::UINT32(1),
        },
    });
    props.push(ObjPropDesc {
        code: OBJ_PROP_WIDTH,
        data_type: DATA_TYPE_UINT32,
        writable: true,
        default: MtpData::UINT32(0),
        group_code: 0,
        form: dim_range(),
    });
    props.push(ObjPropDesc {
        code: OBJ_PROP_HEIGHT,
        data_type: DATA_TYPE_UINT32,
        writable: true,
        default: MtpData::UINT32(0),
        group_code: 0,
        form: dim_range(),
    });
    props
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PropertyRegistry {
        PropertyRegistry::new(&DeviceInfoProvider::new())
    }

    #[test]
    fn common_props_present_for_every_category() {
        let registry = registry();
        for category in [
            FormatCategory::Common,
            FormatCategory::Image,
            FormatCategory::Audio,
            FormatCategory::Video,
        ] {
            let codes = registry.object_props_supported(category).unwrap();
            assert!(codes.contains(&OBJ_PROP_STORAGE_ID));
            assert!(codes.contains(&OBJ_PROP_OBJECT_FILE_NAME));
            assert!(codes.contains(&OBJ_PROP_PERSISTENT_UNIQUE_ID));
        }
    }

    #[test]
    fn category_props_do_not_leak_across_categories() {
        let registry = registry();
        let image = registry.object_props_supported(FormatCategory::Image).unwrap();
        assert!(image.contains(&OBJ_PROP_REP_SAMPLE_DATA));
        assert!(!image.contains(&OBJ_PROP_ARTIST));

        let audio = registry.object_props_supported(FormatCategory::Audio).unwrap();
        assert!(audio.contains(&OBJ_PROP_ARTIST));
        assert!(!audio.contains(&OBJ_PROP_REP_SAMPLE_DATA));
    }

    #[test]
    fn supported_set_is_deduplicated() {
        let registry = registry();
        let video = registry.object_props_supported(FormatCategory::Video).unwrap();
        let mut sorted = video.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(video.len(), sorted.len());
    }

    #[test]
    fn unknown_prop_code_is_rejected() {
        let registry = registry();
        assert_eq!(
            registry
                .object_prop_desc(FormatCategory::Common, 0xDCFF)
                .unwrap_err(),
            StandardResponseCode::InvalidObjectPropCode
        );
        assert_eq!(
            registry
                .object_props_supported(FormatCategory::Unsupported)
                .unwrap_err(),
            StandardResponseCode::InvalidObjectPropFormat
        );
    }

    #[test]
    fn device_prop_desc_carries_current_value() {
        let registry = registry();
        let mut provider = DeviceInfoProvider::new();
        provider.set_battery_level(42);
        let desc = registry
            .device_prop_desc(DEV_PROP_BATTERY_LEVEL, &provider)
            .unwrap();
        assert_eq!(desc.current, MtpData::UINT8(42));
        assert_eq!(desc.form.flag(), FORM_FLAG_RANGE);

        let mut buf = Vec::new();
        desc.encode(&mut buf).unwrap();
        assert_eq!(&buf[..2], &DEV_PROP_BATTERY_LEVEL.to_le_bytes());
    }

    #[test]
    fn filename_is_the_writable_common_prop() {
        let registry = registry();
        let desc = registry
            .object_prop_desc(FormatCategory::Common, OBJ_PROP_OBJECT_FILE_NAME)
            .unwrap();
        assert!(desc.writable);
        let desc = registry
            .object_prop_desc(FormatCategory::Common, OBJ_PROP_OBJECT_SIZE)
            .unwrap();
        assert!(!desc.writable);
    }
}
