use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive;
use std::fmt::Display;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Per-session object identifier. Handle 0 addresses a storage root and
/// 0xFFFFFFFF is the "all objects" wildcard on input.
pub type ObjHandle = u32;

pub const HANDLE_ROOT: ObjHandle = 0x0000_0000;
pub const HANDLE_ALL: ObjHandle = 0xFFFF_FFFF;

/// Storage identifier: 16-bit physical storage number in the high half,
/// 16-bit logical partition number in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct StorageId(pub u32);

impl StorageId {
    pub fn new(physical: u16, partition: u16) -> StorageId {
        StorageId(((physical as u32) << 16) | partition as u32)
    }

    /// The "all storages" wildcard used on input.
    pub fn all() -> StorageId {
        StorageId(0xFFFF_FFFF)
    }

    pub fn physical(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn partition(&self) -> u16 {
        self.0 as u16
    }
}

impl Display for StorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageId(0x{:08x})", self.0)
    }
}

/// Object format codes used by the responder. The vendor 0xBxxx values come
/// from the MTP format space.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum ObjectFormatCode {
    Undefined = 0x3000,
    Association = 0x3001,
    Script = 0x3002,
    Executable = 0x3003,
    Text = 0x3004,
    Html = 0x3005,
    Dpof = 0x3006,
    Aiff = 0x3007,
    Wav = 0x3008,
    Mp3 = 0x3009,
    Avi = 0x300A,
    Mpeg = 0x300B,
    Asf = 0x300C,
    UnknownImage = 0x3800,
    ExifJpeg = 0x3801,
    TiffEp = 0x3802,
    FlashPix = 0x3803,
    Bmp = 0x3804,
    Ciff = 0x3805,
    Gif = 0x3807,
    Jfif = 0x3808,
    Pcd = 0x3809,
    Pict = 0x380A,
    Png = 0x380B,
    Tiff = 0x380D,
    TiffIt = 0x380E,
    Jp2 = 0x380F,
    Jpx = 0x3810,
    UndefinedAudio = 0xB900,
    Wma = 0xB901,
    Ogg = 0xB902,
    Aac = 0xB903,
    Audible = 0xB904,
    Flac = 0xB906,
    UndefinedVideo = 0xB980,
    Wmv = 0xB981,
    Mp4Container = 0xB982,
    ThreeGpContainer = 0xB984,
    AbstractMultimediaAlbum = 0xBA01,
    AbstractImageAlbum = 0xBA02,
    AbstractAudioAlbum = 0xBA03,
    AbstractAvPlaylist = 0xBA05,
    AbstractAudioPlaylist = 0xBA09,
    WplPlaylist = 0xBA10,
    M3uPlaylist = 0xBA11,
    MplPlaylist = 0xBA12,
    AsxPlaylist = 0xBA13,
    PlsPlaylist = 0xBA14,
    XmlDocument = 0xBA82,
}

impl ObjectFormatCode {
    pub fn value(self) -> u16 {
        self.to_u16().unwrap()
    }
}

pub const FORMAT_UNDEFINED: u16 = 0x3000;
pub const FORMAT_ASSOCIATION: u16 = 0x3001;

/// Object format category used to select a property table.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum FormatCategory {
    Unsupported = 0x0001,
    Audio = 0x0002,
    Video = 0x0003,
    Image = 0x0004,
    Common = 0x0005,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum StorageType {
    Undefined = 0x0000,
    FixedRom = 0x0001,
    RemovableRom = 0x0002,
    FixedRam = 0x0003,
    RemovableRam = 0x0004,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum AccessCapability {
    ReadWrite = 0x0000,
    ReadOnlyNoDeletion = 0x0001,
    ReadOnlyWithDeletion = 0x0002,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum FilesystemType {
    Undefined = 0x0000,
    GenericFlat = 0x0001,
    GenericHierarchical = 0x0002,
    Dcf = 0x0003,
}

/// Protection status values carried in the object-info dataset and the
/// Protection_Status property's enum form.
pub const PROTECTION_NONE: u16 = 0x0000;
pub const PROTECTION_READ_ONLY: u16 = 0x0001;
pub const PROTECTION_READ_ONLY_DATA: u16 = 0x8002;
pub const PROTECTION_NON_TRANSFERRABLE_DATA: u16 = 0x8003;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum AssociationType {
    Undefined = 0x0000,
    GenericFolder = 0x0001,
    Album = 0x0002,
    TimeSequence = 0x0003,
    HorizontalPanoramic = 0x0004,
    VerticalPanoramic = 0x0005,
    Panoramic2D = 0x0006,
    AncillaryData = 0x0007,
}

/// Bitrate type values for the Bitrate_Type object property enum form.
pub const BITRATE_TYPE_UNUSED: u16 = 0x0000;
pub const BITRATE_TYPE_DISCRETE: u16 = 0x0001;
pub const BITRATE_TYPE_VARIABLE: u16 = 0x0002;
pub const BITRATE_TYPE_FREE: u16 = 0x0003;

/// Channel configuration values for the Nbr_Of_Channels enum form.
pub const CH_CONF_MONO: u16 = 0x0001;
pub const CH_CONF_STEREO: u16 = 0x0002;

/// DRM status values.
pub const DRM_UNPROTECTED: u16 = 0x0000;
pub const DRM_PROTECTED: u16 = 0x0001;

/// Perceived device type: generic portable media player.
pub const PERCEIVED_DEVICE_TYPE_MEDIA_PLAYER: u32 = 0x00000003;
