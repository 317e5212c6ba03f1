use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use num_traits::ToPrimitive;

use crate::command::{AndroidCommandCode, StandardCommandCode};
use crate::dataset::DeviceInfo;
use crate::event::StandardEventCode;
use crate::format::{FormatCategory, ObjectFormatCode, PERCEIVED_DEVICE_TYPE_MEDIA_PLAYER};
use crate::properties::{
    DEV_PROP_BATTERY_LEVEL, DEV_PROP_DEVICE_FRIENDLY_NAME, DEV_PROP_DEVICE_ICON,
    DEV_PROP_PERCEIVED_DEVICE_TYPE, DEV_PROP_SYNCHRONIZATION_PARTNER,
};

const STANDARD_VERSION: u16 = 100;
const MTP_VERSION: u16 = 100;
/// Microsoft vendor extension id; required for hosts to treat us as MTP
/// rather than plain PTP.
const VENDOR_EXTENSION_ID: u32 = 0x0000_0006;
const MTP_EXTENSIONS: &str = "microsoft.com: 1.0; android.com: 1.0;";

/// Static device capabilities plus the two host-writable strings (friendly
/// name, sync partner) that persist across restarts.
pub struct DeviceInfoProvider {
    manufacturer: String,
    model: String,
    device_version: String,
    serial_number: String,
    friendly_name: String,
    sync_partner: String,
    battery_level: u8,
    device_icon: Vec<u8>,
    cache_path: PathBuf,

    operations: Vec<u16>,
    events: Vec<u16>,
    device_properties: Vec<u16>,
    formats: Vec<u16>,

    audio_channels: Vec<u16>,
    video_channels: Vec<u16>,
    sample_rates: Vec<u32>,
    audio_codecs: Vec<u32>,
}

impl DeviceInfoProvider {
    pub fn new() -> DeviceInfoProvider {
        let cache_dir = dirs_cache_dir();
        if let Err(err) = fs::create_dir_all(&cache_dir) {
            warn!("could not create {}: {}", cache_dir.display(), err);
        }

        let mut provider = DeviceInfoProvider {
            manufacturer: "mtpd".into(),
            model: "MTP Device".into(),
            device_version: env!("CARGO_PKG_VERSION").into(),
            serial_number: "0000000000000000".into(),
            friendly_name: "MTP Device".into(),
            sync_partner: String::new(),
            battery_level: 100,
            device_icon: Vec::new(),
            cache_path: cache_dir.join("devinfo"),
            operations: supported_operations(),
            events: supported_events(),
            device_properties: vec![
                DEV_PROP_BATTERY_LEVEL,
                DEV_PROP_SYNCHRONIZATION_PARTNER,
                DEV_PROP_DEVICE_FRIENDLY_NAME,
                DEV_PROP_DEVICE_ICON,
                DEV_PROP_PERCEIVED_DEVICE_TYPE,
            ],
            formats: supported_formats(),
            audio_channels: vec![crate::format::CH_CONF_MONO, crate::format::CH_CONF_STEREO],
            video_channels: vec![crate::format::CH_CONF_MONO, crate::format::CH_CONF_STEREO],
            sample_rates: vec![8000, 11025, 22050, 44000, 44100, 48000],
            // PCM, MP3, WMA, AAC
            audio_codecs: vec![0x0001, 0x0055, 0x0161, 0xA106],
        };
        provider.load_persisted();
        provider
    }

    pub fn standard_version(&self) -> u16 {
        STANDARD_VERSION
    }

    pub fn vendor_extension(&self) -> u32 {
        VENDOR_EXTENSION_ID
    }

    pub fn mtp_version(&self) -> u16 {
        MTP_VERSION
    }

    pub fn mtp_extension(&self) -> &str {
        MTP_EXTENSIONS
    }

    pub fn functional_mode(&self) -> u16 {
        0
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn device_version(&self) -> &str {
        &self.device_version
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn device_type(&self) -> u32 {
        PERCEIVED_DEVICE_TYPE_MEDIA_PLAYER
    }

    pub fn battery_level(&self) -> u8 {
        self.battery_level
    }

    pub fn set_battery_level(&mut self, level: u8) {
        self.battery_level = level.min(100);
    }

    pub fn device_icon(&self) -> &[u8] {
        &self.device_icon
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn sync_partner(&self) -> &str {
        &self.sync_partner
    }

    pub fn set_friendly_name(&mut self, name: &str) {
        self.friendly_name = name.to_owned();
        self.store_persisted();
    }

    pub fn set_sync_partner(&mut self, partner: &str) {
        self.sync_partner = partner.to_owned();
        self.store_persisted();
    }

    pub fn operations_supported(&self) -> &[u16] {
        &self.operations
    }

    pub fn events_supported(&self) -> &[u16] {
        &self.events
    }

    pub fn device_properties_supported(&self) -> &[u16] {
        &self.device_properties
    }

    pub fn supported_formats(&self) -> &[u16] {
        &self.formats
    }

    pub fn audio_channels(&self) -> &[u16] {
        &self.audio_channels
    }

    pub fn video_channels(&self) -> &[u16] {
        &self.video_channels
    }

    pub fn sample_rates(&self) -> &[u32] {
        &self.sample_rates
    }

    pub fn supported_audio_codecs(&self) -> &[u32] {
        &self.audio_codecs
    }

    pub fn image_dimension_range(&self) -> (u32, u32) {
        (0, 10000)
    }

    pub fn video_dimension_range(&self) -> (u32, u32) {
        (0, 1920)
    }

    pub fn audio_bitrate_range(&self) -> (u32, u32) {
        (8_000, 320_000)
    }

    pub fn video_bitrate_range(&self) -> (u32, u32) {
        (64_000, 20_000_000)
    }

    pub fn video_framerate_range(&self) -> (u32, u32) {
        (15_000, 60_000)
    }

    /// Sorts a format code into the category that selects its property
    /// table.
    pub fn format_category(&self, format: u16) -> FormatCategory {
        use ObjectFormatCode::*;
        match num_traits::FromPrimitive::from_u16(format) {
            Some(code) => match code {
                Aiff | Wav | Mp3 | UndefinedAudio | Wma | Ogg | Aac | Audible | Flac => {
                    FormatCategory::Audio
                }
                Avi | Mpeg | Asf | UndefinedVideo | Wmv | Mp4Container | ThreeGpContainer => {
                    FormatCategory::Video
                }
                UnknownImage | ExifJpeg | TiffEp | FlashPix | Bmp | Ciff | Gif | Jfif | Pcd
                | Pict | Png | Tiff | TiffIt | Jp2 | Jpx => FormatCategory::Image,
                Undefined | Association | Script | Executable | Text | Html | Dpof
                | AbstractMultimediaAlbum | AbstractImageAlbum | AbstractAudioAlbum
                | AbstractAvPlaylist | AbstractAudioPlaylist | WplPlaylist | M3uPlaylist
                | MplPlaylist | AsxPlaylist | PlsPlaylist | XmlDocument => FormatCategory::Common,
            },
            None => FormatCategory::Unsupported,
        }
    }

    /// The DeviceInfo dataset sent for GetDeviceInfo.
    pub fn dataset(&self) -> DeviceInfo {
        DeviceInfo {
            standard_version: self.standard_version(),
            vendor_extension_id: self.vendor_extension(),
            mtp_version: self.mtp_version(),
            mtp_extensions: self.mtp_extension().into(),
            functional_mode: self.functional_mode(),
            operations_supported: self.operations.clone(),
            events_supported: self.events.clone(),
            device_properties_supported: self.device_properties.clone(),
            capture_formats: Vec::new(),
            playback_formats: self.formats.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            device_version: self.device_version.clone(),
            serial_number: self.serial_number.clone(),
        }
    }

    fn load_persisted(&mut self) {
        let mut file = match File::open(&self.cache_path) {
            Ok(file) => file,
            Err(_) => return,
        };

        let mut read_string = |file: &mut File| -> Option<String> {
            let len = file.read_u32::<LittleEndian>().ok()? as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).ok()?;
            String::from_utf8(buf).ok()
        };

        if let Some(name) = read_string(&mut file) {
            if !name.is_empty() {
                self.friendly_name = name;
            }
        }
        if let Some(partner) = read_string(&mut file) {
            self.sync_partner = partner;
        }
    }

    fn store_persisted(&self) {
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&self.cache_path)?;
            for value in [&self.friendly_name, &self.sync_partner] {
                file.write_u32::<LittleEndian>(value.len() as u32)?;
                std::io::Write::write_all(&mut file, value.as_bytes())?;
            }
            Ok(())
        };
        if let Err(err) = write() {
            warn!("could not persist device info: {}", err);
        }
    }
}

impl Default for DeviceInfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn dirs_cache_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    PathBuf::from(home).join(".cache/mtp")
}

fn supported_operations() -> Vec<u16> {
    use StandardCommandCode::*;
    let standard = [
        GetDeviceInfo,
        OpenSession,
        CloseSession,
        GetStorageIDs,
        GetStorageInfo,
        GetNumObjects,
        GetObjectHandles,
        GetObjectInfo,
        GetObject,
        GetThumb,
        DeleteObject,
        SendObjectInfo,
        SendObject,
        GetPartialObject,
        GetDevicePropDesc,
        GetDevicePropValue,
        SetDevicePropValue,
        MoveObject,
        CopyObject,
        GetObjectPropsSupported,
        GetObjectPropDesc,
        GetObjectPropValue,
        SetObjectPropValue,
        GetObjectPropList,
        SetObjectPropList,
        SendObjectPropList,
        GetObjectReferences,
        SetObjectReferences,
        Skip,
    ];
    let android = [
        AndroidCommandCode::GetPartialObject64,
        AndroidCommandCode::SendPartialObject64,
        AndroidCommandCode::TruncateObject64,
        AndroidCommandCode::BeginEditObject,
        AndroidCommandCode::EndEditObject,
    ];
    standard
        .iter()
        .map(|op| op.to_u16().unwrap())
        .chain(android.iter().map(|op| op.to_u16().unwrap()))
        .collect()
}

fn supported_events() -> Vec<u16> {
    use StandardEventCode::*;
    [
        ObjectAdded,
        ObjectRemoved,
        ObjectInfoChanged,
        StoreAdded,
        StoreRemoved,
        StoreFull,
        StorageInfoChanged,
        DeviceInfoChanged,
        DevicePropChanged,
        ObjectPropChanged,
        RequestObjectTransfer,
    ]
    .iter()
    .map(|ev| ev.to_u16().unwrap())
    .collect()
}

fn supported_formats() -> Vec<u16> {
    use ObjectFormatCode::*;
    [
        Undefined,
        Association,
        Text,
        Html,
        Wav,
        Mp3,
        Avi,
        Mpeg,
        Asf,
        ExifJpeg,
        Bmp,
        Gif,
        Jfif,
        Png,
        Tiff,
        Wma,
        Ogg,
        Aac,
        Flac,
        Wmv,
        Mp4Container,
        ThreeGpContainer,
        AbstractAvPlaylist,
        M3uPlaylist,
        UnknownImage,
        UndefinedAudio,
        UndefinedVideo,
    ]
    .iter()
    .map(|f| f.value())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_categories() {
        let provider = DeviceInfoProvider::new();
        assert_eq!(provider.format_category(0x3009), FormatCategory::Audio);
        assert_eq!(provider.format_category(0xB981), FormatCategory::Video);
        assert_eq!(provider.format_category(0x3801), FormatCategory::Image);
        assert_eq!(provider.format_category(0x3001), FormatCategory::Common);
        assert_eq!(provider.format_category(0x0042), FormatCategory::Unsupported);
    }

    #[test]
    fn dataset_lists_every_dispatchable_operation() {
        let provider = DeviceInfoProvider::new();
        let info = provider.dataset();
        assert!(info.operations_supported.contains(&0x1001));
        assert!(info.operations_supported.contains(&0x9805));
        assert!(info.operations_supported.contains(&0x95C1));
        assert!(info.events_supported.contains(&0x4002));
    }
}
