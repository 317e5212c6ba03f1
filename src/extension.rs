use crate::data::MtpData;
use crate::response::StandardResponseCode;

/// A parsed operation handed to the extension chain.
#[derive(Debug, Clone, Default)]
pub struct MtpRequest {
    pub op_code: u16,
    pub params: Vec<u32>,
    pub data: Vec<u8>,
}

/// What an extension produced for an operation it claimed.
#[derive(Debug, Clone)]
pub struct MtpResponse {
    pub resp_code: u16,
    pub params: Vec<u32>,
    pub data: Vec<u8>,
}

impl Default for MtpResponse {
    fn default() -> Self {
        MtpResponse {
            resp_code: StandardResponseCode::OperationNotSupported.value(),
            params: Vec::new(),
            data: Vec::new(),
        }
    }
}

/// An optional extension module. Each hook returns `None` when the
/// extension does not claim the code, letting the chain continue.
pub trait MtpExtension: Send {
    /// Whether this extension handles `op_code`, and if so whether the
    /// operation carries a host-to-device data phase.
    fn operation_has_data_phase(&self, op_code: u16) -> Option<bool>;

    fn handle_operation(&self, request: &MtpRequest) -> Option<MtpResponse>;

    fn get_device_prop_value(&self, _prop_code: u16) -> Option<(MtpData, u16)> {
        None
    }

    fn set_device_prop_value(&self, _prop_code: u16, _value: &MtpData) -> Option<u16> {
        None
    }

    fn get_object_prop_value(&self, _path: &std::path::Path, _prop_code: u16) -> Option<(MtpData, u16)> {
        None
    }

    fn set_object_prop_value(
        &self,
        _path: &std::path::Path,
        _prop_code: u16,
        _value: &MtpData,
    ) -> Option<u16> {
        None
    }
}

/// Chain-of-responsibility over the loaded extensions: the first extension
/// that claims a code wins.
#[derive(Default)]
pub struct ExtensionManager {
    extensions: Vec<Box<dyn MtpExtension>>,
}

impl ExtensionManager {
    pub fn new() -> ExtensionManager {
        ExtensionManager::default()
    }

    pub fn register(&mut self, extension: Box<dyn MtpExtension>) {
        self.extensions.push(extension);
    }

    pub fn operation_has_data_phase(&self, op_code: u16) -> Option<bool> {
        self.extensions
            .iter()
            .find_map(|ext| ext.operation_has_data_phase(op_code))
    }

    pub fn handle_operation(&self, request: &MtpRequest) -> Option<MtpResponse> {
        self.extensions
            .iter()
            .find_map(|ext| ext.handle_operation(request))
    }

    pub fn get_object_prop_value(
        &self,
        path: &std::path::Path,
        prop_code: u16,
    ) -> Option<(MtpData, u16)> {
        self.extensions
            .iter()
            .find_map(|ext| ext.get_object_prop_value(path, prop_code))
    }

    pub fn set_object_prop_value(
        &self,
        path: &std::path::Path,
        prop_code: u16,
        value: &MtpData,
    ) -> Option<u16> {
        self.extensions
            .iter()
            .find_map(|ext| ext.set_object_prop_value(path, prop_code, value))
    }
}
