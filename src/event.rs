use std::fmt::{self, LowerHex};

#[cfg(feature = "serde")]
use serde::Serialize;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive;

/// Standard PTP events plus the MTP vendor-space property-change events.
/// The responder only ever emits events, so the vendor additions live in
/// the same code space.
#[repr(u16)]
#[derive(FromPrimitive, ToPrimitive, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum StandardEventCode {
    Undefined = 0x4000,
    CancelTransaction = 0x4001,
    ObjectAdded = 0x4002,
    ObjectRemoved = 0x4003,
    StoreAdded = 0x4004,
    StoreRemoved = 0x4005,
    DevicePropChanged = 0x4006,
    ObjectInfoChanged = 0x4007,
    DeviceInfoChanged = 0x4008,
    RequestObjectTransfer = 0x4009,
    StoreFull = 0x400A,
    DeviceReset = 0x400B,
    StorageInfoChanged = 0x400C,
    CaptureComplete = 0x400D,
    UnreportedStatus = 0x400E,
    ObjectPropChanged = 0xC801,
    ObjectPropDescChanged = 0xC802,
}

impl LowerHex for StandardEventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let val = self.to_u16().unwrap();
        fmt::LowerHex::fmt(&val, f)
    }
}

/// An MTP event: a 16-bit code plus up to three parameters.
#[derive(Debug, Clone, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Event {
    pub code: StandardEventCode,
    pub params: Vec<u32>,
}

impl Event {
    pub fn new(code: StandardEventCode, params: &[u32]) -> Self {
        Event {
            code,
            params: params.to_vec(),
        }
    }
}
