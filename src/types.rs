//! This module defines range-checked types for UNI-TELWAY addresses, UNI-TE
//! categories, X-WAY headers and controller objects, meant to simplify
//! correct usage of the API.

use snafu::{ensure, OptionExt, Snafu};

use arrayvec::ArrayVec;
use core::convert::{TryFrom, TryInto};
use core::fmt;
use core::ops::Deref;

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The value isn't a valid UNI-TELWAY link address.
    #[snafu(display("Invalid address"))]
    InvalidAddress,
    /// The value isn't a valid UNI-TE category code.
    #[snafu(display("Invalid category"))]
    InvalidCategory,
    /// The value isn't a known NC mode.
    #[snafu(display("Unknown NC mode {:#06x}", code))]
    InvalidMode { code: u16 },
    /// The value isn't a known NC object code.
    #[snafu(display("Unknown NC object {:#04x}", code))]
    InvalidNcObject { code: u8 },
}

const fn invalid_address() -> InvalidAddressSnafu {
    InvalidAddressSnafu
}

const fn invalid_category() -> InvalidCategorySnafu {
    InvalidCategorySnafu
}

const ADDRESS_MIN: u8 = 1;
const ADDRESS_MAX: u8 = 98;

/// Address is a range-checked [1, 98] integer, the UNI-TELWAY link address of
/// the addressed station.
///
/// ## Example
/// ```
/// use unitelway_proto::Address;
/// let addr = Address::new(1).unwrap();
/// assert!(Address::new(0).is_err());
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Address(u8);

/// Create a new [`Address`], panics if it is out of range.
pub const fn addr(a: u8) -> Address {
    if a >= ADDRESS_MIN && a <= ADDRESS_MAX {
        return Address(a);
    }
    panic!("Invalid address.")
}

impl Address {
    /// Create a new address, checking that the address is in \[1, 98\].
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if `address` is out of range.
    pub fn new(address: impl TryInto<u8>) -> Result<Self, Error> {
        let address = address.try_into().ok().with_context(invalid_address)?;
        ensure!(
            (ADDRESS_MIN..=ADDRESS_MAX).contains(&address),
            invalid_address()
        );
        Ok(Self(address))
    }
}

impl Deref for Address {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq<u8> for Address {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait to convert `T: TryInto<u8>` into an [`Address`].
pub trait IntoAddress {
    /// Convert self to an Address.
    /// # Errors
    /// Returns `Error:InvalidAddress` if self isn't a valid address.
    fn into_address(self) -> Result<Address, Error>;
}

impl IntoAddress for Address {
    fn into_address(self) -> Result<Address, Error> {
        Ok(self)
    }
}

impl<T> IntoAddress for T
where
    T: TryInto<u8>,
{
    fn into_address(self) -> Result<Address, Error> {
        Address::new(self)
    }
}

/// UNI-TE category code, \[0, 7\], sent after every request code.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash, Default)]
#[repr(transparent)]
pub struct Category(u8);

impl Category {
    /// # Errors
    /// Returns [`Error::InvalidCategory`] if `category` is greater than 7.
    pub fn new(category: impl TryInto<u8>) -> Result<Self, Error> {
        let category = category.try_into().ok().with_context(invalid_category)?;
        ensure!(category <= 7, invalid_category());
        Ok(Self(category))
    }
}

impl Deref for Category {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}


/// X-WAY header type of a standard message.
pub const XWAY_STANDARD: u8 = 0x20;
/// X-WAY header type the station answers with when it refuses a message.
pub const XWAY_REFUSED: u8 = 0x22;

/// The six byte X-WAY addressing header in front of every UNI-TE message.
///
/// `ext1` and `ext2` are only meaningful for 5 and 6 level addressing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct XwayHeader {
    pub kind: u8,
    pub network: u8,
    pub station: u8,
    pub gate: u8,
    pub ext1: u8,
    pub ext2: u8,
}

impl XwayHeader {
    /// Encoded length of the header.
    pub const LEN: usize = 6;

    pub const fn new(network: u8, station: u8, gate: u8) -> Self {
        Self {
            kind: XWAY_STANDARD,
            network,
            station,
            gate,
            ext1: 0,
            ext2: 0,
        }
    }

    /// Set the extension bytes used by 5 and 6 level addressing.
    pub const fn with_extension(mut self, ext1: u8, ext2: u8) -> Self {
        self.ext1 = ext1;
        self.ext2 = ext2;
        self
    }

    /// True if the station refused the message at the X-WAY level.
    pub const fn is_refused(&self) -> bool {
        self.kind == XWAY_REFUSED
    }

    pub const fn to_bytes(self) -> [u8; XwayHeader::LEN] {
        [
            self.kind,
            self.network,
            self.station,
            self.gate,
            self.ext1,
            self.ext2,
        ]
    }

    pub const fn from_bytes(bytes: [u8; XwayHeader::LEN]) -> Self {
        Self {
            kind: bytes[0],
            network: bytes[1],
            station: bytes[2],
            gate: bytes[3],
            ext1: bytes[4],
            ext2: bytes[5],
        }
    }
}

impl Default for XwayHeader {
    /// Network 0, station 0xFE, gate 0: the NUM 1060 seen through a
    /// USR-TCP232 adapter.
    fn default() -> Self {
        Self::new(0x00, 0xFE, 0x00)
    }
}

/// Operating mode of the numerical control.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mode {
    Auto = 0x00,
    SingleStep = 0x01,
    Mdi = 0x02,
    DryRun = 0x03,
    SequenceNumberSearch = 0x04,
    Edit = 0x05,
    Test = 0x06,
    Manual = 0x07,
    Homing = 0x08,
    Shift = 0x09,
    ToolSet = 0x0A,
    Load = 0x0D,
    Unload = 0x0F,
}

impl TryFrom<u16> for Mode {
    type Error = Error;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        use Mode::*;
        Ok(match code {
            0x00 => Auto,
            0x01 => SingleStep,
            0x02 => Mdi,
            0x03 => DryRun,
            0x04 => SequenceNumberSearch,
            0x05 => Edit,
            0x06 => Test,
            0x07 => Manual,
            0x08 => Homing,
            0x09 => Shift,
            0x0A => ToolSet,
            0x0D => Load,
            0x0F => Unload,
            _ => return InvalidModeSnafu { code }.fail(),
        })
    }
}

impl TryFrom<u8> for Mode {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::try_from(u16::from(code))
    }
}

/// Objects of the NUM numerical control, read and written word by word
/// through the multi-object requests. The discriminant is the segment code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NcObject {
    AxisPositionReference = 0x80,
    AxisMeasurement = 0x81,
    AxisDat1Values = 0x82,
    AxisDat2Values = 0x83,
    AxisDat3Values = 0x84,
    MinimumDynamicAxisTravel = 0x85,
    MaximumDynamicAxisTravel = 0x86,
    InclinedAxisAngularValue = 0x87,
    MachineZeroPoint = 0x88,
    MinimumStaticTravel = 0x89,
    MaximumStaticTravel = 0x8A,
    CurrentCorrectionsSlaveAxis = 0x8B,
    AxisPositionReferenceAxiswise = 0x8C,
    AxisMeasurementAxiswise = 0x8D,
    DrivenAxes = 0x8F,
    MeasuredSpindleSpeedSetting = 0x90,
    MeasuredSpindleReferencePosition = 0x91,
    ToolCorrections = 0x92,
    HVariableDynamicCorrectors = 0x93,
    InterpolationStatus = 0x94,
    HomingNotDoneOnAxes = 0x95,
    LocalDataParametersE = 0x96,
    MasterAxisReferencePosition = 0x97,
    SlaveAxisCorrection = 0x98,
    ProgrammeStatus = 0x99,
    BlockEndDimensions = 0x9D,
    ModeSelection = 0xB4,
    CurrentProgrammeNumber = 0xB5,
    DataTransmittedToProgramme = 0xE0,
    BlockingMessageAcknowledgement = 0xE2,
}

impl NcObject {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for NcObject {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use NcObject::*;
        Ok(match code {
            0x80 => AxisPositionReference,
            0x81 => AxisMeasurement,
            0x82 => AxisDat1Values,
            0x83 => AxisDat2Values,
            0x84 => AxisDat3Values,
            0x85 => MinimumDynamicAxisTravel,
            0x86 => MaximumDynamicAxisTravel,
            0x87 => InclinedAxisAngularValue,
            0x88 => MachineZeroPoint,
            0x89 => MinimumStaticTravel,
            0x8A => MaximumStaticTravel,
            0x8B => CurrentCorrectionsSlaveAxis,
            0x8C => AxisPositionReferenceAxiswise,
            0x8D => AxisMeasurementAxiswise,
            0x8F => DrivenAxes,
            0x90 => MeasuredSpindleSpeedSetting,
            0x91 => MeasuredSpindleReferencePosition,
            0x92 => ToolCorrections,
            0x93 => HVariableDynamicCorrectors,
            0x94 => InterpolationStatus,
            0x95 => HomingNotDoneOnAxes,
            0x96 => LocalDataParametersE,
            0x97 => MasterAxisReferencePosition,
            0x98 => SlaveAxisCorrection,
            0x99 => ProgrammeStatus,
            0x9D => BlockEndDimensions,
            0xB4 => ModeSelection,
            0xB5 => CurrentProgrammeNumber,
            0xE0 => DataTransmittedToProgramme,
            0xE2 => BlockingMessageAcknowledgement,
            _ => return InvalidNcObjectSnafu { code }.fail(),
        })
    }
}

/// On-wire width of one object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Width {
    Bit,
    /// Two bytes, signed, little endian.
    Word,
    /// Four bytes, signed, little endian.
    DWord,
}

/// The memory areas of the controller that can be read or written.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// `%M`
    InternalBit,
    /// `%S`
    SystemBit,
    /// `%MW`
    InternalWord,
    /// `%SW`
    SystemWord,
    /// `%KW`
    ConstantWord,
    /// `%MD`
    InternalDword,
    /// `%KD`
    ConstantDword,
    Nc(NcObject),
}

impl ObjectKind {
    pub const fn width(self) -> Width {
        use ObjectKind::*;
        match self {
            InternalBit | SystemBit => Width::Bit,
            InternalWord | SystemWord | ConstantWord | Nc(_) => Width::Word,
            InternalDword | ConstantDword => Width::DWord,
        }
    }

    pub const fn is_read_only(self) -> bool {
        matches!(self, ObjectKind::ConstantWord | ObjectKind::ConstantDword)
    }

    /// Only internal bits carry forcing information.
    pub const fn has_forcing(self) -> bool {
        matches!(self, ObjectKind::InternalBit)
    }

    /// Segment byte of the multi-object requests.
    pub const fn segment(self) -> u8 {
        use ObjectKind::*;
        match self {
            InternalBit | SystemBit => 0x64,
            InternalWord | InternalDword => 0x68,
            ConstantWord | ConstantDword => 0x69,
            SystemWord => 0x6A,
            Nc(object) => object.code(),
        }
    }

    /// Object type byte of the multi-object requests.
    pub const fn object_type(self) -> u8 {
        use ObjectKind::*;
        match self {
            InternalBit => 0x05,
            SystemBit => 0x06,
            InternalWord | SystemWord | ConstantWord => 0x07,
            InternalDword | ConstantDword => 0x08,
            Nc(_) => 0x00,
        }
    }

    const fn symbol(self) -> &'static str {
        use ObjectKind::*;
        match self {
            InternalBit => "%M",
            SystemBit => "%S",
            InternalWord => "%MW",
            SystemWord => "%SW",
            ConstantWord => "%KW",
            InternalDword => "%MD",
            ConstantDword => "%KD",
            Nc(_) => "NC",
        }
    }
}

/// A reference to one object in the controller, kind + index.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub index: u16,
}

impl ObjectRef {
    pub const fn new(kind: ObjectKind, index: u16) -> Self {
        Self { kind, index }
    }

    /// The first object of the given NC object family.
    pub const fn nc(object: NcObject) -> Self {
        Self::new(ObjectKind::Nc(object), 0)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ObjectKind::Nc(object) => write!(f, "NC{:02X}#{}", object.code(), self.index),
            kind => write!(f, "{}{}", kind.symbol(), self.index),
        }
    }
}

pub(crate) type ValueBytes = ArrayVec<u8, 4>;

/// A value read from or written to a controller object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectValue {
    Bit(bool),
    Word(i16),
    DWord(i32),
}

impl ObjectValue {
    pub const fn width(self) -> Width {
        match self {
            ObjectValue::Bit(_) => Width::Bit,
            ObjectValue::Word(_) => Width::Word,
            ObjectValue::DWord(_) => Width::DWord,
        }
    }

    /// The on-wire representation, bits as a single 0/1 byte.
    pub(crate) fn to_bytes(self) -> ValueBytes {
        let mut buf = ValueBytes::new();
        match self {
            ObjectValue::Bit(bit) => buf.push(u8::from(bit)),
            ObjectValue::Word(word) => buf.extend(word.to_le_bytes().iter().copied()),
            ObjectValue::DWord(dword) => buf.extend(dword.to_le_bytes().iter().copied()),
        }
        buf
    }

    /// Parse exactly one value of `width` from `bytes`.
    pub(crate) fn from_bytes(width: Width, bytes: &[u8]) -> Option<Self> {
        match width {
            Width::Bit => match bytes {
                [byte] => Some(ObjectValue::Bit(*byte & 1 != 0)),
                _ => None,
            },
            Width::Word => Some(ObjectValue::Word(i16::from_le_bytes(bytes.try_into().ok()?))),
            Width::DWord => Some(ObjectValue::DWord(i32::from_le_bytes(
                bytes.try_into().ok()?,
            ))),
        }
    }
}

impl From<bool> for ObjectValue {
    fn from(bit: bool) -> Self {
        ObjectValue::Bit(bit)
    }
}

impl From<i16> for ObjectValue {
    fn from(word: i16) -> Self {
        ObjectValue::Word(word)
    }
}

impl From<i32> for ObjectValue {
    fn from(dword: i32) -> Self {
        ObjectValue::DWord(dword)
    }
}

/// Value of a bit, with its forcing state when the memory area has one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BitState {
    pub value: bool,
    pub forced: Option<bool>,
}
