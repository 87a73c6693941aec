//! Commands of the indexed per-port sub-resources.
//!
//! Every kind owns a block of 64 command codes. The first three codes of a block
//! are always the `INDICES` query and the `CREATE`/`DELETE` commands, both
//! addressed with the sub-index of the instance they act on.
use super::{Comment, IndexList, Toggle};
use crate::{
    field::{FieldKind, HexString},
    message,
    message::Empty,
    value_enum,
};

/// Number of command codes reserved for each indexed kind.
pub const FAMILY_BLOCK: u16 = 0x40;

/// Static description of one indexed resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexFamily {
    pub name: &'static str,
    pub base: u16,
    /// Number of instances a single port supports.
    pub capacity: u32,
}

impl IndexFamily {
    pub const fn indices_code(&self) -> u16 {
        self.base
    }

    pub const fn create_code(&self) -> u16 {
        self.base + 1
    }

    pub const fn delete_code(&self) -> u16 {
        self.base + 2
    }

    pub const fn contains(&self, code: u16) -> bool {
        code >= self.base && code < self.base + FAMILY_BLOCK
    }
}

pub const STREAMS: IndexFamily = IndexFamily {
    name: "stream",
    base: 0x0300,
    capacity: 32,
};
pub const FILTERS: IndexFamily = IndexFamily {
    name: "filter",
    base: 0x0340,
    capacity: 6,
};
pub const LENGTH_TERMS: IndexFamily = IndexFamily {
    name: "length term",
    base: 0x0380,
    capacity: 4,
};
pub const MATCH_TERMS: IndexFamily = IndexFamily {
    name: "match term",
    base: 0x03C0,
    capacity: 6,
};
pub const HISTOGRAMS: IndexFamily = IndexFamily {
    name: "histogram",
    base: 0x0400,
    capacity: 2,
};
pub const MACSEC_TXSC: IndexFamily = IndexFamily {
    name: "macsec tx secure channel",
    base: 0x0440,
    capacity: 8,
};
pub const MACSEC_RXSC: IndexFamily = IndexFamily {
    name: "macsec rx secure channel",
    base: 0x0480,
    capacity: 8,
};

pub const FAMILIES: &[IndexFamily] = &[
    STREAMS,
    FILTERS,
    LENGTH_TERMS,
    MATCH_TERMS,
    HISTOGRAMS,
    MACSEC_TXSC,
    MACSEC_RXSC,
];

/// The indexed kind a command code belongs to.
pub fn family_of(code: u16) -> Option<&'static IndexFamily> {
    FAMILIES.iter().find(|family| family.contains(code))
}

message! {
    /// Fraction of the port rate in parts per million.
    pub struct RateFraction {
        ppm: u32 => FieldKind::U32,
    }
}

message! {
    /// Raw protocol headers prepended to every packet of a stream.
    pub struct PacketHeader {
        data: HexString => FieldKind::HexRest,
    }
}

message! {
    /// Test payload id inserted into each packet, -1 disables it.
    pub struct TestPayloadId {
        id: i16 => FieldKind::I16,
    }
}

message! {
    /// Bit masks over the match and length terms. A packet passes when every
    /// term in `and_terms` matches and none in `and_not_terms` does.
    pub struct FilterCondition {
        and_terms: u64 => FieldKind::U64,
        and_not_terms: u64 => FieldKind::U64,
    }
}

value_enum! {
    pub enum LengthComparison {
        ShorterThan = 0,
        LongerThan = 1,
    }
}

message! {
    pub struct LengthCheck {
        comparison: LengthComparison => FieldKind::U8,
        size: u16 => FieldKind::U16,
    }
}

message! {
    /// Masked 8 byte comparison at a fixed packet offset.
    pub struct MatchValue {
        mask: HexString => FieldKind::Hex(8),
        value: HexString => FieldKind::Hex(8),
    }
}

message! {
    pub struct MatchPosition {
        offset: u16 => FieldKind::U16,
    }
}

message! {
    pub struct HistogramRange {
        start: i64 => FieldKind::I64,
        step: u32 => FieldKind::U32,
        bucket_count: u16 => FieldKind::U16,
    }
}

message! {
    /// Secure channel identifier.
    pub struct Sci {
        sci: HexString => FieldKind::Hex(8),
    }
}

message! {
    pub struct Description {
        text: String => FieldKind::Str,
    }
}

define_commands! {
    /// Stream indices defined on a port.
    PS_INDICES = 0x0300, push: false, get: IndexList, set: _;
    PS_CREATE = 0x0301, push: false, get: _, set: Empty;
    PS_DELETE = 0x0302, push: false, get: _, set: Empty;
    PS_ENABLE = 0x0303, push: false, get: Toggle, set: Toggle;
    PS_COMMENT = 0x0304, push: false, get: Comment, set: Comment;
    PS_RATEFRACTION = 0x0305, push: false, get: RateFraction, set: RateFraction;
    PS_PACKETHEADER = 0x0306, push: false, get: PacketHeader, set: PacketHeader;
    PS_TPLDID = 0x0307, push: false, get: TestPayloadId, set: TestPayloadId;

    /// Filter indices defined on a port.
    PF_INDICES = 0x0340, push: false, get: IndexList, set: _;
    PF_CREATE = 0x0341, push: false, get: _, set: Empty;
    PF_DELETE = 0x0342, push: false, get: _, set: Empty;
    PF_ENABLE = 0x0343, push: false, get: Toggle, set: Toggle;
    PF_COMMENT = 0x0344, push: false, get: Comment, set: Comment;
    PF_CONDITION = 0x0345, push: false, get: FilterCondition, set: FilterCondition;

    /// Length term indices defined on a port.
    PL_INDICES = 0x0380, push: false, get: IndexList, set: _;
    PL_CREATE = 0x0381, push: false, get: _, set: Empty;
    PL_DELETE = 0x0382, push: false, get: _, set: Empty;
    PL_LENGTH = 0x0383, push: false, get: LengthCheck, set: LengthCheck;

    /// Match term indices defined on a port.
    PM_INDICES = 0x03C0, push: false, get: IndexList, set: _;
    PM_CREATE = 0x03C1, push: false, get: _, set: Empty;
    PM_DELETE = 0x03C2, push: false, get: _, set: Empty;
    PM_MATCH = 0x03C3, push: false, get: MatchValue, set: MatchValue;
    PM_POSITION = 0x03C4, push: false, get: MatchPosition, set: MatchPosition;

    /// Histogram indices defined on a port.
    PD_INDICES = 0x0400, push: false, get: IndexList, set: _;
    PD_CREATE = 0x0401, push: false, get: _, set: Empty;
    PD_DELETE = 0x0402, push: false, get: _, set: Empty;
    PD_ENABLE = 0x0403, push: false, get: Toggle, set: Toggle;
    PD_RANGE = 0x0404, push: false, get: HistogramRange, set: HistogramRange;

    /// MACsec transmit secure channels defined on a port.
    P_MACSEC_TXSC_INDICES = 0x0440, push: false, get: IndexList, set: _;
    P_MACSEC_TXSC_CREATE = 0x0441, push: false, get: _, set: Empty;
    P_MACSEC_TXSC_DELETE = 0x0442, push: false, get: _, set: Empty;
    P_MACSEC_TXSC_DESCR = 0x0443, push: false, get: Description, set: Description;
    P_MACSEC_TXSC_SCI = 0x0444, push: false, get: Sci, set: Sci;

    /// MACsec receive secure channels defined on a port.
    P_MACSEC_RXSC_INDICES = 0x0480, push: false, get: IndexList, set: _;
    P_MACSEC_RXSC_CREATE = 0x0481, push: false, get: _, set: Empty;
    P_MACSEC_RXSC_DELETE = 0x0482, push: false, get: _, set: Empty;
    P_MACSEC_RXSC_DESCR = 0x0483, push: false, get: Description, set: Description;
    P_MACSEC_RXSC_SCI = 0x0484, push: false, get: Sci, set: Sci;
}
