use thiserror::Error;

/// On-disk structure violations found while decoding a byte buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad {structure} cookie {found:02x?}")]
    BadCookie {
        structure: &'static str,
        found: [u8; 8],
    },

    #[error("truncated {structure}: got {actual} bytes, need {expected}")]
    Truncated {
        structure: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unknown disk type {0}")]
    UnknownDiskType(u32),

    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Block allocation contract violations. These are caller bugs, retrying never helps.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("block {block} already allocated at sector {sector:#010x}")]
    AlreadyAllocated { block: usize, sector: u32 },

    #[error("block index {block} out of range (max table entries {entries})")]
    OutOfRange { block: usize, entries: usize },

    #[error("block {block} at sector {sector:#010x} overlaps metadata or an allocated block")]
    Overlap { block: usize, sector: u64 },

    #[error("block offset does not fit a 32-bit sector number")]
    OffsetOverflow,
}

#[derive(Debug, Error)]
pub enum VhdError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Read beyond EOD")]
    ReadBeyondEOD,
    #[error("Write beyond EOD")]
    WriteBeyondEOD,
    #[error("Unexpected EOD")]
    UnexpectedEOD,
    #[error("Write zero")]
    WriteZero,

    #[error("Invalid disk size {0}")]
    InvalidSize(u64),
    #[error("Disk size {0} too big for VHD")]
    DiskSizeTooBig(u64),
    #[error("Invalid block size {0}, need a power of two of at least one sector")]
    InvalidBlockSize(u32),
    #[error("Invalid UUID '{0}'")]
    InvalidUuid(String),
    #[error("Timestamp {0} outside the VHD time range")]
    InvalidTimestamp(i64),
    #[error("Buffer size {actual}, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("Need dynamic or diff type image")]
    NeedDyncOrDiffImage,
    #[error("Differencing images are opened read-only")]
    DiffNotWritable,
    #[error("Invalid {0} checksum")]
    ChecksumMismatch(&'static str),

    #[error("Time format error: {0}")]
    Time(#[from] time::error::Format),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_count(text: &str) -> Result<u32, VhdError> {
        Ok(serde_json::from_str(text)?)
    }

    #[test]
    fn json_errors_convert() {
        assert_eq!(parse_count("7").unwrap(), 7);
        let err = parse_count("seven").unwrap_err();
        assert!(matches!(err, VhdError::Json(_)));
        assert!(err.to_string().starts_with("Json error: "));
    }
}
