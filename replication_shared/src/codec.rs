//! Entity state codec and replication wire frame.
//!
//! State block (pre-transform, little-endian `f32`s, 36 bytes):
//!
//! | Offset | Field |
//! |---|---|
//! | 0, 4, 8 | position x, y, z |
//! | 12, 16, 20 | rotation pitch, yaw, roll |
//! | 24, 28, 32 | scale x, y, z |
//!
//! Frame (what actually crosses the wire):
//! `[version:1][flags:1][entity:8][payload_len:2][payload:N][crc32:4]`,
//! integers little-endian, CRC32 over every preceding byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use thiserror::Error;

use crate::{
    entity::{EntityHandle, EntityTransform},
    math::{Rotator, Vec3},
};

/// Size of the serialized state block.
pub const STATE_BLOCK_LEN: usize = 36;

/// Current frame layout version.
pub const FRAME_VERSION: u8 = 1;

/// version + flags + entity + payload_len.
const FRAME_HEADER_LEN: usize = 1 + 1 + 8 + 2;
const FRAME_CRC_LEN: usize = 4;

/// Codec failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("state block must be {STATE_BLOCK_LEN} bytes, got {0}")]
    BadBlockLength(usize),
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
    #[error("CRC mismatch: expected {expected:08x}, got {computed:08x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("unknown frame flag bits {0:#04x}")]
    UnknownFlags(u8),
    #[error("frame flagged {0:?} but no matching transform is installed")]
    MissingTransform(FrameFlags),
    #[error("transform failed: {0}")]
    Transform(String),
}

bitflags::bitflags! {
    /// Which transforms were applied to a frame payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const COMPRESSED = 1 << 0;
        const ENCRYPTED = 1 << 1;
    }
}

/// A serialized capture of an entity's replicable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateBlock([u8; STATE_BLOCK_LEN]);

impl StateBlock {
    pub fn as_bytes(&self) -> &[u8; STATE_BLOCK_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let arr: [u8; STATE_BLOCK_LEN] = bytes
            .try_into()
            .map_err(|_| CodecError::BadBlockLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// The nine floats in layout order.
    pub fn fields(&self) -> [f32; 9] {
        let mut buf = &self.0[..];
        let mut out = [0.0f32; 9];
        for v in &mut out {
            *v = buf.get_f32_le();
        }
        out
    }

    pub fn decode(&self) -> EntityTransform {
        let [px, py, pz, pitch, yaw, roll, sx, sy, sz] = self.fields();
        EntityTransform {
            position: Vec3::new(px, py, pz),
            rotation: Rotator::new(pitch, yaw, roll),
            scale: Vec3::new(sx, sy, sz),
        }
    }
}

/// Pluggable byte transform (compression or encryption).
pub trait PayloadTransform: Send + Sync {
    fn apply(&self, data: Bytes) -> Bytes;
    fn revert(&self, data: Bytes) -> Result<Bytes, CodecError>;
}

/// Identity transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl PayloadTransform for PassThrough {
    fn apply(&self, data: Bytes) -> Bytes {
        data
    }

    fn revert(&self, data: Bytes) -> Result<Bytes, CodecError> {
        Ok(data)
    }
}

/// Serializes entity state and runs the optional payload transforms.
pub struct EntityStateCodec {
    compression: Option<Box<dyn PayloadTransform>>,
    encryption: Option<Box<dyn PayloadTransform>>,
}

impl Default for EntityStateCodec {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl std::fmt::Debug for EntityStateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStateCodec")
            .field("compression", &self.compression.is_some())
            .field("encryption", &self.encryption.is_some())
            .finish()
    }
}

impl EntityStateCodec {
    /// Enabled stages start out as [`PassThrough`].
    pub fn new(compression_enabled: bool, encryption_enabled: bool) -> Self {
        Self {
            compression: compression_enabled
                .then(|| Box::new(PassThrough) as Box<dyn PayloadTransform>),
            encryption: encryption_enabled
                .then(|| Box::new(PassThrough) as Box<dyn PayloadTransform>),
        }
    }

    pub fn set_compression(&mut self, transform: Option<Box<dyn PayloadTransform>>) {
        self.compression = transform;
    }

    pub fn set_encryption(&mut self, transform: Option<Box<dyn PayloadTransform>>) {
        self.encryption = transform;
    }

    pub fn flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::COMPRESSED, self.compression.is_some());
        flags.set(FrameFlags::ENCRYPTED, self.encryption.is_some());
        flags
    }

    /// Captures a snapshot in the fixed layout.
    pub fn capture(transform: &EntityTransform) -> StateBlock {
        let mut buf = BytesMut::with_capacity(STATE_BLOCK_LEN);
        for v in [
            transform.position.x,
            transform.position.y,
            transform.position.z,
            transform.rotation.pitch,
            transform.rotation.yaw,
            transform.rotation.roll,
            transform.scale.x,
            transform.scale.y,
            transform.scale.z,
        ] {
            buf.put_f32_le(v);
        }
        let mut arr = [0u8; STATE_BLOCK_LEN];
        arr.copy_from_slice(&buf);
        StateBlock(arr)
    }

    /// Compression first, then encryption.
    pub fn encode_payload(&self, block: &StateBlock) -> Bytes {
        let mut data = Bytes::copy_from_slice(block.as_bytes());
        if let Some(c) = &self.compression {
            data = c.apply(data);
        }
        if let Some(e) = &self.encryption {
            data = e.apply(data);
        }
        data
    }

    /// Inverse of [`encode_payload`](Self::encode_payload), honoring the frame flags.
    /// A flag whose stage is not installed here is an error, not a skip.
    pub fn decode_payload(&self, flags: FrameFlags, payload: Bytes) -> Result<StateBlock, CodecError> {
        let mut data = payload;
        if flags.contains(FrameFlags::ENCRYPTED) {
            let e = self
                .encryption
                .as_ref()
                .ok_or(CodecError::MissingTransform(FrameFlags::ENCRYPTED))?;
            data = e.revert(data)?;
        }
        if flags.contains(FrameFlags::COMPRESSED) {
            let c = self
                .compression
                .as_ref()
                .ok_or(CodecError::MissingTransform(FrameFlags::COMPRESSED))?;
            data = c.revert(data)?;
        }
        StateBlock::from_slice(&data)
    }
}

/// One entity update as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationFrame {
    pub version: u8,
    pub flags: FrameFlags,
    pub entity: EntityHandle,
    pub payload: Bytes,
}

impl ReplicationFrame {
    pub fn new(entity: EntityHandle, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            version: FRAME_VERSION,
            flags,
            entity,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len() + FRAME_CRC_LEN
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| CodecError::PayloadTooLarge(self.payload.len()))?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u64_le(self.entity.0);
        buf.put_u16_le(len);
        buf.extend_from_slice(&self.payload);

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.put_u32_le(hasher.finalize());

        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < FRAME_HEADER_LEN + FRAME_CRC_LEN {
            return Err(CodecError::FrameTooShort(bytes.len()));
        }

        let crc_offset = bytes.len() - FRAME_CRC_LEN;
        let mut crc_bytes = &bytes[crc_offset..];
        let expected = crc_bytes.get_u32_le();
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..crc_offset]);
        let computed = hasher.finalize();
        if expected != computed {
            return Err(CodecError::ChecksumMismatch { expected, computed });
        }

        let mut header = &bytes[..FRAME_HEADER_LEN];
        let version = header.get_u8();
        if version != FRAME_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let raw_flags = header.get_u8();
        let flags = FrameFlags::from_bits(raw_flags).ok_or(CodecError::UnknownFlags(raw_flags))?;
        let entity = EntityHandle(header.get_u64_le());
        let declared = header.get_u16_le() as usize;
        let actual = crc_offset - FRAME_HEADER_LEN;
        if declared != actual {
            return Err(CodecError::LengthMismatch { declared, actual });
        }

        Ok(Self {
            version,
            flags,
            entity,
            payload: Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..crc_offset]),
        })
    }
}
