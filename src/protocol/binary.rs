//! Binary preview frames.
//!
//! Layout (big-endian): `u32 event_type | u32 image_type | blob`. Only the
//! preview-image event type is understood; the image type selects the file
//! extension and content type of the saved artifact.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Event type of a preview-image frame.
pub const PREVIEW_IMAGE: u32 = 1;

/// Image encoding of a preview frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
}

impl ImageKind {
    /// File extension with the dot prefix, e.g. `.png`.
    pub fn ext(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => ".jpeg",
            ImageKind::Png => ".png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
        }
    }
}

/// A decoded preview-image frame.
#[derive(Debug, Clone)]
pub struct BinaryFrame {
    pub kind: ImageKind,
    pub blob: Bytes,
}

impl BinaryFrame {
    /// Decode a raw binary WebSocket frame. Byte order is fixed big-endian
    /// regardless of host.
    pub fn decode(frame: &[u8]) -> Result<BinaryFrame> {
        if frame.len() < 4 {
            return Err(Error::Validation("binary frame too short".into()));
        }
        let event_type = u32::from_be_bytes(frame[..4].try_into().expect("4 bytes"));
        if event_type != PREVIEW_IMAGE {
            return Err(Error::Validation(format!(
                "unknown binary event type {event_type}"
            )));
        }

        let body = &frame[4..];
        if body.len() < 4 {
            return Err(Error::Validation("image data too short".into()));
        }
        let image_type = u32::from_be_bytes(body[..4].try_into().expect("4 bytes"));
        let kind = match image_type {
            1 => ImageKind::Jpeg,
            2 => ImageKind::Png,
            other => {
                return Err(Error::Validation(format!("unknown image type {other}")));
            }
        };

        Ok(BinaryFrame {
            kind,
            blob: Bytes::copy_from_slice(&body[4..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event_type: u32, image_type: u32, blob: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&event_type.to_be_bytes());
        out.extend_from_slice(&image_type.to_be_bytes());
        out.extend_from_slice(blob);
        out
    }

    #[test]
    fn decodes_png_preview() {
        let decoded = BinaryFrame::decode(&frame(1, 2, b"\x89PNG")).unwrap();
        assert_eq!(decoded.kind, ImageKind::Png);
        assert_eq!(decoded.kind.ext(), ".png");
        assert_eq!(decoded.kind.content_type(), "image/png");
        assert_eq!(&decoded.blob[..], b"\x89PNG");
    }

    #[test]
    fn decodes_jpeg_preview() {
        let decoded = BinaryFrame::decode(&frame(1, 1, &[0xff, 0xd8])).unwrap();
        assert_eq!(decoded.kind, ImageKind::Jpeg);
        assert_eq!(decoded.kind.ext(), ".jpeg");
    }

    #[test]
    fn rejects_short_and_unknown_frames() {
        assert!(BinaryFrame::decode(&[0, 0]).is_err());
        assert!(BinaryFrame::decode(&frame(9, 1, b"")).is_err());
        assert!(BinaryFrame::decode(&frame(1, 7, b"")).is_err());
        assert!(BinaryFrame::decode(&1u32.to_be_bytes()[..1]).is_err());
    }

    #[test]
    fn empty_blob_is_allowed() {
        let decoded = BinaryFrame::decode(&frame(1, 2, b"")).unwrap();
        assert!(decoded.blob.is_empty());
    }
}
