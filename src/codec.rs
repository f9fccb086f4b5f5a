use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Image payload is empty")]
    Empty,
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
}

/// The image a job carries, in whatever form the caller had it.
pub enum ImageSource {
    /// Base64 text, optionally behind a `data:<mime>;base64,` header.
    Encoded(String),
    Decoded(DynamicImage),
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Encoded(text) => write!(f, "Encoded({} chars)", text.len()),
            ImageSource::Decoded(img) => write!(f, "Decoded({}x{})", img.width(), img.height()),
        }
    }
}

impl ImageSource {
    pub fn decode(self) -> Result<DynamicImage, DecodeError> {
        match self {
            ImageSource::Encoded(text) => {
                let payload = base64_payload(&text);
                if payload.is_empty() {
                    return Err(DecodeError::Empty);
                }
                let bytes = STANDARD.decode(payload)?;
                Ok(image::load_from_memory(&bytes)?)
            }
            ImageSource::Decoded(img) => Ok(img),
        }
    }
}

/// Removes every `data:...base64,` header and all ASCII whitespace, so
/// line-wrapped payloads decode as one block.
pub fn base64_payload(text: &str) -> String {
    const MARKER: &str = "base64,";

    let mut payload = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("data:") {
        let Some(end) = rest[start..].find(MARKER) else {
            break;
        };
        payload.push_str(&rest[..start]);
        rest = &rest[start + end + MARKER.len()..];
    }
    payload.push_str(rest);
    payload.retain(|c| !c.is_ascii_whitespace());
    payload
}
