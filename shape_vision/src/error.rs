use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Image(image::ImageError),
    Json(serde_json::Error),
    Font(ab_glyph::InvalidFont),
    InvalidConfig(String),
    /// The frame source could not be opened. Fatal for a session.
    SourceUnavailable(String),
    /// A frame did not match the dimensions the session started with.
    FrameSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    Worker(String),
    /// The frame was abandoned before its turn to be applied.
    Cancelled(u64),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Image(e) => write!(f, "image error: {e}"),
            Error::Json(e) => write!(f, "json error: {e}"),
            Error::Font(e) => write!(f, "font error: {e}"),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Error::SourceUnavailable(msg) => write!(f, "frame source unavailable: {msg}"),
            Error::FrameSize { expected, actual } => write!(
                f,
                "frame size {}x{} does not match session size {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            Error::Worker(msg) => write!(f, "worker error: {msg}"),
            Error::Cancelled(frame_id) => write!(f, "frame {frame_id} was cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Image(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Font(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<ab_glyph::InvalidFont> for Error {
    fn from(err: ab_glyph::InvalidFont) -> Self {
        Error::Font(err)
    }
}
