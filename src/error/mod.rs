use crate::camera::CameraModel;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unsupported number of channels: {0}")]
    UnsupportedChannelCount(usize),

    #[error("Unsupported camera model: {0:?}")]
    UnsupportedCameraModel(CameraModel),

    #[error("Missing camera parameters for {0:?}: {1}")]
    MissingCameraParameters(CameraModel, &'static str),

    #[error("Invalid tile size: {0}")]
    InvalidTileSize(u32),

    #[error("Mismatched shape: {0} should be {1}")]
    MismatchedShape(String, String),

    #[error("Invalid tile intersections: {0}")]
    InvalidIntersections(String),

    #[error("Invalid iteration window: {0}..{1}")]
    InvalidWindow(u32, u32),

    #[error("Tensor data error: {0}")]
    TensorData(String),
}

impl Error {
    /// Returns `true` if the error comes from an unsupported configuration
    /// rather than from inputs that break the calling contract.
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedChannelCount(_)
                | Self::UnsupportedCameraModel(_)
                | Self::MissingCameraParameters(..)
                | Self::InvalidTileSize(_)
        )
    }
}

/// Checking that the buffer named `name` holds `expected` elements.
pub(crate) fn ensure_len(
    name: &str,
    actual: usize,
    expected: usize,
) -> Result<(), Error> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::MismatchedShape(
            format!("{name}.len() ({actual})"),
            expected.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn ensure_len_reports_both_sizes() {
        use super::*;

        assert!(ensure_len("opacities", 4, 4).is_ok());

        let error = ensure_len("opacities", 3, 4).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Mismatched shape: opacities.len() (3) should be 4"
        );
        assert!(!error.is_configuration());
    }

    #[test]
    fn configuration_errors() {
        use super::*;

        assert!(Error::UnsupportedChannelCount(6).is_configuration());
        assert!(Error::InvalidTileSize(0).is_configuration());
        assert!(
            Error::UnsupportedCameraModel(CameraModel::FTheta).is_configuration()
        );
        assert!(!Error::InvalidWindow(4, 2).is_configuration());
    }
}
