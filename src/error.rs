use thiserror::Error;

#[derive(Debug, Error)]
pub enum RnnDbnError {
    /// Sizes that don't fit together: pitch range vs. sequence width, zero-sized layers, k = 0
    /// and the like. Detected before any parameter is touched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A cost, monitor or gradient came out as NaN or infinite. Nothing has been written to the
    /// parameters when this is returned.
    #[error("numeric instability: {what} is {value}")]
    NumericInstability { what: String, value: f64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MIDI error: {0}")]
    Midi(String),
}

pub type Result<T> = std::result::Result<T, RnnDbnError>;

pub(crate) fn configuration_error<T, S: Into<String>>(msg: S) -> Result<T> {
    Err(RnnDbnError::Configuration(msg.into()))
}

/// Returns an error if `value` is not finite.
pub(crate) fn check_finite(what: &str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RnnDbnError::NumericInstability {
            what: what.to_string(),
            value,
        })
    }
}
