use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeatingError {
    #[error("invalid zone name `{0}`")]
    InvalidName(String),
    #[error("setpoint {value:.1} for `{zone}` exceeds maximum {max:.1}")]
    SetpointOutOfRange { zone: String, value: f32, max: f32 },
    #[error("relay {relay} for `{zone}` cannot be stored, relays run 0-127")]
    RelayOutOfRange { zone: String, relay: u8 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("datagram length {actual}, expected {expected}")]
    Length { expected: usize, actual: usize },
    #[error("unknown request type {0:#04x}")]
    UnknownRequest(u8),
    #[error("datagram failed to decrypt")]
    Decrypt,
    #[error("datagram secret mismatch")]
    SecretMismatch,
    #[error("invalid key material: {0}")]
    KeyMaterial(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored value for `{0}` has the wrong type")]
    WrongType(String),
}

#[derive(Debug, Error)]
#[error("relay {relay}: {message}")]
pub struct RelayError {
    pub relay: u8,
    pub message: String,
}
