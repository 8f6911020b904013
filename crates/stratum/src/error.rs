use super::*;

pub type Result<T, E = InternalError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum InternalError {
    #[snafu(display("{reason}"))]
    InvalidValue { reason: String },

    #[snafu(display("{message}"))]
    Parse { message: String },

    #[snafu(display("invalid hex integer '{input}': {source}"))]
    ParseHexInt {
        input: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("invalid hex: {source}"))]
    Hex { source: hex::FromHexError },

    #[snafu(display("username is missing an address"))]
    EmptyUsername,

    #[snafu(display("invalid address: {source}"))]
    InvalidAddress {
        source: bitcoin::address::ParseError,
    },

    #[snafu(display("address {address} is not valid on {expected:?}"))]
    NetworkMismatch { expected: Network, address: String },

    #[snafu(display("could not infer network from address"))]
    UnknownNetwork,
}

impl From<hex::FromHexError> for InternalError {
    fn from(source: hex::FromHexError) -> Self {
        InternalError::Hex { source }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub error_code: i32,
    pub message: String,
    pub traceback: Option<Value>,
}

impl Serialize for JsonRpcError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (&self.error_code, &self.message, &self.traceback).serialize(serializer)
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.traceback {
            Some(traceback) => write!(
                f,
                "Stratum error {}: {} (traceback: {})",
                self.error_code,
                self.message,
                serde_json::to_string(traceback).unwrap_or_else(|_| "<invalid traceback>".into())
            ),
            None => write!(f, "Stratum error {}: {}", self.error_code, self.message),
        }
    }
}
