use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline file parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}
