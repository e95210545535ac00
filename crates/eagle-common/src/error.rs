/// Error types shared across the Eagle Eye crates.
///
/// These cover failures that happen before any request is served, such as a
/// missing credential. Per-request failures live next to the code that raises
/// them (`upstream::UpstreamClientError`) and are wrapped by the relay.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("config error: {0}")]
    Config(String),
}
