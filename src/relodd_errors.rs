use camino::Utf8PathBuf;
use thiserror::Error;

pub type ReloddResult<T> = Result<T, ReloddError>;

#[derive(Error, Debug)]
pub enum ReloddError {
    #[error("Unable to create working directory: {0}")]
    UnableToCreateWorkDir(Utf8PathBuf),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed catalog: {0}")]
    MalformedCatalog(String),

    #[error("Cannot find event id {0} in the catalog")]
    EventNotFound(u32),

    #[error("Required file doesn't exist: {0}")]
    MissingFile(Utf8PathBuf),

    #[error("Invalid filter descriptor: {0}")]
    InvalidFilterDescriptor(String),

    #[error("Unknown channel suffix '{0}', cannot select projection")]
    UnknownChannelSuffix(char),

    #[error("No data after the projection for {0}")]
    EmptyProjection(String),

    #[error("Data records could not be merged into a single trace ({0})")]
    TraceMergeFailed(String),

    #[error("Incomplete trace, not enough data ({0})")]
    IncompleteTrace(String),

    #[error("Data could not be loaded ({0})")]
    WaveformUnavailable(String),

    #[error("Trace too long for a cache record ({0} data bytes)")]
    RecordTooLong(usize),

    #[error("Corrupted cache record: {0}")]
    CorruptedRecord(String),

    #[error("Invalid time string: {0}")]
    InvalidTime(String),

    #[error("Skipping event {0}, insufficient number of neighbors ({1})")]
    InsufficientNeighbors(String, usize),

    #[error("Failed origin relocation with and without cross-correlation")]
    RelocationFailed,
}
