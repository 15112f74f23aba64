use std::{error::Error, fmt};

/// The data being deserialized did not match what the reader expected, or the
/// buffer ran out of bits. Since this is triggered by remote input, callers
/// must treat it as untrusted-data rejection, never as a bug.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerdeErr;

impl fmt::Display for SerdeErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "serialization error")
    }
}

impl Error for SerdeErr {}
