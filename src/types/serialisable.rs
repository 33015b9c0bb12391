use crate::error::Result;

/// Types implementing FwpSerialisable can be sent to the server as one
/// CRLF-terminated command line.
pub trait FwpSerialisable {
    /// Converts the value in question to its wire form, CRLF included.
    fn serialise_fwp(&self) -> Result<Vec<u8>>;
}
