use std::fmt;

/// A captured infrared waveform.
///
/// The bridge never interprets the bytes; they go to disk as lowercase hex and
/// come back to the device unchanged.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Signal(Vec<u8>);

impl Signal {
    pub fn new(bytes: Vec<u8>) -> Self {
        Signal(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parses the on-disk representation. Leading and trailing whitespace is
    /// ignored so hand-edited files with a final newline still load.
    pub fn from_hex(text: impl AsRef<[u8]>) -> Result<Self, hex::FromHexError> {
        hex::decode(text.as_ref().trim_ascii()).map(Signal)
    }
}

impl From<Vec<u8>> for Signal {
    fn from(bytes: Vec<u8>) -> Self {
        Signal(bytes)
    }
}

impl From<&[u8]> for Signal {
    fn from(bytes: &[u8]) -> Self {
        Signal(bytes.to_vec())
    }
}

// Signals can be several kilobytes; only show a short prefix in logs.
impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.0.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        if self.0.len() > 8 {
            write!(f, "Signal({} bytes, {}..)", self.0.len(), preview)
        } else {
            write!(f, "Signal({})", preview)
        }
    }
}
