use std::sync::Arc;

/// A packet reassembled from one or more page segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Arc<[u8]>,
    /// Granule position of the page on which this packet completed, set
    /// only on the last packet completed on that page.
    pub granule: Option<i64>,
    /// First packet of its logical stream.
    pub bos: bool,
    /// Last packet of its logical stream.
    pub eos: bool,
    /// Running count of packets assembled on the stream since its last
    /// reset.
    pub packet_no: u64,
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Packet {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            granule: None,
            bos: false,
            eos: false,
            packet_no: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
