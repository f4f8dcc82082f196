use crate::error::BrokerError;

/// Opaque, totally-ordered position within one stream.
///
/// On the wire this is a string shaped like a Redis stream ID
/// (`"<seq>-0"`, with `"0-0"` meaning "the beginning"); internally it is
/// backed by a plain monotonic `bigserial` sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamCursor(pub i64);

impl StreamCursor {
    pub const BEGINNING: StreamCursor = StreamCursor(0);

    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        let seq = raw
            .split('-')
            .next()
            .ok_or_else(|| BrokerError::invalid_input("malformed cursor"))?;
        seq.parse::<i64>()
            .map(StreamCursor)
            .map_err(|_| BrokerError::invalid_input("malformed cursor"))
    }

    pub fn to_wire(self) -> String {
        format!("{}-0", self.0)
    }
}

impl From<i64> for StreamCursor {
    fn from(seq: i64) -> Self {
        Self(seq)
    }
}
